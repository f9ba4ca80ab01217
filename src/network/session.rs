//! Match Session Management
//!
//! A session owns a fixed roster of players for its whole lifetime, the
//! latest broadcast state, the handles of its two loops and the close latch
//! that stops them. Roster membership is guarded by its own lock, held only
//! while players are attached or detached and never across a send.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

use crate::game::player::{Player, PlayerId, PlayerLink};
use crate::network::protocol::ServerMessage;

/// Unique session identifier.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    /// Wrap an existing identifier (e.g. from an admin request).
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Fresh random identifier.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Borrow the raw identifier.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Registered, loops not started yet.
    Created,
    /// Tick and inactivity loops running.
    Running,
    /// Torn down.
    Closed,
}

/// What to do once every roster member has gone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AbandonPolicy {
    /// Close the session with an `abandoned` outcome.
    #[default]
    CloseSession,
    /// Keep ticking until an explicit close.
    KeepRunning,
}

impl std::str::FromStr for AbandonPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "close" | "close_session" => Ok(AbandonPolicy::CloseSession),
            "keep" | "keep_running" => Ok(AbandonPolicy::KeepRunning),
            other => Err(format!("unknown abandon policy: {other}")),
        }
    }
}

/// Configuration for a match session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Broadcast rate (Hz).
    pub tick_rate: u32,
    /// Idle time after which a player is evicted.
    pub inactivity_timeout: Duration,
    /// How often the inactivity monitor wakes.
    pub inactivity_check_interval: Duration,
    /// Upper bound for queueing one message to one player.
    pub send_timeout: Duration,
    /// Close the session with a `finished` outcome after this long.
    pub max_duration: Option<Duration>,
    /// Behaviour when every player has gone.
    pub abandon_policy: AbandonPolicy,
}

/// Highest accepted tick rate in Hz.
pub const MAX_TICK_RATE: u32 = 1000;

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            tick_rate: crate::TICK_RATE,
            inactivity_timeout: Duration::from_secs(30),
            inactivity_check_interval: Duration::from_secs(10),
            send_timeout: Duration::from_secs(1),
            max_duration: None,
            abandon_policy: AbandonPolicy::CloseSession,
        }
    }
}

impl SessionConfig {
    /// Time between two ticks.
    pub fn tick_interval(&self) -> Duration {
        let micros = 1_000_000 / u64::from(self.tick_rate.max(1));
        Duration::from_micros(micros.max(1))
    }
}

// =============================================================================
// CLOSE LATCH
// =============================================================================

/// Single-fire termination signal shared by a session's loops.
#[derive(Debug)]
pub struct CloseLatch {
    tx: watch::Sender<bool>,
}

impl CloseLatch {
    /// Unfired latch.
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx }
    }

    /// Fire the latch. Returns `true` only for the call that fired it.
    pub fn fire(&self) -> bool {
        self.tx.send_if_modified(|fired| {
            if *fired {
                false
            } else {
                *fired = true;
                true
            }
        })
    }

    /// Whether the latch has fired.
    pub fn is_fired(&self) -> bool {
        *self.tx.borrow()
    }

    /// Receiver to wait on with [`CloseLatch::fired`].
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }

    /// Resolves once the latch has fired (immediately if it already has).
    pub async fn fired(rx: &mut watch::Receiver<bool>) {
        // An error means the latch itself is gone, which only happens at
        // teardown; treat it as fired.
        let _ = rx.wait_for(|fired| *fired).await;
    }
}

impl Default for CloseLatch {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// MATCH SESSION
// =============================================================================

/// One roster position. The player is taken out on eviction; the identity
/// stays so the roster keeps its order and size.
#[derive(Debug)]
struct RosterSlot {
    id: PlayerId,
    name: String,
    player: Option<Player>,
}

/// Outcome of one broadcast.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BroadcastReport {
    /// Players the message was queued for.
    pub delivered: usize,
    /// Players evicted because the send failed.
    pub evicted: Vec<PlayerId>,
}

/// A match session.
pub struct MatchSession {
    /// Unique session identifier.
    pub id: SessionId,
    /// Session configuration.
    config: SessionConfig,
    /// Fixed roster, in draft order.
    roster: RwLock<Vec<RosterSlot>>,
    /// Lifecycle state.
    state: RwLock<SessionState>,
    /// Most recent broadcast state.
    latest_state: RwLock<Option<Value>>,
    /// Stops both loops.
    latch: CloseLatch,
    /// Tick and inactivity loop handles.
    loops: Mutex<Vec<JoinHandle<()>>>,
    /// Pending "in-progress" history write.
    history: Mutex<Option<JoinHandle<()>>>,
    /// Wall-clock creation time.
    created_at: DateTime<Utc>,
    /// Monotonic creation time.
    started: Instant,
}

impl MatchSession {
    /// Create a new session around a drafted roster.
    pub fn new(id: SessionId, players: Vec<Player>, config: SessionConfig) -> Self {
        let roster = players
            .into_iter()
            .map(|player| RosterSlot {
                id: player.id.clone(),
                name: player.name.clone(),
                player: Some(player),
            })
            .collect();

        Self {
            id,
            config,
            roster: RwLock::new(roster),
            state: RwLock::new(SessionState::Created),
            latest_state: RwLock::new(None),
            latch: CloseLatch::new(),
            loops: Mutex::new(Vec::new()),
            history: Mutex::new(None),
            created_at: Utc::now(),
            started: Instant::now(),
        }
    }

    /// Session configuration.
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// The close latch.
    pub fn latch(&self) -> &CloseLatch {
        &self.latch
    }

    /// Wall-clock creation time.
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Time since creation.
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Get session state.
    pub async fn state(&self) -> SessionState {
        *self.state.read().await
    }

    /// Roster ids in draft order, including evicted players.
    pub async fn roster_ids(&self) -> Vec<PlayerId> {
        self.roster.read().await.iter().map(|slot| slot.id.clone()).collect()
    }

    /// Roster display names in draft order.
    pub async fn player_names(&self) -> Vec<String> {
        self.roster.read().await.iter().map(|slot| slot.name.clone()).collect()
    }

    /// Number of players still attached.
    pub async fn connected_count(&self) -> usize {
        self.roster
            .read()
            .await
            .iter()
            .filter(|slot| slot.player.is_some())
            .count()
    }

    /// Whether `player_id` is still attached.
    pub async fn is_attached(&self, player_id: &PlayerId) -> bool {
        self.roster
            .read()
            .await
            .iter()
            .any(|slot| &slot.id == player_id && slot.player.is_some())
    }

    /// Most recent broadcast state.
    pub async fn latest_state(&self) -> Option<Value> {
        self.latest_state.read().await.clone()
    }

    /// Remember the state about to be broadcast.
    pub async fn record_state(&self, state: Value) {
        *self.latest_state.write().await = Some(state);
    }

    /// Send links for every attached player, keyed by roster slot.
    async fn links(&self) -> Vec<(usize, PlayerLink)> {
        self.roster
            .read()
            .await
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| slot.player.as_ref().map(|p| (index, p.link())))
            .collect()
    }

    /// Take the player out of one roster slot. Slots are never refilled, so
    /// an index stays valid for the life of the session.
    async fn detach_at(&self, index: usize) -> Option<Player> {
        self.roster
            .write()
            .await
            .get_mut(index)
            .and_then(|slot| slot.player.take())
    }

    /// Take the first attached player with this id out of the roster.
    /// Returns `None` if no such player is attached.
    pub async fn detach(&self, player_id: &PlayerId) -> Option<Player> {
        let mut roster = self.roster.write().await;
        roster
            .iter_mut()
            .find(|slot| &slot.id == player_id && slot.player.is_some())
            .and_then(|slot| slot.player.take())
    }

    /// Detach a player and close its connection with `reason`.
    /// Returns `false` if the player was already gone.
    pub async fn evict(&self, player_id: &PlayerId, reason: &str) -> bool {
        let player = self.detach(player_id).await;
        self.close_detached(player, reason).await
    }

    async fn close_detached(&self, player: Option<Player>, reason: &str) -> bool {
        match player {
            Some(player) => {
                player.close(reason, self.config.send_timeout).await;
                true
            }
            None => false,
        }
    }

    /// Detach every player idle for strictly longer than the configured
    /// threshold as of `now`.
    pub async fn detach_inactive(&self, now: Instant) -> Vec<Player> {
        let threshold = self.config.inactivity_timeout;
        let mut roster = self.roster.write().await;
        let mut inactive = Vec::new();

        for slot in roster.iter_mut() {
            let idle = match &slot.player {
                Some(player) => player.activity().idle_for(now).await,
                None => continue,
            };
            if idle > threshold {
                if let Some(player) = slot.player.take() {
                    inactive.push(player);
                }
            }
        }

        inactive
    }

    /// Detach every remaining player and close their connections.
    /// Returns how many were closed; a second call closes none.
    pub async fn close_remaining(&self, reason: &str) -> usize {
        let remaining: Vec<Player> = {
            let mut roster = self.roster.write().await;
            roster.iter_mut().filter_map(|slot| slot.player.take()).collect()
        };

        let count = remaining.len();
        let timeout = self.config.send_timeout;
        join_all(remaining.into_iter().map(|player| player.close(reason, timeout))).await;
        count
    }

    /// Broadcast a message to all attached players.
    ///
    /// Sends run concurrently, each bounded by the send timeout. A failed
    /// send evicts only that connection, even if another slot shares its id.
    pub async fn broadcast(&self, message: ServerMessage, evict_reason: &str) -> BroadcastReport {
        let links = self.links().await;
        let timeout = self.config.send_timeout;

        let results = join_all(links.iter().map(|(_, link)| {
            let message = message.clone();
            async move { link.send(message, timeout).await }
        }))
        .await;

        let mut report = BroadcastReport::default();
        for ((index, link), result) in links.iter().zip(results) {
            match result {
                Ok(()) => report.delivered += 1,
                Err(err) => {
                    debug!("Send to {} in game {} failed: {}", link.id, self.id, err);
                    let player = self.detach_at(*index).await;
                    if self.close_detached(player, evict_reason).await {
                        report.evicted.push(link.id.clone());
                    }
                }
            }
        }
        report
    }

    /// Start the session loops unless the latch has already fired.
    ///
    /// `spawn` runs under the loop-handle lock, so a concurrent close either
    /// sees the handles and joins them, or the loops are never started.
    pub async fn start_loops<F>(&self, spawn: F) -> bool
    where
        F: FnOnce() -> Vec<JoinHandle<()>>,
    {
        let mut loops = self.loops.lock().await;
        if self.latch.is_fired() {
            return false;
        }
        loops.extend(spawn());
        *self.state.write().await = SessionState::Running;
        true
    }

    /// Take the loop handles for joining.
    pub async fn take_loops(&self) -> Vec<JoinHandle<()>> {
        std::mem::take(&mut *self.loops.lock().await)
    }

    /// Remember the pending history write.
    pub async fn set_history_task(&self, task: JoinHandle<()>) {
        *self.history.lock().await = Some(task);
    }

    /// Take the pending history write.
    pub async fn take_history_task(&self) -> Option<JoinHandle<()>> {
        self.history.lock().await.take()
    }

    /// Mark the session closed.
    pub async fn mark_closed(&self) {
        *self.state.write().await = SessionState::Closed;
    }
}

impl fmt::Debug for MatchSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MatchSession")
            .field("id", &self.id)
            .field("created_at", &self.created_at)
            .field("closing", &self.latch.is_fired())
            .finish()
    }
}

/// Session errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    /// No active session with this id.
    #[error("Game not found: {0}")]
    NotFound(SessionId),

    /// Roster does not have the required size.
    #[error("Roster must have {expected} players, got {actual}")]
    RosterSize {
        /// Required size.
        expected: usize,
        /// Supplied size.
        actual: usize,
    },
}
