//! Matchmaking
//!
//! Newly connected players wait in a bounded FIFO [`PlayerQueue`]. The
//! [`Matchmaker`] polls it at a low, fixed rate and drafts full rosters in
//! arrival order, each handed to session creation on its own task.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info};

use crate::game::player::Player;
use crate::network::lifecycle::SessionManager;
use crate::network::session::{CloseLatch, SessionError, SessionId};

// =============================================================================
// QUEUE
// =============================================================================

/// Queue errors.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    /// The queue is at capacity. The rejected player is handed back so the
    /// caller can close its connection.
    #[error("Queue full ({capacity} players waiting)")]
    Full {
        /// Queue capacity.
        capacity: usize,
        /// The player that was not queued.
        player: Box<Player>,
    },
}

/// Bounded FIFO of players waiting for a match.
#[derive(Debug)]
pub struct PlayerQueue {
    entries: Mutex<VecDeque<Player>>,
    capacity: usize,
}

impl PlayerQueue {
    /// Empty queue holding at most `capacity` players.
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    /// Maximum number of waiting players.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Append a player. Returns the queue length after insertion.
    pub async fn enqueue(&self, player: Player) -> Result<usize, QueueError> {
        let mut entries = self.entries.lock().await;
        if entries.len() >= self.capacity {
            return Err(QueueError::Full {
                capacity: self.capacity,
                player: Box::new(player),
            });
        }
        entries.push_back(player);
        Ok(entries.len())
    }

    /// Number of waiting players.
    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    /// Whether nobody is waiting.
    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }

    /// Drop players whose connection has already gone away.
    pub async fn purge_disconnected(&self) -> usize {
        let mut entries = self.entries.lock().await;
        let before = entries.len();
        entries.retain(Player::is_connected);
        before - entries.len()
    }

    /// Take the `roster_size` longest-waiting players, or nobody if fewer
    /// are queued.
    pub async fn draft(&self, roster_size: usize) -> Option<Vec<Player>> {
        let mut entries = self.entries.lock().await;
        if roster_size == 0 || entries.len() < roster_size {
            return None;
        }
        Some(entries.drain(..roster_size).collect())
    }

    /// Empty the queue, returning everybody still waiting.
    pub async fn take_all(&self) -> Vec<Player> {
        self.entries.lock().await.drain(..).collect()
    }

    /// Draft as many full rosters as the queue holds.
    pub async fn draft_all(&self, roster_size: usize) -> Vec<Vec<Player>> {
        let mut rosters = Vec::new();
        while let Some(roster) = self.draft(roster_size).await {
            rosters.push(roster);
        }
        rosters
    }
}

// =============================================================================
// MATCHMAKER
// =============================================================================

/// Drafts queued players into sessions.
pub struct Matchmaker {
    queue: Arc<PlayerQueue>,
    sessions: Arc<SessionManager>,
    poll_interval: Duration,
}

impl Matchmaker {
    /// Create a matchmaker over a queue and a session manager.
    pub fn new(
        queue: Arc<PlayerQueue>,
        sessions: Arc<SessionManager>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            queue,
            sessions,
            poll_interval,
        }
    }

    /// One matchmaking pass. Each drafted roster is started on its own
    /// task; the handles are returned for callers that want to wait.
    pub async fn poll_once(&self) -> Vec<JoinHandle<Result<SessionId, SessionError>>> {
        let purged = self.queue.purge_disconnected().await;
        if purged > 0 {
            debug!("Removed {} disconnected players from the queue", purged);
        }

        let rosters = self.queue.draft_all(self.sessions.roster_size()).await;
        rosters
            .into_iter()
            .map(|roster| {
                let sessions = self.sessions.clone();
                tokio::spawn(async move {
                    let result = sessions.start_match(roster).await;
                    if let Err(e) = &result {
                        error!("Failed to start game: {}", e);
                    }
                    result
                })
            })
            .collect()
    }

    /// Poll until `shutdown` fires, then wait for the matches still being
    /// started so none of them outlives the matchmaker.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!("Matchmaker polling every {:?}", self.poll_interval);
        let mut starting = Vec::new();

        loop {
            tokio::select! {
                biased;
                _ = CloseLatch::fired(&mut shutdown) => break,
                _ = ticker.tick() => {
                    starting.retain(|handle: &JoinHandle<_>| !handle.is_finished());
                    starting.extend(self.poll_once().await);
                }
            }
        }

        // start_match logs its own failures.
        for handle in starting {
            if let Err(e) = handle.await {
                error!("Match start ended abnormally: {}", e);
            }
        }
        debug!("Matchmaker stopped");
    }
}
