//! Player Handles
//!
//! A connected player: identity, last-activity clock and the outbound
//! channel to its connection writer. A [`Player`] owns its channel; whoever
//! holds the `Player` is the only component allowed to close it.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio::sync::{mpsc, RwLock};
use tokio::time::Instant;

use crate::network::protocol::{Outbound, ServerMessage};

// =============================================================================
// PLAYER ID
// =============================================================================

/// Opaque player identifier, supplied by the client on connect.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PlayerId(pub String);

impl PlayerId {
    /// Wrap a raw identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the raw identifier.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PlayerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// =============================================================================
// ACTIVITY CLOCK
// =============================================================================

/// Last time anything was read from a player's connection.
///
/// Shared between the connection reader (which touches it) and the
/// session's inactivity monitor (which reads it). A clock seeded from a
/// client timestamp carries the reported age as an offset until the first
/// touch, since that age may predate anything an [`Instant`] can express.
#[derive(Clone, Debug)]
pub struct ActivityClock {
    last: Arc<RwLock<LastSeen>>,
}

#[derive(Clone, Copy, Debug)]
struct LastSeen {
    at: Instant,
    backdated: Duration,
}

impl ActivityClock {
    /// Clock starting at `at`.
    pub fn new(at: Instant) -> Self {
        Self::backdated(at, Duration::ZERO)
    }

    fn backdated(at: Instant, backdated: Duration) -> Self {
        Self {
            last: Arc::new(RwLock::new(LastSeen { at, backdated })),
        }
    }

    /// Clock starting now.
    pub fn starting_now() -> Self {
        Self::new(Instant::now())
    }

    /// Clock seeded from a client-reported wall-clock timestamp.
    /// Timestamps in the future count as now.
    pub fn since(last_seen: DateTime<Utc>) -> Self {
        let age = (Utc::now() - last_seen).to_std().unwrap_or_default();
        Self::backdated(Instant::now(), age)
    }

    /// Record activity.
    pub async fn touch(&self) {
        *self.last.write().await = LastSeen {
            at: Instant::now(),
            backdated: Duration::ZERO,
        };
    }

    /// How long the player has been idle as of `now`.
    pub async fn idle_for(&self, now: Instant) -> Duration {
        let last = *self.last.read().await;
        now.saturating_duration_since(last.at).saturating_add(last.backdated)
    }
}

// =============================================================================
// PLAYER
// =============================================================================

/// Errors delivering to a player's connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SendError {
    /// The connection writer is gone.
    #[error("connection closed")]
    Closed,

    /// The outbound buffer stayed full for the whole send timeout.
    #[error("send timed out")]
    TimedOut,
}

impl<T> From<SendTimeoutError<T>> for SendError {
    fn from(err: SendTimeoutError<T>) -> Self {
        match err {
            SendTimeoutError::Timeout(_) => SendError::TimedOut,
            SendTimeoutError::Closed(_) => SendError::Closed,
        }
    }
}

/// A connected player.
#[derive(Debug)]
pub struct Player {
    /// Player identifier.
    pub id: PlayerId,
    /// Display name.
    pub name: String,
    /// Activity clock shared with the connection reader.
    activity: ActivityClock,
    /// Channel to the connection writer.
    outbound: mpsc::Sender<Outbound>,
}

impl Player {
    /// Create a player around an existing outbound channel.
    pub fn new(
        id: PlayerId,
        name: impl Into<String>,
        activity: ActivityClock,
        outbound: mpsc::Sender<Outbound>,
    ) -> Self {
        Self {
            id,
            name: name.into(),
            activity,
            outbound,
        }
    }

    /// The player's activity clock.
    pub fn activity(&self) -> &ActivityClock {
        &self.activity
    }

    /// Whether the connection writer is still running.
    pub fn is_connected(&self) -> bool {
        !self.outbound.is_closed()
    }

    /// A sending handle for use outside the owner's lock.
    pub fn link(&self) -> PlayerLink {
        PlayerLink {
            id: self.id.clone(),
            outbound: self.outbound.clone(),
        }
    }

    /// Queue a message, waiting at most `timeout` for buffer space.
    pub async fn send(&self, message: ServerMessage, timeout: Duration) -> Result<(), SendError> {
        self.outbound
            .send_timeout(Outbound::Message(message), timeout)
            .await
            .map_err(SendError::from)
    }

    /// Send a close frame with `reason` and release the connection.
    pub async fn close(self, reason: &str, timeout: Duration) {
        let frame = Outbound::Close {
            reason: reason.to_string(),
        };
        if let Err(err) = self.outbound.send_timeout(frame, timeout).await {
            tracing::debug!("Close notice to {} not delivered: {}", self.id, SendError::from(err));
        }
    }
}

/// Cloneable sending half of a [`Player`], used for broadcasts.
///
/// Holding a link does not grant ownership; eviction and close always go
/// through the owning [`Player`].
#[derive(Debug, Clone)]
pub struct PlayerLink {
    /// Player identifier.
    pub id: PlayerId,
    outbound: mpsc::Sender<Outbound>,
}

impl PlayerLink {
    /// Queue a message, waiting at most `timeout` for buffer space.
    pub async fn send(&self, message: ServerMessage, timeout: Duration) -> Result<(), SendError> {
        self.outbound
            .send_timeout(Outbound::Message(message), timeout)
            .await
            .map_err(SendError::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::protocol::ServerMessage;
    use crate::network::session::SessionId;

    fn hello() -> ServerMessage {
        ServerMessage::match_started(&SessionId::new("g1"))
    }

    #[tokio::test(start_paused = true)]
    async fn test_activity_clock_tracks_idle_time() {
        let clock = ActivityClock::starting_now();
        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(clock.idle_for(Instant::now()).await, Duration::from_secs(5));

        clock.touch().await;
        assert_eq!(clock.idle_for(Instant::now()).await, Duration::ZERO);
    }

    #[tokio::test]
    async fn test_activity_clock_since_past_timestamp() {
        let clock = ActivityClock::since(Utc::now() - chrono::Duration::seconds(40));
        let idle = clock.idle_for(Instant::now()).await;
        assert!(idle >= Duration::from_secs(39));
    }

    #[tokio::test]
    async fn test_activity_clock_since_ancient_timestamp() {
        let clock = ActivityClock::since(Utc::now() - chrono::Duration::days(3650));
        let idle = clock.idle_for(Instant::now()).await;
        assert!(idle >= Duration::from_secs(3649 * 24 * 3600));

        clock.touch().await;
        assert!(clock.idle_for(Instant::now()).await < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_activity_clock_since_future_timestamp() {
        let clock = ActivityClock::since(Utc::now() + chrono::Duration::seconds(3600));
        let idle = clock.idle_for(Instant::now()).await;
        assert!(idle < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_send_to_dropped_connection() {
        let (tx, rx) = mpsc::channel(4);
        let player = Player::new(PlayerId::new("p1"), "Ann", ActivityClock::starting_now(), tx);
        assert!(player.is_connected());

        drop(rx);
        assert!(!player.is_connected());
        let result = player.send(hello(), Duration::from_millis(10)).await;
        assert_eq!(result, Err(SendError::Closed));
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_times_out_on_full_buffer() {
        let (tx, _rx) = mpsc::channel(1);
        let player = Player::new(PlayerId::new("p1"), "Ann", ActivityClock::starting_now(), tx);

        player.send(hello(), Duration::from_millis(10)).await.unwrap();
        let result = player.send(hello(), Duration::from_millis(10)).await;
        assert_eq!(result, Err(SendError::TimedOut));
    }

    #[tokio::test]
    async fn test_close_sends_reason() {
        let (tx, mut rx) = mpsc::channel(4);
        let player = Player::new(PlayerId::new("p1"), "Ann", ActivityClock::starting_now(), tx);

        player.close("Game over", Duration::from_millis(10)).await;

        match rx.recv().await {
            Some(Outbound::Close { reason }) => assert_eq!(reason, "Game over"),
            other => panic!("expected close, got {:?}", other),
        }
        // Sender dropped with the player.
        assert!(rx.recv().await.is_none());
    }
}
