//! Protocol Messages
//!
//! Wire format for client-server communication over WebSocket.
//! All messages are JSON text frames; session close is signalled with a
//! WebSocket close frame carrying a reason string.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::network::session::SessionId;

/// Message sent with every "match started" notification.
pub const MATCH_STARTED_MESSAGE: &str = "Game has started";

/// Message sent with every state update.
pub const STATE_UPDATE_MESSAGE: &str = "Game state update";

/// Admin close acknowledgement.
pub const GAME_CLOSED_MESSAGE: &str = "Game closed successfully";

/// Admin player registration acknowledgement.
pub const PLAYER_CREATED_MESSAGE: &str = "Player created successfully";

/// Close reason when a session ends.
pub const CLOSE_REASON_GAME_OVER: &str = "Game over";

/// Close reason for inactivity eviction.
pub const CLOSE_REASON_INACTIVE: &str = "Disconnected due to inactivity";

/// Close reason for a player dropped after a failed or stalled send.
pub const CLOSE_REASON_CONNECTION_LOST: &str = "Connection lost";

/// Close reason when the waiting queue is full.
pub const CLOSE_REASON_SERVER_FULL: &str = "Server full";

/// Close reason when the server stops.
pub const CLOSE_REASON_SHUTDOWN: &str = "Server shutting down";

// =============================================================================
// CLIENT -> SERVER MESSAGES
// =============================================================================

/// Messages sent from client to server.
///
/// Any inbound frame counts as activity; these are only the shapes the
/// server recognises.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Player input, opaque to the server.
    Input {
        /// Input payload.
        #[serde(default)]
        data: Value,
    },

    /// Keep-alive.
    Heartbeat,
}

// =============================================================================
// SERVER -> CLIENT MESSAGES
// =============================================================================

/// Messages sent from server to client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// The player has been drafted into a match.
    MatchStarted(MatchStartedInfo),

    /// Per-tick state broadcast.
    StateUpdate(StateUpdate),
}

/// Match start notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchStartedInfo {
    /// Session identifier.
    pub game_id: String,
    /// Human-readable message.
    pub message: String,
}

/// State broadcast for one tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateUpdate {
    /// Session identifier.
    pub game_id: String,
    /// Opaque state produced by the session's generator.
    pub state: Value,
    /// Tick number, starting at 1.
    pub tick: u64,
    /// Human-readable message.
    pub message: String,
}

impl ServerMessage {
    /// "Match started" for `game_id`.
    pub fn match_started(game_id: &SessionId) -> Self {
        ServerMessage::MatchStarted(MatchStartedInfo {
            game_id: game_id.to_string(),
            message: MATCH_STARTED_MESSAGE.to_string(),
        })
    }

    /// State update for `game_id` at `tick`.
    pub fn state_update(game_id: &SessionId, state: Value, tick: u64) -> Self {
        ServerMessage::StateUpdate(StateUpdate {
            game_id: game_id.to_string(),
            state,
            tick,
            message: STATE_UPDATE_MESSAGE.to_string(),
        })
    }
}

/// What the session layer hands to a connection writer.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    /// Encode and send as a text frame.
    Message(ServerMessage),

    /// Send a close frame with `reason`, then stop writing.
    Close {
        /// Close reason.
        reason: String,
    },
}

// =============================================================================
// ADMIN RESPONSES
// =============================================================================

/// Successful admin close.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloseResponse {
    /// Human-readable message.
    pub message: String,
    /// Closed session.
    pub game_id: String,
}

/// Successful player registration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerCreated {
    /// Human-readable message.
    pub message: String,
    /// Registered player.
    pub player_id: String,
}

// =============================================================================
// SERIALIZATION HELPERS
// =============================================================================

impl ClientMessage {
    /// Serialize to JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize from JSON string.
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }
}

impl ServerMessage {
    /// Serialize to JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize from JSON string.
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }
}
