//! Persistence Gateway
//!
//! The session layer only emits events into durable history; it never reads
//! it back and never retries. Backends implement [`PersistenceGateway`].

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod memory;

pub use memory::MemoryStore;

/// Recorded status of a game.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum GameStatus {
    /// Session running.
    InProgress,
    /// Closed by request or by reaching its time limit.
    Finished,
    /// Closed because every player left.
    Abandoned,
}

impl GameStatus {
    /// Stored string form.
    pub fn as_str(&self) -> &'static str {
        match self {
            GameStatus::InProgress => "in-progress",
            GameStatus::Finished => "finished",
            GameStatus::Abandoned => "abandoned",
        }
    }
}

impl fmt::Display for GameStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One row of game history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GameRecord {
    /// Session identifier.
    pub game_id: String,
    /// Comma-separated player names, in roster order.
    pub players: String,
    /// When the session started.
    pub start_time: DateTime<Utc>,
    /// When the session ended, if it has.
    pub end_time: Option<DateTime<Utc>>,
    /// Latest status.
    pub result: GameStatus,
}

/// A registered player.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerRecord {
    /// Player identifier.
    pub player_id: String,
    /// Display name.
    pub name: String,
    /// First registration time.
    pub joined_at: DateTime<Utc>,
}

/// Persistence errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PersistenceError {
    /// Finalizing a game that was never stored.
    #[error("unknown game: {0}")]
    UnknownGame(String),

    /// Backend failure.
    #[error("backend error: {0}")]
    Backend(String),
}

/// Durable history consumed by the session layer.
#[async_trait]
pub trait PersistenceGateway: Send + Sync {
    /// Register (or rename) a player.
    async fn store_player(&self, player_id: &str, name: &str) -> Result<(), PersistenceError>;

    /// Record a game start.
    async fn store_game_history(
        &self,
        game_id: &str,
        players: &str,
        status: GameStatus,
    ) -> Result<(), PersistenceError>;

    /// Record a game's end time and final status.
    async fn update_game_result(
        &self,
        game_id: &str,
        status: GameStatus,
    ) -> Result<(), PersistenceError>;

    /// Every game the player took part in.
    async fn get_player_games(&self, player_id: &str) -> Result<Vec<GameRecord>, PersistenceError>;
}
