//! In-memory persistence backend.
//!
//! Keeps a players table and a game history table. Suitable for a single
//! process; everything is lost on restart.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;
use tracing::debug;

use super::{GameRecord, GameStatus, PersistenceError, PersistenceGateway, PlayerRecord};

/// In-memory [`PersistenceGateway`].
#[derive(Debug, Default)]
pub struct MemoryStore {
    players: RwLock<BTreeMap<String, PlayerRecord>>,
    games: RwLock<BTreeMap<String, GameRecord>>,
}

impl MemoryStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a registered player.
    pub async fn player(&self, player_id: &str) -> Option<PlayerRecord> {
        self.players.read().await.get(player_id).cloned()
    }

    /// Look up a game.
    pub async fn game(&self, game_id: &str) -> Option<GameRecord> {
        self.games.read().await.get(game_id).cloned()
    }
}

#[async_trait]
impl PersistenceGateway for MemoryStore {
    async fn store_player(&self, player_id: &str, name: &str) -> Result<(), PersistenceError> {
        debug!("Creating player {} {}", player_id, name);
        let mut players = self.players.write().await;
        players
            .entry(player_id.to_string())
            .and_modify(|record| record.name = name.to_string())
            .or_insert_with(|| PlayerRecord {
                player_id: player_id.to_string(),
                name: name.to_string(),
                joined_at: Utc::now(),
            });
        Ok(())
    }

    async fn store_game_history(
        &self,
        game_id: &str,
        players: &str,
        status: GameStatus,
    ) -> Result<(), PersistenceError> {
        let mut games = self.games.write().await;
        games.insert(
            game_id.to_string(),
            GameRecord {
                game_id: game_id.to_string(),
                players: players.to_string(),
                start_time: Utc::now(),
                end_time: None,
                result: status,
            },
        );
        Ok(())
    }

    async fn update_game_result(
        &self,
        game_id: &str,
        status: GameStatus,
    ) -> Result<(), PersistenceError> {
        let mut games = self.games.write().await;
        let record = games
            .get_mut(game_id)
            .ok_or_else(|| PersistenceError::UnknownGame(game_id.to_string()))?;
        record.end_time = Some(Utc::now());
        record.result = status;
        Ok(())
    }

    /// Games whose player list names the player, either by id or by the
    /// name it was registered under.
    async fn get_player_games(&self, player_id: &str) -> Result<Vec<GameRecord>, PersistenceError> {
        let registered_name = self.player(player_id).await.map(|record| record.name);
        let games = self.games.read().await;

        Ok(games
            .values()
            .filter(|game| {
                game.players
                    .split(',')
                    .any(|entry| entry == player_id || Some(entry) == registered_name.as_deref())
            })
            .cloned()
            .collect())
    }
}
