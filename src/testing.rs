//! Shared fixtures for unit tests.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};

use crate::game::player::{ActivityClock, Player, PlayerId};
use crate::network::protocol::Outbound;
use crate::network::session::{AbandonPolicy, SessionConfig};
use crate::persistence::{GameRecord, GameStatus, PersistenceError, PersistenceGateway};

/// Player `p{n}` named `Player {n}` with a roomy outbound buffer.
pub fn test_player(n: usize) -> (Player, mpsc::Receiver<Outbound>) {
    let (tx, rx) = mpsc::channel(1024);
    let player = Player::new(
        PlayerId::new(format!("p{n}")),
        format!("Player {n}"),
        ActivityClock::starting_now(),
        tx,
    );
    (player, rx)
}

/// `size` players `p0..p{size-1}`.
pub fn test_roster(size: usize) -> (Vec<Player>, Vec<mpsc::Receiver<Outbound>>) {
    (0..size).map(test_player).unzip()
}

/// Slow ticks, short send timeout, sessions kept alive when empty.
pub fn test_session_config() -> SessionConfig {
    SessionConfig {
        tick_rate: 10,
        send_timeout: Duration::from_millis(50),
        abandon_policy: AbandonPolicy::KeepRunning,
        ..SessionConfig::default()
    }
}

/// Everything currently buffered for a player.
pub fn drain(rx: &mut mpsc::Receiver<Outbound>) -> Vec<Outbound> {
    let mut out = Vec::new();
    while let Ok(message) = rx.try_recv() {
        out.push(message);
    }
    out
}

/// A persistence call seen by [`RecordingGateway`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    StorePlayer(String, String),
    StoreHistory(String, String, GameStatus),
    UpdateResult(String, GameStatus),
    PlayerGames(String),
}

/// Gateway that records calls and can be told to fail finalization.
#[derive(Debug, Default)]
pub struct RecordingGateway {
    calls: Mutex<Vec<Call>>,
    fail_updates: bool,
}

impl RecordingGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_updates() -> Self {
        Self {
            fail_updates: true,
            ..Self::default()
        }
    }

    pub async fn calls(&self) -> Vec<Call> {
        self.calls.lock().await.clone()
    }
}

#[async_trait]
impl PersistenceGateway for RecordingGateway {
    async fn store_player(&self, player_id: &str, name: &str) -> Result<(), PersistenceError> {
        self.calls
            .lock()
            .await
            .push(Call::StorePlayer(player_id.to_string(), name.to_string()));
        Ok(())
    }

    async fn store_game_history(
        &self,
        game_id: &str,
        players: &str,
        status: GameStatus,
    ) -> Result<(), PersistenceError> {
        self.calls.lock().await.push(Call::StoreHistory(
            game_id.to_string(),
            players.to_string(),
            status,
        ));
        Ok(())
    }

    async fn update_game_result(
        &self,
        game_id: &str,
        status: GameStatus,
    ) -> Result<(), PersistenceError> {
        self.calls
            .lock()
            .await
            .push(Call::UpdateResult(game_id.to_string(), status));
        if self.fail_updates {
            return Err(PersistenceError::Backend("database is locked".to_string()));
        }
        Ok(())
    }

    async fn get_player_games(&self, player_id: &str) -> Result<Vec<GameRecord>, PersistenceError> {
        self.calls
            .lock()
            .await
            .push(Call::PlayerGames(player_id.to_string()));
        Ok(Vec::new())
    }
}
