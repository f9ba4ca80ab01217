//! Session Lifecycle
//!
//! Creation and teardown of match sessions.
//!
//! Creation order is fixed: request the "in-progress" history write,
//! register, announce the match, start the loops. Teardown runs at most once
//! per session: whoever removes the session from the registry owns the
//! teardown, everyone else gets [`SessionError::NotFound`].

use std::sync::Arc;

use tracing::{debug, error, info, instrument, warn};

use crate::game::player::Player;
use crate::game::state::StateGenerator;
use crate::network::protocol::{
    ServerMessage, CLOSE_REASON_CONNECTION_LOST, CLOSE_REASON_GAME_OVER,
};
use crate::network::registry::SessionRegistry;
use crate::network::runner::SessionRunner;
use crate::network::session::{MatchSession, SessionConfig, SessionError, SessionId};
use crate::persistence::{GameStatus, PersistenceGateway};

/// Result of a completed teardown.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseReport {
    /// Closed session.
    pub game_id: SessionId,
    /// Status recorded for the game.
    pub status: GameStatus,
    /// Connections closed by the teardown itself (the tick loop closes the
    /// rest when it stops).
    pub closed_connections: usize,
    /// Set when the history record could not be finalized.
    pub persistence_error: Option<String>,
}

/// Creates sessions and runs the close protocol.
pub struct SessionManager {
    /// Active sessions.
    registry: SessionRegistry,
    /// Game history.
    persistence: Arc<dyn PersistenceGateway>,
    /// Broadcast state source.
    generator: Arc<dyn StateGenerator>,
    /// Applied to every new session.
    config: SessionConfig,
    /// Required roster size.
    roster_size: usize,
}

impl SessionManager {
    /// Create new session manager.
    pub fn new(
        config: SessionConfig,
        roster_size: usize,
        persistence: Arc<dyn PersistenceGateway>,
        generator: Arc<dyn StateGenerator>,
    ) -> Self {
        Self {
            registry: SessionRegistry::new(),
            persistence,
            generator,
            config,
            roster_size,
        }
    }

    /// Active sessions.
    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    /// Required roster size.
    pub fn roster_size(&self) -> usize {
        self.roster_size
    }

    /// Get a session by ID.
    pub async fn get_session(&self, id: &SessionId) -> Option<Arc<MatchSession>> {
        self.registry.get(id).await
    }

    /// Get active session count.
    pub async fn session_count(&self) -> usize {
        self.registry.session_count().await
    }

    /// Turn a drafted roster into a running session.
    ///
    /// Players whose "match started" notice cannot be delivered are dropped;
    /// the match goes ahead with the rest.
    pub async fn start_match(
        self: &Arc<Self>,
        players: Vec<Player>,
    ) -> Result<SessionId, SessionError> {
        if players.len() != self.roster_size {
            return Err(SessionError::RosterSize {
                expected: self.roster_size,
                actual: players.len(),
            });
        }

        let id = SessionId::generate();
        let session = Arc::new(MatchSession::new(id.clone(), players, self.config.clone()));

        let names = session.player_names().await.join(",");
        info!("Starting game {} with players: {}", id, names);

        let persistence = self.persistence.clone();
        let game_id = id.clone();
        let history = tokio::spawn(async move {
            if let Err(e) = persistence
                .store_game_history(game_id.as_str(), &names, GameStatus::InProgress)
                .await
            {
                error!("Error storing game history for {}: {}", game_id, e);
            }
        });
        session.set_history_task(history).await;

        // Only reachable by a close once the history write is attached.
        self.registry.register(session.clone()).await;

        let report = session
            .broadcast(ServerMessage::match_started(&id), CLOSE_REASON_CONNECTION_LOST)
            .await;
        for player_id in &report.evicted {
            warn!("Could not announce game {} to player {}, dropped", id, player_id);
        }

        let closer = Arc::downgrade(self);
        let generator = self.generator.clone();
        let runner_session = session.clone();
        let started = session
            .start_loops(move || SessionRunner::spawn(runner_session, generator, closer))
            .await;
        if !started {
            debug!("Game {} closed before its loops started", id);
        }

        Ok(id)
    }

    /// Tear a session down and record `status`.
    ///
    /// Exactly one of any number of concurrent calls for the same id
    /// performs the teardown. A persistence failure is reported in the
    /// [`CloseReport`] but never fails the close.
    #[instrument(skip(self))]
    pub async fn close_session(
        &self,
        id: &SessionId,
        status: GameStatus,
    ) -> Result<CloseReport, SessionError> {
        let session = self
            .registry
            .take(id)
            .await
            .ok_or_else(|| SessionError::NotFound(id.clone()))?;

        session.latch().fire();
        for handle in session.take_loops().await {
            if let Err(e) = handle.await {
                error!("Loop for game {} ended abnormally: {}", id, e);
            }
        }

        // Loops that never started leave their players to us.
        let closed_connections = session.close_remaining(CLOSE_REASON_GAME_OVER).await;
        session.mark_closed().await;

        if let Some(history) = session.take_history_task().await {
            if let Err(e) = history.await {
                error!("History write for game {} ended abnormally: {}", id, e);
            }
        }

        let persistence_error = match self
            .persistence
            .update_game_result(id.as_str(), status)
            .await
        {
            Ok(()) => None,
            Err(e) => {
                error!("Error updating game result for {}: {}", id, e);
                Some(e.to_string())
            }
        };

        info!("Game {} has been closed ({})", id, status);
        Ok(CloseReport {
            game_id: id.clone(),
            status,
            closed_connections,
            persistence_error,
        })
    }

    /// Close every active session.
    pub async fn close_all(&self, status: GameStatus) -> usize {
        let mut closed = 0;
        for id in self.registry.session_ids().await {
            if self.close_session(&id, status).await.is_ok() {
                closed += 1;
            }
        }
        closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::player::PlayerId;
    use crate::game::state::ActiveState;
    use crate::network::protocol::{Outbound, MATCH_STARTED_MESSAGE};
    use crate::network::session::SessionState;
    use crate::testing::{drain, test_roster, test_session_config, Call, RecordingGateway};
    use crate::ROSTER_SIZE;
    use std::time::Duration;

    fn manager(gateway: Arc<RecordingGateway>) -> Arc<SessionManager> {
        Arc::new(SessionManager::new(
            test_session_config(),
            ROSTER_SIZE,
            gateway,
            Arc::new(ActiveState),
        ))
    }

    #[tokio::test]
    async fn test_start_match_announces_to_every_player() {
        let gateway = Arc::new(RecordingGateway::new());
        let manager = manager(gateway.clone());
        let (players, mut receivers) = test_roster(ROSTER_SIZE);

        let id = manager.start_match(players).await.unwrap();
        assert!(!id.as_str().is_empty());
        assert_eq!(manager.session_count().await, 1);

        let mut announcements = Vec::new();
        for rx in receivers.iter_mut() {
            match rx.recv().await {
                Some(Outbound::Message(ServerMessage::MatchStarted(info))) => {
                    announcements.push(info)
                }
                other => panic!("expected match started, got {:?}", other),
            }
        }
        assert!(announcements.iter().all(|info| info == &announcements[0]));
        assert_eq!(announcements[0].game_id, id.as_str());
        assert_eq!(announcements[0].message, MATCH_STARTED_MESSAGE);

        let session = manager.get_session(&id).await.unwrap();
        assert_eq!(session.state().await, SessionState::Running);

        manager.close_session(&id, GameStatus::Finished).await.unwrap();
    }

    #[tokio::test]
    async fn test_start_match_rejects_partial_roster() {
        let manager = manager(Arc::new(RecordingGateway::new()));
        let (players, _rx) = test_roster(ROSTER_SIZE - 1);

        let result = manager.start_match(players).await;
        assert_eq!(
            result,
            Err(SessionError::RosterSize { expected: ROSTER_SIZE, actual: ROSTER_SIZE - 1 })
        );
        assert_eq!(manager.session_count().await, 0);
    }

    #[tokio::test]
    async fn test_failed_announcement_drops_only_that_player() {
        let manager = manager(Arc::new(RecordingGateway::new()));
        let (players, mut receivers) = test_roster(ROSTER_SIZE);
        drop(receivers.remove(3));

        let id = manager.start_match(players).await.unwrap();
        let session = manager.get_session(&id).await.unwrap();

        assert_eq!(session.connected_count().await, ROSTER_SIZE - 1);
        assert!(!session.is_attached(&PlayerId::new("p3")).await);
        assert_eq!(session.state().await, SessionState::Running);

        manager.close_session(&id, GameStatus::Finished).await.unwrap();
    }

    #[tokio::test]
    async fn test_close_tears_down_and_records() {
        let gateway = Arc::new(RecordingGateway::new());
        let manager = manager(gateway.clone());
        let (players, mut receivers) = test_roster(ROSTER_SIZE);
        let id = manager.start_match(players).await.unwrap();

        let report = manager.close_session(&id, GameStatus::Finished).await.unwrap();
        assert_eq!(report.game_id, id);
        assert!(report.persistence_error.is_none());
        assert_eq!(manager.session_count().await, 0);

        for rx in receivers.iter_mut() {
            let received = drain(rx);
            let closes = received
                .iter()
                .filter(|m| {
                    matches!(m, Outbound::Close { reason } if reason == CLOSE_REASON_GAME_OVER)
                })
                .count();
            assert_eq!(closes, 1);
            assert!(matches!(received.last(), Some(Outbound::Close { .. })));
        }

        let calls = gateway.calls().await;
        assert_eq!(
            calls,
            vec![
                Call::StoreHistory(
                    id.to_string(),
                    "Player 0,Player 1,Player 2,Player 3,Player 4,Player 5".to_string(),
                    GameStatus::InProgress
                ),
                Call::UpdateResult(id.to_string(), GameStatus::Finished),
            ]
        );
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let gateway = Arc::new(RecordingGateway::new());
        let manager = manager(gateway.clone());
        let (players, _rx) = test_roster(ROSTER_SIZE);
        let id = manager.start_match(players).await.unwrap();

        assert!(manager.close_session(&id, GameStatus::Finished).await.is_ok());
        assert_eq!(
            manager.close_session(&id, GameStatus::Finished).await,
            Err(SessionError::NotFound(id.clone()))
        );

        let finalizations = gateway
            .calls()
            .await
            .into_iter()
            .filter(|c| matches!(c, Call::UpdateResult(..)))
            .count();
        assert_eq!(finalizations, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_closes_single_teardown() {
        let gateway = Arc::new(RecordingGateway::new());
        let manager = manager(gateway.clone());
        let (players, mut receivers) = test_roster(ROSTER_SIZE);
        let id = manager.start_match(players).await.unwrap();

        let closers: Vec<_> = (0..2)
            .map(|_| {
                let manager = manager.clone();
                let id = id.clone();
                tokio::spawn(
                    async move { manager.close_session(&id, GameStatus::Finished).await },
                )
            })
            .collect();

        let mut ok = 0;
        let mut not_found = 0;
        for closer in closers {
            match closer.await.unwrap() {
                Ok(_) => ok += 1,
                Err(SessionError::NotFound(_)) => not_found += 1,
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        assert_eq!((ok, not_found), (1, 1));

        let updates = gateway
            .calls()
            .await
            .into_iter()
            .filter(|c| matches!(c, Call::UpdateResult(..)))
            .count();
        assert_eq!(updates, 1);

        for rx in receivers.iter_mut() {
            let closes = drain(rx)
                .into_iter()
                .filter(|m| matches!(m, Outbound::Close { .. }))
                .count();
            assert_eq!(closes, 1);
        }
    }

    #[tokio::test]
    async fn test_close_unknown_game() {
        let gateway = Arc::new(RecordingGateway::new());
        let manager = manager(gateway.clone());

        let result = manager
            .close_session(&SessionId::new("xyz"), GameStatus::Finished)
            .await;
        assert_eq!(result, Err(SessionError::NotFound(SessionId::new("xyz"))));
        assert!(gateway.calls().await.is_empty());
    }

    #[tokio::test]
    async fn test_finalize_failure_does_not_block_close() {
        let gateway = Arc::new(RecordingGateway::failing_updates());
        let manager = manager(gateway.clone());
        let (players, mut receivers) = test_roster(ROSTER_SIZE);
        let id = manager.start_match(players).await.unwrap();

        let report = manager.close_session(&id, GameStatus::Finished).await.unwrap();
        assert!(report.persistence_error.is_some());
        assert_eq!(manager.session_count().await, 0);
        for rx in receivers.iter_mut() {
            assert!(matches!(drain(rx).last(), Some(Outbound::Close { .. })));
        }
    }

    #[tokio::test]
    async fn test_history_stored_before_finalize() {
        // Close straight after start; the history write may still be pending.
        for _ in 0..20 {
            let gateway = Arc::new(RecordingGateway::new());
            let manager = manager(gateway.clone());
            let (players, _rx) = test_roster(ROSTER_SIZE);
            let id = manager.start_match(players).await.unwrap();
            manager.close_session(&id, GameStatus::Finished).await.unwrap();

            let calls = gateway.calls().await;
            assert!(matches!(calls[0], Call::StoreHistory(..)));
            assert!(matches!(calls[1], Call::UpdateResult(..)));
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_close_racing_start_sees_history_first() {
        // A closer that grabs the session the moment it is registered must
        // still finalize after the history write.
        for _ in 0..500 {
            let gateway = Arc::new(RecordingGateway::new());
            let manager = manager(gateway.clone());
            let (players, _rx) = test_roster(ROSTER_SIZE);

            let closer = {
                let manager = manager.clone();
                tokio::spawn(async move {
                    loop {
                        let first = manager.registry().session_ids().await.into_iter().next();
                        if let Some(id) = first {
                            return manager.close_session(&id, GameStatus::Finished).await;
                        }
                        tokio::task::yield_now().await;
                    }
                })
            };
            let starter = {
                let manager = manager.clone();
                tokio::spawn(async move { manager.start_match(players).await })
            };

            let id = starter.await.unwrap().unwrap();
            let report = closer.await.unwrap().unwrap();
            assert_eq!(report.game_id, id);

            let calls = gateway.calls().await;
            assert!(matches!(calls[0], Call::StoreHistory(..)), "{calls:?}");
            assert_eq!(calls[1], Call::UpdateResult(id.to_string(), GameStatus::Finished));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_all() {
        let manager = manager(Arc::new(RecordingGateway::new()));
        let mut receivers = Vec::new();
        for _ in 0..3 {
            let (players, rx) = test_roster(ROSTER_SIZE);
            receivers.push(rx);
            manager.start_match(players).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(250)).await;

        assert_eq!(manager.close_all(GameStatus::Finished).await, 3);
        assert_eq!(manager.session_count().await, 0);
    }
}
