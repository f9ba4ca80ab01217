//! WebSocket Game Server
//!
//! Accept loop, background matchmaker and the administrative API.
//! Every accepted connection is handed to the [`ConnectionAdapter`] and the
//! resulting player joins the matchmaking queue.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument, warn};

use crate::game::player::Player;
use crate::game::state::{ActiveState, StateGenerator};
use crate::network::connection::{ConnectError, ConnectionAdapter};
use crate::network::lifecycle::SessionManager;
use crate::network::matchmaker::{Matchmaker, PlayerQueue, QueueError};
use crate::network::protocol::{
    CloseResponse, PlayerCreated, CLOSE_REASON_SERVER_FULL, CLOSE_REASON_SHUTDOWN,
    GAME_CLOSED_MESSAGE, PLAYER_CREATED_MESSAGE,
};
use crate::network::session::{
    AbandonPolicy, CloseLatch, SessionConfig, SessionError, SessionId, MAX_TICK_RATE,
};
use crate::persistence::{GameRecord, GameStatus, PersistenceError, PersistenceGateway};

/// Default listening port.
pub const DEFAULT_PORT: u16 = 8080;

/// How long shutdown waits for handshakes already in progress.
const HANDSHAKE_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Bind address.
    pub bind_addr: SocketAddr,
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// Maximum players waiting for a match.
    pub queue_capacity: usize,
    /// Players per session.
    pub roster_size: usize,
    /// Matchmaker poll period.
    pub matchmaking_interval: Duration,
    /// Frames buffered per connection before sends start to wait.
    pub outbound_buffer: usize,
    /// Per-session settings.
    pub session: SessionConfig,
    /// Server version string.
    pub version: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), DEFAULT_PORT),
            max_connections: 1000,
            queue_capacity: crate::QUEUE_CAPACITY,
            roster_size: crate::ROSTER_SIZE,
            matchmaking_interval: Duration::from_millis(100),
            outbound_buffer: 64,
            session: SessionConfig::default(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables.
    ///
    /// Unset variables keep their defaults; unparsable ones are logged and
    /// ignored.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let session_defaults = SessionConfig::default();

        let host = parse_var(&lookup, "ARENA_BIND_HOST", defaults.bind_addr.ip());
        let port = parse_var(&lookup, "PORT", defaults.bind_addr.port());
        let inactivity_secs = parse_var(
            &lookup,
            "ARENA_INACTIVITY_TIMEOUT_SECS",
            session_defaults.inactivity_timeout.as_secs(),
        );
        let tick_rate = match parse_var(&lookup, "ARENA_TICK_RATE", session_defaults.tick_rate) {
            rate @ 1..=MAX_TICK_RATE => rate,
            rate => {
                warn!(
                    "Ignoring out-of-range ARENA_TICK_RATE={} (allowed 1..={})",
                    rate, MAX_TICK_RATE
                );
                session_defaults.tick_rate
            }
        };

        Self {
            bind_addr: SocketAddr::new(host, port),
            max_connections: parse_var(&lookup, "ARENA_MAX_CONNECTIONS", defaults.max_connections),
            queue_capacity: parse_var(&lookup, "ARENA_QUEUE_CAPACITY", defaults.queue_capacity),
            session: SessionConfig {
                tick_rate,
                inactivity_timeout: Duration::from_secs(inactivity_secs),
                abandon_policy: parse_var::<AbandonPolicy, _>(
                    &lookup,
                    "ARENA_ABANDON_POLICY",
                    session_defaults.abandon_policy,
                ),
                ..session_defaults
            },
            ..defaults
        }
    }
}

fn parse_var<T, F>(lookup: &F, key: &str, default: T) -> T
where
    T: FromStr,
    T::Err: fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(raw) => match raw.trim().parse() {
            Ok(value) => value,
            Err(e) => {
                warn!("Ignoring invalid {}={:?}: {}", key, raw, e);
                default
            }
        },
        None => default,
    }
}

/// Game server errors.
#[derive(Debug, thiserror::Error)]
pub enum GameServerError {
    /// Failed to bind to address.
    #[error("Failed to bind: {0}")]
    BindFailed(#[from] std::io::Error),

    /// WebSocket error.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// Session error.
    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    /// Persistence error.
    #[error("Persistence error: {0}")]
    Persistence(#[from] PersistenceError),

    /// Invalid player identity.
    #[error("Invalid player: {0}")]
    Connect(#[from] ConnectError),
}

impl GameServerError {
    /// Whether this is a lookup miss.
    pub fn is_not_found(&self) -> bool {
        matches!(self, GameServerError::Session(SessionError::NotFound(_)))
    }
}

/// The game server.
pub struct GameServer {
    /// Server configuration.
    config: ServerConfig,
    /// Handshake and connection tasks.
    adapter: ConnectionAdapter,
    /// Players waiting for a match.
    queue: Arc<PlayerQueue>,
    /// Session manager.
    sessions: Arc<SessionManager>,
    /// Durable history.
    persistence: Arc<dyn PersistenceGateway>,
    /// Shutdown signal.
    shutdown: CloseLatch,
}

impl GameServer {
    /// Create a server broadcasting the placeholder `"active"` state.
    pub fn new(config: ServerConfig, persistence: Arc<dyn PersistenceGateway>) -> Self {
        Self::with_generator(config, persistence, Arc::new(ActiveState))
    }

    /// Create a server with a custom state generator.
    pub fn with_generator(
        config: ServerConfig,
        persistence: Arc<dyn PersistenceGateway>,
        generator: Arc<dyn StateGenerator>,
    ) -> Self {
        let sessions = Arc::new(SessionManager::new(
            config.session.clone(),
            config.roster_size,
            persistence.clone(),
            generator,
        ));

        Self {
            adapter: ConnectionAdapter::new(config.outbound_buffer),
            queue: Arc::new(PlayerQueue::new(config.queue_capacity)),
            sessions,
            persistence,
            shutdown: CloseLatch::new(),
            config,
        }
    }

    /// Server configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Bind the configured address and serve until shutdown.
    #[instrument(skip(self))]
    pub async fn run(&self) -> Result<(), GameServerError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve on an already bound listener until shutdown.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), GameServerError> {
        info!(
            "Arena server v{} listening on {}",
            self.config.version,
            listener.local_addr()?
        );

        let matchmaker = Matchmaker::new(
            self.queue.clone(),
            self.sessions.clone(),
            self.config.matchmaking_interval,
        );
        let matchmaking_handle = tokio::spawn(matchmaker.run(self.shutdown.subscribe()));

        let mut handshakes = JoinSet::new();
        let mut shutdown_rx = self.shutdown.subscribe();
        loop {
            tokio::select! {
                biased;
                _ = CloseLatch::fired(&mut shutdown_rx) => {
                    info!("Shutdown signal received");
                    break;
                }
                Some(_) = handshakes.join_next(), if !handshakes.is_empty() => {}
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            if self.adapter.active_connections() >= self.config.max_connections {
                                warn!("Connection limit reached, rejecting {}", addr);
                                continue;
                            }
                            debug!("New connection from {}", addr);
                            self.handle_connection(&mut handshakes, stream, addr);
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                        }
                    }
                }
            }
        }

        // Handshakes finishing now see the shutdown flag or land in the
        // queue before it is drained.
        let pending = handshakes.len();
        let finished = tokio::time::timeout(HANDSHAKE_DRAIN_TIMEOUT, async {
            while handshakes.join_next().await.is_some() {}
        })
        .await;
        if finished.is_err() {
            warn!("Abandoning {} of {} pending handshakes", handshakes.len(), pending);
            handshakes.shutdown().await;
        }

        if let Err(e) = matchmaking_handle.await {
            error!("Matchmaker ended abnormally: {}", e);
        }
        self.drain().await;
        Ok(())
    }

    /// Handshake, then queue the player.
    fn handle_connection(&self, tasks: &mut JoinSet<()>, stream: TcpStream, addr: SocketAddr) {
        let adapter = self.adapter.clone();
        let queue = self.queue.clone();
        let shutting_down = self.shutdown.subscribe();
        let send_timeout = self.config.session.send_timeout;

        tasks.spawn(async move {
            let player = match adapter.accept(stream, addr).await {
                Ok(player) => player,
                Err(e) => {
                    debug!("WebSocket handshake failed for {}: {}", addr, e);
                    return;
                }
            };

            if *shutting_down.borrow() {
                player.close(CLOSE_REASON_SHUTDOWN, send_timeout).await;
                return;
            }

            match queue.enqueue(player).await {
                Ok(waiting) => debug!("Player from {} queued, {} waiting", addr, waiting),
                Err(QueueError::Full { capacity, player }) => {
                    warn!("Queue full ({}), turning away {}", capacity, player.id);
                    player.close(CLOSE_REASON_SERVER_FULL, send_timeout).await;
                }
            }
        });
    }

    /// Close every session and release everybody still waiting.
    async fn drain(&self) {
        let closed = self.sessions.close_all(GameStatus::Finished).await;
        let waiting = self.queue.take_all().await;
        let timeout = self.config.session.send_timeout;
        let released = waiting.len();
        futures_util::future::join_all(
            waiting
                .into_iter()
                .map(|p: Player| p.close(CLOSE_REASON_SHUTDOWN, timeout)),
        )
        .await;
        info!(
            "Server stopped: {} games closed, {} queued players released",
            closed, released
        );
    }

    // =========================================================================
    // ADMIN API
    // =========================================================================

    /// Close a game by id, recording it as finished.
    pub async fn close_game(&self, game_id: &str) -> Result<CloseResponse, GameServerError> {
        let report = self
            .sessions
            .close_session(&SessionId::new(game_id), GameStatus::Finished)
            .await?;
        if let Some(e) = &report.persistence_error {
            warn!("Game {} closed without a final record: {}", game_id, e);
        }
        Ok(CloseResponse {
            message: GAME_CLOSED_MESSAGE.to_string(),
            game_id: report.game_id.to_string(),
        })
    }

    /// Register a player.
    pub async fn create_player(
        &self,
        player_id: &str,
        name: &str,
    ) -> Result<PlayerCreated, GameServerError> {
        if player_id.is_empty() {
            return Err(ConnectError::MissingId.into());
        }
        if name.is_empty() {
            return Err(ConnectError::MissingName.into());
        }
        self.persistence.store_player(player_id, name).await?;
        info!("Player {} registered as {}", player_id, name);
        Ok(PlayerCreated {
            message: PLAYER_CREATED_MESSAGE.to_string(),
            player_id: player_id.to_string(),
        })
    }

    /// Every game a player took part in.
    pub async fn player_games(&self, player_id: &str) -> Result<Vec<GameRecord>, GameServerError> {
        Ok(self.persistence.get_player_games(player_id).await?)
    }

    /// Stop accepting, close all games and release the queue.
    pub fn shutdown(&self) {
        self.shutdown.fire();
    }

    /// Get active connection count.
    pub fn connection_count(&self) -> usize {
        self.adapter.active_connections()
    }

    /// Get active session count.
    pub async fn session_count(&self) -> usize {
        self.sessions.session_count().await
    }

    /// Get matchmaking queue size.
    pub async fn queue_size(&self) -> usize {
        self.queue.len().await
    }

    /// Ids of all running games.
    pub async fn game_ids(&self) -> Vec<SessionId> {
        self.sessions.registry().session_ids().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::player::{ActivityClock, PlayerId};
    use crate::network::protocol::Outbound;
    use crate::persistence::MemoryStore;
    use crate::testing::{test_roster, test_session_config, Call, RecordingGateway};
    use std::collections::HashMap;
    use tokio::sync::mpsc;

    fn local_config() -> ServerConfig {
        ServerConfig {
            bind_addr: "127.0.0.1:0".parse().unwrap(),
            ..Default::default()
        }
    }

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr.port(), 8080);
        assert_eq!(config.max_connections, 1000);
        assert_eq!(config.queue_capacity, 100);
        assert_eq!(config.roster_size, 6);
        assert_eq!(config.matchmaking_interval, Duration::from_millis(100));
        assert_eq!(config.session.tick_rate, 60);
    }

    #[test]
    fn test_config_from_lookup() {
        let vars: HashMap<&str, &str> = [
            ("PORT", "9001"),
            ("ARENA_BIND_HOST", "127.0.0.1"),
            ("ARENA_QUEUE_CAPACITY", "12"),
            ("ARENA_TICK_RATE", "30"),
            ("ARENA_INACTIVITY_TIMEOUT_SECS", "45"),
            ("ARENA_ABANDON_POLICY", "keep"),
        ]
        .into_iter()
        .collect();
        let config = ServerConfig::from_lookup(|k| vars.get(k).map(|v| v.to_string()));

        assert_eq!(config.bind_addr, "127.0.0.1:9001".parse::<SocketAddr>().unwrap());
        assert_eq!(config.queue_capacity, 12);
        assert_eq!(config.max_connections, 1000);
        assert_eq!(config.session.tick_rate, 30);
        assert_eq!(config.session.inactivity_timeout, Duration::from_secs(45));
        assert_eq!(config.session.abandon_policy, AbandonPolicy::KeepRunning);
        assert_eq!(config.session.inactivity_check_interval, Duration::from_secs(10));
    }

    #[test]
    fn test_config_tick_rate_out_of_range_falls_back() {
        for raw in ["2000000", "0", "1001"] {
            let config = ServerConfig::from_lookup(|k| {
                (k == "ARENA_TICK_RATE").then(|| raw.to_string())
            });
            assert_eq!(config.session.tick_rate, 60, "ARENA_TICK_RATE={raw}");
            assert!(!config.session.tick_interval().is_zero());
        }

        let config = ServerConfig::from_lookup(|k| (k == "ARENA_TICK_RATE").then(|| "1000".into()));
        assert_eq!(config.session.tick_rate, MAX_TICK_RATE);
    }

    #[test]
    fn test_config_invalid_values_fall_back() {
        let vars: HashMap<&str, &str> = [("PORT", "http"), ("ARENA_ABANDON_POLICY", "sometimes")]
            .into_iter()
            .collect();
        let config = ServerConfig::from_lookup(|k| vars.get(k).map(|v| v.to_string()));

        assert_eq!(config.bind_addr.port(), DEFAULT_PORT);
        assert_eq!(config.session.abandon_policy, AbandonPolicy::CloseSession);
    }

    #[tokio::test]
    async fn test_server_creation() {
        let server = GameServer::new(local_config(), Arc::new(MemoryStore::new()));

        assert_eq!(server.connection_count(), 0);
        assert_eq!(server.session_count().await, 0);
        assert_eq!(server.queue_size().await, 0);
    }

    #[tokio::test]
    async fn test_close_unknown_game() {
        let server = GameServer::new(local_config(), Arc::new(MemoryStore::new()));
        let err = server.close_game("xyz").await.unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(err.to_string(), "Session error: Game not found: xyz");
    }

    #[tokio::test]
    async fn test_create_player() {
        let store = Arc::new(MemoryStore::new());
        let server = GameServer::new(local_config(), store.clone());

        let created = server.create_player("p1", "Ann").await.unwrap();
        assert_eq!(created.message, "Player created successfully");
        assert_eq!(created.player_id, "p1");
        assert_eq!(store.player("p1").await.unwrap().name, "Ann");

        let err = server.create_player("", "Ann").await.unwrap_err();
        assert!(matches!(err, GameServerError::Connect(ConnectError::MissingId)));
    }

    #[tokio::test]
    async fn test_player_games() {
        let store = Arc::new(MemoryStore::new());
        let server = GameServer::new(local_config(), store.clone());
        server.create_player("p1", "Ann").await.unwrap();
        store
            .store_game_history("g1", "Ann,Bob", GameStatus::InProgress)
            .await
            .unwrap();

        let games = server.player_games("p1").await.unwrap();
        assert_eq!(games.len(), 1);
        assert_eq!(games[0].game_id, "g1");
    }

    #[tokio::test]
    async fn test_server_shutdown() {
        let server = Arc::new(GameServer::new(local_config(), Arc::new(MemoryStore::new())));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();

        let running = {
            let server = server.clone();
            tokio::spawn(async move { server.serve(listener).await })
        };
        server.shutdown();
        running.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_closes_matches_drafted_at_the_last_moment() {
        let gateway = Arc::new(RecordingGateway::new());
        let config = ServerConfig {
            matchmaking_interval: Duration::from_millis(5),
            session: SessionConfig {
                send_timeout: Duration::from_millis(200),
                ..test_session_config()
            },
            ..local_config()
        };
        let server = Arc::new(GameServer::new(config, gateway.clone()));

        // p0 never reads, so starting its match stalls on the announcement.
        let (stalled_tx, _stalled_rx) = mpsc::channel(1);
        stalled_tx.try_send(Outbound::Close { reason: String::new() }).unwrap();
        let stalled =
            Player::new(PlayerId::new("p0"), "Player 0", ActivityClock::starting_now(), stalled_tx);
        server.queue.enqueue(stalled).await.unwrap();
        let (rest, _receivers) = test_roster(crate::ROSTER_SIZE - 1);
        for player in rest {
            server.queue.enqueue(player).await.unwrap();
        }

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let running = {
            let server = server.clone();
            tokio::spawn(async move { server.serve(listener).await })
        };
        while server.queue_size().await > 0 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        server.shutdown();
        running.await.unwrap().unwrap();

        assert_eq!(server.session_count().await, 0);
        let finalized = gateway
            .calls()
            .await
            .into_iter()
            .filter(|c| matches!(c, Call::UpdateResult(_, GameStatus::Finished)))
            .count();
        assert_eq!(finalized, 1);
    }
}
