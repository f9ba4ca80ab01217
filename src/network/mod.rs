//! Network Layer
//!
//! WebSocket front end, matchmaking queue and the session lifecycle.
//! Game content is opaque here; states come from a [`crate::game::state::StateGenerator`].

pub mod connection;
pub mod lifecycle;
pub mod matchmaker;
pub mod protocol;
pub mod registry;
pub mod runner;
pub mod server;
pub mod session;

pub use connection::{ConnectError, ConnectParams, ConnectionAdapter};
pub use lifecycle::{CloseReport, SessionManager};
pub use matchmaker::{Matchmaker, PlayerQueue, QueueError};
pub use protocol::{ClientMessage, CloseResponse, Outbound, PlayerCreated, ServerMessage};
pub use registry::SessionRegistry;
pub use runner::SessionRunner;
pub use server::{GameServer, GameServerError, ServerConfig};
pub use session::{
    AbandonPolicy, CloseLatch, MatchSession, SessionConfig, SessionError, SessionId, SessionState,
    MAX_TICK_RATE,
};
