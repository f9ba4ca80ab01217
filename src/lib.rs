//! # Arena Server
//!
//! Matchmaking and session lifecycle server for real-time arena matches.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      ARENA SERVER                            │
//! ├─────────────────────────────────────────────────────────────┤
//! │  game/           - Match-agnostic building blocks            │
//! │  ├── player.rs   - Player handles and activity clocks        │
//! │  └── state.rs    - Pluggable broadcast state generators      │
//! │                                                              │
//! │  network/        - Networking and session lifecycle          │
//! │  ├── connection.rs - WebSocket handshake and I/O tasks       │
//! │  ├── protocol.rs - Message types                             │
//! │  ├── matchmaker.rs - Waiting queue and roster drafting       │
//! │  ├── session.rs  - Match session, roster and close latch     │
//! │  ├── registry.rs - Active session registry                   │
//! │  ├── lifecycle.rs- Session creation and close protocol       │
//! │  ├── runner.rs   - Tick and inactivity loops                 │
//! │  └── server.rs   - Accept loop and admin API                 │
//! │                                                              │
//! │  persistence/    - Game history collaborator                 │
//! │  ├── mod.rs      - Gateway trait and records                 │
//! │  └── memory.rs   - In-memory backend                         │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Session lifecycle
//!
//! Players are queued on connect. Every full roster of [`ROSTER_SIZE`]
//! players becomes one session with its own tick loop and inactivity
//! monitor. A session is torn down exactly once, either by an
//! administrative close or by the runner itself.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod game;
pub mod network;
pub mod persistence;

#[cfg(test)]
pub(crate) mod testing;

// Re-export commonly used types
pub use game::player::{ActivityClock, Player, PlayerId};
pub use game::state::{ActiveState, StateGenerator};
pub use network::{GameServer, GameServerError, ServerConfig, SessionConfig, SessionId};
pub use persistence::{GameStatus, MemoryStore, PersistenceGateway};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Players per match.
pub const ROSTER_SIZE: usize = 6;

/// Session broadcast rate (Hz).
pub const TICK_RATE: u32 = 60;

/// Waiting queue capacity.
pub const QUEUE_CAPACITY: usize = 100;
