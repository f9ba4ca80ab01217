//! Match-agnostic building blocks.
//!
//! Player handles and the state generator seam. Simulation itself is
//! not part of this crate; sessions broadcast whatever a
//! [`StateGenerator`](state::StateGenerator) produces.

pub mod player;
pub mod state;

pub use player::{ActivityClock, Player, PlayerId, PlayerLink, SendError};
pub use state::{ActiveState, StateGenerator};
