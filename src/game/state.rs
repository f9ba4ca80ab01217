//! Broadcast State
//!
//! Sessions do not simulate anything themselves. Each tick they ask a
//! [`StateGenerator`] for the next snapshot and broadcast it verbatim.

use serde_json::Value;

use crate::network::session::SessionId;

/// Produces the opaque state blob broadcast on every tick.
pub trait StateGenerator: Send + Sync + 'static {
    /// State for `tick` (1-based) of game `game_id`.
    fn next_state(&self, game_id: &SessionId, tick: u64) -> Value;
}

impl<F> StateGenerator for F
where
    F: Fn(&SessionId, u64) -> Value + Send + Sync + 'static,
{
    fn next_state(&self, game_id: &SessionId, tick: u64) -> Value {
        self(game_id, tick)
    }
}

/// Default generator: reports every session as `"active"`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ActiveState;

impl StateGenerator for ActiveState {
    fn next_state(&self, _game_id: &SessionId, _tick: u64) -> Value {
        Value::String("active".to_string())
    }
}
