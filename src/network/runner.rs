//! Session Runner
//!
//! Each session runs two loops:
//!
//! - the tick loop broadcasts a fresh state snapshot at the configured rate
//!   and, when it stops, closes every remaining connection;
//! - the inactivity monitor evicts players that have gone quiet.
//!
//! Both stop only through the session's close latch. Internal termination
//! (time limit reached, everybody gone) is requested through the regular
//! close protocol so it races safely with administrative closes.

use std::sync::{Arc, Weak};

use tokio::task::JoinHandle;
use tokio::time::{interval, interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info};

use crate::game::state::StateGenerator;
use crate::network::lifecycle::SessionManager;
use crate::network::protocol::{
    ServerMessage, CLOSE_REASON_CONNECTION_LOST, CLOSE_REASON_GAME_OVER, CLOSE_REASON_INACTIVE,
};
use crate::network::session::{AbandonPolicy, CloseLatch, MatchSession};
use crate::persistence::GameStatus;

/// Spawns and drives the loops of one session.
pub struct SessionRunner;

impl SessionRunner {
    /// Spawn the tick loop and the inactivity monitor for `session`.
    ///
    /// `closer` is used to request an internal close; it is weak so a
    /// running session does not keep its manager alive.
    pub fn spawn(
        session: Arc<MatchSession>,
        generator: Arc<dyn StateGenerator>,
        closer: Weak<SessionManager>,
    ) -> Vec<JoinHandle<()>> {
        vec![
            tokio::spawn(run_tick_loop(session.clone(), generator, closer)),
            tokio::spawn(run_inactivity_loop(session)),
        ]
    }
}

/// Why the runner wants its session closed.
fn termination_due(session: &MatchSession, connected: usize) -> Option<GameStatus> {
    let config = session.config();
    if let Some(limit) = config.max_duration {
        if session.elapsed() >= limit {
            return Some(GameStatus::Finished);
        }
    }
    if connected == 0 && config.abandon_policy == AbandonPolicy::CloseSession {
        return Some(GameStatus::Abandoned);
    }
    None
}

/// Ask the manager to close the session on a separate task, so the close
/// protocol can join this loop.
fn request_close(session: &MatchSession, closer: &Weak<SessionManager>, status: GameStatus) {
    let Some(manager) = closer.upgrade() else {
        return;
    };
    let id = session.id.clone();
    info!("Game {} ending internally ({})", id, status);
    tokio::spawn(async move {
        if let Err(e) = manager.close_session(&id, status).await {
            debug!("Internal close of {} skipped: {}", id, e);
        }
    });
}

/// Broadcast loop. Returns once, after the latch fires.
async fn run_tick_loop(
    session: Arc<MatchSession>,
    generator: Arc<dyn StateGenerator>,
    closer: Weak<SessionManager>,
) {
    let mut ticker = interval(session.config().tick_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut latch = session.latch().subscribe();
    let mut tick: u64 = 0;
    let mut close_requested = false;

    loop {
        tokio::select! {
            biased;
            _ = CloseLatch::fired(&mut latch) => break,
            _ = ticker.tick() => {
                tick += 1;
                let state = generator.next_state(&session.id, tick);
                session.record_state(state.clone()).await;

                let update = ServerMessage::state_update(&session.id, state, tick);
                let report = session.broadcast(update, CLOSE_REASON_CONNECTION_LOST).await;
                for player_id in &report.evicted {
                    info!(
                        "Player {} dropped from game {} after failed send",
                        player_id, session.id
                    );
                }

                if !close_requested {
                    let connected = session.connected_count().await;
                    if let Some(status) = termination_due(&session, connected) {
                        close_requested = true;
                        request_close(&session, &closer, status);
                    }
                }
            }
        }
    }

    let closed = session.close_remaining(CLOSE_REASON_GAME_OVER).await;
    info!(
        "Closing game {} after {} ticks, {} connections closed",
        session.id, tick, closed
    );
}

/// Inactivity monitor. First check one interval after start.
async fn run_inactivity_loop(session: Arc<MatchSession>) {
    let period = session.config().inactivity_check_interval;
    let mut checks = interval_at(Instant::now() + period, period);
    checks.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut latch = session.latch().subscribe();

    loop {
        tokio::select! {
            biased;
            _ = CloseLatch::fired(&mut latch) => break,
            _ = checks.tick() => {
                let inactive = session.detach_inactive(Instant::now()).await;
                let timeout = session.config().send_timeout;
                for player in inactive {
                    info!(
                        "Player {} is inactive, disconnecting from game {}",
                        player.id, session.id
                    );
                    player.close(CLOSE_REASON_INACTIVE, timeout).await;
                }
            }
        }
    }

    debug!("Inactivity monitor for game {} stopped", session.id);
}
