//! Per-connection liveness monitor.
//!
//! Each admitted connection gets one timer task.  On every tick the task asks
//! its [`HeartbeatTarget`] (the hub) to check the connection:
//!
//! - silent for more than twice the interval → the connection is expired and
//!   the task stops;
//! - otherwise a WebSocket Ping probe is sent.
//!
//! The task holds only a `Weak` reference to the target, and the returned
//! [`HeartbeatGuard`] aborts it on drop.  The guard lives inside the
//! connection's registry entry, so every teardown path releases the timer.

use std::sync::Weak;
use std::time::Duration;

use relay_core::ConnectionId;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, warn};

/// Result of a liveness check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Alive,
    Expired,
}

/// What the target did on a tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// A probe was sent; keep ticking.
    Probed,
    /// The connection missed its deadline.
    Expired,
    /// The connection is gone or its transport is closed.
    Gone,
}

/// Decides liveness from the last heartbeat time.
pub fn liveness(last_heartbeat: Instant, now: Instant, interval: Duration) -> Liveness {
    let Some(grace) = interval.checked_mul(2) else {
        return Liveness::Alive;
    };
    if now.saturating_duration_since(last_heartbeat) > grace {
        Liveness::Expired
    } else {
        Liveness::Alive
    }
}

/// The side of the hub the monitor talks to.
pub trait HeartbeatTarget: Send + Sync + 'static {
    /// Checks one connection and sends a probe if it is alive.
    fn heartbeat_tick(&self, id: ConnectionId, interval: Duration) -> TickOutcome;

    /// Closes an expired connection.
    fn expire(&self, id: ConnectionId);
}

/// Aborts the monitor task when dropped.
#[derive(Debug)]
pub struct HeartbeatGuard {
    handle: JoinHandle<()>,
}

impl HeartbeatGuard {
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl Drop for HeartbeatGuard {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Starts the monitor for one connection.  The first tick fires one interval
/// after the call.
pub fn spawn_monitor<T: HeartbeatTarget>(
    target: Weak<T>,
    id: ConnectionId,
    interval: Duration,
) -> HeartbeatGuard {
    let handle = tokio::spawn(async move {
        let Some(start) = Instant::now().checked_add(interval) else {
            warn!("connection {id}: heartbeat interval {interval:?} out of range; monitor disabled");
            return;
        };
        let mut ticker = interval_at(start, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;

            let Some(target) = target.upgrade() else {
                break;
            };

            match target.heartbeat_tick(id, interval) {
                TickOutcome::Probed => {}
                TickOutcome::Expired => {
                    warn!("connection {id}: heartbeat timeout");
                    target.expire(id);
                    break;
                }
                TickOutcome::Gone => {
                    debug!("connection {id}: heartbeat monitor stopping");
                    break;
                }
            }
        }
    });

    HeartbeatGuard { handle }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
