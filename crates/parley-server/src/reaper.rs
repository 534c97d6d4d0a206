use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::registry::SessionRegistry;

/// Remove every session that is no longer connected or has been silent
/// longer than `idle_timeout`, then close each one.
///
/// Selection and removal happen in one registry critical section; the
/// per-session cleanup runs after the lock is released, and a panic while
/// closing one session does not stop the rest. Returns the number of
/// sessions removed.
pub fn reap(registry: &SessionRegistry, now: Instant, idle_timeout: Duration) -> usize {
    let stale = registry.remove_if(|s| !s.is_connected() || s.is_timed_out(now, idle_timeout));

    for session in &stale {
        let reason = if session.is_connected() {
            "idle timeout"
        } else {
            "connection lost"
        };
        match panic::catch_unwind(AssertUnwindSafe(|| session.disconnect())) {
            Ok(true) => {
                info!(session_id = %session.id(), client_id = %session.client_id(), reason, "reaped session");
            }
            Ok(false) => debug!(session_id = %session.id(), "reaped session was already closed"),
            Err(_) => error!(session_id = %session.id(), "session cleanup panicked"),
        }
    }
    stale.len()
}

/// Run [`reap`] every `interval` until `shutdown` fires.
pub fn start_reaper(
    registry: Arc<SessionRegistry>,
    interval: Duration,
    idle_timeout: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let removed = reap(&registry, Instant::now(), idle_timeout);
                    if removed > 0 {
                        info!(removed, remaining = registry.len(), "cleaned up stale sessions");
                    }
                }
            }
        }
        debug!("reaper stopped");
    })
}
