//! Per-session keepalive monitor.
//!
//! One background task per connected session issues a no-op command every
//! `keepalive_interval` through the session's serialized exec path, so a
//! burst of user commands naturally delays (but never skips) the next
//! probe. A successful probe resets the failure counter; once
//! `keepalive_count_max` consecutive probes fail, the monitor declares the
//! session dead and hands it to the registry for the same teardown an
//! explicit disconnect gets (mounts failed, entry removed).
//!
//! The monitor parks on the session's cancellation token, so it stops
//! within one tick of the session leaving Connected for any reason and
//! never races the teardown path.
//!
//! A probe timeout counts as a keepalive failure: the probe exists to
//! measure link health, and an unresponsive link is unhealthy even if the
//! TCP connection is nominally alive. (User command timeouts are judged
//! differently, see `Session::exec`.)

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, warn};

use crate::error::SessionError;
use crate::registry::SessionRegistry;
use crate::session::{Session, SessionState};

/// The no-op probe command.
pub(crate) const KEEPALIVE_COMMAND: &str = "true";

/// Probes get a short deadline of their own; waiting out a long exec
/// timeout would let a dead link linger for many intervals.
const KEEPALIVE_PROBE_CAP: Duration = Duration::from_secs(10);

pub(crate) fn probe_timeout(exec_timeout: Duration) -> Duration {
    exec_timeout.min(KEEPALIVE_PROBE_CAP)
}

/// Spawn the monitor task for a freshly connected session.
pub(crate) fn spawn_monitor(registry: SessionRegistry, session: Arc<Session>) -> JoinHandle<()> {
    let cancel = session.cancel_token();
    tokio::spawn(async move {
        let tuning = session.params().tuning.clone();
        let timeout = probe_timeout(tuning.exec_timeout);
        let identity = session.identity().clone();

        let mut ticker = tokio::time::interval(tuning.keepalive_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately; consume it so the first
        // probe lands one interval after connect.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    // A user command may have hit ConnectionLost and marked
                    // the session Failed; reap the entry just like a failed
                    // probe would. Explicit disconnects already removed it,
                    // and `remove_failed` never touches a live session.
                    if session.state() == SessionState::Failed {
                        registry.remove_failed(&identity).await;
                    }
                    debug!(%identity, "keepalive monitor stopped");
                    return;
                }
                _ = ticker.tick() => {}
            }

            if !session.is_connected() {
                debug!(%identity, "session no longer connected, keepalive monitor exiting");
                return;
            }

            match session.exec(KEEPALIVE_COMMAND, timeout).await {
                Ok(_) => {
                    session.reset_keepalive_failures();
                }
                Err(SessionError::NotConnected { .. }) => {
                    // Lost the race with a teardown; nothing left to watch.
                    return;
                }
                Err(SessionError::ConnectionLost { .. }) => {
                    // exec already marked the session Failed.
                    error!(%identity, "keepalive probe found the connection dead");
                    registry.remove_failed(&identity).await;
                    return;
                }
                Err(e) => {
                    let failures = session.record_keepalive_failure();
                    warn!(
                        %identity,
                        failures,
                        max = tuning.keepalive_count_max,
                        error = %e,
                        "keepalive probe failed"
                    );
                    if failures >= tuning.keepalive_count_max {
                        error!(%identity, "keepalive budget exhausted, tearing session down");
                        session.mark_failed("keepalive budget exhausted");
                        registry.remove_failed(&identity).await;
                        return;
                    }
                }
            }
        }
    })
}
