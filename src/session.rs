//! One authenticated remote-command session bound to a server identity.
//!
//! # State machine
//!
//! ```text
//!            registry connect()            exec() hits ConnectionLost,
//!                  │                       or keepalive budget exhausted
//!                  ▼                                  │
//!             Connected ──────────────────────────────┴──▶ Failed (terminal)
//!                  │
//!                  │ disconnect()
//!                  ▼
//!            Disconnecting ──▶ Disconnected
//! ```
//!
//! The `Connecting` phase lives inside the registry: a `Session` value only
//! exists once the transport has been opened and authenticated, so it is
//! born Connected. A session never leaves Failed; recovery means building a
//! fresh session through the reconnect coordinator.
//!
//! # Command queue
//!
//! SSH sessions are not assumed to multiplex safely, so `exec` holds the
//! session's `command_gate` for the whole round trip. Concurrent callers
//! queue and run strictly one at a time; keepalive probes share the same
//! gate, so a burst of user commands delays (but never skips) the next
//! probe.

use std::fmt;
use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU8, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ConnectionParameters;
use crate::error::SessionError;
use crate::mount::MountRecord;
use crate::transport::Transport;
use crate::types::{ExecOutput, ServerIdentity, SessionStatus};

/// Lifecycle states of a session. Stored as an atomic so status reads never
/// contend with command execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum SessionState {
    Connected = 0,
    Disconnecting = 1,
    Disconnected = 2,
    Failed = 3,
}

impl SessionState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Connected,
            1 => Self::Disconnecting,
            2 => Self::Disconnected,
            _ => Self::Failed,
        }
    }
}

/// One live session: transport handle, state, activity tracking, and the
/// mounts layered on top of it.
pub struct Session {
    params: ConnectionParameters,
    transport: Box<dyn Transport>,
    state: AtomicU8,
    connected_at: DateTime<Utc>,
    last_activity_ms: AtomicI64,
    keepalive_failures: AtomicU32,
    command_gate: Mutex<()>,
    pub(crate) mounts: DashMap<String, MountRecord>,
    cancel: CancellationToken,
}

// The transport handle is opaque, so the derive is unavailable; the
// credential stays out of the output either way.
impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("identity", self.identity())
            .field("state", &self.state())
            .field("mounts", &self.mounts.len())
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Wrap a freshly opened transport. The session starts Connected.
    pub(crate) fn new(params: ConnectionParameters, transport: Box<dyn Transport>) -> Self {
        let now = Utc::now();
        Self {
            params,
            transport,
            state: AtomicU8::new(SessionState::Connected as u8),
            connected_at: now,
            last_activity_ms: AtomicI64::new(now.timestamp_millis()),
            keepalive_failures: AtomicU32::new(0),
            command_gate: Mutex::new(()),
            mounts: DashMap::new(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn identity(&self) -> &ServerIdentity {
        &self.params.identity
    }

    pub(crate) fn params(&self) -> &ConnectionParameters {
        &self.params
    }

    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn is_connected(&self) -> bool {
        self.state() == SessionState::Connected
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    pub fn last_activity_at(&self) -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp_millis(self.last_activity_ms.load(Ordering::SeqCst))
            .unwrap_or(self.connected_at)
    }

    /// Token cancelled as soon as the session leaves Connected, for any
    /// reason. The keepalive monitor parks on a child of it.
    pub(crate) fn cancel_token(&self) -> CancellationToken {
        self.cancel.child_token()
    }

    fn touch(&self) {
        self.last_activity_ms
            .store(Utc::now().timestamp_millis(), Ordering::SeqCst);
    }

    fn transition(&self, from: SessionState, to: SessionState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Run a command through the serialized execution queue.
    ///
    /// Only valid while Connected; the state is re-checked after queueing
    /// because a predecessor may have lost the connection while this call
    /// waited its turn. A `Timeout` leaves the state untouched, since the
    /// connection may still be serviceable; `ConnectionLost` marks the
    /// session Failed.
    pub async fn exec(
        &self,
        command: &str,
        timeout: Duration,
    ) -> Result<ExecOutput, SessionError> {
        if !self.is_connected() {
            return Err(SessionError::NotConnected {
                identity: self.identity().clone(),
            });
        }

        let _gate = self.command_gate.lock().await;
        if !self.is_connected() {
            return Err(SessionError::NotConnected {
                identity: self.identity().clone(),
            });
        }

        match self.transport.exec(command, timeout).await {
            Ok(output) => {
                self.touch();
                Ok(output)
            }
            Err(e @ SessionError::ConnectionLost { .. }) => {
                warn!(identity = %self.identity(), "connection lost mid-command");
                self.mark_failed("connection lost");
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    /// `exec` with the session's configured default timeout.
    pub async fn run(&self, command: &str) -> Result<ExecOutput, SessionError> {
        self.exec(command, self.params.tuning.exec_timeout).await
    }

    /// Mark the session dead. Terminal; idempotent from any state. Fails
    /// every in-flight mount with `reason` and cancels the keepalive
    /// monitor, which reacts by removing the registry entry.
    pub(crate) fn mark_failed(&self, reason: &str) {
        if self.transition(SessionState::Connected, SessionState::Failed) {
            info!(identity = %self.identity(), "session marked failed");
            self.fail_all_mounts(reason);
        }
        self.cancel.cancel();
    }

    /// Begin an orderly teardown. Returns whether this call won the
    /// Connected -> Disconnecting transition (a Failed session stays
    /// Failed). Cancels the keepalive monitor either way.
    pub(crate) fn begin_disconnect(&self) -> bool {
        let won = self.transition(SessionState::Connected, SessionState::Disconnecting);
        self.cancel.cancel();
        won
    }

    pub(crate) fn finish_disconnect(&self) {
        self.transition(SessionState::Disconnecting, SessionState::Disconnected);
        debug!(identity = %self.identity(), "session disconnected");
    }

    pub(crate) async fn close_transport(&self) {
        self.transport.close().await;
    }

    /// Consecutive keepalive failures observed so far.
    pub fn keepalive_failures(&self) -> u32 {
        self.keepalive_failures.load(Ordering::SeqCst)
    }

    pub(crate) fn reset_keepalive_failures(&self) {
        self.keepalive_failures.store(0, Ordering::SeqCst);
    }

    /// Record one keepalive failure, returning the new consecutive count.
    pub(crate) fn record_keepalive_failure(&self) -> u32 {
        self.keepalive_failures.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Point-in-time snapshot for the API layer.
    pub fn status(&self) -> SessionStatus {
        SessionStatus {
            identity: self.identity().clone(),
            connected: self.is_connected(),
            connected_at: Some(self.connected_at.to_rfc3339()),
            last_activity_at: Some(self.last_activity_at().to_rfc3339()),
            mounts: self.mounts.iter().map(|e| e.value().clone()).collect(),
        }
    }
}
