//! Error taxonomy for session management.
//!
//! Every component surfaces these typed errors upward without retrying
//! locally. Retry policy lives in exactly two places: the reconnect
//! coordinator (bounded, fixed delay, transient errors only) and the
//! keepalive monitor (bounded failure count before declaring a session
//! dead).
//!
//! The transient/permanent split matters for reconnection: authentication
//! and configuration failures will not resolve by retrying, while network
//! hiccups, timeouts, and dropped connections may. Auth failures are never
//! retried to avoid account lockouts.

use std::time::Duration;

use thiserror::Error;

use crate::types::ServerIdentity;

#[derive(Debug, Error)]
pub enum SessionError {
    /// Credentials were rejected by the remote host. Never retried.
    #[error("authentication failed for {username}@{identity}")]
    Auth {
        identity: ServerIdentity,
        username: String,
    },

    /// TCP or SSH handshake level failure before a session existed.
    #[error("network error talking to {identity}: {message}")]
    Network {
        identity: ServerIdentity,
        message: String,
    },

    /// An operation did not finish within its deadline. The underlying
    /// connection may still be serviceable.
    #[error("operation timed out after {timeout:?}")]
    Timeout { timeout: Duration },

    /// The connection dropped mid-session. Forces the session to Failed.
    #[error("connection to {identity} lost")]
    ConnectionLost { identity: ServerIdentity },

    /// Operation attempted against an identity with no live session.
    /// Callers are expected to reconnect first.
    #[error("no live session for {identity}")]
    NotConnected { identity: ServerIdentity },

    /// The remote side accepted the connection but the command could not
    /// be started or tracked.
    #[error("command execution failed on {identity}: {message}")]
    Exec {
        identity: ServerIdentity,
        message: String,
    },

    /// No mount record exists at the given path for that session.
    #[error("no mount at {mount_path} on {identity}")]
    MountNotFound {
        identity: ServerIdentity,
        mount_path: String,
    },

    /// The reconnect coordinator consumed every retry without success.
    #[error("reconnect to {identity} exhausted after {attempts} attempt(s): {source}")]
    ReconnectExhausted {
        identity: ServerIdentity,
        attempts: u32,
        #[source]
        source: Box<SessionError>,
    },

    /// Connection tuning rejected at session-creation time.
    #[error("invalid connection tuning: {message}")]
    InvalidConfig { message: String },
}

impl SessionError {
    /// Whether the reconnect coordinator may retry after this error.
    ///
    /// Transient network conditions are worth another attempt; credential
    /// and configuration problems are not.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Network { .. } | Self::Timeout { .. } | Self::ConnectionLost { .. }
        )
    }
}
