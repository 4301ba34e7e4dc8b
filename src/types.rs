//! Core identity and boundary types shared across the crate.
//!
//! The snapshot types (`SessionStatus`, `Envelope`) are what the HTTP API
//! layer serializes; everything else stays in-process. Timestamps cross the
//! boundary as RFC3339 strings.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::SessionError;
use crate::mount::MountRecord;

/// Key distinguishing one manageable remote host from another.
///
/// Usually a hostname or `host:port` address. The registry guarantees at
/// most one live session per identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServerIdentity(String);

impl ServerIdentity {
    pub fn new(identity: impl Into<String>) -> Self {
        Self(identity.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ServerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ServerIdentity {
    fn from(identity: &str) -> Self {
        Self(identity.to_string())
    }
}

/// Username and secret used for password authentication.
///
/// Held in memory only, for the lifetime of a session plus the reconnect
/// coordinator's cache. `Debug` redacts the secret and the type is
/// deliberately not serializable, so it can never leak into a log line or
/// an API response.
#[derive(Clone)]
pub struct Credential {
    pub username: String,
    secret: String,
}

impl Credential {
    pub fn new(username: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            secret: secret.into(),
        }
    }

    pub(crate) fn secret(&self) -> &str {
        &self.secret
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("username", &self.username)
            .field("secret", &"<redacted>")
            .finish()
    }
}

/// Output of one remote command execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecOutput {
    /// Exit status reported by the remote shell, or -1 if the server never
    /// sent one.
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Point-in-time view of one session, safe to hand to the API layer.
///
/// Unknown identities yield `connected: false` with no timestamps rather
/// than an error.
#[derive(Debug, Clone, Serialize)]
pub struct SessionStatus {
    pub identity: ServerIdentity,
    pub connected: bool,
    /// RFC3339, present once the session reached Connected.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connected_at: Option<String>,
    /// RFC3339, refreshed by every successful exec or keepalive.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_activity_at: Option<String>,
    pub mounts: Vec<MountRecord>,
}

impl SessionStatus {
    /// Status for an identity the registry has never seen (or has already
    /// removed).
    pub fn disconnected(identity: ServerIdentity) -> Self {
        Self {
            identity,
            connected: false,
            connected_at: None,
            last_activity_at: None,
            mounts: Vec::new(),
        }
    }
}

/// Uniform response envelope the API layer wraps every result in.
///
/// Business-level failures travel as `{ success: false, error }` with the
/// error's display text; the error never carries credential material.
#[derive(Debug, Clone, Serialize)]
pub struct Envelope<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T> Envelope<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn fail(error: impl fmt::Display) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error.to_string()),
        }
    }
}

impl<T> From<Result<T, SessionError>> for Envelope<T> {
    fn from(result: Result<T, SessionError>) -> Self {
        match result {
            Ok(data) => Self::ok(data),
            Err(e) => Self::fail(e),
        }
    }
}
