//! Connection tuning configuration.
//!
//! Tuning values resolve once at startup with a two-tier priority:
//!
//! 1. **Environment variable** - Value from the environment, if set and parseable
//! 2. **Default** - Built-in default value
//!
//! The resolved [`ConnectionTuning`] is a closed struct handed to the
//! registry as-is; nothing re-reads the environment per call. Validation
//! happens at session-creation time, not at construction, so a bad value
//! surfaces on the operation that would have used it.
//!
//! # Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `HOSTLINK_READY_TIMEOUT_SECS` | 20s | TCP connect + handshake timeout |
//! | `HOSTLINK_EXEC_TIMEOUT_SECS` | 120s | Command execution timeout |
//! | `HOSTLINK_KEEPALIVE_INTERVAL_SECS` | 30s | Delay between keepalive probes |
//! | `HOSTLINK_KEEPALIVE_COUNT_MAX` | 10 | Consecutive keepalive failures before the session is declared dead |
//! | `HOSTLINK_RETRY_DELAY_MS` | 2000ms | Fixed delay between reconnect attempts |
//! | `HOSTLINK_MAX_RETRIES` | 3 | Reconnect attempts after the first failure |
//! | `HOSTLINK_COMPRESSION` | false | Enable zlib compression |

use std::env;
use std::time::Duration;

use crate::error::SessionError;
use crate::types::{Credential, ServerIdentity};

/// Default TCP connect + handshake timeout in seconds
pub(crate) const DEFAULT_READY_TIMEOUT_SECS: u64 = 20;

/// Default command execution timeout in seconds
pub(crate) const DEFAULT_EXEC_TIMEOUT_SECS: u64 = 120;

/// Default keepalive probe interval in seconds
pub(crate) const DEFAULT_KEEPALIVE_INTERVAL_SECS: u64 = 30;

/// Default consecutive keepalive failures tolerated before teardown
pub(crate) const DEFAULT_KEEPALIVE_COUNT_MAX: u32 = 10;

/// Default fixed delay between reconnect attempts in milliseconds
pub(crate) const DEFAULT_RETRY_DELAY_MS: u64 = 2000;

/// Default reconnect attempts after the first failure
pub(crate) const DEFAULT_MAX_RETRIES: u32 = 3;

const READY_TIMEOUT_ENV_VAR: &str = "HOSTLINK_READY_TIMEOUT_SECS";
const EXEC_TIMEOUT_ENV_VAR: &str = "HOSTLINK_EXEC_TIMEOUT_SECS";
const KEEPALIVE_INTERVAL_ENV_VAR: &str = "HOSTLINK_KEEPALIVE_INTERVAL_SECS";
const KEEPALIVE_COUNT_MAX_ENV_VAR: &str = "HOSTLINK_KEEPALIVE_COUNT_MAX";
const RETRY_DELAY_MS_ENV_VAR: &str = "HOSTLINK_RETRY_DELAY_MS";
const MAX_RETRIES_ENV_VAR: &str = "HOSTLINK_MAX_RETRIES";
const COMPRESSION_ENV_VAR: &str = "HOSTLINK_COMPRESSION";

fn resolve_u64(var: &str, default: u64) -> u64 {
    if let Ok(raw) = env::var(var)
        && let Ok(value) = raw.parse::<u64>()
    {
        return value;
    }
    default
}

fn resolve_u32(var: &str, default: u32) -> u32 {
    if let Ok(raw) = env::var(var)
        && let Ok(value) = raw.parse::<u32>()
    {
        return value;
    }
    default
}

fn resolve_bool(var: &str, default: bool) -> bool {
    if let Ok(raw) = env::var(var) {
        return matches!(raw.to_lowercase().as_str(), "1" | "true" | "yes" | "on");
    }
    default
}

/// Protocol and retry tuning for one session.
///
/// Immutable once a session has been created from it. The algorithm lists
/// are allow-lists applied against russh's default preference order; `None`
/// means "use the defaults unchanged".
#[derive(Debug, Clone)]
pub struct ConnectionTuning {
    pub ready_timeout: Duration,
    pub exec_timeout: Duration,
    pub keepalive_interval: Duration,
    pub keepalive_count_max: u32,
    pub retry_delay: Duration,
    pub max_retries: u32,
    pub kex_algorithms: Option<Vec<String>>,
    pub cipher_algorithms: Option<Vec<String>>,
    pub host_key_algorithms: Option<Vec<String>>,
    pub mac_algorithms: Option<Vec<String>>,
    pub compression: bool,
}

impl Default for ConnectionTuning {
    fn default() -> Self {
        Self {
            ready_timeout: Duration::from_secs(DEFAULT_READY_TIMEOUT_SECS),
            exec_timeout: Duration::from_secs(DEFAULT_EXEC_TIMEOUT_SECS),
            keepalive_interval: Duration::from_secs(DEFAULT_KEEPALIVE_INTERVAL_SECS),
            keepalive_count_max: DEFAULT_KEEPALIVE_COUNT_MAX,
            retry_delay: Duration::from_millis(DEFAULT_RETRY_DELAY_MS),
            max_retries: DEFAULT_MAX_RETRIES,
            kex_algorithms: None,
            cipher_algorithms: None,
            host_key_algorithms: None,
            mac_algorithms: None,
            compression: false,
        }
    }
}

impl ConnectionTuning {
    /// Resolve tuning from the environment, falling back to defaults.
    ///
    /// Intended to be called once at startup; the result is shared for the
    /// process lifetime.
    pub fn from_env() -> Self {
        Self {
            ready_timeout: Duration::from_secs(resolve_u64(
                READY_TIMEOUT_ENV_VAR,
                DEFAULT_READY_TIMEOUT_SECS,
            )),
            exec_timeout: Duration::from_secs(resolve_u64(
                EXEC_TIMEOUT_ENV_VAR,
                DEFAULT_EXEC_TIMEOUT_SECS,
            )),
            keepalive_interval: Duration::from_secs(resolve_u64(
                KEEPALIVE_INTERVAL_ENV_VAR,
                DEFAULT_KEEPALIVE_INTERVAL_SECS,
            )),
            keepalive_count_max: resolve_u32(
                KEEPALIVE_COUNT_MAX_ENV_VAR,
                DEFAULT_KEEPALIVE_COUNT_MAX,
            ),
            retry_delay: Duration::from_millis(resolve_u64(
                RETRY_DELAY_MS_ENV_VAR,
                DEFAULT_RETRY_DELAY_MS,
            )),
            max_retries: resolve_u32(MAX_RETRIES_ENV_VAR, DEFAULT_MAX_RETRIES),
            compression: resolve_bool(COMPRESSION_ENV_VAR, false),
            ..Self::default()
        }
    }

    /// Reject tuning that would wedge a session.
    ///
    /// Run by the registry before any network I/O happens for a new
    /// session.
    pub fn validate(&self) -> Result<(), SessionError> {
        if self.ready_timeout.is_zero() {
            return invalid("ready_timeout must be nonzero");
        }
        if self.exec_timeout.is_zero() {
            return invalid("exec_timeout must be nonzero");
        }
        if self.keepalive_interval.is_zero() {
            return invalid("keepalive_interval must be nonzero");
        }
        if self.keepalive_count_max == 0 {
            return invalid("keepalive_count_max must be at least 1");
        }
        for (name, list) in [
            ("kex_algorithms", &self.kex_algorithms),
            ("cipher_algorithms", &self.cipher_algorithms),
            ("host_key_algorithms", &self.host_key_algorithms),
            ("mac_algorithms", &self.mac_algorithms),
        ] {
            if let Some(entries) = list {
                if entries.is_empty() {
                    return invalid(&format!("{name} allow-list is empty"));
                }
                if entries.iter().any(|e| e.trim().is_empty()) {
                    return invalid(&format!("{name} allow-list contains a blank entry"));
                }
            }
        }
        Ok(())
    }
}

fn invalid(message: &str) -> Result<(), SessionError> {
    Err(SessionError::InvalidConfig {
        message: message.to_string(),
    })
}

/// Everything needed to open one session: who, where, and how.
#[derive(Debug, Clone)]
pub struct ConnectionParameters {
    pub identity: ServerIdentity,
    pub credential: Credential,
    pub tuning: ConnectionTuning,
}

impl ConnectionParameters {
    pub fn new(identity: ServerIdentity, credential: Credential, tuning: ConnectionTuning) -> Self {
        Self {
            identity,
            credential,
            tuning,
        }
    }
}
