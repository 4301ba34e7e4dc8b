//! Transport adapter: one authenticated remote shell per host.
//!
//! This module handles the SSH connection lifecycle:
//!
//! 1. **Address Parsing**: Parse the server identity into host and port.
//!    Supports `host:port` format with default port 22 if not specified.
//!
//! 2. **Client Configuration**: Build the russh client configuration from
//!    [`ConnectionTuning`], applying the algorithm allow-lists against
//!    russh's default preference order and the compression flag.
//!
//! 3. **Connection + Authentication**: TCP connect with the ready timeout,
//!    then password authentication.
//!
//! 4. **Command Execution**: Open a channel per command, collect stdout,
//!    stderr and the exit status, enforce the caller-supplied deadline.
//!
//! The [`Transport`]/[`TransportFactory`] trait pair is the seam the rest
//! of the crate depends on; tests substitute in-memory implementations and
//! the registry stays oblivious. Errors map into the crate taxonomy here:
//! channel-level failures become `ConnectionLost`, handshake failures
//! `Network`, rejected credentials `Auth`, expired deadlines `Timeout`.
//! Command-level timeouts deliberately do NOT tear the connection down:
//! the channel is closed and the session stays usable.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::{ChannelMsg, Disconnect, client, keys};
use tracing::{debug, warn};

use crate::config::{ConnectionParameters, ConnectionTuning};
use crate::error::SessionError;
use crate::types::{ExecOutput, ServerIdentity};

/// One established, authenticated remote-shell connection.
///
/// Implementations must be thread-safe (`Send + Sync`) for use across
/// async tasks. Serialization of concurrent `exec` calls is the owning
/// session's job, not the transport's; a transport handle is owned
/// exclusively by one session.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Run a command and wait for its completion or the deadline.
    async fn exec(&self, command: &str, timeout: Duration) -> Result<ExecOutput, SessionError>;

    /// Release the connection. Idempotent and never fails observably;
    /// remote-side close problems are logged, not surfaced.
    async fn close(&self);
}

/// Opens transports from connection parameters.
///
/// The registry holds one factory for its lifetime; tests inject mocks to
/// count and script `open` calls.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn open(
        &self,
        params: &ConnectionParameters,
    ) -> Result<Box<dyn Transport>, SessionError>;
}

/// Client handler for russh that accepts all host keys.
///
/// Equivalent to `StrictHostKeyChecking=no`. Production deployments should
/// extend this to verify against known_hosts.
pub struct SshClientHandler;

impl client::Handler for SshClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &keys::PublicKey,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }
}

/// Parse a server identity into host and port components.
///
/// Supports `host:port` and bare `host` (default port 22). Uses
/// `rsplit_once` so IPv6 forms like `[::1]:22` keep their brackets intact.
pub(crate) fn parse_address(identity: &ServerIdentity) -> Result<(String, u16), SessionError> {
    let address = identity.as_str();
    if let Some((host, port_str)) = address.rsplit_once(':') {
        let port = port_str
            .parse::<u16>()
            .map_err(|e| SessionError::InvalidConfig {
                message: format!("invalid port in {address}: {e}"),
            })?;
        Ok((host.to_string(), port))
    } else {
        Ok((address.to_string(), 22))
    }
}

/// Filter russh's default algorithm preference list by an allow-list.
///
/// Order of the defaults is preserved; an allow-list that eliminates every
/// default is a configuration error.
fn restrict_names<N: Clone + AsRef<str>>(
    defaults: &[N],
    allowed: &[String],
    kind: &str,
) -> Result<Vec<N>, SessionError> {
    let picked: Vec<N> = defaults
        .iter()
        .filter(|name| allowed.iter().any(|a| a.as_str() == name.as_ref()))
        .cloned()
        .collect();
    if picked.is_empty() {
        return Err(SessionError::InvalidConfig {
            message: format!("no supported {kind} algorithms left after applying allow-list"),
        });
    }
    Ok(picked)
}

/// Build the russh client configuration from tuning.
///
/// Inactivity timeout stays disabled: sessions are long-lived by design and
/// liveness is owned by the keepalive monitor, which issues real commands
/// through the session's serialized exec path rather than protocol-level
/// pings.
pub(crate) fn build_client_config(
    tuning: &ConnectionTuning,
) -> Result<Arc<client::Config>, SessionError> {
    let mut preferred = russh::Preferred::default();

    preferred.compression = if tuning.compression {
        (&[russh::compression::ZLIB, russh::compression::NONE][..]).into()
    } else {
        (&[russh::compression::NONE][..]).into()
    };

    if let Some(allowed) = &tuning.kex_algorithms {
        preferred.kex = restrict_names(&preferred.kex, allowed, "key-exchange")?.into();
    }
    if let Some(allowed) = &tuning.cipher_algorithms {
        preferred.cipher = restrict_names(&preferred.cipher, allowed, "cipher")?.into();
    }
    if let Some(allowed) = &tuning.mac_algorithms {
        preferred.mac = restrict_names(&preferred.mac, allowed, "MAC")?.into();
    }
    if let Some(allowed) = &tuning.host_key_algorithms {
        let picked: Vec<keys::Algorithm> = preferred
            .key
            .iter()
            .filter(|alg| {
                let name = alg.to_string();
                allowed.iter().any(|a| a.as_str() == name)
            })
            .cloned()
            .collect();
        if picked.is_empty() {
            return Err(SessionError::InvalidConfig {
                message: "no supported host-key algorithms left after applying allow-list"
                    .to_string(),
            });
        }
        preferred.key = picked.into();
    }

    Ok(Arc::new(client::Config {
        inactivity_timeout: None,
        keepalive_interval: None,
        preferred,
        ..Default::default()
    }))
}

/// russh-backed transport bound to one authenticated handle.
pub struct SshTransport {
    identity: ServerIdentity,
    handle: client::Handle<SshClientHandler>,
}

#[async_trait]
impl Transport for SshTransport {
    async fn exec(&self, command: &str, timeout: Duration) -> Result<ExecOutput, SessionError> {
        let mut channel = self.handle.channel_open_session().await.map_err(|e| {
            debug!(identity = %self.identity, error = %e, "channel open failed");
            SessionError::ConnectionLost {
                identity: self.identity.clone(),
            }
        })?;

        channel.exec(true, command).await.map_err(|e| {
            debug!(identity = %self.identity, error = %e, "exec request failed");
            SessionError::ConnectionLost {
                identity: self.identity.clone(),
            }
        })?;

        let mut stdout = Vec::with_capacity(4096);
        let mut stderr = Vec::with_capacity(1024);
        let mut exit_code: Option<u32> = None;

        let collected = tokio::time::timeout(timeout, async {
            loop {
                match channel.wait().await {
                    Some(ChannelMsg::Data { data }) => {
                        stdout.extend_from_slice(&data);
                    }
                    Some(ChannelMsg::ExtendedData { data, ext }) => {
                        // ext == 1 is stderr in the SSH protocol
                        if ext == 1 {
                            stderr.extend_from_slice(&data);
                        }
                    }
                    Some(ChannelMsg::ExitStatus { exit_status }) => {
                        exit_code = Some(exit_status);
                    }
                    Some(ChannelMsg::Eof) => {
                        // Keep waiting for the exit status if it hasn't arrived
                        if exit_code.is_some() {
                            break;
                        }
                    }
                    Some(ChannelMsg::Close) | None => {
                        break;
                    }
                    Some(_) => {
                        // Ignore other message types
                    }
                }
            }
        })
        .await;

        // Close the channel either way so the session stays usable
        let _ = channel.close().await;

        if collected.is_err() {
            warn!(
                identity = %self.identity,
                ?timeout,
                "command deadline expired, channel closed"
            );
            return Err(SessionError::Timeout { timeout });
        }

        Ok(ExecOutput {
            exit_code: exit_code.map(|c| c as i32).unwrap_or(-1),
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
        })
    }

    async fn close(&self) {
        if let Err(e) = self
            .handle
            .disconnect(Disconnect::ByApplication, "session closed", "en")
            .await
        {
            // Nothing the caller can do about the remote side here
            debug!(identity = %self.identity, error = %e, "disconnect notification failed");
        }
    }
}

/// Production factory: opens password-authenticated SSH transports.
pub struct SshTransportFactory;

#[async_trait]
impl TransportFactory for SshTransportFactory {
    async fn open(
        &self,
        params: &ConnectionParameters,
    ) -> Result<Box<dyn Transport>, SessionError> {
        let tuning = &params.tuning;
        let identity = params.identity.clone();

        let config = build_client_config(tuning)?;
        let (host, port) = parse_address(&identity)?;

        let connect_future = client::connect(config, (host.as_str(), port), SshClientHandler);
        let mut handle = tokio::time::timeout(tuning.ready_timeout, connect_future)
            .await
            .map_err(|_| SessionError::Timeout {
                timeout: tuning.ready_timeout,
            })?
            .map_err(|e| SessionError::Network {
                identity: identity.clone(),
                message: e.to_string(),
            })?;

        let auth = handle
            .authenticate_password(params.credential.username.as_str(), params.credential.secret())
            .await
            .map_err(|e| SessionError::Network {
                identity: identity.clone(),
                message: e.to_string(),
            })?;

        if !auth.success() {
            return Err(SessionError::Auth {
                identity,
                username: params.credential.username.clone(),
            });
        }

        debug!(identity = %identity, port, "transport opened");
        Ok(Box::new(SshTransport { identity, handle }))
    }
}
