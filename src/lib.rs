//! Remote host session management for operator dashboards.
//!
//! One long-lived authenticated SSH session per managed server, with
//! serialized command execution, keepalive-based failure detection,
//! bounded reconnection, and disk-image mount tracking layered on top.
//! The crate is a library: the HTTP API layer constructs one
//! [`SessionRegistry`] (plus a [`ReconnectCoordinator`] around it) at
//! startup and calls into it per request.
//!
//! This crate is organized into the following modules:
//!
//! - `types`: identities, credentials, and the boundary snapshot types
//! - `config`: connection tuning with environment variable support
//! - `error`: the session error taxonomy and transient classification
//! - `transport`: the SSH transport adapter and its injection seam
//! - `session`: per-server session state machine and command queue
//! - `registry`: the process-wide session registry
//! - `keepalive`: per-session background liveness probing
//! - `reconnect`: bounded fixed-delay reconnection
//! - `mount`: disk-image mount lifecycle tracking
//!
//! ```no_run
//! use hostlink::{
//!     ConnectionParameters, ConnectionTuning, Credential, ReconnectCoordinator,
//!     ServerIdentity, SessionRegistry,
//! };
//!
//! # async fn example() -> Result<(), hostlink::SessionError> {
//! let registry = SessionRegistry::with_ssh();
//! let coordinator = ReconnectCoordinator::new(registry.clone());
//!
//! let params = ConnectionParameters::new(
//!     ServerIdentity::new("backup01.lan:22"),
//!     Credential::new("operator", std::env::var("OPERATOR_PASSWORD").unwrap_or_default()),
//!     ConnectionTuning::from_env(),
//! );
//! coordinator.connect(params).await?;
//!
//! let identity = ServerIdentity::new("backup01.lan:22");
//! let output = registry.execute(&identity, "uname -a").await?;
//! println!("{}", output.stdout);
//!
//! registry.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub(crate) mod keepalive;
pub mod mount;
pub mod reconnect;
pub mod registry;
pub mod session;
pub mod transport;
pub mod types;

#[cfg(test)]
pub(crate) mod testutil;

pub use config::{ConnectionParameters, ConnectionTuning};
pub use error::SessionError;
pub use mount::{MountPhase, MountRecord};
pub use reconnect::ReconnectCoordinator;
pub use registry::SessionRegistry;
pub use session::{Session, SessionState};
pub use transport::{SshTransportFactory, Transport, TransportFactory};
pub use types::{Credential, Envelope, ExecOutput, ServerIdentity, SessionStatus};
