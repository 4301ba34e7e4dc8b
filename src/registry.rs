//! Process-wide session registry.
//!
//! The registry owns every live session, keyed by [`ServerIdentity`], and
//! guarantees at most one live session per identity. The compound
//! check-then-act of connect/disconnect is serialized by a per-identity
//! async mutex (double-checked so concurrent callers for the same host
//! collapse into a single transport open), while operations on different
//! identities never contend.
//!
//! This is an explicitly constructed value handed to the API layer at
//! startup; there is no global accessor. Clone it freely: clones share the
//! same state.

use std::sync::Arc;

use dashmap::DashMap;
use futures::future::join_all;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::config::ConnectionParameters;
use crate::error::SessionError;
use crate::keepalive;
use crate::mount::MountRecord;
use crate::session::Session;
use crate::transport::{SshTransportFactory, TransportFactory};
use crate::types::{ExecOutput, ServerIdentity, SessionStatus};

#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    sessions: DashMap<ServerIdentity, Arc<Session>>,
    /// Per-identity locks covering connect/disconnect. Entries are tiny
    /// and stay around for hosts we've seen; the set of managed servers is
    /// bounded by the dashboard's inventory.
    connect_locks: DashMap<ServerIdentity, Arc<Mutex<()>>>,
    factory: Arc<dyn TransportFactory>,
}

impl SessionRegistry {
    /// Registry over an injected transport factory. Tests use this with
    /// in-memory transports.
    pub fn new(factory: Arc<dyn TransportFactory>) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                sessions: DashMap::new(),
                connect_locks: DashMap::new(),
                factory,
            }),
        }
    }

    /// Registry backed by real SSH transports.
    pub fn with_ssh() -> Self {
        Self::new(Arc::new(SshTransportFactory))
    }

    fn identity_lock(&self, identity: &ServerIdentity) -> Arc<Mutex<()>> {
        self.inner
            .connect_locks
            .entry(identity.clone())
            .or_default()
            .clone()
    }

    /// The live (Connected) session for an identity, if any.
    pub fn session(&self, identity: &ServerIdentity) -> Option<Arc<Session>> {
        let session = self
            .inner
            .sessions
            .get(identity)
            .map(|entry| entry.value().clone())?;
        session.is_connected().then_some(session)
    }

    /// Open (or reuse) the session for `params.identity`.
    ///
    /// Idempotent: a live session is returned unchanged without
    /// re-authenticating. On open failure nothing is registered and the
    /// transport error surfaces as-is.
    pub async fn connect(
        &self,
        params: ConnectionParameters,
    ) -> Result<Arc<Session>, SessionError> {
        let identity = params.identity.clone();

        // Fast path outside the lock
        if let Some(session) = self.session(&identity) {
            return Ok(session);
        }

        params.tuning.validate()?;

        let lock = self.identity_lock(&identity);
        let _guard = lock.lock().await;

        // Re-check: another caller may have finished connecting while we
        // waited on the lock.
        if let Some(session) = self.session(&identity) {
            return Ok(session);
        }

        info!(%identity, username = %params.credential.username, "opening session");
        let transport = self.inner.factory.open(&params).await?;
        let session = Arc::new(Session::new(params, transport));

        // A dead entry (Failed but not yet reaped) is superseded here
        if let Some(stale) = self.inner.sessions.insert(identity.clone(), session.clone()) {
            warn!(%identity, "superseding stale session entry");
            stale.fail_all_mounts("session superseded");
            stale.close_transport().await;
        }

        keepalive::spawn_monitor(self.clone(), session.clone());
        info!(%identity, "session connected");
        Ok(session)
    }

    /// Probe connectivity without registering anything: open a transport,
    /// run a trivial command, close.
    pub async fn test_connection(&self, params: &ConnectionParameters) -> Result<(), SessionError> {
        params.tuning.validate()?;
        let transport = self.inner.factory.open(params).await?;
        let result = transport
            .exec("echo 1", keepalive::probe_timeout(params.tuning.exec_timeout))
            .await;
        transport.close().await;
        result.map(|_| ())
    }

    /// Tear down the session for an identity. A no-op success when none
    /// exists; close failures are logged, never surfaced, since the caller
    /// cannot fix the remote side anyway.
    pub async fn disconnect(&self, identity: &ServerIdentity) {
        let lock = self.identity_lock(identity);
        let _guard = lock.lock().await;

        let Some((_, session)) = self.inner.sessions.remove(identity) else {
            return;
        };
        self.teardown(session, "disconnect requested").await;
        info!(%identity, "session removed");
    }

    /// Reap a session the keepalive monitor declared dead. Removes the
    /// entry only if it still holds a non-live session, so a fresh
    /// reconnect can never be torn down by a stale monitor.
    pub(crate) async fn remove_failed(&self, identity: &ServerIdentity) {
        let removed = self
            .inner
            .sessions
            .remove_if(identity, |_, session| !session.is_connected());
        if let Some((_, session)) = removed {
            self.teardown(session, "keepalive failed").await;
            info!(%identity, "failed session removed");
        }
    }

    async fn teardown(&self, session: Arc<Session>, reason: &str) {
        session.begin_disconnect();
        session.fail_all_mounts(reason);
        session.close_transport().await;
        session.finish_disconnect();
    }

    /// Side-effect-free status snapshot; unknown identities report
    /// `connected: false`.
    pub fn status(&self, identity: &ServerIdentity) -> SessionStatus {
        match self.inner.sessions.get(identity) {
            Some(entry) => entry.value().status(),
            None => SessionStatus::disconnected(identity.clone()),
        }
    }

    /// Identities that currently have a Connected session.
    pub fn list_active(&self) -> Vec<ServerIdentity> {
        self.inner
            .sessions
            .iter()
            .filter(|entry| entry.value().is_connected())
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Run a command on an identity's live session with the session's
    /// default timeout.
    pub async fn execute(
        &self,
        identity: &ServerIdentity,
        command: &str,
    ) -> Result<ExecOutput, SessionError> {
        let session = self.require_session(identity)?;
        session.run(command).await
    }

    /// Run a command with an explicit deadline.
    pub async fn execute_with_timeout(
        &self,
        identity: &ServerIdentity,
        command: &str,
        timeout: std::time::Duration,
    ) -> Result<ExecOutput, SessionError> {
        let session = self.require_session(identity)?;
        session.exec(command, timeout).await
    }

    /// Manual liveness probe, same no-op command the monitor uses.
    pub async fn ping(&self, identity: &ServerIdentity) -> Result<(), SessionError> {
        let session = self.require_session(identity)?;
        let timeout = keepalive::probe_timeout(session.params().tuning.exec_timeout);
        session.exec(keepalive::KEEPALIVE_COMMAND, timeout).await?;
        Ok(())
    }

    /// Drive a disk-image mount on an identity's live session.
    pub async fn mount(
        &self,
        identity: &ServerIdentity,
        vm_name: &str,
        disk_selector: &str,
        mount_path: &str,
    ) -> Result<MountRecord, SessionError> {
        let session = self.require_session(identity)?;
        session.mount(vm_name, disk_selector, mount_path).await
    }

    /// Remove a mount record, best-effort unmounting on the remote side.
    pub async fn unmount(
        &self,
        identity: &ServerIdentity,
        mount_path: &str,
    ) -> Result<(), SessionError> {
        let session = self.require_session(identity)?;
        session.unmount(mount_path).await
    }

    /// Snapshot of the mount records on an identity's live session.
    pub fn list_mounts(&self, identity: &ServerIdentity) -> Result<Vec<MountRecord>, SessionError> {
        let session = self.require_session(identity)?;
        Ok(session.list_mounts())
    }

    fn require_session(&self, identity: &ServerIdentity) -> Result<Arc<Session>, SessionError> {
        self.session(identity)
            .ok_or_else(|| SessionError::NotConnected {
                identity: identity.clone(),
            })
    }

    /// Drain every registered session. Called at process shutdown so no
    /// socket is abandoned.
    pub async fn shutdown(&self) {
        let identities: Vec<ServerIdentity> = self
            .inner
            .sessions
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        if identities.is_empty() {
            return;
        }
        info!(count = identities.len(), "draining sessions for shutdown");
        join_all(identities.iter().map(|identity| self.disconnect(identity))).await;
    }
}
