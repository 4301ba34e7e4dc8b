//! Bounded reconnection on top of the registry.
//!
//! The coordinator remembers the connection parameters of every session it
//! opened, so a caller that notices a dead identity can just say
//! `ensure_connected` and get the session back without re-supplying
//! credentials. Retries are bounded and fixed-delay, never exponential:
//! `max_retries` (default 3) additional attempts spaced by `retry_delay`
//! (default 2000 ms). Only transient errors retry; a rejected credential
//! surfaces immediately. Exhausting the budget yields
//! [`SessionError::ReconnectExhausted`] carrying the final cause, so the
//! caller always gets something user-reportable rather than a silent stall.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use backon::{ConstantBuilder, Retryable};
use dashmap::DashMap;
use tracing::{info, warn};

use crate::config::ConnectionParameters;
use crate::error::SessionError;
use crate::registry::SessionRegistry;
use crate::session::Session;
use crate::types::ServerIdentity;

pub struct ReconnectCoordinator {
    registry: SessionRegistry,
    cached: DashMap<ServerIdentity, ConnectionParameters>,
}

impl ReconnectCoordinator {
    pub fn new(registry: SessionRegistry) -> Self {
        Self {
            registry,
            cached: DashMap::new(),
        }
    }

    /// Connect through the registry and cache the parameters for later
    /// `ensure_connected` calls. Nothing is cached on failure.
    pub async fn connect(
        &self,
        params: ConnectionParameters,
    ) -> Result<Arc<Session>, SessionError> {
        let session = self.registry.connect(params.clone()).await?;
        self.cached.insert(params.identity.clone(), params);
        Ok(session)
    }

    /// Drop the cached credentials for an identity.
    pub fn forget(&self, identity: &ServerIdentity) {
        self.cached.remove(identity);
    }

    /// Make sure a live session exists for `identity`, reconnecting with
    /// the cached parameters if it does not.
    ///
    /// Already-connected identities return immediately with no network
    /// traffic. Without cached parameters there is nothing to retry with,
    /// so the caller gets `NotConnected` and must supply credentials via
    /// [`connect`](Self::connect).
    pub async fn ensure_connected(
        &self,
        identity: &ServerIdentity,
    ) -> Result<Arc<Session>, SessionError> {
        if let Some(session) = self.registry.session(identity) {
            return Ok(session);
        }

        let params = self
            .cached
            .get(identity)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| SessionError::NotConnected {
                identity: identity.clone(),
            })?;

        let delay = params.tuning.retry_delay;
        let max_retries = params.tuning.max_retries;
        let attempts = AtomicU32::new(0);

        info!(%identity, "reconnecting");
        let result = (|| async {
            let attempt = attempts.fetch_add(1, Ordering::SeqCst);
            if attempt > 0 {
                warn!(%identity, attempt, "reconnect retry");
            }
            self.registry.connect(params.clone()).await
        })
        .retry(
            ConstantBuilder::default()
                .with_delay(delay)
                .with_max_times(max_retries as usize),
        )
        .when(SessionError::is_transient)
        .notify(|err, dur| {
            warn!(error = %err, "reconnect attempt failed, next try in {:?}", dur);
        })
        .await;

        let total_attempts = attempts.load(Ordering::SeqCst);
        match result {
            Ok(session) => {
                info!(%identity, attempts = total_attempts, "reconnected");
                Ok(session)
            }
            Err(e) if e.is_transient() => Err(SessionError::ReconnectExhausted {
                identity: identity.clone(),
                attempts: total_attempts,
                source: Box::new(e),
            }),
            // Auth and config failures surface as themselves: nothing was
            // exhausted, retrying was never on the table.
            Err(e) => Err(e),
        }
    }
}
