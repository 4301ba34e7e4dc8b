//! In-memory transport doubles for the session, registry, and reconnect
//! tests.
//!
//! `MockTransport` replays a script of responses (defaulting to a clean
//! exit) and records every command it was asked to run, plus the maximum
//! number of overlapping `exec` calls it ever observed, which is how the
//! one-command-at-a-time invariant gets asserted. `MockFactory` counts
//! `open` calls and can be primed with failures for retry tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::config::{ConnectionParameters, ConnectionTuning};
use crate::error::SessionError;
use crate::transport::{Transport, TransportFactory};
use crate::types::{Credential, ExecOutput, ServerIdentity};

/// Install a log subscriber for a test run when `RUST_LOG` is set.
/// Safe to call from every test; later calls are no-ops.
pub(crate) fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

pub(crate) fn exec_ok() -> ExecOutput {
    ExecOutput {
        exit_code: 0,
        stdout: String::new(),
        stderr: String::new(),
    }
}

pub(crate) fn connection_parameters(host: &str) -> ConnectionParameters {
    params_with_tuning(host, ConnectionTuning::default())
}

pub(crate) fn params_with_tuning(host: &str, tuning: ConnectionTuning) -> ConnectionParameters {
    ConnectionParameters::new(
        ServerIdentity::new(host),
        Credential::new("operator", "secret"),
        tuning,
    )
}

pub(crate) struct MockTransport {
    script: Mutex<VecDeque<Result<ExecOutput, SessionError>>>,
    executed: Mutex<Vec<String>>,
    delay: Mutex<Duration>,
    closed: AtomicBool,
    in_flight: AtomicU32,
    max_in_flight: AtomicU32,
}

impl MockTransport {
    /// A transport that answers every command with exit code 0 unless a
    /// scripted response is queued.
    pub(crate) fn ok() -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(VecDeque::new()),
            executed: Mutex::new(Vec::new()),
            delay: Mutex::new(Duration::ZERO),
            closed: AtomicBool::new(false),
            in_flight: AtomicU32::new(0),
            max_in_flight: AtomicU32::new(0),
        })
    }

    pub(crate) fn push_output(&self, output: ExecOutput) {
        self.script.lock().unwrap().push_back(Ok(output));
    }

    pub(crate) fn push_timeout(&self, timeout: Duration) {
        self.script
            .lock()
            .unwrap()
            .push_back(Err(SessionError::Timeout { timeout }));
    }

    pub(crate) fn push_connection_lost(&self, host: &str) {
        self.script
            .lock()
            .unwrap()
            .push_back(Err(SessionError::ConnectionLost {
                identity: ServerIdentity::new(host),
            }));
    }

    /// Hold each exec open for `delay`, to widen overlap windows.
    pub(crate) fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }

    pub(crate) fn commands(&self) -> Vec<String> {
        self.executed.lock().unwrap().clone()
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Highest number of concurrently running exec calls observed.
    pub(crate) fn max_in_flight(&self) -> u32 {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for Arc<MockTransport> {
    async fn exec(&self, command: &str, _timeout: Duration) -> Result<ExecOutput, SessionError> {
        let now_running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now_running, Ordering::SeqCst);

        let delay = *self.delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        self.executed.lock().unwrap().push(command.to_string());
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        match self.script.lock().unwrap().pop_front() {
            Some(result) => result,
            None => Ok(exec_ok()),
        }
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

pub(crate) struct MockFactory {
    opens: AtomicU32,
    open_failures: Mutex<VecDeque<SessionError>>,
    open_delay: Mutex<Duration>,
    transports: Mutex<Vec<Arc<MockTransport>>>,
}

impl MockFactory {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            opens: AtomicU32::new(0),
            open_failures: Mutex::new(VecDeque::new()),
            open_delay: Mutex::new(Duration::ZERO),
            transports: Mutex::new(Vec::new()),
        })
    }

    /// Queue an error for the next `open` call.
    pub(crate) fn fail_next(&self, error: SessionError) {
        self.open_failures.lock().unwrap().push_back(error);
    }

    /// Hold each `open` for `delay`, to widen connect race windows.
    pub(crate) fn set_open_delay(&self, delay: Duration) {
        *self.open_delay.lock().unwrap() = delay;
    }

    pub(crate) fn open_count(&self) -> u32 {
        self.opens.load(Ordering::SeqCst)
    }

    /// The most recently opened transport.
    pub(crate) fn last_transport(&self) -> Option<Arc<MockTransport>> {
        self.transports.lock().unwrap().last().cloned()
    }
}

#[async_trait]
impl TransportFactory for MockFactory {
    async fn open(
        &self,
        _params: &ConnectionParameters,
    ) -> Result<Box<dyn Transport>, SessionError> {
        self.opens.fetch_add(1, Ordering::SeqCst);

        let delay = *self.open_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        if let Some(error) = self.open_failures.lock().unwrap().pop_front() {
            return Err(error);
        }

        let transport = MockTransport::ok();
        self.transports.lock().unwrap().push(transport.clone());
        Ok(Box::new(transport))
    }
}
