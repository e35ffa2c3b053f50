//! Service lifecycle
//!
//! Owns the worker task that runs the listener and the stop signal shared
//! with it, and reports every state transition to the service manager.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;

use crate::error::{LifecycleError, ServiceError};
use crate::ipc::{Endpoint, ListenerLoop};

/// States reported to the service manager
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    Starting,
    Running,
    StopPending,
    Stopped,
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Starting => write!(f, "starting"),
            Self::Running => write!(f, "running"),
            Self::StopPending => write!(f, "stop pending"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

/// Receives lifecycle transitions; `exit_code` is 0 unless stopping on error
pub trait StatusReporter: Send + Sync {
    fn report(&self, state: ServiceState, exit_code: u32);
}

impl<T: StatusReporter + ?Sized> StatusReporter for Arc<T> {
    fn report(&self, state: ServiceState, exit_code: u32) {
        (**self).report(state, exit_code)
    }
}

/// Reports transitions to the log only
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingStatusReporter;

impl StatusReporter for TracingStatusReporter {
    fn report(&self, state: ServiceState, exit_code: u32) {
        if exit_code == 0 {
            tracing::info!("Service {}", state);
        } else {
            tracing::error!("Service {} (exit code {})", state, exit_code);
        }
    }
}

/// Write-once, read-many stop flag shared between control and worker
#[derive(Debug, Clone, Default)]
pub struct StopSignal(CancellationToken);

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        self.0.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.0.is_cancelled()
    }

    /// Resolves once [`stop`](Self::stop) has been called
    pub async fn stopped(&self) {
        self.0.cancelled().await
    }

    pub fn token(&self) -> CancellationToken {
        self.0.clone()
    }
}

type Worker = JoinHandle<Result<(), ServiceError>>;

pub struct ServiceLifecycle<R: StatusReporter> {
    reporter: R,
    state: ServiceState,
    stop: StopSignal,
    worker: Option<Worker>,
    shutdown_timeout: Duration,
}

impl<R: StatusReporter> ServiceLifecycle<R> {
    pub fn new(reporter: R, shutdown_timeout: Duration) -> Self {
        Self {
            reporter,
            state: ServiceState::Starting,
            stop: StopSignal::new(),
            worker: None,
            shutdown_timeout,
        }
    }

    pub fn state(&self) -> ServiceState {
        self.state
    }

    /// Handle for stop requests from outside the lifecycle (signal handlers)
    pub fn stop_signal(&self) -> StopSignal {
        self.stop.clone()
    }

    /// Spawn the listener and move to `Running`.
    ///
    /// A spawn failure is fatal: `Stopped` is reported with the error's exit
    /// code before it is returned.
    pub fn start<E: Endpoint>(&mut self, listener: ListenerLoop<E>) -> Result<(), ServiceError> {
        let token = self.stop.token();
        self.spawn_worker(listener.run(token))
    }

    fn spawn_worker<F>(&mut self, worker: F) -> Result<(), ServiceError>
    where
        F: Future<Output = Result<(), ServiceError>> + Send + 'static,
    {
        if self.state != ServiceState::Starting || self.worker.is_some() {
            return Err(LifecycleError::AlreadyStarted.into());
        }
        self.transition(ServiceState::Starting, 0);

        let handle = match Handle::try_current() {
            Ok(handle) => handle,
            Err(e) => {
                let error = ServiceError::from(LifecycleError::SpawnFailed {
                    reason: e.to_string(),
                });
                self.transition(ServiceState::Stopped, error.exit_code());
                return Err(error);
            }
        };

        self.worker = Some(handle.spawn(worker));
        self.transition(ServiceState::Running, 0);
        Ok(())
    }

    /// Wait until stop is requested or the worker exits on its own.
    pub async fn run_until_stopped(&mut self) -> Result<(), ServiceError> {
        let Some(worker) = self.worker.as_mut() else {
            return Ok(());
        };

        let exited = tokio::select! {
            _ = self.stop.stopped() => None,
            joined = worker => Some(joined),
        };

        match exited {
            None => self.request_stop().await,
            Some(joined) => {
                self.worker = None;
                tracing::warn!("Worker exited while running");
                self.transition(ServiceState::StopPending, 0);
                self.finish(joined)
            }
        }
    }

    /// Signal the worker, wait for it (bounded by the shutdown timeout) and
    /// move to `Stopped`. Does nothing unless `Running`.
    pub async fn request_stop(&mut self) -> Result<(), ServiceError> {
        if self.state != ServiceState::Running {
            return Ok(());
        }
        self.transition(ServiceState::StopPending, 0);
        self.stop.stop();

        let Some(mut worker) = self.worker.take() else {
            self.transition(ServiceState::Stopped, 0);
            return Ok(());
        };

        match tokio::time::timeout(self.shutdown_timeout, &mut worker).await {
            Ok(joined) => self.finish(joined),
            Err(_) => {
                tracing::warn!(
                    "Worker did not stop within {:?}, aborting",
                    self.shutdown_timeout
                );
                worker.abort();
                self.transition(ServiceState::Stopped, 0);
                Ok(())
            }
        }
    }

    fn finish(
        &mut self,
        joined: Result<Result<(), ServiceError>, JoinError>,
    ) -> Result<(), ServiceError> {
        let result = match joined {
            Ok(result) => result,
            Err(e) => Err(LifecycleError::WorkerPanicked {
                reason: e.to_string(),
            }
            .into()),
        };

        let code = result.as_ref().err().map_or(0, ServiceError::exit_code);
        self.transition(ServiceState::Stopped, code);
        result
    }

    fn transition(&mut self, state: ServiceState, exit_code: u32) {
        self.state = state;
        self.reporter.report(state, exit_code);
    }
}
