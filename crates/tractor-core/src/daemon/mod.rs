//! Ordered service lifecycle.
//!
//! A [`Daemon`] is built from a [`Registry`] and runs three phases:
//! 1. every [`Initializer`] in registration order, aborting on the first error
//! 2. every [`Service`] concurrently, sharing one cancellation token
//! 3. on cancellation, every [`Terminator`], collecting failures
//!
//! Services are expected to observe the token and return; the daemon never
//! aborts them.

pub mod errors;
pub mod traits;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::registry::{Populate, Registry};

pub use errors::{DaemonError, TerminationFailure};
pub use traits::{Initializer, Service, Terminator};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonState {
    Idle,
    Initializing,
    Running,
    Terminating,
    Stopped,
}

impl std::fmt::Display for DaemonState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DaemonState::Idle => write!(f, "idle"),
            DaemonState::Initializing => write!(f, "initializing"),
            DaemonState::Running => write!(f, "running"),
            DaemonState::Terminating => write!(f, "terminating"),
            DaemonState::Stopped => write!(f, "stopped"),
        }
    }
}

pub struct Daemon {
    initializers: Vec<Arc<dyn Initializer>>,
    services: Vec<Arc<dyn Service>>,
    terminators: Vec<Arc<dyn Terminator>>,
    state: watch::Sender<DaemonState>,
    shutdown_grace: Duration,
}

impl Daemon {
    /// Default time to wait for services to return after cancellation.
    pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

    pub fn new() -> Self {
        let (state, _) = watch::channel(DaemonState::Idle);
        Self {
            initializers: Vec::new(),
            services: Vec::new(),
            terminators: Vec::new(),
            state,
            shutdown_grace: Self::DEFAULT_SHUTDOWN_GRACE,
        }
    }

    /// Build a daemon whose capability lists are drawn from `registry`.
    pub fn from_registry(registry: &Registry) -> Self {
        let mut daemon = Self::new();
        registry.populate(&mut daemon);
        daemon
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    pub fn initializers(&self) -> &[Arc<dyn Initializer>] {
        &self.initializers
    }

    pub fn services(&self) -> &[Arc<dyn Service>] {
        &self.services
    }

    pub fn terminators(&self) -> &[Arc<dyn Terminator>] {
        &self.terminators
    }

    pub fn state(&self) -> DaemonState {
        *self.state.borrow()
    }

    /// Watch lifecycle transitions.
    pub fn subscribe(&self) -> watch::Receiver<DaemonState> {
        self.state.subscribe()
    }

    fn set_state(&self, state: DaemonState) {
        self.state.send_replace(state);
    }

    /// Run the full lifecycle. Returns after terminators have run.
    ///
    /// A daemon runs once; calling `run` again fails with
    /// [`DaemonError::AlreadyRun`].
    pub async fn run(&self, token: CancellationToken) -> Result<(), DaemonError> {
        let claimed = self.state.send_if_modified(|state| {
            if *state == DaemonState::Idle {
                *state = DaemonState::Initializing;
                true
            } else {
                false
            }
        });
        if !claimed {
            return Err(DaemonError::AlreadyRun(self.state()));
        }

        info!(
            event = "core.daemon.run_started",
            initializers = self.initializers.len(),
            services = self.services.len(),
            terminators = self.terminators.len(),
        );

        for initializer in &self.initializers {
            if let Err(source) = initializer.initialize_daemon().await {
                let component = initializer.name().to_string();
                error!(
                    event = "core.daemon.initialize_failed",
                    component = %component,
                    error = %source,
                );
                self.set_state(DaemonState::Stopped);
                return Err(DaemonError::Initialization { component, source });
            }
        }

        self.set_state(DaemonState::Running);
        let mut running = JoinSet::new();
        for service in &self.services {
            let service = service.clone();
            let service_token = token.clone();
            running.spawn(async move { service.serve(service_token).await });
        }

        token.cancelled().await;
        info!(event = "core.daemon.terminate_started");
        self.set_state(DaemonState::Terminating);

        let mut failures = Vec::new();
        for terminator in &self.terminators {
            if let Err(e) = terminator.terminate_daemon().await {
                warn!(
                    event = "core.daemon.terminate_failed",
                    component = terminator.name(),
                    error = %e,
                );
                failures.push(TerminationFailure {
                    component: terminator.name().to_string(),
                    error: e,
                });
            }
        }

        let drained = tokio::time::timeout(self.shutdown_grace, async {
            while let Some(result) = running.join_next().await {
                if let Err(e) = result {
                    error!(event = "core.daemon.service_panicked", error = %e);
                }
            }
        })
        .await;
        if drained.is_err() {
            warn!(
                event = "core.daemon.services_still_running",
                remaining = running.len(),
                grace_ms = self.shutdown_grace.as_millis() as u64,
            );
            running.detach_all();
        }

        self.set_state(DaemonState::Stopped);

        if failures.is_empty() {
            info!(event = "core.daemon.run_completed");
            Ok(())
        } else {
            Err(DaemonError::Termination(failures))
        }
    }
}

impl Default for Daemon {
    fn default() -> Self {
        Self::new()
    }
}

impl Populate for Daemon {
    fn populate(&mut self, registry: &Registry) {
        registry.fill_all::<dyn Initializer>(&mut self.initializers);
        registry.fill_all::<dyn Service>(&mut self.services);
        registry.fill_all::<dyn Terminator>(&mut self.terminators);
    }
}
