//! tractor-core: plumbing shared by the tractor agent and CLI.
//!
//! # Main Entry Points
//!
//! - [`registry`] - Capability-based service container
//! - [`notify`] - Observer topics with suspend/resume
//! - [`daemon`] - Ordered initialize / serve / terminate lifecycle
//! - [`logging`] - Structured logging setup

pub mod daemon;
pub mod logging;
pub mod notify;
pub mod registry;

pub use daemon::{Daemon, DaemonError, DaemonState, Initializer, Service, Terminator};
pub use logging::init_logging;
pub use notify::{Notifiable, Notifier, ObserverId, SharedTopic, Suspendable, Topic};
pub use registry::{Capability, Component, Entry, Populate, RegistrationError, Registry};

/// Error type returned by lifecycle hooks.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;
