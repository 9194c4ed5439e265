use crate::BoxError;
use crate::daemon::DaemonState;

/// A terminator that failed during shutdown.
#[derive(Debug)]
pub struct TerminationFailure {
    pub component: String,
    pub error: BoxError,
}

impl std::fmt::Display for TerminationFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.component, self.error)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DaemonError {
    #[error("initialization failed in {component}: {source}")]
    Initialization {
        component: String,
        #[source]
        source: BoxError,
    },

    #[error("termination failed: {}", join_failures(.0))]
    Termination(Vec<TerminationFailure>),

    #[error("daemon cannot run from state {0}")]
    AlreadyRun(DaemonState),
}

impl DaemonError {
    /// Error code string, matching the convention of the agent protocol.
    pub fn error_code(&self) -> &'static str {
        match self {
            DaemonError::Initialization { .. } => "initialization_failed",
            DaemonError::Termination(_) => "termination_failed",
            DaemonError::AlreadyRun(_) => "daemon_already_run",
        }
    }
}

fn join_failures(failures: &[TerminationFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initialization_display() {
        let err = DaemonError::Initialization {
            component: "agent".to_string(),
            source: "socket in use".into(),
        };
        assert_eq!(
            err.to_string(),
            "initialization failed in agent: socket in use"
        );
        assert_eq!(err.error_code(), "initialization_failed");
    }

    #[test]
    fn test_termination_display_joins_failures() {
        let err = DaemonError::Termination(vec![
            TerminationFailure {
                component: "a".to_string(),
                error: "boom".into(),
            },
            TerminationFailure {
                component: "b".to_string(),
                error: "bang".into(),
            },
        ]);
        assert_eq!(err.to_string(), "termination failed: a: boom; b: bang");
    }

    #[test]
    fn test_already_run_display() {
        let err = DaemonError::AlreadyRun(DaemonState::Stopped);
        assert_eq!(err.to_string(), "daemon cannot run from state stopped");
        assert_eq!(err.error_code(), "daemon_already_run");
    }
}
