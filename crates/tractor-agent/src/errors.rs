use std::io;
use std::path::PathBuf;

/// All error types for the tractor-agent crate.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("agent not running")]
    NotRunning,

    #[error("agent already listening on {}", .0.display())]
    AlreadyRunning(PathBuf),

    #[error("agent socket not bound")]
    NotBound,

    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("protocol error: {0}")]
    ProtocolError(String),

    #[error("workspace not found: {0}")]
    WorkspaceNotFound(String),

    #[error("unknown method: {0}")]
    UnknownMethod(String),

    #[error("invalid workspace {name}: {reason}")]
    InvalidWorkspace { name: String, reason: String },

    #[error("invalid config: {0}")]
    ConfigInvalid(String),

    /// Error reported by the agent in reply to a call.
    #[error("{message}")]
    Remote { code: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("config parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error(transparent)]
    Paths(#[from] tractor_paths::PathError),
}

impl AgentError {
    /// Error code string for the RPC protocol.
    pub fn error_code(&self) -> &str {
        match self {
            AgentError::NotRunning => "agent_not_running",
            AgentError::AlreadyRunning(_) => "agent_already_running",
            AgentError::NotBound => "agent_not_bound",
            AgentError::ConnectionFailed(_) => "connection_failed",
            AgentError::ProtocolError(_) => "protocol_error",
            AgentError::WorkspaceNotFound(_) => "workspace_not_found",
            AgentError::UnknownMethod(_) => "unknown_method",
            AgentError::InvalidWorkspace { .. } => "invalid_workspace",
            AgentError::ConfigInvalid(_) => "config_invalid",
            AgentError::Remote { code, .. } => code,
            AgentError::Io(_) => "io_error",
            AgentError::Serde(_) => "serialization_error",
            AgentError::Toml(_) => "config_parse_error",
            AgentError::Paths(_) => "path_error",
        }
    }

    /// Whether this error is caused by user input.
    pub fn is_user_error(&self) -> bool {
        match self {
            AgentError::WorkspaceNotFound(_)
            | AgentError::UnknownMethod(_)
            | AgentError::AlreadyRunning(_)
            | AgentError::InvalidWorkspace { .. }
            | AgentError::ConfigInvalid(_) => true,
            AgentError::Remote { code, .. } => {
                matches!(code.as_str(), "workspace_not_found" | "unknown_method")
            }
            _ => false,
        }
    }
}
