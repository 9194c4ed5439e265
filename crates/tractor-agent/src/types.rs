use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tractor_paths::TractorPaths;

use crate::errors::AgentError;
use crate::workspace::Status;

/// Agent configuration.
///
/// Read from the `[agent]` section of `<user dir>/config.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Path to the Unix domain socket.
    /// Default: `<user dir>/agent.sock`
    #[serde(default)]
    pub socket_path: Option<PathBuf>,

    /// Per-workspace output channel capacity, in chunks.
    /// Default: 256
    #[serde(default = "default_output_buffer")]
    pub output_buffer: usize,

    /// Seconds to wait after SIGTERM before killing a workspace process group.
    /// Default: 5
    #[serde(default = "default_stop_timeout_secs")]
    pub stop_timeout_secs: u64,

    /// Seconds the daemon waits for services to return on shutdown.
    /// Default: 5
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,

    /// Output line prefix that marks a workspace process as ready.
    /// Default: `"pid "`
    #[serde(default = "default_ready_marker")]
    pub ready_marker: String,

    /// Launch command used when a workspace does not set its own.
    /// Relative programs are resolved against the workspace target.
    /// Default: `["./workspace"]`
    #[serde(default = "default_command")]
    pub command: Vec<String>,
}

impl AgentConfig {
    /// Validate configuration values.
    ///
    /// Called after loading config to catch misconfiguration early.
    pub fn validate(&self) -> Result<(), AgentError> {
        if self.output_buffer == 0 {
            return Err(AgentError::ConfigInvalid(
                "output_buffer must be > 0".to_string(),
            ));
        }
        if self.stop_timeout_secs == 0 {
            return Err(AgentError::ConfigInvalid(
                "stop_timeout_secs must be > 0".to_string(),
            ));
        }
        if self.ready_marker.is_empty() {
            return Err(AgentError::ConfigInvalid(
                "ready_marker must not be empty".to_string(),
            ));
        }
        if self.command.is_empty() {
            return Err(AgentError::ConfigInvalid(
                "command must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    /// Socket path, falling back to the user directory default.
    pub fn socket_path(&self, paths: &TractorPaths) -> PathBuf {
        self.socket_path
            .clone()
            .unwrap_or_else(|| paths.agent_socket())
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            socket_path: None,
            output_buffer: default_output_buffer(),
            stop_timeout_secs: default_stop_timeout_secs(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
            ready_marker: default_ready_marker(),
            command: default_command(),
        }
    }
}

fn default_output_buffer() -> usize {
    256
}

fn default_stop_timeout_secs() -> u64 {
    5
}

fn default_shutdown_grace_secs() -> u64 {
    5
}

fn default_ready_marker() -> String {
    "pid ".to_string()
}

fn default_command() -> Vec<String> {
    vec!["./workspace".to_string()]
}

/// Mirrors just enough of `config.toml` to extract the `[agent]` section.
#[derive(Debug, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    agent: AgentConfig,
}

/// Load agent configuration from `<user dir>/config.toml`.
///
/// Falls back to defaults if the file doesn't exist or the section is
/// missing. An unparsable file is logged and ignored; invalid values are an
/// error.
pub fn load_agent_config(paths: &TractorPaths) -> Result<AgentConfig, AgentError> {
    let config_path = paths.user_config();

    let config = match std::fs::read_to_string(&config_path) {
        Ok(contents) => match toml::from_str::<ConfigFile>(&contents) {
            Ok(file) => file.agent,
            Err(e) => {
                tracing::warn!(
                    event = "agent.config.parse_failed",
                    path = %config_path.display(),
                    error = %e,
                );
                AgentConfig::default()
            }
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => AgentConfig::default(),
        Err(e) => {
            tracing::warn!(
                event = "agent.config.read_failed",
                path = %config_path.display(),
                error = %e,
            );
            AgentConfig::default()
        }
    };

    config.validate()?;
    Ok(config)
}

/// Per-workspace launch overrides, read from `<target>/workspace.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkspaceConfig {
    #[serde(default)]
    pub command: Option<Vec<String>>,

    #[serde(default)]
    pub ready_marker: Option<String>,

    /// Extra environment for the workspace process.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl WorkspaceConfig {
    /// Load overrides for `target`. A missing file means no overrides.
    pub fn load(target: &Path) -> Result<Self, AgentError> {
        let path = TractorPaths::workspace_config(target);
        match std::fs::read_to_string(&path) {
            Ok(contents) => Ok(toml::from_str(&contents)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Point-in-time view of one workspace, for listings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WorkspaceInfo {
    pub name: String,
    pub target: PathBuf,
    pub status: Status,
    pub pid: Option<u32>,
    pub changed_at: DateTime<Utc>,
}
