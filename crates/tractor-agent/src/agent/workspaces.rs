use std::collections::BTreeMap;
use std::path::Path;

use tracing::{debug, info, warn};
use tractor_paths::TractorPaths;

use crate::errors::AgentError;
use crate::types::{AgentConfig, WorkspaceConfig};
use crate::workspace::{LaunchSpec, OutputStream, Workspace};

/// Reply sent along with a hijacked `connect` call.
pub const CONNECT_REPLY: &str = "connected";

/// Name-keyed collection of workspaces, fixed once the agent is open.
#[derive(Debug, Default)]
pub struct WorkspaceSet {
    by_name: BTreeMap<String, Workspace>,
}

impl WorkspaceSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a workspace. Fails if the name is already taken.
    pub fn insert(&mut self, workspace: Workspace) -> Result<(), AgentError> {
        let name = workspace.name().to_string();
        if self.by_name.contains_key(&name) {
            return Err(AgentError::InvalidWorkspace {
                name,
                reason: "duplicate name".to_string(),
            });
        }
        self.by_name.insert(name, workspace);
        Ok(())
    }

    /// Resolve a call argument to a workspace.
    ///
    /// Matches a workspace name first, then a target path. Unknown paths are
    /// an error; workspaces are never registered on demand.
    pub fn resolve(&self, path: &str) -> Result<Workspace, AgentError> {
        if let Some(ws) = self.by_name.get(path) {
            return Ok(ws.clone());
        }

        let wanted = Path::new(path);
        let canonical = wanted.canonicalize().ok();
        self.by_name
            .values()
            .find(|ws| ws.target() == wanted || canonical.as_deref() == Some(ws.target()))
            .cloned()
            .ok_or_else(|| AgentError::WorkspaceNotFound(path.to_string()))
    }

    /// Start or restart the workspace at `path`.
    pub async fn start(&self, path: &str) -> Result<String, AgentError> {
        self.resolve(path)?.start().await;
        Ok("started".to_string())
    }

    pub async fn stop(&self, path: &str) -> Result<String, AgentError> {
        self.resolve(path)?.stop().await;
        Ok("stopped".to_string())
    }

    /// Attach to the output of the workspace at `path`, starting it if needed.
    pub async fn connect(&self, path: &str) -> Result<OutputStream, AgentError> {
        Ok(self.resolve(path)?.connect().await)
    }

    /// All workspaces, sorted by name.
    pub fn list(&self) -> Vec<Workspace> {
        self.by_name.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }
}

/// Load one workspace per entry of `<user dir>/workspaces/`.
///
/// Each entry is a directory or a symlink to one. Hidden entries, entries that
/// do not resolve to a directory and entries with an invalid `workspace.toml`
/// are skipped with a warning.
pub fn load_workspaces(
    paths: &TractorPaths,
    config: &AgentConfig,
) -> Result<WorkspaceSet, AgentError> {
    let dir = paths.workspaces_dir();
    let mut set = WorkspaceSet::new();

    let entries = match std::fs::read_dir(&dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!(event = "agent.workspaces.dir_missing", path = %dir.display());
            return Ok(set);
        }
        Err(e) => return Err(e.into()),
    };

    for entry in entries {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().to_string();
        if name.starts_with('.') {
            continue;
        }

        match load_workspace(&name, &entry.path(), config) {
            Ok(workspace) => {
                debug!(
                    event = "agent.workspaces.loaded",
                    workspace = %name,
                    target = %workspace.target().display(),
                );
                set.insert(workspace)?;
            }
            Err(e) => {
                warn!(
                    event = "agent.workspaces.skipped",
                    workspace = %name,
                    error = %e,
                );
            }
        }
    }

    info!(
        event = "agent.workspaces.load_completed",
        path = %dir.display(),
        count = set.len(),
    );
    Ok(set)
}

fn load_workspace(name: &str, entry: &Path, config: &AgentConfig) -> Result<Workspace, AgentError> {
    let invalid = |reason: String| AgentError::InvalidWorkspace {
        name: name.to_string(),
        reason,
    };

    let target = entry
        .canonicalize()
        .map_err(|e| invalid(format!("cannot resolve {}: {}", entry.display(), e)))?;
    if !target.is_dir() {
        return Err(invalid(format!("{} is not a directory", target.display())));
    }

    let overrides = WorkspaceConfig::load(&target)?;
    let command = overrides.command.unwrap_or_else(|| config.command.clone());
    if command.is_empty() {
        return Err(invalid("command must not be empty".to_string()));
    }
    let ready_marker = overrides
        .ready_marker
        .unwrap_or_else(|| config.ready_marker.clone());
    if ready_marker.is_empty() {
        return Err(invalid("ready_marker must not be empty".to_string()));
    }

    let launch = LaunchSpec::new(command, ready_marker).with_env(overrides.env);
    Ok(Workspace::new(
        name,
        target,
        launch,
        config.output_buffer,
        config.stop_timeout(),
    ))
}
