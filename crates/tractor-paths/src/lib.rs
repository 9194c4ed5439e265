use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum PathError {
    #[error("home directory not found; set $HOME")]
    HomeNotFound,
}

/// Centralized path construction for the `~/.tractor/` directory layout.
///
/// Single source of truth for every path under the user data directory. Use
/// `resolve()` in production code, `from_dir()` when the directory is given
/// explicitly (`--path`) and in tests.
#[derive(Debug, Clone)]
pub struct TractorPaths {
    user_dir: PathBuf,
}

impl TractorPaths {
    /// Resolve paths from the user's home directory (`~/.tractor`).
    pub fn resolve() -> Result<Self, PathError> {
        let home = dirs::home_dir().ok_or(PathError::HomeNotFound)?;
        Ok(Self {
            user_dir: home.join(".tractor"),
        })
    }

    /// Resolve from an optional override, falling back to `~/.tractor`.
    pub fn resolve_or(user_dir: Option<PathBuf>) -> Result<Self, PathError> {
        match user_dir {
            Some(dir) => Ok(Self::from_dir(dir)),
            None => Self::resolve(),
        }
    }

    /// Create paths from an explicit base directory.
    pub fn from_dir(user_dir: PathBuf) -> Self {
        Self { user_dir }
    }

    /// The base user data directory.
    pub fn user_dir(&self) -> &Path {
        &self.user_dir
    }

    /// Directory holding one entry (directory or symlink) per workspace.
    pub fn workspaces_dir(&self) -> PathBuf {
        self.user_dir.join("workspaces")
    }

    pub fn agent_socket(&self) -> PathBuf {
        self.user_dir.join("agent.sock")
    }

    pub fn user_config(&self) -> PathBuf {
        self.user_dir.join("config.toml")
    }

    pub fn workspace_entry(&self, name: &str) -> PathBuf {
        let safe_name = name.replace('/', "_");
        self.workspaces_dir().join(safe_name)
    }

    // --- Static helpers (no self) ---

    /// Per-workspace launch overrides: `<target>/workspace.toml`.
    pub fn workspace_config(target: &Path) -> PathBuf {
        target.join("workspace.toml")
    }
}
