//! The long-lived supervisor: owns the workspaces and the agent socket.
//!
//! [`Agent`] is a [`Component`] with all three lifecycle capabilities, so a
//! [`tractor_core::Daemon`] built from a registry holding it binds the socket
//! on initialization, serves connections until cancelled, and stops every
//! workspace on termination.

mod workspaces;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use tokio::net::UnixListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tractor_core::{BoxError, Component, Initializer, Service, Terminator};
use tractor_paths::TractorPaths;

use crate::errors::AgentError;
use crate::server;
use crate::types::{AgentConfig, WorkspaceInfo, load_agent_config};
use crate::workspace::{OutputStream, Workspace};

pub use workspaces::{CONNECT_REPLY, WorkspaceSet, load_workspaces};

pub struct Agent {
    paths: TractorPaths,
    config: AgentConfig,
    socket_path: PathBuf,
    workspaces: Arc<WorkspaceSet>,
    listener: Mutex<Option<UnixListener>>,
    bound: AtomicBool,
}

impl Agent {
    /// Open (creating if needed) the user directory and load its workspaces.
    ///
    /// `user_dir` overrides the default `~/.tractor`.
    pub fn open(user_dir: Option<PathBuf>) -> Result<Self, AgentError> {
        let paths = TractorPaths::resolve_or(user_dir)?;
        std::fs::create_dir_all(paths.workspaces_dir())?;

        let config = load_agent_config(&paths)?;
        let workspaces = load_workspaces(&paths, &config)?;

        info!(
            event = "agent.open_completed",
            user_dir = %paths.user_dir().display(),
            workspaces = workspaces.len(),
        );
        Ok(Self::new(paths, config, workspaces))
    }

    pub fn new(paths: TractorPaths, config: AgentConfig, workspaces: WorkspaceSet) -> Self {
        let socket_path = config.socket_path(&paths);
        Self {
            paths,
            config,
            socket_path,
            workspaces: Arc::new(workspaces),
            listener: Mutex::new(None),
            bound: AtomicBool::new(false),
        }
    }

    pub fn paths(&self) -> &TractorPaths {
        &self.paths
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Resolve a workspace by name or target path.
    pub fn workspace(&self, path: &str) -> Result<Workspace, AgentError> {
        self.workspaces.resolve(path)
    }

    /// Every managed workspace, sorted by name.
    pub fn workspaces(&self) -> Vec<Workspace> {
        self.workspaces.list()
    }

    pub fn workspace_infos(&self) -> Vec<WorkspaceInfo> {
        self.workspaces.list().iter().map(Workspace::info).collect()
    }

    pub async fn start(&self, path: &str) -> Result<String, AgentError> {
        self.workspaces.start(path).await
    }

    pub async fn stop(&self, path: &str) -> Result<String, AgentError> {
        self.workspaces.stop(path).await
    }

    pub async fn connect(&self, path: &str) -> Result<OutputStream, AgentError> {
        self.workspaces.connect(path).await
    }

    /// Bind the agent socket. Fails if another agent is already listening.
    pub async fn listen(&self) -> Result<(), AgentError> {
        let listener = server::bind_socket(&self.socket_path).await?;
        *self.listener.lock().unwrap_or_else(PoisonError::into_inner) = Some(listener);
        self.bound.store(true, Ordering::Release);
        Ok(())
    }

    /// Accept connections until `token` is cancelled.
    pub async fn serve_connections(&self, token: CancellationToken) -> Result<(), AgentError> {
        let listener = self
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or(AgentError::NotBound)?;
        server::accept_loop(listener, self.workspaces.clone(), token).await;
        Ok(())
    }

    /// Stop every workspace and release the socket.
    pub async fn shutdown(&self) -> Result<(), AgentError> {
        info!(event = "agent.shutdown_started", workspaces = self.workspaces.len());

        let stops = self.workspaces.list();
        futures::future::join_all(stops.iter().map(Workspace::stop)).await;

        self.listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if self.bound.swap(false, Ordering::AcqRel) {
            match std::fs::remove_file(&self.socket_path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }

        info!(event = "agent.shutdown_completed");
        Ok(())
    }
}

#[async_trait]
impl Initializer for Agent {
    async fn initialize_daemon(&self) -> Result<(), BoxError> {
        self.listen().await?;
        Ok(())
    }

    fn name(&self) -> &str {
        "agent"
    }
}

#[async_trait]
impl Service for Agent {
    async fn serve(&self, token: CancellationToken) {
        if let Err(e) = self.serve_connections(token).await {
            error!(event = "agent.serve_failed", error = %e);
        }
    }
}

#[async_trait]
impl Terminator for Agent {
    async fn terminate_daemon(&self) -> Result<(), BoxError> {
        self.shutdown().await?;
        Ok(())
    }

    fn name(&self) -> &str {
        "agent"
    }
}

impl Component for Agent {
    fn as_initializer(self: Arc<Self>) -> Option<Arc<dyn Initializer>> {
        Some(self)
    }

    fn as_service(self: Arc<Self>) -> Option<Arc<dyn Service>> {
        Some(self)
    }

    fn as_terminator(self: Arc<Self>) -> Option<Arc<dyn Terminator>> {
        Some(self)
    }
}

impl Drop for Agent {
    fn drop(&mut self) {
        if self.bound.load(Ordering::Acquire) {
            if let Err(e) = std::fs::remove_file(&self.socket_path) {
                warn!(
                    event = "agent.socket_cleanup_failed",
                    path = %self.socket_path.display(),
                    error = %e,
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workspace::{LaunchSpec, Status};
    use std::time::Duration;

    fn agent_with(dir: &Path, scripts: &[(&str, &str)]) -> Agent {
        let paths = TractorPaths::from_dir(dir.to_path_buf());
        let config = AgentConfig::default();
        let mut set = WorkspaceSet::new();
        for (name, script) in scripts {
            let target = dir.join(name);
            std::fs::create_dir_all(&target).unwrap();
            let spec = LaunchSpec::new(
                vec!["sh".to_string(), "-c".to_string(), script.to_string()],
                "pid ",
            );
            set.insert(Workspace::new(*name, target, spec, 64, Duration::from_secs(2)))
                .unwrap();
        }
        Agent::new(paths, config, set)
    }

    #[test]
    fn test_open_creates_user_dir() {
        let dir = tempfile::tempdir().unwrap();
        let user_dir = dir.path().join(".tractor");
        let agent = Agent::open(Some(user_dir.clone())).unwrap();

        assert!(user_dir.join("workspaces").is_dir());
        assert_eq!(agent.socket_path(), user_dir.join("agent.sock"));
        assert!(agent.workspaces().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_workspace_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let agent = agent_with(dir.path(), &[]);

        let err = agent.start("nope").await.unwrap_err();
        assert!(matches!(err, AgentError::WorkspaceNotFound(_)));
        assert!(agent.stop("nope").await.is_err());
        assert!(agent.connect("nope").await.is_err());
    }

    #[tokio::test]
    async fn test_start_stop_replies() {
        let dir = tempfile::tempdir().unwrap();
        let agent = agent_with(
            dir.path(),
            &[("app", r#"while true; do echo "pid $$"; sleep 0.1; done"#)],
        );

        assert_eq!(agent.start("app").await.unwrap(), "started");
        assert_eq!(agent.stop("app").await.unwrap(), "stopped");
        assert_eq!(
            agent.workspace("app").unwrap().status(),
            Status::PartiallyAvailable
        );
    }

    #[tokio::test]
    async fn test_shutdown_stops_workspaces_and_removes_socket() {
        let dir = tempfile::tempdir().unwrap();
        let agent = agent_with(
            dir.path(),
            &[
                ("a", r#"while true; do echo "pid $$"; sleep 0.1; done"#),
                ("b", r#"while true; do echo "pid $$"; sleep 0.1; done"#),
            ],
        );
        agent.listen().await.unwrap();
        assert!(agent.socket_path().exists());

        agent.start("a").await.unwrap();
        agent.start("b").await.unwrap();
        agent.shutdown().await.unwrap();

        assert!(!agent.socket_path().exists());
        for ws in agent.workspaces() {
            assert_eq!(ws.status(), Status::PartiallyAvailable);
            assert!(ws.pid().is_none());
        }
    }

    #[tokio::test]
    async fn test_serve_without_listen_fails() {
        let dir = tempfile::tempdir().unwrap();
        let agent = agent_with(dir.path(), &[]);
        let err = agent
            .serve_connections(CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "agent_not_bound");
    }

    #[test]
    fn test_agent_declares_all_capabilities() {
        let dir = tempfile::tempdir().unwrap();
        let registry = tractor_core::Registry::new();
        registry
            .register(Arc::new(agent_with(dir.path(), &[])))
            .unwrap();

        assert_eq!(registry.assignable_to::<dyn Initializer>().len(), 1);
        assert_eq!(registry.assignable_to::<dyn Service>().len(), 1);
        assert_eq!(registry.assignable_to::<dyn Terminator>().len(), 1);
    }
}
