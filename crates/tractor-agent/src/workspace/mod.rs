//! One managed developer session: a status state machine over an OS process.
//!
//! `start`, `stop` and `connect` are serialised per workspace by an async
//! exclusive region. The process handle lives behind a short synchronous lock
//! that the process supervisor task also takes. Every status transition
//! happens under that lock and is queued there, so transitions are totally
//! ordered. Observers are called from the queue after the lock is released,
//! one delivery at a time and in transition order, so they may read the
//! workspace freely. Status itself is an atomic for lock-free reads.

mod output;
mod process;
mod status;

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, TryLockError};
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use nix::sys::signal::Signal;
use tokio::process::Child;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use tractor_core::notify::func;
use tractor_core::{Notifiable, Notifier, ObserverId, SharedTopic, Topic};

use crate::types::WorkspaceInfo;

pub use output::OutputStream;
pub use process::LaunchSpec;
pub use status::{Status, StatusChange};

/// Time a child that already exited gets to flush output held by its
/// descendants.
const DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

/// Time to wait for the supervisor after SIGKILL before abandoning it.
const KILL_GRACE: Duration = Duration::from_secs(1);

struct RunningProcess {
    generation: u64,
    pid: u32,
    output: broadcast::Sender<Bytes>,
    supervisor: JoinHandle<()>,
}

struct State {
    process: Option<RunningProcess>,
    generation: u64,
    changed_at: DateTime<Utc>,
    /// Transitions not yet delivered to observers.
    pending: VecDeque<StatusChange>,
}

struct Shared {
    name: String,
    target: PathBuf,
    launch: LaunchSpec,
    output_buffer: usize,
    stop_timeout: Duration,
    status: AtomicU8,
    state: Mutex<State>,
    ops: tokio::sync::Mutex<()>,
    /// Held by whichever thread is draining `State::pending`.
    delivery: Mutex<()>,
    events: SharedTopic<StatusChange>,
}

/// Handle to a managed workspace. Clones share the same process and status.
#[derive(Clone)]
pub struct Workspace {
    shared: Arc<Shared>,
}

impl Workspace {
    pub fn new(
        name: impl Into<String>,
        target: impl Into<PathBuf>,
        launch: LaunchSpec,
        output_buffer: usize,
        stop_timeout: Duration,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                name: name.into(),
                target: target.into(),
                launch,
                output_buffer: output_buffer.max(1),
                stop_timeout,
                status: AtomicU8::new(Status::PartiallyAvailable.as_u8()),
                state: Mutex::new(State {
                    process: None,
                    generation: 0,
                    changed_at: Utc::now(),
                    pending: VecDeque::new(),
                }),
                ops: tokio::sync::Mutex::new(()),
                delivery: Mutex::new(()),
                events: SharedTopic::new(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn target(&self) -> &Path {
        &self.shared.target
    }

    pub fn launch_spec(&self) -> &LaunchSpec {
        &self.shared.launch
    }

    pub fn status(&self) -> Status {
        self.shared.status()
    }

    /// Pid of the running process, if any.
    pub fn pid(&self) -> Option<u32> {
        self.shared
            .lock_state()
            .process
            .as_ref()
            .map(|p| p.pid)
            .filter(|pid| *pid != 0)
    }

    pub fn info(&self) -> WorkspaceInfo {
        let state = self.shared.lock_state();
        WorkspaceInfo {
            name: self.shared.name.clone(),
            target: self.shared.target.clone(),
            status: self.shared.status(),
            pid: state.process.as_ref().map(|p| p.pid).filter(|p| *p != 0),
            changed_at: state.changed_at,
        }
    }

    /// Launch the process, restarting it if it is already running.
    ///
    /// Returns once the launch is issued. Status becomes `Available` when the
    /// process prints its ready marker, or `Unavailable` if it exits first.
    pub async fn start(&self) {
        let _op = self.shared.ops.lock().await;
        info!(event = "agent.workspace.start_started", workspace = %self.shared.name);

        self.shared.terminate().await;
        let _ = self.shared.launch();

        info!(event = "agent.workspace.start_completed", workspace = %self.shared.name);
    }

    /// Terminate the process if running. Status always ends up
    /// `PartiallyAvailable`, and every reader has seen end-of-stream by the
    /// time this returns.
    pub async fn stop(&self) {
        let _op = self.shared.ops.lock().await;
        info!(event = "agent.workspace.stop_started", workspace = %self.shared.name);

        let was_running = self.shared.terminate().await;

        info!(
            event = "agent.workspace.stop_completed",
            workspace = %self.shared.name,
            was_running = was_running,
        );
    }

    /// Attach to the process output, starting the process if needed.
    pub async fn connect(&self) -> OutputStream {
        let _op = self.shared.ops.lock().await;

        let existing = self
            .shared
            .lock_state()
            .process
            .as_ref()
            .map(|p| p.output.subscribe());
        let started = existing.is_none();
        let rx = match existing {
            Some(rx) => rx,
            None => self.shared.launch(),
        };

        info!(
            event = "agent.workspace.connect_completed",
            workspace = %self.shared.name,
            started = started,
        );
        OutputStream::new(self.shared.name.clone(), rx)
    }

    /// Observe status transitions. Observers are called in transition order
    /// with no workspace lock held; they must not block.
    pub fn on_status_change<F>(&self, f: F) -> ObserverId
    where
        F: Fn(&StatusChange) + Send + Sync + 'static,
    {
        self.shared.events.observe(func(f))
    }
}

impl Notifiable<StatusChange> for Workspace {
    fn topic(&self) -> &dyn Topic<StatusChange> {
        &self.shared.events
    }
}

impl std::fmt::Debug for Workspace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Workspace")
            .field("name", &self.shared.name)
            .field("target", &self.shared.target)
            .field("status", &self.shared.status())
            .finish()
    }
}

impl Shared {
    fn status(&self) -> Status {
        Status::from_u8(self.status.load(Ordering::Acquire))
    }

    fn lock_state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Move to `next` and queue the change for observers. Must be called with
    /// the state lock held; call [`Shared::deliver`] once it is released.
    fn transition(&self, state: &mut State, next: Status) {
        let previous = self.status();
        if previous == next {
            return;
        }
        self.status.store(next.as_u8(), Ordering::Release);
        state.changed_at = Utc::now();

        info!(
            event = "agent.workspace.status_changed",
            workspace = %self.name,
            from = %previous,
            to = %next,
        );
        state.pending.push_back(StatusChange {
            workspace: self.name.clone(),
            target: self.target.clone(),
            previous,
            current: next,
        });
    }

    /// Hand queued changes to observers. Only one thread delivers at a time;
    /// any other returns at once and leaves its changes to that thread.
    fn deliver(&self) {
        loop {
            let guard = match self.delivery.try_lock() {
                Ok(guard) => guard,
                Err(TryLockError::WouldBlock) => return,
                Err(TryLockError::Poisoned(e)) => e.into_inner(),
            };
            loop {
                let next = self.lock_state().pending.pop_front();
                match next {
                    Some(change) => self.events.notify(&change),
                    None => break,
                }
            }
            drop(guard);
            // A change queued while the guard was being dropped.
            if self.lock_state().pending.is_empty() {
                return;
            }
        }
    }

    /// Spawn a new process generation and return a receiver subscribed
    /// before any of its output is produced.
    fn launch(self: &Arc<Self>) -> broadcast::Receiver<Bytes> {
        let (tx, rx) = broadcast::channel(self.output_buffer);

        let mut state = self.lock_state();
        state.generation += 1;
        let generation = state.generation;
        self.transition(&mut state, Status::PartiallyAvailable);

        match process::spawn(&self.launch, &self.target) {
            Ok(child) => {
                let pid = child.id().unwrap_or(0);
                info!(
                    event = "agent.workspace.process_spawned",
                    workspace = %self.name,
                    pid = pid,
                    generation = generation,
                );
                let supervisor = tokio::spawn(supervise(self.clone(), generation, child, tx.clone()));
                state.process = Some(RunningProcess {
                    generation,
                    pid,
                    output: tx,
                    supervisor,
                });
            }
            Err(e) => {
                error!(
                    event = "agent.workspace.process_spawn_failed",
                    workspace = %self.name,
                    command = %self.launch.display(),
                    error = %e,
                );
                let diagnostic = format!(
                    "tractor: failed to launch {}: {}\n",
                    self.launch.display(),
                    e
                );
                let _ = tx.send(Bytes::from(diagnostic));
                self.transition(&mut state, Status::Unavailable);
            }
        }
        drop(state);
        self.deliver();
        rx
    }

    /// Stop the current process, if any. Returns whether one was running.
    async fn terminate(&self) -> bool {
        let process = {
            let mut state = self.lock_state();
            let process = state.process.take();
            self.transition(&mut state, Status::PartiallyAvailable);
            process
        };
        self.deliver();
        let Some(RunningProcess {
            pid,
            output,
            mut supervisor,
            ..
        }) = process
        else {
            return false;
        };
        drop(output);

        if pid != 0 {
            if let Err(e) = process::signal_group(pid, Signal::SIGTERM) {
                warn!(event = "agent.workspace.signal_failed", workspace = %self.name, pid = pid, error = %e);
            }
        }
        if tokio::time::timeout(self.stop_timeout, &mut supervisor)
            .await
            .is_ok()
        {
            return true;
        }

        warn!(
            event = "agent.workspace.stop_timeout",
            workspace = %self.name,
            pid = pid,
            timeout_ms = self.stop_timeout.as_millis() as u64,
        );
        if pid != 0 {
            if let Err(e) = process::signal_group(pid, Signal::SIGKILL) {
                warn!(event = "agent.workspace.signal_failed", workspace = %self.name, pid = pid, error = %e);
            }
        }
        if tokio::time::timeout(KILL_GRACE, &mut supervisor)
            .await
            .is_err()
        {
            // Dropping the supervisor closes the output channel.
            supervisor.abort();
            let _ = supervisor.await;
        }
        true
    }

    fn mark_ready(&self, generation: u64) {
        let mut state = self.lock_state();
        let current = state
            .process
            .as_ref()
            .is_some_and(|p| p.generation == generation);
        if current && self.status() == Status::PartiallyAvailable {
            self.transition(&mut state, Status::Available);
        }
        drop(state);
        self.deliver();
    }

    fn process_exited(&self, generation: u64, exit: &str) {
        let mut state = self.lock_state();
        let current = state
            .process
            .as_ref()
            .is_some_and(|p| p.generation == generation);
        if !current {
            debug!(
                event = "agent.workspace.stale_exit_ignored",
                workspace = %self.name,
                generation = generation,
            );
            return;
        }
        let pid = state.process.take().map_or(0, |p| p.pid);

        let next = if self.status() == Status::Available {
            Status::PartiallyAvailable
        } else {
            Status::Unavailable
        };
        info!(
            event = "agent.workspace.process_exited",
            workspace = %self.name,
            generation = generation,
            exit = exit,
        );
        self.transition(&mut state, next);
        drop(state);
        self.deliver();

        // Descendants left in the group would otherwise outlive the workspace.
        if pid != 0 {
            if let Err(e) = process::signal_group(pid, Signal::SIGTERM) {
                debug!(event = "agent.workspace.group_signal_failed", workspace = %self.name, pid = pid, error = %e);
            }
        }
    }
}

/// Pump output and reap the process for one generation.
///
/// Output senders are dropped only after the exit transition, so a reader
/// that sees end-of-stream also sees the final status.
async fn supervise(
    shared: Arc<Shared>,
    generation: u64,
    mut child: Child,
    tx: broadcast::Sender<Bytes>,
) {
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();

    let marker = shared.launch.ready_marker.clone();
    let on_ready = {
        let shared = shared.clone();
        move || shared.mark_ready(generation)
    };
    let out_tx = tx.clone();
    let err_tx = tx.clone();
    let mut pumps = Box::pin(async move {
        let (marker, on_ready) = (&marker, &on_ready);
        let out = async move {
            if let Some(stdout) = stdout {
                process::pump(stdout, out_tx, marker, on_ready).await;
            }
        };
        let err = async move {
            if let Some(stderr) = stderr {
                process::pump(stderr, err_tx, marker, on_ready).await;
            }
        };
        tokio::join!(out, err);
    });

    let early_exit = tokio::select! {
        _ = &mut pumps => None,
        status = child.wait() => Some(status),
    };
    let status = match early_exit {
        Some(status) => {
            // Descendants may still hold the pipes open.
            let _ = tokio::time::timeout(DRAIN_TIMEOUT, &mut pumps).await;
            status
        }
        None => child.wait().await,
    };

    let exit = match status {
        Ok(status) => status.to_string(),
        Err(e) => format!("wait failed: {e}"),
    };
    shared.process_exited(generation, &exit);
    drop(pumps);
    drop(tx);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    const HEALTHY: &str = r#"while true; do echo "pid $$"; sleep 0.1; done"#;
    const FAILING: &str = r#"echo "boomtown failed"; exit 1"#;
    const COUNTER: &str = r#"i=0; while true; do echo "pid $i"; i=$((i+1)); sleep 0.05; done"#;

    fn sh(script: &str) -> LaunchSpec {
        LaunchSpec::new(
            vec!["sh".to_string(), "-c".to_string(), script.to_string()],
            "pid ",
        )
    }

    fn workspace(name: &str, script: &str) -> (tempfile::TempDir, Workspace) {
        let dir = tempfile::tempdir().unwrap();
        let ws = Workspace::new(
            name,
            dir.path(),
            sh(script),
            64,
            Duration::from_secs(2),
        );
        (dir, ws)
    }

    async fn wait_for(ws: &Workspace, want: Status) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while ws.status() != want {
            assert!(
                tokio::time::Instant::now() < deadline,
                "workspace {} stuck at {}, wanted {}",
                ws.name(),
                ws.status(),
                want
            );
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    async fn first_line(stream: &mut OutputStream) -> String {
        let mut buf = Vec::new();
        while !buf.contains(&b'\n') {
            match stream.recv().await {
                Some(chunk) => buf.extend_from_slice(&chunk),
                None => break,
            }
        }
        let text = String::from_utf8_lossy(&buf).to_string();
        text.lines().next().unwrap_or_default().to_string()
    }

    fn record(ws: &Workspace) -> Arc<Mutex<Vec<Status>>> {
        let seen = Arc::new(Mutex::new(vec![ws.status()]));
        let s = seen.clone();
        ws.on_status_change(move |change| s.lock().unwrap().push(change.current));
        seen
    }

    #[test]
    fn test_initial_status_is_partially_available() {
        let ws = Workspace::new(
            "app",
            "/tmp",
            sh("true"),
            8,
            Duration::from_secs(1),
        );
        assert_eq!(ws.status(), Status::PartiallyAvailable);
        assert!(ws.pid().is_none());
        assert_eq!(ws.info().status, Status::PartiallyAvailable);
    }

    #[tokio::test]
    async fn test_start_then_stop() {
        let (_dir, ws) = workspace("test1", HEALTHY);
        let seen = record(&ws);

        ws.start().await;
        wait_for(&ws, Status::Available).await;
        assert!(ws.pid().is_some());

        ws.stop().await;
        assert_eq!(ws.status(), Status::PartiallyAvailable);
        assert!(ws.pid().is_none());
        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                Status::PartiallyAvailable,
                Status::Available,
                Status::PartiallyAvailable
            ]
        );
    }

    #[tokio::test]
    async fn test_connect_starts_and_streams_from_now() {
        let (_dir, ws) = workspace("test3", HEALTHY);

        let mut stream = ws.connect().await;
        assert!(first_line(&mut stream).await.starts_with("pid "));
        wait_for(&ws, Status::Available).await;

        ws.stop().await;
        assert_eq!(ws.status(), Status::PartiallyAvailable);
        // Stop returns only after every reader is at end-of-stream.
        let _ = stream.read_to_end().await;
        assert!(stream.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_connect_on_running_workspace_does_not_restart() {
        let (_dir, ws) = workspace("test2", HEALTHY);
        ws.start().await;
        wait_for(&ws, Status::Available).await;
        let pid = ws.pid();

        let mut a = ws.connect().await;
        let mut b = ws.connect().await;
        assert_eq!(ws.pid(), pid);
        assert!(first_line(&mut a).await.starts_with("pid "));
        assert!(first_line(&mut b).await.starts_with("pid "));

        ws.stop().await;
        let _ = a.read_to_end().await;
        let _ = b.read_to_end().await;
        assert!(a.recv().await.is_none());
        assert!(b.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_failing_process_flushes_diagnostic_before_eof() {
        let (_dir, ws) = workspace("err", FAILING);
        let seen = record(&ws);

        let mut stream = ws.connect().await;
        let out = String::from_utf8(stream.read_to_end().await).unwrap();
        assert!(out.starts_with("boomtown "), "got {out:?}");
        assert_eq!(ws.status(), Status::Unavailable);
        assert_eq!(
            *seen.lock().unwrap(),
            vec![Status::PartiallyAvailable, Status::Unavailable]
        );

        ws.stop().await;
        assert_eq!(ws.status(), Status::PartiallyAvailable);
    }

    #[tokio::test]
    async fn test_spawn_failure_reports_on_stream() {
        let dir = tempfile::tempdir().unwrap();
        let ws = Workspace::new(
            "missing",
            dir.path(),
            LaunchSpec::new(vec!["./does-not-exist".to_string()], "pid "),
            8,
            Duration::from_secs(1),
        );

        let mut stream = ws.connect().await;
        let out = String::from_utf8(stream.read_to_end().await).unwrap();
        assert!(out.contains("failed to launch ./does-not-exist"), "got {out:?}");
        assert_eq!(ws.status(), Status::Unavailable);
    }

    #[tokio::test]
    async fn test_exit_after_ready_returns_to_partially_available() {
        let (_dir, ws) = workspace("short", r#"echo "pid $$"; sleep 0.2"#);

        let mut stream = ws.connect().await;
        let _ = stream.read_to_end().await;
        assert_eq!(ws.status(), Status::PartiallyAvailable);
        assert!(ws.pid().is_none());
    }

    #[tokio::test]
    async fn test_start_restarts_running_process() {
        let (_dir, ws) = workspace("restart", HEALTHY);
        ws.start().await;
        wait_for(&ws, Status::Available).await;
        let first = ws.pid();

        ws.start().await;
        let second = ws.pid();
        assert!(second.is_some());
        assert_ne!(first, second);
        wait_for(&ws, Status::Available).await;

        ws.stop().await;
    }

    #[tokio::test]
    async fn test_stop_without_process_is_noop() {
        let (_dir, ws) = workspace("idle", HEALTHY);
        let changes = Arc::new(AtomicUsize::new(0));
        let c = changes.clone();
        ws.on_status_change(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        ws.stop().await;
        assert_eq!(ws.status(), Status::PartiallyAvailable);
        assert_eq!(changes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_stop_kills_process_ignoring_sigterm() {
        let dir = tempfile::tempdir().unwrap();
        let ws = Workspace::new(
            "stubborn",
            dir.path(),
            sh(r#"trap '' TERM; echo "pid $$"; while true; do sleep 0.1; done"#),
            8,
            Duration::from_millis(300),
        );
        ws.start().await;
        wait_for(&ws, Status::Available).await;

        let started = tokio::time::Instant::now();
        ws.stop().await;
        assert_eq!(ws.status(), Status::PartiallyAvailable);
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[tokio::test]
    async fn test_suspended_topic_drops_status_events() {
        let (_dir, ws) = workspace("quiet", FAILING);
        let seen = record(&ws);

        tractor_core::notify::suspend(&ws);
        let mut stream = ws.connect().await;
        let _ = stream.read_to_end().await;
        tractor_core::notify::resume(&ws);

        ws.stop().await;
        assert_eq!(
            *seen.lock().unwrap(),
            vec![Status::PartiallyAvailable, Status::PartiallyAvailable]
        );
    }

    #[tokio::test]
    async fn test_concurrent_operations_leave_consistent_state() {
        let (_dir, ws) = workspace("busy", HEALTHY);
        let mut handles = Vec::new();
        for i in 0..6 {
            let ws = ws.clone();
            handles.push(tokio::spawn(async move {
                if i % 2 == 0 {
                    ws.start().await;
                } else {
                    ws.stop().await;
                }
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        ws.stop().await;
        assert_eq!(ws.status(), Status::PartiallyAvailable);
        assert!(ws.pid().is_none());
    }

    #[tokio::test]
    async fn test_observer_may_read_workspace_during_transition() {
        let (_dir, ws) = workspace("watched", HEALTHY);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let (s, w) = (seen.clone(), ws.clone());
        ws.on_status_change(move |change| {
            let info = w.info();
            s.lock()
                .unwrap()
                .push((change.current, info.status, w.pid().is_some()));
        });

        ws.start().await;
        wait_for(&ws, Status::Available).await;
        tokio::time::timeout(Duration::from_secs(5), ws.stop())
            .await
            .expect("stop blocked behind an observer");

        let seen = seen.lock().unwrap();
        let currents: Vec<Status> = seen.iter().map(|(current, ..)| *current).collect();
        assert_eq!(currents, vec![Status::Available, Status::PartiallyAvailable]);
        assert_eq!(
            seen.last(),
            Some(&(Status::PartiallyAvailable, Status::PartiallyAvailable, false))
        );
    }

    #[tokio::test]
    async fn test_connect_does_not_replay_earlier_output() {
        let (_dir, ws) = workspace("counter", COUNTER);
        ws.start().await;
        wait_for(&ws, Status::Available).await;
        tokio::time::sleep(Duration::from_millis(300)).await;

        let mut stream = ws.connect().await;
        let line = first_line(&mut stream).await;
        assert!(line.starts_with("pid "), "got {line:?}");
        assert_ne!(line, "pid 0");

        ws.stop().await;
    }

    #[tokio::test]
    async fn test_exit_terminates_leftover_process_group() {
        let (dir, ws) = workspace(
            "leaky",
            r#"(sleep 1; touch left-behind) >/dev/null 2>&1 & echo "pid $$""#,
        );

        let mut stream = ws.connect().await;
        let _ = stream.read_to_end().await;
        assert!(ws.pid().is_none());

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(!dir.path().join("left-behind").exists());
    }
}
