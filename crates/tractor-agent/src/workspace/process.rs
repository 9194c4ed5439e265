use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use bytes::Bytes;
use nix::sys::signal::{Signal, killpg};
use nix::unistd::Pid;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use super::output::ReadinessDetector;

const READ_CHUNK: usize = 4096;

/// How a workspace process is launched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    /// Program and arguments. A relative program containing `/` is resolved
    /// against the workspace target.
    pub command: Vec<String>,
    pub env: BTreeMap<String, String>,
    /// Output line prefix that marks the process ready.
    pub ready_marker: String,
}

impl LaunchSpec {
    pub fn new(command: Vec<String>, ready_marker: impl Into<String>) -> Self {
        Self {
            command,
            env: BTreeMap::new(),
            ready_marker: ready_marker.into(),
        }
    }

    pub fn with_env(mut self, env: BTreeMap<String, String>) -> Self {
        self.env = env;
        self
    }

    /// Human-readable command line, for diagnostics.
    pub fn display(&self) -> String {
        self.command.join(" ")
    }
}

fn resolve_program(program: &str, target: &Path) -> PathBuf {
    let path = Path::new(program);
    if path.is_relative() && program.contains('/') {
        target.join(path)
    } else {
        path.to_path_buf()
    }
}

/// Spawn the workspace process in its own process group, with piped output.
pub(crate) fn spawn(spec: &LaunchSpec, target: &Path) -> std::io::Result<Child> {
    let Some((program, args)) = spec.command.split_first() else {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "empty launch command",
        ));
    };

    let mut cmd = Command::new(resolve_program(program, target));
    cmd.args(args)
        .envs(&spec.env)
        .current_dir(target)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .process_group(0)
        .kill_on_drop(true);
    cmd.spawn()
}

/// Forward everything read from `reader` to `tx` until EOF.
///
/// Calls `on_ready` once when a line starts with `marker`. Send errors are
/// ignored: having no readers is normal.
pub(crate) async fn pump<R, F>(
    mut reader: R,
    tx: broadcast::Sender<Bytes>,
    marker: &str,
    on_ready: F,
) where
    R: AsyncRead + Unpin,
    F: Fn(),
{
    let mut detector = ReadinessDetector::new(marker);
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                let chunk = Bytes::copy_from_slice(&buf[..n]);
                let ready = detector.feed(&chunk);
                let _ = tx.send(chunk);
                if ready {
                    on_ready();
                }
            }
            Err(e) => {
                warn!(event = "agent.workspace.output_read_failed", error = %e);
                break;
            }
        }
    }
}

/// Signal a whole process group. A group that is already gone is not an error.
pub(crate) fn signal_group(pid: u32, signal: Signal) -> Result<(), nix::Error> {
    let Ok(raw) = i32::try_from(pid) else {
        return Err(nix::Error::EINVAL);
    };
    match killpg(Pid::from_raw(raw), signal) {
        Ok(()) => Ok(()),
        Err(nix::Error::ESRCH) => {
            debug!(
                event = "agent.workspace.signal_skipped",
                pid = pid,
                signal = %signal,
                reason = "process group already gone",
            );
            Ok(())
        }
        Err(e) => Err(e),
    }
}
