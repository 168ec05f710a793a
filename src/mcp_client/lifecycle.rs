//! Server process lifecycle management.
//!
//! Spawning, stderr capture, exit supervision, and graceful-then-forced
//! termination of MCP server child processes.

use std::collections::{BTreeMap, VecDeque};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, watch};

use super::errors::{FailureReason, McpError, Phase};

// ─── Constants ───────────────────────────────────────────────────────────────

/// Number of stderr lines kept for error annotation.
pub const STDERR_RING_LINES: usize = 32;

/// Longest stderr line kept, in bytes.
const STDERR_LINE_MAX: usize = 2_000;

// ─── State ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    #[default]
    Closed,
    Starting,
    Running,
    Stopping,
}

// ─── Stderr Ring ─────────────────────────────────────────────────────────────

/// The last [`STDERR_RING_LINES`] lines a server wrote to stderr.
#[derive(Debug, Default)]
pub struct StderrRing {
    lines: Mutex<VecDeque<String>>,
}

impl StderrRing {
    pub fn push(&self, line: &str) {
        let mut line = line.trim_end().to_string();
        if line.is_empty() {
            return;
        }
        if line.len() > STDERR_LINE_MAX {
            let mut cut = STDERR_LINE_MAX;
            while !line.is_char_boundary(cut) {
                cut -= 1;
            }
            line.truncate(cut);
            line.push_str("...(truncated)");
        }
        let mut lines = self.lines.lock().unwrap_or_else(|e| e.into_inner());
        if lines.len() == STDERR_RING_LINES {
            lines.pop_front();
        }
        lines.push_back(line);
    }

    /// Buffered lines joined with newlines, or `None` when nothing was written.
    pub fn snapshot(&self) -> Option<String> {
        let lines = self.lines.lock().unwrap_or_else(|e| e.into_inner());
        if lines.is_empty() {
            None
        } else {
            Some(lines.iter().cloned().collect::<Vec<_>>().join("\n"))
        }
    }

    pub fn len(&self) -> usize {
        self.lines.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Drain a stderr stream into `ring`, logging each line at debug level.
pub fn capture_stderr<R>(server: &str, stderr: R, ring: Arc<StderrRing>) -> tokio::task::JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let server = server.to_string();
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    tracing::debug!(server = %server, line = %line, "server stderr");
                    ring.push(&line);
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::debug!(server = %server, error = %e, "stderr read failed");
                    break;
                }
            }
        }
    })
}

// ─── Spawning ────────────────────────────────────────────────────────────────

/// A freshly spawned server process with its stdio pipes.
pub struct SpawnedProcess {
    pub child: Child,
    pub stdin: ChildStdin,
    pub stdout: ChildStdout,
    pub stderr: Option<ChildStderr>,
}

/// Spawn a server process with piped stdio.
pub fn spawn_process(
    server: &str,
    command: &str,
    args: &[String],
    env: &BTreeMap<String, String>,
    cwd: Option<&PathBuf>,
) -> Result<SpawnedProcess, McpError> {
    let mut cmd = Command::new(command);
    cmd.args(args);
    cmd.envs(env);
    if let Some(dir) = cwd {
        cmd.current_dir(dir);
    }

    // Windows: prevent console window from appearing for child processes
    #[cfg(target_os = "windows")]
    {
        const CREATE_NO_WINDOW: u32 = 0x08000000;
        cmd.creation_flags(CREATE_NO_WINDOW);
    }

    cmd.stdin(Stdio::piped());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    cmd.kill_on_drop(true);

    let spawn_failed = |detail: String| {
        McpError::new(FailureReason::SpawnFailed, server, "spawn", Phase::Startup, detail)
    };

    let mut child = cmd
        .spawn()
        .map_err(|e| spawn_failed(format!("failed to start '{command}': {e}")))?;

    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| spawn_failed("failed to capture stdin".into()))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| spawn_failed("failed to capture stdout".into()))?;
    let stderr = child.stderr.take();

    tracing::info!(server = %server, command = %command, pid = ?child.id(), "spawned MCP server");

    Ok(SpawnedProcess {
        child,
        stdin,
        stdout,
        stderr,
    })
}

// ─── Exit Supervision ────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitInfo {
    pub code: Option<i32>,
    pub description: String,
}

impl ExitInfo {
    fn from_status(status: std::io::Result<std::process::ExitStatus>) -> Self {
        match status {
            Ok(status) => Self {
                code: status.code(),
                description: format!("process exited ({status})"),
            },
            Err(e) => Self {
                code: None,
                description: format!("failed to wait for process: {e}"),
            },
        }
    }
}

/// Cloneable handle to a supervised child process.
///
/// A watcher task owns the `Child`; the handle observes its exit and can ask
/// it to kill the process.
#[derive(Debug, Clone)]
pub struct ProcessHandle {
    exit_rx: watch::Receiver<Option<ExitInfo>>,
    kill_tx: mpsc::Sender<()>,
}

impl ProcessHandle {
    /// Hand `child` to a watcher task.
    pub fn supervise(server: &str, mut child: Child) -> Self {
        let (exit_tx, exit_rx) = watch::channel(None);
        let (kill_tx, mut kill_rx) = mpsc::channel::<()>(1);
        let server = server.to_string();

        tokio::spawn(async move {
            let mut kill_open = true;
            let status = loop {
                tokio::select! {
                    status = child.wait() => break status,
                    request = kill_rx.recv(), if kill_open => match request {
                        Some(()) => {
                            if let Err(e) = child.start_kill() {
                                tracing::debug!(server = %server, error = %e, "kill failed");
                            }
                        }
                        None => kill_open = false,
                    },
                }
            };
            let info = ExitInfo::from_status(status);
            tracing::info!(server = %server, code = ?info.code, "MCP server exited");
            let _ = exit_tx.send(Some(info));
        });

        Self { exit_rx, kill_tx }
    }

    pub fn has_exited(&self) -> bool {
        self.exit_rx.borrow().is_some()
    }

    pub fn exit_info(&self) -> Option<ExitInfo> {
        self.exit_rx.borrow().clone()
    }

    /// Resolve once the process has exited.
    pub async fn wait_exit(&self) -> ExitInfo {
        let mut rx = self.exit_rx.clone();
        loop {
            if let Some(info) = rx.borrow_and_update().clone() {
                return info;
            }
            if rx.changed().await.is_err() {
                return rx.borrow().clone().unwrap_or(ExitInfo {
                    code: None,
                    description: "process watcher stopped".into(),
                });
            }
        }
    }

    /// Request a forced kill. Returns immediately.
    pub fn kill(&self) {
        let _ = self.kill_tx.try_send(());
    }

    /// Wait up to `grace` for the process to exit on its own, then kill it.
    ///
    /// The caller is expected to have closed stdin first.
    pub async fn terminate(&self, grace: Duration) -> ExitInfo {
        if let Ok(info) = tokio::time::timeout(grace, self.wait_exit()).await {
            return info;
        }
        self.kill();
        self.wait_exit().await
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
