//! Arbitrary shell command execution in the host namespace.

use crate::runner::detect_containerized;
use edge_types::Shell;
use serde::{Deserialize, Serialize};
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{info, warn};

/// Maximum allowed timeout for a single host command (10 minutes).
pub const MAX_TIMEOUT_SECS: u64 = 600;
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Extended PATH so binaries installed via snap or into /usr/local are
/// reachable from the panel's exec endpoint.
const EXTENDED_PATH: &str = "/snap/bin:/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecuteResult {
    pub success: bool,
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub execution_time_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Events produced by [`HostExecutor::execute_stream`]. Serialized to
/// SSE frames only at the HTTP edge.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "lowercase")]
pub enum ExecEvent {
    Stdout { line: String },
    Stderr { line: String },
    Error { message: String },
    Done {
        exit_code: i32,
        execution_time_ms: u64,
        success: bool,
    },
}

/// Executes shell commands on the host. Stateless: each call spawns its
/// own child process; contention exists only at the OS level.
pub struct HostExecutor {
    use_nsenter: bool,
}

impl HostExecutor {
    pub fn new() -> Self {
        Self {
            use_nsenter: detect_containerized(),
        }
    }

    pub fn with_nsenter(use_nsenter: bool) -> Self {
        Self { use_nsenter }
    }

    fn clamp_timeout(timeout_secs: u64) -> u64 {
        timeout_secs.clamp(1, MAX_TIMEOUT_SECS)
    }

    fn prepare_command(command: &str) -> String {
        format!("export PATH=\"{}:$PATH\"; {}", EXTENDED_PATH, command)
    }

    fn build(&self, command: &str, shell: Shell) -> Command {
        let prepared = Self::prepare_command(command);
        let mut cmd;
        if self.use_nsenter {
            // -t 1: host init; -m/-u/-n/-i/-p: mount, UTS, net, IPC, PID
            // namespaces; -C: cgroup namespace (required for snap apps).
            cmd = Command::new("nsenter");
            cmd.args(["-t", "1", "-m", "-u", "-n", "-i", "-p", "-C", "--"]);
            cmd.arg(shell.as_str());
        } else {
            cmd = Command::new(shell.as_str());
        }
        cmd.arg("-c").arg(prepared);
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);
        cmd
    }

    fn spawn_error(&self, shell: Shell, e: &std::io::Error) -> String {
        if e.kind() == std::io::ErrorKind::NotFound {
            let what = if self.use_nsenter {
                "nsenter not found".to_string()
            } else {
                format!("{} not found", shell.as_str())
            };
            format!("{} - container must have privileged: true and pid: host", what)
        } else {
            e.to_string()
        }
    }

    /// Run a command to completion, capturing both output streams.
    pub async fn execute(&self, command: &str, timeout_secs: u64, shell: Shell) -> ExecuteResult {
        let timeout_secs = Self::clamp_timeout(timeout_secs);
        let started = Instant::now();

        info!(command = %truncate(command, 100), "executing on host");

        let child = match self.build(command, shell).spawn() {
            Ok(child) => child,
            Err(e) => {
                let error = self.spawn_error(shell, &e);
                warn!("command spawn failed: {}", error);
                return ExecuteResult {
                    success: false,
                    exit_code: -1,
                    stdout: String::new(),
                    stderr: String::new(),
                    execution_time_ms: started.elapsed().as_millis() as u64,
                    error: Some(error),
                };
            }
        };

        let child_pid = child.id();
        let waited =
            tokio::time::timeout(Duration::from_secs(timeout_secs), child.wait_with_output()).await;

        let execution_time_ms = started.elapsed().as_millis() as u64;
        match waited {
            Ok(Ok(output)) => {
                let exit_code = output.status.code().unwrap_or(-1);
                let result = ExecuteResult {
                    success: exit_code == 0,
                    exit_code,
                    stdout: String::from_utf8_lossy(&output.stdout).trim().to_string(),
                    stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
                    execution_time_ms,
                    error: None,
                };
                info!(
                    exit_code,
                    time_ms = execution_time_ms,
                    stdout_len = result.stdout.len(),
                    "command completed"
                );
                result
            }
            Ok(Err(e)) => ExecuteResult {
                success: false,
                exit_code: -1,
                stdout: String::new(),
                stderr: String::new(),
                execution_time_ms,
                error: Some(e.to_string()),
            },
            Err(_) => {
                // The child future is gone (kill_on_drop reaps it); the
                // rest of its process group still needs the signal.
                kill_group_by_pid(child_pid);
                warn!(timeout_secs, command = %truncate(command, 50), "command timed out");
                ExecuteResult {
                    success: false,
                    exit_code: -1,
                    stdout: String::new(),
                    stderr: String::new(),
                    execution_time_ms,
                    error: Some(format!("Command timed out after {} seconds", timeout_secs)),
                }
            }
        }
    }

    /// Run a command yielding output lines as they are produced.
    ///
    /// Both stream readers run concurrently; `Done` is emitted only after
    /// both have reached EOF. On deadline expiry the readers are
    /// cancelled, the child's process group is killed, and the stream
    /// ends with `Error` followed by `Done { success: false }`.
    pub fn execute_stream(
        &self,
        command: &str,
        timeout_secs: u64,
        shell: Shell,
    ) -> ReceiverStream<ExecEvent> {
        let timeout_secs = Self::clamp_timeout(timeout_secs);
        // Capacity 1: lines are pulled through one at a time, so the only
        // buffering is the OS pipe behind the readers.
        let (tx, rx) = mpsc::channel(1);

        let mut builder = self.build(command, shell);
        let spawn_error_fallback = self.use_nsenter;
        let command_short = truncate(command, 100).to_string();

        tokio::spawn(async move {
            let started = Instant::now();
            info!(command = %command_short, "executing (stream) on host");

            let mut child = match builder.spawn() {
                Ok(child) => child,
                Err(e) => {
                    let message = if e.kind() == std::io::ErrorKind::NotFound {
                        let what = if spawn_error_fallback {
                            "nsenter not found"
                        } else {
                            "shell not found"
                        };
                        format!("{} - container must have privileged: true and pid: host", what)
                    } else {
                        e.to_string()
                    };
                    let _ = tx.send(ExecEvent::Error { message }).await;
                    let _ = tx
                        .send(ExecEvent::Done {
                            exit_code: -1,
                            execution_time_ms: started.elapsed().as_millis() as u64,
                            success: false,
                        })
                        .await;
                    return;
                }
            };

            let stdout = child.stdout.take();
            let stderr = child.stderr.take();

            let stdout_task = spawn_line_reader(stdout, tx.clone(), true);
            let stderr_task = spawn_line_reader(stderr, tx.clone(), false);

            let deadline = Duration::from_secs(timeout_secs);
            let both = async {
                let _ = stdout_task.await;
                let _ = stderr_task.await;
            };

            match tokio::time::timeout(deadline, both).await {
                Ok(()) => {
                    let status = child.wait().await;
                    let exit_code = status
                        .ok()
                        .and_then(|s| s.code())
                        .unwrap_or(-1);
                    let execution_time_ms = started.elapsed().as_millis() as u64;
                    info!(exit_code, time_ms = execution_time_ms, "command (stream) completed");
                    let _ = tx
                        .send(ExecEvent::Done {
                            exit_code,
                            execution_time_ms,
                            success: exit_code == 0,
                        })
                        .await;
                }
                Err(_) => {
                    kill_process_group(&mut child).await;
                    let execution_time_ms = started.elapsed().as_millis() as u64;
                    warn!(timeout_secs, "streamed command timed out");
                    let _ = tx
                        .send(ExecEvent::Error {
                            message: format!("Command timed out after {} seconds", timeout_secs),
                        })
                        .await;
                    let _ = tx
                        .send(ExecEvent::Done {
                            exit_code: -1,
                            execution_time_ms,
                            success: false,
                        })
                        .await;
                }
            }
        });

        ReceiverStream::new(rx)
    }
}

impl Default for HostExecutor {
    fn default() -> Self {
        Self::new()
    }
}

fn spawn_line_reader<R>(
    stream: Option<R>,
    tx: mpsc::Sender<ExecEvent>,
    is_stdout: bool,
) -> tokio::task::JoinHandle<()>
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let Some(stream) = stream else { return };
        let mut lines = BufReader::new(stream).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let event = if is_stdout {
                ExecEvent::Stdout { line }
            } else {
                ExecEvent::Stderr { line }
            };
            if tx.send(event).await.is_err() {
                break;
            }
        }
    })
}

fn kill_group_by_pid(pid: Option<u32>) {
    #[cfg(unix)]
    if let Some(pid) = pid {
        use nix::sys::signal::{killpg, Signal};
        use nix::unistd::Pid;
        let _ = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL);
    }
    #[cfg(not(unix))]
    let _ = pid;
}

async fn kill_process_group(child: &mut Child) {
    kill_group_by_pid(child.id());
    let _ = child.kill().await;
    let _ = child.wait().await;
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_stream::StreamExt;

    fn executor() -> HostExecutor {
        HostExecutor::with_nsenter(false)
    }

    #[tokio::test]
    async fn captures_stdout_and_exit_code() {
        let result = executor().execute("echo hi; exit 3", 10, Shell::Sh).await;
        assert!(!result.success);
        assert_eq!(result.exit_code, 3);
        assert_eq!(result.stdout, "hi");
        assert!(result.error.is_none());
    }

    #[tokio::test]
    async fn timeout_kills_and_reports() {
        let result = executor().execute("sleep 30", 1, Shell::Sh).await;
        assert!(!result.success);
        assert_eq!(result.exit_code, -1);
        assert_eq!(
            result.error.as_deref(),
            Some("Command timed out after 1 seconds")
        );
    }

    #[tokio::test]
    async fn timeout_is_clamped() {
        // 0 clamps up to 1s, which is still enough for a trivial command.
        let result = executor().execute("true", 0, Shell::Sh).await;
        assert!(result.success);
    }

    #[tokio::test]
    async fn path_is_extended() {
        let result = executor().execute("echo $PATH", 10, Shell::Sh).await;
        assert!(result.stdout.contains("/snap/bin"));
    }

    #[tokio::test]
    async fn stream_yields_lines_then_done() {
        let mut stream = executor().execute_stream("echo a; echo b >&2", 10, Shell::Sh);
        let mut stdout_lines = Vec::new();
        let mut stderr_lines = Vec::new();
        let mut done = None;
        while let Some(event) = stream.next().await {
            match event {
                ExecEvent::Stdout { line } => stdout_lines.push(line),
                ExecEvent::Stderr { line } => stderr_lines.push(line),
                ExecEvent::Done { exit_code, success, .. } => {
                    done = Some((exit_code, success));
                }
                ExecEvent::Error { message } => panic!("unexpected error: {}", message),
            }
        }
        assert_eq!(stdout_lines, vec!["a"]);
        assert_eq!(stderr_lines, vec!["b"]);
        assert_eq!(done, Some((0, true)));
    }

    #[tokio::test]
    async fn stream_timeout_emits_error_then_done() {
        let mut stream = executor().execute_stream("sleep 30", 1, Shell::Sh);
        let mut events = Vec::new();
        while let Some(event) = stream.next().await {
            events.push(event);
        }
        assert!(matches!(events.get(0), Some(ExecEvent::Error { .. })));
        match events.last() {
            Some(ExecEvent::Done { success, exit_code, .. }) => {
                assert!(!success);
                assert_eq!(*exit_code, -1);
            }
            other => panic!("expected Done, got {:?}", other),
        }
    }
}
