//! Low-level host command mediation shared by all node drivers.
//!
//! When the agent runs inside a privileged container the command is
//! re-entered into the host's namespaces with `nsenter -t 1`; on a bare
//! host it is executed directly. Drivers never spawn processes
//! themselves; they go through a [`HostRunner`] so tests can substitute
//! a scripted fake.

use async_trait::async_trait;
use std::path::Path;
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

/// Outcome of a driver-level host command. Spawn failures and timeouts
/// are folded into `success = false` with the reason in `stderr`, so
/// drivers can treat every outcome uniformly.
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn failure(reason: impl Into<String>) -> Self {
        Self {
            success: false,
            stdout: String::new(),
            stderr: reason.into(),
        }
    }
}

#[async_trait]
pub trait HostRunner: Send + Sync {
    /// Run `program` with `args` in the host namespace, bounded by `timeout`.
    async fn run(&self, program: &str, args: &[&str], timeout: Duration) -> CommandOutput;
}

/// Check whether the agent is containerized and must use nsenter:
/// the Docker marker file exists, or PID 1's cgroup mentions docker.
pub fn detect_containerized() -> bool {
    if Path::new("/.dockerenv").exists() {
        return true;
    }
    match std::fs::read_to_string("/proc/1/cgroup") {
        Ok(content) => content.contains("docker"),
        Err(_) => false,
    }
}

/// The production [`HostRunner`]: optional nsenter wrapping around
/// `tokio::process::Command`.
pub struct NsenterRunner {
    use_nsenter: bool,
}

impl NsenterRunner {
    pub fn new() -> Self {
        Self {
            use_nsenter: detect_containerized(),
        }
    }

    /// Force the nsenter decision, used by tests and bare-host deployments.
    pub fn with_nsenter(use_nsenter: bool) -> Self {
        Self { use_nsenter }
    }

    pub fn uses_nsenter(&self) -> bool {
        self.use_nsenter
    }
}

impl Default for NsenterRunner {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HostRunner for NsenterRunner {
    async fn run(&self, program: &str, args: &[&str], timeout: Duration) -> CommandOutput {
        let mut cmd;
        if self.use_nsenter {
            cmd = Command::new("nsenter");
            cmd.args(["-t", "1", "-m", "-u", "-n", "-i", "--"]);
            cmd.arg(program);
        } else {
            cmd = Command::new(program);
        }
        cmd.args(args);
        cmd.kill_on_drop(true);

        debug!(program, ?args, "running host command");

        let output = match tokio::time::timeout(timeout, cmd.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                return if self.use_nsenter {
                    CommandOutput::failure(
                        "nsenter not found - container must have privileged: true and pid: host",
                    )
                } else {
                    CommandOutput::failure("Command not found")
                };
            }
            Ok(Err(e)) => return CommandOutput::failure(e.to_string()),
            Err(_) => return CommandOutput::failure("Command timed out"),
        };

        CommandOutput {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).trim().to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn runs_local_command() {
        let runner = NsenterRunner::with_nsenter(false);
        let out = runner
            .run("echo", &["hello"], Duration::from_secs(5))
            .await;
        assert!(out.success);
        assert_eq!(out.stdout, "hello");
    }

    #[tokio::test]
    async fn missing_program_is_failure_not_panic() {
        let runner = NsenterRunner::with_nsenter(false);
        let out = runner
            .run("definitely-not-a-binary-xyz", &[], Duration::from_secs(5))
            .await;
        assert!(!out.success);
        assert!(out.stderr.contains("not found"));
    }
}
