//! Typed external-command execution.
//!
//! Every external tool the pipeline drives (`losetup`, `veritysetup`,
//! `mount`, the generator hooks) goes through [`CommandRunner`], so tests
//! can substitute a scripted runner and exercise the pipeline without real
//! devices. The host implementation enforces a per-invocation timeout; a
//! hung tool is an error, not a stalled pipeline.

use std::process::ExitStatus;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

/// Errors from a single external invocation.
#[derive(Debug, Error)]
pub enum CommandError {
    /// The process could not be spawned or reaped.
    #[error("failed to run `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    /// The process did not finish within the timeout.
    #[error("`{command}` timed out after {timeout:?}")]
    TimedOut { command: String, timeout: Duration },

    /// The process exited non-zero.
    #[error("`{command}` exited with {status}: {stderr}")]
    Failed {
        command: String,
        status: ExitStatus,
        stderr: String,
    },
}

/// Captured result of a completed invocation.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status.success()
    }
}

/// Executes external commands with captured output.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run `program` with `args`, capturing stdout and stderr.
    ///
    /// Spawn failures and timeouts are errors; a non-zero exit status is
    /// returned inside the output so callers can decide.
    async fn run(&self, program: &str, args: &[&str]) -> Result<CommandOutput, CommandError>;

    /// Run `program` and require a zero exit status.
    ///
    /// On non-zero exit the captured stderr is attached to the error.
    async fn run_checked(
        &self,
        program: &str,
        args: &[&str],
    ) -> Result<CommandOutput, CommandError> {
        let output = self.run(program, args).await?;
        if !output.success() {
            return Err(CommandError::Failed {
                command: render_command(program, args),
                status: output.status,
                stderr: output.stderr.trim().to_string(),
            });
        }
        Ok(output)
    }
}

/// Render a command line for logs and error messages.
pub fn render_command(program: &str, args: &[&str]) -> String {
    let mut command = String::from(program);
    for arg in args {
        command.push(' ');
        command.push_str(arg);
    }
    command
}

/// Runs commands on the host with a fixed per-invocation timeout.
#[derive(Debug, Clone)]
pub struct HostRunner {
    timeout: Duration,
}

impl HostRunner {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl CommandRunner for HostRunner {
    async fn run(&self, program: &str, args: &[&str]) -> Result<CommandOutput, CommandError> {
        let command = render_command(program, args);
        tracing::debug!("Executing: {}", command);

        let child = tokio::process::Command::new(program)
            .args(args)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            // the child must not outlive a timed-out invocation
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| CommandError::Spawn {
                command: command.clone(),
                source: e,
            })?;

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| CommandError::TimedOut {
                command: command.clone(),
                timeout: self.timeout,
            })?
            .map_err(|e| CommandError::Spawn {
                command,
                source: e,
            })?;

        Ok(CommandOutput {
            status: output.status,
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}
