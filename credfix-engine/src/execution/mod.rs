//! Process executor for every external call the engine makes
//!
//! Handles bounded execution of system commands:
//! - stdout/stderr capture
//! - deadline per invocation; a timeout kills the child process
//! - exit code classification, including the credential-helper `list` signal

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::process::Stdio;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::process::Command as AsyncCommand;
use tracing::{debug, warn};

/// Captured output of a command that exited with code 0
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub execution_time_ms: u128,
}

impl CommandOutput {
    pub fn success(stdout: impl Into<String>) -> Self {
        Self {
            stdout: stdout.into(),
            stderr: String::new(),
            exit_code: 0,
            execution_time_ms: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionErrorKind {
    Timeout,
    NonZeroExit,
    SpawnFailure,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ExecutionError {
    #[error("`{command}` timed out after {timeout_ms}ms")]
    Timeout { command: String, timeout_ms: u64 },
    #[error("`{command}` exited with code {exit_code}: {stderr}")]
    NonZeroExit {
        command: String,
        exit_code: i32,
        stdout: String,
        stderr: String,
    },
    #[error("failed to spawn `{command}`: {message}")]
    SpawnFailure {
        command: String,
        message: String,
        not_found: bool,
    },
}

impl ExecutionError {
    pub fn kind(&self) -> ExecutionErrorKind {
        match self {
            ExecutionError::Timeout { .. } => ExecutionErrorKind::Timeout,
            ExecutionError::NonZeroExit { .. } => ExecutionErrorKind::NonZeroExit,
            ExecutionError::SpawnFailure { .. } => ExecutionErrorKind::SpawnFailure,
        }
    }

    pub fn exit_code(&self) -> Option<i32> {
        match self {
            ExecutionError::NonZeroExit { exit_code, .. } => Some(*exit_code),
            _ => None,
        }
    }

    pub fn stderr(&self) -> &str {
        match self {
            ExecutionError::NonZeroExit { stderr, .. } => stderr,
            ExecutionError::SpawnFailure { message, .. } => message,
            ExecutionError::Timeout { .. } => "",
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, ExecutionError::SpawnFailure { not_found: true, .. })
    }

    /// Short, stable description used as issue evidence
    pub fn evidence(&self) -> String {
        match self {
            ExecutionError::Timeout { command, timeout_ms } => {
                format!("{command}: timed out after {timeout_ms}ms")
            }
            ExecutionError::NonZeroExit {
                command,
                exit_code,
                stderr,
                ..
            } => {
                let stderr = stderr.trim();
                if stderr.is_empty() {
                    format!("{command}: exit code {exit_code}")
                } else {
                    format!("{command}: exit code {exit_code}: {stderr}")
                }
            }
            ExecutionError::SpawnFailure {
                command, not_found, ..
            } => {
                if *not_found {
                    format!("{command}: command not found")
                } else {
                    format!("{command}: spawn failed")
                }
            }
        }
    }

    pub fn suggestion(&self) -> String {
        match self {
            ExecutionError::Timeout { command, .. } => format!(
                "`{command}` did not answer in time; check whether it waits for a GUI prompt or a locked keyring"
            ),
            ExecutionError::NonZeroExit { command, .. } => {
                format!("Run `{command}` manually to see the full error output")
            }
            ExecutionError::SpawnFailure { command, .. } => format!(
                "Make sure the program behind `{command}` is installed and on PATH"
            ),
        }
    }
}

/// Render a program and its arguments as a shell-safe command line
pub fn render_command(program: &str, args: &[&str]) -> String {
    shell_words::join(std::iter::once(program).chain(args.iter().copied()))
}

/// Runs external commands with a deadline.
///
/// Probes hold an `Arc<dyn CommandRunner>` so tests can substitute a scripted
/// runner; `SystemRunner` is the real implementation.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(
        &self,
        program: &str,
        args: &[&str],
        timeout: Duration,
    ) -> Result<CommandOutput, ExecutionError>;
}

/// Cross-platform runner backed by `tokio::process`
#[derive(Debug, Default, Clone)]
pub struct SystemRunner;

#[async_trait]
impl CommandRunner for SystemRunner {
    async fn run(
        &self,
        program: &str,
        args: &[&str],
        timeout: Duration,
    ) -> Result<CommandOutput, ExecutionError> {
        let start_time = Instant::now();
        let command = render_command(program, args);
        debug!("Executing command: {} (timeout: {}ms)", command, timeout.as_millis());

        let child = AsyncCommand::new(program)
            .args(args)
            .env("LC_ALL", "C")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ExecutionError::SpawnFailure {
                command: command.clone(),
                message: e.to_string(),
                not_found: e.kind() == std::io::ErrorKind::NotFound,
            })?;

        // Dropping the wait future on timeout drops the child, which kills it
        let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(ExecutionError::SpawnFailure {
                    command,
                    message: e.to_string(),
                    not_found: false,
                })
            }
            Err(_) => {
                warn!("Command timed out and was killed: {}", command);
                return Err(ExecutionError::Timeout {
                    command,
                    timeout_ms: timeout.as_millis() as u64,
                });
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        let exit_code = output.status.code().unwrap_or(-1);
        let execution_time_ms = start_time.elapsed().as_millis();

        if exit_code != 0 {
            debug!("Command {} exited with {}", command, exit_code);
            return Err(ExecutionError::NonZeroExit {
                command,
                exit_code,
                stdout,
                stderr,
            });
        }

        Ok(CommandOutput {
            stdout,
            stderr,
            exit_code,
            execution_time_ms,
        })
    }
}

/// Executable name of a credential helper
pub fn helper_binary(helper: &str) -> String {
    format!("docker-credential-{helper}")
}

/// Health of a credential helper as seen through `<helper> list`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum HelperStatus {
    Working,
    /// Exit code 1 from `list`: installed but unable to reach its store
    Broken { evidence: String },
    Failed { evidence: String },
    TimedOut { evidence: String },
    NotInstalled,
}

impl HelperStatus {
    pub fn is_working(&self) -> bool {
        matches!(self, HelperStatus::Working)
    }

    pub fn is_installed(&self) -> bool {
        !matches!(self, HelperStatus::NotInstalled)
    }
}

/// Classify the result of a `docker-credential-<helper> list` invocation.
///
/// Exit code 1 is the broken-helper signal, not a generic failure.
pub fn classify_helper_list(result: &Result<CommandOutput, ExecutionError>) -> HelperStatus {
    match result {
        Ok(_) => HelperStatus::Working,
        Err(e @ ExecutionError::NonZeroExit { exit_code: 1, .. }) => HelperStatus::Broken {
            evidence: e.evidence(),
        },
        Err(e) if e.is_not_found() => HelperStatus::NotInstalled,
        Err(e @ ExecutionError::Timeout { .. }) => HelperStatus::TimedOut {
            evidence: e.evidence(),
        },
        Err(e) => HelperStatus::Failed {
            evidence: e.evidence(),
        },
    }
}

/// Invoke `docker-credential-<helper> list` and classify the outcome
pub async fn test_helper(runner: &dyn CommandRunner, helper: &str, timeout: Duration) -> HelperStatus {
    let binary = helper_binary(helper);
    let result = runner.run(&binary, &["list"], timeout).await;
    let status = classify_helper_list(&result);
    debug!("Credential helper {} status: {:?}", helper, status);
    status
}
