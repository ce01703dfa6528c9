// src/executor.rs
use async_trait::async_trait;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::debug;

/// Outcome of running a job's command. Executors never fail outright: every
/// problem, including a timeout, is a `Failure` carrying a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionOutcome {
    Success { output: String },
    Failure { error: String },
}

impl ExecutionOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, ExecutionOutcome::Success { .. })
    }
}

/// Raw result of a finished or abandoned command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandResult {
    Exited {
        /// `None` when the process was killed by a signal
        exit_code: Option<i32>,
        stdout: String,
        stderr: String,
    },
    TimedOut { after: Duration },
}

impl From<CommandResult> for ExecutionOutcome {
    fn from(result: CommandResult) -> Self {
        match result {
            CommandResult::Exited {
                exit_code: Some(0),
                stdout,
                ..
            } => {
                let output = stdout.trim();
                ExecutionOutcome::Success {
                    output: if output.is_empty() {
                        "(no output)".to_string()
                    } else {
                        output.to_string()
                    },
                }
            }
            CommandResult::Exited {
                exit_code, stderr, ..
            } => {
                let stderr = stderr.trim();
                let error = if !stderr.is_empty() {
                    stderr.to_string()
                } else {
                    match exit_code {
                        Some(code) => format!("Command failed with exit code {}", code),
                        None => "Command terminated by signal".to_string(),
                    }
                };
                ExecutionOutcome::Failure { error }
            }
            CommandResult::TimedOut { after } => ExecutionOutcome::Failure {
                error: format!("Command timed out after {}s", after.as_secs()),
            },
        }
    }
}

/// Capability that actually runs a job's command.
#[async_trait]
pub trait JobExecutor: Send + Sync {
    async fn run(&self, command: &str, timeout: Option<Duration>) -> ExecutionOutcome;
}

/// Runs commands through a shell (`sh -c` by default).
#[derive(Debug, Clone)]
pub struct ShellExecutor {
    shell: String,
}

impl Default for ShellExecutor {
    fn default() -> Self {
        Self {
            shell: "sh".to_string(),
        }
    }
}

impl ShellExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_shell(shell: impl Into<String>) -> Self {
        Self {
            shell: shell.into(),
        }
    }

    /// Spawn `command` and wait for it, killing it once `limit` elapses.
    pub async fn spawn(&self, command: &str, limit: Option<Duration>) -> std::io::Result<CommandResult> {
        let child = Command::new(&self.shell)
            .arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let output = match limit {
            // Dropping the child on timeout kills it.
            Some(limit) => match timeout(limit, child.wait_with_output()).await {
                Ok(output) => output?,
                Err(_) => return Ok(CommandResult::TimedOut { after: limit }),
            },
            None => child.wait_with_output().await?,
        };

        Ok(CommandResult::Exited {
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

#[async_trait]
impl JobExecutor for ShellExecutor {
    async fn run(&self, command: &str, timeout: Option<Duration>) -> ExecutionOutcome {
        debug!(command = %command, ?timeout, "Running command");
        match self.spawn(command, timeout).await {
            Ok(result) => result.into(),
            Err(e) => ExecutionOutcome::Failure {
                error: format!("Failed to start command: {}", e),
            },
        }
    }
}
