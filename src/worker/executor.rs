use std::process::Stdio;

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;

use crate::scheduler::command::JobCommand;

#[derive(Error, Debug)]
pub enum ExecutionError {
    #[error("{0}")]
    Failed(String),

    #[error("Failed to start command: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("Execution timed out after {0} ms")]
    TimedOut(u64),

    #[error("Execution aborted: {0}")]
    Aborted(String),
}

/// Runs a classified job command and returns its output.
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    async fn execute(&self, command: &JobCommand) -> Result<String, ExecutionError>;
}

/// Executes commands as local processes.
///
/// - Shell commands run through `sh -c`
/// - Scripts are executed directly by path and must be executable
/// - API calls are plain GETs through `curl`, failing on HTTP errors
#[derive(Debug, Clone)]
pub struct ProcessExecutor {
    shell: String,
    http_client: String,
}

impl Default for ProcessExecutor {
    fn default() -> Self {
        Self {
            shell: "sh".to_string(),
            http_client: "curl".to_string(),
        }
    }
}

impl ProcessExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_shell(mut self, shell: impl Into<String>) -> Self {
        self.shell = shell.into();
        self
    }

    fn build(&self, command: &JobCommand) -> Command {
        let mut cmd = match command {
            JobCommand::Shell(line) => {
                let mut cmd = Command::new(&self.shell);
                cmd.arg("-c").arg(line);
                cmd
            }
            JobCommand::Script(path) => Command::new(path),
            JobCommand::ApiCall(url) => {
                let mut cmd = Command::new(&self.http_client);
                cmd.args(["-fsS", url]);
                cmd
            }
        };
        cmd.stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    fn process_output(
        command: &JobCommand,
        output: std::process::Output,
    ) -> Result<String, ExecutionError> {
        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        if output.status.success() {
            tracing::debug!(%command, "Command succeeded");
            return Ok(stdout);
        }

        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        let exit_code = output.status.code();
        tracing::debug!(%command, exit_code = ?exit_code, "Command failed");
        Err(ExecutionError::Failed(if stderr.is_empty() {
            format!("Exit code: {:?}", exit_code)
        } else {
            stderr
        }))
    }
}

#[async_trait]
impl CommandExecutor for ProcessExecutor {
    async fn execute(&self, command: &JobCommand) -> Result<String, ExecutionError> {
        tracing::info!(%command, capability = %command.capability(), "Executing command");
        let output = self.build(command).output().await?;
        Self::process_output(command, output)
    }
}
