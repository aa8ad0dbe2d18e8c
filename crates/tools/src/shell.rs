//! Shell runner — the command-execution collaborator.
//!
//! Runs one command line through the platform shell. Policy has already been
//! enforced by the executor; this only spawns and captures.

use async_trait::async_trait;
use merlin_core::collaborator::{CommandOutput, CommandRunner};
use merlin_core::error::ToolError;
use std::path::Path;
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, warn};

/// Executes commands with `sh -c` (`cmd /C` on Windows).
#[derive(Debug, Default, Clone)]
pub struct ShellRunner;

impl ShellRunner {
    pub fn new() -> Self {
        Self
    }

    fn command(command: &str, working_directory: &Path) -> Command {
        let mut cmd = if cfg!(target_os = "windows") {
            let mut c = Command::new("cmd");
            c.args(["/C", command]);
            c
        } else {
            let mut c = Command::new("sh");
            c.args(["-c", command]);
            c
        };
        cmd.current_dir(working_directory).stdin(Stdio::null());
        cmd
    }

    fn failed(reason: impl Into<String>) -> ToolError {
        ToolError::ExecutionFailed {
            tool_name: "execute_commands".into(),
            reason: reason.into(),
        }
    }
}

#[async_trait]
impl CommandRunner for ShellRunner {
    fn name(&self) -> &str {
        "shell"
    }

    async fn run(&self, command: &str, working_directory: &Path) -> Result<CommandOutput, ToolError> {
        debug!(command = %command, cwd = %working_directory.display(), "Executing shell command");

        // A timed-out step drops this future; the child goes with it.
        let output = Self::command(command, working_directory)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| Self::failed(format!("failed to spawn '{command}': {e}")))?;

        let exit_code = output.status.code().unwrap_or(-1);
        if exit_code != 0 {
            warn!(command = %command, exit_code, "Command failed");
        }

        Ok(CommandOutput {
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            exit_code,
        })
    }

    async fn spawn_background(&self, command: &str, working_directory: &Path) -> Result<(), ToolError> {
        let child = Self::command(command, working_directory)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| Self::failed(format!("failed to spawn '{command}': {e}")))?;
        debug!(command = %command, pid = ?child.id(), "Started background command");
        Ok(())
    }
}
