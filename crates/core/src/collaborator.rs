//! Collaborator traits — the external systems a step dispatches to.
//!
//! The executor enforces policy before calling these; implementations only
//! do the work. Concrete implementations live in `merlin-tools`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use crate::error::ToolError;

/// Captured result of one shell command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Runs shell commands.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    fn name(&self) -> &str;

    /// Run a command to completion in `working_directory`.
    async fn run(&self, command: &str, working_directory: &Path) -> Result<CommandOutput, ToolError>;

    /// Start a command detached and return immediately.
    async fn spawn_background(&self, command: &str, working_directory: &Path) -> Result<(), ToolError> {
        let _ = (command, working_directory);
        Err(ToolError::ExecutionFailed {
            tool_name: self.name().to_string(),
            reason: "background execution is not supported".into(),
        })
    }
}

/// A file-search request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchQuery {
    /// Glob matched against file names (e.g. `*.pdf`)
    pub pattern: String,

    /// Directories to search; nothing outside them is visited
    pub roots: Vec<PathBuf>,

    /// Only keep files whose content contains this text
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contains: Option<String>,

    pub max_results: usize,
    pub max_depth: usize,
}

/// Read-only file index.
#[async_trait]
pub trait FileSearcher: Send + Sync {
    fn name(&self) -> &str;

    async fn search(&self, query: &SearchQuery) -> Result<Vec<PathBuf>, ToolError>;
}
