//! Built-in tools for Merlin.
//!
//! Declares the three tools the planner may use and provides the concrete
//! collaborators behind them:
//! - `execute_commands` runs through [`ShellRunner`]
//! - `search_files` runs through [`FsSearcher`]
//! - `synthesize` is answered by the planner itself

pub mod search;
pub mod shell;

use merlin_core::tool::{ParamSpec, ParamType, ToolKind, ToolRegistry, ToolSchema};
use serde_json::json;

pub use search::FsSearcher;
pub use shell::ShellRunner;

/// Schema of the `execute_commands` tool.
pub fn execute_commands_schema() -> ToolSchema {
    ToolSchema::new(
        ToolKind::ExecuteCommands,
        "Run shell commands in order, stopping at the first failure. Only allow-listed \
         commands may be used, and only inside the approved directories.",
    )
    .param(ParamSpec::required(
        "commands",
        ParamType::StringArray,
        "Command lines to run, in order",
    ))
    .param(ParamSpec::optional(
        "working_directory",
        ParamType::String,
        "Directory to run in (defaults to the first approved directory)",
    ))
    .param(
        ParamSpec::optional(
            "background",
            ParamType::Boolean,
            "Start a single command detached and return immediately",
        )
        .with_default(json!(false)),
    )
}

/// Schema of the `search_files` tool.
pub fn search_files_schema() -> ToolSchema {
    ToolSchema::new(
        ToolKind::SearchFiles,
        "Find files whose names match a glob pattern. Returns {paths, count}.",
    )
    .param(ParamSpec::required(
        "pattern",
        ParamType::String,
        "Case-insensitive glob on file names, e.g. *.pdf",
    ))
    .param(ParamSpec::optional(
        "roots",
        ParamType::StringArray,
        "Directories to search (default: configured search roots)",
    ))
    .param(ParamSpec::optional(
        "contains",
        ParamType::String,
        "Only keep files whose content contains this text",
    ))
    .param(ParamSpec::optional(
        "max_results",
        ParamType::Integer,
        "Maximum number of paths to return",
    ))
}

/// Schema of the `synthesize` tool.
pub fn synthesize_schema() -> ToolSchema {
    ToolSchema::new(
        ToolKind::Synthesize,
        "Summarize or reason over the results of earlier steps. Returns {text}.",
    )
    .param(ParamSpec::required(
        "instruction",
        ParamType::String,
        "What to produce from the earlier results",
    ))
}

/// Create a registry declaring all built-in tools.
pub fn default_registry() -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    for schema in [execute_commands_schema(), search_files_schema(), synthesize_schema()] {
        // Each built-in kind appears once in the list above.
        if let Err(e) = registry.declare(schema) {
            tracing::warn!(error = %e, "Skipping duplicate built-in tool");
        }
    }
    registry
}
