//! Error types for the Merlin domain.
//!
//! Uses `thiserror` for ergonomic error definitions.
//! Each bounded context has its own error enum; [`ErrorKind`] is the
//! serializable tag that gets recorded on failed steps and aborted chains.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The top-level error type for all Merlin operations.
#[derive(Debug, Error)]
pub enum Error {
    // --- Planning / synthesis collaborator ---
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    // --- Tool declaration, validation and execution ---
    #[error("Tool error: {0}")]
    Tool(#[from] ToolError),

    // --- Chain lifecycle and registry lookups ---
    #[error("Chain error: {0}")]
    Chain(#[from] ChainError),

    // --- Configuration errors ---
    #[error("Configuration error: {message}")]
    Config { message: String },

    // --- Serialization ---
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // --- Generic ---
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias using our Error.
pub type Result<T> = std::result::Result<T, Error>;

// --- Bounded context errors ---

#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    #[error("API request failed: {message} (status: {status_code})")]
    ApiError {
        status_code: u16,
        message: String,
    },

    #[error("Rate limited by provider, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Model not found: {0}")]
    ModelNotFound(String),

    #[error("Provider not configured: {0}")]
    NotConfigured(String),

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Unusable response: {0}")]
    InvalidResponse(String),
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ToolError {
    #[error("Unknown tool: {0}")]
    UnknownTool(String),

    #[error("Tool already declared: {0}")]
    DuplicateTool(String),

    #[error("Schema violation in {tool_name}: {reason}")]
    SchemaViolation { tool_name: String, reason: String },

    #[error("Policy violation in {tool_name}: {reason}")]
    PolicyViolation { tool_name: String, reason: String },

    #[error("Tool timed out: {tool_name} after {timeout_ms}ms")]
    Timeout { tool_name: String, timeout_ms: u64 },

    #[error("Tool execution failed: {tool_name}: {reason}")]
    ExecutionFailed { tool_name: String, reason: String },
}

impl ToolError {
    /// The kind tag recorded on a step that failed with this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ToolError::UnknownTool(_) => ErrorKind::UnknownTool,
            ToolError::DuplicateTool(_) | ToolError::SchemaViolation { .. } => {
                ErrorKind::SchemaViolation
            }
            ToolError::PolicyViolation { .. } => ErrorKind::PolicyViolation,
            ToolError::Timeout { .. } => ErrorKind::Timeout,
            ToolError::ExecutionFailed { .. } => ErrorKind::ExecutionFailed,
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ChainError {
    #[error("Chain not found: {0}")]
    NotFound(String),

    #[error("Invalid chain transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Chain {0} already has a final answer")]
    AlreadyAnswered(String),

    #[error("Chain {0} is still active")]
    StillActive(String),

    #[error("Step {index} cannot move from {status}: {reason}")]
    NotDispatchable {
        index: usize,
        status: String,
        reason: String,
    },
}

/// Serializable error classification recorded on steps and chains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    UnknownTool,
    SchemaViolation,
    PolicyViolation,
    Timeout,
    ExecutionFailed,
    Provider,
    Cancelled,
    BudgetExceeded,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorKind::UnknownTool => "unknown_tool",
            ErrorKind::SchemaViolation => "schema_violation",
            ErrorKind::PolicyViolation => "policy_violation",
            ErrorKind::Timeout => "timeout",
            ErrorKind::ExecutionFailed => "execution_failed",
            ErrorKind::Provider => "provider",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::BudgetExceeded => "budget_exceeded",
        };
        f.write_str(s)
    }
}
