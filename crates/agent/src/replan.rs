//! Replanning policy — decides, at a step boundary, whether the rest of the
//! plan should be thrown away and planned again.

use merlin_core::chain::{ReasoningChain, ReasoningStep, StepStatus};
use merlin_core::tool::ToolKind;
use serde_json::Value;

/// Why a replan was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplanReason {
    /// The step failed
    Failure,
    /// A search step succeeded but found nothing
    EmptyResults,
}

impl ReplanReason {
    pub fn as_str(self) -> &'static str {
        match self {
            ReplanReason::Failure => "step failed",
            ReplanReason::EmptyResults => "search found no files",
        }
    }
}

impl std::fmt::Display for ReplanReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Consulted once after every terminal step.
pub trait ReplanPolicy: Send + Sync {
    fn should_replan(&self, step: &ReasoningStep, chain: &ReasoningChain) -> Option<ReplanReason>;
}

/// Replans after failures and, optionally, after empty search results.
#[derive(Debug, Clone, Default)]
pub struct ReplanOnFailure {
    pub on_empty_results: bool,
}

impl ReplanOnFailure {
    pub fn new(on_empty_results: bool) -> Self {
        Self { on_empty_results }
    }
}

impl ReplanPolicy for ReplanOnFailure {
    fn should_replan(&self, step: &ReasoningStep, _chain: &ReasoningChain) -> Option<ReplanReason> {
        match step.status {
            StepStatus::Failed => Some(ReplanReason::Failure),
            StepStatus::Succeeded if self.on_empty_results && step.tool == ToolKind::SearchFiles => {
                let empty = step
                    .output()
                    .and_then(|o| o.get("paths"))
                    .and_then(Value::as_array)
                    .is_some_and(|paths| paths.is_empty());
                empty.then_some(ReplanReason::EmptyResults)
            }
            _ => None,
        }
    }
}
