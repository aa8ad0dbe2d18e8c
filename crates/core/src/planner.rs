//! Planner trait — the language-model contract the engine depends on.
//!
//! A planner decomposes a query into step proposals and, at the end, turns
//! the step history into a free-text answer. `merlin-agent` ships one backed
//! by any [`Provider`](crate::provider::Provider).

use async_trait::async_trait;
use crate::chain::{ReasoningStep, StepProposal};
use crate::error::ProviderError;
use crate::provider::ToolDefinition;

/// Input to a planning call.
#[derive(Debug, Clone, Default)]
pub struct PlanRequest {
    pub query: String,

    /// Steps executed so far (empty on the first plan)
    pub history: Vec<ReasoningStep>,

    /// Tools the plan may use
    pub tools: Vec<ToolDefinition>,

    /// Directories commands and searches may touch
    pub directories: Vec<String>,

    /// Why the previous plan was rejected, if it was
    pub feedback: Option<String>,
}

/// Input to a synthesis call.
#[derive(Debug, Clone, Default)]
pub struct SynthesisRequest {
    pub query: String,
    pub history: Vec<ReasoningStep>,
}

#[async_trait]
pub trait Planner: Send + Sync {
    fn name(&self) -> &str;

    /// Propose an ordered list of steps. An empty list means the query can be
    /// answered directly.
    async fn plan(&self, request: &PlanRequest) -> Result<Vec<StepProposal>, ProviderError>;

    /// Produce a free-text answer from the history.
    async fn synthesize(&self, request: &SynthesisRequest) -> Result<String, ProviderError>;
}
