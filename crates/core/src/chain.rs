//! Reasoning chain — the record of one query's decomposition and execution.
//!
//! A chain owns the executed steps (an append-only log), the remainder of the
//! most recently accepted plan, the lifecycle state and, once terminal, the
//! final answer. All state changes go through methods that enforce the
//! lifecycle rules; the engine never pokes fields directly.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::VecDeque;
use uuid::Uuid;
use crate::error::{ChainError, ErrorKind};
use crate::text::truncate_chars;
use crate::tool::ToolKind;

/// Unique identifier for a chain.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChainId(String);

impl ChainId {
    /// Allocate a fresh random id (`chain_<12 hex>`).
    pub fn new() -> Self {
        let hex = Uuid::new_v4().simple().to_string();
        Self(format!("chain_{}", &hex[..12]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ChainId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<&str> for ChainId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl std::fmt::Display for ChainId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

// ── Steps ──

/// Lifecycle status of a single step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl StepStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, StepStatus::Succeeded | StepStatus::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            StepStatus::Pending => "PENDING",
            StepStatus::Running => "RUNNING",
            StepStatus::Succeeded => "SUCCEEDED",
            StepStatus::Failed => "FAILED",
        }
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The result recorded on a terminal step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum StepOutcome {
    Success { output: Value },
    Failure { kind: ErrorKind, message: String },
}

/// A step as proposed by the planner, before validation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepProposal {
    #[serde(default)]
    pub description: String,

    #[serde(alias = "tool_name")]
    pub tool: String,

    #[serde(default, alias = "tool_args", alias = "args")]
    pub arguments: Value,
}

impl StepProposal {
    pub fn new(description: impl Into<String>, tool: impl Into<String>, arguments: Value) -> Self {
        Self {
            description: description.into(),
            tool: tool.into(),
            arguments,
        }
    }
}

/// A validated proposal waiting in the chain's plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlannedStep {
    pub description: String,
    pub tool: ToolKind,
    pub arguments: Map<String, Value>,
}

impl PlannedStep {
    pub fn new(description: impl Into<String>, tool: ToolKind, arguments: Map<String, Value>) -> Self {
        Self {
            description: description.into(),
            tool,
            arguments,
        }
    }
}

/// One dispatched tool invocation within a chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReasoningStep {
    /// Position in the chain, fixed at creation
    pub index: usize,

    /// Human-readable intent of the step
    pub description: String,

    pub tool: ToolKind,

    /// Arguments as planned (may contain step references)
    pub arguments: Map<String, Value>,

    /// Arguments after step references were resolved
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_arguments: Option<Map<String, Value>>,

    pub status: StepStatus,

    /// Present iff the step is terminal
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<StepOutcome>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl ReasoningStep {
    pub fn new(index: usize, planned: PlannedStep) -> Self {
        Self {
            index,
            description: planned.description,
            tool: planned.tool,
            arguments: planned.arguments,
            resolved_arguments: None,
            status: StepStatus::Pending,
            outcome: None,
            started_at: None,
            finished_at: None,
        }
    }

    fn not_dispatchable(&self, reason: &str) -> ChainError {
        ChainError::NotDispatchable {
            index: self.index,
            status: self.status.to_string(),
            reason: reason.to_string(),
        }
    }

    /// PENDING → RUNNING.
    pub fn start(&mut self) -> Result<(), ChainError> {
        if self.status != StepStatus::Pending {
            return Err(self.not_dispatchable("only a pending step can start"));
        }
        self.status = StepStatus::Running;
        self.started_at = Some(Utc::now());
        Ok(())
    }

    /// RUNNING → SUCCEEDED with a payload.
    pub fn succeed(&mut self, output: Value) -> Result<(), ChainError> {
        self.finish(StepStatus::Succeeded, StepOutcome::Success { output })
    }

    /// RUNNING → FAILED with an error detail.
    pub fn fail(&mut self, kind: ErrorKind, message: impl Into<String>) -> Result<(), ChainError> {
        self.finish(
            StepStatus::Failed,
            StepOutcome::Failure {
                kind,
                message: message.into(),
            },
        )
    }

    fn finish(&mut self, status: StepStatus, outcome: StepOutcome) -> Result<(), ChainError> {
        if self.status != StepStatus::Running {
            return Err(self.not_dispatchable("only a running step can finish"));
        }
        self.status = status;
        self.outcome = Some(outcome);
        self.finished_at = Some(Utc::now());
        Ok(())
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// The success payload, if the step succeeded.
    pub fn output(&self) -> Option<&Value> {
        match &self.outcome {
            Some(StepOutcome::Success { output }) => Some(output),
            _ => None,
        }
    }

    /// The failure kind, if the step failed.
    pub fn error_kind(&self) -> Option<ErrorKind> {
        match &self.outcome {
            Some(StepOutcome::Failure { kind, .. }) => Some(*kind),
            _ => None,
        }
    }

    pub fn duration_ms(&self) -> Option<u64> {
        let (start, end) = (self.started_at?, self.finished_at?);
        u64::try_from((end - start).num_milliseconds()).ok()
    }

    /// One-line summary used in prompts and partial answers.
    pub fn summary(&self) -> String {
        let result = match &self.outcome {
            Some(StepOutcome::Success { output }) => brief(output),
            Some(StepOutcome::Failure { kind, message }) => format!("{kind}: {message}"),
            None => String::from("(no result)"),
        };
        format!(
            "Step {} [{}] {} -> {}: {}",
            self.index, self.tool, self.description, self.status, result
        )
    }
}

const BRIEF_LIMIT: usize = 400;

/// Compact text rendering of a step payload.
fn brief(output: &Value) -> String {
    let text = if let Some(text) = output.get("text").and_then(Value::as_str) {
        text.to_string()
    } else if let Some(paths) = output.get("paths").and_then(Value::as_array) {
        if paths.is_empty() {
            String::from("no matching files")
        } else {
            let names: Vec<&str> = paths.iter().filter_map(Value::as_str).collect();
            format!("{} file(s): {}", names.len(), names.join(", "))
        }
    } else if let Some(stdout) = output.get("stdout").and_then(Value::as_str) {
        if stdout.trim().is_empty() {
            String::from("completed with no output")
        } else {
            stdout.trim().to_string()
        }
    } else {
        output.to_string()
    };

    truncate_chars(&text, BRIEF_LIMIT)
}

// ── Chains ──

/// Lifecycle state of a chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChainState {
    Planning,
    Executing,
    Synthesizing,
    Done,
    Aborted,
}

impl ChainState {
    pub fn is_terminal(self) -> bool {
        matches!(self, ChainState::Done | ChainState::Aborted)
    }

    /// Whether `self → to` is a legal lifecycle move.
    pub fn can_transition(self, to: ChainState) -> bool {
        use ChainState::*;
        match (self, to) {
            (Planning, Executing)
            | (Planning, Synthesizing)
            | (Executing, Planning)
            | (Executing, Synthesizing)
            | (Synthesizing, Done) => true,
            (from, Aborted) => !from.is_terminal(),
            _ => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ChainState::Planning => "PLANNING",
            ChainState::Executing => "EXECUTING",
            ChainState::Synthesizing => "SYNTHESIZING",
            ChainState::Done => "DONE",
            ChainState::Aborted => "ABORTED",
        }
    }
}

impl std::fmt::Display for ChainState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The answer handed back to the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinalAnswer {
    pub text: String,

    /// True when the chain aborted and this is a best-effort summary
    pub partial: bool,

    /// Terminal error kind of an aborted chain
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorKind>,
}

/// Why a chain was aborted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AbortInfo {
    pub kind: ErrorKind,
    pub message: String,
}

/// The full record of one user query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReasoningChain {
    pub id: ChainId,

    /// Original user request
    pub query: String,

    /// Dispatched steps, in execution order
    pub steps: Vec<ReasoningStep>,

    /// Accepted but not yet dispatched steps
    pub plan: VecDeque<PlannedStep>,

    pub state: ChainState,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_answer: Option<FinalAnswer>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub abort: Option<AbortInfo>,

    /// Number of replanning cycles so far
    pub replans: u32,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ReasoningChain {
    pub fn new(id: ChainId, query: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id,
            query: query.into(),
            steps: Vec::new(),
            plan: VecDeque::new(),
            state: ChainState::Planning,
            final_answer: None,
            abort: None,
            replans: 0,
            created_at: now,
            updated_at: now,
        }
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Move to a new lifecycle state.
    pub fn transition(&mut self, to: ChainState) -> Result<(), ChainError> {
        if !self.state.can_transition(to) {
            return Err(ChainError::InvalidTransition {
                from: self.state.to_string(),
                to: to.to_string(),
            });
        }
        self.state = to;
        self.touch();
        Ok(())
    }

    /// Replace the pending plan with a freshly accepted one.
    pub fn accept_plan(&mut self, steps: Vec<PlannedStep>) -> Result<(), ChainError> {
        if self.state != ChainState::Planning {
            return Err(ChainError::InvalidTransition {
                from: self.state.to_string(),
                to: ChainState::Planning.to_string(),
            });
        }
        self.plan = steps.into();
        self.touch();
        Ok(())
    }

    /// EXECUTING → PLANNING, discarding steps that were not dispatched yet.
    pub fn begin_replan(&mut self) -> Result<(), ChainError> {
        self.transition(ChainState::Planning)?;
        self.plan.clear();
        self.replans += 1;
        Ok(())
    }

    /// Index the next dispatched step will get.
    pub fn next_index(&self) -> usize {
        self.steps.len()
    }

    /// Pop the next planned step and append it as a PENDING step.
    ///
    /// Returns `None` when the plan is exhausted. Refuses while the previous
    /// step is still in flight.
    pub fn dispatch_next(&mut self) -> Result<Option<ReasoningStep>, ChainError> {
        if let Some(last) = self.steps.last()
            && !last.is_terminal()
        {
            return Err(last.not_dispatchable("a later step cannot be dispatched before this one finishes"));
        }
        if !matches!(self.state, ChainState::Planning | ChainState::Executing) {
            return Err(ChainError::InvalidTransition {
                from: self.state.to_string(),
                to: ChainState::Executing.to_string(),
            });
        }
        let Some(planned) = self.plan.pop_front() else {
            return Ok(None);
        };
        if self.state == ChainState::Planning {
            self.transition(ChainState::Executing)?;
        }
        let step = ReasoningStep::new(self.next_index(), planned);
        self.steps.push(step.clone());
        self.touch();
        Ok(Some(step))
    }

    /// Mark a dispatched step as running.
    pub fn mark_running(&mut self, index: usize) -> Result<(), ChainError> {
        let step = self.step_mut(index)?;
        step.start()?;
        self.touch();
        Ok(())
    }

    /// Write a terminal step back into the log.
    pub fn record_step(&mut self, step: ReasoningStep) -> Result<(), ChainError> {
        let slot = self.step_mut(step.index)?;
        if slot.is_terminal() {
            return Err(slot.not_dispatchable("result already recorded"));
        }
        if !step.is_terminal() {
            return Err(step.not_dispatchable("only a finished step can be recorded"));
        }
        *slot = step;
        self.touch();
        Ok(())
    }

    fn step_mut(&mut self, index: usize) -> Result<&mut ReasoningStep, ChainError> {
        let id = self.id.to_string();
        self.steps
            .get_mut(index)
            .ok_or_else(|| ChainError::NotFound(format!("{id} step {index}")))
    }

    /// SYNTHESIZING → DONE with the synthesized answer.
    pub fn complete(&mut self, text: impl Into<String>) -> Result<(), ChainError> {
        if self.final_answer.is_some() {
            return Err(ChainError::AlreadyAnswered(self.id.to_string()));
        }
        if let Some(open) = self.steps.iter().find(|s| !s.is_terminal()) {
            return Err(open.not_dispatchable("cannot answer while a step is unfinished"));
        }
        self.transition(ChainState::Done)?;
        self.final_answer = Some(FinalAnswer {
            text: text.into(),
            partial: false,
            error: None,
        });
        Ok(())
    }

    /// Abort the chain with a best-effort partial answer.
    ///
    /// Returns `false` when the chain was already terminal.
    pub fn abort(&mut self, kind: ErrorKind, message: impl Into<String>) -> bool {
        if self.is_terminal() {
            return false;
        }
        let message = message.into();
        self.state = ChainState::Aborted;
        self.plan.clear();
        self.final_answer = Some(FinalAnswer {
            text: self.partial_summary(kind, &message),
            partial: true,
            error: Some(kind),
        });
        self.abort = Some(AbortInfo { kind, message });
        self.touch();
        true
    }

    /// Summary of whatever completed, for an aborted chain.
    pub fn partial_summary(&self, kind: ErrorKind, message: &str) -> String {
        let mut out = format!(
            "[partial] Could not finish \"{}\" ({kind}: {message}).",
            self.query
        );
        let done: Vec<&ReasoningStep> = self
            .steps
            .iter()
            .filter(|s| s.status == StepStatus::Succeeded)
            .collect();
        if done.is_empty() {
            out.push_str(" No steps completed.");
        } else {
            out.push_str(" Completed steps:");
            for step in done {
                let result = step.output().map(brief).unwrap_or_default();
                out.push_str(&format!("\n- {}: {}", step.description, result));
            }
        }
        out
    }

    /// The answer, once the chain is terminal.
    pub fn outcome(&self) -> Option<&FinalAnswer> {
        if self.is_terminal() {
            self.final_answer.as_ref()
        } else {
            None
        }
    }
}
