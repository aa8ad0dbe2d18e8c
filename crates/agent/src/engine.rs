//! The reasoning engine — plans a query, runs its steps in order, replans
//! when a step result calls for it, and synthesizes the final answer.
//!
//! Each chain is driven by one task that walks the lifecycle
//! `PLANNING → EXECUTING → SYNTHESIZING → DONE`, with `ABORTED` reachable
//! from any non-terminal state. The driver suspends on every collaborator
//! call; steps of one chain never overlap. Distinct chains only meet in the
//! [`ChainRegistry`].

use merlin_config::{AppConfig, ReasoningConfig};
use merlin_core::binding;
use merlin_core::chain::{
    ChainId, ChainState, FinalAnswer, PlannedStep, ReasoningChain, StepProposal, StepStatus,
};
use merlin_core::collaborator::{CommandRunner, FileSearcher};
use merlin_core::error::{ChainError, Error, ErrorKind, Result, ToolError};
use merlin_core::event::{DomainEvent, EventBus};
use merlin_core::planner::{PlanRequest, Planner, SynthesisRequest};
use merlin_core::text::truncate_chars;
use merlin_core::tool::ToolRegistry;
use merlin_security::{AuditLogger, CommandPolicy};
use merlin_tools::default_registry;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use crate::executor::{StepContext, StepExecutor};
use crate::registry::ChainRegistry;
use crate::replan::{ReplanOnFailure, ReplanPolicy, ReplanReason};

/// How a planning round ended.
enum Planned {
    Accepted,
    Aborted,
}

/// Orchestrates chains from query to final answer.
pub struct ReasoningEngine {
    /// Every chain the engine knows about
    chains: Arc<ChainRegistry>,

    /// Runs individual steps
    executor: StepExecutor,

    /// Plans queries and synthesizes answers
    planner: Arc<dyn Planner>,

    /// Declared tools, for plan validation and the planning prompt
    tools: Arc<ToolRegistry>,

    /// Decides whether a finished step triggers a replan
    replan_policy: Arc<dyn ReplanPolicy>,

    /// Event bus for domain events
    event_bus: Arc<EventBus>,

    /// Attempt counts, budgets and timeouts
    config: ReasoningConfig,

    /// Directories named in the planning prompt
    directories: Vec<String>,
}

impl ReasoningEngine {
    /// Create an engine.
    pub fn new(
        planner: Arc<dyn Planner>,
        executor: StepExecutor,
        tools: Arc<ToolRegistry>,
        config: ReasoningConfig,
    ) -> Self {
        let directories = executor
            .policy()
            .approved_directories()
            .iter()
            .map(|d| d.display().to_string())
            .collect();
        Self {
            chains: Arc::new(ChainRegistry::new()),
            executor,
            planner,
            tools,
            replan_policy: Arc::new(ReplanOnFailure::new(config.replan_on_empty_results)),
            event_bus: Arc::new(EventBus::default()),
            config,
            directories,
        }
    }

    /// Wire an engine from configuration with the given collaborators.
    ///
    /// The built-in tools are declared, the command policy is compiled from
    /// `[policy]`, and policy decisions are audited through `tracing`.
    pub fn from_config(
        config: &AppConfig,
        planner: Arc<dyn Planner>,
        runner: Arc<dyn CommandRunner>,
        searcher: Arc<dyn FileSearcher>,
    ) -> Result<Self> {
        let policy = CommandPolicy::from_config(&config.policy).map_err(|e| Error::Config {
            message: e.to_string(),
        })?;
        let tools = Arc::new(default_registry());
        let bus = Arc::new(EventBus::default());

        let executor = StepExecutor::new(tools.clone(), runner, searcher, planner.clone(), policy)
            .with_search_roots(&config.search.roots)
            .with_search_limits(config.search.max_results, config.search.max_depth)
            .with_step_timeout(Duration::from_secs(config.reasoning.step_timeout_secs))
            .with_audit(Arc::new(
                AuditLogger::tracing().with_retention(config.policy.audit_retention),
            ))
            .with_event_bus(bus.clone());

        Ok(Self::new(planner, executor, tools, config.reasoning.clone()).with_event_bus(bus))
    }

    /// Replace the replanning policy.
    pub fn with_replan_policy(mut self, policy: Arc<dyn ReplanPolicy>) -> Self {
        self.replan_policy = policy;
        self
    }

    /// Publish events on a shared bus.
    pub fn with_event_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.event_bus = bus;
        self
    }

    /// Store chains in a shared registry.
    pub fn with_registry(mut self, chains: Arc<ChainRegistry>) -> Self {
        self.chains = chains;
        self
    }

    pub fn chains(&self) -> &Arc<ChainRegistry> {
        &self.chains
    }

    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.event_bus
    }

    pub fn tools(&self) -> &ToolRegistry {
        &self.tools
    }

    pub fn executor(&self) -> &StepExecutor {
        &self.executor
    }

    // --- Caller-facing surface ---

    /// Accept a query and drive it on its own task.
    pub async fn submit(self: &Arc<Self>, query: impl Into<String>) -> ChainId {
        let id = self.create(query.into()).await;
        let engine = Arc::clone(self);
        let driver_id = id.clone();
        tokio::spawn(async move {
            engine.drive(&driver_id).await;
        });
        id
    }

    /// Drive a query to completion on the current task and return the
    /// terminal chain.
    pub async fn run(&self, query: impl Into<String>) -> Result<ReasoningChain> {
        let id = self.create(query.into()).await;
        self.drive(&id).await;
        Ok(self.chains.get(&id).await?)
    }

    /// Snapshot of a chain.
    pub async fn status(&self, id: &ChainId) -> std::result::Result<ReasoningChain, ChainError> {
        self.chains.get(id).await
    }

    /// Wait until a chain is terminal and return its answer.
    pub async fn await_result(&self, id: &ChainId) -> std::result::Result<FinalAnswer, ChainError> {
        let mut state = self.chains.subscribe(id).await?;
        loop {
            let current = *state.borrow_and_update();
            if current.is_terminal() || state.changed().await.is_err() {
                break;
            }
        }
        let chain = self.chains.get(id).await?;
        chain
            .outcome()
            .cloned()
            .ok_or_else(|| ChainError::StillActive(id.to_string()))
    }

    /// Request cancellation; honoured at the next step boundary.
    pub async fn cancel(&self, id: &ChainId) -> std::result::Result<bool, ChainError> {
        let requested = self.chains.cancel(id).await?;
        if requested {
            info!(chain_id = %id, "Cancellation requested");
        }
        Ok(requested)
    }

    // --- Driver ---

    async fn create(&self, query: String) -> ChainId {
        let id = self.chains.create(query.clone()).await;
        info!(chain_id = %id, query = %truncate_chars(&query, 80), "Chain created");
        self.event_bus.publish(DomainEvent::ChainCreated {
            chain_id: id.clone(),
            query_preview: truncate_chars(&query, 80),
            timestamp: chrono::Utc::now(),
        });
        id
    }

    async fn drive(&self, id: &ChainId) {
        let deadline = Instant::now() + Duration::from_secs(self.config.chain_budget_secs);

        if let Err(e) = self.drive_chain(id, deadline).await {
            error!(chain_id = %id, error = %e, "Chain driver failed");
            let aborted = self
                .chains
                .update(id, |c| Ok(c.abort(ErrorKind::ExecutionFailed, e.to_string())))
                .await;
            if let Err(e) = aborted {
                error!(chain_id = %id, error = %e, "Could not abort chain");
            }
        }

        if let Ok(chain) = self.chains.get(id).await {
            let partial = chain.final_answer.as_ref().is_some_and(|a| a.partial);
            info!(
                chain_id = %id,
                state = %chain.state,
                steps = chain.steps.len(),
                replans = chain.replans,
                partial,
                "Chain finished"
            );
            self.event_bus.publish(DomainEvent::ChainFinished {
                chain_id: id.clone(),
                state: chain.state,
                partial,
                timestamp: chrono::Utc::now(),
            });
        }
    }

    async fn drive_chain(&self, id: &ChainId, deadline: Instant) -> std::result::Result<(), ChainError> {
        if let Planned::Aborted = self.plan(id, deadline).await? {
            return Ok(());
        }

        let mut failure_replans = 0u32;
        loop {
            if self.interrupted(id, deadline).await? {
                return Ok(());
            }

            let chain = self.chains.get(id).await?;
            if chain.plan.is_empty() {
                break;
            }
            if chain.next_index() >= self.config.max_steps {
                let message = format!("step limit of {} reached", self.config.max_steps);
                self.abort(id, ErrorKind::BudgetExceeded, message).await?;
                return Ok(());
            }

            let Some(mut step) = self.chains.update(id, |c| c.dispatch_next()).await? else {
                break;
            };
            self.chains.update(id, |c| c.mark_running(step.index)).await?;

            let ctx = StepContext {
                chain_id: id,
                query: &chain.query,
                history: &chain.steps,
                deadline: Some(deadline),
            };
            self.executor.execute(&mut step, &ctx).await?;
            self.chains.update(id, |c| c.record_step(step.clone())).await?;

            let chain = self.chains.get(id).await?;
            let reason = match self.replan_policy.should_replan(&step, &chain) {
                Some(ReplanReason::Failure) if failure_replans >= self.config.max_failure_replans => {
                    let kind = step.error_kind().unwrap_or(ErrorKind::ExecutionFailed);
                    let message = format!(
                        "step {} failed after {failure_replans} replan(s): {}",
                        step.index, step.description
                    );
                    self.abort(id, kind, message).await?;
                    return Ok(());
                }
                Some(ReplanReason::Failure) => {
                    failure_replans += 1;
                    ReplanReason::Failure
                }
                Some(reason) => reason,
                None if step.status == StepStatus::Failed => {
                    let kind = step.error_kind().unwrap_or(ErrorKind::ExecutionFailed);
                    let message = format!("step {} failed: {}", step.index, step.description);
                    self.abort(id, kind, message).await?;
                    return Ok(());
                }
                None => continue,
            };

            // An expired budget or a cancellation ends the chain here; the
            // planner would never see the replan.
            if self.interrupted(id, deadline).await? {
                return Ok(());
            }

            info!(chain_id = %id, after_step = step.index, reason = %reason, "Replanning");
            self.chains.update(id, |c| c.begin_replan()).await?;
            self.event_bus.publish(DomainEvent::Replanned {
                chain_id: id.clone(),
                after_step: step.index,
                reason: reason.to_string(),
                timestamp: chrono::Utc::now(),
            });
            if let Planned::Aborted = self.plan(id, deadline).await? {
                return Ok(());
            }
        }

        if self.interrupted(id, deadline).await? {
            return Ok(());
        }
        self.synthesize(id, deadline).await
    }

    /// Abort the chain if it was cancelled or ran out of time.
    async fn interrupted(&self, id: &ChainId, deadline: Instant) -> std::result::Result<bool, ChainError> {
        if self.chains.is_cancelled(id).await {
            self.abort(id, ErrorKind::Cancelled, "cancelled by caller".into()).await?;
            return Ok(true);
        }
        if Instant::now() >= deadline {
            let message = format!("chain exceeded its {}s budget", self.config.chain_budget_secs);
            self.abort(id, ErrorKind::BudgetExceeded, message).await?;
            return Ok(true);
        }
        Ok(false)
    }

    async fn abort(&self, id: &ChainId, kind: ErrorKind, message: String) -> std::result::Result<(), ChainError> {
        warn!(chain_id = %id, kind = %kind, reason = %message, "Aborting chain");
        self.chains.update(id, |c| Ok(c.abort(kind, message))).await?;
        Ok(())
    }

    fn backoff(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.config.retry_backoff_ms.saturating_mul(u64::from(attempt)))
    }

    // --- Planning ---

    /// Ask for a plan until one validates or the attempts run out.
    async fn plan(&self, id: &ChainId, deadline: Instant) -> std::result::Result<Planned, ChainError> {
        let mut feedback: Option<String> = None;
        let mut last = (ErrorKind::Provider, String::from("no planning attempt was made"));

        for attempt in 1..=self.config.max_plan_attempts {
            if self.interrupted(id, deadline).await? {
                return Ok(Planned::Aborted);
            }

            let chain = self.chains.get(id).await?;
            let request = PlanRequest {
                query: chain.query.clone(),
                history: chain.steps.clone(),
                tools: self.tools.definitions(),
                directories: self.directories.clone(),
                feedback: feedback.clone(),
            };

            debug!(chain_id = %id, attempt, "Requesting plan");
            let reply = match tokio::time::timeout_at(deadline, self.planner.plan(&request)).await {
                Ok(reply) => reply,
                Err(_) => {
                    let message = format!("chain exceeded its {}s budget while planning", self.config.chain_budget_secs);
                    self.abort(id, ErrorKind::BudgetExceeded, message).await?;
                    return Ok(Planned::Aborted);
                }
            };

            match reply {
                Ok(proposals) => match self.validate_plan(&proposals, chain.next_index()) {
                    Ok(planned) => {
                        let steps = planned.len();
                        self.chains.update(id, |c| c.accept_plan(planned)).await?;
                        info!(chain_id = %id, steps, attempt, "Plan accepted");
                        self.event_bus.publish(DomainEvent::PlanAccepted {
                            chain_id: id.clone(),
                            steps,
                            attempt,
                            timestamp: chrono::Utc::now(),
                        });
                        return Ok(Planned::Accepted);
                    }
                    Err(e) => {
                        warn!(chain_id = %id, attempt, error = %e, "Plan rejected");
                        feedback = Some(e.to_string());
                        last = (e.kind(), e.to_string());
                    }
                },
                Err(e) => {
                    warn!(chain_id = %id, attempt, error = %e, "Planner failed");
                    last = (ErrorKind::Provider, e.to_string());
                }
            }

            if attempt < self.config.max_plan_attempts {
                tokio::time::sleep(self.backoff(attempt)).await;
            }
        }

        let (kind, reason) = last;
        let message = format!(
            "no usable plan after {} attempt(s): {reason}",
            self.config.max_plan_attempts
        );
        self.abort(id, kind, message).await?;
        Ok(Planned::Aborted)
    }

    /// Check every proposal against the registry. Steps are numbered from
    /// `first_index`; a step may only refer to steps numbered below its own.
    fn validate_plan(
        &self,
        proposals: &[StepProposal],
        first_index: usize,
    ) -> std::result::Result<Vec<PlannedStep>, ToolError> {
        proposals
            .iter()
            .enumerate()
            .map(|(offset, proposal)| {
                let call = self.tools.validate_planned(&proposal.tool, &proposal.arguments)?;
                let own = first_index + offset;

                let arguments = Value::Object(call.arguments.clone());
                if let Some(ahead) = binding::references(&arguments)
                    .into_iter()
                    .find(|r| r.index >= own)
                {
                    return Err(ToolError::SchemaViolation {
                        tool_name: proposal.tool.clone(),
                        reason: format!(
                            "step {own} refers to step {}, which will not have run yet",
                            ahead.index
                        ),
                    });
                }

                let description = if proposal.description.trim().is_empty() {
                    call.kind.to_string()
                } else {
                    proposal.description.clone()
                };
                Ok(PlannedStep::new(description, call.kind, call.arguments))
            })
            .collect()
    }

    // --- Synthesis ---

    async fn synthesize(&self, id: &ChainId, deadline: Instant) -> std::result::Result<(), ChainError> {
        let chain = self.chains.update(id, |c| {
            c.transition(ChainState::Synthesizing)?;
            Ok(c.clone())
        })
        .await?;
        let request = SynthesisRequest {
            query: chain.query.clone(),
            history: chain.steps.clone(),
        };

        let mut last = String::from("no synthesis attempt was made");
        for attempt in 1..=self.config.max_synthesis_attempts {
            let reply = match tokio::time::timeout_at(deadline, self.planner.synthesize(&request)).await {
                Ok(reply) => reply,
                Err(_) => {
                    let message = format!(
                        "chain exceeded its {}s budget while synthesizing",
                        self.config.chain_budget_secs
                    );
                    self.abort(id, ErrorKind::BudgetExceeded, message).await?;
                    return Ok(());
                }
            };

            match reply {
                Ok(text) => {
                    self.chains.update(id, |c| c.complete(text)).await?;
                    return Ok(());
                }
                Err(e) => {
                    warn!(chain_id = %id, attempt, error = %e, "Synthesis failed");
                    last = e.to_string();
                }
            }

            if attempt < self.config.max_synthesis_attempts {
                tokio::time::sleep(self.backoff(attempt)).await;
            }
        }

        let message = format!(
            "synthesis failed after {} attempt(s): {last}",
            self.config.max_synthesis_attempts
        );
        self.abort(id, ErrorKind::Provider, message).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::{
        ScriptedPlanner, ScriptedRunner, ScriptedSearcher, policy_for, proposal,
    };
    use merlin_core::chain::ReasoningStep;
    use merlin_core::error::ProviderError;
    use serde_json::json;

    struct Harness {
        engine: Arc<ReasoningEngine>,
        planner: Arc<ScriptedPlanner>,
        runner: Arc<ScriptedRunner>,
        _dir: tempfile::TempDir,
    }

    fn test_config() -> ReasoningConfig {
        ReasoningConfig {
            retry_backoff_ms: 1,
            step_timeout_secs: 5,
            ..ReasoningConfig::default()
        }
    }

    fn harness_with(
        planner: ScriptedPlanner,
        runner: ScriptedRunner,
        searcher: ScriptedSearcher,
        config: ReasoningConfig,
    ) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let planner = Arc::new(planner);
        let runner = Arc::new(runner);
        let tools = Arc::new(default_registry());
        let executor = StepExecutor::new(
            tools.clone(),
            runner.clone(),
            Arc::new(searcher),
            planner.clone(),
            policy_for(dir.path()),
        )
        .with_step_timeout(Duration::from_secs(config.step_timeout_secs));
        let engine = ReasoningEngine::new(planner.clone(), executor, tools, config);
        Harness {
            engine: Arc::new(engine),
            planner,
            runner,
            _dir: dir,
        }
    }

    fn harness(planner: ScriptedPlanner, runner: ScriptedRunner, searcher: ScriptedSearcher) -> Harness {
        harness_with(planner, runner, searcher, test_config())
    }

    #[tokio::test]
    async fn single_search_step_reaches_done() {
        let h = harness(
            ScriptedPlanner::new()
                .plan(vec![proposal("search_files", json!({"pattern": "*"}))])
                .answer("Your downloads folder has report.pdf and photo.jpg."),
            ScriptedRunner::new(),
            ScriptedSearcher::new().found(&["/home/u/Downloads/photo.jpg", "/home/u/Downloads/report.pdf"]),
        );

        let chain = h.engine.run("List files in my downloads folder").await.unwrap();
        assert_eq!(chain.state, ChainState::Done);
        assert_eq!(chain.steps.len(), 1);
        assert_eq!(chain.steps[0].status, StepStatus::Succeeded);
        assert_eq!(chain.steps[0].output().unwrap()["count"], 2);

        let answer = chain.outcome().unwrap();
        assert!(!answer.partial);
        assert!(answer.text.contains("report.pdf"));

        let synthesis = &h.planner.synthesis_requests()[0];
        assert_eq!(synthesis.query, "List files in my downloads folder");
        assert_eq!(synthesis.history.len(), 1);
    }

    #[tokio::test]
    async fn empty_plan_answers_directly() {
        let h = harness(
            ScriptedPlanner::new().plan(vec![]).answer("It is a virtual assistant."),
            ScriptedRunner::new(),
            ScriptedSearcher::new(),
        );
        let chain = h.engine.run("What are you?").await.unwrap();

        assert_eq!(chain.state, ChainState::Done);
        assert!(chain.steps.is_empty());
        assert!(h.planner.synthesis_requests()[0].history.is_empty());
    }

    #[tokio::test]
    async fn unreachable_planner_aborts_without_executing() {
        let h = harness(
            ScriptedPlanner::new()
                .plan_error(ProviderError::Network("connection refused".into()))
                .plan_error(ProviderError::Network("connection refused".into()))
                .plan_error(ProviderError::Network("connection refused".into())),
            ScriptedRunner::new(),
            ScriptedSearcher::new(),
        );
        let bus = h.engine.event_bus().clone();
        let mut events = bus.subscribe();

        let chain = h.engine.run("List my downloads").await.unwrap();
        assert_eq!(chain.state, ChainState::Aborted);
        assert!(chain.steps.is_empty());
        assert_eq!(h.planner.plan_calls(), 3);
        assert_eq!(h.planner.synthesis_calls(), 0);

        let answer = chain.outcome().unwrap();
        assert!(answer.partial);
        assert_eq!(answer.error, Some(ErrorKind::Provider));
        assert!(answer.text.starts_with("[partial]"));
        assert!(answer.text.contains("No steps completed"));

        // The chain never went through EXECUTING.
        while let Ok(event) = events.try_recv() {
            assert!(
                !matches!(event.as_ref(), DomainEvent::PlanAccepted { .. } | DomainEvent::StepFinished { .. }),
                "unexpected event: {event:?}"
            );
        }
    }

    #[tokio::test]
    async fn invalid_plan_is_retried_with_feedback() {
        let h = harness(
            ScriptedPlanner::new()
                .plan(vec![proposal("browse_web", json!({"url": "x"}))])
                .plan(vec![proposal("search_files", json!({"pattern": "*.pdf"}))])
                .answer("Found nothing."),
            ScriptedRunner::new(),
            ScriptedSearcher::new(),
        );
        let chain = h.engine.run("find pdfs").await.unwrap();

        assert_eq!(chain.state, ChainState::Done);
        let requests = h.planner.plan_requests();
        assert_eq!(requests.len(), 2);
        assert!(requests[0].feedback.is_none());
        assert!(requests[1].feedback.as_deref().unwrap().contains("browse_web"));
        assert!(requests[0].tools.iter().any(|t| t.name == "execute_commands"));
    }

    #[tokio::test]
    async fn look_ahead_reference_is_rejected() {
        let bad = vec![
            proposal("execute_commands", json!({"commands": ["mv {{step.1.paths}} Finance"]})),
            proposal("search_files", json!({"pattern": "*.pdf"})),
        ];
        let h = harness(
            ScriptedPlanner::new().plan(bad.clone()).plan(bad.clone()).plan(bad),
            ScriptedRunner::new(),
            ScriptedSearcher::new(),
        );
        let chain = h.engine.run("move pdfs").await.unwrap();

        assert_eq!(chain.state, ChainState::Aborted);
        assert_eq!(chain.abort.as_ref().unwrap().kind, ErrorKind::SchemaViolation);
        assert!(h.planner.plan_requests()[1]
            .feedback
            .as_deref()
            .unwrap()
            .contains("will not have run yet"));
        assert!(h.runner.commands().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_replans_once_then_aborts() {
        let mut config = test_config();
        config.step_timeout_secs = 1;
        let h = harness_with(
            ScriptedPlanner::new()
                .plan(vec![proposal("execute_commands", json!({"commands": ["sleep 10"]}))])
                .plan(vec![proposal("execute_commands", json!({"commands": ["sleep 10"]}))]),
            ScriptedRunner::new()
                .slow(Duration::from_secs(10))
                .slow(Duration::from_secs(10)),
            ScriptedSearcher::new(),
            config,
        );
        let chain = h.engine.run("run the slow job").await.unwrap();

        assert_eq!(chain.state, ChainState::Aborted);
        assert_eq!(chain.replans, 1);
        assert_eq!(h.planner.plan_calls(), 2);
        assert_eq!(chain.steps.len(), 2);
        assert!(chain.steps.iter().all(|s| s.error_kind() == Some(ErrorKind::Timeout)));

        let answer = chain.outcome().unwrap();
        assert!(answer.partial);
        assert_eq!(answer.error, Some(ErrorKind::Timeout));
        assert_eq!(h.planner.synthesis_calls(), 0);
    }

    #[tokio::test]
    async fn replan_keeps_finished_steps() {
        let h = harness(
            ScriptedPlanner::new()
                .plan(vec![
                    proposal("search_files", json!({"pattern": "*.pdf"})),
                    proposal("execute_commands", json!({"commands": ["cat {{step.0.paths}}"]})),
                    proposal("synthesize", json!({"instruction": "summarize"})),
                ])
                .plan(vec![proposal("execute_commands", json!({"commands": ["ls"]}))])
                .answer("Listed the folder instead."),
            ScriptedRunner::new().exit(1, "permission denied").ok("a.pdf\n"),
            ScriptedSearcher::new().found(&["/data/a.pdf"]),
        );
        let chain = h.engine.run("read my pdfs").await.unwrap();

        assert_eq!(chain.state, ChainState::Done);
        assert_eq!(chain.replans, 1);
        assert_eq!(chain.steps.len(), 3, "the pending synthesize step was discarded");
        assert_eq!(chain.steps[0].status, StepStatus::Succeeded);
        assert_eq!(chain.steps[0].output().unwrap()["paths"][0], "/data/a.pdf");
        assert_eq!(chain.steps[1].status, StepStatus::Failed);
        assert_eq!(chain.steps[2].status, StepStatus::Succeeded);
        assert_eq!(chain.steps[2].index, 2);

        let replan = &h.planner.plan_requests()[1];
        assert_eq!(replan.history.len(), 2);
        assert_eq!(replan.history[0], chain.steps[0]);
        assert_eq!(h.runner.commands(), vec!["cat '/data/a.pdf'", "ls"]);
    }

    #[tokio::test]
    async fn steps_run_strictly_in_order() {
        let h = harness(
            ScriptedPlanner::new()
                .plan(vec![
                    proposal("execute_commands", json!({"commands": ["echo one"]})),
                    proposal("execute_commands", json!({"commands": ["echo two"]})),
                    proposal("execute_commands", json!({"commands": ["echo three"]})),
                ])
                .answer("done"),
            ScriptedRunner::new(),
            ScriptedSearcher::new(),
        );
        let chain = h.engine.run("count").await.unwrap();

        assert_eq!(h.runner.commands(), vec!["echo one", "echo two", "echo three"]);
        for (i, pair) in chain.steps.windows(2).enumerate() {
            assert_eq!(pair[0].index, i);
            assert!(pair[0].finished_at.unwrap() <= pair[1].started_at.unwrap());
        }
    }

    #[tokio::test]
    async fn failure_without_replan_budget_aborts() {
        let config = ReasoningConfig {
            max_failure_replans: 0,
            ..test_config()
        };
        let h = harness_with(
            ScriptedPlanner::new().plan(vec![
                proposal("execute_commands", json!({"commands": ["cat missing"]})),
                proposal("execute_commands", json!({"commands": ["echo never"]})),
            ]),
            ScriptedRunner::new().exit(1, "No such file"),
            ScriptedSearcher::new(),
            config,
        );
        let chain = h.engine.run("show missing").await.unwrap();

        assert_eq!(chain.state, ChainState::Aborted);
        assert_eq!(chain.abort.as_ref().unwrap().kind, ErrorKind::ExecutionFailed);
        assert_eq!(h.runner.commands(), vec!["cat missing"]);
        assert!(chain.plan.is_empty());
    }

    #[tokio::test]
    async fn policy_violation_replans() {
        let h = harness(
            ScriptedPlanner::new()
                .plan(vec![proposal("execute_commands", json!({"commands": ["rm -rf ./old"]}))])
                .plan(vec![])
                .answer("I will not delete that folder."),
            ScriptedRunner::new(),
            ScriptedSearcher::new(),
        );
        let chain = h.engine.run("delete old").await.unwrap();

        assert_eq!(chain.state, ChainState::Done);
        assert_eq!(chain.steps[0].error_kind(), Some(ErrorKind::PolicyViolation));
        assert!(h.runner.commands().is_empty());
    }

    #[tokio::test]
    async fn step_limit_aborts_with_partial_answer() {
        let config = ReasoningConfig {
            max_steps: 1,
            ..test_config()
        };
        let h = harness_with(
            ScriptedPlanner::new().plan(vec![
                proposal("search_files", json!({"pattern": "*.pdf"})),
                proposal("execute_commands", json!({"commands": ["ls"]})),
            ]),
            ScriptedRunner::new(),
            ScriptedSearcher::new().found(&["/data/a.pdf"]),
            config,
        );
        let chain = h.engine.run("find pdfs").await.unwrap();

        assert_eq!(chain.state, ChainState::Aborted);
        let answer = chain.outcome().unwrap();
        assert_eq!(answer.error, Some(ErrorKind::BudgetExceeded));
        assert!(answer.text.contains("Completed steps"));
        assert!(answer.text.contains("/data/a.pdf"));
    }

    #[tokio::test]
    async fn synthesis_is_retried() {
        let h = harness(
            ScriptedPlanner::new()
                .plan(vec![])
                .answer_error(ProviderError::RateLimited { retry_after_secs: 1 })
                .answer("Hello."),
            ScriptedRunner::new(),
            ScriptedSearcher::new(),
        );
        let chain = h.engine.run("hi").await.unwrap();
        assert_eq!(chain.state, ChainState::Done);
        assert_eq!(h.planner.synthesis_calls(), 2);
    }

    #[tokio::test]
    async fn synthesis_exhaustion_aborts_with_completed_steps() {
        let h = harness(
            ScriptedPlanner::new().plan(vec![proposal("search_files", json!({"pattern": "*.txt"}))]),
            ScriptedRunner::new(),
            ScriptedSearcher::new().found(&["/data/notes.txt"]),
        );
        let chain = h.engine.run("find notes").await.unwrap();

        assert_eq!(chain.state, ChainState::Aborted);
        assert_eq!(h.planner.synthesis_calls(), 3);
        let answer = chain.outcome().unwrap();
        assert_eq!(answer.error, Some(ErrorKind::Provider));
        assert!(answer.text.contains("/data/notes.txt"));
    }

    #[tokio::test]
    async fn empty_results_replan_when_enabled() {
        let config = ReasoningConfig {
            replan_on_empty_results: true,
            ..test_config()
        };
        let h = harness_with(
            ScriptedPlanner::new()
                .plan(vec![
                    proposal("search_files", json!({"pattern": "*.pdf"})),
                    proposal("synthesize", json!({"instruction": "list them"})),
                ])
                .plan(vec![proposal("search_files", json!({"pattern": "*.PDF", "contains": "finance"}))])
                .answer("Found one."),
            ScriptedRunner::new(),
            ScriptedSearcher::new().found(&[]).found(&["/data/finance.pdf"]),
            config,
        );
        let chain = h.engine.run("find finance pdfs").await.unwrap();

        assert_eq!(chain.state, ChainState::Done);
        assert_eq!(chain.replans, 1);
        assert_eq!(chain.steps.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_takes_effect_at_step_boundary() {
        let h = harness_with(
            ScriptedPlanner::new()
                .plan(vec![
                    proposal("execute_commands", json!({"commands": ["sleep 30"]})),
                    proposal("execute_commands", json!({"commands": ["echo after"]})),
                ])
                .answer("never"),
            ScriptedRunner::new().slow(Duration::from_secs(30)),
            ScriptedSearcher::new(),
            ReasoningConfig {
                step_timeout_secs: 60,
                ..test_config()
            },
        );

        let id = h.engine.submit("slow then fast").await;
        assert!(h.engine.cancel(&id).await.unwrap());
        let answer = h.engine.await_result(&id).await.unwrap();

        assert!(answer.partial);
        assert_eq!(answer.error, Some(ErrorKind::Cancelled));
        let chain = h.engine.status(&id).await.unwrap();
        assert_eq!(chain.state, ChainState::Aborted);
        assert!(chain.steps.iter().all(|s| s.is_terminal()));
        assert!(!h.runner.commands().contains(&"echo after".to_string()));
        assert!(!h.engine.cancel(&id).await.unwrap());
    }

    #[tokio::test]
    async fn submitted_chains_run_concurrently() {
        let h = harness(
            ScriptedPlanner::new()
                .plan(vec![])
                .plan(vec![])
                .plan(vec![])
                .answer("a")
                .answer("b")
                .answer("c"),
            ScriptedRunner::new(),
            ScriptedSearcher::new(),
        );

        let mut ids = Vec::new();
        for q in ["one", "two", "three"] {
            ids.push(h.engine.submit(q).await);
        }
        for id in &ids {
            let answer = h.engine.await_result(id).await.unwrap();
            assert!(!answer.partial);
        }
        assert!(h.engine.chains().list_active().await.is_empty());
        assert_eq!(h.engine.chains().len().await, 3);
    }

    #[tokio::test]
    async fn status_is_idempotent() {
        let h = harness(
            ScriptedPlanner::new().plan(vec![]).answer("ok"),
            ScriptedRunner::new(),
            ScriptedSearcher::new(),
        );
        let chain = h.engine.run("q").await.unwrap();
        let first = h.engine.status(&chain.id).await.unwrap();
        let second = h.engine.status(&chain.id).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first, chain);
    }

    #[tokio::test]
    async fn unknown_chain_is_not_found() {
        let h = harness(ScriptedPlanner::new(), ScriptedRunner::new(), ScriptedSearcher::new());
        let missing = ChainId::from("chain_nope");
        assert!(matches!(h.engine.status(&missing).await, Err(ChainError::NotFound(_))));
        assert!(matches!(h.engine.await_result(&missing).await, Err(ChainError::NotFound(_))));
    }

    #[tokio::test]
    async fn publishes_lifecycle_events() {
        let h = harness(
            ScriptedPlanner::new()
                .plan(vec![proposal("search_files", json!({"pattern": "*"}))])
                .answer("ok"),
            ScriptedRunner::new(),
            ScriptedSearcher::new(),
        );
        let bus = Arc::new(EventBus::default());
        let mut rx = bus.subscribe();
        // Rebuild around a shared bus so both engine and executor publish on it.
        let dir = tempfile::tempdir().unwrap();
        let tools = Arc::new(default_registry());
        let executor = StepExecutor::new(
            tools.clone(),
            h.runner.clone(),
            Arc::new(ScriptedSearcher::new()),
            h.planner.clone(),
            policy_for(dir.path()),
        )
        .with_event_bus(bus.clone());
        let engine = ReasoningEngine::new(h.planner.clone(), executor, tools, test_config()).with_event_bus(bus);

        engine.run("list").await.unwrap();

        let mut kinds = Vec::new();
        while let Ok(event) = rx.try_recv() {
            kinds.push(match event.as_ref() {
                DomainEvent::ChainCreated { .. } => "created",
                DomainEvent::PlanAccepted { .. } => "plan",
                DomainEvent::StepFinished { .. } => "step",
                DomainEvent::Replanned { .. } => "replan",
                DomainEvent::ChainFinished { .. } => "finished",
            });
        }
        assert_eq!(kinds, vec!["created", "plan", "step", "finished"]);
    }

    #[tokio::test(start_paused = true)]
    async fn chain_budget_expiry_aborts_without_replanning() {
        let config = ReasoningConfig {
            chain_budget_secs: 2,
            step_timeout_secs: 60,
            ..test_config()
        };
        let h = harness_with(
            ScriptedPlanner::new()
                .plan(vec![proposal("execute_commands", json!({"commands": ["sleep 10"]}))])
                .plan(vec![proposal("execute_commands", json!({"commands": ["echo again"]}))]),
            ScriptedRunner::new().slow(Duration::from_secs(10)),
            ScriptedSearcher::new(),
            config,
        );
        let mut events = h.engine.event_bus().subscribe();

        let chain = h.engine.run("run the slow job").await.unwrap();

        assert_eq!(chain.state, ChainState::Aborted);
        assert_eq!(chain.abort.as_ref().unwrap().kind, ErrorKind::BudgetExceeded);
        assert_eq!(chain.replans, 0);
        assert_eq!(h.planner.plan_calls(), 1);
        assert_eq!(chain.steps.len(), 1);
        assert_eq!(chain.steps[0].error_kind(), Some(ErrorKind::Timeout));
        assert_eq!(h.runner.commands(), vec!["sleep 10"]);

        while let Ok(event) = events.try_recv() {
            assert!(
                !matches!(event.as_ref(), DomainEvent::Replanned { .. }),
                "unexpected event: {event:?}"
            );
        }
    }

    /// Replans after every successful step and counts how often it is asked.
    #[derive(Default)]
    struct ReplanAfterSuccess {
        consulted: std::sync::Mutex<Vec<usize>>,
    }

    impl ReplanPolicy for ReplanAfterSuccess {
        fn should_replan(&self, step: &ReasoningStep, _chain: &ReasoningChain) -> Option<ReplanReason> {
            self.consulted.lock().unwrap().push(step.index);
            (step.status == StepStatus::Succeeded).then_some(ReplanReason::EmptyResults)
        }
    }

    #[tokio::test]
    async fn custom_policy_is_consulted_once_per_step_boundary() {
        let h = harness(
            ScriptedPlanner::new()
                .plan(vec![
                    proposal("execute_commands", json!({"commands": ["echo one"]})),
                    proposal("execute_commands", json!({"commands": ["echo discarded"]})),
                ])
                .plan(vec![proposal("execute_commands", json!({"commands": ["echo two"]}))])
                .plan(vec![])
                .answer("Both ran."),
            ScriptedRunner::new(),
            ScriptedSearcher::new(),
        );
        let policy = Arc::new(ReplanAfterSuccess::default());
        let registry = Arc::new(ChainRegistry::new());
        let engine = Arc::try_unwrap(h.engine)
            .ok()
            .unwrap()
            .with_replan_policy(policy.clone())
            .with_registry(registry.clone());
        let mut events = engine.event_bus().subscribe();

        let chain = engine.run("echo twice").await.unwrap();

        assert_eq!(chain.state, ChainState::Done);
        assert_eq!(chain.steps.len(), 2);
        assert_eq!(chain.replans, chain.steps.len() as u32);
        assert_eq!(*policy.consulted.lock().unwrap(), vec![0, 1]);
        assert_eq!(h.runner.commands(), vec!["echo one", "echo two"]);

        let histories: Vec<usize> = h.planner.plan_requests().iter().map(|r| r.history.len()).collect();
        assert_eq!(histories, vec![0, 1, 2]);

        let mut replanned_after = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let DomainEvent::Replanned { after_step, .. } = event.as_ref() {
                replanned_after.push(*after_step);
            }
        }
        assert_eq!(replanned_after, vec![0, 1]);

        // The shared registry holds the chain the engine drove.
        assert_eq!(registry.get(&chain.id).await.unwrap(), chain);
    }

    #[tokio::test]
    async fn configured_audit_retention_caps_the_log() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = AppConfig::default();
        config.policy.approved_directories = vec![dir.path().display().to_string()];
        config.policy.audit_retention = 2;
        let planner = Arc::new(
            ScriptedPlanner::new()
                .plan(vec![proposal(
                    "execute_commands",
                    json!({"commands": ["echo a", "echo b", "echo c"]}),
                )])
                .answer("ok"),
        );
        let engine = ReasoningEngine::from_config(
            &config,
            planner,
            Arc::new(ScriptedRunner::new()),
            Arc::new(ScriptedSearcher::new()),
        )
        .unwrap();

        let chain = engine.run("echo three things").await.unwrap();

        assert_eq!(chain.state, ChainState::Done);
        let audit = engine.executor().audit();
        assert_eq!(audit.count(), 2);
        let targets: Vec<String> = audit.entries().into_iter().map(|e| e.target).collect();
        assert_eq!(targets, vec!["echo b", "echo c"]);
    }
}
