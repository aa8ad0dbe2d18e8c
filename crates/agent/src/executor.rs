//! Step executor — runs one planned step against its collaborator.
//!
//! The executor owns everything between "this step is next" and "this step
//! is terminal": step references are resolved against the history, the
//! resolved arguments are validated again, policy is enforced, and the
//! collaborator call is bounded by a timeout. Every failure ends up recorded
//! on the step; nothing raises past [`StepExecutor::execute`] except an
//! attempt to run a step that is not PENDING.

use merlin_core::binding;
use merlin_core::chain::{ChainId, ReasoningStep};
use merlin_core::collaborator::{CommandRunner, FileSearcher, SearchQuery};
use merlin_core::error::{ChainError, ToolError};
use merlin_core::event::{DomainEvent, EventBus};
use merlin_core::planner::{Planner, SynthesisRequest};
use merlin_core::tool::{ToolKind, ToolRegistry, ValidatedCall};
use merlin_security::path::{resolve_roots, within_any};
use merlin_security::{AuditEvent, AuditLogger, AuditOutcome, CommandPolicy, PolicyDecision};
use merlin_security::{expand_tilde, normalize};
use serde_json::{Map, Value, json};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Everything a step may read besides its own arguments.
#[derive(Debug, Clone, Copy)]
pub struct StepContext<'a> {
    pub chain_id: &'a ChainId,

    /// The original user query
    pub query: &'a str,

    /// Steps dispatched before this one
    pub history: &'a [ReasoningStep],

    /// When the chain's wall-clock budget runs out
    pub deadline: Option<Instant>,
}

/// Dispatches steps to the command runner, the file searcher or the planner.
pub struct StepExecutor {
    /// Declared tools, used to re-validate resolved arguments
    tools: Arc<ToolRegistry>,

    runner: Arc<dyn CommandRunner>,
    searcher: Arc<dyn FileSearcher>,

    /// Answers `synthesize` steps
    planner: Arc<dyn Planner>,

    /// Gate in front of `execute_commands`
    policy: CommandPolicy,

    /// Normalized directories searches may traverse
    search_roots: Vec<PathBuf>,

    max_results: usize,
    max_depth: usize,

    /// Wall-clock limit for one step
    step_timeout: Duration,

    /// Record of every policy decision
    audit: Arc<AuditLogger>,

    /// Event bus for `StepFinished` events
    event_bus: Option<Arc<EventBus>>,
}

impl StepExecutor {
    /// Create an executor. Searches default to the policy's approved
    /// directories until [`with_search_roots`](Self::with_search_roots) is set.
    pub fn new(
        tools: Arc<ToolRegistry>,
        runner: Arc<dyn CommandRunner>,
        searcher: Arc<dyn FileSearcher>,
        planner: Arc<dyn Planner>,
        policy: CommandPolicy,
    ) -> Self {
        let search_roots = policy.approved_directories().to_vec();
        Self {
            tools,
            runner,
            searcher,
            planner,
            policy,
            search_roots,
            max_results: 50,
            max_depth: 8,
            step_timeout: Duration::from_secs(60),
            audit: Arc::new(AuditLogger::new()),
            event_bus: None,
        }
    }

    /// Set the directories searches may traverse (`~` is expanded).
    pub fn with_search_roots(mut self, roots: &[String]) -> Self {
        self.search_roots = resolve_roots(roots);
        self
    }

    pub fn with_search_limits(mut self, max_results: usize, max_depth: usize) -> Self {
        self.max_results = max_results;
        self.max_depth = max_depth;
        self
    }

    pub fn with_step_timeout(mut self, timeout: Duration) -> Self {
        self.step_timeout = timeout;
        self
    }

    pub fn with_audit(mut self, audit: Arc<AuditLogger>) -> Self {
        self.audit = audit;
        self
    }

    pub fn with_event_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.event_bus = Some(bus);
        self
    }

    pub fn audit(&self) -> &Arc<AuditLogger> {
        &self.audit
    }

    pub fn policy(&self) -> &CommandPolicy {
        &self.policy
    }

    /// Run a PENDING step to a terminal status.
    pub async fn execute(&self, step: &mut ReasoningStep, ctx: &StepContext<'_>) -> Result<(), ChainError> {
        step.start()?;
        debug!(chain_id = %ctx.chain_id, index = step.index, tool = %step.tool, "Step started");

        match self.run(step, ctx).await {
            Ok(output) => step.succeed(output)?,
            Err(e) => {
                warn!(chain_id = %ctx.chain_id, index = step.index, tool = %step.tool, error = %e, "Step failed");
                step.fail(e.kind(), e.to_string())?;
            }
        }

        let duration_ms = step.duration_ms().unwrap_or(0);
        info!(
            chain_id = %ctx.chain_id,
            index = step.index,
            tool = %step.tool,
            status = %step.status,
            duration_ms,
            "Step finished"
        );

        if let Some(bus) = &self.event_bus {
            bus.publish(DomainEvent::StepFinished {
                chain_id: ctx.chain_id.clone(),
                index: step.index,
                tool: step.tool.to_string(),
                status: step.status,
                duration_ms,
                timestamp: chrono::Utc::now(),
            });
        }
        Ok(())
    }

    async fn run(&self, step: &mut ReasoningStep, ctx: &StepContext<'_>) -> Result<Value, ToolError> {
        let resolved = binding::resolve(&step.arguments, ctx.history).map_err(|reason| {
            ToolError::SchemaViolation {
                tool_name: step.tool.to_string(),
                reason,
            }
        })?;
        let call = self.tools.validate(step.tool.as_str(), &Value::Object(resolved))?;
        step.resolved_arguments = Some(call.arguments.clone());

        let limit = self.time_limit(ctx.deadline);
        match tokio::time::timeout(limit, self.dispatch(&call, ctx)).await {
            Ok(result) => result,
            Err(_) => Err(ToolError::Timeout {
                tool_name: call.kind.to_string(),
                timeout_ms: u64::try_from(limit.as_millis()).unwrap_or(u64::MAX),
            }),
        }
    }

    /// The step timeout, clamped to what is left of the chain budget.
    fn time_limit(&self, deadline: Option<Instant>) -> Duration {
        match deadline {
            Some(deadline) => self
                .step_timeout
                .min(deadline.saturating_duration_since(Instant::now())),
            None => self.step_timeout,
        }
    }

    async fn dispatch(&self, call: &ValidatedCall, ctx: &StepContext<'_>) -> Result<Value, ToolError> {
        match call.kind {
            ToolKind::ExecuteCommands => self.execute_commands(&call.arguments, ctx).await,
            ToolKind::SearchFiles => self.search_files(&call.arguments, ctx).await,
            ToolKind::Synthesize => self.synthesize(&call.arguments, ctx).await,
        }
    }

    // --- execute_commands ---

    async fn execute_commands(&self, args: &Map<String, Value>, ctx: &StepContext<'_>) -> Result<Value, ToolError> {
        let tool_name = ToolKind::ExecuteCommands.as_str();
        let commands: Vec<&str> = args
            .get("commands")
            .and_then(Value::as_array)
            .map(|list| list.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default();
        if commands.is_empty() {
            return Err(ToolError::SchemaViolation {
                tool_name: tool_name.into(),
                reason: "no commands given".into(),
            });
        }

        let cwd = match args.get("working_directory").and_then(Value::as_str) {
            Some(dir) => normalize(&expand_tilde(dir)),
            None => self
                .policy
                .default_working_directory()
                .map(Path::to_path_buf)
                .ok_or_else(|| ToolError::PolicyViolation {
                    tool_name: tool_name.into(),
                    reason: "no approved directory is configured".into(),
                })?,
        };

        // Every command is checked before any of them runs.
        for command in &commands {
            let decision = self.policy.check(command, &cwd);
            let (outcome, details) = match &decision {
                PolicyDecision::Allowed => (AuditOutcome::Allowed, None),
                PolicyDecision::Denied { reason } => (AuditOutcome::Denied, Some(reason.clone())),
            };
            self.audit.log(AuditEvent::CommandCheck, ctx.chain_id.as_str(), command, outcome, details);
            if let PolicyDecision::Denied { reason } = decision {
                return Err(ToolError::PolicyViolation {
                    tool_name: tool_name.into(),
                    reason,
                });
            }
        }

        let background = args.get("background").and_then(Value::as_bool).unwrap_or(false);
        if background {
            let [command] = commands.as_slice() else {
                return Err(ToolError::SchemaViolation {
                    tool_name: tool_name.into(),
                    reason: format!("background execution takes exactly one command, got {}", commands.len()),
                });
            };
            self.runner.spawn_background(command, &cwd).await?;
            self.audit.log(
                AuditEvent::BackgroundSpawn,
                ctx.chain_id.as_str(),
                command,
                AuditOutcome::Allowed,
                Some(cwd.display().to_string()),
            );
            return Ok(json!({
                "commands": [{ "command": command, "background": true }],
                "stdout": "",
                "background": true,
            }));
        }

        let mut results = Vec::with_capacity(commands.len());
        let mut stdout = String::new();
        for command in &commands {
            debug!(command = %command, cwd = %cwd.display(), "Running command");
            let out = self.runner.run(command, &cwd).await?;
            if !out.success() {
                return Err(ToolError::ExecutionFailed {
                    tool_name: tool_name.into(),
                    reason: format!(
                        "'{command}' exited with code {}; stdout: {}; stderr: {}",
                        out.exit_code,
                        out.stdout.trim(),
                        out.stderr.trim()
                    ),
                });
            }
            stdout.push_str(&out.stdout);
            results.push(json!({
                "command": command,
                "stdout": out.stdout,
                "stderr": out.stderr,
                "exit_code": out.exit_code,
            }));
        }

        Ok(json!({ "commands": results, "stdout": stdout }))
    }

    // --- search_files ---

    async fn search_files(&self, args: &Map<String, Value>, ctx: &StepContext<'_>) -> Result<Value, ToolError> {
        let tool_name = ToolKind::SearchFiles.as_str();
        let pattern = args
            .get("pattern")
            .and_then(Value::as_str)
            .ok_or_else(|| ToolError::SchemaViolation {
                tool_name: tool_name.into(),
                reason: "missing pattern".into(),
            })?;

        let requested: Vec<&str> = args
            .get("roots")
            .and_then(Value::as_array)
            .map(|list| list.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default();

        let roots = if requested.is_empty() {
            self.search_roots.clone()
        } else {
            let mut roots = Vec::with_capacity(requested.len());
            for raw in requested {
                let root = normalize(&expand_tilde(raw));
                let allowed = within_any(&root, &self.search_roots);
                let outcome = if allowed { AuditOutcome::Allowed } else { AuditOutcome::Denied };
                self.audit.log(
                    AuditEvent::SearchRootCheck,
                    ctx.chain_id.as_str(),
                    &root.display().to_string(),
                    outcome,
                    None,
                );
                if !allowed {
                    return Err(ToolError::PolicyViolation {
                        tool_name: tool_name.into(),
                        reason: format!("{} is outside the configured search roots", root.display()),
                    });
                }
                roots.push(root);
            }
            roots
        };

        let max_results = args
            .get("max_results")
            .and_then(Value::as_u64)
            .and_then(|n| usize::try_from(n).ok())
            .map(|n| n.max(1).min(self.max_results))
            .unwrap_or(self.max_results);

        let query = SearchQuery {
            pattern: pattern.to_string(),
            roots,
            contains: args.get("contains").and_then(Value::as_str).map(String::from),
            max_results,
            max_depth: self.max_depth,
        };
        let paths: Vec<String> = self
            .searcher
            .search(&query)
            .await?
            .iter()
            .map(|p| p.display().to_string())
            .collect();

        debug!(pattern = %query.pattern, found = paths.len(), "Search finished");
        Ok(json!({ "count": paths.len(), "paths": paths }))
    }

    // --- synthesize ---

    async fn synthesize(&self, args: &Map<String, Value>, ctx: &StepContext<'_>) -> Result<Value, ToolError> {
        let instruction = args.get("instruction").and_then(Value::as_str).unwrap_or_default();
        let request = SynthesisRequest {
            query: format!("{}\n\nInstruction: {instruction}", ctx.query),
            history: ctx.history.iter().filter(|s| s.is_terminal()).cloned().collect(),
        };
        let text = self
            .planner
            .synthesize(&request)
            .await
            .map_err(|e| ToolError::ExecutionFailed {
                tool_name: ToolKind::Synthesize.as_str().into(),
                reason: e.to_string(),
            })?;
        Ok(json!({ "text": text }))
    }
}
