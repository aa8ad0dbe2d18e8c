//! Shared test helpers: scripted collaborators for planner, executor and
//! engine tests.

use async_trait::async_trait;
use merlin_core::chain::StepProposal;
use merlin_core::collaborator::{CommandOutput, CommandRunner, FileSearcher, SearchQuery};
use merlin_core::error::{ProviderError, ToolError};
use merlin_core::message::Message;
use merlin_core::planner::{PlanRequest, Planner, SynthesisRequest};
use merlin_core::provider::{Provider, ProviderRequest, ProviderResponse, Usage};
use merlin_security::CommandPolicy;
use serde_json::Value;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

// --- LLM provider ---

/// A mock provider that returns a sequence of scripted responses.
///
/// Each call to `complete` returns the next response in the queue.
/// Panics if more calls are made than responses provided.
pub struct SequentialMockProvider {
    responses: Mutex<Vec<ProviderResponse>>,
    requests: Mutex<Vec<ProviderRequest>>,
}

impl SequentialMockProvider {
    pub fn new(responses: Vec<ProviderResponse>) -> Self {
        Self {
            responses: Mutex::new(responses),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Every request received so far.
    pub fn requests(&self) -> Vec<ProviderRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl Provider for SequentialMockProvider {
    fn name(&self) -> &str {
        "sequential_mock"
    }

    async fn complete(&self, request: ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        let mut requests = self.requests.lock().unwrap();
        let responses = self.responses.lock().unwrap();
        let count = requests.len();

        if count >= responses.len() {
            panic!(
                "SequentialMockProvider: no more responses (call #{count}, have {})",
                responses.len()
            );
        }

        requests.push(request);
        Ok(responses[count].clone())
    }
}

/// Create a simple text response.
pub fn make_text_response(text: &str) -> ProviderResponse {
    ProviderResponse {
        message: Message::assistant(text),
        usage: Some(Usage {
            prompt_tokens: 10,
            completion_tokens: 5,
            total_tokens: 15,
        }),
        model: "mock-model".into(),
    }
}

// --- Planner ---

/// A planner that replays scripted plans and answers.
///
/// Exhausted scripts answer with a network error, so a test that plans more
/// often than expected fails visibly instead of hanging.
#[derive(Default)]
pub struct ScriptedPlanner {
    plans: Mutex<VecDeque<Result<Vec<StepProposal>, ProviderError>>>,
    answers: Mutex<VecDeque<Result<String, ProviderError>>>,
    plan_requests: Mutex<Vec<PlanRequest>>,
    synthesis_requests: Mutex<Vec<SynthesisRequest>>,
}

impl ScriptedPlanner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn plan(self, steps: Vec<StepProposal>) -> Self {
        self.plans.lock().unwrap().push_back(Ok(steps));
        self
    }

    pub fn plan_error(self, error: ProviderError) -> Self {
        self.plans.lock().unwrap().push_back(Err(error));
        self
    }

    pub fn answer(self, text: &str) -> Self {
        self.answers.lock().unwrap().push_back(Ok(text.to_string()));
        self
    }

    pub fn answer_error(self, error: ProviderError) -> Self {
        self.answers.lock().unwrap().push_back(Err(error));
        self
    }

    pub fn plan_calls(&self) -> usize {
        self.plan_requests.lock().unwrap().len()
    }

    pub fn synthesis_calls(&self) -> usize {
        self.synthesis_requests.lock().unwrap().len()
    }

    pub fn plan_requests(&self) -> Vec<PlanRequest> {
        self.plan_requests.lock().unwrap().clone()
    }

    pub fn synthesis_requests(&self) -> Vec<SynthesisRequest> {
        self.synthesis_requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl Planner for ScriptedPlanner {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn plan(&self, request: &PlanRequest) -> Result<Vec<StepProposal>, ProviderError> {
        self.plan_requests.lock().unwrap().push(request.clone());
        self.plans
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(ProviderError::Network("planner script exhausted".into())))
    }

    async fn synthesize(&self, request: &SynthesisRequest) -> Result<String, ProviderError> {
        self.synthesis_requests.lock().unwrap().push(request.clone());
        self.answers
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(ProviderError::Network("answer script exhausted".into())))
    }
}

/// Shorthand for a plan entry.
pub fn proposal(tool: &str, arguments: Value) -> StepProposal {
    StepProposal::new(format!("run {tool}"), tool, arguments)
}

// --- Command runner ---

enum RunnerReply {
    Output(CommandOutput),
    Delayed(Duration, CommandOutput),
    Error(ToolError),
}

/// A command runner that replays scripted outputs and records what it ran.
///
/// When the script is empty every command succeeds with empty output.
#[derive(Default)]
pub struct ScriptedRunner {
    replies: Mutex<VecDeque<RunnerReply>>,
    ran: Mutex<Vec<(String, PathBuf)>>,
    spawned: Mutex<Vec<String>>,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ok(self, stdout: &str) -> Self {
        self.push(RunnerReply::Output(output(stdout, "", 0)))
    }

    pub fn exit(self, code: i32, stderr: &str) -> Self {
        self.push(RunnerReply::Output(output("", stderr, code)))
    }

    /// Succeed only after `delay`.
    pub fn slow(self, delay: Duration) -> Self {
        self.push(RunnerReply::Delayed(delay, output("late", "", 0)))
    }

    pub fn error(self, error: ToolError) -> Self {
        self.push(RunnerReply::Error(error))
    }

    fn push(self, reply: RunnerReply) -> Self {
        self.replies.lock().unwrap().push_back(reply);
        self
    }

    /// Commands that were run to completion (or started), in order.
    pub fn commands(&self) -> Vec<String> {
        self.ran.lock().unwrap().iter().map(|(c, _)| c.clone()).collect()
    }

    pub fn directories(&self) -> Vec<PathBuf> {
        self.ran.lock().unwrap().iter().map(|(_, d)| d.clone()).collect()
    }

    pub fn spawned(&self) -> Vec<String> {
        self.spawned.lock().unwrap().clone()
    }
}

fn output(stdout: &str, stderr: &str, exit_code: i32) -> CommandOutput {
    CommandOutput {
        stdout: stdout.to_string(),
        stderr: stderr.to_string(),
        exit_code,
    }
}

#[async_trait]
impl CommandRunner for ScriptedRunner {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn run(&self, command: &str, working_directory: &Path) -> Result<CommandOutput, ToolError> {
        self.ran
            .lock()
            .unwrap()
            .push((command.to_string(), working_directory.to_path_buf()));
        let reply = self.replies.lock().unwrap().pop_front();
        match reply {
            None => Ok(output("", "", 0)),
            Some(RunnerReply::Output(out)) => Ok(out),
            Some(RunnerReply::Delayed(delay, out)) => {
                tokio::time::sleep(delay).await;
                Ok(out)
            }
            Some(RunnerReply::Error(e)) => Err(e),
        }
    }

    async fn spawn_background(&self, command: &str, _working_directory: &Path) -> Result<(), ToolError> {
        self.spawned.lock().unwrap().push(command.to_string());
        Ok(())
    }
}

// --- File searcher ---

/// A searcher that replays scripted results and records queries.
#[derive(Default)]
pub struct ScriptedSearcher {
    results: Mutex<VecDeque<Vec<PathBuf>>>,
    queries: Mutex<Vec<SearchQuery>>,
}

impl ScriptedSearcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn found(self, paths: &[&str]) -> Self {
        self.results
            .lock()
            .unwrap()
            .push_back(paths.iter().map(PathBuf::from).collect());
        self
    }

    pub fn queries(&self) -> Vec<SearchQuery> {
        self.queries.lock().unwrap().clone()
    }
}

#[async_trait]
impl FileSearcher for ScriptedSearcher {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn search(&self, query: &SearchQuery) -> Result<Vec<PathBuf>, ToolError> {
        self.queries.lock().unwrap().push(query.clone());
        Ok(self.results.lock().unwrap().pop_front().unwrap_or_default())
    }
}

// --- Policy ---

/// A policy approving only `dir`, allowing a handful of common commands.
pub fn policy_for(dir: &Path) -> CommandPolicy {
    let allowed: Vec<String> = ["ls", "echo", "mv", "mkdir", "cat", "sleep", "true", "false"]
        .iter()
        .map(|s| s.to_string())
        .collect();
    CommandPolicy::new(
        &allowed,
        &[r"\brm\s+-rf\b".to_string()],
        &[dir.display().to_string()],
        &["/etc".to_string()],
    )
    .unwrap()
}
