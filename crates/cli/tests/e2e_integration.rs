//! End-to-end integration tests for the Merlin reasoning engine.
//!
//! These tests exercise the full pipeline from query to final answer: the
//! provider-backed planner parsing JSON plans, the real shell runner and
//! file searcher, policy enforcement, replanning and partial answers.

use std::path::Path;
use std::sync::Arc;

use merlin_agent::{ProviderPlanner, ReasoningEngine};
use merlin_config::AppConfig;
use merlin_core::chain::{ChainState, StepStatus};
use merlin_core::error::{ErrorKind, ProviderError};
use merlin_core::message::Message;
use merlin_core::provider::{Provider, ProviderRequest, ProviderResponse, Usage};
use merlin_tools::{FsSearcher, ShellRunner};

// ── Mock Provider ────────────────────────────────────────────────────────

/// A mock provider that returns scripted replies in sequence.
///
/// `None` stands for an unreachable endpoint.
struct ScriptedProvider {
    replies: std::sync::Mutex<Vec<Option<String>>>,
    requests: std::sync::Mutex<Vec<ProviderRequest>>,
}

impl ScriptedProvider {
    fn new(replies: Vec<Option<String>>) -> Self {
        Self {
            replies: std::sync::Mutex::new(replies),
            requests: std::sync::Mutex::new(Vec::new()),
        }
    }

    fn texts(replies: &[&str]) -> Self {
        Self::new(replies.iter().map(|r| Some(r.to_string())).collect())
    }

    fn unreachable() -> Self {
        Self::new(Vec::new())
    }

    fn calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

#[async_trait::async_trait]
impl Provider for ScriptedProvider {
    fn name(&self) -> &str {
        "e2e_mock"
    }

    async fn complete(&self, request: ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        let mut requests = self.requests.lock().unwrap();
        let replies = self.replies.lock().unwrap();
        let idx = requests.len();
        requests.push(request);

        match replies.get(idx) {
            Some(Some(text)) => Ok(text_response(text)),
            _ => Err(ProviderError::Network("connection refused".into())),
        }
    }
}

fn text_response(text: &str) -> ProviderResponse {
    ProviderResponse {
        message: Message::assistant(text),
        usage: Some(Usage {
            prompt_tokens: 20,
            completion_tokens: 10,
            total_tokens: 30,
        }),
        model: "mock-model".into(),
    }
}

// ── Harness ──────────────────────────────────────────────────────────────

fn config_for(dir: &Path) -> AppConfig {
    let mut config = AppConfig::default();
    let root = dir.display().to_string();
    config.policy.approved_directories = vec![root.clone()];
    config.search.roots = vec![root];
    config.policy.allowed_commands.push("sleep".into());
    config.reasoning.retry_backoff_ms = 1;
    config
}

fn engine_with(config: &AppConfig, provider: Arc<ScriptedProvider>) -> ReasoningEngine {
    let planner = Arc::new(ProviderPlanner::new(provider, "mock-model"));
    ReasoningEngine::from_config(
        config,
        planner,
        Arc::new(ShellRunner::new()),
        Arc::new(FsSearcher::default()),
    )
    .unwrap()
}

fn plan_json(steps: serde_json::Value) -> String {
    serde_json::json!({ "steps": steps }).to_string()
}

// ── Tests ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn e2e_list_downloads_single_step() {
    let home = tempfile::tempdir().unwrap();
    let downloads = home.path().join("Downloads");
    std::fs::create_dir(&downloads).unwrap();
    std::fs::write(downloads.join("report.pdf"), "q3").unwrap();
    std::fs::write(downloads.join("photo.jpg"), "jpg").unwrap();

    let plan = plan_json(serde_json::json!([{
        "description": "List the downloads folder",
        "tool": "search_files",
        "arguments": { "pattern": "*", "roots": [downloads.display().to_string()] }
    }]));
    let provider = Arc::new(ScriptedProvider::texts(&[
        &plan,
        "Your downloads folder has photo.jpg and report.pdf.",
    ]));
    let engine = engine_with(&config_for(home.path()), provider.clone());

    let chain = engine.run("List files in my downloads folder").await.unwrap();

    assert_eq!(chain.state, ChainState::Done);
    assert_eq!(chain.steps.len(), 1);
    let output = chain.steps[0].output().unwrap();
    assert_eq!(output["count"], 2);
    let paths: Vec<&str> = output["paths"]
        .as_array()
        .unwrap()
        .iter()
        .map(|p| p.as_str().unwrap())
        .collect();
    assert!(paths[0].ends_with("photo.jpg"));
    assert!(paths[1].ends_with("report.pdf"));

    let answer = chain.outcome().unwrap();
    assert!(!answer.partial);
    assert!(answer.text.contains("report.pdf"));
    assert_eq!(provider.calls(), 2);
}

#[tokio::test]
async fn e2e_search_then_move_threads_results() {
    let home = tempfile::tempdir().unwrap();
    let finance = home.path().join("Finance");
    std::fs::write(home.path().join("q3 report.pdf"), "numbers").unwrap();
    std::fs::write(home.path().join("notes.txt"), "text").unwrap();
    std::fs::create_dir(&finance).unwrap();

    let plan = plan_json(serde_json::json!([
        {
            "description": "Find PDFs",
            "tool": "search_files",
            "arguments": { "pattern": "*.pdf" }
        },
        {
            "description": "Move them into Finance",
            "tool": "execute_commands",
            "arguments": { "commands": [format!("mv {{{{step.0.paths}}}} {}", finance.display())] }
        }
    ]));
    let provider = Arc::new(ScriptedProvider::texts(&[&plan, "Moved q3 report.pdf into Finance."]));
    let engine = engine_with(&config_for(home.path()), provider);

    let chain = engine.run("Move every PDF into Finance").await.unwrap();

    assert_eq!(chain.state, ChainState::Done, "chain: {chain:?}");
    assert_eq!(chain.steps.len(), 2);
    assert!(chain.steps.iter().all(|s| s.status == StepStatus::Succeeded));

    let resolved = chain.steps[1].resolved_arguments.as_ref().unwrap();
    let command = resolved["commands"][0].as_str().unwrap();
    assert!(command.contains("'"), "paths are shell-quoted: {command}");
    assert!(!command.contains("{{"));

    assert!(finance.join("q3 report.pdf").exists());
    assert!(!home.path().join("q3 report.pdf").exists());
    assert!(home.path().join("notes.txt").exists());
}

#[tokio::test]
async fn e2e_timeout_replans_once_then_returns_partial() {
    let home = tempfile::tempdir().unwrap();
    let mut config = config_for(home.path());
    config.reasoning.step_timeout_secs = 1;

    let slow = plan_json(serde_json::json!([{
        "description": "Run the slow job",
        "tool": "execute_commands",
        "arguments": { "commands": ["sleep 5"] }
    }]));
    let provider = Arc::new(ScriptedProvider::texts(&[&slow, &slow]));
    let engine = engine_with(&config, provider.clone());

    let chain = engine.run("Run the nightly job").await.unwrap();

    assert_eq!(chain.state, ChainState::Aborted);
    assert_eq!(chain.replans, 1);
    assert_eq!(chain.steps.len(), 2);
    assert!(chain.steps.iter().all(|s| s.error_kind() == Some(ErrorKind::Timeout)));
    assert_eq!(provider.calls(), 2, "no synthesis after abort");

    let answer = chain.outcome().unwrap();
    assert!(answer.partial);
    assert_eq!(answer.error, Some(ErrorKind::Timeout));
    assert!(answer.text.starts_with("[partial]"));
}

#[tokio::test]
async fn e2e_unreachable_planner_aborts_before_executing() {
    let home = tempfile::tempdir().unwrap();
    let provider = Arc::new(ScriptedProvider::unreachable());
    let engine = engine_with(&config_for(home.path()), provider.clone());

    let chain = engine.run("List files in my downloads folder").await.unwrap();

    assert_eq!(chain.state, ChainState::Aborted);
    assert!(chain.steps.is_empty());
    assert_eq!(provider.calls(), 3);
    let answer = chain.outcome().unwrap();
    assert_eq!(answer.error, Some(ErrorKind::Provider));
    assert!(answer.text.contains("No steps completed"));
}

#[tokio::test]
async fn e2e_forbidden_path_is_refused_then_answered() {
    let home = tempfile::tempdir().unwrap();
    let plan = plan_json(serde_json::json!([{
        "description": "Show the password file",
        "tool": "execute_commands",
        "arguments": { "commands": ["cat /etc/passwd"] }
    }]));
    let provider = Arc::new(ScriptedProvider::texts(&[
        &plan,
        r#"{"steps": []}"#,
        "I am not allowed to read system files.",
    ]));
    let engine = Arc::new(engine_with(&config_for(home.path()), provider));

    let id = engine.submit("Show me /etc/passwd").await;
    let answer = engine.await_result(&id).await.unwrap();
    assert!(!answer.partial);

    let chain = engine.status(&id).await.unwrap();
    assert_eq!(chain.state, ChainState::Done);
    assert_eq!(chain.steps[0].error_kind(), Some(ErrorKind::PolicyViolation));
    assert!(engine.executor().audit().count() >= 1);
}

#[tokio::test]
async fn e2e_prose_wrapped_plan_is_accepted() {
    let home = tempfile::tempdir().unwrap();
    std::fs::write(home.path().join("todo.txt"), "buy milk").unwrap();

    let reply = "Sure! Here is the plan:\n```json\n{\"steps\": [{\"description\": \"Read the list\", \"tool\": \"execute_commands\", \"arguments\": {\"commands\": [\"cat todo.txt\"]}}]}\n```";
    let provider = Arc::new(ScriptedProvider::texts(&[reply, "Your list says: buy milk."]));
    let engine = engine_with(&config_for(home.path()), provider);

    let chain = engine.run("What's on my todo list?").await.unwrap();

    assert_eq!(chain.state, ChainState::Done);
    assert_eq!(chain.steps[0].output().unwrap()["stdout"], "buy milk");

    let json = serde_json::to_value(&chain).unwrap();
    assert_eq!(json["state"], "DONE");
    assert_eq!(json["steps"][0]["status"], "SUCCEEDED");
}
