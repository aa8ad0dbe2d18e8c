//! Provider-backed planner.
//!
//! Turns a query (and, on replans, the step history) into a JSON plan by
//! prompting any [`Provider`], and turns the finished history into a
//! free-text answer.

use async_trait::async_trait;
use merlin_config::AppConfig;
use merlin_core::chain::{ReasoningStep, StepProposal};
use merlin_core::error::ProviderError;
use merlin_core::message::Message;
use merlin_core::planner::{PlanRequest, Planner, SynthesisRequest};
use merlin_core::provider::{Provider, ProviderRequest};
use merlin_core::text::truncate_chars;
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, warn};

const PLANNING_RULES: &str = "\
Break the user's request into the smallest ordered list of tool steps that answers it.
Reply with a single JSON object and nothing else:
{\"steps\": [{\"description\": \"...\", \"tool\": \"<tool name>\", \"arguments\": {...}}]}

Rules:
- Use only the tools listed below, with exactly their parameters.
- Steps run one after another. A step may use the result of an EARLIER step with
  a placeholder: \"{{step.N}}\" for the whole result or \"{{step.N.field}}\" for one
  field, where N is the zero-based index of that earlier step. search_files returns
  {\"paths\", \"count\"}; execute_commands returns {\"commands\", \"stdout\"};
  synthesize returns {\"text\"}.
- Refer to directories by their full path.
- If the request can be answered without any tool, reply with {\"steps\": []}.";

const SYNTHESIS_RULES: &str = "\
You are Merlin, a virtual assistant. Answer the user's request in a few plain \
sentences using the results of the steps that were run. Name the files or \
outputs that matter. If a step failed, say what could not be done.";

/// A [`Planner`] that prompts a language model.
pub struct ProviderPlanner {
    /// The LLM provider to use
    provider: Arc<dyn Provider>,

    /// The model to use
    model: String,

    /// Temperature setting
    temperature: f32,

    /// Max tokens per response
    max_tokens: Option<u32>,

    /// Extra instructions appended to the planning prompt
    instructions: Option<String>,
}

impl ProviderPlanner {
    pub fn new(provider: Arc<dyn Provider>, model: impl Into<String>) -> Self {
        Self {
            provider,
            model: model.into(),
            temperature: 0.2,
            max_tokens: None,
            instructions: None,
        }
    }

    /// Planner over `provider` using the configured model, sampling settings
    /// and extra instructions.
    pub fn from_config(provider: Arc<dyn Provider>, config: &AppConfig) -> Self {
        Self::new(provider, config.default_model.clone())
            .with_temperature(config.default_temperature)
            .with_max_tokens(config.default_max_tokens)
            .with_instructions(config.reasoning.system_prompt.clone())
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_max_tokens(mut self, max: u32) -> Self {
        self.max_tokens = Some(max);
        self
    }

    pub fn with_instructions(mut self, instructions: Option<String>) -> Self {
        self.instructions = instructions;
        self
    }

    fn planning_prompt(&self, request: &PlanRequest) -> String {
        let mut prompt = String::from(
            "You are Merlin, a virtual assistant that can search files and run terminal commands.\n\n",
        );
        prompt.push_str(PLANNING_RULES);

        prompt.push_str("\n\nTools:\n");
        for tool in &request.tools {
            prompt.push_str(&format!(
                "- {}: {}\n  parameters: {}\n",
                tool.name, tool.description, tool.parameters
            ));
        }

        if !request.directories.is_empty() {
            prompt.push_str("\nYou have access to the following directories:\n");
            for dir in &request.directories {
                prompt.push_str(&format!("- {dir}\n"));
            }
        }

        if let Some(extra) = &self.instructions {
            prompt.push('\n');
            prompt.push_str(extra);
            prompt.push('\n');
        }
        prompt
    }

    fn planning_messages(&self, request: &PlanRequest) -> Vec<Message> {
        let mut messages = vec![
            Message::system(self.planning_prompt(request)),
            Message::user(request.query.clone()),
        ];

        if !request.history.is_empty() {
            messages.push(Message::user(format!(
                "Steps run so far (indices are fixed; new steps continue from {}):\n{}\n\n\
                 Plan the remaining steps only.",
                request.history.len(),
                render_history(&request.history)
            )));
        }

        if let Some(feedback) = &request.feedback {
            messages.push(Message::user(format!(
                "Your previous plan was rejected: {feedback}\nReply with a corrected plan."
            )));
        }
        messages
    }

    fn request(&self, messages: Vec<Message>, json_mode: bool) -> ProviderRequest {
        let mut request = ProviderRequest::new(self.model.clone(), messages);
        request.temperature = self.temperature;
        request.max_tokens = self.max_tokens;
        request.json_mode = json_mode;
        request
    }
}

#[async_trait]
impl Planner for ProviderPlanner {
    fn name(&self) -> &str {
        self.provider.name()
    }

    async fn plan(&self, request: &PlanRequest) -> Result<Vec<StepProposal>, ProviderError> {
        let messages = self.planning_messages(request);
        debug!(
            provider = self.provider.name(),
            model = %self.model,
            history = request.history.len(),
            replan = request.feedback.is_some(),
            "Requesting plan"
        );

        let response = self.provider.complete(self.request(messages, true)).await?;
        let steps = parse_plan(&response.message.content).inspect_err(|e| {
            warn!(error = %e, "Planner reply was not a usable plan");
        })?;

        debug!(steps = steps.len(), "Plan received");
        Ok(steps)
    }

    async fn synthesize(&self, request: &SynthesisRequest) -> Result<String, ProviderError> {
        let mut content = format!("Request: {}", request.query);
        if request.history.is_empty() {
            content.push_str("\n\nNo tools were needed; answer directly.");
        } else {
            content.push_str("\n\nStep results:\n");
            content.push_str(&render_history(&request.history));
        }

        let messages = vec![Message::system(SYNTHESIS_RULES), Message::user(content)];
        let response = self.provider.complete(self.request(messages, false)).await?;

        let text = response.message.content.trim().to_string();
        if text.is_empty() {
            return Err(ProviderError::InvalidResponse("empty synthesis reply".into()));
        }
        Ok(text)
    }
}

fn render_history(history: &[ReasoningStep]) -> String {
    history
        .iter()
        .map(ReasoningStep::summary)
        .collect::<Vec<_>>()
        .join("\n")
}

#[derive(Deserialize)]
struct PlanReply {
    #[serde(default)]
    steps: Vec<StepProposal>,
}

/// Extract the plan from a model reply.
///
/// Accepts a fenced ```json block, a bare object, or an object surrounded by
/// prose. A bare array of steps is accepted as well.
pub fn parse_plan(output: &str) -> Result<Vec<StepProposal>, ProviderError> {
    let trimmed = output.trim();

    let json_str = if let Some(start) = trimmed.find("```json") {
        let rest = &trimmed[start + 7..];
        rest.find("```").map(|end| rest[..end].trim()).unwrap_or(rest.trim())
    } else if trimmed.starts_with('[') {
        trimmed
    } else if let (Some(start), Some(end)) = (trimmed.find('{'), trimmed.rfind('}'))
        && start < end
    {
        &trimmed[start..=end]
    } else {
        return Err(ProviderError::InvalidResponse(format!(
            "no JSON plan in reply: {}",
            truncate_chars(trimmed, 200)
        )));
    };

    if json_str.starts_with('[') {
        return serde_json::from_str::<Vec<StepProposal>>(json_str)
            .map_err(|e| ProviderError::InvalidResponse(format!("{e}: {}", truncate_chars(json_str, 200))));
    }

    serde_json::from_str::<PlanReply>(json_str)
        .map(|reply| reply.steps)
        .map_err(|e| ProviderError::InvalidResponse(format!("{e}: {}", truncate_chars(json_str, 200))))
}
