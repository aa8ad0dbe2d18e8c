//! Configuration loading, validation, and management for Merlin.
//!
//! Loads configuration from `~/.merlin/config.toml` with environment
//! variable overrides. Validates all settings at startup.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// The root configuration structure.
///
/// Maps directly to `~/.merlin/config.toml`.
#[derive(Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// API key (can be overridden per-provider)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    /// Default LLM provider
    #[serde(default = "default_provider")]
    pub default_provider: String,

    /// Default model
    #[serde(default = "default_model")]
    pub default_model: String,

    /// Default temperature
    #[serde(default = "default_temperature")]
    pub default_temperature: f32,

    /// Default max tokens per LLM response
    #[serde(default = "default_max_tokens")]
    pub default_max_tokens: u32,

    /// Providers tried in order when the default one fails
    #[serde(default)]
    pub fallback_providers: Vec<String>,

    /// Provider-specific configurations
    #[serde(default)]
    pub providers: HashMap<String, ProviderConfig>,

    /// Planning, retry and budget settings
    #[serde(default)]
    pub reasoning: ReasoningConfig,

    /// Command allow/deny policy
    #[serde(default)]
    pub policy: PolicyConfig,

    /// File search settings
    #[serde(default)]
    pub search: SearchConfig,
}

fn default_provider() -> String {
    "openai".into()
}
fn default_model() -> String {
    "gpt-4o-mini".into()
}
fn default_temperature() -> f32 {
    0.2
}
fn default_max_tokens() -> u32 {
    2048
}

fn redact(s: &Option<String>) -> &'static str {
    match s {
        Some(_) => "[REDACTED]",
        None => "None",
    }
}

impl std::fmt::Debug for AppConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppConfig")
            .field("api_key", &redact(&self.api_key))
            .field("default_provider", &self.default_provider)
            .field("default_model", &self.default_model)
            .field("default_temperature", &self.default_temperature)
            .field("default_max_tokens", &self.default_max_tokens)
            .field("fallback_providers", &self.fallback_providers)
            .field("providers", &self.providers)
            .field("reasoning", &self.reasoning)
            .field("policy", &self.policy)
            .field("search", &self.search)
            .finish()
    }
}

#[derive(Clone, Default, Serialize, Deserialize)]
pub struct ProviderConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_url: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_model: Option<String>,
}

impl std::fmt::Debug for ProviderConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderConfig")
            .field("api_key", &redact(&self.api_key))
            .field("api_url", &self.api_url)
            .field("default_model", &self.default_model)
            .finish()
    }
}

/// How the engine plans, retries and bounds a chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReasoningConfig {
    /// Planning attempts before a chain is aborted
    #[serde(default = "default_attempts")]
    pub max_plan_attempts: u32,

    /// Synthesis attempts before a chain is aborted
    #[serde(default = "default_attempts")]
    pub max_synthesis_attempts: u32,

    /// Base delay between attempts; multiplied by the attempt number
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,

    /// Wall-clock limit for one step
    #[serde(default = "default_step_timeout_secs")]
    pub step_timeout_secs: u64,

    /// Wall-clock limit for a whole chain
    #[serde(default = "default_chain_budget_secs")]
    pub chain_budget_secs: u64,

    /// Maximum number of dispatched steps per chain
    #[serde(default = "default_max_steps")]
    pub max_steps: usize,

    /// Replans allowed in response to failed steps
    #[serde(default = "default_max_failure_replans")]
    pub max_failure_replans: u32,

    /// Also replan when a search step finds nothing
    #[serde(default)]
    pub replan_on_empty_results: bool,

    /// Extra instructions appended to the planning prompt
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
}

fn default_attempts() -> u32 {
    3
}
fn default_retry_backoff_ms() -> u64 {
    250
}
fn default_step_timeout_secs() -> u64 {
    60
}
fn default_chain_budget_secs() -> u64 {
    300
}
fn default_max_steps() -> usize {
    16
}
fn default_max_failure_replans() -> u32 {
    1
}

impl Default for ReasoningConfig {
    fn default() -> Self {
        Self {
            max_plan_attempts: default_attempts(),
            max_synthesis_attempts: default_attempts(),
            retry_backoff_ms: default_retry_backoff_ms(),
            step_timeout_secs: default_step_timeout_secs(),
            chain_budget_secs: default_chain_budget_secs(),
            max_steps: default_max_steps(),
            max_failure_replans: default_max_failure_replans(),
            replan_on_empty_results: false,
            system_prompt: None,
        }
    }
}

/// What `execute_commands` steps are allowed to run, and where.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyConfig {
    /// Base commands that may appear in any pipeline segment
    #[serde(default = "default_allowed_commands")]
    pub allowed_commands: Vec<String>,

    /// Regexes; a command matching any of them is rejected
    #[serde(default = "default_denied_patterns")]
    pub denied_patterns: Vec<String>,

    /// Directories commands may run in and modify (`~` is expanded)
    #[serde(default = "default_home_dirs")]
    pub approved_directories: Vec<String>,

    /// Paths that stay off limits even inside an approved directory
    #[serde(default = "default_forbidden_paths")]
    pub forbidden_paths: Vec<String>,

    /// Policy decisions kept in memory by the audit log; older ones are dropped
    #[serde(default = "default_audit_retention")]
    pub audit_retention: usize,
}

fn default_allowed_commands() -> Vec<String> {
    [
        // file operations
        "ls", "cp", "mv", "mkdir", "touch", "cat", "head", "tail", "find", "grep",
        // navigation
        "cd", "pwd",
        // information
        "file", "stat", "du", "df", "wc",
        // archives
        "tar", "zip", "unzip", "gzip", "gunzip",
        // network
        "ping", "wget", "curl",
        // output
        "echo", "printf",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

fn default_denied_patterns() -> Vec<String> {
    [
        r"rm\s+(-[rf]+\s+)?/",
        r"sudo",
        r"chmod\s+777",
        r"mkfs",
        r">(>)?.*/(passwd|shadow|group)",
        r"dd\s+.*\s+of=/dev/",
        r":\(\)\s*\{\s*:\|:&\s*\};:",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

fn default_home_dirs() -> Vec<String> {
    vec!["~".into()]
}

fn default_forbidden_paths() -> Vec<String> {
    ["/etc", "/proc", "/sys", "~/.ssh", "~/.gnupg", "~/.aws"]
        .into_iter()
        .map(String::from)
        .collect()
}

fn default_audit_retention() -> usize {
    1024
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            allowed_commands: default_allowed_commands(),
            denied_patterns: default_denied_patterns(),
            approved_directories: default_home_dirs(),
            forbidden_paths: default_forbidden_paths(),
            audit_retention: default_audit_retention(),
        }
    }
}

/// Limits for `search_files` steps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchConfig {
    /// Directories searches may traverse (`~` is expanded)
    #[serde(default = "default_home_dirs")]
    pub roots: Vec<String>,

    #[serde(default = "default_max_results")]
    pub max_results: usize,

    #[serde(default = "default_max_depth")]
    pub max_depth: usize,

    /// Files larger than this are skipped by content filters
    #[serde(default = "default_max_content_bytes")]
    pub max_content_bytes: u64,
}

fn default_max_results() -> usize {
    50
}
fn default_max_depth() -> usize {
    8
}
fn default_max_content_bytes() -> u64 {
    1024 * 1024
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            roots: default_home_dirs(),
            max_results: default_max_results(),
            max_depth: default_max_depth(),
            max_content_bytes: default_max_content_bytes(),
        }
    }
}

impl AppConfig {
    /// Load configuration from the default path (~/.merlin/config.toml).
    ///
    /// Also checks environment variables for API keys:
    /// - `MERLIN_API_KEY` (highest priority)
    /// - `OPENAI_API_KEY`
    /// - `OPENROUTER_API_KEY`
    pub fn load() -> Result<Self, ConfigError> {
        let config_path = Self::config_dir().join("config.toml");
        let mut config = Self::load_from(&config_path)?;

        if config.api_key.is_none() {
            config.api_key = std::env::var("MERLIN_API_KEY")
                .ok()
                .or_else(|| std::env::var("OPENAI_API_KEY").ok())
                .or_else(|| std::env::var("OPENROUTER_API_KEY").ok());
        }

        if let Ok(provider) = std::env::var("MERLIN_PROVIDER") {
            config.default_provider = provider;
        }

        if let Ok(model) = std::env::var("MERLIN_MODEL") {
            config.default_model = model;
        }

        Ok(config)
    }

    /// Load configuration from a specific file path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::info!("No config file found at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        Self::from_toml(&content).map_err(|e| match e {
            ConfigError::ParseError { reason, .. } => ConfigError::ParseError {
                path: path.to_path_buf(),
                reason,
            },
            other => other,
        })
    }

    /// Parse and validate configuration from a TOML string.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content).map_err(|e| ConfigError::ParseError {
            path: PathBuf::from("<inline>"),
            reason: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Get the configuration directory path.
    pub fn config_dir() -> PathBuf {
        dirs_home().join(".merlin")
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.default_temperature < 0.0 || self.default_temperature > 2.0 {
            return Err(ConfigError::ValidationError(
                "default_temperature must be between 0.0 and 2.0".into(),
            ));
        }

        let r = &self.reasoning;
        for (name, value) in [
            ("reasoning.max_plan_attempts", u64::from(r.max_plan_attempts)),
            ("reasoning.max_synthesis_attempts", u64::from(r.max_synthesis_attempts)),
            ("reasoning.step_timeout_secs", r.step_timeout_secs),
            ("reasoning.chain_budget_secs", r.chain_budget_secs),
            ("reasoning.max_steps", r.max_steps as u64),
            ("search.max_results", self.search.max_results as u64),
        ] {
            if value == 0 {
                return Err(ConfigError::ValidationError(format!("{name} must be > 0")));
            }
        }

        for pattern in &self.policy.denied_patterns {
            regex::Regex::new(pattern).map_err(|e| {
                ConfigError::ValidationError(format!("invalid denied pattern '{pattern}': {e}"))
            })?;
        }

        if self.policy.approved_directories.is_empty() {
            return Err(ConfigError::ValidationError(
                "policy.approved_directories must not be empty".into(),
            ));
        }

        Ok(())
    }

    /// Check if an API key is available (from config or environment).
    pub fn has_api_key(&self) -> bool {
        self.api_key.is_some()
    }

    /// Generate a default config TOML string (for `onboard` command).
    pub fn default_toml() -> String {
        let config = Self::default();
        toml::to_string_pretty(&config).unwrap_or_default()
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            default_provider: default_provider(),
            default_model: default_model(),
            default_temperature: default_temperature(),
            default_max_tokens: default_max_tokens(),
            fallback_providers: Vec::new(),
            providers: HashMap::new(),
            reasoning: ReasoningConfig::default(),
            policy: PolicyConfig::default(),
            search: SearchConfig::default(),
        }
    }
}

/// Get the user's home directory.
pub fn dirs_home() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("C:\\Users\\Default"))
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/tmp"))
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file at {path}: {reason}")]
    ReadError { path: PathBuf, reason: String },

    #[error("Failed to parse config file at {path}: {reason}")]
    ParseError { path: PathBuf, reason: String },

    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}
