use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{PlanwiseError, Result};
use crate::types::ThinkingLevel;

/// Agent roles that can be configured under `[agents.<role>]` and
/// overridden with `<ROLE>_MODEL_ID`.
pub const AGENT_ROLES: &[&str] = &[
    "coordinator",
    "planner",
    "supervisor",
    "coder",
    "reporter",
    "tracker",
    "validator",
    "toy_agent",
];

const DEFAULT_ANTHROPIC_MODEL: &str = "claude-sonnet-4-20250514";
const DEFAULT_OPENAI_MODEL: &str = "gpt-4o";

/// Top-level planwise configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub agent: AgentConfig,
    pub model: ModelConfig,
    #[serde(default)]
    pub fallback_models: Vec<ModelConfig>,
    /// Per-role overrides, keyed by role name.
    #[serde(default)]
    pub agents: HashMap<String, AgentProfile>,
    #[serde(default)]
    pub workflow: WorkflowConfig,
    #[serde(default)]
    pub tools: ToolsConfig,
    #[serde(default)]
    pub prompts: PromptsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default = "default_max_turns")]
    pub max_turns: usize,
    /// Tool output longer than this is truncated before it reaches the LLM.
    #[serde(default = "default_max_tool_output_chars")]
    pub max_tool_output_chars: usize,
    /// Working directory for tools. Default: the process working directory.
    #[serde(default)]
    pub working_dir: Option<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_turns: default_max_turns(),
            max_tool_output_chars: default_max_tool_output_chars(),
            working_dir: None,
        }
    }
}

fn default_max_turns() -> usize { 25 }
fn default_max_tool_output_chars() -> usize { 30_000 }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    pub model_id: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default)]
    pub thinking: ThinkingLevel,
    /// Mark the system prompt as cacheable (Anthropic `cache_control`).
    #[serde(default)]
    pub prompt_cache: bool,
    /// Mark the tool definitions as cacheable.
    #[serde(default)]
    pub tool_cache: bool,
    #[serde(default)]
    pub retry: Option<RetryConfig>,
    #[serde(default)]
    pub extra_headers: HashMap<String, String>,
}

fn default_provider() -> String { "anthropic".to_string() }
fn default_max_tokens() -> u32 { 8192 }
fn default_temperature() -> f32 { 0.0 }

impl ModelConfig {
    pub fn new(provider: impl Into<String>, model_id: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            model_id: model_id.into(),
            api_key: None,
            base_url: None,
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            thinking: ThinkingLevel::Off,
            prompt_cache: false,
            tool_cache: false,
            retry: None,
            extra_headers: HashMap::new(),
        }
    }
}

/// Retry configuration for LLM requests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_ms: default_max_backoff(),
        }
    }
}

fn default_max_retries() -> u32 { 3 }
fn default_initial_backoff() -> u64 { 1000 }
fn default_max_backoff() -> u64 { 30000 }

/// Per-role model settings layered over `[model]`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentProfile {
    #[serde(default)]
    pub model_id: Option<String>,
    #[serde(default)]
    pub thinking: Option<ThinkingLevel>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub prompt_cache: Option<bool>,
    #[serde(default)]
    pub tool_cache: Option<bool>,
}

impl AgentProfile {
    /// Built-in settings for a role: the planner reasons, the supervisor
    /// caches its large prompt and tool list.
    pub fn builtin(role: &str) -> Self {
        match role {
            "planner" => Self {
                thinking: Some(ThinkingLevel::Medium),
                ..Default::default()
            },
            "supervisor" => Self {
                prompt_cache: Some(true),
                tool_cache: Some(true),
                ..Default::default()
            },
            _ => Self::default(),
        }
    }

    fn apply(&self, model: &mut ModelConfig) {
        if let Some(ref id) = self.model_id {
            model.model_id = id.clone();
        }
        if let Some(ref thinking) = self.thinking {
            model.thinking = thinking.clone();
        }
        if let Some(max_tokens) = self.max_tokens {
            model.max_tokens = max_tokens;
        }
        if let Some(cache) = self.prompt_cache {
            model.prompt_cache = cache;
        }
        if let Some(cache) = self.tool_cache {
            model.tool_cache = cache;
        }
    }
}

/// Plan-review workflow configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowConfig {
    /// Revisions a reviewer may request before the plan is auto-approved.
    #[serde(default = "default_max_plan_revisions")]
    pub max_plan_revisions: u32,
    /// Directory the worker agents write their outputs into.
    #[serde(default = "default_artifacts_dir")]
    pub artifacts_dir: String,
    /// Remove the artifacts directory before each run.
    #[serde(default = "default_clean_artifacts")]
    pub clean_artifacts: bool,
    /// Query used when none is given on the command line.
    #[serde(default)]
    pub default_query: Option<String>,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            max_plan_revisions: default_max_plan_revisions(),
            artifacts_dir: default_artifacts_dir(),
            clean_artifacts: default_clean_artifacts(),
            default_query: None,
        }
    }
}

fn default_max_plan_revisions() -> u32 { 10 }
fn default_artifacts_dir() -> String { "./artifacts".to_string() }
fn default_clean_artifacts() -> bool { true }

/// Code-execution tool settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolsConfig {
    #[serde(default = "default_python_bin")]
    pub python_bin: String,
    #[serde(default = "default_python_timeout")]
    pub python_timeout_secs: u64,
    #[serde(default = "default_bash_timeout")]
    pub bash_timeout_secs: u64,
    #[serde(default = "default_write_and_execute_timeout")]
    pub write_and_execute_timeout_secs: u64,
    #[serde(default = "default_worker_timeout")]
    pub worker_timeout_secs: u64,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            python_bin: default_python_bin(),
            python_timeout_secs: default_python_timeout(),
            bash_timeout_secs: default_bash_timeout(),
            write_and_execute_timeout_secs: default_write_and_execute_timeout(),
            worker_timeout_secs: default_worker_timeout(),
        }
    }
}

fn default_python_bin() -> String { "python3".to_string() }
fn default_python_timeout() -> u64 { 600 }
fn default_bash_timeout() -> u64 { 120 }
fn default_write_and_execute_timeout() -> u64 { 300 }
fn default_worker_timeout() -> u64 { 1800 }

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PromptsConfig {
    /// Directory of `<name>.md` templates that shadow the built-in ones.
    #[serde(default)]
    pub dir: Option<String>,
}

impl AppConfig {
    /// Load config from a TOML file, with env var expansion.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| PlanwiseError::ConfigNotFound(path.display().to_string()))?;

        // Expand ${ENV_VAR} references
        let expanded = expand_env_vars(&content);

        toml::from_str(&expanded).map_err(|e| PlanwiseError::Config(e.to_string()))
    }

    /// Build a config from provider API keys in the environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let model = if let Some(key) = lookup("ANTHROPIC_API_KEY") {
            let mut m = ModelConfig::new("anthropic", DEFAULT_ANTHROPIC_MODEL);
            m.api_key = Some(key);
            m
        } else if let Some(key) = lookup("OPENAI_API_KEY") {
            let mut m = ModelConfig::new("openai", DEFAULT_OPENAI_MODEL);
            m.api_key = Some(key);
            m
        } else {
            // Default to Ollama (local)
            let mut m = ModelConfig::new("ollama", "llama3.2");
            m.base_url = Some("http://localhost:11434/v1/chat/completions".to_string());
            m
        };

        Self {
            agent: AgentConfig::default(),
            model,
            fallback_models: vec![],
            agents: HashMap::new(),
            workflow: WorkflowConfig::default(),
            tools: ToolsConfig::default(),
            prompts: PromptsConfig::default(),
        }
    }

    /// Apply `DEFAULT_MODEL_ID`, `<ROLE>_MODEL_ID` and `MAX_PLAN_REVISIONS`
    /// from the process environment.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(id) = lookup("DEFAULT_MODEL_ID") {
            self.model.model_id = id;
        }

        for role in AGENT_ROLES {
            let key = format!("{}_MODEL_ID", role.to_uppercase());
            if let Some(id) = lookup(&key) {
                self.agents.entry(role.to_string()).or_default().model_id = Some(id);
            }
        }

        if let Some(raw) = lookup("MAX_PLAN_REVISIONS") {
            match raw.trim().parse::<u32>() {
                Ok(n) => self.workflow.max_plan_revisions = n,
                Err(_) => warn!(value = %raw, "Ignoring invalid MAX_PLAN_REVISIONS"),
            }
        }
    }

    /// Resolve the model settings for an agent role: `[model]`, then the
    /// role's built-in profile, then `[agents.<role>]`.
    pub fn model_for(&self, role: &str) -> ModelConfig {
        let mut model = self.model.clone();
        AgentProfile::builtin(role).apply(&mut model);
        if let Some(profile) = self.agents.get(role) {
            profile.apply(&mut model);
        }
        model
    }

    /// Resolve the tool working directory (expand ~).
    pub fn working_dir(&self) -> PathBuf {
        match self.agent.working_dir.as_deref() {
            Some(dir) => expand_home(dir),
            None => std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
        }
    }

    pub fn prompts_dir(&self) -> Option<PathBuf> {
        self.prompts.dir.as_deref().map(expand_home)
    }
}

fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs_home() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

/// Expand `${ENV_VAR}` patterns in a string.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(val) => result.push_str(&val),
                Err(_) => {
                    // Keep original if env var not set
                    result.push_str(&format!("${{{}}}", var_name));
                }
            }
        } else {
            result.push(c);
        }
    }
    result
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}
