use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub service: ServiceConfig,
    #[serde(default)]
    pub router: RouterConfig,
    #[serde(default)]
    pub security: SecurityConfig,
    /// Models in preference order; the router tries them front to back
    #[serde(default)]
    pub models: Vec<ModelConfig>,
}

/// Step scheduler behavior
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Maximum number of steps executed per plan (default: 10)
    #[serde(default = "default_max_steps")]
    pub max_steps: usize,

    /// Per-attempt step timeout in milliseconds (default: 300000)
    #[serde(default = "default_step_timeout_ms")]
    pub timeout_ms: u64,

    /// Dispatch read-only/network steps concurrently (default: true)
    #[serde(default = "default_true")]
    pub allow_parallel: bool,

    /// Retries after the first attempt (default: 2)
    #[serde(default = "default_retry_count")]
    pub retry_count: u32,

    /// Backoff unit; attempt N waits N times this long (default: 1000)
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,

    /// Stop at the first step that fails after retries (default: false)
    #[serde(default)]
    pub validate_results: bool,

    /// Log step progress at info level (default: true)
    #[serde(default = "default_true")]
    pub log_execution: bool,

    /// How many previously scheduled steps a parallel candidate is checked against
    #[serde(default = "default_conflict_lookback")]
    pub conflict_lookback: usize,
}

fn default_max_steps() -> usize {
    10
}

fn default_step_timeout_ms() -> u64 {
    300_000
}

fn default_retry_count() -> u32 {
    2
}

fn default_retry_backoff_ms() -> u64 {
    1000
}

fn default_conflict_lookback() -> usize {
    3
}

fn default_true() -> bool {
    true
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_steps: default_max_steps(),
            timeout_ms: default_step_timeout_ms(),
            allow_parallel: true,
            retry_count: default_retry_count(),
            retry_backoff_ms: default_retry_backoff_ms(),
            validate_results: false,
            log_execution: true,
            conflict_lookback: default_conflict_lookback(),
        }
    }
}

/// Request queue / concurrency limits
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Maximum scheduler runs in flight at once (default: 5)
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_executions: usize,

    /// Step timeout applied to requests submitted through the service (default: 300000)
    #[serde(default = "default_step_timeout_ms")]
    pub default_timeout_ms: u64,

    /// Track counts, latency and tool usage (default: true)
    #[serde(default = "default_true")]
    pub enable_metrics: bool,

    /// How often the history cleanup task runs, in milliseconds (default: 60000)
    #[serde(default = "default_cleanup_interval_ms")]
    pub auto_cleanup_interval_ms: u64,

    /// Completed executions kept in history (default: 1000)
    #[serde(default = "default_max_history")]
    pub max_history: usize,
}

fn default_max_concurrent() -> usize {
    5
}

fn default_cleanup_interval_ms() -> u64 {
    60_000
}

fn default_max_history() -> usize {
    1000
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            max_concurrent_executions: default_max_concurrent(),
            default_timeout_ms: default_step_timeout_ms(),
            enable_metrics: true,
            auto_cleanup_interval_ms: default_cleanup_interval_ms(),
            max_history: default_max_history(),
        }
    }
}

/// Circuit breaker thresholds shared by every routed model
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterConfig {
    /// Consecutive failures that open a breaker (default: 5)
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Time an open breaker rejects calls before probing (default: 30000)
    #[serde(default = "default_cooldown_ms")]
    pub cooldown_ms: u64,

    /// Consecutive half-open successes needed to close (default: 2)
    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,

    /// Trial calls allowed in flight while half-open (default: 1)
    #[serde(default = "default_half_open_max_calls")]
    pub half_open_max_calls: u32,

    /// HTTP timeout for provider calls in milliseconds (default: 60000)
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// Recent call records kept for inspection (default: 200)
    #[serde(default = "default_max_call_records")]
    pub max_call_records: usize,
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_cooldown_ms() -> u64 {
    30_000
}

fn default_success_threshold() -> u32 {
    2
}

fn default_half_open_max_calls() -> u32 {
    1
}

fn default_request_timeout_ms() -> u64 {
    60_000
}

fn default_max_call_records() -> usize {
    200
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            cooldown_ms: default_cooldown_ms(),
            success_threshold: default_success_threshold(),
            half_open_max_calls: default_half_open_max_calls(),
            request_timeout_ms: default_request_timeout_ms(),
            max_call_records: default_max_call_records(),
        }
    }
}

impl RouterConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SecurityConfig {
    /// Extra paths that `write_file`/`delete_file` may never touch,
    /// on top of the built-in system locations
    #[serde(default)]
    pub reserved_paths: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LlmProvider {
    OpenAI,
    OpenRouter,
    Ollama,
    #[serde(rename = "openai-generic")]
    OpenAIGeneric,
}

impl LlmProvider {
    pub fn as_str(&self) -> &'static str {
        match self {
            LlmProvider::OpenAI => "openai",
            LlmProvider::OpenRouter => "openrouter",
            LlmProvider::Ollama => "ollama",
            LlmProvider::OpenAIGeneric => "openai-generic",
        }
    }

    fn default_key_env(&self) -> Option<&'static str> {
        match self {
            LlmProvider::OpenAI => Some("OPENAI_API_KEY"),
            LlmProvider::OpenRouter => Some("OPENROUTER_API_KEY"),
            LlmProvider::Ollama | LlmProvider::OpenAIGeneric => None,
        }
    }
}

/// One routable model
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Model identifier sent to the provider; also the breaker key
    pub name: String,
    pub provider: LlmProvider,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
    /// USD per 1000 prompt tokens
    #[serde(default)]
    pub cost_per_1k_tokens_in: f64,
    /// USD per 1000 completion tokens
    #[serde(default)]
    pub cost_per_1k_tokens_out: f64,
    /// Base URL override (required for openai-generic)
    #[serde(default)]
    pub base_url: Option<String>,
    /// Environment variable holding the API key; defaults per provider
    #[serde(default)]
    pub api_key_env: Option<String>,
}

fn default_temperature() -> f32 {
    0.2
}

fn default_max_tokens() -> usize {
    2048
}

impl ModelConfig {
    pub fn new(name: impl Into<String>, provider: LlmProvider) -> Self {
        Self {
            name: name.into(),
            provider,
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            cost_per_1k_tokens_in: 0.0,
            cost_per_1k_tokens_out: 0.0,
            base_url: None,
            api_key_env: None,
        }
    }

    pub fn with_costs(mut self, per_1k_in: f64, per_1k_out: f64) -> Self {
        self.cost_per_1k_tokens_in = per_1k_in;
        self.cost_per_1k_tokens_out = per_1k_out;
        self
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    /// Look up the API key in the environment
    pub fn resolve_api_key(&self) -> Option<String> {
        let var = self
            .api_key_env
            .as_deref()
            .or_else(|| self.provider.default_key_env())?;
        std::env::var(var).ok().filter(|k| !k.is_empty())
    }

    /// Cost in USD for the given token counts
    pub fn cost_for(&self, input_tokens: usize, output_tokens: usize) -> f64 {
        (input_tokens as f64 / 1000.0) * self.cost_per_1k_tokens_in
            + (output_tokens as f64 / 1000.0) * self.cost_per_1k_tokens_out
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path()?;

        if !config_path.exists() {
            return Ok(Self::default());
        }

        Self::load_from(&config_path)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;

        toml::from_str(&content).context("Failed to parse config file")
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;

        Ok(())
    }

    pub fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir().context("Could not determine config directory")?;
        Ok(config_dir
            .join("assistant-orchestrator")
            .join("config.toml"))
    }
}

impl Default for Config {
    fn default() -> Self {
        // Try to detect usable providers from environment variables
        let mut models = Vec::new();
        if std::env::var("OPENAI_API_KEY").is_ok() {
            models.push(ModelConfig::new("gpt-4o-mini", LlmProvider::OpenAI).with_costs(0.00015, 0.0006));
        }
        if std::env::var("OPENROUTER_API_KEY").is_ok() {
            models.push(
                ModelConfig::new("anthropic/claude-3-5-haiku", LlmProvider::OpenRouter)
                    .with_costs(0.0008, 0.004),
            );
        }
        if models.is_empty() {
            // Local fallback so a fresh install has something to route to
            models.push(ModelConfig::new("llama3.1", LlmProvider::Ollama));
        }

        Self {
            pipeline: PipelineConfig::default(),
            service: ServiceConfig::default(),
            router: RouterConfig::default(),
            security: SecurityConfig::default(),
            models,
        }
    }
}
