use crate::breaker::BreakerConfig;
use crate::hedge::HedgeConfig;
use crate::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Supported provider families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LlmProvider {
    /// Anthropic messages API.
    Claude,
    /// OpenAI chat completions.
    OpenAi,
    /// OpenRouter, OpenAI-compatible API.
    OpenRouter,
    /// Groq cloud inference, OpenAI-compatible API.
    Groq,
    /// Scripted in-process provider for demos and tests.
    Mock,
}

impl LlmProvider {
    /// Lowercase name, as used in config files.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Claude => "claude",
            Self::OpenAi => "openai",
            Self::OpenRouter => "openrouter",
            Self::Groq => "groq",
            Self::Mock => "mock",
        }
    }

    fn default_base_url(self) -> &'static str {
        match self {
            Self::Claude => "https://api.anthropic.com",
            Self::OpenAi => "https://api.openai.com",
            Self::OpenRouter => "https://openrouter.ai/api",
            Self::Groq => "https://api.groq.com/openai",
            Self::Mock => "local://mock",
        }
    }
}

impl fmt::Display for LlmProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// One configured model plus its ordered fallback chain.
///
/// ```toml
/// [model]
/// provider = "openai"
/// model_id = "gpt-4o"
/// api_key_env = "OPENAI_API_KEY"
///
/// [[model.fallback_models]]
/// provider = "claude"
/// model_id = "claude-sonnet-4-20250514"
/// api_key_env = "ANTHROPIC_API_KEY"
/// ```
#[derive(Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Which API family to speak.
    pub provider: LlmProvider,
    /// Model name as the provider knows it.
    pub model_id: String,
    /// Provider identity used in logs, breaker state and metrics.
    /// Defaults to `<provider>:<model_id>`.
    #[serde(default)]
    pub name: Option<String>,
    /// Inline key. Prefer `api_key_env` outside local testing.
    #[serde(default)]
    pub api_key: Option<String>,
    /// Environment variable holding the key, read at call time.
    #[serde(default)]
    pub api_key_env: Option<String>,
    /// Overrides the provider's default endpoint.
    #[serde(default)]
    pub api_base_url: Option<String>,
    /// Per-call timeout.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Completion token limit unless the request sets its own.
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    /// Tried after this model, in order. May nest.
    #[serde(default)]
    pub fallback_models: Vec<ModelConfig>,
}

fn default_timeout_ms() -> u64 {
    60_000
}

fn default_max_tokens() -> u32 {
    4096
}

impl fmt::Debug for ModelConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelConfig")
            .field("provider", &self.provider)
            .field("model_id", &self.model_id)
            .field("name", &self.name)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("api_key_env", &self.api_key_env)
            .field("api_base_url", &self.api_base_url)
            .field("timeout_ms", &self.timeout_ms)
            .field("fallback_models", &self.fallback_models)
            .finish()
    }
}

impl ModelConfig {
    /// A model with default timeout and token limit and no fallbacks.
    pub fn new(provider: LlmProvider, model_id: impl Into<String>) -> Self {
        Self {
            provider,
            model_id: model_id.into(),
            name: None,
            api_key: None,
            api_key_env: None,
            api_base_url: None,
            timeout_ms: default_timeout_ms(),
            max_tokens: default_max_tokens(),
            fallback_models: Vec::new(),
        }
    }

    /// The configured base URL, or the provider's default.
    pub fn base_url(&self) -> &str {
        self.api_base_url
            .as_deref()
            .unwrap_or_else(|| self.provider.default_base_url())
    }

    /// `name` if set, otherwise `<provider>:<model_id>`.
    pub fn provider_id(&self) -> String {
        self.name
            .clone()
            .unwrap_or_else(|| format!("{}:{}", self.provider, self.model_id))
    }

    fn credential(&self) -> Credential {
        match (&self.api_key, &self.api_key_env) {
            (Some(key), _) if !key.is_empty() => Credential::Inline(key.clone()),
            (_, Some(var)) => Credential::Env(var.clone()),
            _ => Credential::None,
        }
    }

    /// Flattens this model and its fallbacks (depth-first) into descriptors
    /// with ascending priority. The primary gets priority 0.
    pub fn descriptors(&self) -> Vec<ProviderDescriptor> {
        let mut out = Vec::new();
        self.collect_descriptors(&mut out);
        out
    }

    fn collect_descriptors(&self, out: &mut Vec<ProviderDescriptor>) {
        let priority = out.len() as u32;
        out.push(ProviderDescriptor {
            id: self.provider_id(),
            kind: self.provider,
            model_id: self.model_id.clone(),
            base_url: self.base_url().to_string(),
            priority,
            timeout: Duration::from_millis(self.timeout_ms),
            max_tokens: self.max_tokens,
            credential: self.credential(),
        });
        for fallback in &self.fallback_models {
            fallback.collect_descriptors(out);
        }
    }
}

/// Where a provider's API key comes from.
#[derive(Clone, PartialEq, Eq)]
pub enum Credential {
    /// Key given directly in config.
    Inline(String),
    /// Name of an environment variable holding the key.
    Env(String),
    /// No key configured. Calls fail with an authentication error.
    None,
}

impl Credential {
    /// Resolves the key. Environment variables are read on every call so a
    /// rotated key is picked up without a restart.
    pub fn resolve(&self) -> Option<String> {
        match self {
            Self::Inline(key) => Some(key.clone()),
            Self::Env(var) => std::env::var(var).ok().filter(|v| !v.is_empty()),
            Self::None => None,
        }
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Inline(_) => f.write_str("Inline(<redacted>)"),
            Self::Env(var) => write!(f, "Env({var})"),
            Self::None => f.write_str("None"),
        }
    }
}

/// Immutable description of one registered provider.
#[derive(Debug, Clone)]
pub struct ProviderDescriptor {
    /// Unique among registered providers.
    pub id: String,
    /// API family.
    pub kind: LlmProvider,
    /// Model name sent to the provider.
    pub model_id: String,
    /// Endpoint, without the API path.
    pub base_url: String,
    /// Lower is preferred.
    pub priority: u32,
    /// Limit for each attempt, not for the whole retry sequence.
    pub timeout: Duration,
    /// Default completion token limit.
    pub max_tokens: u32,
    /// Where the API key comes from.
    pub credential: Credential,
}

impl ProviderDescriptor {
    /// A descriptor for an in-process provider.
    pub fn mock(id: impl Into<String>, priority: u32) -> Self {
        let id = id.into();
        Self {
            model_id: id.clone(),
            id,
            kind: LlmProvider::Mock,
            base_url: LlmProvider::Mock.default_base_url().to_string(),
            priority,
            timeout: Duration::from_millis(default_timeout_ms()),
            max_tokens: default_max_tokens(),
            credential: Credential::None,
        }
    }

    /// Replaces the per-call timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Resilience settings for the dispatcher.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResilienceConfig {
    /// Circuit breaker thresholds.
    #[serde(default)]
    pub breaker: BreakerConfig,
    /// Backoff between attempts against one provider.
    #[serde(default)]
    pub retry: RetryPolicy,
    /// When to start a second request.
    #[serde(default)]
    pub hedge: HedgeConfig,
    /// Completed dispatches between re-rankings when adaptive optimization
    /// is on.
    #[serde(default = "default_rerank_interval")]
    pub rerank_interval: u64,
}

fn default_rerank_interval() -> u64 {
    20
}

/// Refinement loop settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThinkingConfig {
    /// Wall-clock budget for one run.
    #[serde(default = "default_max_thinking_time_ms")]
    pub max_thinking_time_ms: u64,
    /// Stop once a round scores at least this.
    #[serde(default = "default_target_quality")]
    pub target_quality: f64,
    /// Hard upper bound on rounds, whatever the caller asks for.
    #[serde(default = "default_safety_round_cap")]
    pub safety_round_cap: u32,
    /// Concurrent candidates per round with parallel thinking on.
    #[serde(default = "default_branches")]
    pub branches: u32,
    /// Caller context beyond this many messages is dropped, oldest first.
    #[serde(default = "default_max_context_messages")]
    pub max_context_messages: usize,
    /// Cap on the previous answer and critique fed into the next round.
    #[serde(default = "default_max_carry_chars")]
    pub max_carry_chars: usize,
    /// Default sampling temperature for generate calls.
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    /// Token limit for critique calls.
    #[serde(default = "default_critique_max_tokens")]
    pub critique_max_tokens: u32,
}

fn default_max_thinking_time_ms() -> u64 {
    60_000
}

fn default_target_quality() -> f64 {
    0.9
}

fn default_safety_round_cap() -> u32 {
    8
}

fn default_branches() -> u32 {
    2
}

fn default_max_context_messages() -> usize {
    12
}

fn default_max_carry_chars() -> usize {
    4000
}

fn default_temperature() -> f32 {
    0.7
}

fn default_critique_max_tokens() -> u32 {
    512
}

impl Default for ThinkingConfig {
    fn default() -> Self {
        Self {
            max_thinking_time_ms: default_max_thinking_time_ms(),
            target_quality: default_target_quality(),
            safety_round_cap: default_safety_round_cap(),
            branches: default_branches(),
            max_context_messages: default_max_context_messages(),
            max_carry_chars: default_max_carry_chars(),
            temperature: default_temperature(),
            critique_max_tokens: default_critique_max_tokens(),
        }
    }
}

impl ThinkingConfig {
    /// `max_thinking_time_ms` as a [`Duration`].
    pub fn max_thinking_time(&self) -> Duration {
        Duration::from_millis(self.max_thinking_time_ms)
    }
}
