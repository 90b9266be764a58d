/// Anthropic messages API.
pub mod claude;
/// Scripted provider for tests and demos.
pub mod mock;
/// OpenAI-compatible chat completions (OpenAI, OpenRouter, Groq).
pub mod openai;

use crate::config::{LlmProvider, ProviderDescriptor};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thinkgate_core::{Message, ProviderError, ProviderErrorKind};
use tokio_util::sync::CancellationToken;

pub use claude::ClaudeBackend;
pub use mock::{MockProvider, MockReply};
pub use openai::OpenAiBackend;

/// Why a completion is being requested.
///
/// Backends may treat critique calls as a cheaper path.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestPurpose {
    /// Produce or refine an answer.
    #[default]
    Generate,
    /// Score an existing answer.
    Critique,
}

/// A provider-neutral completion request.
#[derive(Debug, Clone, Default)]
pub struct CompletionRequest {
    /// Sent ahead of `messages` in whatever form the provider expects.
    pub system: Option<String>,
    /// Conversation, oldest first.
    pub messages: Vec<Message>,
    /// Provider default when unset.
    pub temperature: Option<f32>,
    /// Overrides the descriptor's `max_tokens` when set.
    pub max_tokens: Option<u32>,
    /// Defaults to [`RequestPurpose::Generate`].
    pub purpose: RequestPurpose,
}

impl CompletionRequest {
    /// A request with no system prompt and provider defaults.
    pub fn new(messages: Vec<Message>) -> Self {
        Self {
            messages,
            ..Default::default()
        }
    }

    /// Sets the system prompt.
    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    /// Sets the sampling temperature.
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    /// Caps the completion length for this request only.
    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    /// Marks the request as a generate or critique call.
    pub fn with_purpose(mut self, purpose: RequestPurpose) -> Self {
        self.purpose = purpose;
        self
    }
}

/// Token counts as reported by the provider.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    /// Prompt tokens.
    pub input_tokens: u64,
    /// Completion tokens.
    pub output_tokens: u64,
}

/// The text a provider produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Completion {
    /// Generated text.
    pub text: String,
    /// Model that actually answered, which can differ from the one requested.
    pub model: String,
    /// Absent when the provider does not report usage.
    #[serde(default)]
    pub usage: Option<TokenUsage>,
}

/// Trait for LLM provider clients.
///
/// Each provider (OpenAI-compatible, Claude, the scripted mock) implements
/// this trait. Implementations classify failures into [`ProviderErrorKind`]
/// and should stop work promptly when `cancel` fires; the dispatcher also
/// enforces the descriptor's timeout and the token around every call.
#[async_trait]
pub trait ProviderClient: Send + Sync {
    fn descriptor(&self) -> &ProviderDescriptor;

    fn id(&self) -> &str {
        &self.descriptor().id
    }

    async fn complete(
        &self,
        request: &CompletionRequest,
        cancel: &CancellationToken,
    ) -> Result<Completion, ProviderError>;
}

/// Builds the HTTP client for a descriptor's provider kind.
///
/// `Mock` descriptors get a mock that echoes the last user message.
pub fn build_client(descriptor: ProviderDescriptor) -> Arc<dyn ProviderClient> {
    match descriptor.kind {
        LlmProvider::Claude => Arc::new(ClaudeBackend::new(descriptor)),
        LlmProvider::OpenAi | LlmProvider::OpenRouter | LlmProvider::Groq => {
            Arc::new(OpenAiBackend::new(descriptor))
        }
        LlmProvider::Mock => Arc::new(MockProvider::echo(descriptor)),
    }
}

/// Maps a transport-level reqwest failure.
pub(crate) fn transport_error(provider: &str, err: &reqwest::Error) -> ProviderError {
    let kind = if err.is_timeout() {
        ProviderErrorKind::Timeout
    } else if err.is_builder() {
        ProviderErrorKind::InvalidRequest
    } else {
        ProviderErrorKind::Connection
    };
    ProviderError::new(provider, kind, err.to_string())
}

/// Reads a non-success response body and classifies it by status.
pub(crate) async fn status_error(provider: &str, resp: reqwest::Response) -> ProviderError {
    let status = resp.status().as_u16();
    let body = resp
        .text()
        .await
        .unwrap_or_else(|_| "unknown error".to_string());
    ProviderError::from_status(provider, status, body)
}

pub(crate) fn missing_credential(descriptor: &ProviderDescriptor) -> ProviderError {
    ProviderError::new(
        &descriptor.id,
        ProviderErrorKind::Unauthorized,
        format!("no API key configured (credential: {:?})", descriptor.credential),
    )
}

/// Races an HTTP round trip against the cancellation token.
pub(crate) async fn with_cancel<T>(
    provider: &str,
    cancel: &CancellationToken,
    fut: impl std::future::Future<Output = Result<T, ProviderError>>,
) -> Result<T, ProviderError> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(ProviderError::cancelled(provider)),
        res = fut => res,
    }
}
