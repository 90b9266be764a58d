//! Resilient multi-provider LLM dispatch and the recursive thinking engine.
//!
//! The [`Dispatcher`] routes each completion through a [`CircuitBreaker`],
//! a [`RetryPolicy`] and a [`HedgeController`] across the configured
//! providers; [`RecursiveThinkingEngine`] drives it round by round.

/// Provider clients.
pub mod backends;
/// Per-provider circuit breaker.
pub mod breaker;
/// Model, provider and resilience configuration.
pub mod config;
/// Routes completions across providers.
pub mod dispatcher;
/// Runtime feature flags.
pub mod flags;
/// Hedged requests.
pub mod hedge;
pub mod ranking;
/// Retry with exponential backoff.
pub mod retry;
/// Events emitted while thinking.
pub mod stream;
pub mod thinking;

pub use backends::{
    Completion, CompletionRequest, MockProvider, MockReply, ProviderClient, RequestPurpose,
};
pub use breaker::{
    BreakerConfig, CallPermit, CircuitBreaker, CircuitSnapshot, CircuitState, CircuitTransition,
};
pub use config::{LlmProvider, ModelConfig, ProviderDescriptor, ResilienceConfig, ThinkingConfig};
pub use dispatcher::{CompletionResult, Dispatcher, ProviderStatus, RequestAttempt};
pub use flags::FeatureFlags;
pub use hedge::{HedgeConfig, HedgeController, Lane};
pub use retry::{RetryError, RetryPolicy};
pub use stream::ThinkingEvent;
pub use thinking::{
    RecursiveThinkingEngine, StopReason, ThinkingRequest, ThinkingResult, ThinkingRound,
};
