//! Core types and error definitions for Thinkgate.
//!
//! This crate provides the foundational types shared across all Thinkgate
//! crates: the unified error enum, the provider error taxonomy used by the
//! dispatcher's retry and breaker logic, and the chat message types handed to
//! provider backends.
//!
//! # Main types
//!
//! - [`ThinkgateError`]: Unified error enum for all Thinkgate subsystems.
//! - [`ThinkgateResult`]: Convenience alias for `Result<T, ThinkgateError>`.
//! - [`ProviderError`]: A single failed call to one LLM provider.
//! - [`ProviderErrorKind`]: Retryable / permanent classification of provider failures.
//! - [`Role`] and [`Message`]: Chat messages sent to providers.

/// Error types.
pub mod error;
/// Chat message types.
pub mod message;
/// Tracing subscriber setup.
pub mod telemetry;

pub use error::{ProviderError, ProviderErrorKind, ThinkgateError, ThinkgateResult};
pub use message::{Message, Role};
pub use telemetry::{init_tracing, LogFormat};
