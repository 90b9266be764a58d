//! Security primitives for Thinkgate.
//!
//! Provides scoped API key issuance and validation, rate limiting and audit
//! logging for the gateway.
//!
//! # Main types
//!
//! - [`ApiKeyManager`]: Process-wide key store: create, validate, revoke.
//! - [`ApiKeyRecord`]: A key's public record (the secret is only a hash).
//! - [`Scope`]: A named permission bound to a key.
//! - [`RateLimiter`]: Token-bucket rate limiter keyed by API key id.
//! - [`AuditLog`]: Append-only audit trail persisted to disk.

/// API key store.
pub mod api_keys;
/// Audit logging module.
pub mod audit;
/// Token-bucket rate limiting.
pub mod rate_limit;
/// Key scopes.
pub mod scope;

pub use api_keys::{
    ApiKeyManager, ApiKeyRecord, AuthFailure, IssuedKey, KeyStoreConfig, KeyStoreError,
};
pub use audit::AuditLog;
pub use rate_limit::RateLimiter;
pub use scope::Scope;
