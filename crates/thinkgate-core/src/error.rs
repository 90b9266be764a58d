use serde::{Deserialize, Serialize};
use std::fmt;

/// A convenience `Result` alias using [`ThinkgateError`].
pub type ThinkgateResult<T> = Result<T, ThinkgateError>;

/// Classification of a failed provider call.
///
/// The dispatcher only looks at the kind: it decides whether a call is
/// retried, whether it counts against the provider's circuit, and whether
/// failover to the next provider makes sense.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderErrorKind {
    /// The call exceeded the provider's timeout.
    Timeout,
    /// The connection could not be established or was reset.
    Connection,
    /// The provider throttled the request (HTTP 429).
    RateLimited,
    /// The provider failed internally (HTTP 5xx, overloaded).
    ServerError,
    /// The request itself was rejected as malformed (HTTP 400/404/422).
    InvalidRequest,
    /// The provider credential was rejected (HTTP 401/403).
    Unauthorized,
    /// The account's quota or credit is exhausted.
    QuotaExhausted,
    /// The call was cancelled before it finished.
    Cancelled,
}

impl ProviderErrorKind {
    /// Transient errors worth re-issuing to the same provider.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            Self::Timeout | Self::Connection | Self::RateLimited | Self::ServerError
        )
    }

    /// Whether the outcome says anything bad about the provider's health.
    ///
    /// A rejected request means the provider answered properly, and a
    /// cancelled call never got an answer at all.
    pub fn is_provider_fault(self) -> bool {
        !matches!(self, Self::InvalidRequest | Self::Cancelled)
    }

    /// Stable snake_case name, used in logs and JSON.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::Connection => "connection",
            Self::RateLimited => "rate_limited",
            Self::ServerError => "server_error",
            Self::InvalidRequest => "invalid_request",
            Self::Unauthorized => "unauthorized",
            Self::QuotaExhausted => "quota_exhausted",
            Self::Cancelled => "cancelled",
        }
    }

    /// Maps an HTTP status code returned by a provider API.
    pub fn from_status(status: u16) -> Self {
        match status {
            408 | 504 => Self::Timeout,
            429 => Self::RateLimited,
            401 | 403 => Self::Unauthorized,
            402 => Self::QuotaExhausted,
            500..=599 => Self::ServerError,
            _ => Self::InvalidRequest,
        }
    }
}

impl fmt::Display for ProviderErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single failed call to one provider.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("provider '{provider}' failed ({kind}): {message}")]
pub struct ProviderError {
    /// Identity of the provider that was contacted.
    pub provider: String,
    /// Failure classification.
    pub kind: ProviderErrorKind,
    /// Human-readable detail, usually the provider's response body.
    pub message: String,
    /// HTTP status, when the provider answered at all.
    pub status: Option<u16>,
}

impl ProviderError {
    /// Creates a provider error without an HTTP status.
    pub fn new(
        provider: impl Into<String>,
        kind: ProviderErrorKind,
        message: impl Into<String>,
    ) -> Self {
        Self {
            provider: provider.into(),
            kind,
            message: message.into(),
            status: None,
        }
    }

    /// Creates a provider error from a non-success HTTP response.
    pub fn from_status(provider: impl Into<String>, status: u16, body: impl Into<String>) -> Self {
        let body = body.into();
        let kind = if body.contains("insufficient_quota") {
            ProviderErrorKind::QuotaExhausted
        } else {
            ProviderErrorKind::from_status(status)
        };
        Self {
            provider: provider.into(),
            kind,
            message: body,
            status: Some(status),
        }
    }

    /// Shorthand for a cancelled call.
    pub fn cancelled(provider: impl Into<String>) -> Self {
        Self::new(provider, ProviderErrorKind::Cancelled, "call cancelled")
    }

    /// Shorthand for a call that ran past its timeout.
    pub fn timeout(provider: impl Into<String>, after_ms: u64) -> Self {
        Self::new(
            provider,
            ProviderErrorKind::Timeout,
            format!("no response after {after_ms}ms"),
        )
    }

    /// See [`ProviderErrorKind::is_retryable`].
    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }
}

/// Top-level error type for Thinkgate.
///
/// Each variant corresponds to a subsystem or a terminal dispatch condition.
#[derive(Debug, thiserror::Error)]
pub enum ThinkgateError {
    /// Authentication failed. Deliberately carries no reason.
    #[error("authentication failed")]
    Auth,

    /// A single provider call failed and was not recovered.
    #[error(transparent)]
    Provider(#[from] ProviderError),

    /// Every provider's circuit is open; nothing was contacted.
    #[error("no providers available")]
    NoProvidersAvailable,

    /// Providers were contacted but none produced a completion.
    #[error("all providers failed after {attempts} attempt(s), last tried '{last_provider}': {last_error}")]
    ProvidersExhausted {
        /// The last provider that was contacted.
        last_provider: String,
        /// Total attempts made across all providers.
        attempts: u32,
        /// The error that ended the dispatch.
        #[source]
        last_error: ProviderError,
    },

    /// The request was cancelled or its deadline elapsed.
    #[error("request cancelled")]
    Cancelled,

    /// An error inside the refinement loop.
    #[error("Thinking error: {0}")]
    Thinking(String),

    /// An error in configuration parsing or validation.
    #[error("Config error: {0}")]
    Config(String),

    /// A key store or other security-related error.
    #[error("Security error: {0}")]
    Security(String),

    /// An error from the HTTP gateway layer.
    #[error("Gateway error: {0}")]
    Gateway(String),

    /// A JSON serialization or deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A standard I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ThinkgateError {
    /// True for the "all circuits open" condition the refinement loop treats
    /// as an early stop rather than a failure.
    pub fn is_no_providers(&self) -> bool {
        matches!(self, Self::NoProvidersAvailable)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(ProviderErrorKind::Timeout.is_retryable());
        assert!(ProviderErrorKind::Connection.is_retryable());
        assert!(ProviderErrorKind::RateLimited.is_retryable());
        assert!(ProviderErrorKind::ServerError.is_retryable());

        assert!(!ProviderErrorKind::InvalidRequest.is_retryable());
        assert!(!ProviderErrorKind::Unauthorized.is_retryable());
        assert!(!ProviderErrorKind::QuotaExhausted.is_retryable());
        assert!(!ProviderErrorKind::Cancelled.is_retryable());
    }

    #[test]
    fn status_mapping() {
        assert_eq!(ProviderErrorKind::from_status(429), ProviderErrorKind::RateLimited);
        assert_eq!(ProviderErrorKind::from_status(503), ProviderErrorKind::ServerError);
        assert_eq!(ProviderErrorKind::from_status(529), ProviderErrorKind::ServerError);
        assert_eq!(ProviderErrorKind::from_status(504), ProviderErrorKind::Timeout);
        assert_eq!(ProviderErrorKind::from_status(401), ProviderErrorKind::Unauthorized);
        assert_eq!(ProviderErrorKind::from_status(400), ProviderErrorKind::InvalidRequest);
        assert_eq!(ProviderErrorKind::from_status(402), ProviderErrorKind::QuotaExhausted);
    }

    #[test]
    fn quota_detected_from_body() {
        let err = ProviderError::from_status(
            "openai",
            429,
            r#"{"error":{"code":"insufficient_quota"}}"#,
        );
        assert_eq!(err.kind, ProviderErrorKind::QuotaExhausted);
        assert!(!err.is_retryable());
        assert_eq!(err.status, Some(429));
    }

    #[test]
    fn provider_fault() {
        assert!(ProviderErrorKind::ServerError.is_provider_fault());
        assert!(ProviderErrorKind::Unauthorized.is_provider_fault());
        assert!(!ProviderErrorKind::InvalidRequest.is_provider_fault());
        assert!(!ProviderErrorKind::Cancelled.is_provider_fault());
    }

    #[test]
    fn exhausted_error_names_provider_and_attempts() {
        let err = ThinkgateError::ProvidersExhausted {
            last_provider: "claude".into(),
            attempts: 4,
            last_error: ProviderError::new("claude", ProviderErrorKind::ServerError, "overloaded"),
        };
        let msg = err.to_string();
        assert!(msg.contains("4 attempt(s)"));
        assert!(msg.contains("'claude'"));
        assert!(msg.contains("overloaded"));
    }

    #[test]
    fn auth_error_is_generic() {
        assert_eq!(ThinkgateError::Auth.to_string(), "authentication failed");
    }
}
