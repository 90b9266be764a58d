use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use thinkgate_core::ThinkgateError;
use thinkgate_security::{AuthFailure, KeyStoreError};

/// An error returned to an HTTP client as `{"error": "..."}`.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// The body was unusable.
    #[error("{0}")]
    BadRequest(String),

    /// Missing, unknown, revoked or expired credential. Deliberately vague.
    #[error("authentication failed")]
    Unauthorized,

    /// The key is valid but lacks a scope.
    #[error("missing scope '{0}'")]
    Forbidden(&'static str),

    /// The named resource does not exist.
    #[error("{0} not found")]
    NotFound(String),

    /// The key's token bucket is empty.
    #[error("rate limit exceeded")]
    RateLimited,

    /// Every provider failed (or refused) while serving the request.
    #[error("{0}")]
    Upstream(String),

    /// No provider circuit accepts calls.
    #[error("no providers available")]
    Unavailable,

    /// The time budget ran out before any round completed.
    #[error("thinking time budget exhausted before any round completed")]
    DeadlineExceeded,

    /// Anything the client cannot fix. Logged, then reported as 500.
    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    /// The HTTP status for this error.
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden(_) => StatusCode::FORBIDDEN,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            ApiError::Upstream(_) => StatusCode::BAD_GATEWAY,
            ApiError::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::DeadlineExceeded => StatusCode::GATEWAY_TIMEOUT,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(serde_json::json!({ "error": self.to_string() }));
        (self.status(), body).into_response()
    }
}

impl From<AuthFailure> for ApiError {
    fn from(_: AuthFailure) -> Self {
        ApiError::Unauthorized
    }
}

impl From<KeyStoreError> for ApiError {
    fn from(e: KeyStoreError) -> Self {
        match e {
            KeyStoreError::UnknownKey(id) => ApiError::NotFound(format!("key '{id}'")),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl From<ThinkgateError> for ApiError {
    fn from(e: ThinkgateError) -> Self {
        match e {
            ThinkgateError::NoProvidersAvailable => ApiError::Unavailable,
            ThinkgateError::Auth => ApiError::Unauthorized,
            ThinkgateError::Thinking(msg) | ThinkgateError::Config(msg) => {
                ApiError::BadRequest(msg)
            }
            ThinkgateError::Provider(_) | ThinkgateError::ProvidersExhausted { .. } => {
                ApiError::Upstream(e.to_string())
            }
            ThinkgateError::Cancelled => ApiError::DeadlineExceeded,
            other => ApiError::Internal(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_errors_map_to_statuses() {
        let cases = [
            (ThinkgateError::NoProvidersAvailable, StatusCode::SERVICE_UNAVAILABLE),
            (
                ThinkgateError::Thinking("prompt is empty".into()),
                StatusCode::BAD_REQUEST,
            ),
            (ThinkgateError::Cancelled, StatusCode::GATEWAY_TIMEOUT),
            (ThinkgateError::Gateway("boom".into()), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (err, status) in cases {
            assert_eq!(ApiError::from(err).status(), status);
        }
    }

    #[test]
    fn unknown_key_is_not_found() {
        let err = ApiError::from(KeyStoreError::UnknownKey("key_1".into()));
        assert_eq!(err.status(), StatusCode::NOT_FOUND);
        assert_eq!(err.to_string(), "key 'key_1' not found");
    }
}
