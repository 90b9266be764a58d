#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::error::Error;
use thinkgate_core::*;

// ---------------------------------------------------------------------------
// 1. Message serialization roundtrip
// ---------------------------------------------------------------------------

#[test]
fn message_serialization_roundtrip() {
    let msg = Message::system("You are careful.");
    let json = serde_json::to_string(&msg).unwrap();
    assert_eq!(json, r#"{"role":"system","content":"You are careful."}"#);

    let back: Message = serde_json::from_str(&json).unwrap();
    assert_eq!(back, msg);
}

// ---------------------------------------------------------------------------
// 2. ProviderError flows into ThinkgateError and keeps its source
// ---------------------------------------------------------------------------

#[test]
fn provider_error_converts_into_thinkgate_error() {
    fn call() -> ThinkgateResult<()> {
        Err::<(), _>(ProviderError::from_status("groq", 503, "unavailable"))?;
        Ok(())
    }

    let err = call().unwrap_err();
    match &err {
        ThinkgateError::Provider(p) => {
            assert_eq!(p.provider, "groq");
            assert_eq!(p.kind, ProviderErrorKind::ServerError);
            assert!(p.is_retryable());
        }
        other => panic!("expected Provider, got {other:?}"),
    }
    assert!(err.to_string().contains("groq"));
}

#[test]
fn exhausted_error_exposes_last_provider_error_as_source() {
    let err = ThinkgateError::ProvidersExhausted {
        last_provider: "openai".into(),
        attempts: 3,
        last_error: ProviderError::timeout("openai", 1500),
    };
    let source = err.source().unwrap();
    assert!(source.to_string().contains("1500ms"));
    assert!(!err.is_no_providers());
    assert!(ThinkgateError::NoProvidersAvailable.is_no_providers());
}

// ---------------------------------------------------------------------------
// 3. ProviderErrorKind JSON names
// ---------------------------------------------------------------------------

#[test]
fn provider_error_kind_json_matches_display() {
    for kind in [
        ProviderErrorKind::Timeout,
        ProviderErrorKind::Connection,
        ProviderErrorKind::RateLimited,
        ProviderErrorKind::ServerError,
        ProviderErrorKind::InvalidRequest,
        ProviderErrorKind::Unauthorized,
        ProviderErrorKind::QuotaExhausted,
        ProviderErrorKind::Cancelled,
    ] {
        let json = serde_json::to_string(&kind).unwrap();
        assert_eq!(json, format!("\"{kind}\""));
    }
}
