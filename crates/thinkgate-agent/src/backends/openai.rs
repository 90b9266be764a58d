use super::{
    missing_credential, status_error, transport_error, with_cancel, Completion,
    CompletionRequest, ProviderClient, TokenUsage,
};
use crate::config::{LlmProvider, ProviderDescriptor};
use async_trait::async_trait;
use thinkgate_core::{Message, ProviderError, ProviderErrorKind, Role};
use tokio_util::sync::CancellationToken;

/// OpenAI-compatible API backend.
///
/// Works with OpenAI, OpenRouter, Groq, Ollama, and any other provider
/// that implements the OpenAI chat completions API.
pub struct OpenAiBackend {
    descriptor: ProviderDescriptor,
    http: reqwest::Client,
}

impl OpenAiBackend {
    /// Creates a client for an OpenAI-compatible endpoint.
    pub fn new(descriptor: ProviderDescriptor) -> Self {
        Self {
            descriptor,
            http: reqwest::Client::new(),
        }
    }

    fn build_messages(system: Option<&str>, messages: &[Message]) -> Vec<serde_json::Value> {
        let mut api_messages: Vec<serde_json::Value> = Vec::with_capacity(messages.len() + 1);

        if let Some(sys) = system {
            api_messages.push(serde_json::json!({
                "role": "system",
                "content": sys
            }));
        }

        for m in messages {
            api_messages.push(serde_json::json!({
                "role": match m.role {
                    Role::User => "user",
                    Role::Assistant => "assistant",
                    Role::System => "system",
                },
                "content": m.content
            }));
        }

        api_messages
    }

    fn add_provider_headers(
        &self,
        request: reqwest::RequestBuilder,
        api_key: &str,
    ) -> reqwest::RequestBuilder {
        let request = request
            .header("Authorization", format!("Bearer {api_key}"))
            .header("Content-Type", "application/json");

        // OpenRouter asks for attribution headers
        if matches!(self.descriptor.kind, LlmProvider::OpenRouter) {
            request
                .header("HTTP-Referer", "https://github.com/fboiero/Thinkgate")
                .header("X-Title", "Thinkgate")
        } else {
            request
        }
    }

    async fn send(
        &self,
        request: &CompletionRequest,
        api_key: &str,
    ) -> Result<Completion, ProviderError> {
        let id = &self.descriptor.id;
        let url = format!("{}/v1/chat/completions", self.descriptor.base_url);

        let mut body = serde_json::json!({
            "model": self.descriptor.model_id,
            "max_tokens": request.max_tokens.unwrap_or(self.descriptor.max_tokens),
            "messages": Self::build_messages(request.system.as_deref(), &request.messages),
        });
        if let Some(t) = request.temperature {
            body["temperature"] = serde_json::json!(t);
        }

        let resp = self
            .add_provider_headers(self.http.post(&url), api_key)
            .timeout(self.descriptor.timeout)
            .json(&body)
            .send()
            .await
            .map_err(|e| transport_error(id, &e))?;

        if !resp.status().is_success() {
            return Err(status_error(id, resp).await);
        }

        let resp_body: serde_json::Value = resp.json().await.map_err(|e| {
            ProviderError::new(id, ProviderErrorKind::ServerError, format!("unreadable body: {e}"))
        })?;

        parse_openai_response(id, &resp_body)
    }
}

#[async_trait]
impl ProviderClient for OpenAiBackend {
    fn descriptor(&self) -> &ProviderDescriptor {
        &self.descriptor
    }

    async fn complete(
        &self,
        request: &CompletionRequest,
        cancel: &CancellationToken,
    ) -> Result<Completion, ProviderError> {
        let api_key = self
            .descriptor
            .credential
            .resolve()
            .ok_or_else(|| missing_credential(&self.descriptor))?;
        with_cancel(&self.descriptor.id, cancel, self.send(request, &api_key)).await
    }
}

/// Pulls the first choice out of a chat-completions body.
///
/// A body without message content is classified as a server error.
pub fn parse_openai_response(
    provider: &str,
    body: &serde_json::Value,
) -> Result<Completion, ProviderError> {
    let choice = &body["choices"][0];
    let Some(content) = choice["message"]["content"].as_str() else {
        return Err(ProviderError::new(
            provider,
            ProviderErrorKind::ServerError,
            format!("response has no message content: {body}"),
        ));
    };

    let usage = body["usage"].as_object().map(|u| TokenUsage {
        input_tokens: u.get("prompt_tokens").and_then(|v| v.as_u64()).unwrap_or(0),
        output_tokens: u.get("completion_tokens").and_then(|v| v.as_u64()).unwrap_or(0),
    });

    Ok(Completion {
        text: content.to_string(),
        model: body["model"].as_str().unwrap_or_default().to_string(),
        usage,
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::config::Credential;
    use std::time::Duration;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn descriptor(base_url: &str) -> ProviderDescriptor {
        ProviderDescriptor {
            id: "openai:gpt-test".into(),
            kind: LlmProvider::OpenAi,
            model_id: "gpt-test".into(),
            base_url: base_url.into(),
            priority: 0,
            timeout: Duration::from_secs(5),
            max_tokens: 256,
            credential: Credential::Inline("sk-test".into()),
        }
    }

    fn request() -> CompletionRequest {
        CompletionRequest::new(vec![Message::user("What is 2+2?")])
            .with_system("be brief")
            .with_temperature(0.2)
    }

    #[tokio::test]
    async fn successful_completion() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(header("Authorization", "Bearer sk-test"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "model": "gpt-test",
                "choices": [{"message": {"role": "assistant", "content": "4"}, "finish_reason": "stop"}],
                "usage": {"prompt_tokens": 12, "completion_tokens": 1}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let backend = OpenAiBackend::new(descriptor(&server.uri()));
        let completion = backend
            .complete(&request(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(completion.text, "4");
        assert_eq!(completion.usage.unwrap().input_tokens, 12);

        let received = &server.received_requests().await.unwrap()[0];
        let body: serde_json::Value = serde_json::from_slice(&received.body).unwrap();
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][1]["content"], "What is 2+2?");
        assert_eq!(body["max_tokens"], 256);
    }

    #[tokio::test]
    async fn status_codes_are_classified() {
        let cases = [
            (429, "slow down", ProviderErrorKind::RateLimited),
            (503, "unavailable", ProviderErrorKind::ServerError),
            (400, "bad", ProviderErrorKind::InvalidRequest),
            (401, "nope", ProviderErrorKind::Unauthorized),
            (429, r#"{"error":{"code":"insufficient_quota"}}"#, ProviderErrorKind::QuotaExhausted),
        ];
        for (status, body, expected) in cases {
            let server = MockServer::start().await;
            Mock::given(method("POST"))
                .respond_with(ResponseTemplate::new(status).set_body_string(body))
                .mount(&server)
                .await;

            let backend = OpenAiBackend::new(descriptor(&server.uri()));
            let err = backend
                .complete(&request(), &CancellationToken::new())
                .await
                .unwrap_err();
            assert_eq!(err.kind, expected, "status {status}");
            assert_eq!(err.status, Some(status));
            assert_eq!(err.provider, "openai:gpt-test");
        }
    }

    #[tokio::test]
    async fn cancelled_call_returns_promptly() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(30)))
            .mount(&server)
            .await;

        let backend = OpenAiBackend::new(descriptor(&server.uri()));
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = backend.complete(&request(), &cancel).await.unwrap_err();
        assert_eq!(err.kind, ProviderErrorKind::Cancelled);
    }

    #[tokio::test]
    async fn missing_key_is_unauthorized() {
        let mut desc = descriptor("http://127.0.0.1:9");
        desc.credential = Credential::None;
        let err = OpenAiBackend::new(desc)
            .complete(&request(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind, ProviderErrorKind::Unauthorized);
    }

    #[test]
    fn response_without_content_is_a_server_error() {
        let err = parse_openai_response("p", &serde_json::json!({"choices": []})).unwrap_err();
        assert_eq!(err.kind, ProviderErrorKind::ServerError);
    }
}
