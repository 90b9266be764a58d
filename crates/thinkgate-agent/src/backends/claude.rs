use super::{
    missing_credential, status_error, transport_error, with_cancel, Completion,
    CompletionRequest, ProviderClient, TokenUsage,
};
use crate::config::ProviderDescriptor;
use async_trait::async_trait;
use serde::Serialize;
use thinkgate_core::{ProviderError, ProviderErrorKind, Role};
use tokio_util::sync::CancellationToken;

const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Claude (Anthropic) API backend.
pub struct ClaudeBackend {
    descriptor: ProviderDescriptor,
    http: reqwest::Client,
}

#[derive(Serialize)]
struct ClaudeMessage<'a> {
    role: &'static str,
    content: &'a str,
}

impl ClaudeBackend {
    /// Creates a client for the Anthropic messages API.
    pub fn new(descriptor: ProviderDescriptor) -> Self {
        Self {
            descriptor,
            http: reqwest::Client::new(),
        }
    }

    async fn send(
        &self,
        request: &CompletionRequest,
        api_key: &str,
    ) -> Result<Completion, ProviderError> {
        let id = &self.descriptor.id;
        let url = format!("{}/v1/messages", self.descriptor.base_url);

        // The messages API takes the system prompt out of band.
        let mut system_parts: Vec<&str> = request.system.as_deref().into_iter().collect();
        let api_messages: Vec<ClaudeMessage<'_>> = request
            .messages
            .iter()
            .filter_map(|m| match m.role {
                Role::System => {
                    system_parts.push(&m.content);
                    None
                }
                Role::User => Some(ClaudeMessage {
                    role: "user",
                    content: &m.content,
                }),
                Role::Assistant => Some(ClaudeMessage {
                    role: "assistant",
                    content: &m.content,
                }),
            })
            .collect();

        let mut body = serde_json::json!({
            "model": self.descriptor.model_id,
            "max_tokens": request.max_tokens.unwrap_or(self.descriptor.max_tokens),
            "messages": api_messages,
        });
        if !system_parts.is_empty() {
            body["system"] = serde_json::json!(system_parts.join("\n\n"));
        }
        if let Some(t) = request.temperature {
            body["temperature"] = serde_json::json!(t);
        }

        let resp = self
            .http
            .post(&url)
            .header("x-api-key", api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("content-type", "application/json")
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

        parse_claude_response(id, &resp_body)
    }
}

#[async_trait]
impl ProviderClient for ClaudeBackend {
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

/// Concatenates the text blocks of a messages API response.
pub fn parse_claude_response(
    provider: &str,
    body: &serde_json::Value,
) -> Result<Completion, ProviderError> {
    let Some(blocks) = body["content"].as_array() else {
        return Err(ProviderError::new(
            provider,
            ProviderErrorKind::ServerError,
            format!("response has no content blocks: {body}"),
        ));
    };

    let text: String = blocks
        .iter()
        .filter(|b| b["type"] == "text")
        .filter_map(|b| b["text"].as_str())
        .collect();

    let usage = body["usage"].as_object().map(|u| TokenUsage {
        input_tokens: u.get("input_tokens").and_then(|v| v.as_u64()).unwrap_or(0),
        output_tokens: u.get("output_tokens").and_then(|v| v.as_u64()).unwrap_or(0),
    });

    Ok(Completion {
        text,
        model: body["model"].as_str().unwrap_or_default().to_string(),
        usage,
    })
}
