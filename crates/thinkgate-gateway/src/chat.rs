use crate::error::ApiError;
use crate::middleware::require_scope;
use crate::server::AppState;
use axum::{
    extract::State,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    Extension, Json,
};
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thinkgate_agent::{StopReason, ThinkingEvent, ThinkingRequest, ThinkingResult, ThinkingRound};
use thinkgate_core::Message;
use thinkgate_security::{ApiKeyRecord, Scope};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};
use uuid::Uuid;

const EVENT_BUFFER: usize = 32;

/// Body of `POST /api/v1/chat`.
#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    /// Must not be blank.
    pub prompt: String,
    /// Earlier conversation, oldest first.
    #[serde(default)]
    pub context: Vec<Message>,
    /// Upper bound on refinement rounds (still capped server-side).
    #[serde(default)]
    pub thinking_rounds: Option<u32>,
    /// Within `0..=2`.
    #[serde(default)]
    pub temperature: Option<f32>,
    /// Within `0..=1`.
    #[serde(default)]
    pub target_quality: Option<f64>,
    /// Overrides the server's thinking time budget.
    #[serde(default)]
    pub max_thinking_time_ms: Option<u64>,
    /// Answer with server-sent events instead of one JSON body.
    #[serde(default)]
    pub enable_streaming: bool,
}

impl ChatRequest {
    fn into_thinking(self) -> Result<ThinkingRequest, ApiError> {
        if self.prompt.trim().is_empty() {
            return Err(ApiError::BadRequest("prompt is empty".into()));
        }
        if self.thinking_rounds == Some(0) {
            return Err(ApiError::BadRequest("thinking_rounds must be at least 1".into()));
        }
        if let Some(t) = self.temperature {
            if !(0.0..=2.0).contains(&t) {
                return Err(ApiError::BadRequest("temperature must be within 0..=2".into()));
            }
        }
        if let Some(q) = self.target_quality {
            if !(0.0..=1.0).contains(&q) {
                return Err(ApiError::BadRequest("target_quality must be within 0..=1".into()));
            }
        }

        let mut request = ThinkingRequest::new(self.prompt).with_context(self.context);
        request.max_rounds = self.thinking_rounds;
        request.temperature = self.temperature;
        request.target_quality = self.target_quality;
        request.max_thinking_time = self.max_thinking_time_ms.map(Duration::from_millis);
        Ok(request)
    }
}

/// Non-streaming reply.
#[derive(Debug, Serialize, Deserialize)]
pub struct ChatResponse {
    /// Generated per request. Also appears in the server logs.
    pub request_id: Uuid,
    /// The best round's answer.
    pub response: String,
    /// Number of rounds that completed.
    pub thinking_rounds: usize,
    /// Quality of the best round.
    pub final_quality: f64,
    /// Best quality minus first-round quality.
    pub improvement: f64,
    /// Index of the round `response` came from.
    pub best_round: Option<u32>,
    /// Why the run ended.
    pub stop_reason: StopReason,
    /// Wall-clock time spent thinking.
    pub elapsed_ms: u64,
    /// Every completed round.
    pub rounds: Vec<ThinkingRound>,
}

impl ChatResponse {
    fn new(request_id: Uuid, result: ThinkingResult) -> Self {
        Self {
            request_id,
            response: result.response,
            thinking_rounds: result.rounds.len(),
            final_quality: result.final_quality,
            improvement: result.improvement,
            best_round: result.best_round,
            stop_reason: result.stop_reason,
            elapsed_ms: result.elapsed_ms,
            rounds: result.rounds,
        }
    }
}

/// A result without a single completed round is an error for the client.
fn check_result(result: &ThinkingResult) -> Result<(), ApiError> {
    if !result.rounds.is_empty() {
        return Ok(());
    }
    match result.stop_reason {
        StopReason::NoProvidersAvailable => Err(ApiError::Unavailable),
        StopReason::TimeBudgetExhausted => Err(ApiError::DeadlineExceeded),
        other => Err(ApiError::Upstream(format!("no round completed ({other})"))),
    }
}

/// `POST /api/v1/chat`. Requires the `chat` scope.
pub async fn chat_handler(
    State(state): State<Arc<AppState>>,
    Extension(record): Extension<ApiKeyRecord>,
    Json(body): Json<ChatRequest>,
) -> Result<Response, ApiError> {
    require_scope(&state, &record, Scope::Chat)?;

    let request_id = Uuid::new_v4();
    let streaming = body.enable_streaming;
    let request = body.into_thinking()?;
    info!(
        request_id = %request_id,
        key_id = %record.key_id,
        streaming,
        max_rounds = ?request.max_rounds,
        "Chat request"
    );

    if streaming {
        return Ok(stream_thinking(state, request_id, request).into_response());
    }

    let result = state.engine.think(request).await.map_err(|e| {
        warn!(request_id = %request_id, error = %e, "Thinking failed");
        ApiError::from(e)
    })?;
    check_result(&result)?;
    Ok(Json(ChatResponse::new(request_id, result)).into_response())
}

/// Runs the engine in the background and relays its events as SSE.
///
/// A successful run ends with `finished`. A run that fails, or stops
/// before completing a round, ends with a single `error` instead.
///
/// A client that disconnects drops the receiver, which stops the run and
/// cancels whatever provider calls are still in flight.
fn stream_thinking(
    state: Arc<AppState>,
    request_id: Uuid,
    request: ThinkingRequest,
) -> Sse<impl futures_util::Stream<Item = Result<Event, axum::Error>>> {
    let (tx, rx) = mpsc::channel::<ThinkingEvent>(EVENT_BUFFER);

    tokio::spawn(async move {
        let outcome = tokio::select! {
            outcome = state.engine.think_streaming(request, tx.clone()) => outcome,
            _ = tx.closed() => {
                debug!(request_id = %request_id, "Client went away, thinking stopped");
                return;
            }
        };
        let failure = match outcome {
            Ok(result) => check_result(&result).err(),
            Err(e) => Some(ApiError::from(e)),
        };
        if let Some(e) = failure {
            warn!(request_id = %request_id, error = %e, "Streaming chat failed");
            let _ = tx
                .send(ThinkingEvent::Error {
                    message: e.to_string(),
                })
                .await;
        }
    });

    let events = ReceiverStream::new(rx)
        .map(|event| Event::default().event(event.name()).json_data(&event));
    Sse::new(events).keep_alive(KeepAlive::default())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn body(json: serde_json::Value) -> ChatRequest {
        serde_json::from_value(json).unwrap()
    }

    #[test]
    fn optional_fields_default() {
        let req = body(serde_json::json!({ "prompt": "hi" }));
        assert!(!req.enable_streaming);
        let thinking = req.into_thinking().unwrap();
        assert_eq!(thinking.prompt, "hi");
        assert_eq!(thinking.max_rounds, None);
        assert!(thinking.context.is_empty());
    }

    #[test]
    fn rounds_and_budget_are_carried() {
        let thinking = body(serde_json::json!({
            "prompt": "hi",
            "thinking_rounds": 3,
            "temperature": 0.2,
            "max_thinking_time_ms": 1500,
            "context": [{ "role": "system", "content": "be brief" }],
        }))
        .into_thinking()
        .unwrap();
        assert_eq!(thinking.max_rounds, Some(3));
        assert_eq!(thinking.temperature, Some(0.2));
        assert_eq!(thinking.max_thinking_time, Some(Duration::from_millis(1500)));
        assert_eq!(thinking.context.len(), 1);
    }

    #[test]
    fn invalid_bodies_are_bad_requests() {
        for json in [
            serde_json::json!({ "prompt": "  " }),
            serde_json::json!({ "prompt": "x", "temperature": 3.0 }),
            serde_json::json!({ "prompt": "x", "target_quality": 1.5 }),
            serde_json::json!({ "prompt": "x", "thinking_rounds": 0 }),
        ] {
            let err = body(json).into_thinking().unwrap_err();
            assert_eq!(err.status(), axum::http::StatusCode::BAD_REQUEST);
        }
    }
}
