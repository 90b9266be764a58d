use crate::thinking::ThinkingResult;
use serde::{Deserialize, Serialize};

/// Progress events emitted while the engine thinks.
///
/// These let consumers (e.g. the SSE chat endpoint) show rounds as they
/// complete instead of waiting for the final result.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ThinkingEvent {
    /// A new round is about to generate.
    RoundStarted {
        round: u32,
    },

    /// A round was generated and scored.
    RoundCompleted {
        round: u32,
        quality: f64,
        best_quality: f64,
        provider: String,
        elapsed_ms: u64,
    },

    /// Thinking stopped; carries the full result.
    Finished {
        result: ThinkingResult,
    },

    /// Thinking failed before producing any round.
    Error {
        message: String,
    },
}

impl ThinkingEvent {
    /// The event name, as used for the SSE `event:` field.
    pub fn name(&self) -> &'static str {
        match self {
            Self::RoundStarted { .. } => "round_started",
            Self::RoundCompleted { .. } => "round_completed",
            Self::Finished { .. } => "finished",
            Self::Error { .. } => "error",
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn tagged_representation() {
        let event = ThinkingEvent::RoundStarted { round: 2 };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], event.name());
        assert_eq!(json["round"], 2);
    }
}
