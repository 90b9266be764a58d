use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thinkgate_core::Message;

/// A request to think about a prompt.
///
/// Unset fields fall back to the engine's [`ThinkingConfig`](crate::ThinkingConfig).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ThinkingRequest {
    /// The question to answer.
    pub prompt: String,
    /// Earlier conversation, oldest first.
    #[serde(default)]
    pub context: Vec<Message>,
    /// Wall-clock budget. Serialized as milliseconds.
    #[serde(default, with = "opt_millis")]
    pub max_thinking_time: Option<Duration>,
    /// Stop as soon as a round scores this high.
    #[serde(default)]
    pub target_quality: Option<f64>,
    /// Caller's round budget; never exceeds the safety cap.
    #[serde(default)]
    pub max_rounds: Option<u32>,
    /// Sampling temperature for generate calls.
    #[serde(default)]
    pub temperature: Option<f32>,
}

impl ThinkingRequest {
    /// A request with engine defaults for everything but the prompt.
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Default::default()
        }
    }

    /// Replaces the conversation context.
    pub fn with_context(mut self, context: Vec<Message>) -> Self {
        self.context = context;
        self
    }

    /// Sets the quality to stop at.
    pub fn with_target_quality(mut self, target: f64) -> Self {
        self.target_quality = Some(target);
        self
    }

    /// Sets the wall-clock budget.
    pub fn with_max_thinking_time(mut self, limit: Duration) -> Self {
        self.max_thinking_time = Some(limit);
        self
    }

    /// Sets the round budget. Zero is treated as one.
    pub fn with_max_rounds(mut self, rounds: u32) -> Self {
        self.max_rounds = Some(rounds);
        self
    }

    /// Sets the sampling temperature.
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }
}

mod opt_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => s.serialize_some(&(d.as_millis() as u64)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(d)?.map(Duration::from_millis))
    }
}

/// One completed generate + critique iteration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThinkingRound {
    /// 1-based.
    pub index: u32,
    /// Which parallel branch produced this round; 0 without parallel thinking.
    pub branch: u32,
    /// The generated answer.
    pub response: String,
    /// Raw critique text, score line included.
    pub critique: String,
    /// In `[0, 1]`.
    pub quality: f64,
    /// Provider that generated `response`.
    pub provider: String,
    /// Generate plus critique time.
    pub elapsed_ms: u64,
}

/// Why a thinking run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// A round reached the target quality.
    QualityTargetMet,
    /// The wall-clock budget ran out.
    TimeBudgetExhausted,
    /// The caller's requested round count was reached.
    RoundLimitReached,
    /// The configured safety cap was reached before the target.
    SafetyCapReached,
    /// Every circuit was open, or every provider failed on the first round.
    NoProvidersAvailable,
    /// A round failed after earlier rounds succeeded.
    ProviderFailure,
}

impl StopReason {
    /// Human-readable form, used in logs and error messages.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::QualityTargetMet => "quality target met",
            Self::TimeBudgetExhausted => "time budget exhausted",
            Self::RoundLimitReached => "round limit reached",
            Self::SafetyCapReached => "safety cap reached",
            Self::NoProvidersAvailable => "no providers available",
            Self::ProviderFailure => "provider failure",
        }
    }
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of a thinking run.
///
/// `response` and `final_quality` come from the best round, not the last
/// one; `improvement` is the best round's quality minus the first round's.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThinkingResult {
    /// Answer from the best round; empty if none completed.
    pub response: String,
    /// Every completed round, in completion order.
    pub rounds: Vec<ThinkingRound>,
    /// Index of the best round, if any completed.
    pub best_round: Option<u32>,
    /// Quality of the best round, or 0 if none completed.
    pub final_quality: f64,
    /// Best round's quality minus the first round's.
    pub improvement: f64,
    /// Why the run ended.
    pub stop_reason: StopReason,
    /// Wall-clock time for the whole run.
    pub elapsed_ms: u64,
}

impl ThinkingResult {
    pub(crate) fn from_rounds(rounds: Vec<ThinkingRound>, stop_reason: StopReason, elapsed: Duration) -> Self {
        let best = best_round(&rounds);
        let first_quality = rounds.first().map(|r| r.quality).unwrap_or(0.0);
        let (response, best_round, final_quality) = match best {
            Some(r) => (r.response.clone(), Some(r.index), r.quality),
            None => (String::new(), None, 0.0),
        };
        Self {
            response,
            best_round,
            final_quality,
            improvement: if best.is_some() { final_quality - first_quality } else { 0.0 },
            stop_reason,
            elapsed_ms: elapsed.as_millis() as u64,
            rounds,
        }
    }

    /// Whether the target quality was reached.
    pub fn is_satisfied(&self) -> bool {
        self.stop_reason == StopReason::QualityTargetMet
    }
}

/// Highest quality wins; on ties the earliest round is kept.
pub(crate) fn best_round(rounds: &[ThinkingRound]) -> Option<&ThinkingRound> {
    rounds.iter().fold(None, |best: Option<&ThinkingRound>, r| match best {
        Some(b) if b.quality >= r.quality => Some(b),
        _ => Some(r),
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn round(index: u32, quality: f64) -> ThinkingRound {
        ThinkingRound {
            index,
            branch: 0,
            response: format!("answer {index}"),
            critique: String::new(),
            quality,
            provider: "mock".into(),
            elapsed_ms: 1,
        }
    }

    #[test]
    fn best_round_not_last_round() {
        let result = ThinkingResult::from_rounds(
            vec![round(1, 0.8), round(2, 0.6)],
            StopReason::SafetyCapReached,
            Duration::from_millis(5),
        );
        assert_eq!(result.final_quality, 0.8);
        assert_eq!(result.improvement, 0.0);
        assert_eq!(result.response, "answer 1");
        assert_eq!(result.best_round, Some(1));
    }

    #[test]
    fn ties_keep_the_earliest_round() {
        let rounds = vec![round(1, 0.5), round(2, 0.7), round(3, 0.7)];
        assert_eq!(best_round(&rounds).unwrap().index, 2);
    }

    #[test]
    fn empty_result() {
        let result = ThinkingResult::from_rounds(
            Vec::new(),
            StopReason::NoProvidersAvailable,
            Duration::ZERO,
        );
        assert_eq!(result.best_round, None);
        assert_eq!(result.final_quality, 0.0);
        assert!(result.response.is_empty());
    }

    #[test]
    fn request_deserializes_with_millis() {
        let req: ThinkingRequest = serde_json::from_str(
            r#"{"prompt":"hi","max_thinking_time":1500,"max_rounds":3}"#,
        )
        .unwrap();
        assert_eq!(req.max_thinking_time, Some(Duration::from_millis(1500)));
        assert_eq!(req.max_rounds, Some(3));
        assert!(req.context.is_empty());
    }

    #[test]
    fn stop_reason_wire_names() {
        assert_eq!(
            serde_json::to_string(&StopReason::NoProvidersAvailable).unwrap(),
            "\"no_providers_available\""
        );
        assert_eq!(StopReason::NoProvidersAvailable.to_string(), "no providers available");
    }
}
