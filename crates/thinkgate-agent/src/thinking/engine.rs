use super::prompts::{critique_request, generation_request};
use super::score::parse_assessment;
use super::types::{best_round, StopReason, ThinkingRequest, ThinkingResult, ThinkingRound};
use crate::config::ThinkingConfig;
use crate::dispatcher::Dispatcher;
use crate::flags::FeatureFlags;
use crate::stream::ThinkingEvent;
use futures_util::future::join_all;
use std::sync::Arc;
use thinkgate_core::{ThinkgateError, ThinkgateResult};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Temperature step between parallel branches, so they explore differently.
const BRANCH_TEMPERATURE_STEP: f32 = 0.2;
const MAX_TEMPERATURE: f32 = 1.5;

/// Iteratively refines an answer.
///
/// Each round generates a candidate (seeded with the previous round's answer
/// and critique), asks a reviewer to critique and score it, and then checks
/// the stop conditions in order: quality target, time budget, round cap.
/// The best round, not the last one, is the result.
pub struct RecursiveThinkingEngine {
    dispatcher: Arc<Dispatcher>,
    config: ThinkingConfig,
}

impl RecursiveThinkingEngine {
    /// An engine that dispatches every call through `dispatcher`.
    pub fn new(dispatcher: Arc<Dispatcher>, config: ThinkingConfig) -> Self {
        Self { dispatcher, config }
    }

    /// The dispatcher behind this engine.
    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// Server-side thinking limits.
    pub fn config(&self) -> &ThinkingConfig {
        &self.config
    }

    /// Thinks until a stop condition holds.
    ///
    /// When every provider circuit is open the run stops early and returns
    /// the best round so far (possibly none). Other dispatch failures are
    /// errors only if no round completed yet.
    pub async fn think(&self, request: ThinkingRequest) -> ThinkgateResult<ThinkingResult> {
        self.run(request, None).await
    }

    /// Like [`think`](Self::think), also reporting progress on `events`.
    /// A closed receiver does not stop thinking.
    ///
    /// `Finished` is sent only when at least one round completed; an empty
    /// result, like an error, is left to the caller to report.
    pub async fn think_streaming(
        &self,
        request: ThinkingRequest,
        events: mpsc::Sender<ThinkingEvent>,
    ) -> ThinkgateResult<ThinkingResult> {
        self.run(request, Some(&events)).await
    }

    async fn run(
        &self,
        request: ThinkingRequest,
        events: Option<&mpsc::Sender<ThinkingEvent>>,
    ) -> ThinkgateResult<ThinkingResult> {
        if request.prompt.trim().is_empty() {
            return Err(ThinkgateError::Thinking("prompt is empty".into()));
        }

        let target = request.target_quality.unwrap_or(self.config.target_quality);
        let budget = request
            .max_thinking_time
            .unwrap_or_else(|| self.config.max_thinking_time());
        let safety_cap = self.config.safety_round_cap.max(1);
        let (round_cap, cap_reason) = match request.max_rounds {
            // zero still means one round
            Some(n) if n <= safety_cap => (n.max(1), StopReason::RoundLimitReached),
            _ => (safety_cap, StopReason::SafetyCapReached),
        };
        let flags = self.dispatcher.flags();

        let started = Instant::now();
        let deadline = started + budget;
        // Cancels whatever is still in flight when this run returns.
        let cancel = CancellationToken::new();
        let _cancel_on_exit = cancel.clone().drop_guard();

        info!(
            round_cap,
            target_quality = target,
            budget_ms = budget.as_millis() as u64,
            parallel = flags.parallel_thinking,
            "Thinking started"
        );

        let mut rounds: Vec<ThinkingRound> = Vec::new();
        let stop = loop {
            let index = rounds.len() as u32 + 1;
            emit(events, ThinkingEvent::RoundStarted { round: index }).await;

            let outcome = tokio::time::timeout_at(
                deadline,
                self.run_round(index, &request, rounds.last(), flags, &cancel),
            )
            .await;

            let round = match outcome {
                Err(_) => {
                    cancel.cancel();
                    debug!(round = index, "Time budget ran out mid-round");
                    break StopReason::TimeBudgetExhausted;
                }
                Ok(Ok(round)) => round,
                Ok(Err(e)) if e.is_no_providers() => {
                    warn!(round = index, "No providers available, stopping early");
                    break StopReason::NoProvidersAvailable;
                }
                Ok(Err(ThinkgateError::Cancelled)) => break StopReason::TimeBudgetExhausted,
                Ok(Err(e)) => {
                    if rounds.is_empty() {
                        warn!(round = index, error = %e, "First round failed");
                        return Err(e);
                    }
                    warn!(round = index, error = %e, "Round failed, keeping best so far");
                    break StopReason::ProviderFailure;
                }
            };

            let quality = round.quality;
            emit(
                events,
                ThinkingEvent::RoundCompleted {
                    round: index,
                    quality,
                    best_quality: best_round(&rounds)
                        .map_or(quality, |b| b.quality.max(quality)),
                    provider: round.provider.clone(),
                    elapsed_ms: round.elapsed_ms,
                },
            )
            .await;
            debug!(round = index, quality, provider = %round.provider, "Round scored");
            rounds.push(round);

            if quality >= target {
                break StopReason::QualityTargetMet;
            }
            if Instant::now() >= deadline {
                break StopReason::TimeBudgetExhausted;
            }
            if index >= round_cap {
                break cap_reason;
            }
        };

        let result = ThinkingResult::from_rounds(rounds, stop, started.elapsed());
        info!(
            rounds = result.rounds.len(),
            final_quality = result.final_quality,
            improvement = result.improvement,
            stop_reason = %result.stop_reason,
            elapsed_ms = result.elapsed_ms,
            "Thinking finished"
        );
        if !result.rounds.is_empty() {
            emit(
                events,
                ThinkingEvent::Finished {
                    result: result.clone(),
                },
            )
            .await;
        }
        Ok(result)
    }

    /// One round; with parallel thinking, the best of several branches.
    async fn run_round(
        &self,
        index: u32,
        request: &ThinkingRequest,
        previous: Option<&ThinkingRound>,
        flags: FeatureFlags,
        cancel: &CancellationToken,
    ) -> ThinkgateResult<ThinkingRound> {
        let branches = if flags.parallel_thinking {
            self.config.branches.max(1)
        } else {
            1
        };
        if branches == 1 {
            return self.run_branch(index, 0, request, previous, flags, cancel).await;
        }

        let results = join_all(
            (0..branches).map(|b| self.run_branch(index, b, request, previous, flags, cancel)),
        )
        .await;

        let mut best: Option<ThinkingRound> = None;
        let mut first_error: Option<ThinkgateError> = None;
        for result in results {
            match result {
                Ok(round) => {
                    if best.as_ref().map_or(true, |b| round.quality > b.quality) {
                        best = Some(round);
                    }
                }
                Err(e) => {
                    warn!(round = index, error = %e, "Branch failed");
                    first_error.get_or_insert(e);
                }
            }
        }
        match (best, first_error) {
            (Some(round), _) => Ok(round),
            (None, Some(e)) => Err(e),
            (None, None) => Err(ThinkgateError::Thinking("round produced no branches".into())),
        }
    }

    async fn run_branch(
        &self,
        index: u32,
        branch: u32,
        request: &ThinkingRequest,
        previous: Option<&ThinkingRound>,
        flags: FeatureFlags,
        cancel: &CancellationToken,
    ) -> ThinkgateResult<ThinkingRound> {
        let started = Instant::now();
        let base = request.temperature.unwrap_or(self.config.temperature);
        let temperature = (base + BRANCH_TEMPERATURE_STEP * branch as f32).min(MAX_TEMPERATURE);

        let generation = generation_request(
            request,
            previous,
            &self.config,
            flags.prompt_compression,
            temperature,
        );
        let generated = self.dispatcher.complete(&generation, cancel).await?;

        let review = critique_request(&request.prompt, &generated.text, &self.config);
        let critique = self.dispatcher.complete(&review, cancel).await?;

        let assessment = parse_assessment(&critique.text);
        if !assessment.parsed {
            warn!(
                round = index,
                branch,
                provider = %critique.provider,
                "Critique carried no score, counting it as 0"
            );
        }

        Ok(ThinkingRound {
            index,
            branch,
            response: generated.text,
            critique: assessment.critique,
            quality: assessment.score,
            provider: generated.provider,
            elapsed_ms: started.elapsed().as_millis() as u64,
        })
    }
}

async fn emit(events: Option<&mpsc::Sender<ThinkingEvent>>, event: ThinkingEvent) {
    if let Some(tx) = events {
        // The receiver may be gone (client disconnected); keep thinking.
        let _ = tx.send(event).await;
    }
}
