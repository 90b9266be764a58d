use crate::backends::{build_client, Completion, CompletionRequest, ProviderClient};
use crate::breaker::{CallPermit, CircuitBreaker, CircuitSnapshot, CircuitState};
use crate::config::{ModelConfig, ResilienceConfig};
use crate::flags::FeatureFlags;
use crate::hedge::{HedgeController, Lane};
use crate::ranking::{ProviderStats, StatsTable};
use crate::retry::{RetryError, RetryPolicy};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thinkgate_core::{ProviderError, ProviderErrorKind, ThinkgateError, ThinkgateResult};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// One call to one provider, as seen by the dispatcher.
#[derive(Debug, Clone, Serialize)]
pub struct RequestAttempt {
    /// Provider id.
    pub provider: String,
    /// Position of this attempt within the logical request, in start order.
    pub index: u32,
    /// Lane the call ran on.
    pub lane: Lane,
    /// Wall-clock start.
    pub started_at: DateTime<Utc>,
    /// Time until the outcome, or until the call was dropped.
    pub elapsed_ms: u64,
    /// `None` on success; `Cancelled` for a call abandoned mid-flight, such
    /// as a hedge loser.
    pub error: Option<ProviderErrorKind>,
}

/// A successful dispatch.
#[derive(Debug, Clone, Serialize)]
pub struct CompletionResult {
    /// Completion text.
    pub text: String,
    /// Id of the provider that answered.
    pub provider: String,
    /// Model reported by that provider.
    pub model: String,
    /// Lane that won.
    pub lane: Lane,
    /// Whether a hedge was issued for the winning race.
    pub hedged: bool,
    /// Every call made for this request, in start order.
    pub attempts: Vec<RequestAttempt>,
    /// Total time spent dispatching.
    pub elapsed_ms: u64,
}

/// Immutable, ordered provider list. Replaced wholesale on re-ranking, so a
/// request in flight keeps iterating the order it started with.
pub struct ProviderSnapshot {
    /// Bumped on every re-rank that changes the order.
    pub version: u64,
    /// Providers in dispatch order.
    pub providers: Vec<Arc<dyn ProviderClient>>,
}

/// Row of [`Dispatcher::status`].
#[derive(Debug, Clone, Serialize)]
pub struct ProviderStatus {
    /// Provider id.
    pub id: String,
    /// Configured model.
    pub model: String,
    /// Configured priority; lower goes first.
    pub priority: u32,
    /// Position in the current snapshot.
    pub rank: usize,
    /// Circuit breaker view.
    pub circuit: CircuitSnapshot,
    /// Observed reliability and latency.
    pub stats: ProviderStats,
}

/// Attempts of one logical request. Entries are reserved when a call
/// starts, so concurrent lanes get distinct indices and a call dropped
/// mid-flight still shows up.
#[derive(Default)]
struct AttemptLog {
    attempts: Mutex<Vec<RequestAttempt>>,
}

impl AttemptLog {
    /// Reserves the next index. The entry reads as cancelled until
    /// [`finish`](Self::finish) fills in the outcome.
    fn begin(&self, provider: &str, lane: Lane) -> u32 {
        let mut attempts = self.attempts.lock();
        let index = attempts.len() as u32;
        attempts.push(RequestAttempt {
            provider: provider.to_string(),
            index,
            lane,
            started_at: Utc::now(),
            elapsed_ms: 0,
            error: Some(ProviderErrorKind::Cancelled),
        });
        index
    }

    fn finish(&self, index: u32, elapsed: Duration, error: Option<ProviderErrorKind>) {
        if let Some(attempt) = self.attempts.lock().get_mut(index as usize) {
            attempt.elapsed_ms = duration_ms(elapsed);
            attempt.error = error;
        }
    }

    fn len(&self) -> u32 {
        self.attempts.lock().len() as u32
    }

    fn take(&self) -> Vec<RequestAttempt> {
        std::mem::take(&mut *self.attempts.lock())
    }
}

/// Routes completion requests across providers.
///
/// Per request: the first provider (in rank order) whose circuit allows a
/// call becomes the primary and runs under the retry policy; if it is slow,
/// the next allowed provider is raced against it as a hedge. If the race
/// fails, the dispatcher fails over to the next uncontacted pair. Every
/// call's outcome feeds the shared circuit breaker.
pub struct Dispatcher {
    snapshot: RwLock<Arc<ProviderSnapshot>>,
    breaker: Arc<CircuitBreaker>,
    retry: RetryPolicy,
    hedge: HedgeController,
    stats: StatsTable,
    flags: FeatureFlags,
    rerank_interval: u64,
    completed: AtomicU64,
}

impl Dispatcher {
    /// Providers are ordered by descriptor priority, stable for equal values.
    pub fn new(
        mut providers: Vec<Arc<dyn ProviderClient>>,
        config: ResilienceConfig,
        flags: FeatureFlags,
    ) -> Self {
        providers.sort_by_key(|p| p.descriptor().priority);
        Self {
            snapshot: RwLock::new(Arc::new(ProviderSnapshot {
                version: 0,
                providers,
            })),
            breaker: Arc::new(CircuitBreaker::new(config.breaker)),
            retry: config.retry,
            hedge: HedgeController::new(config.hedge),
            stats: StatsTable::default(),
            flags,
            rerank_interval: config.rerank_interval.max(1),
            completed: AtomicU64::new(0),
        }
    }

    /// Builds HTTP clients for a model and its fallback chain.
    pub fn from_model_config(
        model: &ModelConfig,
        config: ResilienceConfig,
        flags: FeatureFlags,
    ) -> Self {
        let providers = model.descriptors().into_iter().map(build_client).collect();
        Self::new(providers, config, flags)
    }

    /// Shares an existing breaker instead of the one built from config.
    pub fn with_breaker(mut self, breaker: Arc<CircuitBreaker>) -> Self {
        self.breaker = breaker;
        self
    }

    /// The breaker guarding every provider.
    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    /// Feature flags this dispatcher was built with.
    pub fn flags(&self) -> FeatureFlags {
        self.flags
    }

    /// The current provider order.
    pub fn snapshot(&self) -> Arc<ProviderSnapshot> {
        self.snapshot.read().clone()
    }

    /// True when at least one provider's circuit would accept a call.
    pub fn has_available_provider(&self) -> bool {
        self.snapshot()
            .providers
            .iter()
            .any(|p| !self.breaker.is_blocking(p.id()))
    }

    /// One row per provider, in dispatch order.
    pub fn status(&self) -> Vec<ProviderStatus> {
        self.snapshot()
            .providers
            .iter()
            .enumerate()
            .map(|(rank, p)| {
                let d = p.descriptor();
                ProviderStatus {
                    id: d.id.clone(),
                    model: d.model_id.clone(),
                    priority: d.priority,
                    rank,
                    circuit: self.breaker.snapshot(&d.id),
                    stats: self.stats.get(&d.id),
                }
            })
            .collect()
    }

    /// Dispatches one logical request.
    ///
    /// Returns [`ThinkgateError::NoProvidersAvailable`] without contacting
    /// anyone when every circuit refuses, [`ThinkgateError::Cancelled`] when
    /// `cancel` fires, and [`ThinkgateError::ProvidersExhausted`] naming the
    /// last provider tried otherwise.
    pub async fn complete(
        &self,
        request: &CompletionRequest,
        cancel: &CancellationToken,
    ) -> ThinkgateResult<CompletionResult> {
        let started = Instant::now();
        let snapshot = self.snapshot();
        let log = AttemptLog::default();
        let mut contacted: HashSet<String> = HashSet::new();
        let mut last_error: Option<ProviderError> = None;

        loop {
            if cancel.is_cancelled() {
                return Err(ThinkgateError::Cancelled);
            }

            let Some((primary, permit)) = self.next_allowed(&snapshot, &contacted) else {
                return Err(match last_error {
                    None => {
                        warn!("Every provider circuit is open");
                        ThinkgateError::NoProvidersAvailable
                    }
                    Some(last_error) => ThinkgateError::ProvidersExhausted {
                        last_provider: last_error.provider.clone(),
                        attempts: log.len(),
                        last_error,
                    },
                });
            };
            contacted.insert(primary.id().to_string());
            debug!(provider = primary.id(), "Selected primary");

            let hedge_choice: Mutex<Option<String>> = Mutex::new(None);
            let race = self
                .hedge
                .race(
                    cancel,
                    |token| {
                        self.call_with_retry(primary.clone(), permit, request, token, Lane::Primary, &log)
                    },
                    |token| {
                        let mut skip = contacted.clone();
                        skip.insert(primary.id().to_string());
                        let (candidate, permit) = self.next_allowed(&snapshot, &skip)?;
                        *hedge_choice.lock() = Some(candidate.id().to_string());
                        Some(self.call_with_retry(candidate, permit, request, token, Lane::Hedge, &log))
                    },
                )
                .await;
            if let Some(hedged) = hedge_choice.into_inner() {
                contacted.insert(hedged);
            }

            match race {
                Ok(outcome) => {
                    let (completion, provider) = outcome.value;
                    let result = CompletionResult {
                        text: completion.text,
                        provider,
                        model: completion.model,
                        lane: outcome.lane,
                        hedged: outcome.hedged,
                        attempts: log.take(),
                        elapsed_ms: started.elapsed().as_millis() as u64,
                    };
                    self.after_completion();
                    return Ok(result);
                }
                Err(failure) => {
                    let err = failure.error.last_error;
                    if cancel.is_cancelled() || err.kind == ProviderErrorKind::Cancelled {
                        return Err(ThinkgateError::Cancelled);
                    }
                    if err.kind == ProviderErrorKind::InvalidRequest {
                        warn!(provider = %err.provider, error = %err.message, "Request rejected, not failing over");
                        return Err(ThinkgateError::ProvidersExhausted {
                            last_provider: err.provider.clone(),
                            attempts: log.len(),
                            last_error: err,
                        });
                    }
                    info!(
                        provider = %err.provider,
                        kind = %err.kind,
                        attempts = log.len(),
                        "Provider failed, failing over"
                    );
                    last_error = Some(err);
                }
            }
        }
    }

    /// First provider in `snapshot` not in `skip` whose circuit lets a call
    /// through, with its permit. The permit may carry the half-open trial.
    fn next_allowed(
        &self,
        snapshot: &ProviderSnapshot,
        skip: &HashSet<String>,
    ) -> Option<(Arc<dyn ProviderClient>, PendingPermit<'_>)> {
        snapshot
            .providers
            .iter()
            .filter(|p| !skip.contains(p.id()))
            .find_map(|p| match self.breaker.allow(p.id()) {
                Some(permit) => Some((
                    p.clone(),
                    PendingPermit {
                        breaker: &self.breaker,
                        provider: p.id().to_string(),
                        permit,
                        armed: true,
                    },
                )),
                None => {
                    debug!(provider = p.id(), "Circuit refuses call, skipping");
                    None
                }
            })
    }

    async fn call_with_retry(
        &self,
        provider: Arc<dyn ProviderClient>,
        permit: PendingPermit<'_>,
        request: &CompletionRequest,
        token: CancellationToken,
        lane: Lane,
        log: &AttemptLog,
    ) -> Result<(Completion, String), RetryError> {
        let id = provider.id().to_string();
        // The first attempt uses the permit that selected this provider;
        // each retry must win a fresh one from the gate.
        let current = Mutex::new(permit.claim());
        let completion = self
            .retry
            .execute_gated(
                &token,
                || match self.breaker.allow(&id) {
                    Some(next) => {
                        *current.lock() = next;
                        true
                    }
                    None => false,
                },
                |_| {
                    let permit = *current.lock();
                    self.call_once(provider.as_ref(), permit, request, &token, lane, log)
                },
            )
            .await?;
        Ok((completion, id))
    }

    /// One guarded call: enforces timeout and cancellation, then reports the
    /// outcome to the breaker, the stats table and the attempt log.
    async fn call_once(
        &self,
        provider: &dyn ProviderClient,
        permit: CallPermit,
        request: &CompletionRequest,
        token: &CancellationToken,
        lane: Lane,
        log: &AttemptLog,
    ) -> Result<Completion, ProviderError> {
        let descriptor = provider.descriptor();
        let id = descriptor.id.as_str();
        let index = log.begin(id, lane);
        let started = Instant::now();
        let mut guard = InFlight {
            breaker: &self.breaker,
            provider: id,
            permit,
            log,
            index,
            started,
            armed: true,
        };

        let result = tokio::select! {
            biased;
            _ = token.cancelled() => Err(ProviderError::cancelled(id)),
            res = tokio::time::timeout(descriptor.timeout, provider.complete(request, token)) => {
                res.unwrap_or_else(|_| Err(ProviderError::timeout(id, descriptor.timeout.as_millis() as u64)))
            }
        };
        let elapsed = started.elapsed();
        guard.armed = false;

        match &result {
            Ok(_) => {
                self.breaker.record(id, permit, true);
                self.stats.observe(id, true, elapsed);
            }
            Err(e) if e.kind == ProviderErrorKind::Cancelled => self.breaker.release(id, permit),
            Err(e) => {
                // A rejected request says nothing bad about the provider.
                self.breaker.record(id, permit, !e.kind.is_provider_fault());
                if e.kind.is_provider_fault() {
                    self.stats.observe(id, false, elapsed);
                }
                warn!(
                    provider = id,
                    attempt = index,
                    lane = ?lane,
                    kind = %e.kind,
                    status = ?e.status,
                    error = %e.message,
                    "Provider call failed"
                );
            }
        }

        log.finish(index, elapsed, result.as_ref().err().map(|e| e.kind));
        result
    }

    fn after_completion(&self) {
        let done = self.completed.fetch_add(1, Ordering::Relaxed) + 1;
        if self.flags.adaptive_optimization && done % self.rerank_interval == 0 {
            self.rerank();
        }
    }

    /// Publishes a new snapshot ordered by observed reliability and latency.
    pub fn rerank(&self) {
        let current = self.snapshot();
        let mut providers = current.providers.clone();
        self.stats
            .rank(&mut providers, |p| (p.id(), p.descriptor().priority));

        let changed = providers
            .iter()
            .zip(current.providers.iter())
            .any(|(a, b)| a.id() != b.id());
        if !changed {
            return;
        }

        let order: Vec<&str> = providers.iter().map(|p| p.id()).collect();
        info!(version = current.version + 1, order = ?order, "Provider order updated");
        *self.snapshot.write() = Arc::new(ProviderSnapshot {
            version: current.version + 1,
            providers,
        });
    }

    /// Circuit state for one provider, mainly for tests and status output.
    pub fn circuit_state(&self, provider: &str) -> CircuitState {
        self.breaker.state(provider)
    }
}

/// A permit between selection and the first poll of its call. A hedge
/// future dropped before it ever ran releases the trial here.
struct PendingPermit<'a> {
    breaker: &'a CircuitBreaker,
    provider: String,
    permit: CallPermit,
    armed: bool,
}

impl PendingPermit<'_> {
    fn claim(mut self) -> CallPermit {
        self.armed = false;
        self.permit
    }
}

impl Drop for PendingPermit<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.breaker.release(&self.provider, self.permit);
        }
    }
}

/// Settles a call that is dropped before it produced a verdict, e.g. the
/// losing lane of a hedge race: its trial (if it held one) is released and
/// its log entry stays cancelled with the time it ran.
struct InFlight<'a> {
    breaker: &'a CircuitBreaker,
    provider: &'a str,
    permit: CallPermit,
    log: &'a AttemptLog,
    index: u32,
    started: Instant,
    armed: bool,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.breaker.release(self.provider, self.permit);
            self.log.finish(
                self.index,
                self.started.elapsed(),
                Some(ProviderErrorKind::Cancelled),
            );
        }
    }
}

fn duration_ms(d: Duration) -> u64 {
    d.as_millis() as u64
}
