use rand::Rng;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use thinkgate_core::ProviderError;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Configures retry behaviour for calls to a single provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts, the first one included.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Base delay in milliseconds for exponential backoff.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Maximum delay in milliseconds (cap for exponential backoff).
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Randomise each delay within its upper half.
    #[serde(default = "default_jitter")]
    pub jitter: bool,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    250
}

fn default_max_delay_ms() -> u64 {
    8_000
}

fn default_jitter() -> bool {
    true
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            jitter: default_jitter(),
        }
    }
}

/// Terminal outcome of [`RetryPolicy::execute`].
#[derive(Debug, Clone, thiserror::Error)]
#[error("gave up after {attempts} attempt(s): {last_error}")]
pub struct RetryError {
    /// Attempts actually made.
    pub attempts: u32,
    /// Error from the final attempt.
    #[source]
    pub last_error: ProviderError,
}

/// Computes the un-jittered backoff before retry number `retry` (zero-based),
/// exponential and capped at `max_delay_ms`.
fn compute_backoff(policy: &RetryPolicy, retry: u32) -> u64 {
    let delay = policy
        .base_delay_ms
        .saturating_mul(2u64.saturating_pow(retry));
    delay.min(policy.max_delay_ms)
}

impl RetryPolicy {
    /// A policy that makes a single attempt.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// The delay to sleep before retry number `retry` (zero-based).
    pub fn delay_for(&self, retry: u32) -> Duration {
        let ceiling = compute_backoff(self, retry);
        let ms = if self.jitter && ceiling > 1 {
            rand::thread_rng().gen_range(ceiling / 2..=ceiling)
        } else {
            ceiling
        };
        Duration::from_millis(ms)
    }

    /// Runs `operation` until it succeeds, fails with a non-retryable error,
    /// or the attempt budget is spent.
    ///
    /// `operation` receives the zero-based attempt number. Backoff sleeps
    /// end early when `cancel` fires.
    pub async fn execute<T, F, Fut>(
        &self,
        cancel: &CancellationToken,
        operation: F,
    ) -> Result<T, RetryError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        self.execute_gated(cancel, || true, operation).await
    }

    /// Like [`execute`](Self::execute), but asks `gate` before every retry.
    /// A closed gate stops retrying and surfaces the last error; the
    /// dispatcher uses it to stop hammering a provider whose circuit opened.
    pub async fn execute_gated<T, F, Fut, G>(
        &self,
        cancel: &CancellationToken,
        gate: G,
        mut operation: F,
    ) -> Result<T, RetryError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
        G: Fn() -> bool,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            let err = match operation(attempt).await {
                Ok(value) => return Ok(value),
                Err(e) => e,
            };
            let attempts = attempt + 1;

            if !err.is_retryable() {
                warn!(
                    provider = %err.provider,
                    attempt,
                    kind = %err.kind,
                    error = %err.message,
                    "Non-retryable error"
                );
                return Err(RetryError { attempts, last_error: err });
            }
            if attempts >= max_attempts {
                warn!(
                    provider = %err.provider,
                    attempt,
                    kind = %err.kind,
                    "Retries exhausted"
                );
                return Err(RetryError { attempts, last_error: err });
            }
            if !gate() {
                info!(provider = %err.provider, attempt, "Retry gate closed");
                return Err(RetryError { attempts, last_error: err });
            }

            let delay = self.delay_for(attempt);
            info!(
                provider = %err.provider,
                attempt,
                kind = %err.kind,
                delay_ms = delay.as_millis() as u64,
                "Retryable error, backing off"
            );
            tokio::select! {
                _ = cancel.cancelled() => {
                    let provider = err.provider.clone();
                    return Err(RetryError {
                        attempts,
                        last_error: ProviderError::cancelled(provider),
                    });
                }
                _ = tokio::time::sleep(delay) => {}
            }
            attempt += 1;
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use thinkgate_core::ProviderErrorKind;

    fn fail(kind: ProviderErrorKind) -> ProviderError {
        ProviderError::new("p", kind, "scripted")
    }

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay_ms: 100,
            max_delay_ms: 1_000,
            jitter: false,
        }
    }

    #[test]
    fn backoff_computation() {
        let policy = RetryPolicy {
            max_attempts: 8,
            base_delay_ms: 250,
            max_delay_ms: 8_000,
            jitter: false,
        };

        assert_eq!(compute_backoff(&policy, 0), 250);
        assert_eq!(compute_backoff(&policy, 1), 500);
        assert_eq!(compute_backoff(&policy, 4), 4_000);
        assert_eq!(compute_backoff(&policy, 5), 8_000);
        assert_eq!(compute_backoff(&policy, 6), 8_000);
        assert_eq!(compute_backoff(&policy, 63), 8_000);
    }

    #[test]
    fn jitter_stays_in_upper_half() {
        let policy = RetryPolicy {
            jitter: true,
            ..policy(5)
        };
        for _ in 0..200 {
            let d = policy.delay_for(2).as_millis() as u64;
            assert!((200..=400).contains(&d), "{d}");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn retry_succeeds_on_second_try() {
        let calls = AtomicU32::new(0);
        let out = policy(3)
            .execute(&CancellationToken::new(), |attempt| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt == 0 {
                        Err(fail(ProviderErrorKind::RateLimited))
                    } else {
                        Ok("ok")
                    }
                }
            })
            .await
            .unwrap();
        assert_eq!(out, "ok");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn attempts_never_exceed_the_max() {
        let calls = AtomicU32::new(0);
        let err = policy(4)
            .execute(&CancellationToken::new(), |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(fail(ProviderErrorKind::ServerError)) }
            })
            .await
            .unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(err.attempts, 4);
        assert_eq!(err.last_error.kind, ProviderErrorKind::ServerError);
    }

    #[tokio::test(start_paused = true)]
    async fn non_retryable_errors_are_never_retried() {
        for kind in [
            ProviderErrorKind::InvalidRequest,
            ProviderErrorKind::Unauthorized,
            ProviderErrorKind::QuotaExhausted,
            ProviderErrorKind::Cancelled,
        ] {
            let calls = AtomicU32::new(0);
            let err = policy(5)
                .execute(&CancellationToken::new(), |_| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async move { Err::<(), _>(fail(kind)) }
                })
                .await
                .unwrap_err();
            assert_eq!(calls.load(Ordering::SeqCst), 1, "{kind}");
            assert_eq!(err.attempts, 1);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_waits_between_attempts() {
        let start = tokio::time::Instant::now();
        let _ = policy(3)
            .execute(&CancellationToken::new(), |_| async {
                Err::<(), _>(fail(ProviderErrorKind::Timeout))
            })
            .await;
        // 100ms + 200ms
        let waited = start.elapsed();
        assert!(waited >= Duration::from_millis(300), "{waited:?}");
        assert!(waited < Duration::from_millis(310), "{waited:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn closed_gate_stops_retrying() {
        let calls = AtomicU32::new(0);
        let err = policy(5)
            .execute_gated(
                &CancellationToken::new(),
                || false,
                |_| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err::<(), _>(fail(ProviderErrorKind::Connection)) }
                },
            )
            .await
            .unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(err.last_error.kind, ProviderErrorKind::Connection);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_interrupts_backoff() {
        let cancel = CancellationToken::new();
        let slow = RetryPolicy {
            base_delay_ms: 60_000,
            max_delay_ms: 60_000,
            ..policy(3)
        };
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            trigger.cancel();
        });

        let start = tokio::time::Instant::now();
        let err = slow
            .execute(&cancel, |_| async {
                Err::<(), _>(fail(ProviderErrorKind::ServerError))
            })
            .await
            .unwrap_err();
        assert_eq!(err.last_error.kind, ProviderErrorKind::Cancelled);
        assert_eq!(err.attempts, 1);
        assert!(start.elapsed() < Duration::from_secs(2));
    }
}
