use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::pin;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Hedged-request settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HedgeConfig {
    /// Off means every call runs on the primary lane alone.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// How long the primary may run alone before the hedge is issued.
    #[serde(default = "default_delay_ms")]
    pub delay_ms: u64,
}

fn default_enabled() -> bool {
    true
}

fn default_delay_ms() -> u64 {
    2_000
}

impl Default for HedgeConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            delay_ms: default_delay_ms(),
        }
    }
}

/// Which of the two racing requests produced the result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Lane {
    /// The first request, started immediately.
    Primary,
    /// The delayed second request.
    Hedge,
}

/// The winning lane's value.
#[derive(Debug)]
pub struct HedgeOutcome<T> {
    /// What the winning lane returned.
    pub value: T,
    /// Lane that produced `value`.
    pub lane: Lane,
    /// Whether a hedge request was issued at all.
    pub hedged: bool,
}

/// Both lanes failed, or the primary failed with no hedge in play.
#[derive(Debug)]
pub struct HedgeFailure<E> {
    /// The primary's error.
    pub error: E,
    /// Set only when the hedge also ran and failed.
    pub hedge_error: Option<E>,
    /// Whether a hedge request was issued.
    pub hedged: bool,
}

/// Races a primary request against a delayed second request.
///
/// Each lane runs under its own child token of the caller's token, so the
/// loser can be cancelled without touching the winner.
#[derive(Debug, Clone)]
pub struct HedgeController {
    config: HedgeConfig,
}

impl HedgeController {
    /// Builds a controller from its config.
    pub fn new(config: HedgeConfig) -> Self {
        Self { config }
    }

    /// How long the primary runs alone.
    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.config.delay_ms)
    }

    /// Whether a hedge is ever started.
    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// Starts `primary`; if it is still running after the hedge delay, asks
    /// `hedge` for a second request and runs both. The first success wins
    /// and the other lane's token is cancelled. `hedge` returns `None` when
    /// there is nothing eligible to hedge with.
    ///
    /// If the primary fails before the delay elapses, no hedge is issued.
    pub async fn race<T, E, P, PF, H, HF>(
        &self,
        cancel: &CancellationToken,
        primary: P,
        hedge: H,
    ) -> Result<HedgeOutcome<T>, HedgeFailure<E>>
    where
        P: FnOnce(CancellationToken) -> PF,
        PF: Future<Output = Result<T, E>>,
        H: FnOnce(CancellationToken) -> Option<HF>,
        HF: Future<Output = Result<T, E>>,
    {
        let primary_token = cancel.child_token();
        let mut primary_fut = pin!(primary(primary_token.clone()));

        if !self.config.enabled {
            return match primary_fut.await {
                Ok(value) => Ok(HedgeOutcome { value, lane: Lane::Primary, hedged: false }),
                Err(error) => Err(HedgeFailure { error, hedge_error: None, hedged: false }),
            };
        }

        tokio::select! {
            biased;
            res = &mut primary_fut => {
                return match res {
                    Ok(value) => Ok(HedgeOutcome { value, lane: Lane::Primary, hedged: false }),
                    Err(error) => Err(HedgeFailure { error, hedge_error: None, hedged: false }),
                };
            }
            _ = tokio::time::sleep(self.delay()) => {}
        }

        let hedge_token = cancel.child_token();
        let Some(hedge_fut) = hedge(hedge_token.clone()) else {
            debug!("No hedge candidate, waiting on primary");
            return match primary_fut.await {
                Ok(value) => Ok(HedgeOutcome { value, lane: Lane::Primary, hedged: false }),
                Err(error) => Err(HedgeFailure { error, hedge_error: None, hedged: false }),
            };
        };
        debug!(delay_ms = self.config.delay_ms, "Primary is slow, hedge issued");
        let mut hedge_fut = pin!(hedge_fut);

        let mut primary_err: Option<E> = None;
        let mut hedge_err: Option<E> = None;
        loop {
            tokio::select! {
                biased;
                res = &mut primary_fut, if primary_err.is_none() => match res {
                    Ok(value) => {
                        hedge_token.cancel();
                        return Ok(HedgeOutcome { value, lane: Lane::Primary, hedged: true });
                    }
                    Err(error) => {
                        if hedge_err.is_some() {
                            return Err(HedgeFailure { error, hedge_error: hedge_err, hedged: true });
                        }
                        primary_err = Some(error);
                    }
                },
                res = &mut hedge_fut, if hedge_err.is_none() => match res {
                    Ok(value) => {
                        primary_token.cancel();
                        return Ok(HedgeOutcome { value, lane: Lane::Hedge, hedged: true });
                    }
                    Err(error) => match primary_err.take() {
                        Some(primary) => {
                            return Err(HedgeFailure {
                                error: primary,
                                hedge_error: Some(error),
                                hedged: true,
                            });
                        }
                        None => hedge_err = Some(error),
                    },
                },
            }
        }
    }
}

impl Default for HedgeController {
    fn default() -> Self {
        Self::new(HedgeConfig::default())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::sync::Arc;

    fn controller(delay_ms: u64) -> HedgeController {
        HedgeController::new(HedgeConfig { enabled: true, delay_ms })
    }

    async fn respond(
        token: CancellationToken,
        after: Duration,
        out: Result<&'static str, &'static str>,
    ) -> Result<&'static str, &'static str> {
        tokio::select! {
            _ = token.cancelled() => Err("cancelled"),
            _ = tokio::time::sleep(after) => out,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn fast_primary_never_hedges() {
        let hedge_called = AtomicBool::new(false);
        let out = controller(100)
            .race(
                &CancellationToken::new(),
                |t| respond(t, Duration::from_millis(50), Ok("primary")),
                |t| {
                    hedge_called.store(true, Ordering::SeqCst);
                    Some(respond(t, Duration::ZERO, Ok("hedge")))
                },
            )
            .await
            .unwrap();
        assert_eq!(out.value, "primary");
        assert!(!out.hedged);
        assert!(!hedge_called.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_primary_loses_to_hedge_and_is_cancelled() {
        let primary_token = Arc::new(parking_lot::Mutex::new(None));
        let seen = primary_token.clone();
        let out = controller(100)
            .race(
                &CancellationToken::new(),
                move |t| {
                    *seen.lock() = Some(t.clone());
                    respond(t, Duration::from_secs(10), Ok("primary"))
                },
                |t| Some(respond(t, Duration::from_millis(50), Ok("hedge"))),
            )
            .await
            .unwrap();
        assert_eq!(out.value, "hedge");
        assert_eq!(out.lane, Lane::Hedge);
        assert!(out.hedged);
        assert!(primary_token.lock().as_ref().unwrap().is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn at_most_one_extra_call() {
        let issued = AtomicU32::new(0);
        let result = controller(10)
            .race(
                &CancellationToken::new(),
                |t| {
                    issued.fetch_add(1, Ordering::SeqCst);
                    respond(t, Duration::from_millis(100), Err("primary down"))
                },
                |t| {
                    issued.fetch_add(1, Ordering::SeqCst);
                    Some(respond(t, Duration::from_millis(200), Err("hedge down")))
                },
            )
            .await;
        assert_eq!(issued.load(Ordering::SeqCst), 2);
        let failure = result.unwrap_err();
        assert_eq!(failure.error, "primary down");
        assert_eq!(failure.hedge_error, Some("hedge down"));
    }

    #[tokio::test(start_paused = true)]
    async fn primary_error_wins_even_when_hedge_fails_first() {
        let failure = controller(10)
            .race(
                &CancellationToken::new(),
                |t| respond(t, Duration::from_millis(500), Err("primary down")),
                |t| Some(respond(t, Duration::from_millis(20), Err("hedge down"))),
            )
            .await
            .unwrap_err();
        assert_eq!(failure.error, "primary down");
        assert!(failure.hedged);
    }

    #[tokio::test(start_paused = true)]
    async fn primary_still_wins_after_hedge_fails() {
        let out = controller(10)
            .race(
                &CancellationToken::new(),
                |t| respond(t, Duration::from_millis(500), Ok("primary")),
                |t| Some(respond(t, Duration::from_millis(20), Err("hedge down"))),
            )
            .await
            .unwrap();
        assert_eq!(out.value, "primary");
        assert_eq!(out.lane, Lane::Primary);
    }

    #[tokio::test(start_paused = true)]
    async fn early_primary_failure_skips_the_hedge() {
        let failure = controller(100)
            .race(
                &CancellationToken::new(),
                |t| respond(t, Duration::from_millis(10), Err("primary down")),
                |t| Some(respond(t, Duration::ZERO, Ok("hedge"))),
            )
            .await
            .unwrap_err();
        assert!(!failure.hedged);
        assert_eq!(failure.hedge_error, None);
    }

    #[tokio::test(start_paused = true)]
    async fn disabled_hedging_waits_for_primary() {
        let out = HedgeController::new(HedgeConfig { enabled: false, delay_ms: 1 })
            .race(
                &CancellationToken::new(),
                |t| respond(t, Duration::from_secs(5), Ok("primary")),
                |t| Some(respond(t, Duration::ZERO, Ok("hedge"))),
            )
            .await
            .unwrap();
        assert_eq!(out.value, "primary");
        assert!(!out.hedged);
    }
}
