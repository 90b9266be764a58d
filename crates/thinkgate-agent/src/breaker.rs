use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Where a provider's circuit currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Calls flow; failures are counted.
    Closed,
    /// Calls are refused until the cooldown elapses.
    Open,
    /// One trial call decides whether the circuit closes again.
    HalfOpen,
}

impl CircuitState {
    /// Lowercase name used in logs and status output.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

/// Circuit breaker tuning, shared by every provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Failures inside the window that open the circuit.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// Sliding window for counting failures, in milliseconds.
    #[serde(default = "default_window_ms")]
    pub window_ms: u64,
    /// Initial open period; doubled after each failed trial.
    #[serde(default = "default_cooldown_ms")]
    pub cooldown_ms: u64,
    /// Ceiling for the doubled cooldown.
    #[serde(default = "default_max_cooldown_ms")]
    pub max_cooldown_ms: u64,
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_window_ms() -> u64 {
    60_000
}

fn default_cooldown_ms() -> u64 {
    30_000
}

fn default_max_cooldown_ms() -> u64 {
    300_000
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            window_ms: default_window_ms(),
            cooldown_ms: default_cooldown_ms(),
            max_cooldown_ms: default_max_cooldown_ms(),
        }
    }
}

impl BreakerConfig {
    fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }

    fn max_cooldown(&self) -> Duration {
        Duration::from_millis(self.max_cooldown_ms.max(self.cooldown_ms))
    }
}

/// A state change, published to subscribers.
#[derive(Debug, Clone, Serialize)]
pub struct CircuitTransition {
    /// Provider id.
    pub provider: String,
    /// State before the change.
    pub from: CircuitState,
    /// State after the change.
    pub to: CircuitState,
    /// Wall-clock time of the change.
    pub at: DateTime<Utc>,
}

/// Point-in-time view of one provider's circuit.
#[derive(Debug, Clone, Serialize)]
pub struct CircuitSnapshot {
    /// Provider id.
    pub provider: String,
    /// Current state.
    pub state: CircuitState,
    /// Failures still inside the sliding window.
    pub recent_failures: u32,
    /// Open period applied the next time the circuit opens.
    pub cooldown_ms: u64,
    /// Time left before a trial is allowed, while open.
    pub retry_in_ms: Option<u64>,
    /// Whether a half-open trial is currently out.
    pub trial_in_flight: bool,
    /// Successful calls since start.
    pub total_successes: u64,
    /// Failed calls since start.
    pub total_failures: u64,
    /// How many times the circuit has opened.
    pub times_opened: u64,
}

/// Handed out by [`CircuitBreaker::allow`] and given back to
/// [`record`](CircuitBreaker::record) or [`release`](CircuitBreaker::release).
///
/// Only the permit that carries the half-open trial can close the circuit,
/// re-open it, or free the trial slot. Results reported with any other
/// permit while half-open are counted but do not change state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[must_use]
pub struct CallPermit {
    trial: Option<u64>,
}

impl CallPermit {
    /// True when this permit holds the half-open trial.
    pub fn is_trial(&self) -> bool {
        self.trial.is_some()
    }
}

struct Circuit {
    state: CircuitState,
    failures: VecDeque<Instant>,
    open_until: Option<Instant>,
    cooldown: Duration,
    /// Id of the outstanding half-open trial.
    trial: Option<u64>,
    trials_started: u64,
    total_successes: u64,
    total_failures: u64,
    times_opened: u64,
}

impl Circuit {
    fn new(cooldown: Duration) -> Self {
        Self {
            state: CircuitState::Closed,
            failures: VecDeque::new(),
            open_until: None,
            cooldown,
            trial: None,
            trials_started: 0,
            total_successes: 0,
            total_failures: 0,
            times_opened: 0,
        }
    }

    fn prune(&mut self, now: Instant, window: Duration) {
        while let Some(&oldest) = self.failures.front() {
            if now.duration_since(oldest) >= window {
                self.failures.pop_front();
            } else {
                break;
            }
        }
    }

    /// Arms the open period. The caller performs the state transition.
    fn open(&mut self, now: Instant) {
        self.open_until = Some(now + self.cooldown);
        self.trial = None;
        self.times_opened += 1;
    }

    fn start_trial(&mut self) -> CallPermit {
        self.trials_started += 1;
        self.trial = Some(self.trials_started);
        CallPermit { trial: self.trial }
    }

    fn holds_trial(&self, permit: CallPermit) -> bool {
        permit.trial.is_some() && permit.trial == self.trial
    }
}

/// Per-provider circuit breaker.
///
/// Each provider has its own mutex, so a slow transition on one provider
/// never blocks callers asking about another. The outer map is only
/// write-locked the first time a provider is seen.
pub struct CircuitBreaker {
    config: BreakerConfig,
    circuits: RwLock<HashMap<String, Arc<Mutex<Circuit>>>>,
    transitions: broadcast::Sender<CircuitTransition>,
}

impl CircuitBreaker {
    /// A breaker with no circuits yet; each provider starts closed.
    pub fn new(config: BreakerConfig) -> Self {
        let (transitions, _) = broadcast::channel(64);
        Self {
            config,
            circuits: RwLock::new(HashMap::new()),
            transitions,
        }
    }

    /// The tuning in effect.
    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    /// Receives every state change from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<CircuitTransition> {
        self.transitions.subscribe()
    }

    fn circuit(&self, provider: &str) -> Arc<Mutex<Circuit>> {
        if let Some(c) = self.circuits.read().get(provider) {
            return c.clone();
        }
        self.circuits
            .write()
            .entry(provider.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(Circuit::new(self.config.cooldown()))))
            .clone()
    }

    fn transition(&self, provider: &str, circuit: &mut Circuit, to: CircuitState) {
        let from = circuit.state;
        circuit.state = to;
        match to {
            CircuitState::Open => warn!(
                provider,
                from = from.as_str(),
                state = to.as_str(),
                cooldown_ms = circuit.cooldown.as_millis() as u64,
                "Circuit opened"
            ),
            _ => info!(provider, from = from.as_str(), state = to.as_str(), "Circuit state changed"),
        }
        // No subscribers is fine.
        let _ = self.transitions.send(CircuitTransition {
            provider: provider.to_string(),
            from,
            to,
            at: Utc::now(),
        });
    }

    /// Whether a call to `provider` may proceed now.
    ///
    /// Once an open circuit's cooldown has elapsed, exactly one caller gets
    /// the trial permit; everyone else keeps getting `None` until that
    /// trial is recorded or released.
    pub fn allow(&self, provider: &str) -> Option<CallPermit> {
        let circuit = self.circuit(provider);
        let mut c = circuit.lock();
        match c.state {
            CircuitState::Closed => Some(CallPermit::default()),
            CircuitState::Open => {
                let now = Instant::now();
                if c.open_until.is_some_and(|until| now >= until) {
                    self.transition(provider, &mut c, CircuitState::HalfOpen);
                    Some(c.start_trial())
                } else {
                    None
                }
            }
            CircuitState::HalfOpen if c.trial.is_some() => None,
            CircuitState::HalfOpen => Some(c.start_trial()),
        }
    }

    /// Records the outcome of a call that `allow` let through.
    pub fn record(&self, provider: &str, permit: CallPermit, success: bool) {
        let circuit = self.circuit(provider);
        let mut c = circuit.lock();
        let now = Instant::now();
        if success {
            c.total_successes += 1;
        } else {
            c.total_failures += 1;
        }

        match (c.state, success) {
            (CircuitState::Closed, true) => {}
            (CircuitState::Closed, false) => {
                c.failures.push_back(now);
                c.prune(now, self.config.window());
                if c.failures.len() as u32 >= self.config.failure_threshold {
                    c.open(now);
                    self.transition(provider, &mut c, CircuitState::Open);
                }
            }
            // Only the trial holder decides; anything else is a straggler
            // from before the circuit opened.
            (CircuitState::HalfOpen, _) if !c.holds_trial(permit) => {
                debug!(provider, success, "Ignoring result from a non-trial call");
            }
            (CircuitState::HalfOpen, true) => {
                c.failures.clear();
                c.open_until = None;
                c.trial = None;
                c.cooldown = self.config.cooldown();
                self.transition(provider, &mut c, CircuitState::Closed);
            }
            (CircuitState::HalfOpen, false) => {
                c.cooldown = (c.cooldown * 2).min(self.config.max_cooldown());
                c.open(now);
                self.transition(provider, &mut c, CircuitState::Open);
            }
            // A straggler allowed before the circuit opened.
            (CircuitState::Open, _) => {}
        }
    }

    /// Frees a half-open trial that ended without a verdict, e.g. a
    /// cancelled hedge loser. The next `allow` may start a new trial.
    /// Permits that do not hold the trial are a no-op.
    pub fn release(&self, provider: &str, permit: CallPermit) {
        let circuit = self.circuit(provider);
        let mut c = circuit.lock();
        if c.state == CircuitState::HalfOpen && c.holds_trial(permit) {
            c.trial = None;
        }
    }

    /// Current state of `provider`'s circuit.
    pub fn state(&self, provider: &str) -> CircuitState {
        self.circuit(provider).lock().state
    }

    /// True when `allow` would currently refuse, without claiming a trial.
    pub fn is_blocking(&self, provider: &str) -> bool {
        let circuit = self.circuit(provider);
        let c = circuit.lock();
        match c.state {
            CircuitState::Closed => false,
            CircuitState::Open => c.open_until.is_some_and(|until| Instant::now() < until),
            CircuitState::HalfOpen => c.trial.is_some(),
        }
    }

    /// Point-in-time view of `provider`'s circuit.
    pub fn snapshot(&self, provider: &str) -> CircuitSnapshot {
        let circuit = self.circuit(provider);
        let mut c = circuit.lock();
        let now = Instant::now();
        c.prune(now, self.config.window());
        CircuitSnapshot {
            provider: provider.to_string(),
            state: c.state,
            recent_failures: c.failures.len() as u32,
            cooldown_ms: c.cooldown.as_millis() as u64,
            retry_in_ms: match c.state {
                CircuitState::Open => c
                    .open_until
                    .map(|until| until.saturating_duration_since(now).as_millis() as u64),
                _ => None,
            },
            trial_in_flight: c.trial.is_some(),
            total_successes: c.total_successes,
            total_failures: c.total_failures,
            times_opened: c.times_opened,
        }
    }

    /// Snapshots of every provider seen so far, sorted by provider id.
    pub fn snapshots(&self) -> Vec<CircuitSnapshot> {
        let mut ids: Vec<String> = self.circuits.read().keys().cloned().collect();
        ids.sort();
        ids.iter().map(|id| self.snapshot(id)).collect()
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(BreakerConfig::default())
    }
}
