//! Observed provider performance, used by adaptive optimization to reorder
//! the provider list.

use parking_lot::Mutex;
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::time::Duration;

/// Weight of the newest sample in the moving averages.
const EWMA_ALPHA: f64 = 0.2;

/// Running call statistics for one provider.
#[derive(Debug, Clone, Serialize)]
pub struct ProviderStats {
    /// Calls observed, successful or not.
    pub calls: u64,
    /// Calls that failed.
    pub failures: u64,
    /// Exponentially weighted success rate in `[0, 1]`.
    pub success_rate: f64,
    /// Exponentially weighted latency of successful calls.
    pub latency_ms: Option<f64>,
}

impl Default for ProviderStats {
    fn default() -> Self {
        Self {
            calls: 0,
            failures: 0,
            success_rate: 1.0,
            latency_ms: None,
        }
    }
}

impl ProviderStats {
    fn observe(&mut self, success: bool, latency: Duration) {
        self.calls += 1;
        let sample = if success { 1.0 } else { 0.0 };
        self.success_rate += EWMA_ALPHA * (sample - self.success_rate);
        if success {
            let ms = latency.as_secs_f64() * 1000.0;
            self.latency_ms = Some(match self.latency_ms {
                Some(avg) => avg + EWMA_ALPHA * (ms - avg),
                None => ms,
            });
        } else {
            self.failures += 1;
        }
    }

    /// Success rate in tenths so small fluctuations don't reshuffle the order.
    fn reliability_bucket(&self) -> u32 {
        (self.success_rate * 10.0).round() as u32
    }
}

/// Per-provider stats, shared by the dispatcher.
#[derive(Default)]
pub struct StatsTable {
    stats: Mutex<HashMap<String, ProviderStats>>,
}

impl StatsTable {
    /// Records one finished call.
    pub fn observe(&self, provider: &str, success: bool, latency: Duration) {
        self.stats
            .lock()
            .entry(provider.to_string())
            .or_default()
            .observe(success, latency);
    }

    /// Stats for `provider`, or the defaults if it was never called.
    pub fn get(&self, provider: &str) -> ProviderStats {
        self.stats.lock().get(provider).cloned().unwrap_or_default()
    }

    /// Orders `(provider id, priority)` pairs: more reliable first, then
    /// faster, then configured priority. Providers without latency samples
    /// sort after measured ones in the same reliability bucket.
    pub fn rank<T>(&self, items: &mut [T], key: impl Fn(&T) -> (&str, u32)) {
        let stats = self.stats.lock();
        let default = ProviderStats::default();
        items.sort_by(|a, b| {
            let (a_id, a_prio) = key(a);
            let (b_id, b_prio) = key(b);
            let sa = stats.get(a_id).unwrap_or(&default);
            let sb = stats.get(b_id).unwrap_or(&default);
            sb.reliability_bucket()
                .cmp(&sa.reliability_bucket())
                .then_with(|| compare_latency(sa.latency_ms, sb.latency_ms))
                .then_with(|| a_prio.cmp(&b_prio))
        });
    }
}

fn compare_latency(a: Option<f64>, b: Option<f64>) -> Ordering {
    match (a, b) {
        (Some(a), Some(b)) => a.partial_cmp(&b).unwrap_or(Ordering::Equal),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}
