use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// Token bucket rate limiter per API key id.
pub struct RateLimiter {
    max_tokens: f64,
    refill_rate: f64, // tokens per second
    buckets: Mutex<HashMap<String, Bucket>>,
}

impl RateLimiter {
    /// Create a new rate limiter.
    /// - `max_tokens`: maximum burst size
    /// - `refill_rate`: tokens added per second
    pub fn new(max_tokens: f64, refill_rate: f64) -> Self {
        Self {
            max_tokens,
            refill_rate,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Try to consume one token for the given key.
    /// Returns `true` if allowed, `false` if rate limited.
    pub async fn check(&self, key_id: &str) -> bool {
        let mut buckets = self.buckets.lock().await;
        let now = Instant::now();

        let bucket = buckets.entry(key_id.to_string()).or_insert(Bucket {
            tokens: self.max_tokens,
            last_refill: now,
        });

        let elapsed = now.duration_since(bucket.last_refill);
        bucket.tokens =
            (bucket.tokens + elapsed.as_secs_f64() * self.refill_rate).min(self.max_tokens);
        bucket.last_refill = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Drop a key's bucket, e.g. after revocation.
    pub async fn forget(&self, key_id: &str) {
        self.buckets.lock().await.remove(key_id);
    }

    /// Remove expired buckets (no activity for the given duration).
    pub async fn cleanup(&self, max_idle: Duration) {
        let mut buckets = self.buckets.lock().await;
        let now = Instant::now();
        buckets.retain(|_, b| now.duration_since(b.last_refill) < max_idle);
    }

    /// Number of keys currently tracked.
    pub async fn tracked_keys(&self) -> usize {
        self.buckets.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_rate_limiter_allows_burst() {
        let limiter = RateLimiter::new(5.0, 1.0);
        for _ in 0..5 {
            assert!(limiter.check("key_a").await);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limiter_blocks_then_refills() {
        let limiter = RateLimiter::new(2.0, 1.0);
        assert!(limiter.check("key_a").await);
        assert!(limiter.check("key_a").await);
        assert!(!limiter.check("key_a").await);

        tokio::time::advance(Duration::from_millis(1100)).await;
        assert!(limiter.check("key_a").await);
    }

    #[tokio::test]
    async fn test_keys_are_independent() {
        let limiter = RateLimiter::new(1.0, 0.0);
        assert!(limiter.check("key_a").await);
        assert!(!limiter.check("key_a").await);
        assert!(limiter.check("key_b").await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleanup_and_forget() {
        let limiter = RateLimiter::new(1.0, 1.0);
        limiter.check("old").await;
        tokio::time::advance(Duration::from_secs(120)).await;
        limiter.check("fresh").await;

        limiter.cleanup(Duration::from_secs(60)).await;
        assert_eq!(limiter.tracked_keys().await, 1);

        limiter.forget("fresh").await;
        assert_eq!(limiter.tracked_keys().await, 0);
    }
}
