use dashmap::DashMap;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant};

/// Registry of keyed token buckets shared across the proxy hot path.
///
/// Buckets are created on first use and cached by `(scope, key)`. The proxy
/// engine keys per-node throttles as `(cluster, "endpoint:qps")` and
/// `(cluster, "endpoint:bps")`; the bulk splitter uses a slow generic bucket
/// to throttle its error log.
pub struct LimiterRegistry {
    buckets: DashMap<(String, String), Arc<TokenBucket>>,
}

impl Default for LimiterRegistry {
    fn default() -> Self {
        Self {
            buckets: DashMap::new(),
        }
    }
}

impl LimiterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bucket replenishing `max` permits every second, with burst `max`.
    pub fn per_second(&self, scope: &str, key: &str, max: u64) -> Arc<TokenBucket> {
        self.get(scope, key, max, max, Duration::from_secs(1))
    }

    /// General bucket: `rate` permits per `period`, capped at `burst`.
    /// Parameters are fixed at first creation for a given `(scope, key)`.
    pub fn get(
        &self,
        scope: &str,
        key: &str,
        rate: u64,
        burst: u64,
        period: Duration,
    ) -> Arc<TokenBucket> {
        if let Some(entry) = self.buckets.get(&(scope.to_string(), key.to_string())) {
            return entry.value().clone();
        }
        self.buckets
            .entry((scope.to_string(), key.to_string()))
            .or_insert_with(|| Arc::new(TokenBucket::new(rate, burst, period)))
            .clone()
    }
}

/// Token bucket guarded by a plain mutex — `allow` never awaits while the
/// lock is held, so a sync mutex is fine on the async path.
pub struct TokenBucket {
    inner: Mutex<BucketInner>,
}

struct BucketInner {
    tokens: f64,
    last_refill: u64,
    rate_per_us: f64,
    burst: f64,
}

impl TokenBucket {
    fn new(rate: u64, burst: u64, period: Duration) -> Self {
        let period_us = period.as_micros().max(1) as f64;
        let burst = burst.max(1) as f64;
        Self {
            inner: Mutex::new(BucketInner {
                tokens: burst,
                last_refill: now_us(),
                rate_per_us: rate as f64 / period_us,
                burst,
            }),
        }
    }

    pub fn allow(&self) -> bool {
        self.allow_n(1)
    }

    pub fn allow_n(&self, n: usize) -> bool {
        let now = now_us();
        let mut b = self.inner.lock().expect("limiter mutex poisoned");

        let elapsed = now.saturating_sub(b.last_refill);
        if elapsed > 0 {
            b.tokens = (b.tokens + elapsed as f64 * b.rate_per_us).min(b.burst);
            b.last_refill = now;
        }

        let cost = n as f64;
        if b.tokens >= cost {
            b.tokens -= cost;
            true
        } else {
            false
        }
    }
}

fn now_us() -> u64 {
    static START: OnceLock<Instant> = OnceLock::new();
    let start = START.get_or_init(Instant::now);
    start.elapsed().as_micros() as u64
}
