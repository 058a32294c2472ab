//! Requeue delay policies for the change queue.

use std::hash::Hash;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rustc_hash::FxHashMap;

/// Decides how long a failed item waits before it is surfaced again.
pub trait RateLimiter<K>: Send + Sync {
    /// Delay for the next requeue of `key`; records one more failure.
    fn when(&self, key: &K) -> Duration;
    /// Clear the failure history of `key`.
    fn forget(&self, key: &K);
    /// Number of requeues recorded since the last `forget`.
    fn num_requeues(&self, key: &K) -> u32;
}

/// `base * 2^failures`, capped at `max`, tracked per item.
pub struct ExponentialFailureRateLimiter<K> {
    base: Duration,
    max: Duration,
    failures: Mutex<FxHashMap<K, u32>>,
}

impl<K> ExponentialFailureRateLimiter<K> {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max, failures: Mutex::new(FxHashMap::default()) }
    }
}

impl<K: Eq + Hash + Clone + Send> RateLimiter<K> for ExponentialFailureRateLimiter<K> {
    fn when(&self, key: &K) -> Duration {
        let mut failures = self.failures.lock();
        let exp = failures.entry(key.clone()).or_insert(0);
        let n = *exp;
        *exp = exp.saturating_add(1);
        let factor = 2u32.checked_pow(n).unwrap_or(u32::MAX);
        self.base.checked_mul(factor).map(|d| d.min(self.max)).unwrap_or(self.max)
    }

    fn forget(&self, key: &K) { self.failures.lock().remove(key); }

    fn num_requeues(&self, key: &K) -> u32 { self.failures.lock().get(key).copied().unwrap_or(0) }
}

struct Bucket {
    tokens: f64,
    last: Instant,
}

/// Token bucket shared by all items: `qps` refill rate, `burst` capacity.
pub struct BucketRateLimiter {
    qps: f64,
    burst: f64,
    bucket: Mutex<Bucket>,
}

impl BucketRateLimiter {
    pub fn new(qps: f64, burst: u32) -> Self {
        let burst = f64::from(burst.max(1));
        Self { qps: qps.max(f64::MIN_POSITIVE), burst, bucket: Mutex::new(Bucket { tokens: burst, last: Instant::now() }) }
    }
}

impl<K> RateLimiter<K> for BucketRateLimiter {
    fn when(&self, _key: &K) -> Duration {
        let mut b = self.bucket.lock();
        let now = Instant::now();
        let elapsed = now.duration_since(b.last).as_secs_f64();
        b.last = now;
        b.tokens = (b.tokens + elapsed * self.qps).min(self.burst) - 1.0;
        if b.tokens >= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(-b.tokens / self.qps)
        }
    }

    fn forget(&self, _key: &K) {}

    fn num_requeues(&self, _key: &K) -> u32 { 0 }
}

/// Worst case of several limiters.
pub struct MaxOfRateLimiter<K> {
    limiters: Vec<Box<dyn RateLimiter<K>>>,
}

impl<K> MaxOfRateLimiter<K> {
    pub fn new(limiters: Vec<Box<dyn RateLimiter<K>>>) -> Self { Self { limiters } }
}

impl<K> RateLimiter<K> for MaxOfRateLimiter<K> {
    fn when(&self, key: &K) -> Duration {
        self.limiters.iter().map(|l| l.when(key)).max().unwrap_or(Duration::ZERO)
    }

    fn forget(&self, key: &K) {
        for l in &self.limiters {
            l.forget(key);
        }
    }

    fn num_requeues(&self, key: &K) -> u32 {
        self.limiters.iter().map(|l| l.num_requeues(key)).max().unwrap_or(0)
    }
}

/// Per-item exponential backoff (5ms..1000s) combined with an overall 10 qps / 100 burst bucket.
pub fn default_controller_rate_limiter<K>() -> MaxOfRateLimiter<K>
where
    K: Eq + Hash + Clone + Send + 'static,
{
    MaxOfRateLimiter::new(vec![
        Box::new(ExponentialFailureRateLimiter::<K>::new(Duration::from_millis(5), Duration::from_secs(1000))),
        Box::new(BucketRateLimiter::new(10.0, 100)),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exponential_doubles_and_caps() {
        let rl = ExponentialFailureRateLimiter::new(Duration::from_millis(5), Duration::from_millis(30));
        let k = "a".to_string();
        assert_eq!(rl.when(&k), Duration::from_millis(5));
        assert_eq!(rl.when(&k), Duration::from_millis(10));
        assert_eq!(rl.when(&k), Duration::from_millis(20));
        assert_eq!(rl.when(&k), Duration::from_millis(30));
        assert_eq!(rl.num_requeues(&k), 4);
        rl.forget(&k);
        assert_eq!(rl.num_requeues(&k), 0);
        assert_eq!(rl.when(&k), Duration::from_millis(5));
    }

    #[test]
    fn exponential_is_per_item() {
        let rl = ExponentialFailureRateLimiter::new(Duration::from_millis(1), Duration::from_secs(1));
        rl.when(&1u32);
        rl.when(&1u32);
        assert_eq!(rl.num_requeues(&1), 2);
        assert_eq!(rl.num_requeues(&2), 0);
    }

    #[test]
    fn huge_exponents_saturate_at_max() {
        let rl = ExponentialFailureRateLimiter::new(Duration::from_millis(5), Duration::from_secs(1000));
        for _ in 0..64 {
            rl.when(&0u8);
        }
        assert_eq!(rl.when(&0u8), Duration::from_secs(1000));
    }

    #[test]
    fn bucket_allows_burst_then_delays() {
        let rl = BucketRateLimiter::new(10.0, 2);
        assert_eq!(RateLimiter::<u8>::when(&rl, &0), Duration::ZERO);
        assert_eq!(RateLimiter::<u8>::when(&rl, &0), Duration::ZERO);
        let d = RateLimiter::<u8>::when(&rl, &0);
        assert!(d > Duration::ZERO && d <= Duration::from_millis(100), "d={:?}", d);
    }

    #[test]
    fn max_of_reports_worst_delay_and_requeues() {
        let rl: MaxOfRateLimiter<&str> = default_controller_rate_limiter();
        assert_eq!(rl.when(&"x"), Duration::from_millis(5));
        assert_eq!(rl.when(&"x"), Duration::from_millis(10));
        assert_eq!(rl.num_requeues(&"x"), 2);
        rl.forget(&"x");
        assert_eq!(rl.num_requeues(&"x"), 0);
    }
}
