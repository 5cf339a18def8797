//! Per-IP token-bucket rate limiter for the seckill edge.

use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::debug;

pub struct IpRateLimiter {
    buckets: DashMap<String, TokenBucket>,
    per_sec: u32,
    burst: u32,
    idle_max: Duration,
}

impl IpRateLimiter {
    pub fn new(per_sec: u32, burst: u32, idle_max: Duration) -> Self {
        Self {
            buckets: DashMap::new(),
            per_sec,
            burst: burst.max(per_sec),
            idle_max,
        }
    }

    pub fn enabled(&self) -> bool {
        self.per_sec > 0
    }

    pub fn try_acquire(&self, ip: &str) -> bool {
        if !self.enabled() {
            return true;
        }
        let bucket = self
            .buckets
            .entry(ip.to_string())
            .or_insert_with(|| TokenBucket::new(self.per_sec, self.burst));
        bucket.try_acquire()
    }

    /// Remove only buckets that have been idle past the window; active
    /// clients keep their state.
    pub fn sweep_stale(&self) -> usize {
        let before = self.buckets.len();
        let idle_max = self.idle_max;
        self.buckets.retain(|_, bucket| !bucket.idle_longer_than(idle_max));
        let removed = before - self.buckets.len();
        if removed > 0 {
            debug!(removed, "stale rate limit buckets swept");
        }
        removed
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }
}

struct TokenBucket {
    per_sec: f64,
    burst: f64,
    state: Mutex<BucketState>,
}

struct BucketState {
    tokens: f64,
    last_refill: Instant,
    last_seen: Instant,
}

impl TokenBucket {
    fn new(per_sec: u32, burst: u32) -> Self {
        let now = Instant::now();
        Self {
            per_sec: f64::from(per_sec),
            burst: f64::from(burst),
            state: Mutex::new(BucketState {
                tokens: f64::from(burst),
                last_refill: now,
                last_seen: now,
            }),
        }
    }

    fn try_acquire(&self) -> bool {
        let mut state = self.state.lock();
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.per_sec).min(self.burst);
        state.last_refill = now;
        state.last_seen = now;
        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    fn idle_longer_than(&self, idle_max: Duration) -> bool {
        self.state.lock().last_seen.elapsed() > idle_max
    }
}
