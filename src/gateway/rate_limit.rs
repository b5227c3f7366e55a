// Token bucket shared by every caller of one credential set

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::time::sleep;

#[derive(Debug)]
pub struct TokenBucket {
    capacity: f64,
    tokens: f64,
    refill_per_sec: f64,
    last_refill: Instant,
}

impl TokenBucket {
    pub fn new(capacity: u32, refill_per_sec: f64) -> Self {
        Self {
            capacity: capacity as f64,
            tokens: capacity as f64,
            refill_per_sec,
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        self.last_refill = now;
    }

    pub fn try_acquire(&mut self, tokens: f64) -> bool {
        self.try_acquire_at(tokens, Instant::now())
    }

    pub fn try_acquire_at(&mut self, tokens: f64, now: Instant) -> bool {
        self.refill(now);
        if self.tokens >= tokens {
            self.tokens -= tokens;
            true
        } else {
            false
        }
    }

    /// Time until `tokens` will be available
    pub fn wait_time(&self, tokens: f64) -> Duration {
        if self.tokens >= tokens || self.refill_per_sec <= 0.0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64((tokens - self.tokens) / self.refill_per_sec)
    }

    pub fn available(&self) -> f64 {
        self.tokens
    }
}

/// Cloneable handle to one bucket, shared by all symbol runners
#[derive(Debug, Clone)]
pub struct SharedRateLimiter {
    bucket: Arc<Mutex<TokenBucket>>,
}

impl SharedRateLimiter {
    pub fn new(capacity: u32, refill_per_sec: f64) -> Self {
        Self {
            bucket: Arc::new(Mutex::new(TokenBucket::new(capacity, refill_per_sec))),
        }
    }

    pub fn try_acquire(&self) -> bool {
        let mut bucket = self.bucket.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        bucket.try_acquire(1.0)
    }

    /// Wait until a token is available
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut bucket = self.bucket.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
                if bucket.try_acquire(1.0) {
                    return;
                }
                bucket.wait_time(1.0)
            };
            sleep(wait.max(Duration::from_millis(1))).await;
        }
    }
}
