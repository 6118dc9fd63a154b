//! Token bucket rate limiter for the Dump Scheduler's `maxRate` option
//! (bytes/sec, `0` meaning unlimited).

use std::sync::Mutex;
use std::time::{Duration, Instant};

use tokio::time::sleep;

/// Shared across all dump worker tasks; `acquire` blocks the calling
/// task until enough tokens (bytes) have accumulated.
pub struct RateLimiter {
    inner: Option<Mutex<Bucket>>,
}

struct Bucket {
    capacity: f64,
    tokens: f64,
    rate_per_sec: f64,
    last_refill: Instant,
}

impl RateLimiter {
    /// `rate_per_sec == 0` disables limiting entirely; `acquire` then
    /// returns immediately.
    pub fn new(rate_per_sec: u64) -> Self {
        if rate_per_sec == 0 {
            return Self { inner: None };
        }
        let capacity = rate_per_sec as f64;
        Self {
            inner: Some(Mutex::new(Bucket {
                capacity,
                tokens: capacity,
                rate_per_sec: rate_per_sec as f64,
                last_refill: Instant::now(),
            })),
        }
    }

    pub fn unlimited() -> Self {
        Self { inner: None }
    }

    /// Blocks until `bytes` tokens are available, then consumes them.
    pub async fn acquire(&self, bytes: u64) {
        let Some(bucket) = &self.inner else {
            return;
        };
        loop {
            let wait = {
                let mut b = bucket.lock().expect("rate limiter mutex poisoned");
                b.refill();
                if b.tokens >= bytes as f64 {
                    b.tokens -= bytes as f64;
                    None
                } else {
                    let deficit = bytes as f64 - b.tokens;
                    Some(Duration::from_secs_f64(deficit / b.rate_per_sec))
                }
            };
            match wait {
                None => return,
                Some(d) => sleep(d).await,
            }
        }
    }
}

impl Bucket {
    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate_per_sec).min(self.capacity);
        self.last_refill = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unlimited_never_blocks() {
        let limiter = RateLimiter::unlimited();
        let start = Instant::now();
        limiter.acquire(1_000_000_000).await;
        assert!(start.elapsed() < Duration::from_millis(50));
    }

    #[tokio::test(start_paused = true)]
    async fn token_bucket_respects_rate() {
        let limiter = RateLimiter::new(1000);
        limiter.acquire(1000).await;
        let before = Instant::now();
        limiter.acquire(1000).await;
        assert!(before.elapsed() >= Duration::from_millis(900));
    }
}
