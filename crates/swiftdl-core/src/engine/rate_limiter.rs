//! Token bucket shared by every transfer of an engine
//!
//! Workers charge each body chunk against the bucket before writing it,
//! which caps aggregate throughput when `speed_limit` is configured.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// Largest single charge; bigger chunks are paid for in slices no larger
/// than the bucket
const MAX_CHARGE: u64 = 64 * 1024;

/// Longest a caller sleeps before re-checking the bucket
const MAX_WAIT: Duration = Duration::from_millis(50);

#[derive(Clone)]
pub struct RateLimiter {
    bucket: Option<Arc<Mutex<Bucket>>>,
}

struct Bucket {
    /// Tokens added per second, also the bucket capacity
    rate: f64,
    tokens: f64,
    last_refill: Instant,
}

impl Bucket {
    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate).min(self.rate);
        self.last_refill = now;
    }
}

impl RateLimiter {
    /// Limit to `bytes_per_second`; `None` means unlimited
    pub fn new(limit: Option<u64>) -> Self {
        let bucket = limit.filter(|l| *l > 0).map(|rate| {
            Arc::new(Mutex::new(Bucket {
                rate: rate as f64,
                tokens: rate as f64,
                last_refill: Instant::now(),
            }))
        });
        Self { bucket }
    }

    pub fn unlimited() -> Self {
        Self { bucket: None }
    }

    pub fn is_unlimited(&self) -> bool {
        self.bucket.is_none()
    }

    /// Wait until `bytes` may pass
    pub async fn acquire(&self, bytes: u64) {
        let Some(bucket) = &self.bucket else {
            return;
        };

        let mut remaining = bytes;
        while remaining > 0 {
            let wait = {
                let mut state = bucket.lock().await;
                state.refill();
                let slice = remaining.min(MAX_CHARGE).min(state.rate as u64).max(1);
                if state.tokens >= slice as f64 {
                    state.tokens -= slice as f64;
                    remaining -= slice;
                    continue;
                }
                Duration::from_secs_f64((slice as f64 - state.tokens) / state.rate).min(MAX_WAIT)
            };
            tokio::time::sleep(wait).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_rate_limiter_basic() {
        let limiter = RateLimiter::new(Some(1000)); // 1KB/s

        let start = Instant::now();
        limiter.acquire(500).await;
        limiter.acquire(500).await;
        assert!(start.elapsed().as_millis() < 50);

        limiter.acquire(500).await; // bucket empty, ~0.5s
        assert!(start.elapsed().as_millis() >= 400);
    }

    #[tokio::test(start_paused = true)]
    async fn test_charges_larger_than_rate_pay_in_full() {
        let limiter = RateLimiter::new(Some(10_000));

        let start = Instant::now();
        limiter.acquire(81_920).await;
        limiter.acquire(81_920).await;
        // 163_840 bytes with a 10_000 byte head start
        assert!(start.elapsed() >= Duration::from_millis(15_300), "{:?}", start.elapsed());
        assert!(start.elapsed() < Duration::from_secs(17));
    }

    #[tokio::test]
    async fn test_rate_limiter_unlimited() {
        let limiter = RateLimiter::new(None);
        assert!(limiter.is_unlimited());

        let start = Instant::now();
        for _ in 0..100 {
            limiter.acquire(10_000_000).await;
        }
        assert!(start.elapsed().as_millis() < 50);
    }
}
