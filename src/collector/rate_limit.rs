//! Token-bucket rate limiter
//!
//! Tokens refill continuously at `rate` per second up to `burst`. A caller that
//! finds the bucket empty reserves the next token anyway, driving the balance
//! negative, and sleeps until that token would have been minted. Reservations
//! are handed out under a FIFO lock, so waiters are served in arrival order and
//! none is starved under sustained load. A cancelled wait gives its token back.

use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::Cancelled;

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// Shared limiter for outbound API calls. Cheap to share behind an `Arc`.
#[derive(Debug)]
pub struct RateLimiter {
    /// Tokens per second; `None` disables limiting
    rate: Option<f64>,
    burst: f64,
    bucket: Mutex<Bucket>,
}

impl RateLimiter {
    /// Limiter with the given sustained rate (per second) and burst size.
    /// A non-positive or non-finite `rate` disables limiting.
    pub fn new(rate: f64, burst: u32) -> Self {
        let burst = f64::from(burst.max(1));
        Self {
            rate: (rate.is_finite() && rate > 0.0).then_some(rate),
            burst,
            bucket: Mutex::new(Bucket {
                tokens: burst,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Limiter with a burst of twice the rate, rounded down, at least 1.
    pub fn per_second(rate: f64) -> Self {
        let burst = if rate.is_finite() && rate > 0.0 {
            (rate * 2.0) as u32
        } else {
            1
        };
        Self::new(rate, burst)
    }

    /// Limiter that never waits
    pub fn unlimited() -> Self {
        Self::new(0.0, 1)
    }

    pub fn rate(&self) -> Option<f64> {
        self.rate
    }

    /// Wait for one token, or return [`Cancelled`] if `cancel` fires first.
    pub async fn wait(&self, cancel: &CancellationToken) -> Result<(), Cancelled> {
        let Some(rate) = self.rate else {
            return if cancel.is_cancelled() {
                Err(Cancelled)
            } else {
                Ok(())
            };
        };

        let delay = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Cancelled),
            delay = self.reserve(rate) => delay,
        };

        if delay.is_zero() {
            return Ok(());
        }

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                self.bucket.lock().await.tokens += 1.0;
                Err(Cancelled)
            }
            _ = tokio::time::sleep(delay) => Ok(()),
        }
    }

    /// Take one token and return how long the caller must wait before using it.
    async fn reserve(&self, rate: f64) -> Duration {
        let mut bucket = self.bucket.lock().await;

        let now = Instant::now();
        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * rate).min(self.burst);
        bucket.last_refill = now;

        bucket.tokens -= 1.0;
        if bucket.tokens >= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(-bucket.tokens / rate)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_burst_is_immediate() {
        let limiter = RateLimiter::new(1.0, 5);
        let cancel = CancellationToken::new();
        let start = Instant::now();

        for _ in 0..5 {
            limiter.wait(&cancel).await.unwrap();
        }
        assert!(start.elapsed() < Duration::from_millis(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sustained_rate_is_enforced() {
        let limiter = RateLimiter::new(10.0, 1);
        let cancel = CancellationToken::new();
        let start = Instant::now();

        // First token comes from the burst, the next 10 at 100ms intervals
        for _ in 0..11 {
            limiter.wait(&cancel).await.unwrap();
        }
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(990), "elapsed {elapsed:?}");
        assert!(elapsed < Duration::from_millis(1100), "elapsed {elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_waiters_all_get_tokens() {
        let limiter = Arc::new(RateLimiter::per_second(5.0));
        let cancel = CancellationToken::new();
        let start = Instant::now();

        let mut handles = Vec::new();
        for _ in 0..20 {
            let limiter = limiter.clone();
            let cancel = cancel.clone();
            handles.push(tokio::spawn(async move { limiter.wait(&cancel).await }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        // 10 burst tokens, then 10 more at 5/s
        assert!(start.elapsed() >= Duration::from_millis(1990));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_while_waiting() {
        let limiter = RateLimiter::new(0.1, 1);
        let cancel = CancellationToken::new();
        limiter.wait(&cancel).await.unwrap();

        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            canceller.cancel();
        });

        let start = Instant::now();
        assert_eq!(limiter.wait(&cancel).await, Err(Cancelled));
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_unlimited_never_waits_but_honours_cancel() {
        let limiter = RateLimiter::unlimited();
        let cancel = CancellationToken::new();
        for _ in 0..1000 {
            limiter.wait(&cancel).await.unwrap();
        }
        assert_eq!(limiter.rate(), None);

        cancel.cancel();
        assert_eq!(limiter.wait(&cancel).await, Err(Cancelled));
    }

    #[test]
    fn test_per_second_burst_is_double_rate() {
        let limiter = RateLimiter::per_second(10.0);
        assert_eq!(limiter.burst, 20.0);
        assert_eq!(RateLimiter::per_second(0.2).burst, 1.0);
    }
}
