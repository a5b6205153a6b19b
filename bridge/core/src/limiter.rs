//! A token-bucket limiter guarding cluster-API throughput. One instance is
//! shared process-wide by every connector; the workqueue keeps its own.

use parking_lot::Mutex;
use std::sync::Arc;
use tokio::time::{Duration, Instant};

#[derive(Debug)]
struct State {
    tokens: f64,
    last: Instant,
}

#[derive(Clone, Debug)]
pub struct RateLimiter {
    limit: f64,
    burst: f64,
    state: Arc<Mutex<State>>,
}

impl RateLimiter {
    /// `limit` tokens per second, bucket capped at `burst`. The bucket
    /// starts full.
    pub fn new(limit: u32, burst: u32) -> Self {
        let burst = f64::from(burst.max(1));
        Self {
            limit: f64::from(limit.max(1)),
            burst,
            state: Arc::new(Mutex::new(State {
                tokens: burst,
                last: Instant::now(),
            })),
        }
    }

    fn try_take(&self) -> Result<(), Duration> {
        let mut state = self.state.lock();
        let now = Instant::now();
        let elapsed = now.duration_since(state.last).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.limit).min(self.burst);
        state.last = now;
        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            Ok(())
        } else {
            Err(Duration::from_secs_f64((1.0 - state.tokens) / self.limit))
        }
    }

    /// Suspends until a token is available.
    pub async fn acquire(&self) {
        loop {
            match self.try_take() {
                Ok(()) => return,
                Err(wait) => tokio::time::sleep(wait).await,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn burst_then_throttle() {
        let limiter = RateLimiter::new(10, 3);
        let start = Instant::now();
        for _ in 0..3 {
            limiter.acquire().await;
        }
        assert_eq!(start.elapsed(), Duration::ZERO);

        limiter.acquire().await;
        assert!(start.elapsed() >= Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn refills_to_burst_only() {
        let limiter = RateLimiter::new(1000, 2);
        limiter.acquire().await;
        limiter.acquire().await;
        tokio::time::sleep(Duration::from_secs(60)).await;
        let start = Instant::now();
        limiter.acquire().await;
        limiter.acquire().await;
        assert_eq!(start.elapsed(), Duration::ZERO);
        limiter.acquire().await;
        assert!(start.elapsed() >= Duration::from_millis(1));
    }
}
