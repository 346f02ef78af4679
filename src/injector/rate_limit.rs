//! Token-bucket rate limiting.

use super::{Injector, InjectorType, Registry};
use crate::config::{ActionConfig, RateLimiterAction};
use crate::error::ChaosError;
use crate::frame::Frame;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Instant;

/// Admits `rate_limit` calls per second plus a burst of `burst_size`.
///
/// The bucket starts full (`rate + burst` tokens) on first use and refills
/// continuously; fractional refill carries over between calls.
#[derive(Debug)]
pub struct RateLimitInjector {
    rate: f64,
    burst: f64,
    bucket: Mutex<Bucket>,
}

#[derive(Debug, Default)]
struct Bucket {
    allowance: f64,
    last_check: Option<Instant>,
}

impl RateLimitInjector {
    pub fn new(action: &RateLimiterAction) -> Result<Self, ChaosError> {
        if action.rate_limit <= 0 {
            return Err(ChaosError::invalid(format!(
                "rate_limit must be greater than 0, got {}",
                action.rate_limit
            )));
        }
        Ok(Self {
            rate: action.rate_limit as f64,
            burst: action.burst_size.max(0) as f64,
            bucket: Mutex::new(Bucket::default()),
        })
    }

    fn from_config(config: &ActionConfig) -> Result<Self, ChaosError> {
        match config {
            ActionConfig::RateLimiter(action) => Self::new(action),
            other => Err(ChaosError::invalid(format!(
                "rate limiter given {} config",
                other.kind()
            ))),
        }
    }

    fn capacity(&self) -> f64 {
        self.rate + self.burst
    }

    /// Take one token at `now`.
    fn try_acquire(&self, now: Instant) -> bool {
        let mut bucket = self.bucket.lock();

        bucket.allowance = match bucket.last_check {
            None => self.capacity(),
            Some(last) => {
                let elapsed = now.saturating_duration_since(last).as_secs_f64();
                (bucket.allowance + elapsed * self.rate).min(self.capacity())
            }
        };
        bucket.last_check = Some(now);

        if bucket.allowance >= 1.0 {
            bucket.allowance -= 1.0;
            true
        } else {
            false
        }
    }
}

#[async_trait]
impl Injector for RateLimitInjector {
    async fn apply(&self, _frame: &mut Frame) -> Result<(), ChaosError> {
        if self.try_acquire(Instant::now()) {
            Ok(())
        } else {
            Err(ChaosError::RateLimitExceeded)
        }
    }
}

pub(super) fn register(registry: &Registry) {
    registry.register(InjectorType::RateLimit, |config, _| {
        Ok(Arc::new(RateLimitInjector::from_config(config)?))
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn limiter(rate_limit: i64, burst_size: i64) -> RateLimitInjector {
        RateLimitInjector::new(&RateLimiterAction {
            rate_limit,
            burst_size,
        })
        .unwrap()
    }

    #[test]
    fn test_invalid_config() {
        let err = RateLimitInjector::new(&RateLimiterAction {
            rate_limit: 0,
            burst_size: 1,
        });
        assert!(matches!(err, Err(ChaosError::InvalidConfig(_))));

        let wrong = RateLimitInjector::from_config(&ActionConfig::Delay(Default::default()));
        assert!(matches!(wrong, Err(ChaosError::InvalidConfig(_))));
    }

    #[test]
    fn test_negative_burst_clamped() {
        let rl = limiter(1, -3);
        let now = Instant::now();
        assert!(rl.try_acquire(now));
        assert!(!rl.try_acquire(now));
    }

    #[test]
    fn test_allow_within_limit() {
        let rl = limiter(2, 1);
        let now = Instant::now();
        for _ in 0..3 {
            assert!(rl.try_acquire(now));
        }
        assert!(!rl.try_acquire(now));
    }

    #[test]
    fn test_refill_is_capped() {
        let rl = limiter(1, 1);
        let start = Instant::now();
        assert!(rl.try_acquire(start));

        // A long idle period never grants more than rate + burst.
        let later = start + Duration::from_secs(60);
        assert!(rl.try_acquire(later));
        assert!(rl.try_acquire(later));
        assert!(!rl.try_acquire(later));
    }

    #[test]
    fn test_fractional_refill_accumulates() {
        let rl = limiter(1, 0);
        let start = Instant::now();
        assert!(rl.try_acquire(start));
        assert!(!rl.try_acquire(start + Duration::from_millis(500)));
        assert!(rl.try_acquire(start + Duration::from_millis(1000)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_callers_share_one_bucket() {
        let rl = Arc::new(limiter(5, 0));
        let start = Arc::new(tokio::sync::Barrier::new(20));

        let mut tasks = Vec::new();
        for _ in 0..20 {
            let rl = rl.clone();
            let start = start.clone();
            tasks.push(tokio::spawn(async move {
                start.wait().await;
                let mut frame = Frame::new("svc", "m");
                rl.apply(&mut frame).await.is_ok()
            }));
        }

        let mut admitted = 0;
        for task in tasks {
            if task.await.unwrap() {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 5);
    }

    #[tokio::test]
    async fn test_refill_after_sleep() {
        let rl = limiter(1, 0);
        let mut frame = Frame::new("svc", "m");

        tokio_test::assert_ok!(rl.apply(&mut frame).await);
        assert!(matches!(
            rl.apply(&mut frame).await,
            Err(ChaosError::RateLimitExceeded)
        ));

        tokio::time::sleep(Duration::from_millis(1100)).await;
        tokio_test::assert_ok!(rl.apply(&mut frame).await);
    }
}
