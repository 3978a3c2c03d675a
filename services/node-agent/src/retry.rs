//! Exponential backoff with full jitter.

use std::future::Future;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::client::ClientError;

/// Retry configuration for transient fleet errors.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Delay cap for the first retry.
    pub base: Duration,

    /// Growth factor per attempt.
    pub multiplier: f64,

    /// Upper bound on any single delay.
    pub max_delay: Duration,

    /// Give up after this many attempts. `None` retries forever.
    pub max_tries: Option<u32>,

    /// Give up once this much time has passed since the first attempt.
    pub max_time: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(200),
            multiplier: 2.0,
            max_delay: Duration::from_secs(30),
            max_tries: None,
            max_time: None,
        }
    }
}

impl RetryPolicy {
    /// Bounded policy for one-shot calls.
    pub fn bounded(max_tries: u32) -> Self {
        Self {
            max_tries: Some(max_tries),
            ..Self::default()
        }
    }

    /// Upper bound of the delay after `attempt` failures (0-based).
    pub fn ceiling(&self, attempt: u32) -> Duration {
        let exp = i32::try_from(attempt).unwrap_or(i32::MAX);
        let secs = self.base.as_secs_f64() * self.multiplier.powi(exp);
        let capped = secs.min(self.max_delay.as_secs_f64());
        Duration::try_from_secs_f64(capped).unwrap_or(self.max_delay)
    }

    /// Jittered delay in `[0, ceiling(attempt)]`.
    pub fn delay(&self, attempt: u32) -> Duration {
        self.ceiling(attempt).mul_f64(rand::random::<f64>())
    }

    /// Runs `op` until it succeeds, fails permanently, or the policy gives up.
    ///
    /// A `NotReady` hint from the coordinator is used as a lower bound on the
    /// wait.
    pub async fn run<T, F, Fut>(&self, name: &str, mut op: F) -> Result<T, ClientError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ClientError>>,
    {
        let started = Instant::now();
        let mut attempt = 0u32;

        loop {
            let err = match op().await {
                Ok(value) => return Ok(value),
                Err(err) if !err.is_transient() => return Err(err),
                Err(err) => err,
            };

            attempt += 1;
            if self.max_tries.is_some_and(|max| attempt >= max) {
                warn!(op = name, attempts = attempt, error = %err, "Giving up after retries");
                return Err(err);
            }

            let mut wait = self.delay(attempt - 1);
            if let ClientError::NotReady { retry_after } = &err {
                wait = wait.max(*retry_after);
            }
            if let Some(max_time) = self.max_time {
                if started.elapsed() + wait > max_time {
                    warn!(op = name, attempts = attempt, error = %err, "Retry budget exhausted");
                    return Err(err);
                }
            }

            debug!(op = name, attempt, wait_ms = wait.as_millis() as u64, error = %err, "Retrying");
            tokio::time::sleep(wait).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast(max_tries: Option<u32>) -> RetryPolicy {
        RetryPolicy {
            base: Duration::from_millis(1),
            multiplier: 2.0,
            max_delay: Duration::from_millis(5),
            max_tries,
            max_time: None,
        }
    }

    #[test]
    fn test_ceiling_grows_and_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.ceiling(0), Duration::from_millis(200));
        assert_eq!(policy.ceiling(1), Duration::from_millis(400));
        assert_eq!(policy.ceiling(3), Duration::from_millis(1600));
        assert_eq!(policy.ceiling(20), Duration::from_secs(30));
        assert_eq!(policy.ceiling(u32::MAX), Duration::from_secs(30));
    }

    #[test]
    fn test_delay_within_ceiling() {
        let policy = RetryPolicy::default();
        for attempt in 0..10 {
            assert!(policy.delay(attempt) <= policy.ceiling(attempt));
        }
    }

    #[tokio::test]
    async fn test_retries_transient_until_success() {
        let calls = AtomicU32::new(0);
        let result = fast(Some(5))
            .run("flaky", || async {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(ClientError::Unavailable("busy".into()))
                } else {
                    Ok(7)
                }
            })
            .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_error_is_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = fast(None)
            .run("gone", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(ClientError::NodeExpired("evicted".into()))
            })
            .await;

        assert!(matches!(result, Err(ClientError::NodeExpired(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_tries() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = fast(Some(3))
            .run("down", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(ClientError::Unavailable("down".into()))
            })
            .await;

        assert!(matches!(result, Err(ClientError::Unavailable(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_not_ready_hint_is_a_floor() {
        let calls = AtomicU32::new(0);
        let started = Instant::now();
        let result = fast(Some(3))
            .run("reserved", || async {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(ClientError::NotReady {
                        retry_after: Duration::from_millis(100),
                    })
                } else {
                    Ok(())
                }
            })
            .await;

        assert!(result.is_ok());
        assert!(started.elapsed() >= Duration::from_millis(100));
    }
}
