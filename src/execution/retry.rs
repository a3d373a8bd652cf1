use crate::errors::{EngineError, EngineResult};
use portable_atomic::{AtomicU64, Ordering};
use std::future::Future;
use std::time::Duration;

/// Bounded exponential back-off for transient store failures.
///
/// delay(n) = base_delay * 2^(n-1) for retry n = 1..=max_retries
/// (2s, 4s, 8s with the defaults). Each attempt is also bounded by
/// `attempt_timeout`; a timeout counts as transient.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub attempt_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(2),
            attempt_timeout: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    #[inline]
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exp = retry.saturating_sub(1).min(16);
        self.base_delay.saturating_mul(1u32 << exp)
    }
}

pub struct RetryController {
    policy: RetryPolicy,
    retries: AtomicU64,
}

impl RetryController {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            retries: AtomicU64::new(0),
        }
    }

    /// Total retries performed across all operations.
    pub fn retries(&self) -> u64 {
        self.retries.load(Ordering::Relaxed)
    }

    /// Run `attempt` until it succeeds, fails permanently, or retries run out.
    ///
    /// `attempt` is called afresh every time, so it must re-read whatever
    /// preconditions it depends on instead of replaying a captured mutation.
    pub async fn run<T, F, Fut>(&self, op: &'static str, mut attempt: F) -> EngineResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = EngineResult<T>>,
    {
        let mut retries = 0u32;
        loop {
            let result = match tokio::time::timeout(self.policy.attempt_timeout, attempt()).await {
                Ok(r) => r,
                Err(_) => Err(EngineError::Timeout(format!(
                    "{op} exceeded {}ms",
                    self.policy.attempt_timeout.as_millis()
                ))),
            };

            let err = match result {
                Ok(value) => {
                    if retries > 0 {
                        tracing::info!(op, retries, "recovered after retry");
                    }
                    return Ok(value);
                }
                Err(e) => e,
            };

            if !err.is_transient() {
                return Err(err);
            }

            if retries >= self.policy.max_retries {
                tracing::error!(op, attempts = retries + 1, error = %err, "giving up");
                return Err(EngineError::RetriesExhausted {
                    op,
                    attempts: retries + 1,
                    last: Box::new(err),
                });
            }

            retries += 1;
            self.retries.fetch_add(1, Ordering::Relaxed);
            let delay = self.policy.delay_for(retries);
            tracing::warn!(
                op,
                retry = retries,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "transient failure, still trying"
            );
            tokio::time::sleep(delay).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::sync::Arc;
    use tokio::time::Instant;

    #[test]
    fn test_delays_double() {
        let p = RetryPolicy::default();
        assert_eq!(p.delay_for(1), Duration::from_secs(2));
        assert_eq!(p.delay_for(2), Duration::from_secs(4));
        assert_eq!(p.delay_for(3), Duration::from_secs(8));
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_retried_with_backoff() {
        let ctl = RetryController::new(RetryPolicy::default());
        let calls = Arc::new(AtomicU32::new(0));
        let started = Instant::now();

        let c = calls.clone();
        let out = ctl
            .run("flaky", || {
                let c = c.clone();
                async move {
                    if c.fetch_add(1, std::sync::atomic::Ordering::SeqCst) < 2 {
                        Err(EngineError::Store("connection reset".into()))
                    } else {
                        Ok(42)
                    }
                }
            })
            .await
            .unwrap();

        assert_eq!(out, 42);
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 3);
        // 2s + 4s of back-off before the third attempt.
        assert_eq!(started.elapsed(), Duration::from_secs(6));
        assert_eq!(ctl.retries(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausts_after_three_retries() {
        let ctl = RetryController::new(RetryPolicy::default());
        let calls = Arc::new(AtomicU32::new(0));
        let started = Instant::now();

        let c = calls.clone();
        let err = ctl
            .run("down", || {
                let c = c.clone();
                async move {
                    c.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                    Err::<(), _>(EngineError::Store("unreachable".into()))
                }
            })
            .await
            .unwrap_err();

        assert!(matches!(err, EngineError::RetriesExhausted { attempts: 4, .. }));
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 4);
        assert_eq!(started.elapsed(), Duration::from_secs(14));
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_error_not_retried() {
        let ctl = RetryController::new(RetryPolicy::default());
        let calls = Arc::new(AtomicU32::new(0));

        let c = calls.clone();
        let err = ctl
            .run("missing", || {
                let c = c.clone();
                async move {
                    c.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                    Err::<(), _>(EngineError::NotFound("t1".into()))
                }
            })
            .await
            .unwrap_err();

        assert!(matches!(err, EngineError::NotFound(_)));
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert_eq!(ctl.retries(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_attempt_times_out_as_transient() {
        let ctl = RetryController::new(RetryPolicy {
            max_retries: 1,
            base_delay: Duration::from_millis(10),
            attempt_timeout: Duration::from_millis(100),
        });

        let err = ctl
            .run("hang", || async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok::<(), EngineError>(())
            })
            .await
            .unwrap_err();

        match err {
            EngineError::RetriesExhausted { attempts, last, .. } => {
                assert_eq!(attempts, 2);
                assert!(matches!(*last, EngineError::Timeout(_)));
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
