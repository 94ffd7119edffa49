//! Exponential backoff with jitter around a repeatable unit of work.
//!
//! The engine assumes the wrapped operation is safe to repeat; generation
//! calls are read-like from the client's perspective, so that holds here.

use crate::error::{GeminiError, Result};
use rand::Rng;
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Number of retries after the initial attempt.
    pub attempts: u32,
    /// Delay before the first retry; doubles on each subsequent one.
    pub base_delay: Duration,
    /// Ceiling applied before jitter so delays never grow unbounded.
    pub max_delay: Duration,
    /// Symmetric jitter fraction (0.0 to 1.0) applied to each delay.
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            jitter_factor: 0.1,
        }
    }
}

impl RetryPolicy {
    pub const fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }

    pub const fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    pub const fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn with_jitter_factor(mut self, factor: f64) -> Self {
        self.jitter_factor = factor.clamp(0.0, 1.0);
        self
    }

    /// Delay before retry `retry_index` (0 = first retry): capped
    /// exponential, then jitter.
    pub fn delay_for(&self, retry_index: u32) -> Duration {
        self.add_jitter(self.base_delay_for(retry_index))
    }

    fn base_delay_for(&self, retry_index: u32) -> Duration {
        let millis =
            self.base_delay.as_millis() as f64 * 2f64.powi(retry_index.min(i32::MAX as u32) as i32);
        Duration::from_millis(millis as u64).min(self.max_delay)
    }

    fn add_jitter(&self, delay: Duration) -> Duration {
        if self.jitter_factor <= 0.0 {
            return delay;
        }
        let mut rng = rand::thread_rng();
        let range = delay.as_millis() as f64 * self.jitter_factor;
        let jitter = rng.gen_range(-range..=range);
        Duration::from_millis((delay.as_millis() as f64 + jitter).max(0.0) as u64)
    }

    /// Run `op` up to `attempts + 1` times. Terminal errors abort
    /// immediately; retryable ones back off and repeat. On exhaustion the
    /// last error is returned wrapped with the total invocation count.
    /// The cancellation token, when given, is raced against both the
    /// attempt itself and the backoff sleep; no attempt runs after it fires.
    pub async fn run<F, Fut, T>(&self, cancel: Option<&CancellationToken>, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let total = self.attempts + 1;
        let mut last_error = None;

        for attempt in 1..=total {
            let outcome = match cancel {
                // Biased so a fired token always wins; no attempt starts
                // after cancellation.
                Some(token) => tokio::select! {
                    biased;
                    _ = token.cancelled() => return Err(GeminiError::Cancelled),
                    outcome = op() => outcome,
                },
                None => op().await,
            };

            match outcome {
                Ok(value) => return Ok(value),
                Err(e) if !e.is_retryable() => return Err(e),
                Err(e) => {
                    tracing::warn!(attempt, total, error = %e, "attempt failed");
                    last_error = Some(e);
                }
            }

            if attempt == total {
                break;
            }

            let delay = self.delay_for(attempt - 1);
            tracing::debug!(attempt, delay_ms = delay.as_millis() as u64, "backing off");
            match cancel {
                Some(token) => tokio::select! {
                    biased;
                    _ = token.cancelled() => return Err(GeminiError::Cancelled),
                    _ = sleep(delay) => {}
                },
                None => sleep(delay).await,
            }
        }

        let source = last_error
            .unwrap_or_else(|| GeminiError::Transient("retry loop ended without error".to_string()));
        Err(GeminiError::RetryExhausted {
            attempts: total,
            source: Box::new(source),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy(attempts: u32) -> RetryPolicy {
        RetryPolicy::default()
            .with_attempts(attempts)
            .with_base_delay(Duration::from_millis(1))
            .with_jitter_factor(0.0)
    }

    #[tokio::test]
    async fn retryable_failure_consumes_all_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls2 = calls.clone();

        let result: Result<()> = fast_policy(3)
            .run(None, || {
                let calls = calls2.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(GeminiError::Transient("boom".to_string()))
                }
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 4);
        match result.unwrap_err() {
            GeminiError::RetryExhausted { attempts, source } => {
                assert_eq!(attempts, 4);
                assert!(matches!(*source, GeminiError::Transient(_)));
            }
            other => panic!("expected RetryExhausted, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn zero_retries_still_makes_one_attempt() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls2 = calls.clone();

        let result: Result<()> = fast_policy(0)
            .run(None, || {
                let calls = calls2.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(GeminiError::RateLimit("quota".to_string()))
                }
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(
            result.unwrap_err(),
            GeminiError::RetryExhausted { attempts: 1, .. }
        ));
    }

    #[tokio::test]
    async fn terminal_error_is_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls2 = calls.clone();

        let result: Result<()> = fast_policy(5)
            .run(None, || {
                let calls = calls2.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(GeminiError::Auth("bad key".to_string()))
                }
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(result.unwrap_err(), GeminiError::Auth(_)));
    }

    #[tokio::test]
    async fn succeeds_after_transient_failures() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls2 = calls.clone();

        let result = fast_policy(3)
            .run(None, || {
                let calls = calls2.clone();
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(GeminiError::Transient("flaky".to_string()))
                    } else {
                        Ok("done")
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), "done");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn cancelled_token_stops_before_first_attempt() {
        let token = CancellationToken::new();
        token.cancel();
        let calls = Arc::new(AtomicU32::new(0));
        let calls2 = calls.clone();

        let result: Result<()> = fast_policy(3)
            .run(Some(&token), || {
                let calls = calls2.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(GeminiError::Transient("never".to_string()))
                }
            })
            .await;

        assert!(matches!(result.unwrap_err(), GeminiError::Cancelled));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn cancellation_during_backoff_stops_further_attempts() {
        let token = CancellationToken::new();
        let calls = Arc::new(AtomicU32::new(0));
        let calls2 = calls.clone();
        let token2 = token.clone();

        // The op cancels the token as it fails, so the token is fired by
        // the time the backoff sleep begins.
        let result: Result<()> = fast_policy(3)
            .run(Some(&token), || {
                let calls = calls2.clone();
                let token = token2.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    token.cancel();
                    Err(GeminiError::Transient("reset".to_string()))
                }
            })
            .await;

        assert!(matches!(result.unwrap_err(), GeminiError::Cancelled));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn delays_double_and_cap_without_jitter() {
        let policy = RetryPolicy::default()
            .with_base_delay(Duration::from_millis(100))
            .with_max_delay(Duration::from_millis(500))
            .with_jitter_factor(0.0);

        assert_eq!(policy.delay_for(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for(2), Duration::from_millis(400));
        assert_eq!(policy.delay_for(3), Duration::from_millis(500));
        assert_eq!(policy.delay_for(10), Duration::from_millis(500));
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let policy = RetryPolicy::default()
            .with_base_delay(Duration::from_millis(1000))
            .with_jitter_factor(0.1);

        for _ in 0..100 {
            let d = policy.delay_for(0).as_millis();
            assert!((900..=1100).contains(&d), "delay {d}ms outside jitter band");
        }
    }
}
