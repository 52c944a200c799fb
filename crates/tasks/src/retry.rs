//! Exponential backoff with jitter.

use std::future::Future;
use std::time::Duration;

use rand::random;
use taskmind_config::RetryConfig;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    pub jitter: f64,
}

/// Why [`RetryPolicy::run`] gave up.
#[derive(Debug, Clone, PartialEq)]
pub enum RetryError<E> {
    /// The operation failed with an error not worth retrying.
    Fatal(E),
    /// Every attempt failed with a retryable error.
    Exhausted { attempts: u32, last: E },
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            initial_delay: Duration::from_millis(config.initial_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            multiplier: config.multiplier,
            jitter: 0.1,
        }
    }

    /// Delay before retry number `attempt + 1` (zero-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.initial_delay.as_secs_f64() * self.multiplier.powi(attempt as i32);
        let jitter_factor = 1.0 + (random::<f64>() - 0.5) * 2.0 * self.jitter;
        let jittered = base * jitter_factor;
        let clamped = jittered.min(self.max_delay.as_secs_f64()).max(0.0);
        Duration::from_secs_f64(clamped)
    }

    /// Run `operation` until it succeeds, fails with an error `retryable`
    /// rejects, or `max_attempts` is used up.
    pub async fn run<T, E, F, Fut>(
        &self,
        operation: F,
        retryable: impl Fn(&E) -> bool,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        self.run_with_hint(operation, retryable, |_| None).await
    }

    /// Like [`run`](Self::run), but never waits less than the delay
    /// `retry_after` reads off the failed attempt.
    pub async fn run_with_hint<T, E, F, Fut>(
        &self,
        mut operation: F,
        retryable: impl Fn(&E) -> bool,
        retry_after: impl Fn(&E) -> Option<Duration>,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        let mut attempt = 0;
        loop {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(e) if !retryable(&e) => return Err(RetryError::Fatal(e)),
                Err(e) => {
                    attempt += 1;
                    if attempt >= self.max_attempts {
                        return Err(RetryError::Exhausted { attempts: attempt, last: e });
                    }
                    let backoff = self.delay_for_attempt(attempt - 1);
                    let delay = retry_after(&e).map_or(backoff, |hint| hint.max(backoff));
                    debug!(attempt, delay_ms = delay.as_millis() as u64, error = %e, "Retrying");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::from_config(&RetryConfig {
            max_attempts,
            initial_delay_ms: 100,
            max_delay_ms: 1000,
            multiplier: 2.0,
        })
    }

    #[test]
    fn delays_grow_and_are_capped() {
        let p = policy(5);
        let first = p.delay_for_attempt(0).as_millis();
        assert!((90..=110).contains(&first), "{first}");
        let third = p.delay_for_attempt(2).as_millis();
        assert!((360..=440).contains(&third), "{third}");
        assert!(p.delay_for_attempt(10) <= Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let result = policy(4)
            .run(
                move || async move {
                    let n = counter.fetch_add(1, Ordering::SeqCst);
                    if n < 2 { Err("busy") } else { Ok(n) }
                },
                |_| true,
            )
            .await;
        assert_eq!(result, Ok(2));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_max_attempts() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let result: Result<(), _> = policy(3)
            .run(
                move || async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err("busy")
                },
                |_| true,
            )
            .await;
        assert_eq!(result, Err(RetryError::Exhausted { attempts: 3, last: "busy" }));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn provider_hint_extends_backoff() {
        let start = tokio::time::Instant::now();
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let result = policy(3)
            .run_with_hint(
                move || async move {
                    let n = counter.fetch_add(1, Ordering::SeqCst);
                    if n == 0 { Err("slow down") } else { Ok(n) }
                },
                |_| true,
                |_| Some(Duration::from_secs(7)),
            )
            .await;
        assert_eq!(result, Ok(1));
        assert!(start.elapsed() >= Duration::from_secs(7), "{:?}", start.elapsed());
    }

    #[tokio::test(start_paused = true)]
    async fn short_hint_keeps_backoff() {
        let start = tokio::time::Instant::now();
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let result = policy(3)
            .run_with_hint(
                move || async move {
                    let n = counter.fetch_add(1, Ordering::SeqCst);
                    if n == 0 { Err("slow down") } else { Ok(n) }
                },
                |_| true,
                |_| Some(Duration::ZERO),
            )
            .await;
        assert_eq!(result, Ok(1));
        assert!(start.elapsed() >= Duration::from_millis(90), "{:?}", start.elapsed());
    }

    #[tokio::test]
    async fn fatal_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let result: Result<(), _> = policy(5)
            .run(
                move || async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err("bad input")
                },
                |e| *e != "bad input",
            )
            .await;
        assert_eq!(result, Err(RetryError::Fatal("bad input")));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
