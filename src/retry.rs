use std::future::Future;
use std::time::Duration;

pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Errors that know whether another attempt could succeed.
pub trait Retryable {
    fn is_transient(&self) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry { delay: Duration },
    GiveUp,
}

/// Fixed-delay retry policy: up to `max_retries` extra attempts after the first one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_retries: DEFAULT_MAX_RETRIES, delay: DEFAULT_RETRY_DELAY }
    }
}

/// The error of the final attempt, plus how many attempts were made in total.
#[derive(Debug)]
pub struct Exhausted<E> {
    pub error: E,
    pub attempts: u32,
}

impl RetryPolicy {
    /// `attempt` is 1-based: the number of attempts already made when `error` was observed.
    pub fn decide<E: Retryable>(&self, attempt: u32, error: &E) -> RetryDecision {
        if error.is_transient() && attempt <= self.max_retries {
            RetryDecision::Retry { delay: self.delay }
        } else {
            RetryDecision::GiveUp
        }
    }

    pub async fn run<T, E, F, Fut>(&self, mut operation: F) -> Result<T, Exhausted<E>>
    where
        E: Retryable + std::fmt::Display,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let error = match operation().await {
                Ok(value) => return Ok(value),
                Err(e) => e,
            };
            match self.decide(attempt, &error) {
                RetryDecision::Retry { delay } => {
                    tracing::warn!(
                        attempt,
                        max_retries = self.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        "retrying upstream call: {}",
                        error
                    );
                    tokio::time::sleep(delay).await;
                }
                RetryDecision::GiveUp => return Err(Exhausted { error, attempts: attempt }),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[derive(Debug, PartialEq)]
    enum FakeError {
        Timeout,
        Denied,
    }

    impl std::fmt::Display for FakeError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "{:?}", self)
        }
    }

    impl Retryable for FakeError {
        fn is_transient(&self) -> bool { matches!(self, FakeError::Timeout) }
    }

    #[test]
    fn decide_retries_transient_until_budget_spent() {
        let policy = RetryPolicy::default();
        for attempt in 1..=3 {
            assert_eq!(
                policy.decide(attempt, &FakeError::Timeout),
                RetryDecision::Retry { delay: Duration::from_secs(1) }
            );
        }
        assert_eq!(policy.decide(4, &FakeError::Timeout), RetryDecision::GiveUp);
    }

    #[test]
    fn decide_never_retries_permanent_errors() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.decide(1, &FakeError::Denied), RetryDecision::GiveUp);
        assert_eq!(RetryPolicy { max_retries: 0, delay: Duration::ZERO }.decide(1, &FakeError::Timeout), RetryDecision::GiveUp);
    }

    #[tokio::test(start_paused = true)]
    async fn run_makes_three_retries_one_second_apart() {
        let calls = Arc::new(AtomicU32::new(0));
        let started = tokio::time::Instant::now();
        let counter = calls.clone();
        let res: Result<(), _> = RetryPolicy::default()
            .run(|| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(FakeError::Timeout)
                }
            })
            .await;
        let err = res.unwrap_err();
        assert_eq!(err.error, FakeError::Timeout);
        assert_eq!(err.attempts, 4);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(3) && elapsed < Duration::from_millis(3100), "{elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn run_stops_on_first_permanent_error() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let res: Result<(), _> = RetryPolicy::default()
            .run(|| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(FakeError::Denied)
                }
            })
            .await;
        assert_eq!(res.unwrap_err().attempts, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn run_returns_value_after_recovery() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let res = RetryPolicy::default()
            .run(|| {
                let counter = counter.clone();
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) < 2 { Err(FakeError::Timeout) } else { Ok("done") }
                }
            })
            .await;
        assert_eq!(res.unwrap(), "done");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
