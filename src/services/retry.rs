//! Exponential backoff for upstream calls
//!
//! The retry loop is split into a pure state machine (`RetryState`) that
//! decides what happens after each failure, and a thin async driver
//! (`retry_with_backoff`) that sleeps and re-invokes the operation.
//!
//! `delay(attempt) = min(initial_delay * multiplier^attempt, max_delay)`

use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;

use crate::services::providers::{UpstreamError, UpstreamResult};

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            initial_delay: Duration::from_millis(200),
            multiplier: 2.0,
            max_delay: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    /// Policy that never retries
    pub fn no_retries() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Backoff before retry number `attempt` (0-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.max(1.0).powi(attempt as i32);
        let millis = self.initial_delay.as_millis() as f64 * factor;
        let capped = millis.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped.max(0.0) as u64)
    }
}

/// What the driver should do after a failed attempt
#[derive(Debug, Clone, PartialEq)]
pub enum RetryDecision {
    RetryAfter(Duration),
    GiveUp,
}

/// Bounded retry state: how many retries were spent and what comes next
#[derive(Debug, Clone)]
pub struct RetryState {
    policy: RetryPolicy,
    retries: u32,
}

impl RetryState {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy, retries: 0 }
    }

    /// Retries performed so far
    pub fn retries(&self) -> u32 {
        self.retries
    }

    /// Records a failure and decides whether to retry it
    pub fn on_failure(&mut self, error: &UpstreamError) -> RetryDecision {
        if !error.is_retryable() || self.retries >= self.policy.max_retries {
            return RetryDecision::GiveUp;
        }
        let delay = self.policy.delay_for(self.retries);
        self.retries += 1;
        RetryDecision::RetryAfter(delay)
    }

    /// Like `on_failure`, but gives up when the backoff would not end before
    /// `remaining` runs out
    pub fn on_failure_within(&mut self, error: &UpstreamError, remaining: Duration) -> RetryDecision {
        if !error.is_retryable() || self.retries >= self.policy.max_retries {
            return RetryDecision::GiveUp;
        }
        let delay = self.policy.delay_for(self.retries);
        if delay >= remaining {
            return RetryDecision::GiveUp;
        }
        self.retries += 1;
        RetryDecision::RetryAfter(delay)
    }
}

/// Runs `operation` until it succeeds, fails with a non-retryable error, or
/// the policy's retry budget is spent.
pub async fn retry_with_backoff<T, F, Fut>(
    operation_name: &str,
    policy: &RetryPolicy,
    mut operation: F,
) -> UpstreamResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = UpstreamResult<T>>,
{
    let mut state = RetryState::new(policy.clone());

    loop {
        match operation().await {
            Ok(value) => {
                if state.retries() > 0 {
                    tracing::debug!(
                        operation = operation_name,
                        retries = state.retries(),
                        "Upstream call succeeded after retry"
                    );
                }
                return Ok(value);
            }
            Err(err) => match state.on_failure(&err) {
                RetryDecision::RetryAfter(delay) => {
                    tracing::warn!(
                        operation = operation_name,
                        attempt = state.retries(),
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Retrying upstream call after backoff"
                    );
                    tokio::time::sleep(delay).await;
                }
                RetryDecision::GiveUp => return Err(err),
            },
        }
    }
}

/// Retries `operation` like `retry_with_backoff`, but never past `deadline`.
///
/// Each attempt is capped at `call_timeout` or the time left, whichever is
/// shorter; a backoff that would outlast the deadline ends the loop with the
/// last error.
pub async fn retry_within_deadline<T, F, Fut>(
    operation_name: &str,
    policy: &RetryPolicy,
    deadline: Instant,
    call_timeout: Duration,
    mut operation: F,
) -> UpstreamResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = UpstreamResult<T>>,
{
    let mut state = RetryState::new(policy.clone());

    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(UpstreamError::Timeout);
        }

        let err = match tokio::time::timeout(call_timeout.min(remaining), operation()).await {
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(err)) => err,
            Err(_) => UpstreamError::Timeout,
        };

        let remaining = deadline.saturating_duration_since(Instant::now());
        match state.on_failure_within(&err, remaining) {
            RetryDecision::RetryAfter(delay) => {
                tracing::warn!(
                    operation = operation_name,
                    attempt = state.retries(),
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "Retrying upstream call after backoff"
                );
                tokio::time::sleep(delay).await;
            }
            RetryDecision::GiveUp => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn server_error() -> UpstreamError {
        UpstreamError::Status {
            status: 503,
            body: "unavailable".into(),
        }
    }

    #[test]
    fn test_delay_grows_exponentially_and_caps() {
        let policy = RetryPolicy {
            max_retries: 5,
            initial_delay: Duration::from_millis(100),
            multiplier: 2.0,
            max_delay: Duration::from_millis(500),
        };

        assert_eq!(policy.delay_for(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for(2), Duration::from_millis(400));
        assert_eq!(policy.delay_for(3), Duration::from_millis(500));
        assert_eq!(policy.delay_for(10), Duration::from_millis(500));
    }

    #[test]
    fn test_state_gives_up_after_max_retries() {
        let mut state = RetryState::new(RetryPolicy {
            max_retries: 2,
            ..RetryPolicy::default()
        });

        assert!(matches!(
            state.on_failure(&server_error()),
            RetryDecision::RetryAfter(_)
        ));
        assert!(matches!(
            state.on_failure(&server_error()),
            RetryDecision::RetryAfter(_)
        ));
        assert_eq!(state.on_failure(&server_error()), RetryDecision::GiveUp);
        assert_eq!(state.retries(), 2);
    }

    #[test]
    fn test_state_never_retries_client_errors_or_timeouts() {
        let mut state = RetryState::new(RetryPolicy::default());
        let not_found = UpstreamError::Status {
            status: 404,
            body: String::new(),
        };
        assert_eq!(state.on_failure(&not_found), RetryDecision::GiveUp);
        assert_eq!(state.on_failure(&UpstreamError::Timeout), RetryDecision::GiveUp);
        assert_eq!(state.retries(), 0);
    }

    #[test]
    fn test_state_retries_throttling() {
        let mut state = RetryState::new(RetryPolicy::default());
        let throttled = UpstreamError::Status {
            status: 429,
            body: String::new(),
        };
        assert_eq!(
            state.on_failure(&throttled),
            RetryDecision::RetryAfter(Duration::from_millis(200))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_with_backoff_recovers() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let result = retry_with_backoff("test_op", &RetryPolicy::default(), || {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(server_error())
                } else {
                    Ok(7)
                }
            }
        })
        .await;

        assert_eq!(result, Ok(7));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_with_backoff_returns_last_error() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let result: UpstreamResult<()> = retry_with_backoff("test_op", &RetryPolicy::default(), || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(server_error())
            }
        })
        .await;

        assert_eq!(result, Err(server_error()));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_state_gives_up_when_backoff_outlasts_remaining_time() {
        let mut state = RetryState::new(RetryPolicy::default());
        assert_eq!(
            state.on_failure_within(&server_error(), Duration::from_millis(300)),
            RetryDecision::RetryAfter(Duration::from_millis(200))
        );
        assert_eq!(
            state.on_failure_within(&server_error(), Duration::from_millis(100)),
            RetryDecision::GiveUp
        );
        assert_eq!(state.retries(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_within_deadline_stops_at_the_deadline() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let started = Instant::now();
        let policy = RetryPolicy {
            max_retries: 10,
            ..RetryPolicy::default()
        };

        let result: UpstreamResult<()> = retry_within_deadline(
            "test_op",
            &policy,
            started + Duration::from_millis(300),
            Duration::from_secs(4),
            || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(server_error())
                }
            },
        )
        .await;

        assert_eq!(result, Err(server_error()));
        assert!(started.elapsed() <= Duration::from_millis(300));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_within_deadline_caps_attempt_to_time_left() {
        let started = Instant::now();
        let result: UpstreamResult<()> = retry_within_deadline(
            "test_op",
            &RetryPolicy::default(),
            started + Duration::from_millis(250),
            Duration::from_secs(4),
            || async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok(())
            },
        )
        .await;

        assert_eq!(result, Err(UpstreamError::Timeout));
        assert!(started.elapsed() <= Duration::from_millis(250));
    }
}
