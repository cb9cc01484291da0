use reqwest::StatusCode;
use tokio::time::Duration;

/// Decides which response statuses are worth retrying and how long to wait
/// before the next attempt.
///
/// Both the predicate and the backoff are plain function pointers so tests
/// can swap in a zero-delay policy without touching classification.
#[derive(Clone, Copy)]
pub struct RetryPolicy {
    /// Retries after the initial attempt. 4 retries means 5 attempts total.
    pub max_retries: u32,
    pub retryable: fn(StatusCode) -> bool,
    /// Delay before attempt number `attempt` (1-based retry counter).
    pub backoff: fn(u32) -> Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_retries: 4,
            retryable: default_retryable,
            backoff: linear_backoff,
        }
    }
}

impl RetryPolicy {
    /// Default classification with no inter-attempt delay, for tests.
    pub fn immediate() -> Self {
        RetryPolicy {
            backoff: |_| Duration::ZERO,
            ..RetryPolicy::default()
        }
    }

    /// `completed_attempts` counts attempts already made (0 after the first
    /// try). Retries stop once the budget is spent or the status is not
    /// transient.
    pub fn should_retry(&self, status: StatusCode, completed_attempts: u32) -> bool {
        completed_attempts < self.max_retries && (self.retryable)(status)
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        (self.backoff)(attempt)
    }
}

fn default_retryable(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::LOCKED
            | StatusCode::CONFLICT
            | StatusCode::SERVICE_UNAVAILABLE
            | StatusCode::TOO_MANY_REQUESTS
    )
}

fn linear_backoff(attempt: u32) -> Duration {
    Duration::from_secs(1 + u64::from(attempt))
}
