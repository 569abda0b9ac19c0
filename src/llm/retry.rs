use std::time::Duration;

use reqwest::StatusCode;

pub const IMAGE_MAX_ATTEMPTS: usize = 2;
pub const IMAGE_RETRY_DELAY: Duration = Duration::from_secs(5);

/// How the provider's HTTP status steers the request loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusClass {
    Success,
    Transient,
    Policy,
    Fatal,
}

pub fn classify_status(status: StatusCode) -> StatusClass {
    match status {
        StatusCode::OK => StatusClass::Success,
        StatusCode::TOO_MANY_REQUESTS
        | StatusCode::INTERNAL_SERVER_ERROR
        | StatusCode::SERVICE_UNAVAILABLE => StatusClass::Transient,
        StatusCode::BAD_REQUEST => StatusClass::Policy,
        _ => StatusClass::Fatal,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    RetryAfter(Duration),
    GiveUp,
}

/// Fixed attempt cap with a constant delay between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_attempts: usize,
    delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(IMAGE_MAX_ATTEMPTS, IMAGE_RETRY_DELAY)
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: usize, delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            delay,
        }
    }

    pub fn max_attempts(&self) -> usize {
        self.max_attempts
    }

    /// Decision after attempt number `attempt` (1-based) failed transiently.
    pub fn after_transient_failure(&self, attempt: usize) -> RetryDecision {
        if attempt < self.max_attempts {
            RetryDecision::RetryAfter(self.delay)
        } else {
            RetryDecision::GiveUp
        }
    }
}
