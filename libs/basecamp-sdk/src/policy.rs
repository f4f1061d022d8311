//! Per-operation retry policies.

use crate::normalize::operation_key;
use crate::routes;
use http::{Method, StatusCode};
use std::borrow::Cow;
use std::time::Duration;

/// Upper bound (exclusive) of the random jitter added to every backoff delay.
pub const MAX_JITTER: Duration = Duration::from_millis(100);

/// Growth of the delay between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    /// `base * 2^attempt`
    Exponential,
    /// `base * (attempt + 1)`
    Linear,
    /// `base`
    Constant,
}

/// How often, how long apart and on which statuses a request is retried.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first. Values below 1 act as 1.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub backoff: Backoff,
    /// Response statuses that trigger another attempt.
    pub retry_on: Cow<'static, [StatusCode]>,
}

const DEFAULT_RETRY_ON: &[StatusCode] = &[
    StatusCode::TOO_MANY_REQUESTS,
    StatusCode::SERVICE_UNAVAILABLE,
];

impl RetryPolicy {
    /// Three attempts, 1 s exponential backoff, on 429 and 503.
    pub const DEFAULT: Self = Self::new(3, Duration::from_secs(1), Backoff::Exponential);

    /// A single attempt. Used for non-idempotent creates.
    pub const NO_RETRY: Self = Self::new(1, Duration::from_secs(1), Backoff::Exponential);

    /// Policy retrying on the default status set (429, 503).
    #[must_use]
    pub const fn new(max_attempts: u32, base_delay: Duration, backoff: Backoff) -> Self {
        Self {
            max_attempts,
            base_delay,
            backoff,
            retry_on: Cow::Borrowed(DEFAULT_RETRY_ON),
        }
    }

    #[must_use]
    pub fn with_retry_on(mut self, statuses: impl Into<Cow<'static, [StatusCode]>>) -> Self {
        self.retry_on = statuses.into();
        self
    }

    /// Whether a response with `status` on zero-based `attempt` earns another try.
    #[must_use]
    pub fn should_retry(&self, status: StatusCode, attempt: u32) -> bool {
        self.has_attempts_left(attempt) && self.retry_on.contains(&status)
    }

    /// Whether zero-based `attempt` is followed by another.
    #[must_use]
    pub fn has_attempts_left(&self, attempt: u32) -> bool {
        attempt.saturating_add(1) < self.max_attempts
    }

    /// Backoff before the attempt following zero-based `attempt`, without jitter.
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        match self.backoff {
            Backoff::Exponential => {
                let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
                self.base_delay.saturating_mul(factor)
            }
            Backoff::Linear => self.base_delay.saturating_mul(attempt.saturating_add(1)),
            Backoff::Constant => self.base_delay,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// Policy for a request, from the operation table or [`RetryPolicy::DEFAULT`].
///
/// `url` may be absolute or a bare path; query strings are ignored.
#[must_use]
pub fn resolve(method: &Method, url: &str) -> RetryPolicy {
    routes::lookup(&operation_key(method, url))
        .map_or(RetryPolicy::DEFAULT, |route| route.retry.clone())
}

/// Methods whose transport failures may be retried safely.
#[must_use]
pub fn is_idempotent(method: &Method) -> bool {
    [Method::GET, Method::HEAD, Method::PUT, Method::DELETE, Method::OPTIONS].contains(method)
}
