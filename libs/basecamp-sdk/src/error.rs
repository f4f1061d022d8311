use crate::response::parse_retry_after;
use crate::security::{MAX_ERROR_MESSAGE_BYTES, truncate};
use http::{HeaderMap, StatusCode};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Header carrying the server's request correlation id.
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Classification of SDK failures.
///
/// Match on this rather than on message text, which is not stable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum ErrorCode {
    /// Caller misconfiguration (bad base URL, conflicting auth, cross-origin page link)
    Usage,
    /// HTTP 404
    NotFound,
    /// HTTP 401, or the token provider failed
    AuthRequired,
    /// HTTP 403
    Forbidden,
    /// HTTP 429
    RateLimit,
    /// Transport failure before a response arrived (DNS, reset, timeout)
    Network,
    /// Any other non-success response; retryable when 5xx
    ApiError,
    /// HTTP 422
    Validation,
    /// The caller's cancellation token fired
    Cancelled,
    /// Rejected client-side by the circuit breaker, bulkhead or rate limiter
    Overloaded,
}

impl ErrorCode {
    /// Stable snake-case identifier.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Usage => "usage",
            Self::NotFound => "not_found",
            Self::AuthRequired => "auth_required",
            Self::Forbidden => "forbidden",
            Self::RateLimit => "rate_limit",
            Self::Network => "network",
            Self::ApiError => "api_error",
            Self::Validation => "validation",
            Self::Cancelled => "cancelled",
            Self::Overloaded => "overloaded",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured SDK error.
///
/// Created once at the boundary where a failure is first observed (the
/// transport for network failures, the response for HTTP statuses) and then
/// passed through unchanged.
#[derive(Error, Debug)]
#[error("{message}{}", format_hint(.hint.as_deref()))]
pub struct Error {
    code: ErrorCode,
    message: String,
    hint: Option<String>,
    http_status: Option<StatusCode>,
    retryable: bool,
    retry_after: Option<Duration>,
    request_id: Option<String>,
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

fn format_hint(hint: Option<&str>) -> String {
    hint.map(|h| format!(": {h}")).unwrap_or_default()
}

impl Error {
    /// Create an error with the given code; the message is truncated to
    /// [`MAX_ERROR_MESSAGE_BYTES`].
    #[must_use]
    pub fn new(code: ErrorCode, message: impl AsRef<str>) -> Self {
        Self {
            code,
            message: truncate(message.as_ref(), MAX_ERROR_MESSAGE_BYTES),
            hint: None,
            http_status: None,
            retryable: false,
            retry_after: None,
            request_id: None,
            source: None,
        }
    }

    /// Caller misconfiguration.
    #[must_use]
    pub fn usage(message: impl AsRef<str>) -> Self {
        Self::new(ErrorCode::Usage, message)
    }

    /// Transport failure; always retryable.
    #[must_use]
    pub fn network(source: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        let source = source.into();
        Self::new(ErrorCode::Network, "Network error")
            .with_hint(source.to_string())
            .with_retryable(true)
            .with_source(source)
    }

    /// The operation was cancelled by the caller.
    #[must_use]
    pub fn cancelled() -> Self {
        Self::new(ErrorCode::Cancelled, "Operation cancelled")
    }

    /// The request was shed before reaching the network.
    #[must_use]
    pub fn overloaded(message: impl AsRef<str>) -> Self {
        Self::new(ErrorCode::Overloaded, message)
    }

    #[must_use]
    pub(crate) fn with_retry_after(mut self, delay: Duration) -> Self {
        self.retry_after = Some(delay);
        self
    }

    /// Translate a non-success response into a structured error.
    ///
    /// `body` may be empty; when it is a JSON object with an `error` or
    /// `message` field that text is used for the message (or hint, for
    /// statuses with a fixed message).
    #[must_use]
    pub fn from_response(status: StatusCode, headers: &HeaderMap, body: &[u8]) -> Self {
        let api_message = api_error_message(body);
        let code = status.as_u16();

        let mut err = match code {
            401 => Self::new(ErrorCode::AuthRequired, "Authentication required")
                .with_hint(api_message.unwrap_or_else(|| "Check or refresh your access token".to_owned())),
            403 => Self::new(ErrorCode::Forbidden, "Access denied").with_optional_hint(api_message),
            404 => Self::new(ErrorCode::NotFound, "Resource not found").with_optional_hint(api_message),
            422 => Self::new(
                ErrorCode::Validation,
                api_message.unwrap_or_else(|| "Validation failed".to_owned()),
            ),
            429 => {
                let retry_after = parse_retry_after(headers);
                let hint = retry_after.map_or_else(
                    || "Try again later".to_owned(),
                    |d| format!("Try again in {} seconds", d.as_secs()),
                );
                let mut err = Self::new(ErrorCode::RateLimit, "Rate limit exceeded")
                    .with_hint(hint)
                    .with_retryable(true);
                err.retry_after = retry_after;
                err
            }
            500 => Self::new(ErrorCode::ApiError, "Server error (500)").with_retryable(true),
            502..=504 => {
                Self::new(ErrorCode::ApiError, format!("Gateway error ({code})")).with_retryable(true)
            }
            _ => Self::new(
                ErrorCode::ApiError,
                api_message.unwrap_or_else(|| format!("Request failed ({code})")),
            )
            .with_retryable(status.is_server_error()),
        };

        err.http_status = Some(status);
        err.request_id = headers
            .get(REQUEST_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(ToOwned::to_owned);
        err
    }

    /// Attach a hint (suggested remedy or underlying detail).
    #[must_use]
    pub fn with_hint(mut self, hint: impl AsRef<str>) -> Self {
        self.hint = Some(truncate(hint.as_ref(), MAX_ERROR_MESSAGE_BYTES));
        self
    }

    fn with_optional_hint(self, hint: Option<String>) -> Self {
        match hint {
            Some(h) => self.with_hint(h),
            None => self,
        }
    }

    /// Override the retryable flag.
    #[must_use]
    pub fn with_retryable(mut self, retryable: bool) -> Self {
        self.retryable = retryable;
        self
    }

    /// Attach an underlying cause.
    #[must_use]
    pub fn with_source(mut self, source: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        self.source = Some(source.into());
        self
    }

    #[must_use]
    pub fn code(&self) -> ErrorCode {
        self.code
    }

    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    #[must_use]
    pub fn hint(&self) -> Option<&str> {
        self.hint.as_deref()
    }

    /// HTTP status that produced this error, if any.
    #[must_use]
    pub fn http_status(&self) -> Option<StatusCode> {
        self.http_status
    }

    #[must_use]
    pub fn is_retryable(&self) -> bool {
        self.retryable
    }

    /// Server-requested wait from `Retry-After`, for rate-limit errors.
    #[must_use]
    pub fn retry_after(&self) -> Option<Duration> {
        self.retry_after
    }

    /// Correlation id from the `X-Request-Id` response header.
    #[must_use]
    pub fn request_id(&self) -> Option<&str> {
        self.request_id.as_deref()
    }
}

/// Pull a human-readable message out of a JSON error body.
fn api_error_message(body: &[u8]) -> Option<String> {
    if body.is_empty() {
        return None;
    }
    let value: serde_json::Value = serde_json::from_slice(body).ok()?;
    ["error", "message"]
        .iter()
        .find_map(|field| value.get(field).and_then(serde_json::Value::as_str))
        .filter(|s| !s.trim().is_empty())
        .map(|s| truncate(s, MAX_ERROR_MESSAGE_BYTES))
}

impl From<hyper::Error> for Error {
    fn from(err: hyper::Error) -> Self {
        Self::network(err)
    }
}

impl From<hyper_util::client::legacy::Error> for Error {
    fn from(err: hyper_util::client::legacy::Error) -> Self {
        Self::network(err)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::new(ErrorCode::ApiError, "Failed to decode response body")
            .with_hint(err.to_string())
            .with_source(err)
    }
}

impl From<http::Error> for Error {
    fn from(err: http::Error) -> Self {
        Self::usage("Failed to build request")
            .with_hint(err.to_string())
            .with_source(err)
    }
}
