use crate::config::RateLimitConfig;
use crate::error::Error;
use crate::response::{ResponseBody, parse_retry_after};
use bytes::Bytes;
use http::{Request, Response, StatusCode};
use http_body_util::Full;
use parking_lot::Mutex;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::time::Instant;
use tower::{Layer, Service};

/// Cooldown applied after a 429 that carries no `Retry-After`.
const DEFAULT_THROTTLE: Duration = Duration::from_secs(60);

#[derive(Debug)]
struct TokenBucket {
    tokens: f64,
    refilled_at: Instant,
    throttled_until: Option<Instant>,
}

struct Limiter {
    config: RateLimitConfig,
    bucket: Mutex<TokenBucket>,
}

impl Limiter {
    fn new(config: RateLimitConfig) -> Self {
        Self {
            bucket: Mutex::new(TokenBucket {
                tokens: f64::from(config.burst),
                refilled_at: Instant::now(),
                throttled_until: None,
            }),
            config,
        }
    }

    /// Take one token. `Err` carries how long until one is available.
    fn try_acquire(&self) -> Result<(), Duration> {
        let now = Instant::now();
        let mut bucket = self.bucket.lock();
        if let Some(until) = bucket.throttled_until {
            if now < until {
                return Err(until - now);
            }
            bucket.throttled_until = None;
        }

        let rate = f64::from(self.config.requests_per_second);
        let elapsed = now.saturating_duration_since(bucket.refilled_at).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * rate).min(f64::from(self.config.burst));
        bucket.refilled_at = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            Ok(())
        } else {
            Err(Duration::from_secs_f64((1.0 - bucket.tokens) / rate))
        }
    }

    fn observe(&self, response: &Response<ResponseBody>) {
        if !self.config.respect_retry_after {
            return;
        }
        let delay = match response.status() {
            StatusCode::TOO_MANY_REQUESTS => {
                Some(parse_retry_after(response.headers()).unwrap_or(DEFAULT_THROTTLE))
            }
            StatusCode::SERVICE_UNAVAILABLE => parse_retry_after(response.headers()),
            _ => None,
        };
        let Some(delay) = delay else { return };

        let until = Instant::now() + delay;
        let mut bucket = self.bucket.lock();
        if bucket.throttled_until.is_none_or(|current| current < until) {
            bucket.throttled_until = Some(until);
            tracing::debug!(delay = %humantime::format_duration(delay), "Server asked to slow down; pausing requests");
        }
    }
}

/// Client-side token bucket shared by every clone of the service.
///
/// Requests beyond the configured rate fail fast with
/// [`ErrorCode::Overloaded`](crate::ErrorCode::Overloaded) and a
/// `retry_after` of the time until the next token. A 429, or a 503 carrying
/// `Retry-After`, pauses all requests until the server's delay has passed.
#[derive(Clone)]
pub struct RateLimitLayer {
    limiter: Arc<Limiter>,
}

impl RateLimitLayer {
    #[must_use]
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            limiter: Arc::new(Limiter::new(config)),
        }
    }
}

impl<S> Layer<S> for RateLimitLayer {
    type Service = RateLimitService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RateLimitService {
            inner,
            limiter: self.limiter.clone(),
        }
    }
}

#[derive(Clone)]
pub struct RateLimitService<S> {
    inner: S,
    limiter: Arc<Limiter>,
}

impl<S> Service<Request<Full<Bytes>>> for RateLimitService<S>
where
    S: Service<Request<Full<Bytes>>, Response = Response<ResponseBody>, Error = Error>
        + Clone
        + Send
        + 'static,
    S::Future: Send,
{
    type Response = Response<ResponseBody>;
    type Error = Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<Full<Bytes>>) -> Self::Future {
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        let limiter = self.limiter.clone();

        Box::pin(async move {
            if let Err(wait) = limiter.try_acquire() {
                return Err(Error::overloaded("Client-side rate limit exceeded")
                    .with_hint(format!(
                        "Slow down; next request allowed in {}",
                        humantime::format_duration(Duration::from_millis(
                            u64::try_from(wait.as_millis()).unwrap_or(u64::MAX).max(1)
                        ))
                    ))
                    .with_retryable(true)
                    .with_retry_after(wait));
            }
            let response = inner.call(req).await?;
            limiter.observe(&response);
            Ok(response)
        })
    }
}
