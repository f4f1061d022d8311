use crate::error::{Error, ErrorCode};
use crate::hooks::{Hooks, RequestInfo, guarded};
use crate::policy::{self, MAX_JITTER, RetryPolicy, is_idempotent};
use crate::response::{ResponseBody, parse_retry_after};
use bytes::Bytes;
use http::{HeaderValue, Request, Response, StatusCode};
use http_body_util::{BodyExt, Full};
use rand::Rng;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tower::{Layer, Service, ServiceExt};

/// Header carrying the retry number (1 for the first retry) on retried requests.
pub const RETRY_ATTEMPT_HEADER: &str = "X-Retry-Attempt";

/// Error bodies up to this size are read off before retrying so the
/// connection can be reused.
const RETRY_DRAIN_LIMIT: usize = 64 * 1024;

/// 1-based attempt number, set in request extensions for inner layers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Attempt(pub u32);

/// Re-sends requests whose response status (or, for idempotent methods,
/// transport failure) the retry policy allows.
///
/// After retries are exhausted the last response is returned as `Ok`; status
/// translation happens later.
#[derive(Clone)]
pub struct RetryLayer {
    policy: Option<RetryPolicy>,
    hooks: Arc<dyn Hooks>,
}

impl RetryLayer {
    /// Retry with the policy the operation table assigns to each request.
    #[must_use]
    pub fn new(hooks: Arc<dyn Hooks>) -> Self {
        Self {
            policy: None,
            hooks,
        }
    }

    /// Retry every request with the same policy.
    #[must_use]
    pub fn with_policy(policy: RetryPolicy, hooks: Arc<dyn Hooks>) -> Self {
        Self {
            policy: Some(policy),
            hooks,
        }
    }
}

impl<S> Layer<S> for RetryLayer {
    type Service = RetryService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RetryService {
            inner,
            policy: self.policy.clone(),
            hooks: self.hooks.clone(),
        }
    }
}

#[derive(Clone)]
pub struct RetryService<S> {
    inner: S,
    policy: Option<RetryPolicy>,
    hooks: Arc<dyn Hooks>,
}

impl<S> Service<Request<Full<Bytes>>> for RetryService<S>
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
        // Swap so we consume the instance that was poll_ready'd,
        // leaving a fresh clone for the next poll_ready cycle.
        let clone = self.inner.clone();
        let inner = std::mem::replace(&mut self.inner, clone);
        let hooks = self.hooks.clone();

        // The body is owned here and cloned per attempt; it is dropped with
        // this future on every exit path.
        let (parts, body) = req.into_parts();
        let url = parts.uri.to_string();
        let policy = self
            .policy
            .clone()
            .unwrap_or_else(|| policy::resolve(&parts.method, &url));
        let cancel = parts.extensions.get::<CancellationToken>().cloned();

        Box::pin(async move {
            let mut attempt: u32 = 0;
            loop {
                if cancel.as_ref().is_some_and(CancellationToken::is_cancelled) {
                    return Err(Error::cancelled());
                }

                let mut req = Request::from_parts(parts.clone(), body.clone());
                req.extensions_mut().insert(Attempt(attempt + 1));
                if attempt > 0 {
                    req.headers_mut()
                        .insert(RETRY_ATTEMPT_HEADER, HeaderValue::from(attempt));
                }

                let mut svc = inner.clone();
                let result = match svc.ready().await {
                    Ok(ready) => ready.call(req).await,
                    Err(e) => Err(e),
                };

                let (error, delay) = match result {
                    Ok(resp) => {
                        let status = resp.status();
                        if !policy.should_retry(status, attempt) {
                            return Ok(resp);
                        }
                        let server_delay = if status == StatusCode::TOO_MANY_REQUESTS {
                            parse_retry_after(resp.headers())
                        } else {
                            None
                        };
                        let delay = server_delay.unwrap_or_else(|| policy.delay_for(attempt).saturating_add(jitter()));
                        let error = Error::from_response(status, resp.headers(), &[]);
                        drain_response_body(resp).await;
                        (error, delay)
                    }
                    Err(err) => {
                        let retryable = err.code() == ErrorCode::Network
                            && is_idempotent(&parts.method)
                            && policy.has_attempts_left(attempt);
                        if !retryable {
                            return Err(err);
                        }
                        (err, policy.delay_for(attempt).saturating_add(jitter()))
                    }
                };

                let info = RequestInfo {
                    method: parts.method.clone(),
                    url: url.clone(),
                    attempt: attempt + 1,
                };
                guarded("on_retry", || hooks.on_retry(&info, attempt + 1, &error, delay));
                tracing::debug!(
                    method = %info.method,
                    url = %info.url,
                    attempt = attempt + 1,
                    max_attempts = policy.max_attempts,
                    code = error.code().as_str(),
                    status = ?error.http_status().map(|s| s.as_u16()),
                    delay_ms = delay.as_millis(),
                    "Retrying request"
                );

                sleep_or_cancel(delay, cancel.as_ref()).await?;
                attempt += 1;
            }
        })
    }
}

fn jitter() -> Duration {
    let ceiling = u64::try_from(MAX_JITTER.as_millis()).unwrap_or(u64::MAX);
    Duration::from_millis(rand::rng().random_range(0..ceiling))
}

async fn sleep_or_cancel(delay: Duration, cancel: Option<&CancellationToken>) -> Result<(), Error> {
    match cancel {
        Some(token) => tokio::select! {
            () = token.cancelled() => Err(Error::cancelled()),
            () = tokio::time::sleep(delay) => Ok(()),
        },
        None => {
            tokio::time::sleep(delay).await;
            Ok(())
        }
    }
}

/// Read off a small error body so HTTP/1.1 can reuse the connection.
async fn drain_response_body(response: Response<ResponseBody>) {
    let mut body = std::pin::pin!(response.into_body());
    let mut drained = 0usize;

    while let Some(frame) = body.frame().await {
        let Ok(frame) = frame else {
            tracing::debug!("Failed to drain response body before retry");
            return;
        };
        if let Some(chunk) = frame.data_ref() {
            drained += chunk.len();
            if drained >= RETRY_DRAIN_LIMIT {
                return;
            }
        }
    }
}
