use crate::auth::AuthStrategy;
use crate::error::Error;
use bytes::Bytes;
use http::{Request, Response, StatusCode};
use http_body_util::Full;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tower::{Layer, Service, ServiceExt};

/// Applies an [`AuthStrategy`] to every request that passes through.
///
/// Placed inside the retry layer, so each attempt re-authenticates. A 401 is
/// answered once per request by [`AuthStrategy::refresh`] and, when that
/// yields a new credential, a second send of the same request.
#[derive(Clone)]
pub struct AuthLayer {
    strategy: Arc<dyn AuthStrategy>,
}

impl AuthLayer {
    #[must_use]
    pub fn new(strategy: Arc<dyn AuthStrategy>) -> Self {
        Self { strategy }
    }
}

impl<S> Layer<S> for AuthLayer {
    type Service = AuthService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        AuthService {
            inner,
            strategy: self.strategy.clone(),
        }
    }
}

#[derive(Clone)]
pub struct AuthService<S> {
    inner: S,
    strategy: Arc<dyn AuthStrategy>,
}

impl<S, B> Service<Request<Full<Bytes>>> for AuthService<S>
where
    S: Service<Request<Full<Bytes>>, Response = Response<B>, Error = Error> + Clone + Send + 'static,
    S::Future: Send,
    B: Send + 'static,
{
    type Response = Response<B>;
    type Error = Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<Full<Bytes>>) -> Self::Future {
        // Swap so we consume the instance that was poll_ready'd.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        let strategy = self.strategy.clone();

        Box::pin(async move {
            let (parts, body) = req.into_parts();
            let mut first = Request::from_parts(parts.clone(), body.clone());
            strategy.authenticate(first.headers_mut()).await?;
            let response = inner.call(first).await?;
            if response.status() != StatusCode::UNAUTHORIZED {
                return Ok(response);
            }

            match strategy.refresh().await {
                Ok(true) => {}
                Ok(false) => return Ok(response),
                Err(e) => {
                    tracing::warn!(code = e.code().as_str(), error = %e, "Credential refresh failed");
                    return Ok(response);
                }
            }
            drop(response);
            tracing::debug!(
                method = %parts.method,
                path = parts.uri.path(),
                "Resending request with refreshed credential"
            );

            let mut second = Request::from_parts(parts, body);
            strategy.authenticate(second.headers_mut()).await?;
            inner.ready().await?.call(second).await
        })
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::auth::{BearerAuth, HeaderAuth};
    use crate::error::ErrorCode;
    use http::{HeaderMap, header};
    use http_body_util::BodyExt;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tower::service_fn;
    use tower::util::BoxCloneService;

    fn echo_headers() -> BoxCloneService<Request<Full<Bytes>>, Response<HeaderMap>, Error> {
        BoxCloneService::new(service_fn(|req: Request<Full<Bytes>>| async move {
            Ok::<_, Error>(Response::new(req.headers().clone()))
        }))
    }

    fn request() -> Request<Full<Bytes>> {
        Request::builder()
            .uri("https://3.basecampapi.com/1/projects.json")
            .body(Full::new(Bytes::new()))
            .unwrap()
    }

    #[tokio::test]
    async fn bearer_header_reaches_inner_service() {
        let svc = AuthLayer::new(Arc::new(BearerAuth::new("tok"))).layer(echo_headers());
        let headers = svc.oneshot(request()).await.unwrap().into_body();
        assert_eq!(headers[header::AUTHORIZATION], "Bearer tok");
    }

    #[tokio::test]
    async fn alternative_scheme() {
        let auth = HeaderAuth::new("cookie", "bc3_session=abc").unwrap();
        let svc = AuthLayer::new(Arc::new(auth)).layer(echo_headers());
        let headers = svc.oneshot(request()).await.unwrap().into_body();
        assert_eq!(headers[header::COOKIE], "bc3_session=abc");
    }

    #[tokio::test]
    async fn auth_failure_skips_inner_call() {
        let auth = BearerAuth::refreshing(|| async {
            Err(Error::new(ErrorCode::AuthRequired, "token revoked"))
        });
        let called = Arc::new(AtomicBool::new(false));
        let flag = called.clone();
        let inner = service_fn(move |_req: Request<Full<Bytes>>| {
            flag.store(true, Ordering::SeqCst);
            async { Ok::<_, Error>(Response::new(())) }
        });
        let err = AuthLayer::new(Arc::new(auth))
            .layer(inner)
            .oneshot(request())
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::AuthRequired);
        assert_eq!(err.message(), "token revoked");
        assert!(!called.load(Ordering::SeqCst));
    }

    type Seen = Arc<Mutex<Vec<(String, Bytes)>>>;

    /// Answers 401 unless the bearer token is `good`, recording each request.
    fn rejects_all_but(good: &'static str) -> (BoxCloneService<Request<Full<Bytes>>, Response<()>, Error>, Seen) {
        let seen: Seen = Arc::default();
        let log = seen.clone();
        let svc = service_fn(move |req: Request<Full<Bytes>>| {
            let log = log.clone();
            async move {
                let auth = req.headers()[header::AUTHORIZATION].to_str().unwrap().to_owned();
                let body = req.into_body().collect().await.unwrap().to_bytes();
                let status = if auth == format!("Bearer {good}") {
                    StatusCode::OK
                } else {
                    StatusCode::UNAUTHORIZED
                };
                log.lock().push((auth, body));
                let mut resp = Response::new(());
                *resp.status_mut() = status;
                Ok::<_, Error>(resp)
            }
        });
        (BoxCloneService::new(svc), seen)
    }

    fn rotating_tokens() -> BearerAuth {
        let issued = Arc::new(AtomicUsize::new(0));
        BearerAuth::refreshing(move || {
            let n = issued.fetch_add(1, Ordering::SeqCst);
            async move { Ok(format!("t{n}")) }
        })
    }

    #[tokio::test]
    async fn unauthorized_mutation_is_resent_after_refresh() {
        let (inner, seen) = rejects_all_but("t1");
        let svc = AuthLayer::new(Arc::new(rotating_tokens())).layer(inner);

        let req = Request::builder()
            .method(http::Method::POST)
            .uri("https://3.basecampapi.com/1/buckets/2/todolists/3/todos.json")
            .body(Full::new(Bytes::from_static(b"{\"content\":\"x\"}")))
            .unwrap();
        let resp = svc.oneshot(req).await.unwrap();

        assert_eq!(resp.status(), StatusCode::OK);
        let seen = seen.lock();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].0, "Bearer t0");
        assert_eq!(seen[1].0, "Bearer t1");
        assert_eq!(seen[1].1, seen[0].1);
    }

    #[tokio::test]
    async fn refresh_is_attempted_only_once() {
        let (inner, seen) = rejects_all_but("never");
        let svc = AuthLayer::new(Arc::new(rotating_tokens())).layer(inner);

        let resp = svc.oneshot(request()).await.unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(seen.lock().len(), 2);
    }

    #[tokio::test]
    async fn static_token_401_is_returned_as_is() {
        let (inner, seen) = rejects_all_but("good");
        let svc = AuthLayer::new(Arc::new(BearerAuth::new("stale"))).layer(inner);

        let resp = svc.oneshot(request()).await.unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(seen.lock().len(), 1);
    }
}
