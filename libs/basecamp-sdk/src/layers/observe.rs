use crate::error::Error;
use crate::hooks::{Hooks, RequestInfo, RequestResult, guarded};
use crate::layers::retry::Attempt;
use crate::response::{ResponseBody, is_cache_hit};
use bytes::Bytes;
use http::{Request, Response};
use http_body_util::Full;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;
use tower::{Layer, Service};

/// Reports every attempt to [`Hooks::on_request_start`] and
/// [`Hooks::on_request_end`].
///
/// Sits inside the retry layer (one event pair per attempt) and outside the
/// cache layer (so cache hits are visible).
#[derive(Clone)]
pub struct ObserveLayer {
    hooks: Arc<dyn Hooks>,
}

impl ObserveLayer {
    #[must_use]
    pub fn new(hooks: Arc<dyn Hooks>) -> Self {
        Self { hooks }
    }
}

impl<S> Layer<S> for ObserveLayer {
    type Service = ObserveService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        ObserveService {
            inner,
            hooks: self.hooks.clone(),
        }
    }
}

#[derive(Clone)]
pub struct ObserveService<S> {
    inner: S,
    hooks: Arc<dyn Hooks>,
}

impl<S> Service<Request<Full<Bytes>>> for ObserveService<S>
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
        let hooks = self.hooks.clone();

        // Query strings can carry tokens; keep them out of hook payloads.
        let uri = req.uri();
        let url = format!(
            "{}://{}{}",
            uri.scheme_str().unwrap_or("https"),
            uri.authority().map_or("", http::uri::Authority::as_str),
            uri.path()
        );
        let info = RequestInfo {
            method: req.method().clone(),
            url,
            attempt: req.extensions().get::<Attempt>().map_or(1, |a| a.0),
        };

        Box::pin(async move {
            guarded("on_request_start", || hooks.on_request_start(&info));
            let started = Instant::now();
            let result = inner.call(req).await;
            let duration = started.elapsed();

            let outcome = match &result {
                Ok(resp) => RequestResult {
                    status: Some(resp.status()),
                    duration,
                    error: None,
                    from_cache: is_cache_hit(resp),
                },
                Err(err) => RequestResult {
                    status: err.http_status(),
                    duration,
                    error: Some(err),
                    from_cache: false,
                },
            };
            guarded("on_request_end", || hooks.on_request_end(&info, &outcome));
            result
        })
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::cache::{CACHE_STATUS_HEADER, CacheHit};
    use crate::error::ErrorCode;
    use crate::response::full_body;
    use http::StatusCode;
    use parking_lot::Mutex;
    use tower::ServiceExt;

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<String>>,
    }

    impl Hooks for Recorder {
        fn on_request_start(&self, req: &RequestInfo) {
            self.events
                .lock()
                .push(format!("start {} {} #{}", req.method, req.url, req.attempt));
        }

        fn on_request_end(&self, req: &RequestInfo, result: &RequestResult<'_>) {
            self.events.lock().push(format!(
                "end #{} {:?} cache={} err={:?}",
                req.attempt,
                result.status.map(|s| s.as_u16()),
                result.from_cache,
                result.error.map(Error::code),
            ));
        }
    }

    #[tokio::test]
    async fn reports_attempt_status_and_cache_marker() {
        let recorder = Arc::new(Recorder::default());
        let inner = tower::service_fn(|_req: Request<Full<Bytes>>| async {
            Ok::<_, Error>(
                Response::builder()
                    .status(StatusCode::OK)
                    .extension(CacheHit)
                    .body(full_body(Bytes::new()))
                    .unwrap(),
            )
        });
        let svc = ObserveLayer::new(recorder.clone()).layer(inner);

        let mut req = Request::builder()
            .uri("https://3.basecampapi.com/1/projects.json?access_token=secret")
            .body(Full::new(Bytes::new()))
            .unwrap();
        req.extensions_mut().insert(Attempt(2));
        svc.oneshot(req).await.unwrap();

        assert_eq!(
            *recorder.events.lock(),
            [
                "start GET https://3.basecampapi.com/1/projects.json #2",
                "end #2 Some(200) cache=true err=None",
            ]
        );
    }

    #[tokio::test]
    async fn reports_errors() {
        let recorder = Arc::new(Recorder::default());
        let inner = tower::service_fn(|_req: Request<Full<Bytes>>| async {
            Err::<Response<ResponseBody>, _>(Error::network("reset"))
        });
        let svc = ObserveLayer::new(recorder.clone()).layer(inner);

        let req = Request::builder()
            .uri("https://3.basecampapi.com/1/projects.json")
            .body(Full::new(Bytes::new()))
            .unwrap();
        let err = svc.oneshot(req).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::Network);

        let events = recorder.events.lock();
        assert_eq!(events[1], "end #1 None cache=false err=Some(Network)");
    }

    #[tokio::test]
    async fn server_sent_marker_is_not_a_cache_hit() {
        let recorder = Arc::new(Recorder::default());
        let inner = tower::service_fn(|_req: Request<Full<Bytes>>| async {
            Ok::<_, Error>(
                Response::builder()
                    .header(CACHE_STATUS_HEADER, "hit")
                    .body(full_body(Bytes::new()))
                    .unwrap(),
            )
        });
        let svc = ObserveLayer::new(recorder.clone()).layer(inner);

        let req = Request::builder()
            .uri("https://3.basecampapi.com/1/projects.json")
            .body(Full::new(Bytes::new()))
            .unwrap();
        svc.oneshot(req).await.unwrap();

        assert_eq!(recorder.events.lock()[1], "end #1 Some(200) cache=false err=None");
    }
}
