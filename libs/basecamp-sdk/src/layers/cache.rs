use crate::cache::{CACHE_STATUS_HEADER, CacheEntry, CacheHit, CacheKey, CacheStore};
use crate::error::Error;
use crate::response::{ResponseBody, full_body, read_body_limited};
use bytes::Bytes;
use http::header::{AUTHORIZATION, CONTENT_LENGTH, ETAG, IF_NONE_MATCH};
use http::{HeaderValue, Method, Request, Response, StatusCode};
use http_body_util::Full;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tower::{Layer, Service};

/// Conditional GET revalidation against a [`CacheStore`].
///
/// Must sit inside the auth layer: the isolation key is derived from the
/// `Authorization` header the auth layer sets.
#[derive(Clone)]
pub struct CacheLayer {
    store: Arc<CacheStore>,
    max_body_size: usize,
}

impl CacheLayer {
    #[must_use]
    pub fn new(store: Arc<CacheStore>, max_body_size: usize) -> Self {
        Self {
            store,
            max_body_size,
        }
    }
}

impl<S> Layer<S> for CacheLayer {
    type Service = CacheService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        CacheService {
            inner,
            store: self.store.clone(),
            max_body_size: self.max_body_size,
        }
    }
}

#[derive(Clone)]
pub struct CacheService<S> {
    inner: S,
    store: Arc<CacheStore>,
    max_body_size: usize,
}

impl<S> Service<Request<Full<Bytes>>> for CacheService<S>
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

    fn call(&mut self, mut req: Request<Full<Bytes>>) -> Self::Future {
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        if req.method() != Method::GET {
            let response = inner.call(req);
            return Box::pin(async move { response.await.map(strip_marker) });
        }

        let store = self.store.clone();
        let max_body_size = self.max_body_size;
        let isolation = store.isolation_token(req.headers().get(AUTHORIZATION));
        let url = req.uri().to_string();
        let key = CacheKey::new(isolation, url.clone());
        let cached = store.get(&key);

        // A caller-supplied validator wins; we only replay our own entries.
        let conditional = match &cached {
            Some(entry) if !req.headers().contains_key(IF_NONE_MATCH) => {
                req.headers_mut().insert(IF_NONE_MATCH, entry.etag.clone());
                true
            }
            _ => false,
        };

        Box::pin(async move {
            let response = strip_marker(inner.call(req).await?);
            let status = response.status();

            if status == StatusCode::NOT_MODIFIED {
                return Ok(match cached {
                    Some(entry) if conditional => {
                        tracing::debug!(%url, "ETag cache hit");
                        replay(response, entry.body)
                    }
                    _ => response,
                });
            }

            if !status.is_success() {
                return Ok(response);
            }
            let Some(etag) = response.headers().get(ETAG).cloned() else {
                return Ok(response);
            };
            if declared_length(&response).is_some_and(|len| len > max_body_size) {
                tracing::debug!(%url, "Response too large to cache");
                return Ok(response);
            }

            let (parts, body) = response.into_parts();
            let bytes = read_body_limited(body, max_body_size).await?;
            store.insert(
                key,
                CacheEntry {
                    etag,
                    body: bytes.clone(),
                },
            );
            Ok(Response::from_parts(parts, full_body(bytes)))
        })
    }
}

fn declared_length(response: &Response<ResponseBody>) -> Option<usize> {
    response
        .headers()
        .get(CONTENT_LENGTH)?
        .to_str()
        .ok()?
        .parse()
        .ok()
}

/// Only this layer may mark a response as a cache hit.
fn strip_marker(mut response: Response<ResponseBody>) -> Response<ResponseBody> {
    response.headers_mut().remove(CACHE_STATUS_HEADER);
    response.extensions_mut().remove::<CacheHit>();
    response
}

/// Turn a 304 into a 200 carrying the stored body and the cache marker.
fn replay(not_modified: Response<ResponseBody>, body: Bytes) -> Response<ResponseBody> {
    let (mut parts, _) = not_modified.into_parts();
    parts.status = StatusCode::OK;
    parts
        .headers
        .insert(CACHE_STATUS_HEADER, HeaderValue::from_static("hit"));
    parts.extensions.insert(CacheHit);
    parts.headers.insert(CONTENT_LENGTH, HeaderValue::from(body.len()));
    Response::from_parts(parts, full_body(body))
}
