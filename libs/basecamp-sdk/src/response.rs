use crate::cache::CacheHit;
use crate::error::{Error, ErrorCode};
use crate::security::MAX_ERROR_BODY_BYTES;
use bytes::Bytes;
use http::{HeaderMap, Response, StatusCode};
use http_body_util::{BodyExt, Full};
use serde::de::DeserializeOwned;
use std::time::{Duration, SystemTime};
use url::Url;

/// Response header carrying the collection size on list endpoints.
pub const TOTAL_COUNT_HEADER: &str = "x-total-count";

/// Parse `Retry-After` header value into a `Duration`.
///
/// Supports two formats per RFC 7231:
/// - Seconds: "120" → 120 seconds
/// - HTTP-date (RFC 1123): "Wed, 21 Oct 2015 07:28:00 GMT" → duration until that time
///
/// Returns `None` if the header is missing, unparseable, zero or negative, or
/// a date already in the past; callers then fall back to computed backoff.
#[must_use]
pub fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    let value = headers.get(http::header::RETRY_AFTER)?.to_str().ok()?;
    let trimmed = value.trim();

    if let Ok(seconds) = trimmed.parse::<i64>() {
        if seconds <= 0 {
            return None;
        }
        return Some(Duration::from_secs(seconds.cast_unsigned()));
    }

    let parsed = httpdate::parse_http_date(trimmed).ok()?;
    parsed.duration_since(SystemTime::now()).ok()
}

/// Boxed, type-erased response body (possibly decompressed).
pub type ResponseBody =
    http_body_util::combinators::BoxBody<Bytes, Box<dyn std::error::Error + Send + Sync>>;

/// Wrap an in-memory buffer as a [`ResponseBody`].
pub(crate) fn full_body(bytes: Bytes) -> ResponseBody {
    Full::new(bytes)
        .map_err(|e| -> Box<dyn std::error::Error + Send + Sync> { Box::new(e) })
        .boxed()
}

/// A response that came back through the pipeline.
///
/// Status codes are not checked on construction; use
/// [`error_for_status`](Self::error_for_status) or [`json`](Self::json) to
/// turn non-2xx responses into [`Error`]s.
#[derive(Debug)]
pub struct HttpResponse {
    pub(crate) inner: Response<ResponseBody>,
    pub(crate) url: Url,
    pub(crate) max_body_size: usize,
}

impl HttpResponse {
    #[must_use]
    pub fn status(&self) -> StatusCode {
        self.inner.status()
    }

    #[must_use]
    pub fn headers(&self) -> &HeaderMap {
        self.inner.headers()
    }

    /// Final URL of the exchange, after any redirects.
    ///
    /// Relative `Link` targets resolve against this.
    #[must_use]
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Whether the body was served from the ETag cache after a 304.
    #[must_use]
    pub fn is_from_cache(&self) -> bool {
        is_cache_hit(&self.inner)
    }

    /// Value of `X-Total-Count`; missing, negative or malformed values are 0.
    #[must_use]
    pub fn total_count(&self) -> u64 {
        self.inner
            .headers()
            .get(TOTAL_COUNT_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.trim().parse::<u64>().ok())
            .unwrap_or(0)
    }

    #[must_use]
    pub fn into_inner(self) -> Response<ResponseBody> {
        self.inner
    }

    /// Return `self` for 2xx responses, or the structured error for the
    /// status (reading at most 1 MiB of the body for its message).
    ///
    /// # Errors
    ///
    /// Returns the [`Error`] translated from a non-2xx status, or a
    /// `Network` error if the error body could not be read.
    pub async fn error_for_status(self) -> Result<Self, Error> {
        let status = self.inner.status();
        if status.is_success() {
            return Ok(self);
        }
        let (parts, body) = self.inner.into_parts();
        let preview = match read_body_limited(body, MAX_ERROR_BODY_BYTES).await {
            Ok(bytes) => bytes,
            Err(e) if e.code() == ErrorCode::Network => return Err(e),
            Err(_) => Bytes::new(),
        };
        Err(Error::from_response(status, &parts.headers, &preview))
    }

    /// Read the whole body, enforcing the configured size limit.
    ///
    /// # Errors
    ///
    /// Returns `ApiError` if the body exceeds the limit, or `Network` if the
    /// stream fails.
    pub async fn bytes(self) -> Result<Bytes, Error> {
        read_body_limited(self.inner.into_body(), self.max_body_size).await
    }

    /// Check the status, then decode the body as JSON.
    ///
    /// # Errors
    ///
    /// Returns the status error for non-2xx responses, or `ApiError` if the
    /// body is not valid JSON for `T`.
    pub async fn json<T: DeserializeOwned>(self) -> Result<T, Error> {
        let bytes = self.error_for_status().await?.bytes().await?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

pub(crate) fn is_cache_hit<B>(response: &Response<B>) -> bool {
    response.extensions().get::<CacheHit>().is_some()
}

/// Collect a body, failing once more than `limit` bytes have arrived.
///
/// Applies to decompressed bytes, so a small compressed payload cannot
/// expand past the limit.
pub(crate) async fn read_body_limited(body: ResponseBody, limit: usize) -> Result<Bytes, Error> {
    let mut collected = Vec::new();
    let mut body = std::pin::pin!(body);

    while let Some(frame) = body.frame().await {
        let frame = frame.map_err(Error::network)?;
        if let Some(chunk) = frame.data_ref() {
            if collected.len() + chunk.len() > limit {
                return Err(Error::new(
                    ErrorCode::ApiError,
                    format!("Response body exceeds {limit} byte limit"),
                ));
            }
            collected.extend_from_slice(chunk);
        }
    }

    Ok(Bytes::from(collected))
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    fn response(status: u16, headers: &[(&str, &str)], body: &'static str) -> HttpResponse {
        let mut builder = Response::builder().status(status);
        for (k, v) in headers {
            builder = builder.header(*k, *v);
        }
        HttpResponse {
            inner: builder.body(full_body(Bytes::from_static(body.as_bytes()))).unwrap(),
            url: Url::parse("https://3.basecampapi.com/1/projects.json").unwrap(),
            max_body_size: 16,
        }
    }

    #[test]
    fn test_parse_retry_after_seconds() {
        let mut headers = HeaderMap::new();
        headers.insert(http::header::RETRY_AFTER, "120".parse().unwrap());
        assert_eq!(parse_retry_after(&headers), Some(Duration::from_secs(120)));
    }

    #[test]
    fn test_parse_retry_after_invalid_or_negative() {
        for raw in ["not-a-number", "-5", "0", "Wed, 21 Oct 2015 07:28:00 GMT"] {
            let mut headers = HeaderMap::new();
            headers.insert(http::header::RETRY_AFTER, raw.parse().unwrap());
            assert_eq!(parse_retry_after(&headers), None, "{raw}");
        }
        assert_eq!(parse_retry_after(&HeaderMap::new()), None);
    }

    #[test]
    fn test_parse_retry_after_http_date_in_future() {
        let mut headers = HeaderMap::new();
        let future_time = SystemTime::now() + Duration::from_secs(60);
        headers.insert(
            http::header::RETRY_AFTER,
            httpdate::fmt_http_date(future_time).parse().unwrap(),
        );
        let secs = parse_retry_after(&headers).unwrap().as_secs();
        assert!((58..=60).contains(&secs), "got {secs}");
    }

    #[test]
    fn total_count_parsing() {
        assert_eq!(response(200, &[("x-total-count", "42")], "").total_count(), 42);
        assert_eq!(response(200, &[("x-total-count", "-3")], "").total_count(), 0);
        assert_eq!(response(200, &[("x-total-count", "many")], "").total_count(), 0);
        assert_eq!(response(200, &[], "").total_count(), 0);
    }

    #[tokio::test]
    async fn bytes_enforces_limit() {
        let resp = response(200, &[], "this body is longer than sixteen bytes");
        let err = resp.bytes().await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::ApiError);
        assert!(err.message().contains("16 byte limit"));
    }

    #[tokio::test]
    async fn json_translates_error_status() {
        let resp = response(404, &[("x-request-id", "r-1")], r#"{"error":"gone"}"#);
        let err = resp.json::<serde_json::Value>().await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::NotFound);
        assert_eq!(err.request_id(), Some("r-1"));
        assert_eq!(err.hint(), Some("gone"));
    }

    #[tokio::test]
    async fn json_decodes_success() {
        let resp = response(200, &[], r"[1,2,3]");
        let values: Vec<u32> = resp.json().await.unwrap();
        assert_eq!(values, vec![1, 2, 3]);
    }

    #[test]
    fn cache_hit_comes_from_the_extension_not_the_header() {
        assert!(!response(200, &[(crate::cache::CACHE_STATUS_HEADER, "hit")], "").is_from_cache());
        assert!(!response(200, &[], "").is_from_cache());

        let mut replayed = response(200, &[], "");
        replayed.inner.extensions_mut().insert(CacheHit);
        assert!(replayed.is_from_cache());
    }
}
