use crate::client::{BufferedService, map_buffer_error};
use crate::error::Error;
use crate::response::HttpResponse;
use bytes::Bytes;
use http::header::{ACCEPT, CONTENT_TYPE, HeaderName, HeaderValue};
use http::{HeaderMap, Method, Request, Uri};
use http_body_util::Full;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tower::{Service, ServiceExt};
use tower_http::follow_redirect::RequestUri;
use url::Url;

/// Request builder returned by [`Client::get`](crate::Client::get) and friends.
///
/// Errors found while building (bad header, unserializable body, bad URL)
/// are deferred to [`send`](Self::send).
#[must_use = "RequestBuilder does nothing until .send() is called"]
pub struct RequestBuilder {
    service: BufferedService,
    max_body_size: usize,
    method: Method,
    url: Result<Url, Error>,
    headers: HeaderMap,
    body: Bytes,
    cancel: Option<CancellationToken>,
    error: Option<Error>,
}

impl RequestBuilder {
    pub(crate) fn new(
        service: BufferedService,
        max_body_size: usize,
        method: Method,
        url: Result<Url, Error>,
    ) -> Self {
        Self {
            service,
            max_body_size,
            method,
            url,
            headers: HeaderMap::new(),
            body: Bytes::new(),
            cancel: None,
            error: None,
        }
    }

    #[must_use]
    pub fn method(&self) -> &Method {
        &self.method
    }

    /// Target URL, if it resolved.
    #[must_use]
    pub fn url(&self) -> Option<&Url> {
        self.url.as_ref().ok()
    }

    /// Add a header. Replaces any earlier value for the same name.
    pub fn header(mut self, name: &str, value: &str) -> Self {
        if self.error.is_some() {
            return self;
        }
        match (HeaderName::try_from(name), HeaderValue::try_from(value)) {
            (Ok(name), Ok(value)) => {
                self.headers.insert(name, value);
            }
            (Err(e), _) => {
                self.error = Some(Error::usage(format!("Invalid header name: {name}")).with_source(e));
            }
            (_, Err(e)) => {
                self.error = Some(Error::usage(format!("Invalid value for header {name}")).with_source(e));
            }
        }
        self
    }

    /// Serialize `body` as the JSON request body.
    ///
    /// `Content-Type: application/json` is added unless already set.
    ///
    /// # Errors
    ///
    /// Returns a `Usage` error if serialization fails or an earlier builder
    /// step failed.
    pub fn json<T: Serialize + ?Sized>(mut self, body: &T) -> Result<Self, Error> {
        if let Some(e) = self.error.take() {
            return Err(e);
        }
        let bytes = serde_json::to_vec(body).map_err(|e| {
            Error::usage("Failed to serialize request body")
                .with_hint(e.to_string())
                .with_source(e)
        })?;
        self.headers.entry(CONTENT_TYPE).or_insert_with(application_json);
        self.body = Bytes::from(bytes);
        Ok(self)
    }

    /// Use `body` verbatim. Set `Content-Type` yourself.
    pub fn body_bytes(mut self, body: Bytes) -> Self {
        self.body = body;
        self
    }

    /// Abort the request (including retry backoff) when `token` is cancelled.
    pub fn cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Send the request.
    ///
    /// Every HTTP status is returned as `Ok`; use
    /// [`HttpResponse::error_for_status`] or [`HttpResponse::json`] to
    /// translate non-2xx responses.
    ///
    /// # Errors
    ///
    /// Returns `Usage` for a bad URL or builder input, `Network` for
    /// transport failures and timeouts, `AuthRequired` when the credential
    /// cannot be resolved, and `Cancelled` when the cancellation token fires.
    pub async fn send(self) -> Result<HttpResponse, Error> {
        if let Some(e) = self.error {
            return Err(e);
        }
        let url = self.url?;
        let uri: Uri = url
            .as_str()
            .parse()
            .map_err(|e| Error::usage(format!("Invalid URL: {url}")).with_source(e))?;

        let mut request = Request::builder()
            .method(self.method)
            .uri(uri)
            .body(Full::new(self.body))?;
        *request.headers_mut() = self.headers;
        request.headers_mut().entry(ACCEPT).or_insert_with(application_json);
        if let Some(token) = &self.cancel {
            request.extensions_mut().insert(token.clone());
        }

        let mut service = self.service;
        let call = async move {
            let ready = service.ready().await.map_err(map_buffer_error)?;
            ready.call(request).await.map_err(map_buffer_error)
        };
        let inner = match &self.cancel {
            Some(token) => tokio::select! {
                biased;
                () = token.cancelled() => return Err(Error::cancelled()),
                result = call => result?,
            },
            None => call.await?,
        };

        // Redirects change the URL that relative links resolve against.
        let final_url = inner
            .extensions()
            .get::<RequestUri>()
            .and_then(|RequestUri(uri)| Url::parse(&uri.to_string()).ok())
            .unwrap_or(url);

        Ok(HttpResponse {
            inner,
            url: final_url,
            max_body_size: self.max_body_size,
        })
    }
}

fn application_json() -> HeaderValue {
    HeaderValue::from_static("application/json")
}
