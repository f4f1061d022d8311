use crate::builder::ClientBuilder;
use crate::cache::CacheStore;
use crate::config::{ClientConfig, validate_account_id};
use crate::error::Error;
use crate::hooks::Hooks;
use crate::request::RequestBuilder;
use crate::response::ResponseBody;
use crate::security::is_secure_endpoint;
use bytes::Bytes;
use http::{Method, Request, Response};
use http_body_util::Full;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tower::buffer::Buffer;
use url::Url;

/// Future returned by the boxed services behind the buffer.
pub type ServiceFuture = Pin<Box<dyn Future<Output = Result<Response<ResponseBody>, Error>> + Send>>;

/// Buffered front of a middleware stack.
pub type BufferedService = Buffer<Request<Full<Bytes>>, ServiceFuture>;

/// Basecamp API client.
///
/// `Clone + Send + Sync`; clones share the middleware stacks, the ETag
/// cache and the hooks. Store it directly, no `Mutex` needed.
///
/// ```ignore
/// let client = Client::builder()
///     .access_token(token)
///     .account_id("999")
///     .build()?;
///
/// let todo: Todo = client.get("/buckets/1/todos/2.json").send().await?.json().await?;
/// ```
#[derive(Clone)]
pub struct Client {
    /// Retry, auth, observe, cache and user agent around the transport.
    pub(crate) pipeline: BufferedService,
    /// Auth, observe and user agent only; used for pagination follow-ups.
    pub(crate) raw: BufferedService,
    pub(crate) config: Arc<ClientConfig>,
    pub(crate) base_url: Url,
    pub(crate) hooks: Arc<dyn Hooks>,
    pub(crate) cache: Option<Arc<CacheStore>>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("base_url", &self.base_url.as_str())
            .field("account_id", &self.config.account_id)
            .field("cache", &self.cache)
            .finish_non_exhaustive()
    }
}

impl Client {
    #[must_use]
    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    /// A clone scoped to another account; the stacks, cache and hooks are shared.
    ///
    /// # Errors
    ///
    /// Returns a `Usage` error if `account_id` is not numeric.
    pub fn for_account(&self, account_id: impl Into<String>) -> Result<Self, Error> {
        let account_id = account_id.into();
        validate_account_id(&account_id)?;
        let mut config = (*self.config).clone();
        config.account_id = Some(account_id);
        Ok(Self {
            config: Arc::new(config),
            ..self.clone()
        })
    }

    #[must_use]
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    #[must_use]
    pub fn account_id(&self) -> Option<&str> {
        self.config.account_id.as_deref()
    }

    /// The ETag cache, when enabled.
    #[must_use]
    pub fn cache(&self) -> Option<&CacheStore> {
        self.cache.as_deref()
    }

    pub fn get(&self, path: &str) -> RequestBuilder {
        self.request(Method::GET, path)
    }

    pub fn post(&self, path: &str) -> RequestBuilder {
        self.request(Method::POST, path)
    }

    pub fn put(&self, path: &str) -> RequestBuilder {
        self.request(Method::PUT, path)
    }

    pub fn patch(&self, path: &str) -> RequestBuilder {
        self.request(Method::PATCH, path)
    }

    pub fn delete(&self, path: &str) -> RequestBuilder {
        self.request(Method::DELETE, path)
    }

    /// Request through the full pipeline.
    ///
    /// `path` is either relative to the base URL (prefixed with the account
    /// id when one is configured) or an absolute HTTPS URL. An invalid
    /// target surfaces as a `Usage` error from `send()`.
    pub fn request(&self, method: Method, path: &str) -> RequestBuilder {
        RequestBuilder::new(
            self.pipeline.clone(),
            self.config.max_body_size,
            method,
            self.resolve_url(path),
        )
    }

    /// Request through the raw stack (no cache, no retry).
    pub(crate) fn raw_request(&self, method: Method, url: Url) -> RequestBuilder {
        RequestBuilder::new(self.raw.clone(), self.config.max_body_size, method, Ok(url))
    }

    pub(crate) fn resolve_url(&self, path: &str) -> Result<Url, Error> {
        if path.starts_with("https://") || path.starts_with("http://") {
            let url = Url::parse(path)
                .map_err(|e| Error::usage(format!("Invalid URL: {path}")).with_source(e))?;
            if !is_secure_endpoint(&url) {
                return Err(Error::usage(format!("URL must use HTTPS: {path}")));
            }
            return Ok(url);
        }

        let path = match &self.config.account_id {
            Some(account_id) => account_path(account_id, path),
            None if path.starts_with('/') => path.to_owned(),
            None => format!("/{path}"),
        };
        let base = self.base_url.as_str().trim_end_matches('/');
        Url::parse(&format!("{base}{path}"))
            .map_err(|e| Error::usage(format!("Invalid request path: {path}")).with_source(e))
    }
}

/// Prefix `path` with the account id unless it already starts with it.
fn account_path(account_id: &str, path: &str) -> String {
    let path = if path.starts_with('/') {
        path.to_owned()
    } else {
        format!("/{path}")
    };
    let already_prefixed = path[1..]
        .strip_prefix(account_id)
        .is_some_and(|rest| rest.is_empty() || rest.starts_with(['/', '?']));
    if already_prefixed {
        path
    } else {
        format!("/{account_id}{path}")
    }
}

/// Unwrap the inner service error from a buffer error.
///
/// Anything else means the buffer worker is gone, which is reported as a
/// `Network` error.
pub(crate) fn map_buffer_error(err: tower::BoxError) -> Error {
    match err.downcast::<Error>() {
        Ok(err) => *err,
        Err(err) => {
            tracing::error!(
                error = %err,
                "buffer worker closed unexpectedly; service unavailable"
            );
            Error::network(err).with_hint("Client pipeline is no longer running")
        }
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::cache::CACHE_STATUS_HEADER;
    use crate::error::ErrorCode;
    use crate::hooks::{RequestInfo, RequestResult};
    use httpmock::prelude::*;
    use parking_lot::Mutex;
    use serde_json::{Value, json};

    fn client_for(server: &MockServer) -> Client {
        Client::builder()
            .access_token("secret")
            .base_url(server.base_url())
            .account_id("999")
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn relative_paths_are_account_scoped() {
        let server = MockServer::start();
        let client = client_for(&server);
        let base = server.base_url();

        let url = |p: &str| client.resolve_url(p).unwrap().to_string();
        assert_eq!(url("/projects.json"), format!("{base}/999/projects.json"));
        assert_eq!(url("projects.json"), format!("{base}/999/projects.json"));
        assert_eq!(url("/999/projects.json"), format!("{base}/999/projects.json"));
        assert_eq!(url("/9999/x.json"), format!("{base}/999/9999/x.json"));
    }

    #[tokio::test]
    async fn absolute_urls_must_be_secure() {
        let server = MockServer::start();
        let client = client_for(&server);

        assert!(client.resolve_url("https://3.basecampapi.com/1/projects.json").is_ok());
        let err = client.resolve_url("http://evil.example/steal").unwrap_err();
        assert_eq!(err.code(), ErrorCode::Usage);
    }

    #[tokio::test]
    async fn for_account_rescopes_and_validates() {
        let server = MockServer::start();
        let client = client_for(&server);

        let other = client.for_account("123").unwrap();
        assert_eq!(other.account_id(), Some("123"));
        assert_eq!(client.account_id(), Some("999"));
        assert!(other.resolve_url("/projects.json").unwrap().path().starts_with("/123/"));

        assert_eq!(client.for_account("abc").unwrap_err().code(), ErrorCode::Usage);
    }

    #[tokio::test]
    async fn get_sends_credentials_and_defaults() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(GET)
                .path("/999/projects.json")
                .header("authorization", "Bearer secret")
                .header("accept", "application/json")
                .header_exists("user-agent");
            then.status(200).json_body(json!([{"id": 1}]));
        });

        let client = client_for(&server);
        let projects: Vec<Value> = client.get("/projects.json").send().await.unwrap().json().await.unwrap();

        mock.assert();
        assert_eq!(projects, vec![json!({"id": 1})]);
    }

    #[tokio::test]
    async fn repeated_get_is_served_from_cache_after_304() {
        let server = MockServer::start();
        let fresh = server.mock(|when, then| {
            when.method(GET)
                .path("/999/buckets/1/todos/2.json")
                .header_missing("if-none-match");
            then.status(200)
                .header("etag", "\"abc\"")
                .json_body(json!({"id": 2, "title": "ship it"}));
        });
        let revalidated = server.mock(|when, then| {
            when.method(GET)
                .path("/999/buckets/1/todos/2.json")
                .header("if-none-match", "\"abc\"");
            then.status(304).header("etag", "\"abc\"");
        });

        let client = client_for(&server);
        let first = client.get("/buckets/1/todos/2.json").send().await.unwrap();
        assert!(!first.is_from_cache());
        let first: Value = first.json().await.unwrap();

        let second = client.get("/buckets/1/todos/2.json").send().await.unwrap();
        assert_eq!(second.status(), http::StatusCode::OK);
        assert!(second.is_from_cache());
        assert!(second.headers().contains_key(CACHE_STATUS_HEADER));
        let second: Value = second.json().await.unwrap();

        assert_eq!(first, second);
        fresh.assert_calls(1);
        revalidated.assert_calls(1);
        assert_eq!(client.cache().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn cache_is_isolated_per_credential() {
        let server = MockServer::start();
        let alice = server.mock(|when, then| {
            when.method(GET)
                .path("/999/projects.json")
                .header("authorization", "Bearer alice");
            then.status(200).header("etag", "\"a\"").json_body(json!(["alice"]));
        });
        let bob = server.mock(|when, then| {
            when.method(GET)
                .path("/999/projects.json")
                .header("authorization", "Bearer bob");
            then.status(200).header("etag", "\"b\"").json_body(json!(["bob"]));
        });

        let build = |token: &str| {
            Client::builder()
                .access_token(token)
                .base_url(server.base_url())
                .account_id("999")
                .build()
                .unwrap()
        };
        let a: Vec<String> = build("alice").get("/projects.json").send().await.unwrap().json().await.unwrap();
        let b: Vec<String> = build("bob").get("/projects.json").send().await.unwrap().json().await.unwrap();

        assert_eq!(a, ["alice"]);
        assert_eq!(b, ["bob"]);
        alice.assert_calls(1);
        bob.assert_calls(1);
    }

    #[tokio::test]
    async fn non_success_is_returned_until_checked() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/999/buckets/1/todos/404.json");
            then.status(404)
                .header("x-request-id", "req-7")
                .json_body(json!({"error": "Todo not found"}));
        });

        let client = client_for(&server);
        let resp = client.get("/buckets/1/todos/404.json").send().await.unwrap();
        assert_eq!(resp.status(), http::StatusCode::NOT_FOUND);

        let err = resp.error_for_status().await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::NotFound);
        assert_eq!(err.request_id(), Some("req-7"));
    }

    #[tokio::test]
    async fn post_json_sets_content_type() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(POST)
                .path("/999/buckets/1/todolists/2/todos.json")
                .header("content-type", "application/json")
                .json_body(json!({"content": "Write docs"}));
            then.status(201).json_body(json!({"id": 3}));
        });

        let client = client_for(&server);
        let resp = client
            .post("/buckets/1/todolists/2/todos.json")
            .json(&json!({"content": "Write docs"}))
            .unwrap()
            .send()
            .await
            .unwrap();

        mock.assert();
        assert_eq!(resp.status(), http::StatusCode::CREATED);
    }

    #[tokio::test]
    async fn server_errors_on_create_are_not_retried() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(POST).path("/999/projects.json");
            then.status(503);
        });

        let client = client_for(&server);
        let resp = client.post("/projects.json").send().await.unwrap();

        assert_eq!(resp.status(), http::StatusCode::SERVICE_UNAVAILABLE);
        mock.assert_calls(1);
    }

    #[derive(Default)]
    struct AttemptLog(Mutex<Vec<(u32, Option<u16>, bool)>>);

    impl Hooks for AttemptLog {
        fn on_request_end(&self, req: &RequestInfo, result: &RequestResult<'_>) {
            self.0
                .lock()
                .push((req.attempt, result.status.map(|s| s.as_u16()), result.from_cache));
        }
    }

    #[tokio::test]
    async fn hooks_observe_cache_hits() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/999/people.json").header_missing("if-none-match");
            then.status(200).header("etag", "\"p\"").json_body(json!([]));
        });
        server.mock(|when, then| {
            when.method(GET).path("/999/people.json").header("if-none-match", "\"p\"");
            then.status(304);
        });

        let log = Arc::new(AttemptLog::default());
        let client = Client::builder()
            .access_token("secret")
            .base_url(server.base_url())
            .account_id("999")
            .hooks(log.clone())
            .build()
            .unwrap();

        client.get("/people.json").send().await.unwrap();
        client.get("/people.json").send().await.unwrap();

        assert_eq!(*log.0.lock(), [(1, Some(200), false), (1, Some(200), true)]);
    }

    #[tokio::test]
    async fn server_cannot_claim_a_cache_hit() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/999/people.json");
            then.status(200)
                .header(CACHE_STATUS_HEADER, "hit")
                .json_body(json!([]));
        });

        for cache in [true, false] {
            let log = Arc::new(AttemptLog::default());
            let client = Client::builder()
                .access_token("secret")
                .base_url(server.base_url())
                .account_id("999")
                .cache(cache)
                .hooks(log.clone())
                .build()
                .unwrap();

            let resp = client.get("/people.json").send().await.unwrap();
            assert!(!resp.is_from_cache(), "cache enabled: {cache}");
            assert_eq!(*log.0.lock(), [(1, Some(200), false)]);
            assert!(client.cache().is_none_or(CacheStore::is_empty));
        }
    }

    #[tokio::test]
    async fn expired_token_is_refreshed_once() {
        let server = MockServer::start();
        let stale = server.mock(|when, then| {
            when.method(GET).path("/999/projects.json").header("authorization", "Bearer t0");
            then.status(401).json_body(json!({"error": "token expired"}));
        });
        let fresh = server.mock(|when, then| {
            when.method(GET).path("/999/projects.json").header("authorization", "Bearer t1");
            then.status(200).json_body(json!([]));
        });

        let issued = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = issued.clone();
        let client = Client::builder()
            .auth(Arc::new(crate::auth::BearerAuth::refreshing(move || {
                let n = counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                async move { Ok(format!("t{}", n.min(1))) }
            })))
            .base_url(server.base_url())
            .account_id("999")
            .build()
            .unwrap();

        let resp = client.get("/projects.json").send().await.unwrap();
        assert_eq!(resp.status(), http::StatusCode::OK);
        stale.assert_calls(1);
        fresh.assert_calls(1);
    }

    #[test]
    fn account_path_prefixing() {
        assert_eq!(account_path("999", "/projects.json"), "/999/projects.json");
        assert_eq!(account_path("999", "/999"), "/999");
        assert_eq!(account_path("999", "/999?page=2"), "/999?page=2");
        assert_eq!(account_path("999", "/9990/x"), "/999/9990/x");
    }

    #[test]
    fn map_buffer_error_unwraps_sdk_errors() {
        let boxed: tower::BoxError = Box::new(Error::new(ErrorCode::Forbidden, "nope"));
        assert_eq!(map_buffer_error(boxed).code(), ErrorCode::Forbidden);

        let other: tower::BoxError = "worker gone".into();
        assert_eq!(map_buffer_error(other).code(), ErrorCode::Network);
    }

    #[test]
    fn client_is_send_sync() {
        fn assert_send_sync<T: Send + Sync + Clone>() {}
        assert_send_sync::<Client>();
    }
}
