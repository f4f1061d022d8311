use crate::auth::{AuthStrategy, BearerAuth, TokenProvider};
use crate::cache::CacheStore;
use crate::client::{BufferedService, Client};
use crate::config::{BulkheadConfig, CircuitBreakerConfig, ClientConfig, RateLimitConfig};
use crate::error::Error;
use crate::hooks::{ChainHooks, Hooks, NoopHooks};
use crate::layers::{
    AuthLayer, CacheLayer, CircuitBreakerLayer, ObserveLayer, RateLimitLayer, RetryLayer,
    SecureRedirectPolicy, UserAgentLayer, reject_malformed_redirect,
};
use crate::policy::RetryPolicy;
use crate::response::ResponseBody;
use bytes::Bytes;
use figment::Figment;
use http::{Request, Response};
use http_body_util::{BodyExt, Full};
use hyper_rustls::HttpsConnector;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::{TokioExecutor, TokioTimer};
use std::sync::Arc;
use std::time::Duration;
use tower::buffer::Buffer;
use tower::limit::ConcurrencyLimitLayer;
use tower::load_shed::LoadShedLayer;
use tower::timeout::TimeoutLayer;
use tower::util::BoxCloneService;
use tower::{Layer, ServiceBuilder, ServiceExt};
use tower_http::decompression::DecompressionLayer;
use tower_http::follow_redirect::FollowRedirectLayer;

/// Type-erased service at the transport boundary.
///
/// Anything implementing this contract can replace the default hyper stack
/// via [`ClientBuilder::transport`].
pub type TransportService = BoxCloneService<Request<Full<Bytes>>, Response<ResponseBody>, Error>;

/// Requests queued ahead of the pipeline before callers wait for capacity.
const DEFAULT_BUFFER_CAPACITY: usize = 1024;

/// Builder for a [`Client`] and its tower middleware stack.
#[must_use]
pub struct ClientBuilder {
    config: ClientConfig,
    auth: Option<Arc<dyn AuthStrategy>>,
    /// Set when more than one credential source was supplied.
    auth_conflict: bool,
    hooks: ChainHooks,
    retry_policy: Option<RetryPolicy>,
    transport: Option<TransportService>,
    buffer_capacity: usize,
}

impl ClientBuilder {
    pub fn new() -> Self {
        Self::with_config(ClientConfig::default())
    }

    pub fn with_config(config: ClientConfig) -> Self {
        Self {
            config,
            auth: None,
            auth_conflict: false,
            hooks: ChainHooks::new(),
            retry_policy: None,
            transport: None,
            buffer_capacity: DEFAULT_BUFFER_CAPACITY,
        }
    }

    /// Builder seeded from `BASECAMP_*` environment variables.
    ///
    /// `BASECAMP_ACCESS_TOKEN`, when present, becomes the bearer credential.
    ///
    /// # Errors
    ///
    /// Returns a `Usage` error if the environment does not form a valid
    /// [`ClientConfig`].
    pub fn from_env() -> Result<Self, Error> {
        Self::from_figment(&ClientConfig::figment())
    }

    /// Builder seeded from an arbitrary figment (file, env, overrides).
    ///
    /// # Errors
    ///
    /// Returns a `Usage` error if extraction or validation fails.
    pub fn from_figment(figment: &Figment) -> Result<Self, Error> {
        let mut builder = Self::with_config(ClientConfig::from_figment(figment)?);
        if let Ok(token) = figment.extract_inner::<String>("access_token") {
            builder = builder.access_token(token);
        }
        Ok(builder)
    }

    /// Authenticate with a static bearer token.
    pub fn access_token(self, token: impl Into<String>) -> Self {
        self.set_auth(Arc::new(BearerAuth::new(token)))
    }

    /// Authenticate with bearer tokens from a provider, resolved per attempt.
    pub fn token_provider(self, provider: impl TokenProvider + 'static) -> Self {
        self.set_auth(Arc::new(BearerAuth::with_provider(provider)))
    }

    /// Authenticate with a custom strategy.
    pub fn auth(self, strategy: Arc<dyn AuthStrategy>) -> Self {
        self.set_auth(strategy)
    }

    fn set_auth(mut self, strategy: Arc<dyn AuthStrategy>) -> Self {
        if self.auth.is_some() {
            self.auth_conflict = true;
        }
        self.auth = Some(strategy);
        self
    }

    pub fn base_url(mut self, base_url: impl Into<String>) -> Self {
        self.config.base_url = base_url.into();
        self
    }

    pub fn account_id(mut self, account_id: impl Into<String>) -> Self {
        self.config.account_id = Some(account_id.into());
        self
    }

    pub fn user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.config.user_agent = user_agent.into();
        self
    }

    /// Enable or disable the ETag cache.
    pub fn cache(mut self, enabled: bool) -> Self {
        self.config.cache_enabled = enabled;
        self
    }

    pub fn cache_capacity(mut self, capacity: usize) -> Self {
        self.config.cache_capacity = capacity;
        self
    }

    /// Enable or disable automatic retries.
    pub fn retry(mut self, enabled: bool) -> Self {
        self.config.retry_enabled = enabled;
        self
    }

    /// Use one policy for every request instead of the per-operation table.
    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }

    pub fn max_pages(mut self, max_pages: usize) -> Self {
        self.config.max_pages = max_pages;
        self
    }

    /// Per-attempt transport timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.config.request_timeout = timeout;
        self
    }

    pub fn max_body_size(mut self, max_body_size: usize) -> Self {
        self.config.max_body_size = max_body_size;
        self
    }

    pub fn max_redirects(mut self, max_redirects: usize) -> Self {
        self.config.max_redirects = max_redirects;
        self
    }

    /// Fail fast for operations whose recent requests keep failing.
    pub fn circuit_breaker(mut self, config: CircuitBreakerConfig) -> Self {
        self.config.circuit_breaker = Some(config);
        self
    }

    /// Cap in-flight requests; the excess is rejected instead of queued.
    pub fn bulkhead(mut self, config: BulkheadConfig) -> Self {
        self.config.bulkhead = Some(config);
        self
    }

    /// Throttle requests client-side with a token bucket.
    pub fn rate_limit(mut self, config: RateLimitConfig) -> Self {
        self.config.rate_limit = Some(config);
        self
    }

    /// Circuit breaker, bulkhead and rate limiter with default settings.
    pub fn resilience(self) -> Self {
        self.circuit_breaker(CircuitBreakerConfig::default())
            .bulkhead(BulkheadConfig::default())
            .rate_limit(RateLimitConfig::default())
    }

    /// Register observability hooks. May be called more than once; hooks run
    /// in registration order (end events in reverse).
    pub fn hooks(mut self, hooks: Arc<dyn Hooks>) -> Self {
        self.hooks.push(hooks);
        self
    }

    /// Replace the hyper transport. Timeout, decompression and redirect
    /// handling are the replacement's responsibility.
    pub fn transport(mut self, transport: TransportService) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn buffer_capacity(mut self, capacity: usize) -> Self {
        self.buffer_capacity = capacity;
        self
    }

    /// Assemble the client.
    ///
    /// Must be called inside a Tokio runtime: the buffered front spawns its
    /// worker tasks here.
    ///
    /// # Errors
    ///
    /// Returns a `Usage` error when no credential (or more than one) was
    /// supplied, the configuration is invalid, or the TLS provider cannot be
    /// initialised.
    pub fn build(self) -> Result<Client, Error> {
        if self.auth_conflict {
            return Err(Error::usage("More than one credential was supplied")
                .with_hint("Use only one of access_token, token_provider or auth"));
        }
        let auth = self.auth.ok_or_else(|| {
            Error::usage("A credential is required")
                .with_hint("Set access_token, token_provider or auth on the builder")
        })?;
        self.config.validate()?;
        let base_url = self.config.parsed_base_url()?;

        if self.config.allows_plain_http() {
            tracing::warn!(
                base_url = %base_url,
                "plain HTTP allowed for localhost base URL; use only for testing"
            );
        }

        let transport = match self.transport {
            Some(transport) => transport,
            None => build_transport(&self.config)?,
        };

        let hooks: Arc<dyn Hooks> = if self.hooks.is_empty() {
            Arc::new(NoopHooks)
        } else {
            Arc::new(self.hooks)
        };
        let cache = self
            .config
            .cache_enabled
            .then(|| Arc::new(CacheStore::new(self.config.cache_capacity)));

        let ua_layer = UserAgentLayer::try_new(&self.config.user_agent)?;
        let auth_layer = AuthLayer::new(auth);
        let observe_layer = ObserveLayer::new(hooks.clone());

        // Outer to inner:
        //   Buffer -> CircuitBreaker? -> Bulkhead? -> RateLimit? -> Retry?
        //     -> Auth -> Observe -> Cache? -> UserAgent -> transport
        //
        // Auth inside Retry re-resolves credentials per attempt; Observe
        // inside Retry reports every attempt; Cache inside Auth sees the
        // Authorization header it isolates entries by.
        let mut service: TransportService = ua_layer.layer(transport.clone()).boxed_clone();
        if let Some(store) = &cache {
            service = CacheLayer::new(store.clone(), self.config.max_body_size)
                .layer(service)
                .boxed_clone();
        }
        service = ServiceBuilder::new()
            .layer(auth_layer.clone())
            .layer(observe_layer.clone())
            .service(service)
            .boxed_clone();
        if self.config.retry_enabled {
            let retry_layer = match self.retry_policy {
                Some(policy) => RetryLayer::with_policy(policy, hooks.clone()),
                None => RetryLayer::new(hooks.clone()),
            };
            service = retry_layer.layer(service).boxed_clone();
        }
        if let Some(rate_limit) = &self.config.rate_limit {
            service = RateLimitLayer::new(rate_limit.clone())
                .layer(service)
                .boxed_clone();
        }
        // LoadShed turns a saturated ConcurrencyLimit into an immediate
        // Overloaded error instead of a wait.
        if let Some(bulkhead) = &self.config.bulkhead {
            service = ServiceBuilder::new()
                .layer(LoadShedLayer::new())
                .layer(ConcurrencyLimitLayer::new(bulkhead.max_concurrent))
                .service(service)
                .map_err(map_load_shed_error)
                .boxed_clone();
        }
        if let Some(circuit_breaker) = &self.config.circuit_breaker {
            service = CircuitBreakerLayer::new(circuit_breaker.clone())
                .layer(service)
                .boxed_clone();
        }

        // Pagination follow-ups: authenticated and observed, never cached or retried.
        let raw: TransportService = ServiceBuilder::new()
            .layer(auth_layer)
            .layer(observe_layer)
            .layer(ua_layer)
            .service(transport)
            .boxed_clone();

        let buffer_capacity = self.buffer_capacity.max(1);
        let pipeline: BufferedService = Buffer::new(service, buffer_capacity);
        let raw: BufferedService = Buffer::new(raw, buffer_capacity);

        Ok(Client {
            pipeline,
            raw,
            config: Arc::new(self.config),
            base_url,
            hooks,
            cache,
        })
    }
}

impl Default for ClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// The default transport: hyper over rustls with per-attempt timeout,
/// decompression and guarded redirects.
fn build_transport(config: &ClientConfig) -> Result<TransportService, Error> {
    let https = build_https_connector(config.allows_plain_http())?;

    // pool_timer is required for the pool's idle timeout to take effect.
    let hyper_client = hyper_util::client::legacy::Client::builder(TokioExecutor::new())
        .pool_timer(TokioTimer::new())
        .build::<_, Full<Bytes>>(https);

    let timeout = config.request_timeout;
    let service = ServiceBuilder::new()
        .layer(TimeoutLayer::new(timeout))
        .layer(DecompressionLayer::new())
        .layer(FollowRedirectLayer::with_policy(SecureRedirectPolicy::new(
            config.max_redirects,
        )))
        .service(hyper_client)
        .map_response(map_decompression_response)
        .map_err(move |e: tower::BoxError| map_tower_error(e, timeout))
        .map_result(|result| result.and_then(reject_malformed_redirect));

    Ok(service.boxed_clone())
}

/// Timeouts and connection failures are `Network` errors; errors that are
/// already ours pass through.
fn map_tower_error(err: tower::BoxError, timeout: Duration) -> Error {
    if err.is::<tower::timeout::error::Elapsed>() {
        return Error::network(err).with_hint(format!(
            "Request timed out after {}",
            humantime::format_duration(timeout)
        ));
    }
    match err.downcast::<Error>() {
        Ok(err) => *err,
        Err(other) => Error::network(other),
    }
}

/// A shed request becomes `Overloaded`; inner errors pass through.
fn map_load_shed_error(err: tower::BoxError) -> Error {
    if err.is::<tower::load_shed::error::Overloaded>() {
        return Error::overloaded("Bulkhead is full")
            .with_hint("Too many requests in flight; try again shortly")
            .with_retryable(true);
    }
    match err.downcast::<Error>() {
        Ok(err) => *err,
        Err(other) => Error::network(other),
    }
}

fn map_decompression_response<B>(response: Response<B>) -> Response<ResponseBody>
where
    B: hyper::body::Body<Data = Bytes> + Send + Sync + 'static,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let (parts, body) = response.into_parts();
    Response::from_parts(parts, body.map_err(Into::into).boxed())
}

/// Installed process default provider, falling back to aws-lc-rs.
fn crypto_provider() -> Arc<rustls::crypto::CryptoProvider> {
    rustls::crypto::CryptoProvider::get_default()
        .cloned()
        .unwrap_or_else(|| Arc::new(rustls::crypto::aws_lc_rs::default_provider()))
}

fn build_https_connector(allow_http: bool) -> Result<HttpsConnector<HttpConnector>, Error> {
    let builder = hyper_rustls::HttpsConnectorBuilder::new()
        .with_provider_and_webpki_roots(crypto_provider())
        .map_err(|e| Error::usage("Failed to initialise TLS").with_source(e))?;
    let connector = if allow_http {
        builder.https_or_http().enable_all_versions().build()
    } else {
        builder.https_only().enable_all_versions().build()
    };
    Ok(connector)
}
