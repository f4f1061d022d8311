use crate::error::Error;
use crate::security::{MAX_RESPONSE_BODY_BYTES, is_localhost, is_secure_endpoint};
use figment::Figment;
use figment::providers::{Env, Serialized};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use url::Url;

/// Default API host.
pub const DEFAULT_BASE_URL: &str = "https://3.basecampapi.com";

/// Default User-Agent string for API requests.
pub const DEFAULT_USER_AGENT: &str = concat!("basecamp-sdk/", env!("CARGO_PKG_VERSION"));

/// Default number of ETag cache entries kept per client.
pub const DEFAULT_CACHE_CAPACITY: usize = 1000;

/// Default ceiling on pages walked by one pagination call.
pub const DEFAULT_MAX_PAGES: usize = 10_000;

/// Prefix for environment variables read by [`ClientConfig::from_env`].
pub const ENV_PREFIX: &str = "BASECAMP_";

/// Client configuration.
///
/// Credentials and hooks are not part of this struct; they are supplied to
/// [`ClientBuilder`](crate::ClientBuilder) directly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// API base URL. Must be HTTPS unless it is a localhost form.
    ///
    /// Env: `BASECAMP_BASE_URL`. Default: `https://3.basecampapi.com`.
    pub base_url: String,

    /// Numeric account (tenant) id prefixed to relative request paths.
    ///
    /// Env: `BASECAMP_ACCOUNT_ID`.
    #[serde(deserialize_with = "account_id_str")]
    pub account_id: Option<String>,

    /// Env: `BASECAMP_USER_AGENT`. Default: `basecamp-sdk/<version>`.
    pub user_agent: String,

    /// Enable the in-memory ETag cache for GET requests.
    ///
    /// Env: `BASECAMP_CACHE_ENABLED`. Default: `true`.
    pub cache_enabled: bool,

    /// Maximum cached responses before the oldest is evicted. Default: 1000.
    pub cache_capacity: usize,

    /// Enable automatic retries. Default: `true`.
    pub retry_enabled: bool,

    /// Safety ceiling on pages fetched by one pagination walk. Default: 10,000.
    pub max_pages: usize,

    /// Per-attempt transport timeout, as a humantime string (`"30s"`).
    #[serde(with = "duration_str")]
    pub request_timeout: Duration,

    /// Maximum size of a successful response body in bytes. Default: 50 MiB.
    pub max_body_size: usize,

    /// Maximum redirects followed per request. Default: 10.
    pub max_redirects: usize,

    /// Per-operation circuit breaker. Disabled when `None`.
    ///
    /// Env: `BASECAMP_CIRCUIT_BREAKER__<FIELD>`.
    pub circuit_breaker: Option<CircuitBreakerConfig>,

    /// Client-wide cap on in-flight requests. Disabled when `None`.
    ///
    /// Env: `BASECAMP_BULKHEAD__MAX_CONCURRENT`.
    pub bulkhead: Option<BulkheadConfig>,

    /// Client-side token bucket. Disabled when `None`.
    ///
    /// Env: `BASECAMP_RATE_LIMIT__<FIELD>`.
    pub rate_limit: Option<RateLimitConfig>,
}

/// Circuit breaker thresholds, applied per operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit. Default: 5.
    pub failure_threshold: u32,
    /// Half-open successes that close it again. Default: 2.
    pub success_threshold: u32,
    /// Time spent open before trial requests are let through. Default: 30s.
    #[serde(with = "duration_str")]
    pub open_timeout: Duration,
    /// Failure percentage over a full window that also opens it. Default: 50.
    pub failure_rate_percent: u8,
    /// Outcomes kept for the failure-rate check. Default: 10.
    pub window_size: usize,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            open_timeout: Duration::from_secs(30),
            failure_rate_percent: 50,
            window_size: 10,
        }
    }
}

/// Concurrency cap. Requests beyond it fail fast with `Overloaded`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BulkheadConfig {
    /// Default: 10.
    pub max_concurrent: usize,
}

impl Default for BulkheadConfig {
    fn default() -> Self {
        Self { max_concurrent: 10 }
    }
}

/// Token bucket shared by every request of a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Sustained refill rate. Default: 50.
    pub requests_per_second: u32,
    /// Bucket capacity. Default: 10.
    pub burst: u32,
    /// Pause all requests after a 429 (or a 503 with `Retry-After`) until
    /// the server's delay has passed. Default: `true`.
    pub respect_retry_after: bool,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_second: 50,
            burst: 10,
            respect_retry_after: true,
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_owned(),
            account_id: None,
            user_agent: DEFAULT_USER_AGENT.to_owned(),
            cache_enabled: true,
            cache_capacity: DEFAULT_CACHE_CAPACITY,
            retry_enabled: true,
            max_pages: DEFAULT_MAX_PAGES,
            request_timeout: Duration::from_secs(30),
            max_body_size: MAX_RESPONSE_BODY_BYTES,
            max_redirects: 10,
            circuit_breaker: None,
            bulkhead: None,
            rate_limit: None,
        }
    }
}

impl ClientConfig {
    /// Figment merging defaults with `BASECAMP_*` environment variables.
    ///
    /// Nested sections use a double underscore:
    /// `BASECAMP_CIRCUIT_BREAKER__FAILURE_THRESHOLD=3`.
    #[must_use]
    pub fn figment() -> Figment {
        Figment::new()
            .merge(Serialized::defaults(Self::default()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Load configuration from the environment (with defaults) and validate it.
    ///
    /// # Errors
    ///
    /// Returns a `Usage` error if a variable cannot be parsed or the result
    /// fails [`validate`](Self::validate).
    pub fn from_env() -> Result<Self, Error> {
        Self::from_figment(&Self::figment())
    }

    /// Extract and validate configuration from any figment.
    ///
    /// # Errors
    ///
    /// Returns a `Usage` error on extraction or validation failure.
    pub fn from_figment(figment: &Figment) -> Result<Self, Error> {
        let config: Self = figment.extract().map_err(|e| {
            Error::usage("Invalid client configuration")
                .with_hint(e.to_string())
                .with_source(e)
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Check the invariants the pipeline relies on.
    ///
    /// # Errors
    ///
    /// Returns a `Usage` error when the base URL is not absolute, uses plain
    /// HTTP on a non-localhost host, the account id is not numeric, or a
    /// resilience threshold is zero.
    pub fn validate(&self) -> Result<(), Error> {
        let url = self.parsed_base_url()?;
        if !is_secure_endpoint(&url) {
            return Err(Error::usage(format!("Base URL must use HTTPS: {}", self.base_url)));
        }
        if let Some(account_id) = &self.account_id {
            validate_account_id(account_id)?;
        }
        if self.max_pages == 0 {
            return Err(Error::usage("max_pages must be at least 1"));
        }
        if let Some(cb) = &self.circuit_breaker {
            if cb.failure_threshold == 0 || cb.success_threshold == 0 || cb.window_size == 0 {
                return Err(Error::usage(
                    "Circuit breaker thresholds and window size must be at least 1",
                ));
            }
            if !(1..=100).contains(&cb.failure_rate_percent) {
                return Err(Error::usage(
                    "Circuit breaker failure_rate_percent must be between 1 and 100",
                ));
            }
        }
        if self.bulkhead.as_ref().is_some_and(|b| b.max_concurrent == 0) {
            return Err(Error::usage("Bulkhead max_concurrent must be at least 1"));
        }
        if let Some(rl) = &self.rate_limit
            && (rl.requests_per_second == 0 || rl.burst == 0)
        {
            return Err(Error::usage("Rate limit requests_per_second and burst must be at least 1"));
        }
        Ok(())
    }

    pub(crate) fn parsed_base_url(&self) -> Result<Url, Error> {
        let url = Url::parse(&self.base_url).map_err(|e| {
            Error::usage(format!("Invalid base URL: {}", self.base_url)).with_source(e)
        })?;
        if !url.has_host() {
            return Err(Error::usage(format!("Base URL has no host: {}", self.base_url)));
        }
        Ok(url)
    }

    /// Whether plain HTTP must be accepted by the transport (localhost base URL).
    pub(crate) fn allows_plain_http(&self) -> bool {
        self.parsed_base_url().is_ok_and(|url| is_localhost(&url))
    }
}

/// Account ids are positive integers.
pub(crate) fn validate_account_id(account_id: &str) -> Result<(), Error> {
    if !account_id.is_empty() && account_id.bytes().all(|b| b.is_ascii_digit()) {
        Ok(())
    } else {
        Err(Error::usage(format!("Account id must be numeric: {account_id}")))
    }
}

/// Environment values arrive as numbers; accept either form.
fn account_id_str<'de, D: serde::Deserializer<'de>>(d: D) -> Result<Option<String>, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Num(u64),
        Str(String),
    }

    Ok(Option::<Raw>::deserialize(d)?.map(|raw| match raw {
        Raw::Num(n) => n.to_string(),
        Raw::Str(s) => s,
    }))
}

mod duration_str {
    use serde::{Deserialize, Deserializer, Serializer, de};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&humantime::format_duration(*d).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(d)?;
        humantime::parse_duration(&raw).map_err(de::Error::custom)
    }
}
