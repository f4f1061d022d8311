//! Tower layers that make up the request pipeline.
//!
//! Outer to inner: [`CircuitBreakerLayer`], the bulkhead (tower load shed
//! over a concurrency limit), [`RateLimitLayer`], [`RetryLayer`],
//! [`AuthLayer`], [`ObserveLayer`], [`CacheLayer`], [`UserAgentLayer`], then
//! the transport (timeout, decompression and [`SecureRedirectPolicy`] around
//! hyper). The first three are optional.

mod auth;
mod cache;
mod circuit_breaker;
mod observe;
mod rate_limit;
mod redirect;
mod retry;
mod user_agent;

pub use auth::{AuthLayer, AuthService};
pub use cache::{CacheLayer, CacheService};
pub use circuit_breaker::{CircuitBreakerLayer, CircuitBreakerService, CircuitState};
pub use observe::{ObserveLayer, ObserveService};
pub use rate_limit::{RateLimitLayer, RateLimitService};
pub use redirect::SecureRedirectPolicy;
pub(crate) use redirect::reject_malformed_redirect;
pub use retry::{Attempt, RETRY_ATTEMPT_HEADER, RetryLayer, RetryService};
pub use user_agent::{UserAgentLayer, UserAgentService};
