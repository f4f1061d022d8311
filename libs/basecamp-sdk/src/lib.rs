#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
#![warn(warnings)]

//! Request pipeline for the Basecamp 3/4 REST API.
//!
//! Generated per-resource service code calls into this crate through two
//! entry points: [`Client::execute_operation`] for one logical operation and
//! [`Client::request`] / [`RequestBuilder::send`] for one raw exchange.
//! Every request passes a tower middleware stack providing:
//! - Credential injection per attempt ([`AuthStrategy`]: bearer tokens, static
//!   or refreshing, and custom header schemes)
//! - Retries with exponential, linear or constant backoff and jitter, honoring
//!   `Retry-After` on 429, with a per-operation [`RetryPolicy`]
//! - An in-memory ETag cache with `If-None-Match` revalidation, isolated per
//!   credential
//! - Observability [`Hooks`] for operations, attempts and retries
//! - Optional client-side resilience: a per-operation circuit breaker, a
//!   fail-fast bulkhead and a token-bucket rate limiter
//! - `Link`-header pagination that never leaves the API origin
//! - HTTPS-only transport (hyper + rustls) except for localhost, with
//!   transparent decompression and credential-stripping redirects
//!
//! # Example
//!
//! ```ignore
//! use basecamp_sdk::{Client, OperationInfo, Unwrap};
//!
//! let client = Client::builder()
//!     .access_token(token)
//!     .account_id("999")
//!     .build()?;
//!
//! let todo: Option<Todo> = client
//!     .execute_operation(
//!         OperationInfo::new("Todos", "GetTodo", "todo").project(1).resource(2),
//!         client.get("/buckets/1/todos/2.json"),
//!         Unwrap::None,
//!     )
//!     .await?;
//!
//! let projects = client.fetch_all_pages::<Project>("/projects.json", None).await?;
//! println!("{} of {}", projects.len(), projects.meta.total_count);
//! ```

mod auth;
mod builder;
mod cache;
mod client;
mod config;
mod error;
pub mod hooks;
pub mod layers;
pub mod normalize;
mod operation;
mod pagination;
pub mod policy;
mod request;
mod response;
pub mod routes;
pub mod security;

pub use auth::{AuthStrategy, BearerAuth, HeaderAuth, StaticToken, TokenProvider};
pub use builder::{ClientBuilder, TransportService};
pub use cache::{CACHE_STATUS_HEADER, CacheStore};
pub use client::Client;
pub use config::{
    BulkheadConfig, CircuitBreakerConfig, ClientConfig, DEFAULT_BASE_URL, DEFAULT_CACHE_CAPACITY, DEFAULT_MAX_PAGES, DEFAULT_USER_AGENT,
    ENV_PREFIX, RateLimitConfig,
};
pub use error::{Error, ErrorCode, REQUEST_ID_HEADER};
pub use hooks::{
    ChainHooks, Hooks, NoopHooks, OperationInfo, RequestInfo, RequestResult, TracingHooks,
};
pub use operation::Unwrap;
pub use pagination::{ListMeta, ListResult, parse_next_link};
pub use policy::{Backoff, RetryPolicy};
pub use request::RequestBuilder;
pub use response::{HttpResponse, ResponseBody, TOTAL_COUNT_HEADER, parse_retry_after};
