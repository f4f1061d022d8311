use crate::config::CircuitBreakerConfig;
use crate::error::{Error, ErrorCode};
use crate::normalize::operation_key;
use crate::response::ResponseBody;
use bytes::Bytes;
use http::{Request, Response};
use http_body_util::Full;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::time::Instant;
use tower::{Layer, Service};

/// State of one operation's circuit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Requests flow normally.
    Closed,
    /// Requests are rejected until the open timeout elapses.
    Open,
    /// Trial requests are let through; successes close the circuit.
    HalfOpen,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Success,
    Failure,
    Neutral,
}

/// 5xx responses and transport errors count against the circuit. 4xx and
/// client-side rejections count neither way.
fn classify(result: &Result<Response<ResponseBody>, Error>) -> Outcome {
    match result {
        Ok(resp) if resp.status().is_server_error() => Outcome::Failure,
        Ok(resp) if resp.status().is_client_error() => Outcome::Neutral,
        Ok(_) => Outcome::Success,
        Err(e) if e.code() == ErrorCode::Network => Outcome::Failure,
        Err(e) if e.http_status().is_some_and(|s| s.is_server_error()) => Outcome::Failure,
        Err(_) => Outcome::Neutral,
    }
}

#[derive(Debug)]
struct Circuit {
    state: CircuitState,
    consecutive_failures: u32,
    half_open_successes: u32,
    last_failure: Option<Instant>,
    // true = success
    window: VecDeque<bool>,
}

impl Circuit {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            half_open_successes: 0,
            last_failure: None,
            window: VecDeque::new(),
        }
    }

    /// `Err` carries the time left until trial requests are allowed.
    fn admit(&mut self, config: &CircuitBreakerConfig, now: Instant) -> Result<(), Duration> {
        if self.state != CircuitState::Open {
            return Ok(());
        }
        let opened = self.last_failure.unwrap_or(now);
        let elapsed = now.saturating_duration_since(opened);
        if elapsed >= config.open_timeout {
            self.state = CircuitState::HalfOpen;
            self.half_open_successes = 0;
            Ok(())
        } else {
            Err(config.open_timeout - elapsed)
        }
    }

    fn record(&mut self, config: &CircuitBreakerConfig, outcome: Outcome, now: Instant) {
        match outcome {
            Outcome::Neutral => {}
            Outcome::Success => {
                self.push(config, true);
                match self.state {
                    CircuitState::HalfOpen => {
                        self.half_open_successes += 1;
                        if self.half_open_successes >= config.success_threshold {
                            self.close();
                        }
                    }
                    CircuitState::Closed => self.consecutive_failures = 0,
                    CircuitState::Open => {}
                }
            }
            Outcome::Failure => {
                self.last_failure = Some(now);
                self.push(config, false);
                match self.state {
                    CircuitState::Closed => {
                        self.consecutive_failures += 1;
                        if self.consecutive_failures >= config.failure_threshold
                            || self.failure_rate_exceeded(config)
                        {
                            self.state = CircuitState::Open;
                        }
                    }
                    CircuitState::HalfOpen => self.state = CircuitState::Open,
                    CircuitState::Open => {}
                }
            }
        }
    }

    fn push(&mut self, config: &CircuitBreakerConfig, success: bool) {
        self.window.push_back(success);
        while self.window.len() > config.window_size {
            self.window.pop_front();
        }
    }

    fn failure_rate_exceeded(&self, config: &CircuitBreakerConfig) -> bool {
        if self.window.len() < config.window_size {
            return false;
        }
        let failures = self.window.iter().filter(|ok| !**ok).count();
        failures * 100 >= usize::from(config.failure_rate_percent) * self.window.len()
    }

    fn close(&mut self) {
        self.state = CircuitState::Closed;
        self.consecutive_failures = 0;
        self.half_open_successes = 0;
        self.window.clear();
    }
}

struct Registry {
    config: CircuitBreakerConfig,
    circuits: Mutex<HashMap<String, Circuit>>,
}

impl Registry {
    fn admit(&self, scope: &str) -> Result<(), Duration> {
        let mut circuits = self.circuits.lock();
        let circuit = circuits.entry(scope.to_owned()).or_insert_with(Circuit::new);
        let before = circuit.state;
        let result = circuit.admit(&self.config, Instant::now());
        if before == CircuitState::Open && circuit.state == CircuitState::HalfOpen {
            tracing::debug!(scope, "Circuit half-open; letting trial requests through");
        }
        result
    }

    fn record(&self, scope: &str, outcome: Outcome) {
        let mut circuits = self.circuits.lock();
        let circuit = circuits.entry(scope.to_owned()).or_insert_with(Circuit::new);
        let before = circuit.state;
        circuit.record(&self.config, outcome, Instant::now());
        match (before, circuit.state) {
            (CircuitState::Open, _) => {}
            (_, CircuitState::Open) => tracing::warn!(scope, "Circuit opened"),
            (CircuitState::HalfOpen, CircuitState::Closed) => {
                tracing::debug!(scope, "Circuit closed");
            }
            _ => {}
        }
    }
}

/// Fails fast for operations whose recent requests keep failing.
///
/// Each operation (method plus normalized path) has its own circuit. While a
/// circuit is open, requests are rejected with [`ErrorCode::Overloaded`]
/// without reaching the network.
#[derive(Clone)]
pub struct CircuitBreakerLayer {
    registry: Arc<Registry>,
}

impl CircuitBreakerLayer {
    #[must_use]
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            registry: Arc::new(Registry {
                config,
                circuits: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Current state of the circuit for `method` and `url`.
    #[must_use]
    pub fn state(&self, method: &http::Method, url: &str) -> CircuitState {
        let scope = operation_key(method, url);
        self.registry
            .circuits
            .lock()
            .get(&scope)
            .map_or(CircuitState::Closed, |c| c.state)
    }
}

impl<S> Layer<S> for CircuitBreakerLayer {
    type Service = CircuitBreakerService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        CircuitBreakerService {
            inner,
            registry: self.registry.clone(),
        }
    }
}

#[derive(Clone)]
pub struct CircuitBreakerService<S> {
    inner: S,
    registry: Arc<Registry>,
}

impl<S> Service<Request<Full<Bytes>>> for CircuitBreakerService<S>
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
        let registry = self.registry.clone();
        let scope = operation_key(req.method(), &req.uri().to_string());

        Box::pin(async move {
            if let Err(wait) = registry.admit(&scope) {
                return Err(Error::overloaded("Circuit breaker is open")
                    .with_hint(format!(
                        "{scope} is failing; next attempt allowed in {}",
                        humantime::format_duration(Duration::from_secs(wait.as_secs().max(1)))
                    ))
                    .with_retryable(true)
                    .with_retry_after(wait));
            }
            // A dropped future records nothing, so cancellation is neutral.
            let result = inner.call(req).await;
            registry.record(&scope, classify(&result));
            result
        })
    }
}
