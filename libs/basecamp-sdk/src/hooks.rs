//! Observability callbacks for operations and HTTP attempts.
//!
//! Hooks are pure observers: their return values are ignored and panics
//! raised inside them are caught and logged, never propagated.

use crate::error::Error;
use http::{Method, StatusCode};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

/// Describes one logical SDK call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationInfo {
    /// Service grouping, e.g. `"Todos"`.
    pub service: &'static str,
    /// Operation name from the operation table, e.g. `"GetTodo"`.
    pub operation: &'static str,
    pub resource_type: &'static str,
    pub is_mutation: bool,
    pub project_id: Option<i64>,
    pub resource_id: Option<i64>,
}

impl OperationInfo {
    #[must_use]
    pub fn new(service: &'static str, operation: &'static str, resource_type: &'static str) -> Self {
        Self {
            service,
            operation,
            resource_type,
            is_mutation: false,
            project_id: None,
            resource_id: None,
        }
    }

    #[must_use]
    pub fn mutation(mut self) -> Self {
        self.is_mutation = true;
        self
    }

    #[must_use]
    pub fn project(mut self, project_id: i64) -> Self {
        self.project_id = Some(project_id);
        self
    }

    #[must_use]
    pub fn resource(mut self, resource_id: i64) -> Self {
        self.resource_id = Some(resource_id);
        self
    }
}

/// Describes one outgoing HTTP attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestInfo {
    pub method: Method,
    pub url: String,
    /// 1-based attempt number.
    pub attempt: u32,
}

/// Outcome of one HTTP attempt.
#[derive(Debug, Clone, Copy)]
pub struct RequestResult<'a> {
    pub status: Option<StatusCode>,
    pub duration: Duration,
    pub error: Option<&'a Error>,
    /// Body was served from the ETag cache after a 304.
    pub from_cache: bool,
}

/// Observer for operation and request lifecycles. All methods default to no-ops.
pub trait Hooks: Send + Sync {
    fn on_operation_start(&self, _op: &OperationInfo) {}

    fn on_operation_end(&self, _op: &OperationInfo, _error: Option<&Error>, _duration: Duration) {}

    fn on_request_start(&self, _req: &RequestInfo) {}

    fn on_request_end(&self, _req: &RequestInfo, _result: &RequestResult<'_>) {}

    /// Called before sleeping ahead of a retry. `attempt` is the 1-based
    /// number of the attempt that failed.
    fn on_retry(&self, _req: &RequestInfo, _attempt: u32, _error: &Error, _delay: Duration) {}
}

/// Hooks that do nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopHooks;

impl Hooks for NoopHooks {}

/// Fans events out to several hooks.
///
/// Start events run in registration order, end events in reverse, so
/// nested observers (timers, spans) unwind symmetrically.
#[derive(Clone, Default)]
pub struct ChainHooks {
    hooks: Vec<Arc<dyn Hooks>>,
}

impl ChainHooks {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with(mut self, hooks: Arc<dyn Hooks>) -> Self {
        self.hooks.push(hooks);
        self
    }

    pub fn push(&mut self, hooks: Arc<dyn Hooks>) {
        self.hooks.push(hooks);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }
}

impl std::fmt::Debug for ChainHooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChainHooks")
            .field("len", &self.hooks.len())
            .finish()
    }
}

impl Hooks for ChainHooks {
    fn on_operation_start(&self, op: &OperationInfo) {
        for h in &self.hooks {
            guarded("on_operation_start", || h.on_operation_start(op));
        }
    }

    fn on_operation_end(&self, op: &OperationInfo, error: Option<&Error>, duration: Duration) {
        for h in self.hooks.iter().rev() {
            guarded("on_operation_end", || h.on_operation_end(op, error, duration));
        }
    }

    fn on_request_start(&self, req: &RequestInfo) {
        for h in &self.hooks {
            guarded("on_request_start", || h.on_request_start(req));
        }
    }

    fn on_request_end(&self, req: &RequestInfo, result: &RequestResult<'_>) {
        for h in self.hooks.iter().rev() {
            guarded("on_request_end", || h.on_request_end(req, result));
        }
    }

    fn on_retry(&self, req: &RequestInfo, attempt: u32, error: &Error, delay: Duration) {
        for h in &self.hooks {
            guarded("on_retry", || h.on_retry(req, attempt, error, delay));
        }
    }
}

/// Emits `tracing` events for every lifecycle callback.
///
/// Successful lifecycle events are `debug`; failures and retries are `warn`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingHooks;

impl Hooks for TracingHooks {
    fn on_operation_start(&self, op: &OperationInfo) {
        tracing::debug!(
            service = op.service,
            operation = op.operation,
            resource_type = op.resource_type,
            is_mutation = op.is_mutation,
            project_id = ?op.project_id,
            resource_id = ?op.resource_id,
            "basecamp operation started"
        );
    }

    fn on_operation_end(&self, op: &OperationInfo, error: Option<&Error>, duration: Duration) {
        let duration_ms = duration.as_millis();
        match error {
            None => tracing::debug!(
                service = op.service,
                operation = op.operation,
                duration_ms,
                "basecamp operation completed"
            ),
            Some(err) => tracing::warn!(
                service = op.service,
                operation = op.operation,
                duration_ms,
                code = err.code().as_str(),
                error = %err,
                "basecamp operation failed"
            ),
        }
    }

    fn on_request_start(&self, req: &RequestInfo) {
        tracing::debug!(
            method = %req.method,
            url = %req.url,
            attempt = req.attempt,
            "basecamp request started"
        );
    }

    fn on_request_end(&self, req: &RequestInfo, result: &RequestResult<'_>) {
        let duration_ms = result.duration.as_millis();
        let status = result.status.map(|s| s.as_u16());
        match result.error {
            None => tracing::debug!(
                method = %req.method,
                url = %req.url,
                attempt = req.attempt,
                status,
                duration_ms,
                from_cache = result.from_cache,
                "basecamp request completed"
            ),
            Some(err) => tracing::warn!(
                method = %req.method,
                url = %req.url,
                attempt = req.attempt,
                duration_ms,
                error = %err,
                "basecamp request failed"
            ),
        }
    }

    fn on_retry(&self, req: &RequestInfo, attempt: u32, error: &Error, delay: Duration) {
        tracing::warn!(
            method = %req.method,
            url = %req.url,
            attempt,
            delay_ms = delay.as_millis(),
            error = %error,
            "basecamp request will be retried"
        );
    }
}

/// Run a hook callback, swallowing any panic.
pub(crate) fn guarded(event: &'static str, f: impl FnOnce()) {
    if std::panic::catch_unwind(AssertUnwindSafe(f)).is_err() {
        tracing::warn!(event, "observability hook panicked; ignoring");
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use parking_lot::Mutex;
    use tracing_test::traced_test;

    struct Recorder {
        name: &'static str,
        log: Arc<Mutex<Vec<String>>>,
    }

    impl Hooks for Recorder {
        fn on_operation_start(&self, op: &OperationInfo) {
            self.log.lock().push(format!("{}:start:{}", self.name, op.operation));
        }

        fn on_operation_end(&self, op: &OperationInfo, _: Option<&Error>, _: Duration) {
            self.log.lock().push(format!("{}:end:{}", self.name, op.operation));
        }
    }

    struct Panicky;

    impl Hooks for Panicky {
        fn on_operation_start(&self, _: &OperationInfo) {
            panic!("hook exploded");
        }
    }

    fn info() -> OperationInfo {
        OperationInfo::new("Todos", "GetTodo", "todo").project(1).resource(2)
    }

    #[test]
    fn chain_runs_starts_forward_and_ends_in_reverse() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let chain = ChainHooks::new()
            .with(Arc::new(Recorder { name: "a", log: log.clone() }))
            .with(Arc::new(Recorder { name: "b", log: log.clone() }));

        chain.on_operation_start(&info());
        chain.on_operation_end(&info(), None, Duration::ZERO);

        assert_eq!(
            *log.lock(),
            ["a:start:GetTodo", "b:start:GetTodo", "b:end:GetTodo", "a:end:GetTodo"]
        );
    }

    #[test]
    fn panicking_hook_does_not_stop_chain() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let chain = ChainHooks::new()
            .with(Arc::new(Panicky))
            .with(Arc::new(Recorder { name: "after", log: log.clone() }));

        chain.on_operation_start(&info());
        assert_eq!(*log.lock(), ["after:start:GetTodo"]);
    }

    #[test]
    fn operation_info_builders() {
        let op = OperationInfo::new("Todos", "CreateTodo", "todo").mutation().project(7);
        assert!(op.is_mutation);
        assert_eq!(op.project_id, Some(7));
        assert_eq!(op.resource_id, None);
    }

    #[traced_test]
    #[test]
    fn tracing_hooks_log_failures() {
        let err = Error::new(ErrorCode::NotFound, "Resource not found");
        TracingHooks.on_operation_end(&info(), Some(&err), Duration::from_millis(12));
        assert!(logs_contain("basecamp operation failed"));
        assert!(logs_contain("not_found"));
    }

    #[traced_test]
    #[test]
    fn guarded_logs_panics() {
        guarded("on_test", || panic!("boom"));
        assert!(logs_contain("observability hook panicked"));
    }
}
