//! One logical SDK call: lifecycle hooks around a request, status
//! translation, JSON decoding and envelope unwrapping.

use crate::client::Client;
use crate::error::{Error, ErrorCode};
use crate::hooks::{OperationInfo, guarded};
use crate::request::RequestBuilder;
use crate::response::HttpResponse;
use http::StatusCode;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::time::Instant;

/// How to get the payload out of a decoded response body.
#[derive(Debug, Clone, Copy, Default)]
pub enum Unwrap {
    /// The body is the payload.
    #[default]
    None,
    /// The payload is this top-level field, e.g. `{"todo": {...}}`.
    Field(&'static str),
    /// Custom extraction.
    With(fn(Value) -> Value),
}

impl Unwrap {
    fn apply(self, value: Value) -> Result<Value, Error> {
        match self {
            Self::None => Ok(value),
            Self::Field(name) => match value {
                Value::Object(mut map) => map.remove(name).ok_or_else(|| missing_field(name)),
                _ => Err(missing_field(name)),
            },
            Self::With(f) => Ok(f(value)),
        }
    }
}

fn missing_field(name: &str) -> Error {
    Error::new(
        ErrorCode::ApiError,
        format!("Response is missing the `{name}` field"),
    )
}

impl Client {
    /// Run `request` as the operation described by `info`.
    ///
    /// Emits `on_operation_start` and `on_operation_end`. Non-2xx statuses
    /// become structured errors. A 204, an empty body or a JSON `null`
    /// yields `Ok(None)`.
    ///
    /// # Errors
    ///
    /// Returns the structured error for a failed request or status, or
    /// `ApiError` when the payload cannot be decoded as `T`.
    pub async fn execute_operation<T: DeserializeOwned>(
        &self,
        info: OperationInfo,
        request: RequestBuilder,
        unwrap: Unwrap,
    ) -> Result<Option<T>, Error> {
        let hooks = &self.hooks;
        guarded("on_operation_start", || hooks.on_operation_start(&info));
        let start = Instant::now();

        let result = match request.send().await {
            Ok(response) => decode(response, unwrap).await,
            Err(e) => Err(e),
        };

        let duration = start.elapsed();
        guarded("on_operation_end", || {
            hooks.on_operation_end(&info, result.as_ref().err(), duration);
        });
        result
    }
}

async fn decode<T: DeserializeOwned>(response: HttpResponse, unwrap: Unwrap) -> Result<Option<T>, Error> {
    let response = response.error_for_status().await?;
    if response.status() == StatusCode::NO_CONTENT {
        return Ok(None);
    }
    let bytes = response.bytes().await?;
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Ok(None);
    }
    let value: Value = serde_json::from_slice(&bytes)?;
    if value.is_null() {
        return Ok(None);
    }
    let payload = unwrap.apply(value)?;
    Ok(Some(serde_json::from_value(payload)?))
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::hooks::{Hooks, RequestInfo, RequestResult};
    use httpmock::prelude::*;
    use parking_lot::Mutex;
    use serde::Deserialize;
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Todo {
        id: i64,
        content: String,
    }

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<String>>,
        cache_hits: Mutex<Vec<bool>>,
    }

    impl Hooks for Recorder {
        fn on_operation_start(&self, op: &OperationInfo) {
            self.events.lock().push(format!("start {}", op.operation));
        }

        fn on_operation_end(&self, op: &OperationInfo, error: Option<&Error>, _duration: Duration) {
            let outcome = error.map_or("ok", |e| e.code().as_str());
            self.events.lock().push(format!("end {} {outcome}", op.operation));
        }

        fn on_request_end(&self, _req: &RequestInfo, result: &RequestResult<'_>) {
            self.cache_hits.lock().push(result.from_cache);
        }
    }

    fn client_with(server: &MockServer, hooks: Arc<dyn Hooks>) -> Client {
        Client::builder()
            .access_token("secret")
            .base_url(server.base_url())
            .account_id("999")
            .hooks(hooks)
            .build()
            .unwrap()
    }

    fn get_todo() -> OperationInfo {
        OperationInfo::new("Todos", "GetTodo", "todo").project(1).resource(2)
    }

    #[tokio::test]
    async fn second_identical_operation_is_a_cache_hit() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/999/buckets/1/todos/2.json").header_missing("if-none-match");
            then.status(200)
                .header("etag", "\"t2\"")
                .json_body(json!({"id": 2, "content": "Ship"}));
        });
        server.mock(|when, then| {
            when.method(GET)
                .path("/999/buckets/1/todos/2.json")
                .header("if-none-match", "\"t2\"");
            then.status(304);
        });

        let recorder = Arc::new(Recorder::default());
        let client = client_with(&server, recorder.clone());
        let run = || {
            client.execute_operation::<Todo>(get_todo(), client.get("/buckets/1/todos/2.json"), Unwrap::None)
        };

        let first = run().await.unwrap().unwrap();
        let second = run().await.unwrap().unwrap();

        assert_eq!(first, second);
        assert_eq!(*recorder.cache_hits.lock(), [false, true]);
        assert_eq!(
            *recorder.events.lock(),
            ["start GetTodo", "end GetTodo ok", "start GetTodo", "end GetTodo ok"]
        );
    }

    #[tokio::test]
    async fn envelope_field_is_unwrapped() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/999/buckets/1/todos/2.json");
            then.status(200).json_body(json!({"todo": {"id": 2, "content": "Ship"}}));
        });

        let client = client_with(&server, Arc::new(Recorder::default()));
        let todo: Todo = client
            .execute_operation(get_todo(), client.get("/buckets/1/todos/2.json"), Unwrap::Field("todo"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(todo, Todo { id: 2, content: "Ship".into() });
    }

    #[tokio::test]
    async fn missing_envelope_field_is_an_api_error() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/999/buckets/1/todos/2.json");
            then.status(200).json_body(json!({"id": 2}));
        });

        let client = client_with(&server, Arc::new(Recorder::default()));
        let err = client
            .execute_operation::<Todo>(get_todo(), client.get("/buckets/1/todos/2.json"), Unwrap::Field("todo"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::ApiError);
    }

    #[tokio::test]
    async fn custom_unwrap_function() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/999/search.json");
            then.status(200).json_body(json!({"results": {"todos": [{"id": 1, "content": "a"}]}}));
        });

        fn todos(v: Value) -> Value {
            v["results"]["todos"].clone()
        }

        let client = client_with(&server, Arc::new(Recorder::default()));
        let found: Vec<Todo> = client
            .execute_operation(
                OperationInfo::new("Search", "Search", "result"),
                client.get("/search.json"),
                Unwrap::With(todos),
            )
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.len(), 1);
    }

    #[tokio::test]
    async fn no_content_is_none() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(DELETE).path("/999/buckets/1/recordings/2/status/trashed.json");
            then.status(204);
        });

        let client = client_with(&server, Arc::new(Recorder::default()));
        let out = client
            .execute_operation::<Value>(
                OperationInfo::new("Recordings", "TrashRecording", "recording").mutation(),
                client.delete("/buckets/1/recordings/2/status/trashed.json"),
                Unwrap::None,
            )
            .await
            .unwrap();
        assert!(out.is_none());
    }

    #[tokio::test]
    async fn error_status_reaches_end_hook() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/999/buckets/1/todos/2.json");
            then.status(401).json_body(json!({"error": "expired"}));
        });

        let recorder = Arc::new(Recorder::default());
        let client = client_with(&server, recorder.clone());
        let err = client
            .execute_operation::<Todo>(get_todo(), client.get("/buckets/1/todos/2.json"), Unwrap::None)
            .await
            .unwrap_err();

        assert_eq!(err.code(), ErrorCode::AuthRequired);
        assert_eq!(recorder.events.lock().last().unwrap(), "end GetTodo auth_required");
    }

    struct Exploding;

    impl Hooks for Exploding {
        fn on_operation_start(&self, _op: &OperationInfo) {
            panic!("hook bug");
        }

        fn on_operation_end(&self, _op: &OperationInfo, _error: Option<&Error>, _duration: Duration) {
            panic!("hook bug");
        }
    }

    #[tokio::test]
    async fn hook_panics_do_not_break_the_call() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/999/buckets/1/todos/2.json");
            then.status(200).json_body(json!({"id": 2, "content": "Ship"}));
        });

        let client = client_with(&server, Arc::new(Exploding));
        let todo = client
            .execute_operation::<Todo>(get_todo(), client.get("/buckets/1/todos/2.json"), Unwrap::None)
            .await
            .unwrap();
        assert!(todo.is_some());
    }

    #[test]
    fn unwrap_on_non_object_fails() {
        let err = Unwrap::Field("todo").apply(json!([1, 2])).unwrap_err();
        assert_eq!(err.code(), ErrorCode::ApiError);
        assert!(err.message().contains("`todo`"));
    }
}
