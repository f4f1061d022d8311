//! Operation table: every known API operation with its path template and
//! retry policy.
//!
//! The table is the only place path templates are written down. The
//! normalizer's segment-to-placeholder map is derived from it, so a new
//! route is picked up by policy lookup without touching anything else.

use crate::policy::{Backoff, RetryPolicy};
use http::Method;
use std::collections::HashMap;
use std::sync::LazyLock;
use std::time::Duration;

/// Placeholder for the leading tenant segment.
pub const ACCOUNT_PLACEHOLDER: &str = "{accountId}";

/// Placeholder for `YYYY-MM-DD` segments.
pub const DATE_PLACEHOLDER: &str = "{date}";

/// Placeholder for numeric segments after an unknown resource name.
pub const GENERIC_PLACEHOLDER: &str = "{id}";

/// One API operation.
#[derive(Debug, Clone)]
pub struct Route {
    pub operation: &'static str,
    pub method: Method,
    /// Path template, account-prefixed, without the `.json` suffix.
    pub path: &'static str,
    pub retry: RetryPolicy,
}

impl Route {
    /// `METHOD:/path/template`, the lookup key format.
    #[must_use]
    pub fn key(&self) -> String {
        format!("{}:{}", self.method, self.path)
    }

    #[must_use]
    pub fn is_mutation(&self) -> bool {
        self.method != Method::GET && self.method != Method::HEAD
    }
}

const fn route(
    operation: &'static str,
    method: Method,
    path: &'static str,
    retry: RetryPolicy,
) -> Route {
    Route {
        operation,
        method,
        path,
        retry,
    }
}

const fn get(operation: &'static str, path: &'static str) -> Route {
    route(operation, Method::GET, path, RetryPolicy::DEFAULT)
}

/// Creates are not idempotent; a retried POST could duplicate the resource.
const fn create(operation: &'static str, path: &'static str) -> Route {
    route(operation, Method::POST, path, RetryPolicy::NO_RETRY)
}

const fn update(operation: &'static str, path: &'static str) -> Route {
    route(operation, Method::PUT, path, RetryPolicy::DEFAULT)
}

const fn delete(operation: &'static str, path: &'static str) -> Route {
    route(operation, Method::DELETE, path, RetryPolicy::DEFAULT)
}

const PATIENT: RetryPolicy = RetryPolicy::new(5, Duration::from_secs(1), Backoff::Exponential);

/// All known operations.
pub static ROUTES: &[Route] = &[
    // Projects
    get("ListProjects", "/{accountId}/projects"),
    create("CreateProject", "/{accountId}/projects"),
    route("GetProject", Method::GET, "/{accountId}/projects/{projectId}", PATIENT),
    update("UpdateProject", "/{accountId}/projects/{projectId}"),
    delete("TrashProject", "/{accountId}/projects/{projectId}"),
    get("ListProjectPeople", "/{accountId}/projects/{projectId}/people"),
    update("UpdateProjectAccess", "/{accountId}/projects/{projectId}/people/users"),
    get("ListRecordings", "/{accountId}/projects/recordings"),
    // To-dos
    get("GetTodoset", "/{accountId}/buckets/{projectId}/todosets/{todosetId}"),
    get("ListTodolists", "/{accountId}/buckets/{projectId}/todosets/{todosetId}/todolists"),
    create("CreateTodolist", "/{accountId}/buckets/{projectId}/todosets/{todosetId}/todolists"),
    get("GetTodolist", "/{accountId}/buckets/{projectId}/todolists/{todolistId}"),
    update("UpdateTodolist", "/{accountId}/buckets/{projectId}/todolists/{todolistId}"),
    get("ListTodos", "/{accountId}/buckets/{projectId}/todolists/{todolistId}/todos"),
    create("CreateTodo", "/{accountId}/buckets/{projectId}/todolists/{todolistId}/todos"),
    get("ListTodolistGroups", "/{accountId}/buckets/{projectId}/todolists/{todolistId}/groups"),
    create("CreateTodolistGroup", "/{accountId}/buckets/{projectId}/todolists/{todolistId}/groups"),
    get("GetTodo", "/{accountId}/buckets/{projectId}/todos/{todoId}"),
    update("UpdateTodo", "/{accountId}/buckets/{projectId}/todos/{todoId}"),
    route(
        "CompleteTodo",
        Method::POST,
        "/{accountId}/buckets/{projectId}/todos/{todoId}/completion",
        RetryPolicy::DEFAULT,
    ),
    delete("UncompleteTodo", "/{accountId}/buckets/{projectId}/todos/{todoId}/completion"),
    update("RepositionTodo", "/{accountId}/buckets/{projectId}/todos/{todoId}/position"),
    get("ListAssignedTodos", "/{accountId}/reports/todos/assigned/{personId}"),
    // Messages
    get("GetMessageBoard", "/{accountId}/buckets/{projectId}/message_boards/{messageBoardId}"),
    get(
        "ListMessages",
        "/{accountId}/buckets/{projectId}/message_boards/{messageBoardId}/messages",
    ),
    create(
        "CreateMessage",
        "/{accountId}/buckets/{projectId}/message_boards/{messageBoardId}/messages",
    ),
    get("GetMessage", "/{accountId}/buckets/{projectId}/messages/{messageId}"),
    update("UpdateMessage", "/{accountId}/buckets/{projectId}/messages/{messageId}"),
    // Recordings and comments
    get("ListComments", "/{accountId}/buckets/{projectId}/recordings/{recordingId}/comments"),
    create("CreateComment", "/{accountId}/buckets/{projectId}/recordings/{recordingId}/comments"),
    get("GetComment", "/{accountId}/buckets/{projectId}/comments/{commentId}"),
    update("UpdateComment", "/{accountId}/buckets/{projectId}/comments/{commentId}"),
    update(
        "TrashRecording",
        "/{accountId}/buckets/{projectId}/recordings/{recordingId}/status/trashed",
    ),
    update(
        "ArchiveRecording",
        "/{accountId}/buckets/{projectId}/recordings/{recordingId}/status/archived",
    ),
    update(
        "UnarchiveRecording",
        "/{accountId}/buckets/{projectId}/recordings/{recordingId}/status/active",
    ),
    get("ListEvents", "/{accountId}/buckets/{projectId}/recordings/{recordingId}/events"),
    // Schedules
    get("ListScheduleEntries", "/{accountId}/buckets/{projectId}/schedules/{scheduleId}/entries"),
    create(
        "CreateScheduleEntry",
        "/{accountId}/buckets/{projectId}/schedules/{scheduleId}/entries",
    ),
    get("GetScheduleEntry", "/{accountId}/buckets/{projectId}/schedule_entries/{scheduleEntryId}"),
    update(
        "UpdateScheduleEntry",
        "/{accountId}/buckets/{projectId}/schedule_entries/{scheduleEntryId}",
    ),
    get(
        "GetScheduleEntryOccurrence",
        "/{accountId}/buckets/{projectId}/schedule_entries/{scheduleEntryId}/occurrences/{date}",
    ),
    // Card tables
    get("GetCardTable", "/{accountId}/buckets/{projectId}/card_tables/{cardTableId}"),
    get("ListCards", "/{accountId}/buckets/{projectId}/card_tables/lists/{columnId}/cards"),
    create("CreateCard", "/{accountId}/buckets/{projectId}/card_tables/lists/{columnId}/cards"),
    get("GetCard", "/{accountId}/buckets/{projectId}/card_tables/cards/{cardId}"),
    update("UpdateCard", "/{accountId}/buckets/{projectId}/card_tables/cards/{cardId}"),
    // Docs and files
    get("ListDocuments", "/{accountId}/buckets/{projectId}/vaults/{vaultId}/documents"),
    create("CreateDocument", "/{accountId}/buckets/{projectId}/vaults/{vaultId}/documents"),
    get("GetDocument", "/{accountId}/buckets/{projectId}/documents/{documentId}"),
    update("UpdateDocument", "/{accountId}/buckets/{projectId}/documents/{documentId}"),
    get("GetUpload", "/{accountId}/buckets/{projectId}/uploads/{uploadId}"),
    create("CreateAttachment", "/{accountId}/attachments"),
    // Campfires
    get("ListCampfireLines", "/{accountId}/buckets/{projectId}/chats/{campfireId}/lines"),
    create("CreateCampfireLine", "/{accountId}/buckets/{projectId}/chats/{campfireId}/lines"),
    get("GetCampfireLine", "/{accountId}/buckets/{projectId}/chats/{campfireId}/lines/{lineId}"),
    // Webhooks
    get("ListWebhooks", "/{accountId}/buckets/{projectId}/webhooks"),
    create("CreateWebhook", "/{accountId}/buckets/{projectId}/webhooks"),
    get("GetWebhook", "/{accountId}/buckets/{projectId}/webhooks/{webhookId}"),
    update("UpdateWebhook", "/{accountId}/buckets/{projectId}/webhooks/{webhookId}"),
    delete("DeleteWebhook", "/{accountId}/buckets/{projectId}/webhooks/{webhookId}"),
    // People
    get("ListPeople", "/{accountId}/people"),
    get("GetPerson", "/{accountId}/people/{personId}"),
    get("GetMyProfile", "/{accountId}/my/profile"),
    // Search
    get("Search", "/{accountId}/search"),
];

struct RouteIndex {
    by_key: HashMap<String, &'static Route>,
    placeholders: HashMap<&'static str, &'static str>,
}

impl RouteIndex {
    fn build() -> Self {
        let mut by_key = HashMap::with_capacity(ROUTES.len());
        let mut placeholders = HashMap::new();
        for route in ROUTES {
            by_key.entry(route.key()).or_insert(route);
            for (prev, segment) in placeholder_pairs(route.path) {
                placeholders.entry(prev).or_insert(segment);
            }
        }
        Self {
            by_key,
            placeholders,
        }
    }
}

static INDEX: LazyLock<RouteIndex> = LazyLock::new(RouteIndex::build);

/// `(resource name, placeholder)` pairs in a template, e.g.
/// `("todos", "{todoId}")`. Account and date placeholders are handled by the
/// normalizer directly and are skipped.
fn placeholder_pairs(path: &'static str) -> impl Iterator<Item = (&'static str, &'static str)> {
    let segments: Vec<&'static str> = path.split('/').filter(|s| !s.is_empty()).collect();
    let pairs: Vec<_> = segments
        .windows(2)
        .filter_map(|w| {
            let (prev, segment) = (w[0], w[1]);
            let is_placeholder = segment.starts_with('{');
            let special = segment == ACCOUNT_PLACEHOLDER || segment == DATE_PLACEHOLDER;
            (is_placeholder && !special && !prev.starts_with('{')).then_some((prev, segment))
        })
        .collect();
    pairs.into_iter()
}

/// Route registered under `key` (`METHOD:/template`).
#[must_use]
pub fn lookup(key: &str) -> Option<&'static Route> {
    INDEX.by_key.get(key).copied()
}

/// Route by operation name.
#[must_use]
pub fn by_operation(operation: &str) -> Option<&'static Route> {
    ROUTES.iter().find(|r| r.operation == operation)
}

/// Placeholder that follows `resource` in the templates, if any.
#[must_use]
pub fn placeholder_for(resource: &str) -> Option<&'static str> {
    INDEX.placeholders.get(resource).copied()
}
