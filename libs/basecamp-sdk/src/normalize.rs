//! Maps concrete request paths onto operation table templates.
//!
//! `/999/buckets/12/todos/34.json` becomes
//! `/{accountId}/buckets/{projectId}/todos/{todoId}.json`.

use crate::routes::{self, ACCOUNT_PLACEHOLDER, DATE_PLACEHOLDER, GENERIC_PLACEHOLDER};
use http::Method;

const JSON_SUFFIX: &str = ".json";

/// Replace numeric and date segments of `path` with placeholders.
///
/// A numeric first segment is the account id. Other numeric segments take
/// the placeholder of the resource name before them, or `{id}`. A trailing
/// `.json` is preserved.
#[must_use]
pub fn normalize_path(path: &str) -> String {
    let (base, suffix) = split_suffix(path);
    let mut out = normalize_segments(base);
    out.push_str(suffix);
    out
}

/// Lookup key (`METHOD:/template`) for a request.
///
/// Accepts an absolute URL or a path; query and fragment are ignored, the
/// `.json` suffix is dropped, and account-relative paths such as
/// `/buckets/1/todos/2` are keyed as if prefixed with `/{accountId}`.
#[must_use]
pub fn operation_key(method: &Method, url: &str) -> String {
    let path = path_of(url);
    let (base, _) = split_suffix(path);
    let normalized = normalize_segments(base);
    let account_prefix = format!("/{ACCOUNT_PLACEHOLDER}");
    if normalized == account_prefix || normalized.starts_with(&format!("{account_prefix}/")) {
        format!("{method}:{normalized}")
    } else if normalized == "/" {
        format!("{method}:{account_prefix}")
    } else {
        format!("{method}:{account_prefix}{normalized}")
    }
}

/// Operation name for a request, when it matches the table.
#[must_use]
pub fn operation_name(method: &Method, url: &str) -> Option<&'static str> {
    routes::lookup(&operation_key(method, url)).map(|r| r.operation)
}

fn path_of(url: &str) -> &str {
    let without_scheme = url.find("://").map_or(url, |i| &url[i + 3..]);
    let path = if without_scheme.len() == url.len() {
        url
    } else {
        without_scheme
            .find('/')
            .map_or("/", |i| &without_scheme[i..])
    };
    let end = path.find(['?', '#']).unwrap_or(path.len());
    &path[..end]
}

fn split_suffix(path: &str) -> (&str, &str) {
    path.strip_suffix(JSON_SUFFIX)
        .map_or((path, ""), |base| (base, JSON_SUFFIX))
}

fn normalize_segments(base: &str) -> String {
    let mut out = String::with_capacity(base.len() + 32);
    let mut prev: Option<&str> = None;

    for (index, segment) in base.split('/').filter(|s| !s.is_empty()).enumerate() {
        out.push('/');
        if is_numeric(segment) {
            let placeholder = if index == 0 {
                ACCOUNT_PLACEHOLDER
            } else {
                prev.and_then(routes::placeholder_for)
                    .unwrap_or(GENERIC_PLACEHOLDER)
            };
            out.push_str(placeholder);
        } else if is_iso_date(segment) {
            out.push_str(DATE_PLACEHOLDER);
        } else {
            out.push_str(segment);
        }
        prev = Some(segment);
    }

    if out.is_empty() {
        out.push('/');
    }
    out
}

fn is_numeric(segment: &str) -> bool {
    !segment.is_empty() && segment.bytes().all(|b| b.is_ascii_digit())
}

/// `YYYY-MM-DD`
fn is_iso_date(segment: &str) -> bool {
    let b = segment.as_bytes();
    b.len() == 10
        && b[4] == b'-'
        && b[7] == b'-'
        && b.iter()
            .enumerate()
            .all(|(i, c)| i == 4 || i == 7 || c.is_ascii_digit())
}
