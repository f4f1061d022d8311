//! Redirect handling for the transport.
//!
//! Redirects are followed up to a limit. Once a hop leaves the original
//! origin, credential headers are stripped for the rest of the chain, and
//! HTTPS to HTTP downgrades are never followed.

use crate::error::{Error, ErrorCode};
use http::{Request, Response, StatusCode, Uri, header};
use tower_http::follow_redirect::policy::{Action, Attempt, Policy};

/// Headers removed once a redirect chain crosses origins.
const SENSITIVE_HEADERS: &[header::HeaderName] = &[
    header::AUTHORIZATION,
    header::COOKIE,
    header::PROXY_AUTHORIZATION,
];

#[derive(Debug, Clone)]
pub struct SecureRedirectPolicy {
    max_redirects: usize,
    /// Per request; the layer clones the policy for each one.
    redirect_count: usize,
    cross_origin_detected: bool,
}

impl SecureRedirectPolicy {
    #[must_use]
    pub fn new(max_redirects: usize) -> Self {
        Self {
            max_redirects,
            redirect_count: 0,
            cross_origin_detected: false,
        }
    }

    /// Scheme, host and port match, with default ports filled in. A missing
    /// scheme counts as https.
    fn is_same_origin(original: &Uri, target: &Uri) -> bool {
        let orig_scheme = original.scheme_str().unwrap_or("https");
        let target_scheme = target.scheme_str().unwrap_or("https");

        let orig_port = original
            .port_u16()
            .unwrap_or_else(|| default_port(orig_scheme));
        let target_port = target
            .port_u16()
            .unwrap_or_else(|| default_port(target_scheme));

        orig_scheme.eq_ignore_ascii_case(target_scheme)
            && original
                .host()
                .unwrap_or("")
                .eq_ignore_ascii_case(target.host().unwrap_or(""))
            && orig_port == target_port
    }

    fn is_https_downgrade(original: &Uri, target: &Uri) -> bool {
        original.scheme_str().unwrap_or("https") == "https" && target.scheme_str() == Some("http")
    }
}

fn default_port(scheme: &str) -> u16 {
    match scheme {
        "http" => 80,
        "https" => 443,
        _ => 0,
    }
}

impl<B: Clone, E> Policy<B, E> for SecureRedirectPolicy {
    fn redirect(&mut self, attempt: &Attempt<'_>) -> Result<Action, E> {
        self.redirect_count += 1;
        if self.redirect_count > self.max_redirects {
            tracing::debug!(
                count = self.redirect_count,
                max = self.max_redirects,
                "Redirect limit reached"
            );
            return Ok(Action::Stop);
        }

        let original = attempt.previous();
        let target = attempt.location();

        if Self::is_https_downgrade(original, target) {
            tracing::warn!(
                original = %original,
                target = %target,
                "Blocking HTTPS to HTTP downgrade redirect"
            );
            return Ok(Action::Stop);
        }

        if !Self::is_same_origin(original, target) {
            self.cross_origin_detected = true;
            tracing::debug!(
                original = %original,
                target = %target,
                "Following cross-origin redirect without credentials"
            );
        }

        Ok(Action::Follow)
    }

    fn on_request(&mut self, request: &mut Request<B>) {
        if self.cross_origin_detected {
            let headers = request.headers_mut();
            for name in SENSITIVE_HEADERS {
                headers.remove(name);
            }
        }
    }

    fn clone_body(&self, body: &B) -> Option<B> {
        Some(body.clone())
    }
}

fn is_redirect(status: StatusCode) -> bool {
    matches!(status.as_u16(), 301 | 302 | 303 | 307 | 308)
}

/// Fail on a redirect response the follower left behind because its
/// `Location` is missing or unparseable. Blocked or over-limit redirects
/// pass through as ordinary 3xx responses.
pub(crate) fn reject_malformed_redirect<B>(response: Response<B>) -> Result<Response<B>, Error> {
    if !is_redirect(response.status()) {
        return Ok(response);
    }
    let location = response
        .headers()
        .get(header::LOCATION)
        .and_then(|v| v.to_str().ok())
        .filter(|s| !s.trim().is_empty());
    match location {
        Some(raw) if raw.parse::<Uri>().is_ok() => Ok(response),
        _ => Err(Error::new(
            ErrorCode::ApiError,
            format!("Malformed redirect target ({})", response.status().as_u16()),
        )
        .with_retryable(false)),
    }
}
