//! Size limits and endpoint checks applied to untrusted input.

use url::Url;

/// Maximum size of a successful response body (50 MiB).
pub const MAX_RESPONSE_BODY_BYTES: usize = 50 * 1024 * 1024;

/// Maximum size of an error response body read for diagnostics (1 MiB).
pub const MAX_ERROR_BODY_BYTES: usize = 1024 * 1024;

/// Maximum length of a message carried by [`crate::Error`].
pub const MAX_ERROR_MESSAGE_BYTES: usize = 500;

/// Truncate `s` to at most `max` bytes, ending with `...` when cut.
///
/// Cuts on a UTF-8 character boundary, so the result may be slightly
/// shorter than `max`.
#[must_use]
pub fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_owned();
    }
    if max <= 3 {
        return s[..floor_char_boundary(s, max)].to_owned();
    }
    let cut = floor_char_boundary(s, max - 3);
    format!("{}...", &s[..cut])
}

fn floor_char_boundary(s: &str, mut index: usize) -> usize {
    while index > 0 && !s.is_char_boundary(index) {
        index -= 1;
    }
    index
}

/// Whether `url` points at a loopback host trusted for plain HTTP.
///
/// Recognizes `localhost`, any `*.localhost` name (RFC 6761), `127.0.0.1`
/// and `::1`.
#[must_use]
pub fn is_localhost(url: &Url) -> bool {
    match url.host() {
        Some(url::Host::Domain(host)) => host == "localhost" || host.ends_with(".localhost"),
        Some(url::Host::Ipv4(ip)) => ip == std::net::Ipv4Addr::LOCALHOST,
        Some(url::Host::Ipv6(ip)) => ip.is_loopback(),
        None => false,
    }
}

/// Whether `url` is acceptable as an API endpoint: HTTPS, or any scheme on
/// a localhost form.
#[must_use]
pub fn is_secure_endpoint(url: &Url) -> bool {
    url.scheme().eq_ignore_ascii_case("https") || is_localhost(url)
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[test]
    fn truncate_keeps_short_strings() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("exact", 5), "exact");
    }

    #[test]
    fn truncate_appends_ellipsis_within_limit() {
        let out = truncate("abcdefghij", 8);
        assert_eq!(out, "abcde...");
        assert!(out.len() <= 8);
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        // Each snowman is three bytes.
        let s = "\u{2603}\u{2603}\u{2603}\u{2603}";
        let out = truncate(s, 7);
        assert!(out.len() <= 7);
        assert!(out.ends_with("..."));
        assert_eq!(out, "\u{2603}...");
    }

    #[test]
    fn truncate_tiny_limit_has_no_ellipsis() {
        assert_eq!(truncate("abcdef", 2), "ab");
    }

    #[test]
    fn localhost_forms() {
        for raw in [
            "http://localhost:3000",
            "http://app.localhost",
            "http://127.0.0.1:8080",
            "http://[::1]:9000",
        ] {
            let url = Url::parse(raw).unwrap();
            assert!(is_localhost(&url), "{raw} should be localhost");
            assert!(is_secure_endpoint(&url));
        }
    }

    #[test]
    fn remote_http_is_not_secure() {
        let url = Url::parse("http://3.basecampapi.com").unwrap();
        assert!(!is_localhost(&url));
        assert!(!is_secure_endpoint(&url));

        let tricky = Url::parse("http://localhost.evil.com").unwrap();
        assert!(!is_secure_endpoint(&tricky));
    }

    #[test]
    fn https_is_secure() {
        let url = Url::parse("https://3.basecampapi.com").unwrap();
        assert!(is_secure_endpoint(&url));
    }
}
