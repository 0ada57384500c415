//! Outbound header sanitizing and inbound cookie stripping.

use std::collections::BTreeMap;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use tracing::debug;

/// Header names a caller may never forward to a destination.
///
/// Hop-by-hop headers belong to a single connection, and the framing headers
/// (`content-length`, `content-type`, `transfer-encoding`) are set by the
/// protocol itself.
const FORBIDDEN_HEADERS: &[&str] = &[
    "connection",
    "content-length",
    "content-type",
    "cookie",
    "expect",
    "host",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Response headers that must not propagate past the upload.
const STRIPPED_RESPONSE_HEADERS: &[&str] = &["set-cookie", "set-cookie2"];

/// Returns true if `name` must be dropped from outbound requests.
#[must_use]
pub fn is_forbidden_header(name: &str) -> bool {
    let lower = name.trim().to_ascii_lowercase();
    FORBIDDEN_HEADERS.contains(&lower.as_str())
        || lower.starts_with("proxy-")
        || lower.starts_with("sec-")
}

/// Builds the outbound header map, dropping forbidden and malformed entries.
#[must_use]
pub fn sanitize_headers(headers: &BTreeMap<String, String>) -> HeaderMap {
    let mut sanitized = HeaderMap::new();
    for (name, value) in headers {
        if is_forbidden_header(name) {
            debug!(header = %name, "dropping forbidden outbound header");
            continue;
        }
        let Ok(header_name) = HeaderName::from_bytes(name.trim().as_bytes()) else {
            debug!(header = %name, "dropping outbound header with invalid name");
            continue;
        };
        let Ok(header_value) = HeaderValue::from_str(value) else {
            debug!(header = %name, "dropping outbound header with invalid value");
            continue;
        };
        sanitized.append(header_name, header_value);
    }
    sanitized
}

/// Copies response headers into a plain map, without any cookie setters.
///
/// Repeated headers are joined with `", "`; non-UTF-8 values are skipped.
#[must_use]
pub fn strip_response_cookies(headers: &HeaderMap) -> BTreeMap<String, String> {
    let mut kept: BTreeMap<String, String> = BTreeMap::new();
    for (name, value) in headers {
        if STRIPPED_RESPONSE_HEADERS.contains(&name.as_str()) {
            continue;
        }
        let Ok(value) = value.to_str() else {
            continue;
        };
        kept.entry(name.as_str().to_string())
            .and_modify(|existing| {
                existing.push_str(", ");
                existing.push_str(value);
            })
            .or_insert_with(|| value.to_string());
    }
    kept
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn map(entries: &[(&str, &str)]) -> BTreeMap<String, String> {
        entries
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    #[test]
    fn test_sanitize_headers_drops_hop_by_hop_and_framing() {
        let headers = map(&[
            ("Host", "evil.example.com"),
            ("Connection", "close"),
            ("Content-Length", "12"),
            ("Transfer-Encoding", "chunked"),
            ("Authorization", "Bearer abc"),
            ("X-Request-Id", "42"),
        ]);
        let sanitized = sanitize_headers(&headers);
        assert_eq!(sanitized.len(), 2);
        assert_eq!(sanitized.get("authorization").unwrap(), "Bearer abc");
        assert_eq!(sanitized.get("x-request-id").unwrap(), "42");
    }

    #[test]
    fn test_sanitize_headers_drops_proxy_and_sec_prefixes() {
        let headers = map(&[("Proxy-Foo", "1"), ("Sec-Fetch-Mode", "cors"), ("X-Ok", "1")]);
        let sanitized = sanitize_headers(&headers);
        assert_eq!(sanitized.len(), 1);
        assert!(sanitized.contains_key("x-ok"));
    }

    #[test]
    fn test_sanitize_headers_skips_invalid_values() {
        let headers = map(&[("X-Bad", "line\nbreak"), ("Bad Name", "v")]);
        assert!(sanitize_headers(&headers).is_empty());
    }

    #[test]
    fn test_strip_response_cookies_removes_setters() {
        let mut headers = HeaderMap::new();
        headers.append("set-cookie", HeaderValue::from_static("a=1"));
        headers.append("set-cookie2", HeaderValue::from_static("b=2"));
        headers.append("location", HeaderValue::from_static("/files/1"));
        headers.append("vary", HeaderValue::from_static("accept"));
        headers.append("vary", HeaderValue::from_static("origin"));

        let kept = strip_response_cookies(&headers);
        assert!(!kept.contains_key("set-cookie"));
        assert!(!kept.contains_key("set-cookie2"));
        assert_eq!(kept["location"], "/files/1");
        assert_eq!(kept["vary"], "accept, origin");
    }

    #[test]
    fn test_is_forbidden_header_is_case_insensitive() {
        assert!(is_forbidden_header("HOST"));
        assert!(is_forbidden_header(" keep-alive "));
        assert!(!is_forbidden_header("authorization"));
    }
}
