//! CORS response headers.
//!
//! Written by hand rather than through a middleware layer: every response
//! (including errors and preflights that never reach upstream) carries the
//! same fixed allow-list, and rewritten playlists must not advertise
//! `Content-Length`/`Content-Range` as exposed.

use axum::http::{
    HeaderMap, HeaderValue,
    header::{
        ACCESS_CONTROL_ALLOW_HEADERS, ACCESS_CONTROL_ALLOW_METHODS, ACCESS_CONTROL_ALLOW_ORIGIN,
        ACCESS_CONTROL_EXPOSE_HEADERS, ACCESS_CONTROL_MAX_AGE,
    },
};

pub const ALLOW_ORIGIN: &str = "*";
pub const ALLOW_METHODS: &str = "GET, HEAD, OPTIONS";
pub const ALLOW_HEADERS: &str = "Content-Type, Range";
pub const EXPOSE_HEADERS: &str = "Content-Length, Content-Range";
pub const MAX_AGE_SECS: &str = "86400";

/// Whether `Access-Control-Expose-Headers` is sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expose {
    /// Passthrough bodies keep upstream length/range headers.
    LengthAndRange,
    /// Rewritten bodies have no upstream length to expose.
    Nothing,
}

/// Remove any `Access-Control-*` headers copied from upstream.
pub fn strip(headers: &mut HeaderMap) {
    let upstream: Vec<_> = headers
        .keys()
        .filter(|name| name.as_str().starts_with("access-control-"))
        .cloned()
        .collect();
    for name in upstream {
        headers.remove(name);
    }
}

/// Insert the standard CORS headers, replacing any existing ones.
pub fn apply(headers: &mut HeaderMap, expose: Expose) {
    strip(headers);
    headers.insert(ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static(ALLOW_ORIGIN));
    headers.insert(ACCESS_CONTROL_ALLOW_METHODS, HeaderValue::from_static(ALLOW_METHODS));
    headers.insert(ACCESS_CONTROL_ALLOW_HEADERS, HeaderValue::from_static(ALLOW_HEADERS));
    if expose == Expose::LengthAndRange {
        headers.insert(ACCESS_CONTROL_EXPOSE_HEADERS, HeaderValue::from_static(EXPOSE_HEADERS));
    }
}

/// Headers for an `OPTIONS` preflight answer.
pub fn preflight() -> HeaderMap {
    let mut headers = HeaderMap::new();
    apply(&mut headers, Expose::Nothing);
    headers.insert(ACCESS_CONTROL_MAX_AGE, HeaderValue::from_static(MAX_AGE_SECS));
    headers
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn apply_replaces_upstream_values() {
        let mut headers = HeaderMap::new();
        headers.insert(ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("https://only.me"));
        headers.insert("access-control-allow-credentials", HeaderValue::from_static("true"));

        apply(&mut headers, Expose::LengthAndRange);

        assert_eq!(headers[ACCESS_CONTROL_ALLOW_ORIGIN], "*");
        assert_eq!(headers[ACCESS_CONTROL_ALLOW_METHODS], ALLOW_METHODS);
        assert_eq!(headers[ACCESS_CONTROL_ALLOW_HEADERS], ALLOW_HEADERS);
        assert_eq!(headers[ACCESS_CONTROL_EXPOSE_HEADERS], EXPOSE_HEADERS);
        assert!(headers.get("access-control-allow-credentials").is_none());
    }

    #[test]
    fn playlists_do_not_expose_length() {
        let mut headers = HeaderMap::new();
        apply(&mut headers, Expose::Nothing);
        assert!(headers.get(ACCESS_CONTROL_EXPOSE_HEADERS).is_none());
    }

    #[test]
    fn preflight_carries_max_age() {
        let headers = preflight();
        assert_eq!(headers[ACCESS_CONTROL_MAX_AGE], "86400");
        assert_eq!(headers[ACCESS_CONTROL_ALLOW_METHODS], "GET, HEAD, OPTIONS");
    }
}
