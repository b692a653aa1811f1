//! Header handling between client, relay and upstream.

use axum::http::{
    HeaderMap, HeaderName, HeaderValue, Uri,
    header::{self, CONNECTION, HOST},
};
use tracing::debug;
use url::Url;

use crate::header_rules::HeaderRules;
use crate::hls::classify::has_playlist_extension;

/// Hop-by-hop headers (RFC 9110 §7.6.1), never forwarded in either direction.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Client headers that identify the relay's caller rather than the request.
const CLIENT_ONLY: &[&str] = &[
    "host",
    "origin",
    "referer",
    "accept-encoding",
    "content-length",
    "x-real-ip",
    "cf-connecting-ip",
];

/// Prefixes of browser and edge-network headers dropped on the way out.
const CLIENT_ONLY_PREFIXES: &[&str] = &["sec-fetch-", "sec-ch-ua", "cf-", "x-forwarded-"];

fn is_hop_by_hop(name: &HeaderName, listed: &[String]) -> bool {
    HOP_BY_HOP.contains(&name.as_str()) || listed.iter().any(|l| l == name.as_str())
}

/// Names a `Connection` header declares as hop-by-hop.
fn connection_listed(headers: &HeaderMap) -> Vec<String> {
    headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|name| name.trim().to_ascii_lowercase())
        .filter(|name| !name.is_empty())
        .collect()
}

/// Headers to send upstream for a client request to `target`.
///
/// Conditional and range headers pass through, except `Range` on playlist
/// targets: the relay needs the whole document to rewrite it. The client's
/// `Origin` and `Referer` never leave; `user_agent` and then the first
/// matching host rule decide what upstream sees instead.
pub fn upstream_request_headers(
    inbound: &HeaderMap,
    target: &Url,
    user_agent: Option<&str>,
    rules: &HeaderRules,
) -> HeaderMap {
    let playlist_target = has_playlist_extension(target);
    let listed = connection_listed(inbound);
    let mut out = HeaderMap::with_capacity(inbound.len());

    for (name, value) in inbound {
        let n = name.as_str();
        if is_hop_by_hop(name, &listed)
            || CLIENT_ONLY.contains(&n)
            || CLIENT_ONLY_PREFIXES.iter().any(|p| n.starts_with(p))
        {
            continue;
        }
        if playlist_target && (*name == header::RANGE || *name == header::IF_RANGE) {
            debug!("Dropping {} on playlist request", name);
            continue;
        }
        out.append(name.clone(), value.clone());
    }

    if let Some(ua) = user_agent
        && let Ok(value) = HeaderValue::from_str(ua)
    {
        out.insert(header::USER_AGENT, value);
    }
    rules.apply(target, &mut out);

    out
}

/// Upstream headers kept on a passthrough response.
///
/// Hop-by-hop and upstream `Access-Control-*` headers are removed; CORS is
/// applied afterwards by the caller.
pub fn passthrough_response_headers(upstream: &HeaderMap) -> HeaderMap {
    let listed = connection_listed(upstream);
    let mut out = HeaderMap::with_capacity(upstream.len());
    for (name, value) in upstream {
        if is_hop_by_hop(name, &listed) || name.as_str().starts_with("access-control-") {
            continue;
        }
        out.append(name.clone(), value.clone());
    }
    out
}

fn first_value<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

/// Scheme + host + path of the relay as the client sees it, without query.
///
/// A configured public base URL wins. Otherwise `X-Forwarded-Proto` and
/// `X-Forwarded-Host` (set by a TLS terminator) are honoured before `Host`.
pub fn proxy_base_url(public_base: Option<&str>, headers: &HeaderMap, uri: &Uri) -> String {
    let path = uri.path();
    if let Some(base) = public_base {
        return format!("{}{}", base.trim_end_matches('/'), path);
    }

    let scheme = match first_value(headers, "x-forwarded-proto") {
        Some(proto) if proto.eq_ignore_ascii_case("https") => "https",
        Some(_) => "http",
        None => uri.scheme_str().unwrap_or("http"),
    };

    let host = first_value(headers, "x-forwarded-host")
        .or_else(|| first_value(headers, HOST.as_str()))
        .or_else(|| uri.authority().map(|a| a.as_str()))
        .unwrap_or("localhost");

    format!("{}://{}{}", scheme, host, path)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn segment() -> Url {
        Url::parse("https://cdn.example.com/live/seg1.ts").unwrap()
    }

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (k, v) in pairs {
            map.append(*k, HeaderValue::from_static(*v));
        }
        map
    }

    #[test]
    fn strips_client_identity_and_hop_headers() {
        let inbound = headers(&[
            ("host", "relay.example.com"),
            ("origin", "https://player.example"),
            ("referer", "https://player.example/watch"),
            ("accept-encoding", "gzip, br"),
            ("connection", "keep-alive, x-custom-hop"),
            ("x-custom-hop", "1"),
            ("sec-fetch-mode", "cors"),
            ("sec-ch-ua-platform", "\"Linux\""),
            ("cf-ray", "abc"),
            ("x-forwarded-for", "203.0.113.1"),
            ("user-agent", "TestPlayer/1.0"),
            ("accept", "*/*"),
            ("if-none-match", "\"v1\""),
        ]);

        let out = upstream_request_headers(&inbound, &segment(), None, &HeaderRules::default());

        for gone in [
            "host",
            "origin",
            "referer",
            "accept-encoding",
            "connection",
            "x-custom-hop",
            "sec-fetch-mode",
            "sec-ch-ua-platform",
            "cf-ray",
            "x-forwarded-for",
        ] {
            assert!(out.get(gone).is_none(), "{} should be stripped", gone);
        }
        assert_eq!(out["user-agent"], "TestPlayer/1.0");
        assert_eq!(out["accept"], "*/*");
        assert_eq!(out["if-none-match"], "\"v1\"");
    }

    #[test]
    fn range_forwarded_for_segments_only() {
        let inbound = headers(&[("range", "bytes=0-1023")]);
        let rules = HeaderRules::default();
        assert_eq!(
            upstream_request_headers(&inbound, &segment(), None, &rules)["range"],
            "bytes=0-1023"
        );
        let playlist = Url::parse("https://cdn.example.com/live/index.m3u8").unwrap();
        assert!(
            upstream_request_headers(&inbound, &playlist, None, &rules)
                .get("range")
                .is_none()
        );
    }

    #[test]
    fn user_agent_override() {
        let inbound = headers(&[("user-agent", "TestPlayer/1.0")]);
        let out = upstream_request_headers(
            &inbound,
            &segment(),
            Some("Relay/2.0"),
            &HeaderRules::default(),
        );
        assert_eq!(out["user-agent"], "Relay/2.0");
    }

    #[test]
    fn host_rule_replaces_client_origin_and_referer() {
        let inbound = headers(&[
            ("origin", "https://player.example"),
            ("referer", "https://player.example/watch"),
            ("user-agent", "TestPlayer/1.0"),
        ]);
        let rules = HeaderRules::parse(
            r#"[{"host":"*.svetacdn.in","origin":"https://videocdn.tv","referer":"https://videocdn.tv/","user_agent":"Mozilla/5.0"}]"#,
        )
        .unwrap();
        let target = Url::parse("https://s1.svetacdn.in/hls/seg1.ts").unwrap();

        let out = upstream_request_headers(&inbound, &target, Some("Relay/2.0"), &rules);
        assert_eq!(out["origin"], "https://videocdn.tv");
        assert_eq!(out["referer"], "https://videocdn.tv/");
        assert_eq!(out["user-agent"], "Mozilla/5.0", "rule beats the global override");
    }

    #[test]
    fn unmatched_host_gets_no_origin() {
        let inbound = headers(&[("origin", "https://player.example")]);
        let rules = HeaderRules::parse(r#"[{"host":"cdn.other.net","origin":"self"}]"#).unwrap();

        let out = upstream_request_headers(&inbound, &segment(), None, &rules);
        assert!(out.get("origin").is_none());
    }

    #[test]
    fn response_drops_upstream_cors_and_hop_headers() {
        let upstream = headers(&[
            ("content-type", "video/MP2T"),
            ("content-length", "188"),
            ("transfer-encoding", "chunked"),
            ("access-control-allow-origin", "https://only.me"),
            ("etag", "\"seg1\""),
        ]);
        let out = passthrough_response_headers(&upstream);
        assert!(out.get("transfer-encoding").is_none());
        assert!(out.get("access-control-allow-origin").is_none());
        assert_eq!(out["content-length"], "188");
        assert_eq!(out["etag"], "\"seg1\"");
    }

    #[test]
    fn proxy_base_from_host_header() {
        let uri: Uri = "/?url=abc".parse().unwrap();
        let base = proxy_base_url(None, &headers(&[("host", "relay.local:8000")]), &uri);
        assert_eq!(base, "http://relay.local:8000/");
    }

    #[test]
    fn proxy_base_honours_forwarded_proto_and_host() {
        let uri: Uri = "/hls/?url=abc".parse().unwrap();
        let base = proxy_base_url(
            None,
            &headers(&[
                ("host", "10.0.0.5:8000"),
                ("x-forwarded-proto", "https, http"),
                ("x-forwarded-host", "relay.example.com"),
            ]),
            &uri,
        );
        assert_eq!(base, "https://relay.example.com/hls/");
    }

    #[test]
    fn proxy_base_prefers_public_url() {
        let uri: Uri = "/?url=abc".parse().unwrap();
        let base = proxy_base_url(
            Some("https://cdn-relay.example.com/"),
            &headers(&[("host", "internal:8000")]),
            &uri,
        );
        assert_eq!(base, "https://cdn-relay.example.com/");
    }
}
