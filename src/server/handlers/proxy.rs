//! The relay endpoint: `/?url=<target>`.
//!
//! Fetches the target (with retry), then either rewrites it as an HLS
//! playlist or streams it back untouched apart from headers.

use crate::{
    cache::CachedPlaylist,
    error::{RelayError, Result},
    hls::{
        self, RewriteContext, Verdict,
        classify::{SNIFF_LIMIT, has_media_extension},
    },
    http_retry::fetch_with_retry,
    metrics,
    server::{
        cors::{self, Expose},
        forward,
        state::AppState,
        url_validation::validate_target,
    },
    upstream::{ByteStream, TransportError, UpstreamRequest, collect_limited},
};
use axum::{
    body::{Body, Bytes},
    extract::State,
    http::{HeaderMap, HeaderValue, Method, StatusCode, Uri, header},
    response::{IntoResponse, Response},
};
use bytes::BytesMut;
use futures_util::{StreamExt, stream};
use std::time::Instant;
use tracing::{debug, info};
use url::Url;

pub const PLAYLIST_CONTENT_TYPE: &str = "application/vnd.apple.mpegurl";

/// Answer a CORS preflight without touching upstream.
pub async fn preflight() -> impl IntoResponse {
    (StatusCode::NO_CONTENT, cors::preflight())
}

/// Relay one request. Errors are turned into CORS-enabled text responses.
pub async fn proxy(
    State(state): State<AppState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let start = Instant::now();
    match relay(&state, method, &uri, &headers, body).await {
        Ok(response) => response,
        Err(e) => {
            metrics::record_request("error", e.status().as_u16());
            metrics::record_duration("error", start);
            e.into_response()
        }
    }
}

async fn relay(
    state: &AppState,
    method: Method,
    uri: &Uri,
    headers: &HeaderMap,
    body: Bytes,
) -> Result<Response> {
    let start = Instant::now();
    let config = &state.config;

    let target = resolve_target(uri.query(), config.upstream_base_url.as_ref())?;
    validate_target(&target, config.allow_private_origins)?;

    let proxy_base = forward::proxy_base_url(config.public_base_url.as_deref(), headers, uri);
    info!("{} {} via {}", method, target, proxy_base);

    // Only plain GETs of things that could be playlists go through the cache
    let cache = state
        .cache
        .as_ref()
        .filter(|_| method == Method::GET && !has_media_extension(&target));
    let cache_key = target.as_str().to_string();

    if let Some(cache) = cache {
        let hit = cache.get(&cache_key).await;
        metrics::record_cache_lookup(hit.is_some());
        if let Some(cached) = hit {
            let base = Url::parse(&cached.final_url)
                .map_err(|e| RelayError::InternalError(format!("cached base URL: {}", e)))?;
            let response = playlist_response(RewriteContext::new(base, proxy_base), &cached.body);
            metrics::record_request("cache", 200);
            metrics::record_duration("cache", start);
            return Ok(response);
        }
    }

    let request = UpstreamRequest {
        headers: forward::upstream_request_headers(
            headers,
            &target,
            config.upstream_user_agent.as_deref(),
            &config.upstream_header_rules,
        ),
        method,
        url: target,
        body: (!body.is_empty()).then_some(body),
    };

    let mut upstream = fetch_with_retry(state.transport.as_ref(), &request, &state.retry)
        .await
        .inspect_err(|_| metrics::record_upstream_error())?;

    debug!(
        "Upstream answered {} for {} (final URL {})",
        upstream.status, request.url, upstream.url
    );

    let mut first_chunk = None;
    let is_playlist = match hls::classify(upstream.status, upstream.content_type(), &upstream.url) {
        Verdict::Playlist => true,
        Verdict::Passthrough => false,
        Verdict::Sniff => {
            let (prefix, found) = sniff_prefix(&mut upstream.body, SNIFF_LIMIT).await?;
            first_chunk = (!prefix.is_empty()).then_some(prefix);
            found
        }
    };

    if is_playlist {
        let raw = collect_limited(first_chunk, upstream.body, config.max_playlist_bytes).await?;
        let text = String::from_utf8_lossy(&raw).into_owned();

        if let Some(cache) = cache {
            cache
                .set(
                    &cache_key,
                    CachedPlaylist {
                        final_url: upstream.url.to_string(),
                        body: text.clone(),
                    },
                )
                .await;
        }

        let response = playlist_response(RewriteContext::new(upstream.url, proxy_base), &text);
        metrics::record_request("playlist", 200);
        metrics::record_duration("playlist", start);
        return Ok(response);
    }

    let mut out_headers = forward::passthrough_response_headers(&upstream.headers);
    out_headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static(hls::passthrough_content_type(&upstream.url)),
    );
    cors::apply(&mut out_headers, Expose::LengthAndRange);

    let status = upstream.status;
    let body = stream::iter(first_chunk.map(Ok)).chain(upstream.body);

    metrics::record_request("passthrough", status.as_u16());
    metrics::record_duration("passthrough", start);

    Ok((status, out_headers, Body::from_stream(body)).into_response())
}

/// Pull chunks off `body` until `#EXTM3U` shows up, the stream ends or at
/// least `limit` bytes are buffered. Returns the buffered prefix, which the
/// caller must put back in front of the rest of the body.
async fn sniff_prefix(
    body: &mut ByteStream,
    limit: usize,
) -> std::result::Result<(Bytes, bool), TransportError> {
    let mut buf = BytesMut::new();
    while buf.len() < limit {
        let Some(chunk) = body.next().await.transpose()? else {
            break;
        };
        buf.extend_from_slice(&chunk);
        if hls::sniff_playlist(&buf) {
            return Ok((buf.freeze(), true));
        }
    }
    Ok((buf.freeze(), false))
}

/// Rewrite `text` and wrap it in the playlist response headers.
fn playlist_response(ctx: RewriteContext, text: &str) -> Response {
    let rewritten = ctx.rewrite_playlist(text);
    metrics::record_rewritten_lines(rewritten.lines_rewritten);
    info!(
        "Rewrote playlist {} ({} of {} lines)",
        ctx.base(),
        rewritten.lines_rewritten,
        rewritten.lines
    );

    let mut headers = HeaderMap::new();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(PLAYLIST_CONTENT_TYPE));
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    cors::apply(&mut headers, Expose::Nothing);

    (StatusCode::OK, headers, rewritten.body).into_response()
}

/// Pull the target out of the query string.
///
/// The value is form-decoded once; if it still looks percent-encoded
/// (`https%3A%2F%2F…`) it is decoded a second time. Relative targets resolve
/// against `upstream_base`.
pub fn resolve_target(query: Option<&str>, upstream_base: Option<&Url>) -> Result<Url> {
    let raw = query
        .and_then(|q| {
            url::form_urlencoded::parse(q.as_bytes())
                .find(|(key, _)| key == "url")
                .map(|(_, value)| value.into_owned())
        })
        .unwrap_or_default();

    let decoded = decode_target(raw.trim())?;
    if decoded.is_empty() {
        return Err(RelayError::InvalidInput(
            "missing `url` query parameter".to_string(),
        ));
    }

    match Url::parse(&decoded) {
        Ok(url) => Ok(url),
        Err(url::ParseError::RelativeUrlWithoutBase) => match upstream_base {
            Some(base) => base
                .join(&decoded)
                .map_err(|e| RelayError::InvalidInput(format!("{}: {}", decoded, e))),
            None => Err(RelayError::InvalidInput(format!(
                "{} is relative and no upstream base is configured",
                decoded
            ))),
        },
        Err(e) => Err(RelayError::InvalidInput(format!("{}: {}", decoded, e))),
    }
}

fn decode_target(value: &str) -> Result<String> {
    let lower = value.get(..8).unwrap_or(value).to_ascii_lowercase();
    if lower.starts_with("http%3a") || lower.starts_with("https%3a") {
        return urlencoding::decode(value)
            .map(|v| v.trim().to_string())
            .map_err(|e| RelayError::InvalidInput(format!("bad percent-encoding: {}", e)));
    }
    Ok(value.to_string())
}
