//! Per-client rate limiting for the relay endpoint.
//!
//! Fixed one-minute windows counted in a DashMap keyed by client address.
//! A player reloading a live playlist and fetching its segments stays far
//! below a sensible limit; a client using the relay as a bulk downloader
//! does not. Preflights and the operational routes are never counted.

use axum::{
    extract::{ConnectInfo, Request, State},
    http::{HeaderValue, Method, header},
    middleware::Next,
    response::{IntoResponse, Response},
};
use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::warn;

use super::state::AppState;
use crate::error::RelayError;

/// Client address headers, most trusted first.
const CLIENT_IP_HEADERS: &[&str] = &["cf-connecting-ip", "x-forwarded-for", "x-real-ip"];

/// Paths that load balancers and scrapers poll.
const EXEMPT_PATHS: &[&str] = &["/health", "/metrics"];

#[derive(Debug, Clone, Copy)]
struct Window {
    started: Instant,
    count: u32,
}

/// Fixed-window request counter per client.
#[derive(Clone, Debug)]
pub struct RateLimiter {
    windows: Arc<DashMap<String, Window>>,
    limit: u32,
    length: Duration,
}

impl RateLimiter {
    pub fn new(requests_per_minute: u32) -> Self {
        Self::with_window(requests_per_minute, Duration::from_secs(60))
    }

    fn with_window(limit: u32, length: Duration) -> Self {
        Self {
            windows: Arc::new(DashMap::new()),
            limit,
            length,
        }
    }

    /// Count one request for `client`.
    ///
    /// On rejection returns how long until the client's window resets.
    pub fn try_acquire(&self, client: &str) -> Result<(), Duration> {
        let now = Instant::now();
        let mut window = self.windows.entry(client.to_string()).or_insert(Window {
            started: now,
            count: 0,
        });

        let elapsed = now.saturating_duration_since(window.started);
        if elapsed >= self.length {
            *window = Window {
                started: now,
                count: 0,
            };
        }

        if window.count >= self.limit {
            return Err(self.length.saturating_sub(elapsed));
        }
        window.count += 1;
        Ok(())
    }

    /// Drop windows that have already expired.
    pub fn cleanup(&self) {
        let length = self.length;
        self.windows.retain(|_, w| w.started.elapsed() < length);
    }

    pub fn tracked_clients(&self) -> usize {
        self.windows.len()
    }
}

/// Client address from proxy headers, else the socket peer, else `"unknown"`.
fn client_key(req: &Request) -> String {
    for name in CLIENT_IP_HEADERS {
        // X-Forwarded-For lists the original client first
        if let Some(value) = req.headers().get(*name)
            && let Ok(value) = value.to_str()
            && let Some(first) = value.split(',').next()
        {
            let ip = first.trim();
            if !ip.is_empty() {
                return ip.to_string();
            }
        }
    }

    req.extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

fn is_exempt(req: &Request) -> bool {
    req.method() == Method::OPTIONS || EXEMPT_PATHS.contains(&req.uri().path())
}

/// Reject relay requests over the per-client limit with 429 and `Retry-After`.
pub async fn rate_limit_middleware(
    State(state): State<AppState>,
    req: Request,
    next: Next,
) -> Response {
    let Some(limiter) = &state.rate_limiter else {
        return next.run(req).await;
    };
    if is_exempt(&req) {
        return next.run(req).await;
    }

    let client = client_key(&req);
    if let Err(reset_in) = limiter.try_acquire(&client) {
        warn!("Rate limit exceeded for {} ({:?} until reset)", client, reset_in);
        let mut response = RelayError::RateLimited.into_response();
        let secs = reset_in.as_secs().max(1);
        if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
            response.headers_mut().insert(header::RETRY_AFTER, value);
        }
        return response;
    }

    next.run(req).await
}
