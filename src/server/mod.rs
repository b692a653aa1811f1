pub mod cors;
pub mod forward;
pub mod handlers;
pub mod rate_limit;
pub mod state;
pub mod url_validation;

use crate::config::Config;
use axum::{
    Router,
    http::{Extensions, HeaderMap, HeaderName, HeaderValue, StatusCode, Version, header},
    middleware,
    routing::get,
};
use state::AppState;
use std::net::SocketAddr;
use std::time::Duration;
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tower_http::{
    compression::{CompressionLayer, DefaultPredicate, Predicate},
    set_header::SetResponseHeaderLayer,
    trace::TraceLayer,
};
use tracing::{error, info};

/// How often expired rate-limit windows and cache entries are swept.
const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(60);

/// Only rewritten playlists are compressed; segments are already compressed
/// media and passthrough bodies stream with their upstream length.
fn is_playlist_response(
    _status: StatusCode,
    _version: Version,
    headers: &HeaderMap,
    _extensions: &Extensions,
) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.contains("mpegurl"))
}

/// Build the router for an existing state.
pub fn router(state: AppState) -> Router {
    let compress = state.config.compress_playlists;

    let app = Router::new()
        .route(
            "/",
            get(handlers::proxy::proxy)
                .post(handlers::proxy::proxy)
                .options(handlers::proxy::preflight),
        )
        .route("/health", get(handlers::health::health_check))
        .route("/metrics", get(handlers::metrics::render_metrics))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            rate_limit::rate_limit_middleware,
        ))
        .with_state(state);

    let app = if compress {
        app.layer(
            CompressionLayer::new()
                .gzip(true)
                .compress_when(DefaultPredicate::new().and(is_playlist_response)),
        )
    } else {
        app
    };

    app.layer(SetResponseHeaderLayer::overriding(
        HeaderName::from_static("x-relay-version"),
        HeaderValue::from_static(env!("CARGO_PKG_VERSION")),
    ))
    .layer(TraceLayer::new_for_http())
}

/// Build the full router from configuration.
pub async fn build_router(config: Config) -> Result<Router, Box<dyn std::error::Error>> {
    Ok(router(AppState::new(config).await?))
}

/// Periodically sweep the rate limiter and playlist cache, and let the
/// Prometheus recorder drain its histogram buffers.
async fn run_maintenance(state: AppState, token: CancellationToken) {
    let mut ticker = tokio::time::interval(MAINTENANCE_INTERVAL);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {
                if let Some(limiter) = &state.rate_limiter {
                    limiter.cleanup();
                }
                if let Some(cache) = &state.cache {
                    cache.purge_expired().await;
                }
                if let Some(handle) = &state.metrics {
                    handle.run_upkeep();
                }
            }
        }
    }
    info!("Maintenance task stopped");
}

/// Resolves on Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Shutdown signal received");
}

/// Start the Axum HTTP server
pub async fn start(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    let addr = format!("0.0.0.0:{}", config.port);

    let state = AppState::new(config).await?;
    let app = router(state.clone());

    let token = CancellationToken::new();
    let tracker = TaskTracker::new();
    tracker.spawn(run_maintenance(state, token.clone()));
    tracker.close();

    let listener = match tokio::net::TcpListener::bind(addr.as_str()).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Failed to bind to address {}: {}", addr, e);
            return Err(e.into());
        }
    };

    info!("Relay listening on http://{}", addr);

    let shutdown_token = token.clone();
    let served = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        shutdown_signal().await;
        shutdown_token.cancel();
    })
    .await;

    token.cancel();
    tracker.wait().await;

    if let Err(e) = served {
        error!("Server error: {}", e);
        return Err(e.into());
    }

    info!("Server stopped");
    Ok(())
}
