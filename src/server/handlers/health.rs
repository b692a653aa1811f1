use crate::cache::PlaylistCache;
use crate::server::state::AppState;
use axum::{Json, extract::State};
use serde_json::{Value, json};

/// Liveness check with build version, uptime and playlist cache size
pub async fn health_check(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": state.started_at.elapsed().as_secs(),
        "playlist_cache": {
            "enabled": state.cache.is_some(),
            "entries": state.cache.as_ref().and_then(|c| c.entry_count()),
        },
    }))
}
