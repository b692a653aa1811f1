use crate::{
    cache::{MemoryPlaylistCache, PlaylistCache},
    config::{CacheStoreType, Config},
    http_retry::RetryConfig,
    metrics,
    server::rate_limit::RateLimiter,
    upstream::{HttpTransport, Transport},
};
use metrics_exporter_prometheus::PrometheusHandle;
use reqwest::{Client, redirect};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::info;

#[cfg(feature = "valkey")]
use crate::cache::ValkeyPlaylistCache;
#[cfg(not(feature = "valkey"))]
use tracing::warn;

/// Application state shared across all handlers
#[derive(Clone)]
pub struct AppState {
    /// Application configuration
    pub config: Arc<Config>,
    /// Outbound HTTP, pooled and shared
    pub transport: Arc<dyn Transport>,
    pub retry: RetryConfig,
    /// Read-through cache of raw upstream playlists (None when disabled)
    pub cache: Option<Arc<dyn PlaylistCache>>,
    /// Per-IP rate limiter (None when disabled)
    pub rate_limiter: Option<RateLimiter>,
    /// Prometheus render handle (None if another recorder is installed)
    pub metrics: Option<PrometheusHandle>,
    pub started_at: Instant,
}

/// Pooled client used for every upstream fetch.
pub fn build_http_client() -> Result<Client, reqwest::Error> {
    Client::builder()
        .pool_idle_timeout(Duration::from_secs(90))
        .pool_max_idle_per_host(10)
        .redirect(redirect::Policy::limited(10))
        .build()
}

impl AppState {
    /// Create a new AppState with the given configuration
    pub async fn new(config: Config) -> Result<Self, Box<dyn std::error::Error>> {
        let transport = Arc::new(HttpTransport::new(build_http_client()?));
        Self::with_transport(config, transport).await
    }

    /// Same as [`AppState::new`] but with a caller-supplied transport.
    pub async fn with_transport(
        config: Config,
        transport: Arc<dyn Transport>,
    ) -> Result<Self, Box<dyn std::error::Error>> {
        let cache = build_cache(&config).await?;
        let rate_limiter = (config.rate_limit_rpm > 0).then(|| {
            info!("Rate limiting enabled: {} requests/minute per IP", config.rate_limit_rpm);
            RateLimiter::new(config.rate_limit_rpm)
        });

        Ok(Self {
            retry: config.retry_config(),
            config: Arc::new(config),
            transport,
            cache,
            rate_limiter,
            metrics: metrics::install(),
            started_at: Instant::now(),
        })
    }
}

async fn build_cache(
    config: &Config,
) -> Result<Option<Arc<dyn PlaylistCache>>, Box<dyn std::error::Error>> {
    let Some(ttl) = config.playlist_cache_ttl() else {
        return Ok(None);
    };

    match config.cache_store {
        CacheStoreType::Memory => {
            info!(
                "Playlist cache: memory (ttl {}ms, max {} entries)",
                ttl.as_millis(),
                config.playlist_cache_max_entries
            );
            Ok(Some(Arc::new(MemoryPlaylistCache::new(
                ttl,
                config.playlist_cache_max_entries,
            ))))
        }
        #[cfg(feature = "valkey")]
        CacheStoreType::Valkey => {
            let url = config
                .valkey_url
                .as_deref()
                .ok_or("VALKEY_URL is required when CACHE_STORE=valkey")?;
            let cache = ValkeyPlaylistCache::connect(url, ttl).await?;
            info!("Playlist cache: valkey (ttl {}ms)", ttl.as_millis());
            Ok(Some(Arc::new(cache)))
        }
        #[cfg(not(feature = "valkey"))]
        CacheStoreType::Valkey => {
            warn!("CACHE_STORE=valkey but built without the `valkey` feature; using memory");
            Ok(Some(Arc::new(MemoryPlaylistCache::new(
                ttl,
                config.playlist_cache_max_entries,
            ))))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn cache_disabled_by_default() {
        let state = AppState::new(Config::default()).await.unwrap();
        assert!(state.cache.is_none());
        assert!(state.rate_limiter.is_none());
        assert_eq!(state.retry.max_attempts, 3);
    }

    #[tokio::test]
    async fn cache_and_limiter_enabled_by_config() {
        let config = Config {
            playlist_cache_ttl_ms: 2000,
            rate_limit_rpm: 120,
            ..Config::default()
        };
        let state = AppState::new(config).await.unwrap();
        assert!(state.cache.is_some());
        assert!(state.rate_limiter.is_some());
    }
}
