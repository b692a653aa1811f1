use crate::header_rules::HeaderRules;
use crate::http_retry::{
    BackoffStrategy, DEFAULT_BACKOFF_MS, DEFAULT_MAX_ATTEMPTS, DEFAULT_TIMEOUT_SECS, RetryConfig,
};
use std::env;
use std::time::Duration;
use url::Url;

/// Largest playlist body buffered for rewriting (8 MiB).
pub const DEFAULT_MAX_PLAYLIST_BYTES: usize = 8 * 1024 * 1024;

/// Cache store type selection
#[derive(Clone, Debug, PartialEq)]
pub enum CacheStoreType {
    Memory,
    Valkey,
}

/// Application configuration loaded from environment variables
#[derive(Clone, Debug)]
pub struct Config {
    pub port: u16,
    pub is_dev: bool,
    /// Public origin of the relay, used instead of the inbound `Host` when
    /// building rewritten URLs (e.g. `https://relay.example.com`)
    pub public_base_url: Option<String>,
    /// Base for resolving relative `url` parameters
    pub upstream_base_url: Option<Url>,
    /// Total upstream attempts per request (default: 3)
    pub retry_max_attempts: u32,
    /// Base delay between attempts (default: 1000)
    pub retry_delay_ms: u64,
    pub retry_backoff: BackoffStrategy,
    /// Per-attempt bound on waiting for upstream headers (default: 30)
    pub upstream_timeout_secs: u64,
    pub max_playlist_bytes: usize,
    /// Playlist cache TTL; 0 disables the cache
    pub playlist_cache_ttl_ms: u64,
    pub playlist_cache_max_entries: usize,
    pub cache_store: CacheStoreType,
    /// Valkey/Redis URL (used when cache_store = Valkey)
    pub valkey_url: Option<String>,
    /// Requests per minute per client IP; 0 disables limiting
    pub rate_limit_rpm: u32,
    /// Permit targets on loopback/private/link-local IP literals
    pub allow_private_origins: bool,
    /// gzip rewritten playlists for clients that accept it
    pub compress_playlists: bool,
    /// Fixed `User-Agent` sent upstream instead of the client's
    pub upstream_user_agent: Option<String>,
    /// Per-host `Origin`/`Referer`/`User-Agent` overrides
    pub upstream_header_rules: HeaderRules,
}

impl Default for Config {
    /// Development defaults, the same values `from_env` produces with only
    /// `DEV_MODE=true` set.
    fn default() -> Self {
        Self {
            port: 8000,
            is_dev: true,
            public_base_url: None,
            upstream_base_url: None,
            retry_max_attempts: DEFAULT_MAX_ATTEMPTS,
            retry_delay_ms: DEFAULT_BACKOFF_MS,
            retry_backoff: BackoffStrategy::Fixed,
            upstream_timeout_secs: DEFAULT_TIMEOUT_SECS,
            max_playlist_bytes: DEFAULT_MAX_PLAYLIST_BYTES,
            playlist_cache_ttl_ms: 0,
            playlist_cache_max_entries: 1024,
            cache_store: CacheStoreType::Memory,
            valkey_url: None,
            rate_limit_rpm: 0,
            allow_private_origins: true,
            compress_playlists: true,
            upstream_user_agent: None,
            upstream_header_rules: HeaderRules::default(),
        }
    }
}

fn parse_bool(name: &str, default: bool) -> bool {
    match env::var(name) {
        Ok(v) => matches!(v.trim().to_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}

fn parse_or<T: std::str::FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

impl Config {
    /// Load configuration from environment variables
    /// In DEV mode, provides sensible defaults. In PROD mode, PORT is required.
    pub fn from_env() -> Result<Self, Box<dyn std::error::Error>> {
        let is_dev = parse_bool("DEV_MODE", false);

        // Port: required in prod, defaults to 8000 in dev
        let port = if is_dev {
            env::var("PORT")
                .unwrap_or_else(|_| "8000".to_string())
                .parse()?
        } else {
            env::var("PORT")
                .map_err(|_| "PORT is required in production")?
                .parse()?
        };

        let public_base_url = env::var("PUBLIC_BASE_URL")
            .ok()
            .map(|v| v.trim().trim_end_matches('/').to_string())
            .filter(|v| !v.is_empty());
        if let Some(base) = &public_base_url {
            Url::parse(base).map_err(|e| format!("PUBLIC_BASE_URL is not a valid URL: {}", e))?;
        }

        let upstream_base_url = match env::var("UPSTREAM_BASE_URL") {
            Ok(v) if !v.trim().is_empty() => Some(
                Url::parse(v.trim())
                    .map_err(|e| format!("UPSTREAM_BASE_URL is not a valid URL: {}", e))?,
            ),
            _ => None,
        };

        let retry_backoff = match env::var("RETRY_BACKOFF") {
            Ok(v) => BackoffStrategy::parse(&v)
                .ok_or_else(|| format!("RETRY_BACKOFF must be fixed, linear or exponential, got {:?}", v))?,
            Err(_) => BackoffStrategy::Fixed,
        };

        let cache_store = match env::var("CACHE_STORE")
            .unwrap_or_else(|_| "memory".to_string())
            .to_lowercase()
            .as_str()
        {
            "valkey" | "redis" => CacheStoreType::Valkey,
            _ => CacheStoreType::Memory,
        };
        let valkey_url = env::var("VALKEY_URL").ok();

        let upstream_header_rules = match env::var("UPSTREAM_HEADER_RULES") {
            Ok(v) => HeaderRules::parse(&v)?,
            Err(_) => HeaderRules::default(),
        };

        Ok(Config {
            port,
            is_dev,
            public_base_url,
            upstream_base_url,
            retry_max_attempts: parse_or("RETRY_MAX_ATTEMPTS", DEFAULT_MAX_ATTEMPTS),
            retry_delay_ms: parse_or("RETRY_DELAY_MS", DEFAULT_BACKOFF_MS),
            retry_backoff,
            upstream_timeout_secs: parse_or("UPSTREAM_TIMEOUT_SECS", DEFAULT_TIMEOUT_SECS),
            max_playlist_bytes: parse_or("MAX_PLAYLIST_BYTES", DEFAULT_MAX_PLAYLIST_BYTES),
            playlist_cache_ttl_ms: parse_or("PLAYLIST_CACHE_TTL_MS", 0),
            playlist_cache_max_entries: parse_or("PLAYLIST_CACHE_MAX_ENTRIES", 1024),
            cache_store,
            valkey_url,
            rate_limit_rpm: parse_or("RATE_LIMIT_RPM", 0),
            // Private targets are a convenience for local testing only
            allow_private_origins: parse_bool("ALLOW_PRIVATE_ORIGINS", is_dev),
            compress_playlists: parse_bool("COMPRESS_PLAYLISTS", true),
            upstream_user_agent: env::var("UPSTREAM_USER_AGENT")
                .ok()
                .filter(|v| !v.trim().is_empty()),
            upstream_header_rules,
        })
    }

    /// Retry policy for upstream fetches.
    ///
    /// A timeout of 0 seconds disables the per-attempt bound.
    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: self.retry_max_attempts,
            backoff: Duration::from_millis(self.retry_delay_ms),
            strategy: self.retry_backoff,
            timeout: (self.upstream_timeout_secs > 0)
                .then(|| Duration::from_secs(self.upstream_timeout_secs)),
        }
    }

    pub fn playlist_cache_ttl(&self) -> Option<Duration> {
        (self.playlist_cache_ttl_ms > 0).then(|| Duration::from_millis(self.playlist_cache_ttl_ms))
    }
}
