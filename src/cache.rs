//! Short-TTL cache of raw upstream playlist text.
//!
//! Many viewers of one live stream request the same media playlist every
//! target duration. With a TTL of a second or two the relay fetches it from
//! upstream once per window instead of once per viewer.
//!
//! Entries hold the *unrewritten* body together with the final URL it was
//! served from, so the rewrite (which depends on the inbound host) still runs
//! per request.

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

#[cfg(feature = "valkey")]
use redis::aio::ConnectionManager;
#[cfg(feature = "valkey")]
use tracing::{error, info};

/// Raw playlist as fetched from upstream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedPlaylist {
    /// URL after redirects; the base for resolving relative references.
    pub final_url: String,
    pub body: String,
}

/// Storage for fetched playlists, keyed by the requested upstream URL.
#[async_trait]
pub trait PlaylistCache: Send + Sync {
    /// Fresh entry for `key`, if any.
    async fn get(&self, key: &str) -> Option<CachedPlaylist>;

    async fn set(&self, key: &str, playlist: CachedPlaylist);

    async fn has(&self, key: &str) -> bool {
        self.get(key).await.is_some()
    }

    /// Drop expired entries. Stores that expire on their own need not override.
    async fn purge_expired(&self) {}

    /// Entries currently held, when the store can tell cheaply.
    fn entry_count(&self) -> Option<usize> {
        None
    }
}

#[derive(Clone, Debug)]
struct CachedEntry {
    playlist: CachedPlaylist,
    stored_at: Instant,
}

/// In-process [`PlaylistCache`] on a `DashMap`.
#[derive(Clone, Debug)]
pub struct MemoryPlaylistCache {
    entries: Arc<DashMap<String, CachedEntry>>,
    ttl: Duration,
    max_entries: usize,
}

impl MemoryPlaylistCache {
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
            ttl,
            max_entries: max_entries.max(1),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Make room for one insert by removing expired entries, then the oldest.
    fn evict_for_insert(&self) {
        if self.entries.len() < self.max_entries {
            return;
        }
        self.entries.retain(|_, entry| entry.stored_at.elapsed() < self.ttl);
        while self.entries.len() >= self.max_entries {
            let oldest = self
                .entries
                .iter()
                .min_by_key(|entry| entry.stored_at)
                .map(|entry| entry.key().clone());
            match oldest {
                Some(key) => {
                    self.entries.remove(&key);
                }
                None => break,
            }
        }
    }
}

#[async_trait]
impl PlaylistCache for MemoryPlaylistCache {
    async fn get(&self, key: &str) -> Option<CachedPlaylist> {
        if let Some(entry) = self.entries.get(key) {
            if entry.stored_at.elapsed() < self.ttl {
                debug!("Playlist cache HIT for {}", key);
                return Some(entry.playlist.clone());
            }
            // Stale: drop the read guard before removing
            drop(entry);
            self.entries.remove(key);
        }
        debug!("Playlist cache MISS for {}", key);
        None
    }

    async fn set(&self, key: &str, playlist: CachedPlaylist) {
        if !self.entries.contains_key(key) {
            self.evict_for_insert();
        }
        self.entries.insert(
            key.to_string(),
            CachedEntry {
                playlist,
                stored_at: Instant::now(),
            },
        );
    }

    fn entry_count(&self) -> Option<usize> {
        Some(self.len())
    }

    async fn purge_expired(&self) {
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.stored_at.elapsed() < self.ttl);
        let removed = before.saturating_sub(self.entries.len());
        if removed > 0 {
            debug!("Purged {} expired playlist cache entries", removed);
        }
    }
}

/// [`PlaylistCache`] shared between relay instances through Valkey.
///
/// Expiry is delegated to the server (`SET … PX`).
#[cfg(feature = "valkey")]
#[derive(Clone)]
pub struct ValkeyPlaylistCache {
    conn: ConnectionManager,
    key_prefix: String,
    ttl: Duration,
}

#[cfg(feature = "valkey")]
impl ValkeyPlaylistCache {
    pub async fn connect(url: &str, ttl: Duration) -> Result<Self, redis::RedisError> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        info!("Connected to Valkey at {}", url);
        Ok(Self {
            conn,
            key_prefix: "hls-relay:playlist".to_string(),
            ttl,
        })
    }

    fn key(&self, key: &str) -> String {
        format!("{}:{}", self.key_prefix, key)
    }
}

#[cfg(feature = "valkey")]
#[async_trait]
impl PlaylistCache for ValkeyPlaylistCache {
    async fn get(&self, key: &str) -> Option<CachedPlaylist> {
        let mut conn = self.conn.clone();
        match redis::cmd("GET")
            .arg(self.key(key))
            .query_async::<Option<String>>(&mut conn)
            .await
        {
            Ok(Some(json)) => serde_json::from_str(&json).ok(),
            Ok(None) => None,
            Err(e) => {
                error!("Failed to read playlist from Valkey: {}", e);
                None
            }
        }
    }

    async fn set(&self, key: &str, playlist: CachedPlaylist) {
        let Ok(json) = serde_json::to_string(&playlist) else {
            return;
        };
        let mut conn = self.conn.clone();
        let ttl_ms = self.ttl.as_millis().max(1) as u64;
        if let Err(e) = redis::cmd("SET")
            .arg(self.key(key))
            .arg(&json)
            .arg("PX")
            .arg(ttl_ms)
            .query_async::<()>(&mut conn)
            .await
        {
            error!("Failed to store playlist in Valkey: {}", e);
        }
    }

    async fn has(&self, key: &str) -> bool {
        let mut conn = self.conn.clone();
        redis::cmd("EXISTS")
            .arg(self.key(key))
            .query_async::<bool>(&mut conn)
            .await
            .unwrap_or(false)
    }
}
