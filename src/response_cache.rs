//! Durable response cache.
//!
//! Maps a request URL to the time it was fetched and the JSON payload. Freshness is decided by
//! the reader, so entries never expire on their own; a stale entry stays until the next
//! successful fetch of the same URL overwrites it.

use crate::error::ErddapError;

use cached::stores::{DiskCache, DiskCacheBuilder};
use cached::IOCached;
use hashbrown::HashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// A cached response.
#[derive(Clone, Debug, PartialEq)]
pub struct CacheEntry {
    /// Exact request URL including the query string
    pub url: String,
    /// Milliseconds since the Unix epoch when the payload was fetched
    pub timestamp: u64,
    pub payload: Value,
}

impl CacheEntry {
    /// Returns true if the entry is younger than `ttl` at time `now` (epoch milliseconds).
    pub fn is_fresh(&self, now: u64, ttl: Duration) -> bool {
        now.saturating_sub(self.timestamp) < ttl.as_millis() as u64
    }
}

/// Source of the current time in epoch milliseconds.
pub trait Clock: Send + Sync {
    fn now_millis(&self) -> u64;
}

/// Wall clock.
#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default()
    }
}

/// Response cache trait.
///
/// At most one entry is held per URL; `put` replaces any previous entry.
pub trait ResponseCache: Send + Sync {
    /// Look up the entry for a URL.
    fn get(&self, url: &str) -> Result<Option<CacheEntry>, ErddapError>;

    /// Store an entry, replacing any previous entry for the same URL.
    fn put(&self, entry: CacheEntry) -> Result<(), ErddapError>;
}

/// In-memory response cache, lost when the process exits.
#[derive(Debug, Default)]
pub struct MemoryResponseCache {
    entries: Mutex<HashMap<String, CacheEntry>>,
}

impl MemoryResponseCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of cached URLs.
    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn poisoned<T>(_: T) -> ErddapError {
    ErddapError::CacheError {
        error: "cache lock poisoned".to_string(),
    }
}

impl ResponseCache for MemoryResponseCache {
    fn get(&self, url: &str) -> Result<Option<CacheEntry>, ErddapError> {
        Ok(self.entries.lock().map_err(poisoned)?.get(url).cloned())
    }

    fn put(&self, entry: CacheEntry) -> Result<(), ErddapError> {
        self.entries
            .lock()
            .map_err(poisoned)?
            .insert(entry.url.clone(), entry);
        Ok(())
    }
}

/// What is written to disk for each URL.
///
/// The payload is kept as JSON text; the disk store's own encoding cannot round trip an
/// arbitrary [serde_json::Value].
#[derive(Serialize, Deserialize)]
struct StoredEntry {
    timestamp: u64,
    payload: String,
}

/// Response cache persisted in a sled database via the `cached` crate's [DiskCache].
pub struct DiskResponseCache {
    store: DiskCache<String, StoredEntry>,
}

impl DiskResponseCache {
    /// Open (or create) the cache in a directory.
    ///
    /// # Arguments
    ///
    /// * `path`: Directory holding the cache database
    pub fn new(path: &Path) -> Result<Self, ErddapError> {
        let store = DiskCacheBuilder::new("erddap_responses")
            .set_disk_directory(path)
            .build()
            .map_err(|e| ErddapError::CacheError {
                error: format!("{:?}", e),
            })?;
        Ok(Self { store })
    }
}

impl ResponseCache for DiskResponseCache {
    fn get(&self, url: &str) -> Result<Option<CacheEntry>, ErddapError> {
        let stored = self
            .store
            .cache_get(&url.to_string())
            .map_err(|e| ErddapError::CacheError {
                error: format!("{:?}", e),
            })?;
        match stored {
            Some(stored) => {
                let payload = serde_json::from_str(&stored.payload).map_err(|e| {
                    ErddapError::CacheError {
                        error: e.to_string(),
                    }
                })?;
                Ok(Some(CacheEntry {
                    url: url.to_string(),
                    timestamp: stored.timestamp,
                    payload,
                }))
            }
            None => Ok(None),
        }
    }

    fn put(&self, entry: CacheEntry) -> Result<(), ErddapError> {
        let payload = serde_json::to_string(&entry.payload).map_err(|e| ErddapError::CacheError {
            error: e.to_string(),
        })?;
        self.store
            .cache_set(
                entry.url,
                StoredEntry {
                    timestamp: entry.timestamp,
                    payload,
                },
            )
            .map(|_| ())
            .map_err(|e| ErddapError::CacheError {
                error: format!("{:?}", e),
            })
    }
}
