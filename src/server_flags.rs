//! Persisted per-server user flags.
//!
//! Only the "disabled" toggle is kept, keyed `"{endpoint}.disabled"`.

use crate::error::ErddapError;

use cached::stores::{DiskCache, DiskCacheBuilder};
use cached::IOCached;
use hashbrown::HashSet;
use std::path::Path;
use std::sync::Mutex;

fn disabled_key(endpoint: &str) -> String {
    format!("{}.disabled", endpoint)
}

/// Store for the user's per-server disabled flag.
pub trait ServerFlags: Send + Sync {
    fn is_disabled(&self, endpoint: &str) -> bool;

    fn set_disabled(&self, endpoint: &str, disabled: bool) -> Result<(), ErddapError>;
}

/// Flags held in memory only.
#[derive(Debug, Default)]
pub struct MemoryServerFlags {
    disabled: Mutex<HashSet<String>>,
}

impl MemoryServerFlags {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ServerFlags for MemoryServerFlags {
    fn is_disabled(&self, endpoint: &str) -> bool {
        self.disabled
            .lock()
            .map(|d| d.contains(&disabled_key(endpoint)))
            .unwrap_or(false)
    }

    fn set_disabled(&self, endpoint: &str, disabled: bool) -> Result<(), ErddapError> {
        let mut set = self.disabled.lock().map_err(|_| ErddapError::CacheError {
            error: "server flags lock poisoned".to_string(),
        })?;
        if disabled {
            set.insert(disabled_key(endpoint));
        } else {
            set.remove(&disabled_key(endpoint));
        }
        Ok(())
    }
}

/// Flags persisted next to the response cache.
pub struct DiskServerFlags {
    store: DiskCache<String, bool>,
}

impl DiskServerFlags {
    pub fn new(path: &Path) -> Result<Self, ErddapError> {
        let store = DiskCacheBuilder::new("erddap_server_flags")
            .set_disk_directory(path)
            .build()
            .map_err(|e| ErddapError::CacheError {
                error: format!("{:?}", e),
            })?;
        Ok(Self { store })
    }
}

impl ServerFlags for DiskServerFlags {
    fn is_disabled(&self, endpoint: &str) -> bool {
        match self.store.cache_get(&disabled_key(endpoint)) {
            Ok(flag) => flag.unwrap_or(false),
            Err(e) => {
                tracing::warn!("failed to read server flags for {}: {:?}", endpoint, e);
                false
            }
        }
    }

    fn set_disabled(&self, endpoint: &str, disabled: bool) -> Result<(), ErddapError> {
        let key = disabled_key(endpoint);
        let result = if disabled {
            self.store.cache_set(key, true).map(|_| ())
        } else {
            self.store.cache_remove(&key).map(|_| ())
        };
        result.map_err(|e| ErddapError::CacheError {
            error: format!("{:?}", e),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_flags() {
        let flags = MemoryServerFlags::new();
        assert!(!flags.is_disabled("http://a/erddap"));
        flags.set_disabled("http://a/erddap", true).unwrap();
        assert!(flags.is_disabled("http://a/erddap"));
        assert!(!flags.is_disabled("http://b/erddap"));
        flags.set_disabled("http://a/erddap", false).unwrap();
        assert!(!flags.is_disabled("http://a/erddap"));
    }
}
