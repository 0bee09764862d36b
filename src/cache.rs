//! Pluggable key/value cache behind every memoized computation.
//!
//! The contract is deliberately small: `add` is last-write-wins with an
//! optional TTL, `get` returns `Ok(None)` on a miss, and there is no
//! cross-key atomicity. [`MemoryCache`] is the in-process
//! implementation; a networked store (whole-second TTL granularity)
//! slots in behind the same trait.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;

use crate::error::Result;

#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Stores `value` under `key`. `None` means the entry never
    /// expires. Errors are upstream I/O failures, not "key exists".
    async fn add(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<()>;

    /// Returns the stored bytes, or `None` if the key is absent or
    /// expired.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;
}

struct CacheItem {
    data: Vec<u8>,
    expires_at: Option<Instant>,
}

impl CacheItem {
    fn is_expired(&self, now: Instant) -> bool {
        matches!(self.expires_at, Some(at) if now >= at)
    }
}

/// Thread-safe in-memory cache with per-entry TTL. Expired entries are
/// dropped lazily on the next `get`.
#[derive(Default)]
pub struct MemoryCache {
    items: Mutex<HashMap<String, CacheItem>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live entries, for debugging and tests.
    pub fn len(&self) -> usize {
        self.items.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.items.lock().unwrap().clear();
    }
}

#[async_trait]
impl CacheStore for MemoryCache {
    async fn add(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<()> {
        let item = CacheItem {
            data: value.to_vec(),
            expires_at: ttl.map(|d| Instant::now() + d),
        };
        self.items.lock().unwrap().insert(key.to_string(), item);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut items = self.items.lock().unwrap();
        match items.get(key) {
            Some(item) if item.is_expired(Instant::now()) => {
                items.remove(key);
                Ok(None)
            }
            Some(item) => Ok(Some(item.data.clone())),
            None => Ok(None),
        }
    }
}
