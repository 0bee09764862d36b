//! The process context: computation registries, repository handles, and
//! the content-addressed memoization layer every computation runs
//! through.
//!
//! A [`Core`] is constructed once at startup, computations and
//! repositories are registered on it, and the serving layer then only
//! calls the `*_compute` entry points. Registries are behind read/write
//! locks but are read-mostly after startup.
//!
//! Memoization contract:
//!
//! - cache key = SHA-256 over `schema_version : id : part : ...` — the
//!   inputs are immutable hashes, so a key fully determines its value
//!   and correctness never depends on invalidation;
//! - a hit that fails to deserialize is treated as a miss and
//!   recomputed, never surfaced to the caller;
//! - a computation error is propagated and never cached;
//! - a store failure after a successful computation is logged and
//!   swallowed — the result is still returned.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::cache::CacheStore;
use crate::constants::SCHEMA_VERSION;
use crate::error::{Error, Result};
use crate::repo::{ObjectHash, RepoBackend};

// ============================================================================
// Computation traits
// ============================================================================

/// A deterministic computation over a single object (blob or tree),
/// keyed by the object's hash. Results are JSON-shaped so the serving
/// layer can pass them through untouched.
#[async_trait]
pub trait ObjectComputation: Send + Sync {
    async fn execute(
        &self,
        core: &Core,
        repo_id: &str,
        hash: ObjectHash,
    ) -> Result<serde_json::Value>;
}

/// A deterministic computation over an object in the context of a
/// commit, keyed by `(commit, hash)`.
#[async_trait]
pub trait CommitComputation: Send + Sync {
    async fn execute(
        &self,
        core: &Core,
        repo_id: &str,
        commit: ObjectHash,
        hash: ObjectHash,
    ) -> Result<serde_json::Value>;
}

/// A lod-0 tile computation: `TILE_SIZE²` i32 samples for one tile of
/// one commit's world square.
#[async_trait]
pub trait TileComputation: Send + Sync {
    async fn execute(
        &self,
        core: &Core,
        repo_id: &str,
        commit: ObjectHash,
        lod: i64,
        x: i64,
        y: i64,
    ) -> Result<Vec<i32>>;
}

// ============================================================================
// Core
// ============================================================================

/// Owns the cache handle and all registries. One per process.
pub struct Core {
    cache: Arc<dyn CacheStore>,
    repos: RwLock<HashMap<String, Arc<dyn RepoBackend>>>,
    object_computations: RwLock<HashMap<String, Arc<dyn ObjectComputation>>>,
    commit_computations: RwLock<HashMap<String, Arc<dyn CommitComputation>>>,
    tile_computations: RwLock<HashMap<String, Arc<dyn TileComputation>>>,
}

impl Core {
    pub fn new(cache: Arc<dyn CacheStore>) -> Self {
        Core {
            cache,
            repos: RwLock::new(HashMap::new()),
            object_computations: RwLock::new(HashMap::new()),
            commit_computations: RwLock::new(HashMap::new()),
            tile_computations: RwLock::new(HashMap::new()),
        }
    }

    pub fn cache(&self) -> &dyn CacheStore {
        self.cache.as_ref()
    }

    // ------------------------------------------------------------------
    // Repositories
    // ------------------------------------------------------------------

    /// Registers a repository under `repo_id`. Unlike computation ids,
    /// repo names come from configuration, so a duplicate is an error
    /// rather than a panic.
    pub fn register_repo(&self, repo_id: &str, backend: Arc<dyn RepoBackend>) -> Result<()> {
        let mut repos = self.repos.write().unwrap();
        if repos.contains_key(repo_id) {
            return Err(Error::invalid(format!(
                "existing repo with name {repo_id}"
            )));
        }
        repos.insert(repo_id.to_string(), backend);
        Ok(())
    }

    pub fn repo(&self, repo_id: &str) -> Result<Arc<dyn RepoBackend>> {
        self.repos
            .read()
            .unwrap()
            .get(repo_id)
            .cloned()
            .ok_or_else(|| Error::not_found("repo", repo_id))
    }

    pub fn list_repos(&self) -> Vec<String> {
        let mut names: Vec<String> = self.repos.read().unwrap().keys().cloned().collect();
        names.sort();
        names
    }

    // ------------------------------------------------------------------
    // Registration
    // ------------------------------------------------------------------

    /// Panics if `id` is already registered: two computations with one
    /// id is a programming error and must fail at startup, not at
    /// request time.
    pub fn register_object_computation(&self, id: &str, computation: Arc<dyn ObjectComputation>) {
        let mut map = self.object_computations.write().unwrap();
        if map.contains_key(id) {
            panic!("object computation already registered: {id}");
        }
        map.insert(id.to_string(), computation);
    }

    pub fn register_commit_computation(&self, id: &str, computation: Arc<dyn CommitComputation>) {
        let mut map = self.commit_computations.write().unwrap();
        if map.contains_key(id) {
            panic!("commit computation already registered: {id}");
        }
        map.insert(id.to_string(), computation);
    }

    pub fn register_tile_computation(&self, id: &str, computation: Arc<dyn TileComputation>) {
        let mut map = self.tile_computations.write().unwrap();
        if map.contains_key(id) {
            panic!("tile computation already registered: {id}");
        }
        map.insert(id.to_string(), computation);
    }

    pub fn list_object_computations(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .object_computations
            .read()
            .unwrap()
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }

    pub fn list_commit_computations(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .commit_computations
            .read()
            .unwrap()
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }

    pub fn list_tile_computations(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .tile_computations
            .read()
            .unwrap()
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }

    pub(crate) fn tile_computation(&self, id: &str) -> Result<Arc<dyn TileComputation>> {
        self.tile_computations
            .read()
            .unwrap()
            .get(id)
            .cloned()
            .ok_or_else(|| Error::not_found("tile computation", id))
    }

    // ------------------------------------------------------------------
    // Execution
    // ------------------------------------------------------------------

    /// Runs the object computation `id`, memoized per `(id, hash)`.
    pub async fn object_compute(
        &self,
        id: &str,
        repo_id: &str,
        hash: ObjectHash,
    ) -> Result<serde_json::Value> {
        let computation = self
            .object_computations
            .read()
            .unwrap()
            .get(id)
            .cloned()
            .ok_or_else(|| Error::not_found("computation", id))?;
        let hash_hex = hash.to_hex();
        self.memoized(
            &[id, &hash_hex],
            crate::constants::OBJECT_TTL,
            || computation.execute(self, repo_id, hash),
        )
        .await
    }

    /// Runs the commit computation `id`, memoized per
    /// `(id, commit, hash)`.
    pub async fn commit_compute(
        &self,
        id: &str,
        repo_id: &str,
        commit: ObjectHash,
        hash: ObjectHash,
    ) -> Result<serde_json::Value> {
        let computation = self
            .commit_computations
            .read()
            .unwrap()
            .get(id)
            .cloned()
            .ok_or_else(|| Error::not_found("computation", id))?;
        let commit_hex = commit.to_hex();
        let hash_hex = hash.to_hex();
        self.memoized(
            &[id, &commit_hex, &hash_hex],
            crate::constants::OBJECT_TTL,
            || computation.execute(self, repo_id, commit, hash),
        )
        .await
    }

    // ------------------------------------------------------------------
    // Memoization
    // ------------------------------------------------------------------

    /// Wraps `compute` with the content-addressed cache: JSON round-trip
    /// through the store, recompute on deserialize failure, never cache
    /// errors.
    pub(crate) async fn memoized<T, F, Fut>(
        &self,
        key_parts: &[&str],
        ttl: Option<Duration>,
        compute: F,
    ) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let key = cache_key(key_parts);

        match self.cache.get(&key).await {
            Ok(Some(cached)) => match serde_json::from_slice(&cached) {
                Ok(value) => {
                    debug!(key = %key, "cache hit");
                    return Ok(value);
                }
                Err(err) => {
                    // A stale shape from an old code version; recompute.
                    warn!(key = %key, %err, "cache entry failed to deserialize, recomputing");
                }
            },
            Ok(None) => {}
            Err(err) => {
                // A flaky store degrades to recomputation, not failure.
                warn!(key = %key, %err, "cache read failed, recomputing");
            }
        }

        let result = compute().await?;

        match serde_json::to_vec(&result) {
            Ok(serialized) => {
                if let Err(err) = self.cache.add(&key, &serialized, ttl).await {
                    warn!(key = %key, %err, "failed to store cache entry");
                }
            }
            Err(err) => {
                warn!(key = %key, %err, "failed to serialize result for caching");
            }
        }

        Ok(result)
    }

    /// Like [`Core::memoized`] but for raw byte payloads (tile pixels),
    /// skipping the JSON round-trip.
    pub(crate) async fn memoized_bytes<F, Fut>(
        &self,
        key_parts: &[&str],
        ttl: Option<Duration>,
        compute: F,
    ) -> Result<Vec<u8>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Vec<u8>>>,
    {
        let key = cache_key(key_parts);

        match self.cache.get(&key).await {
            Ok(Some(cached)) => {
                debug!(key = %key, "cache hit");
                return Ok(cached);
            }
            Ok(None) => {}
            Err(err) => {
                warn!(key = %key, %err, "cache read failed, recomputing");
            }
        }

        let result = compute().await?;

        if let Err(err) = self.cache.add(&key, &result, ttl).await {
            warn!(key = %key, %err, "failed to store cache entry");
        }

        Ok(result)
    }
}

/// Hex SHA-256 over the schema version and the key parts, colon-joined.
pub fn cache_key(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(SCHEMA_VERSION.as_bytes());
    for part in parts {
        hasher.update(b":");
        hasher.update(part.as_bytes());
    }
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn test_core() -> Core {
        Core::new(Arc::new(MemoryCache::new()))
    }

    struct CountingComputation {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ObjectComputation for CountingComputation {
        async fn execute(
            &self,
            _core: &Core,
            _repo_id: &str,
            hash: ObjectHash,
        ) -> Result<serde_json::Value> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(serde_json::json!({ "hash": hash.to_hex(), "answer": 42 }))
        }
    }

    struct FailingComputation;

    #[async_trait]
    impl ObjectComputation for FailingComputation {
        async fn execute(
            &self,
            _core: &Core,
            _repo_id: &str,
            _hash: ObjectHash,
        ) -> Result<serde_json::Value> {
            Err(Error::upstream("boom"))
        }
    }

    #[test]
    fn test_cache_key_is_stable_and_distinct() {
        let a = cache_key(&["index", "abc"]);
        let b = cache_key(&["index", "abc"]);
        let c = cache_key(&["index", "abd"]);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 64);
    }

    #[tokio::test]
    async fn test_memoization_runs_underlying_fn_once() {
        let core = test_core();
        let computation = Arc::new(CountingComputation {
            calls: AtomicUsize::new(0),
        });
        core.register_object_computation("counting", computation.clone());

        let hash = ObjectHash::of_content(b"content");
        let first = core.object_compute("counting", "r", hash).await.unwrap();
        let second = core.object_compute("counting", "r", hash).await.unwrap();

        assert_eq!(computation.calls.load(Ordering::SeqCst), 1);
        // Structurally equal after the cache round-trip.
        assert_eq!(first, second);
        assert_eq!(first["answer"], 42);
    }

    #[tokio::test]
    async fn test_distinct_hashes_compute_separately() {
        let core = test_core();
        let computation = Arc::new(CountingComputation {
            calls: AtomicUsize::new(0),
        });
        core.register_object_computation("counting", computation.clone());

        core.object_compute("counting", "r", ObjectHash::of_content(b"a"))
            .await
            .unwrap();
        core.object_compute("counting", "r", ObjectHash::of_content(b"b"))
            .await
            .unwrap();
        assert_eq!(computation.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_errors_are_not_cached() {
        let cache = Arc::new(MemoryCache::new());
        let core = Core::new(cache.clone());
        core.register_object_computation("failing", Arc::new(FailingComputation));

        let hash = ObjectHash::of_content(b"x");
        let err = core.object_compute("failing", "r", hash).await.unwrap_err();
        assert!(matches!(err, Error::Upstream(_)));
        // Nothing was stored for the failed run.
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_corrupt_cache_entry_recomputes() {
        let cache = Arc::new(MemoryCache::new());
        let core = Core::new(cache.clone());
        let computation = Arc::new(CountingComputation {
            calls: AtomicUsize::new(0),
        });
        core.register_object_computation("counting", computation.clone());

        let hash = ObjectHash::of_content(b"y");
        let hash_hex = hash.to_hex();
        let key = cache_key(&["counting", &hash_hex]);
        cache.add(&key, b"not json{", None).await.unwrap();

        let value = core.object_compute("counting", "r", hash).await.unwrap();
        assert_eq!(value["answer"], 42);
        assert_eq!(computation.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unknown_computation_is_not_found() {
        let core = test_core();
        let err = core
            .object_compute("missing", "r", ObjectHash::ZERO)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));
        assert!(err.is_user_error());
    }

    #[test]
    #[should_panic(expected = "already registered")]
    fn test_duplicate_object_registration_panics() {
        let core = test_core();
        core.register_object_computation(
            "dup",
            Arc::new(CountingComputation {
                calls: AtomicUsize::new(0),
            }),
        );
        core.register_object_computation(
            "dup",
            Arc::new(CountingComputation {
                calls: AtomicUsize::new(0),
            }),
        );
    }

    #[test]
    fn test_repo_registration() {
        use crate::repo::MemoryRepo;

        let core = test_core();
        core.register_repo("one", Arc::new(MemoryRepo::new())).unwrap();
        assert!(core
            .register_repo("one", Arc::new(MemoryRepo::new()))
            .is_err());
        assert!(core.repo("one").is_ok());
        assert!(matches!(
            core.repo("absent").unwrap_err(),
            Error::NotFound { .. }
        ));
        assert_eq!(core.list_repos(), vec!["one".to_string()]);
    }
}
