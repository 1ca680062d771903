//! On-disk repository cache.
//!
//! Cache entries are keyed by `sha256(normalized-url + ref)`. Mutating
//! operations on one key are serialized through a per-key async lock;
//! readers of an already-materialized working tree proceed in parallel.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use sha2::{Digest, Sha256};
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Entries younger than this are returned without contacting the remote.
pub const FRESHNESS_TTL: Duration = Duration::from_secs(300);

/// Compute the cache key for a repository/ref pair.
#[must_use]
pub fn cache_key(url: &str, reference: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(normalize_url(url).as_bytes());
    hasher.update(reference.as_bytes());
    hex::encode(hasher.finalize())
}

/// Normalize a repository URL so that equivalent spellings share one entry.
fn normalize_url(url: &str) -> String {
    let trimmed = url.trim();
    let trimmed = trimmed.strip_suffix('/').unwrap_or(trimmed);
    let trimmed = trimmed.strip_suffix(".git").unwrap_or(trimmed);
    trimmed.to_ascii_lowercase()
}

#[derive(Debug, Clone)]
struct CacheEntry {
    path: PathBuf,
    last_update: Instant,
}

/// Shared cache of cloned working trees.
pub struct RepoCache {
    root: PathBuf,
    entries: DashMap<String, CacheEntry>,
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl RepoCache {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            entries: DashMap::new(),
            locks: DashMap::new(),
        }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory a given key materializes into.
    #[must_use]
    pub fn path_for(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }

    /// Acquire the mutation lock for one cache key.
    ///
    /// The lock is fair: waiters are granted in FIFO order, which keeps
    /// concurrent syncs of the same repository sequential.
    pub async fn lock(&self, key: &str) -> OwnedMutexGuard<()> {
        let lock = self
            .locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        lock.lock_owned().await
    }

    /// Look up an entry, reporting whether it is still fresh.
    pub fn get(&self, key: &str) -> Option<(PathBuf, bool)> {
        self.entries.get(key).map(|entry| {
            let fresh = entry.last_update.elapsed() < FRESHNESS_TTL;
            (entry.path.clone(), fresh)
        })
    }

    /// Record a successful clone or update.
    pub fn record(&self, key: &str, path: PathBuf) {
        self.entries.insert(
            key.to_string(),
            CacheEntry {
                path,
                last_update: Instant::now(),
            },
        );
    }

    /// Drop one entry; the working tree on disk is removed by the caller.
    pub fn evict(&self, key: &str) {
        self.entries.remove(key);
    }

    /// Find the key that materialized a given working directory.
    pub fn key_for_path(&self, path: &Path) -> Option<String> {
        self.entries
            .iter()
            .find(|entry| entry.value().path == path)
            .map(|entry| entry.key().clone())
    }

    /// All materialized paths, for bulk cleanup.
    pub fn all_paths(&self) -> Vec<(String, PathBuf)> {
        self.entries
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().path.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equivalent_urls_share_a_key() {
        let a = cache_key("https://github.com/Acme/Repo.git", "main");
        let b = cache_key("https://github.com/acme/repo", "main");
        let c = cache_key("https://github.com/acme/repo/", "main");
        assert_eq!(a, b);
        assert_eq!(b, c);
    }

    #[test]
    fn different_refs_get_different_keys() {
        let main = cache_key("https://github.com/acme/repo", "main");
        let dev = cache_key("https://github.com/acme/repo", "develop");
        assert_ne!(main, dev);
    }

    #[test]
    fn key_is_hex_sha256() {
        let key = cache_key("https://github.com/acme/repo", "main");
        assert_eq!(key.len(), 64);
        assert!(key.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn record_and_get_round_trip() {
        let cache = RepoCache::new("/tmp/gitsync-test");
        let key = cache_key("https://github.com/acme/repo", "main");
        assert!(cache.get(&key).is_none());

        cache.record(&key, cache.path_for(&key));
        let (path, fresh) = cache.get(&key).expect("entry recorded");
        assert_eq!(path, cache.path_for(&key));
        assert!(fresh);

        cache.evict(&key);
        assert!(cache.get(&key).is_none());
    }

    #[test]
    fn key_for_path_resolves_recorded_entries() {
        let cache = RepoCache::new("/tmp/gitsync-test");
        let key = cache_key("https://github.com/acme/repo", "main");
        let path = cache.path_for(&key);
        cache.record(&key, path.clone());
        assert_eq!(cache.key_for_path(&path), Some(key));
        assert_eq!(cache.key_for_path(Path::new("/elsewhere")), None);
    }

    #[tokio::test]
    async fn lock_serializes_same_key() {
        let cache = Arc::new(RepoCache::new("/tmp/gitsync-test"));
        let key = cache_key("https://github.com/acme/repo", "main");

        let guard = cache.lock(&key).await;
        let contender = {
            let cache = cache.clone();
            let key = key.clone();
            tokio::spawn(async move {
                let _guard = cache.lock(&key).await;
            })
        };

        // The contender cannot finish while the first guard is held.
        tokio::task::yield_now().await;
        assert!(!contender.is_finished());

        drop(guard);
        contender.await.expect("contender completes after release");
    }
}
