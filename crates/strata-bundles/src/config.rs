//! Configuration for the bundle cache.

use std::path::PathBuf;
use std::time::Duration;

/// What `unload` does when some assets still have outstanding leases.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeakPolicy {
    /// Refuse the unload and report every leaked lease.
    Strict,
    /// Log the leaks and unload anyway.
    Permissive,
}

impl Default for LeakPolicy {
    fn default() -> Self {
        if cfg!(debug_assertions) {
            LeakPolicy::Strict
        } else {
            LeakPolicy::Permissive
        }
    }
}

/// Configuration for a [`BundleManager`](crate::BundleManager).
#[derive(Debug, Clone)]
pub struct BundleCacheConfig {
    /// How long an unleased asset stays resident before the sweep evicts it.
    pub eviction_threshold: Duration,
    /// Names per indexing task.
    pub index_batch_size: usize,
    /// Worker threads for fetching and indexing. `None` uses one per core,
    /// minus one for the owning thread.
    pub worker_threads: Option<usize>,
    pub leak_policy: LeakPolicy,
    /// Relative `file://` URIs are resolved against this directory.
    pub base_path: Option<PathBuf>,
    /// Where verified remote payloads are cached. `None` disables the cache.
    pub cache_dir: Option<PathBuf>,
}

impl Default for BundleCacheConfig {
    fn default() -> Self {
        Self {
            eviction_threshold: Duration::from_secs(5 * 60),
            index_batch_size: 64,
            worker_threads: None,
            leak_policy: LeakPolicy::default(),
            base_path: None,
            cache_dir: None,
        }
    }
}

impl BundleCacheConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_eviction_threshold(mut self, threshold: Duration) -> Self {
        self.eviction_threshold = threshold;
        self
    }

    pub fn with_index_batch_size(mut self, size: usize) -> Self {
        self.index_batch_size = size.max(1);
        self
    }

    pub fn with_worker_threads(mut self, threads: usize) -> Self {
        self.worker_threads = Some(threads.max(1));
        self
    }

    pub fn with_leak_policy(mut self, policy: LeakPolicy) -> Self {
        self.leak_policy = policy;
        self
    }

    pub fn with_base_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.base_path = Some(path.into());
        self
    }

    pub fn with_cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cache_dir = Some(dir.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = BundleCacheConfig::default();
        assert_eq!(config.eviction_threshold, Duration::from_secs(300));
        assert_eq!(config.index_batch_size, 64);
        assert!(config.cache_dir.is_none());
        #[cfg(debug_assertions)]
        assert_eq!(config.leak_policy, LeakPolicy::Strict);
    }

    #[test]
    fn test_builder_clamps_sizes() {
        let config = BundleCacheConfig::new()
            .with_index_batch_size(0)
            .with_worker_threads(0);
        assert_eq!(config.index_batch_size, 1);
        assert_eq!(config.worker_threads, Some(1));
    }
}
