//! Byte sources for bundle payloads.
//!
//! Readers return boxed futures so that the actual I/O happens on whichever
//! task-pool worker polls them, never on the caller's thread.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;

use parking_lot::RwLock;
use strata_core::alloc::HashMap;

use crate::error::{BundleError, BundleResult};
use crate::manifest::ContentHash;

/// Future type for async byte loading.
pub type BytesFuture = Pin<Box<dyn Future<Output = BundleResult<Vec<u8>>> + Send + 'static>>;

/// Trait for loading a bundle's bytes from some location.
pub trait BytesReader: Send + Sync + 'static {
    /// Read all bytes at `location`. The meaning of `location` depends on
    /// the reader: a path, an entry name or a URL.
    fn read_bytes(&self, location: &str) -> BytesFuture;
}

/// Reads bundles from disk.
#[derive(Debug, Clone, Default)]
pub struct FileReader {
    base_path: Option<PathBuf>,
}

impl FileReader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve relative locations against `base_path`.
    pub fn with_base_path(base_path: impl AsRef<Path>) -> Self {
        Self {
            base_path: Some(base_path.as_ref().to_path_buf()),
        }
    }

    fn resolve_path(&self, path: &Path) -> PathBuf {
        match &self.base_path {
            Some(base) if path.is_relative() => base.join(path),
            _ => path.to_path_buf(),
        }
    }

    /// Read bytes synchronously.
    pub fn read_bytes_sync(&self, path: &Path) -> BundleResult<Vec<u8>> {
        read_file(&self.resolve_path(path))
    }

    /// Read `path` when the returned future is first polled.
    pub fn read_path(&self, path: &Path) -> BytesFuture {
        let path = self.resolve_path(path);
        Box::pin(async move { read_file(&path) })
    }
}

impl BytesReader for FileReader {
    fn read_bytes(&self, location: &str) -> BytesFuture {
        self.read_path(Path::new(location))
    }
}

fn read_file(path: &Path) -> BundleResult<Vec<u8>> {
    std::fs::read(path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            BundleError::NotFound {
                path: path.display().to_string(),
            }
        } else {
            BundleError::Io {
                path: path.to_path_buf(),
                source: e,
            }
        }
    })
}

/// In-memory bundle store, used for embedded bundles and tests.
///
/// Clones share the same entries.
#[derive(Clone, Default)]
pub struct MemoryReader {
    entries: Arc<RwLock<HashMap<String, Arc<[u8]>>>>,
}

impl MemoryReader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, name: impl Into<String>, bytes: impl Into<Arc<[u8]>>) {
        self.entries.write().insert(name.into(), bytes.into());
    }

    pub fn remove(&self, name: &str) -> bool {
        self.entries.write().remove(name).is_some()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.read().contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl BytesReader for MemoryReader {
    fn read_bytes(&self, location: &str) -> BytesFuture {
        let result = self
            .entries
            .read()
            .get(location)
            .map(|bytes| bytes.to_vec())
            .ok_or_else(|| BundleError::NotFound {
                path: format!("memory://{}", location),
            });
        Box::pin(async move { result })
    }
}

/// Wraps a remote reader with an on-disk cache keyed by content hash.
///
/// Entries are only written and only trusted when the caller knows the
/// expected hash. A cached file whose bytes no longer hash to its name is
/// discarded and fetched again.
#[derive(Clone)]
pub struct CachedReader {
    inner: Arc<dyn BytesReader>,
    cache_dir: Option<PathBuf>,
}

impl CachedReader {
    pub fn new(inner: Arc<dyn BytesReader>, cache_dir: Option<PathBuf>) -> Self {
        Self { inner, cache_dir }
    }

    pub fn cache_dir(&self) -> Option<&Path> {
        self.cache_dir.as_deref()
    }

    /// Path of the cache entry for `hash`.
    pub fn cache_path(&self, hash: &ContentHash) -> Option<PathBuf> {
        self.cache_dir
            .as_ref()
            .map(|dir| dir.join(format!("{}.bundle", hash.to_hex())))
    }

    /// Fetch `location`, verifying against `expected` when given.
    pub fn read_verified(&self, location: &str, expected: Option<ContentHash>) -> BytesFuture {
        let cache_path = expected.as_ref().and_then(|hash| self.cache_path(hash));
        let inner = Arc::clone(&self.inner);
        let location = location.to_string();

        Box::pin(async move {
            if let (Some(path), Some(hash)) = (&cache_path, expected) {
                if let Ok(bytes) = std::fs::read(path) {
                    if ContentHash::of(&bytes) == hash {
                        tracing::debug!("Bundle cache hit for {}", location);
                        return Ok(bytes);
                    }
                    tracing::warn!("Discarding stale cache entry {}", path.display());
                    let _ = std::fs::remove_file(path);
                }
            }

            let bytes = inner.read_bytes(&location).await?;
            let Some(hash) = expected else {
                return Ok(bytes);
            };

            let actual = ContentHash::of(&bytes);
            if actual != hash {
                return Err(BundleError::ContentHashMismatch {
                    bundle: location,
                    expected: hash.to_hex(),
                    actual: actual.to_hex(),
                });
            }

            if let Some(path) = &cache_path {
                if let Err(e) = write_atomic(path, &bytes) {
                    tracing::warn!("Failed to cache {} at {}: {}", location, path.display(), e);
                }
            }
            Ok(bytes)
        })
    }
}

impl BytesReader for CachedReader {
    fn read_bytes(&self, location: &str) -> BytesFuture {
        self.read_verified(location, None)
    }
}

fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, bytes)?;
    std::fs::rename(&tmp, path)
}
