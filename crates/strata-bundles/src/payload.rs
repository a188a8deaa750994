//! A fetched bundle and the objects decoded from it.

use std::any::{Any, TypeId};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;
use strata_core::alloc::HashMap;
use strata_core::tasks::TaskPool;

use crate::archive::{AssetBytes, BundleArchive};
use crate::error::{BundleError, BundleResult, SharedResult};
use crate::key::KeyHash;
use crate::promise::Promise;

/// A decoded asset, shared between every handle that leased it.
pub type AssetObject = Arc<dyn Any + Send + Sync>;

type ObjectKey = (KeyHash, TypeId);

struct PayloadInner {
    origin: String,
    archive: BundleArchive,
    objects: Mutex<HashMap<ObjectKey, Promise<SharedResult<AssetObject>>>>,
    fetches: AtomicUsize,
}

/// The in-memory contents of a loaded bundle.
///
/// Decoded objects are memoised per `(key, type)`: concurrent requests for
/// the same object share one in-flight decode.
#[derive(Clone)]
pub struct BundlePayload {
    inner: Arc<PayloadInner>,
}

impl BundlePayload {
    pub fn new(origin: impl Into<String>, archive: BundleArchive) -> Self {
        Self {
            inner: Arc::new(PayloadInner {
                origin: origin.into(),
                archive,
                objects: Mutex::new(HashMap::new()),
                fetches: AtomicUsize::new(0),
            }),
        }
    }

    pub fn origin(&self) -> &str {
        &self.inner.origin
    }

    pub fn archive(&self) -> &BundleArchive {
        &self.inner.archive
    }

    /// Number of decodes started since the payload was created.
    pub fn fetch_count(&self) -> usize {
        self.inner.fetches.load(Ordering::Acquire)
    }

    /// Get or start the decode of entry `entry` as `type_id`.
    ///
    /// A new decode runs `decode` on `pool`; a request for an object that is
    /// already memoised returns the existing promise.
    pub fn fetch_object<F>(
        &self,
        pool: &TaskPool,
        entry: u32,
        hash: KeyHash,
        type_id: TypeId,
        decode: F,
    ) -> Promise<SharedResult<AssetObject>>
    where
        F: FnOnce(AssetBytes) -> BundleResult<AssetObject> + Send + 'static,
    {
        let mut objects = self.inner.objects.lock();
        if let Some(existing) = objects.get(&(hash, type_id)) {
            if !existing.is_disposed() {
                return existing.clone();
            }
        }

        let (promise, resolver) = Promise::pending();
        objects.insert((hash, type_id), promise.clone());
        drop(objects);

        self.inner.fetches.fetch_add(1, Ordering::AcqRel);
        let bytes = self.inner.archive.entry_bytes(entry);
        let origin = self.inner.origin.clone();
        pool.spawn(async move {
            let result = match bytes {
                Some(bytes) => decode(bytes),
                None => Err(BundleError::Corrupt {
                    bundle: origin,
                    reason: format!("entry {} out of range", entry),
                }),
            };
            resolver.resolve(result.map_err(Arc::new));
        })
        .detach();

        promise
    }

    /// The memoised result for `(hash, type_id)`, if its decode finished.
    pub fn object(&self, hash: KeyHash, type_id: TypeId) -> Option<SharedResult<AssetObject>> {
        self.inner
            .objects
            .lock()
            .get(&(hash, type_id))
            .and_then(Promise::try_get)
    }

    /// Drop every memoised object for `hash`. Returns how many were dropped.
    pub fn evict(&self, hash: KeyHash) -> usize {
        let mut objects = self.inner.objects.lock();
        let before = objects.len();
        objects.retain(|(key, _), _| *key != hash);
        before - objects.len()
    }

    /// Drop the memoised `(hash, type_id)` object so the next request decodes again.
    pub fn forget(&self, hash: KeyHash, type_id: TypeId) -> bool {
        self.inner.objects.lock().remove(&(hash, type_id)).is_some()
    }

    /// Drop every memoised object.
    pub fn clear_objects(&self) {
        self.inner.objects.lock().clear();
    }

    pub fn object_count(&self) -> usize {
        self.inner.objects.lock().len()
    }
}

impl fmt::Debug for BundlePayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BundlePayload")
            .field("origin", &self.inner.origin)
            .field("entries", &self.inner.archive.len())
            .field("fetches", &self.fetch_count())
            .finish()
    }
}
