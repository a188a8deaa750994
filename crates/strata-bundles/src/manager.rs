//! The bundle manager - the cache that owns every bundle and asset record.

use std::any::{Any, TypeId};
use std::collections::VecDeque;
use std::panic::Location;
use std::path::Path;
use std::sync::Arc;
use std::thread::{self, ThreadId};

use strata_core::alloc::HashMap;
use strata_core::alloc::sparse_set::SparseSet;
use strata_core::profiling::profile_function;
use strata_core::tasks::{TaskPool, block_on};
use strata_core::time::{Clock, SystemClock};

use crate::Asset;
use crate::archive::BundleArchive;
use crate::config::{BundleCacheConfig, LeakPolicy};
use crate::error::{BundleError, BundleResult, LeakReport, SharedResult};
use crate::event::{BundleEvent, BundleEventBuffer};
use crate::handle::{AssetHandle, BundleHandle, Handle};
use crate::index::{self, AssetMap, IndexJob};
use crate::io::{BytesFuture, BytesReader, CachedReader, FileReader, MemoryReader};
use crate::key::{KeyHash, normalize_key};
use crate::loader::{self, AssetLoader, LoaderRegistry};
use crate::manifest::{self, BundleManifest};
use crate::payload::{AssetObject, BundlePayload};
use crate::promise::Promise;
use crate::record::{AssetRecord, BundleRecord, PendingFetch};
use crate::source::BundleUri;
use crate::state::{AssetStatus, BundleState, CacheStats};

/// An asset queued for the idle sweep.
#[derive(Debug, Clone, Copy)]
struct QueuedEviction {
    bundle: BundleHandle,
    asset_index: u32,
}

/// A leased asset whose decode had not finished when it was requested.
struct PendingAsset {
    handle: AssetHandle,
    promise: Promise<SharedResult<AssetObject>>,
}

/// The result of [`BundleManager::load_asset_async`]: the lease, already
/// taken, and the decode in flight.
pub struct AssetRequest<T: Asset> {
    pub handle: Handle<T>,
    pub promise: Promise<SharedResult<AssetObject>>,
}

impl<T: Asset> AssetRequest<T> {
    pub fn is_ready(&self) -> bool {
        self.promise.is_complete()
    }

    /// Block until the decode finishes.
    pub fn wait(&self) -> BundleResult<Arc<T>> {
        downcast_result::<T>(block_on(self.promise.clone()))
    }

    /// Run `callback` with the decoded asset once it is available.
    pub fn on_complete(&self, callback: impl FnOnce(BundleResult<Arc<T>>) + Send + 'static) {
        self.promise
            .on_complete(move |result| callback(downcast_result::<T>(Some(result.clone()))));
    }
}

fn object_type(object: &AssetObject) -> TypeId {
    let any: &dyn Any = &**object;
    any.type_id()
}

fn downcast_result<T: Asset>(result: Option<SharedResult<AssetObject>>) -> BundleResult<Arc<T>> {
    match result {
        Some(Ok(object)) => object.downcast::<T>().map_err(|object| BundleError::TypeMismatch {
            expected: T::type_name(),
            actual: object_type(&object),
        }),
        Some(Err(e)) => Err((*e).clone()),
        None => Err(BundleError::Other {
            message: "asset load was disposed".to_string(),
        }),
    }
}

/// The resource bundle and asset cache.
///
/// A single owning thread drives every public call; fetches, decodes and
/// indexing run on the manager's task pool. Reads of a bundle's asset list
/// first wait for any index job still in flight.
///
/// # Example
///
/// ```ignore
/// let mut cache = BundleManager::new(BundleCacheConfig::default());
/// let ui = cache.register_bundle_by_uri("file:///data/ui.bundle", 0)?;
/// cache.load_bundle(ui)?;
///
/// let button: Handle<AssetBytes> = cache.load_asset(ui, "button.png")?;
/// let bytes = cache.get(&button)?;
/// // ...
/// cache.reserve(button)?;
///
/// // Once per frame
/// cache.update();
/// ```
pub struct BundleManager {
    config: BundleCacheConfig,
    bundles: SparseSet<BundleRecord>,
    by_uri: HashMap<String, BundleHandle>,
    map: Arc<AssetMap>,
    /// Bundles whose index job has not been installed yet.
    indexing: Vec<BundleHandle>,
    eviction_queue: VecDeque<QueuedEviction>,
    pending_assets: Vec<PendingAsset>,
    loaders: Arc<LoaderRegistry>,
    files: FileReader,
    memory: MemoryReader,
    remote: Option<CachedReader>,
    manifest: BundleManifest,
    events: BundleEventBuffer,
    clock: Box<dyn Clock>,
    pool: TaskPool,
    owner: ThreadId,
}

impl BundleManager {
    pub fn new(config: BundleCacheConfig) -> Self {
        Self::with_clock(config, SystemClock::new())
    }

    /// Create a manager that measures idle time with `clock`.
    pub fn with_clock(config: BundleCacheConfig, clock: impl Clock + 'static) -> Self {
        let pool = match config.worker_threads {
            Some(threads) => TaskPool::new(threads),
            None => TaskPool::default_threads(),
        };
        tracing::debug!(
            "BundleManager created with {} workers, eviction after {:?}",
            pool.thread_count(),
            config.eviction_threshold
        );

        Self {
            config,
            bundles: SparseSet::new(),
            by_uri: HashMap::new(),
            map: index::new_asset_map(),
            indexing: Vec::new(),
            eviction_queue: VecDeque::new(),
            pending_assets: Vec::new(),
            loaders: Arc::new(LoaderRegistry::with_defaults()),
            files: FileReader::new(),
            memory: MemoryReader::new(),
            remote: None,
            manifest: BundleManifest::new(),
            events: BundleEventBuffer::new(),
            clock: Box::new(clock),
            pool,
            owner: thread::current().id(),
        }
    }

    pub fn config(&self) -> &BundleCacheConfig {
        &self.config
    }

    fn assert_owner(&self) {
        debug_assert_eq!(
            thread::current().id(),
            self.owner,
            "BundleManager used off its owning thread"
        );
    }

    // ==========================================================================
    // Setup
    // ==========================================================================

    /// Register a loader for typed asset access.
    pub fn register_loader<L: AssetLoader>(&mut self, loader: L) {
        Arc::make_mut(&mut self.loaders).register(loader);
    }

    pub fn has_loader_for<T: 'static>(&self, extension: &str) -> bool {
        self.loaders.has_loader_for::<T>(extension)
    }

    /// Merge content-hash metadata used to verify fetched payloads.
    pub fn register_manifest(&mut self, manifest: BundleManifest) {
        tracing::debug!("Registered manifest with {} bundles", manifest.len());
        self.manifest.merge(manifest);
    }

    /// Use `reader` for `http://` and `https://` bundles, caching verified
    /// payloads in the configured cache directory.
    pub fn set_remote_reader(&mut self, reader: impl BytesReader) {
        self.remote = Some(CachedReader::new(Arc::new(reader), self.config.cache_dir.clone()));
    }

    // ==========================================================================
    // Bundle lifecycle
    // ==========================================================================

    /// Register the bundle at `uri` without fetching it.
    ///
    /// Registering a URI that is already registered returns the existing handle.
    pub fn register_bundle_by_uri(&mut self, uri: &str, crc: u32) -> BundleResult<BundleHandle> {
        self.assert_owner();
        let uri = BundleUri::parse(uri, self.config.base_path.as_deref()).inspect_err(|e| {
            tracing::warn!("Cannot register bundle: {}", e);
        })?;
        Ok(self.register_uri(uri, crc))
    }

    /// Register a bundle file by absolute path, ignoring the configured base path.
    pub fn register_bundle_absolute_path(
        &mut self,
        path: impl AsRef<Path>,
        crc: u32,
    ) -> BundleResult<BundleHandle> {
        self.assert_owner();
        let path = path.as_ref();
        if !path.is_absolute() {
            return Err(BundleError::Other {
                message: format!("'{}' is not an absolute path", path.display()),
            });
        }
        Ok(self.register_uri(BundleUri::file(path, None), crc))
    }

    /// Register bytes as the in-memory bundle `memory://{name}`.
    pub fn add_embedded(&mut self, name: impl Into<String>, bytes: impl Into<Arc<[u8]>>) -> BundleHandle {
        self.assert_owner();
        let name = name.into();
        self.memory.insert(name.clone(), bytes);
        self.register_uri(BundleUri::memory(name), 0)
    }

    /// Register an archive obtained outside the manager. It is loaded and
    /// indexing starts immediately. The archive bytes stay registered as
    /// `memory://{name}`, so the bundle can be loaded again after an unload.
    pub fn register_bundle(&mut self, name: impl Into<String>, archive: BundleArchive) -> BundleHandle {
        self.assert_owner();
        let name = name.into();
        let handle = self.register_uri(BundleUri::memory(name.clone()), 0);
        let record = self.bundles.get(handle.slot);
        if record.loaded || record.is_loading() {
            tracing::error!("{}", BundleError::AlreadyLoaded {
                bundle: record.label()
            });
            return handle;
        }

        self.memory.insert(name, archive.raw_bytes());

        let payload = BundlePayload::new(record.label(), archive);
        self.install_payload(handle, payload);
        handle
    }

    fn register_uri(&mut self, uri: BundleUri, crc: u32) -> BundleHandle {
        let canonical = uri.canonical_key();
        if let Some(&existing) = self.by_uri.get(&canonical) {
            if let Some(record) = self.bundles.try_get_mut(existing.slot) {
                if record.crc != crc {
                    if record.loaded || record.is_loading() {
                        tracing::warn!(
                            "Bundle {} re-registered with crc {:08x} while loaded; keeping {:08x}",
                            record.uri,
                            crc,
                            record.crc
                        );
                    } else {
                        tracing::debug!("Bundle {} crc changed to {:08x}", record.uri, crc);
                        record.crc = crc;
                    }
                }
                return existing;
            }
        }

        let label = uri.to_string();
        let handle = BundleHandle::new(self.bundles.push(BundleRecord::new(uri, canonical.clone(), crc)));
        self.by_uri.insert(canonical, handle);
        tracing::debug!("Registered bundle {} as {:?}", label, handle);
        self.events.push(BundleEvent::Registered {
            bundle: handle,
            uri: label,
        });
        handle
    }

    /// Fetch and index the bundle, blocking until the fetch completes.
    ///
    /// Loading a bundle that is already loaded logs an error and returns the
    /// resident payload.
    pub fn load_bundle(&mut self, bundle: BundleHandle) -> BundleResult<BundlePayload> {
        self.assert_owner();
        profile_function!();
        let record = self.record(bundle, "load_bundle")?;
        if let (true, Some(payload)) = (record.loaded, &record.payload) {
            tracing::error!("{}", BundleError::AlreadyLoaded {
                bundle: record.label()
            });
            return Ok(payload.clone());
        }

        if !record.is_loading() {
            self.start_fetch(bundle)?;
        }
        match self.finish_fetch(bundle, true) {
            Some(result) => result,
            None => Err(BundleError::StaleHandle {
                context: "load_bundle",
            }),
        }
    }

    /// Start fetching the bundle and return immediately.
    ///
    /// The promise completes during a later [`update`](Self::update) (or any
    /// call that needs the bundle), after indexing has been scheduled.
    pub fn load_bundle_async(
        &mut self,
        bundle: BundleHandle,
    ) -> BundleResult<Promise<SharedResult<BundlePayload>>> {
        self.assert_owner();
        let record = self.record(bundle, "load_bundle_async")?;
        if let (true, Some(payload)) = (record.loaded, &record.payload) {
            tracing::error!("{}", BundleError::AlreadyLoaded {
                bundle: record.label()
            });
            return Ok(Promise::ready(Ok(payload.clone())));
        }
        if let Some(fetch) = &record.fetch {
            return Ok(fetch.promise.clone());
        }
        self.start_fetch(bundle)
    }

    fn start_fetch(&mut self, bundle: BundleHandle) -> BundleResult<Promise<SharedResult<BundlePayload>>> {
        let record = self.record(bundle, "load_bundle")?;
        let uri = record.uri.clone();
        let label = record.label();
        let name = uri.name().to_string();
        let expected = self.manifest.get(&name).copied();

        let read: BytesFuture = match &uri {
            BundleUri::File { path } => self.files.read_path(path),
            BundleUri::Memory { name } => self.memory.read_bytes(name),
            BundleUri::Remote { url } => match &self.remote {
                Some(remote) => remote.read_verified(url, expected.map(|e| e.content_hash)),
                None => {
                    let err = BundleError::UnsupportedScheme { uri: label };
                    tracing::error!("{}", err);
                    return Err(err);
                }
            },
        };
        let verify_locally = !uri.is_remote();

        let origin = label.clone();
        let task = self.pool.spawn(async move {
            let bytes = read.await?;
            if let (true, Some(entry)) = (verify_locally, expected) {
                manifest::verify(&name, &entry, &bytes)?;
            }
            BundleArchive::decode(&origin, bytes.into())
        });

        let (promise, resolver) = Promise::pending();
        let record = self.bundles.get_mut(bundle.slot);
        record.fetch = Some(PendingFetch {
            task,
            promise: promise.clone(),
            resolver,
        });
        tracing::debug!("Fetching bundle {}", label);
        Ok(promise)
    }

    /// Install the result of an in-flight fetch. Returns `None` if there is
    /// no fetch, or if it is still running and `block` is false.
    fn finish_fetch(&mut self, bundle: BundleHandle, block: bool) -> Option<BundleResult<BundlePayload>> {
        let record = self.bundles.try_get_mut(bundle.slot)?;
        let fetch = record.fetch.take()?;
        if !block && !fetch.task.is_finished() {
            record.fetch = Some(fetch);
            return None;
        }

        let label = record.label();
        let PendingFetch { task, resolver, .. } = fetch;
        match block_on(task) {
            Ok(archive) => {
                let payload = BundlePayload::new(label, archive);
                self.install_payload(bundle, payload.clone());
                resolver.resolve(Ok(payload.clone()));
                Some(Ok(payload))
            }
            Err(e) => {
                tracing::error!("Failed to load bundle {}: {}", label, e);
                self.events.push(BundleEvent::LoadFailed {
                    bundle,
                    error: e.to_string(),
                });
                resolver.resolve(Err(Arc::new(e.clone())));
                Some(Err(e))
            }
        }
    }

    fn install_payload(&mut self, bundle: BundleHandle, payload: BundlePayload) {
        let record = self.bundles.get_mut(bundle.slot);
        record.epoch = record.epoch.wrapping_add(1);
        record.loaded = true;
        record.assets = None;
        let names: Vec<String> = payload.archive().names().map(str::to_string).collect();
        let epoch = record.epoch;
        let label = record.label();
        record.payload = Some(payload);

        let job = IndexJob::spawn(
            &self.pool,
            &self.map,
            bundle,
            epoch,
            names,
            self.config.index_batch_size,
        );
        self.bundles.get_mut(bundle.slot).index_job = Some(job);
        if !self.indexing.contains(&bundle) {
            self.indexing.push(bundle);
        }

        tracing::info!("Loaded bundle {}", label);
        self.events.push(BundleEvent::Loaded { bundle });
    }

    /// Install index jobs. With `block`, waits for every job in flight;
    /// otherwise only installs the ones that already finished.
    fn finish_index_jobs(&mut self, block: bool) {
        if self.indexing.is_empty() {
            return;
        }
        profile_function!();
        let bundles = &mut self.bundles;
        self.indexing.retain(|handle| {
            let Some(record) = bundles.try_get_mut(handle.slot) else {
                return false;
            };
            match record.index_job.take() {
                Some(job) if block || job.is_finished() => {
                    let epoch = job.epoch();
                    let assets = job.complete();
                    if record.loaded && record.epoch == epoch {
                        tracing::trace!("Indexed {} assets in {}", assets.len(), record.uri);
                        record.assets = Some(assets);
                    }
                    false
                }
                Some(job) => {
                    record.index_job = Some(job);
                    true
                }
                None => false,
            }
        });
    }

    /// Wait for every index job still in flight.
    fn complete_mapping(&mut self) {
        self.finish_index_jobs(true);
    }

    /// Release the bundle's payload and asset list.
    ///
    /// Fails with [`BundleError::LeakedReference`] if any asset still has
    /// outstanding leases and the leak policy is [`LeakPolicy::Strict`]; in
    /// that case nothing changes. With `release_all_loaded_objects`, decoded
    /// objects are also dropped from payload clones held outside the cache.
    ///
    /// The slot is kept, so existing handles observe an unloaded bundle until
    /// [`unregister_bundle`](Self::unregister_bundle).
    pub fn unload_bundle(&mut self, bundle: BundleHandle, release_all_loaded_objects: bool) -> BundleResult<()> {
        self.assert_owner();
        profile_function!();
        self.record(bundle, "unload_bundle")?;
        self.finish_fetch(bundle, true);
        self.complete_mapping();

        let record = self.bundles.get_mut(bundle.slot);
        let label = record.label();
        if !record.loaded {
            tracing::warn!("Cannot unload bundle {}: not loaded", label);
            return Err(BundleError::NotLoaded { bundle: label });
        }

        let leaks: Vec<LeakReport> = record
            .assets
            .iter()
            .flatten()
            .filter(|asset| !asset.leases.is_empty())
            .map(|asset| LeakReport {
                key: asset.key.to_string(),
                outstanding: asset.leases.outstanding(),
                call_sites: asset.leases.call_sites(),
            })
            .collect();
        if !leaks.is_empty() {
            let err = BundleError::LeakedReference {
                bundle: label.clone(),
                leaks,
            };
            match self.config.leak_policy {
                LeakPolicy::Strict => {
                    tracing::error!("{}", err);
                    return Err(err);
                }
                LeakPolicy::Permissive => tracing::warn!("{}; unloading anyway", err),
            }
        }

        if let Some(payload) = record.payload.take() {
            if release_all_loaded_objects {
                payload.clear_objects();
            }
        }
        record.assets = None;
        record.loaded = false;

        index::purge_bundle(&self.map, bundle.index());
        self.eviction_queue.retain(|entry| entry.bundle != bundle);
        self.pending_assets.retain(|pending| pending.handle.bundle != bundle);

        tracing::info!("Unloaded bundle {}", label);
        self.events.push(BundleEvent::Unloaded { bundle });
        Ok(())
    }

    /// Return the bundle's slot to the arena. Every handle to it becomes stale.
    pub fn unregister_bundle(&mut self, bundle: BundleHandle) -> BundleResult<()> {
        self.assert_owner();
        let record = self.record(bundle, "unregister_bundle")?;
        if record.loaded || record.is_loading() {
            let err = BundleError::StillLoaded {
                bundle: record.label(),
            };
            tracing::error!("{}", err);
            return Err(err);
        }

        let record = self.bundles.remove(bundle.slot);
        self.by_uri.remove(&record.canonical);
        self.indexing.retain(|handle| *handle != bundle);
        tracing::debug!("Unregistered bundle {}", record.uri);
        self.events.push(BundleEvent::Unregistered { bundle });
        Ok(())
    }

    // ==========================================================================
    // Assets
    // ==========================================================================

    /// Whether the loaded bundle contains `key`.
    pub fn has_asset(&mut self, bundle: BundleHandle, key: &str) -> bool {
        self.assert_owner();
        if self.record(bundle, "has_asset").is_err() {
            return false;
        }
        self.complete_mapping();
        self.find_asset(bundle, key).is_some()
    }

    /// Every asset key in the bundle, in archive order.
    pub fn asset_names(&mut self, bundle: BundleHandle) -> BundleResult<Vec<String>> {
        self.assert_owner();
        self.loaded_record(bundle, "asset_names")?;
        self.complete_mapping();
        let record = self.bundles.get(bundle.slot);
        Ok(record
            .assets
            .iter()
            .flatten()
            .map(|asset| asset.key.to_string())
            .collect())
    }

    /// Load `key` as a `T`, blocking until it is decoded, and take a lease on it.
    ///
    /// The returned handle must be released once with [`reserve`](Self::reserve).
    #[track_caller]
    pub fn load_asset<T: Asset>(&mut self, bundle: BundleHandle, key: &str) -> BundleResult<Handle<T>> {
        let site = Location::caller();
        self.assert_owner();
        profile_function!();
        let (asset_index, hash) = self.resolve_asset(bundle, key, "load_asset")?;
        let promise = self.request_object(bundle, asset_index, TypeId::of::<T>(), T::type_name())?;

        match block_on(promise) {
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                self.object_failed(bundle, hash, TypeId::of::<T>(), key, &e);
                return Err((*e).clone());
            }
            None => {
                return Err(BundleError::Other {
                    message: format!("load of '{}' was disposed", key),
                });
            }
        }

        self.mark_loaded(bundle, asset_index);
        let handle = self.acquire_lease(bundle, asset_index, TypeId::of::<T>(), site);
        Ok(Handle::new(handle))
    }

    /// Like [`load_asset`](Self::load_asset), but only logs failures.
    #[track_caller]
    pub fn try_load_asset<T: Asset>(&mut self, bundle: BundleHandle, key: &str) -> Option<Handle<T>> {
        self.load_asset::<T>(bundle, key).ok()
    }

    /// Take a lease on `key` and start decoding it as a `T` without blocking.
    ///
    /// Concurrent requests for the same key and type share one decode.
    #[track_caller]
    pub fn load_asset_async<T: Asset>(
        &mut self,
        bundle: BundleHandle,
        key: &str,
    ) -> BundleResult<AssetRequest<T>> {
        let site = Location::caller();
        self.assert_owner();
        profile_function!();
        let (asset_index, _) = self.resolve_asset(bundle, key, "load_asset_async")?;
        let promise = self.request_object(bundle, asset_index, TypeId::of::<T>(), T::type_name())?;
        let handle = self.acquire_lease(bundle, asset_index, TypeId::of::<T>(), site);

        if let Some(Ok(_)) = promise.try_get() {
            self.mark_loaded(bundle, asset_index);
        } else {
            self.pending_assets.push(PendingAsset {
                handle,
                promise: promise.clone(),
            });
        }

        Ok(AssetRequest {
            handle: Handle::new(handle),
            promise,
        })
    }

    /// The decoded asset behind `handle`.
    pub fn get<T: Asset>(&mut self, handle: &Handle<T>) -> BundleResult<Arc<T>> {
        let object = self.get_untyped(&handle.untyped())?;
        object.downcast::<T>().map_err(|object| BundleError::TypeMismatch {
            expected: T::type_name(),
            actual: object_type(&object),
        })
    }

    pub fn get_untyped(&mut self, handle: &AssetHandle) -> BundleResult<AssetObject> {
        self.assert_owner();
        self.complete_mapping();
        let (record, asset) = self.leased_asset(handle, "get")?;
        let payload = record.payload.as_ref().ok_or_else(|| BundleError::NotLoaded {
            bundle: record.label(),
        })?;
        match payload.object(handle.key, handle.type_id) {
            Some(Ok(object)) => Ok(object),
            Some(Err(e)) => Err((*e).clone()),
            None => Err(BundleError::NotReady {
                key: asset.key.to_string(),
            }),
        }
    }

    /// Whether `handle` still refers to an asset of the bundle's current load.
    pub fn is_asset_valid(&mut self, handle: &AssetHandle) -> bool {
        self.complete_mapping();
        self.bundles
            .try_get(handle.bundle.slot)
            .is_some_and(|record| asset_of(record, handle).is_some())
    }

    /// Release the lease held by `asset`.
    pub fn reserve(&mut self, asset: impl Into<AssetHandle>) -> BundleResult<()> {
        self.release_lease(asset.into())
    }

    /// Release the lease held by `asset`, checking that it was issued by `bundle`.
    pub fn reserve_in(&mut self, bundle: BundleHandle, asset: impl Into<AssetHandle>) -> BundleResult<()> {
        let asset = asset.into();
        if asset.bundle != bundle {
            let err = BundleError::OwnershipMismatch {
                expected: self.bundle_label(bundle),
                actual: self.bundle_label(asset.bundle),
            };
            tracing::error!("{}", err);
            return Err(err);
        }
        self.release_lease(asset)
    }

    fn release_lease(&mut self, asset: AssetHandle) -> BundleResult<()> {
        self.assert_owner();
        self.complete_mapping();
        let now = self.clock.now();

        let Some(record) = self.bundles.try_get_mut(asset.bundle.slot) else {
            tracing::warn!("Stale bundle handle {:?} used for reserve", asset.bundle);
            return Err(BundleError::StaleHandle { context: "reserve" });
        };
        if !record.loaded {
            tracing::warn!("Cannot reserve {:?}: bundle {} is not loaded", asset.key, record.uri);
            return Err(BundleError::NotLoaded {
                bundle: record.label(),
            });
        }
        if record.epoch != asset.epoch {
            tracing::warn!("Lease on {:?} predates the current load of {}", asset.key, record.uri);
            return Err(BundleError::StaleHandle { context: "reserve" });
        }

        let Some(entry) = record
            .assets
            .as_mut()
            .and_then(|assets| assets.get_mut(asset.asset_index as usize))
            .filter(|entry| entry.hash == asset.key)
        else {
            return Err(BundleError::StaleHandle { context: "reserve" });
        };

        let released = if entry.leases.is_empty() {
            None
        } else {
            entry.leases.release(asset.lease)
        };
        match released {
            None => {
                let err = BundleError::LeaseNotOutstanding {
                    key: entry.key.to_string(),
                };
                tracing::error!("{}", err);
                Err(err)
            }
            Some(0) => {
                entry.last_used_at = now;
                if entry.loaded && !entry.eviction_queued {
                    entry.eviction_queued = true;
                    self.eviction_queue.push_back(QueuedEviction {
                        bundle: asset.bundle,
                        asset_index: asset.asset_index,
                    });
                    tracing::trace!("Queued '{}' for idle eviction", entry.key);
                }
                Ok(())
            }
            Some(_) => Ok(()),
        }
    }

    /// Never let the idle sweep evict `key`.
    pub fn pin_asset(&mut self, bundle: BundleHandle, key: &str) -> BundleResult<()> {
        let (asset_index, _) = self.resolve_asset(bundle, key, "pin_asset")?;
        self.asset_mut(bundle, asset_index).pinned = true;
        Ok(())
    }

    /// Make `key` evictable again. Its idle time still counts from its last use.
    pub fn unpin_asset(&mut self, bundle: BundleHandle, key: &str) -> BundleResult<()> {
        let (asset_index, _) = self.resolve_asset(bundle, key, "unpin_asset")?;
        let asset = self.asset_mut(bundle, asset_index);
        asset.pinned = false;
        if asset.loaded && asset.leases.is_empty() {
            self.enqueue_eviction(bundle, asset_index);
        }
        Ok(())
    }

    /// A snapshot of `key`'s bookkeeping.
    pub fn asset_status(&mut self, bundle: BundleHandle, key: &str) -> BundleResult<AssetStatus> {
        let (asset_index, _) = self.resolve_asset(bundle, key, "asset_status")?;
        let now = self.clock.now();
        let asset = self.asset_mut(bundle, asset_index);
        Ok(AssetStatus {
            key: asset.key.to_string(),
            loaded: asset.loaded,
            pinned: asset.pinned,
            outstanding: asset.leases.outstanding(),
            idle_for: now.saturating_sub(asset.last_used_at),
            eviction_queued: asset.eviction_queued,
        })
    }

    /// Look `key` up in the global map and confirm the hit is really `key`,
    /// not another key with the same hash.
    fn find_asset(&self, bundle: BundleHandle, key: &str) -> Option<(u32, KeyHash)> {
        let normalized = normalize_key(key);
        let hash = KeyHash::of_normalized(&normalized);
        let mapped = index::lookup(&self.map, hash, bundle.index())?;
        let asset = self
            .bundles
            .try_get(bundle.slot)?
            .assets
            .as_ref()?
            .get(mapped.asset_index as usize)?;
        if normalize_key(&asset.key) != normalized {
            tracing::debug!(
                "Key '{}' collides with '{}' in {:?}",
                key,
                asset.key,
                bundle
            );
            return None;
        }
        Some((mapped.asset_index, hash))
    }

    fn resolve_asset(
        &mut self,
        bundle: BundleHandle,
        key: &str,
        context: &'static str,
    ) -> BundleResult<(u32, KeyHash)> {
        self.loaded_record(bundle, context)?;
        self.complete_mapping();
        match self.find_asset(bundle, key) {
            Some(found) => Ok(found),
            None => {
                let err = BundleError::UnknownKey {
                    bundle: self.bundle_label(bundle),
                    key: key.to_string(),
                };
                tracing::warn!("{}", err);
                Err(err)
            }
        }
    }

    fn request_object(
        &mut self,
        bundle: BundleHandle,
        asset_index: u32,
        type_id: TypeId,
        type_name: &'static str,
    ) -> BundleResult<Promise<SharedResult<AssetObject>>> {
        let record = self.bundles.get(bundle.slot);
        let label = record.label();
        let payload = record
            .payload
            .clone()
            .ok_or_else(|| BundleError::NotLoaded { bundle: label.clone() })?;
        let asset = self.asset_mut(bundle, asset_index);
        let key = asset.key.to_string();
        let (entry, hash) = (asset.entry, asset.hash);

        let loaders = self.loaders.clone();
        Ok(payload.fetch_object(&self.pool, entry, hash, type_id, move |bytes| {
            loader::decode_entry(&loaders, &label, &key, bytes, type_id, type_name)
        }))
    }

    fn object_failed(
        &mut self,
        bundle: BundleHandle,
        hash: KeyHash,
        type_id: TypeId,
        key: &str,
        err: &BundleError,
    ) {
        tracing::error!("Failed to load asset '{}': {}", key, err);
        if let Some(payload) = self
            .bundles
            .try_get(bundle.slot)
            .and_then(|record| record.payload.as_ref())
        {
            payload.forget(hash, type_id);
        }
    }

    fn mark_loaded(&mut self, bundle: BundleHandle, asset_index: u32) {
        let now = self.clock.now();
        let asset = self.asset_mut(bundle, asset_index);
        asset.last_used_at = now;
        if asset.loaded {
            return;
        }
        asset.loaded = true;
        let key = asset.key.to_string();
        let unleased = asset.leases.is_empty();
        tracing::debug!("Asset '{}' resident", key);
        self.events.push(BundleEvent::AssetLoaded { bundle, key });
        if unleased {
            self.enqueue_eviction(bundle, asset_index);
        }
    }

    fn acquire_lease(
        &mut self,
        bundle: BundleHandle,
        asset_index: u32,
        type_id: TypeId,
        site: &'static Location<'static>,
    ) -> AssetHandle {
        let now = self.clock.now();
        let epoch = self.bundles.get(bundle.slot).epoch;
        let asset = self.asset_mut(bundle, asset_index);
        let lease = asset.leases.acquire(site);
        asset.last_used_at = now;
        AssetHandle {
            bundle,
            lease,
            key: asset.hash,
            asset_index,
            epoch,
            type_id,
        }
    }

    fn enqueue_eviction(&mut self, bundle: BundleHandle, asset_index: u32) {
        let asset = self.asset_mut(bundle, asset_index);
        if asset.eviction_queued {
            return;
        }
        asset.eviction_queued = true;
        self.eviction_queue.push_back(QueuedEviction { bundle, asset_index });
    }

    /// The record for an asset already resolved through the map.
    ///
    /// # Panics
    ///
    /// Panics if the bundle or asset no longer exists, which means the
    /// caller skipped validation.
    fn asset_mut(&mut self, bundle: BundleHandle, asset_index: u32) -> &mut AssetRecord {
        self.bundles
            .get_mut(bundle.slot)
            .assets
            .as_mut()
            .and_then(|assets| assets.get_mut(asset_index as usize))
            .unwrap_or_else(|| panic!("asset {} of {:?} resolved but missing", asset_index, bundle))
    }

    fn leased_asset(
        &self,
        handle: &AssetHandle,
        context: &'static str,
    ) -> BundleResult<(&BundleRecord, &AssetRecord)> {
        let record = self.record(handle.bundle, context)?;
        if !record.loaded {
            return Err(BundleError::NotLoaded {
                bundle: record.label(),
            });
        }
        match asset_of(record, handle) {
            Some(asset) => Ok((record, asset)),
            None => {
                tracing::warn!("Stale asset handle {:?} used for {}", handle.key, context);
                Err(BundleError::StaleHandle { context })
            }
        }
    }

    // ==========================================================================
    // Tick
    // ==========================================================================

    /// Drain background completions and run the idle sweep. Call once per frame.
    pub fn update(&mut self) {
        self.assert_owner();
        profile_function!();

        let finished: Vec<BundleHandle> = self
            .bundles
            .iter_slots()
            .filter(|(_, record)| record.fetch.as_ref().is_some_and(|f| f.task.is_finished()))
            .map(|(slot, _)| BundleHandle::new(slot))
            .collect();
        for bundle in finished {
            self.finish_fetch(bundle, false);
        }

        self.finish_index_jobs(false);
        self.poll_pending_assets();
        self.sweep_idle();
    }

    fn poll_pending_assets(&mut self) {
        if self.pending_assets.is_empty() {
            return;
        }
        for pending in std::mem::take(&mut self.pending_assets) {
            let handle = pending.handle;
            match pending.promise.try_get() {
                None if pending.promise.is_disposed() => {}
                None => self.pending_assets.push(pending),
                Some(result) => {
                    let live = self
                        .bundles
                        .try_get(handle.bundle.slot)
                        .is_some_and(|record| asset_of(record, &handle).is_some());
                    if !live {
                        continue;
                    }
                    match result {
                        Ok(_) => self.mark_loaded(handle.bundle, handle.asset_index),
                        Err(e) => {
                            let key = self.asset_mut(handle.bundle, handle.asset_index).key.to_string();
                            self.object_failed(handle.bundle, handle.key, handle.type_id, &key, &e);
                        }
                    }
                }
            }
        }
    }

    /// Evict every queued asset that is unleased, unpinned and has been idle
    /// for at least the eviction threshold. Returns how many were evicted.
    ///
    /// Queued assets that became pinned or leased again leave the queue;
    /// assets that are not idle long enough stay.
    pub fn sweep_idle(&mut self) -> usize {
        profile_function!();
        let now = self.clock.now();
        let threshold = self.config.eviction_threshold;
        let bundles = &mut self.bundles;
        let events = &mut self.events;
        let mut evicted = 0;

        self.eviction_queue.retain(|entry| {
            let Some(record) = bundles.try_get_mut(entry.bundle.slot) else {
                return false;
            };
            if !record.loaded {
                return false;
            }
            let Some(asset) = record
                .assets
                .as_mut()
                .and_then(|assets| assets.get_mut(entry.asset_index as usize))
            else {
                return false;
            };

            if asset.pinned || !asset.leases.is_empty() || !asset.loaded {
                asset.eviction_queued = false;
                return false;
            }
            if now.saturating_sub(asset.last_used_at) < threshold {
                return true;
            }

            if let Some(payload) = &record.payload {
                payload.evict(asset.hash);
            }
            asset.loaded = false;
            asset.eviction_queued = false;
            evicted += 1;
            tracing::debug!("Evicted idle asset '{}' from {}", asset.key, record.uri);
            events.push(BundleEvent::AssetEvicted {
                bundle: entry.bundle,
                key: asset.key.to_string(),
            });
            false
        });

        evicted
    }

    // ==========================================================================
    // Introspection
    // ==========================================================================

    /// Whether `bundle` still names a registered bundle.
    pub fn is_valid(&self, bundle: BundleHandle) -> bool {
        self.bundles.contains(bundle.slot)
    }

    pub fn is_loaded(&self, bundle: BundleHandle) -> bool {
        self.bundles
            .try_get(bundle.slot)
            .is_some_and(|record| record.loaded)
    }

    /// `None` if the handle is stale.
    pub fn bundle_state(&self, bundle: BundleHandle) -> Option<BundleState> {
        self.bundles.try_get(bundle.slot).map(|record| {
            if record.loaded {
                BundleState::Loaded
            } else if record.is_loading() {
                BundleState::Loading
            } else {
                BundleState::Unloaded
            }
        })
    }

    pub fn bundle_uri(&self, bundle: BundleHandle) -> Option<&BundleUri> {
        self.bundles.try_get(bundle.slot).map(|record| &record.uri)
    }

    pub fn bundle_crc(&self, bundle: BundleHandle) -> Option<u32> {
        self.bundles.try_get(bundle.slot).map(|record| record.crc)
    }

    /// The resident payload of a loaded bundle.
    pub fn payload(&self, bundle: BundleHandle) -> Option<&BundlePayload> {
        self.bundles
            .try_get(bundle.slot)
            .and_then(|record| record.payload.as_ref())
    }

    pub fn stats(&self) -> CacheStats {
        let mut stats = CacheStats {
            registered_bundles: self.bundles.len(),
            queued_evictions: self.eviction_queue.len(),
            pending_index_jobs: self.indexing.len(),
            pending_asset_loads: self.pending_assets.len(),
            ..CacheStats::default()
        };
        for record in self.bundles.iter() {
            stats.loaded_bundles += record.loaded as usize;
            stats.loading_bundles += record.is_loading() as usize;
            for asset in record.assets.iter().flatten() {
                stats.indexed_assets += 1;
                stats.resident_assets += asset.loaded as usize;
                stats.outstanding_leases += asset.leases.outstanding() as u64;
            }
        }
        stats
    }

    /// Drain all pending events.
    pub fn drain_events(&mut self) -> impl Iterator<Item = BundleEvent> + '_ {
        self.events.drain()
    }

    pub fn iter_events(&self) -> impl Iterator<Item = &BundleEvent> {
        self.events.iter()
    }

    fn record(&self, bundle: BundleHandle, context: &'static str) -> BundleResult<&BundleRecord> {
        self.bundles.try_get(bundle.slot).ok_or_else(|| {
            tracing::warn!("Stale bundle handle {:?} used for {}", bundle, context);
            BundleError::StaleHandle { context }
        })
    }

    fn loaded_record(&self, bundle: BundleHandle, context: &'static str) -> BundleResult<&BundleRecord> {
        let record = self.record(bundle, context)?;
        if !record.loaded {
            tracing::warn!("Bundle {} is not loaded ({})", record.uri, context);
            return Err(BundleError::NotLoaded {
                bundle: record.label(),
            });
        }
        Ok(record)
    }

    fn bundle_label(&self, bundle: BundleHandle) -> String {
        self.bundles
            .try_get(bundle.slot)
            .map(BundleRecord::label)
            .unwrap_or_else(|| format!("{:?}", bundle))
    }
}

impl Default for BundleManager {
    fn default() -> Self {
        Self::new(BundleCacheConfig::default())
    }
}

/// The asset `handle` leases, if it belongs to `record`'s current load.
fn asset_of<'a>(record: &'a BundleRecord, handle: &AssetHandle) -> Option<&'a AssetRecord> {
    if !record.loaded || record.epoch != handle.epoch {
        return None;
    }
    record
        .assets
        .as_ref()?
        .get(handle.asset_index as usize)
        .filter(|asset| asset.hash == handle.key)
}
