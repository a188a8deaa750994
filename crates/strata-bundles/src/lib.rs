//! Strata Bundles - a reference-counted cache of resource bundles
//!
//! A bundle is a packed archive of named assets. The cache registers
//! bundles by URI, fetches and indexes them on a task pool, and hands out
//! leased, generation-checked handles to the assets inside:
//! - Bundle handles go stale when their slot is unregistered and reused
//! - Every asset load takes a lease that must be released exactly once
//! - Unloading a bundle with outstanding leases is refused and the leaks
//!   are reported with the call sites that took them
//! - Assets nobody leases are evicted after an idle threshold
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use strata_bundles::{AssetBytes, BundleCacheConfig, BundleManager};
//!
//! let mut cache = BundleManager::new(BundleCacheConfig::default().with_base_path("data"));
//! let ui = cache.register_bundle_by_uri("ui.bundle", 0).unwrap();
//! cache.load_bundle(ui).unwrap();
//!
//! let icon = cache.load_asset::<AssetBytes>(ui, "icons/close.png").unwrap();
//! println!("{} bytes", cache.get(&icon).unwrap().len());
//! cache.reserve(icon).unwrap();
//!
//! // Once per frame
//! cache.update();
//! ```
//!
//! ## URIs
//!
//! - `file:///abs/path.bundle` or a bare path, resolved against the base path
//! - `memory://name` for bytes added with [`BundleManager::add_embedded`]
//! - `http://` and `https://`, fetched through the reader given to
//!   [`BundleManager::set_remote_reader`] and cached by content hash

pub mod archive;
pub mod config;
pub mod error;
pub mod event;
pub mod handle;
pub mod index;
pub mod io;
pub mod key;
pub mod loader;
pub mod manager;
pub mod manifest;
pub mod payload;
pub mod promise;
pub mod record;
pub mod source;
pub mod state;

pub use archive::{ArchiveEntry, AssetBytes, BundleArchive, BundleArchiveBuilder};
pub use config::{BundleCacheConfig, LeakPolicy};
pub use error::{BundleError, BundleResult, LeakReport, SharedResult};
pub use event::{BundleEvent, BundleEventBuffer};
pub use handle::{AssetHandle, BundleHandle, Handle};
pub use io::{BytesFuture, BytesReader, CachedReader, FileReader, MemoryReader};
pub use key::{KeyHash, MAX_KEY_LEN, normalize_key};
pub use loader::{AssetLoader, BytesLoader, ErasedAssetLoader, LoadContext, LoaderRegistry, TextLoader};
pub use manager::{AssetRequest, BundleManager};
pub use manifest::{BundleManifest, ContentHash, ManifestEntry};
pub use payload::{AssetObject, BundlePayload};
pub use promise::{Promise, Resolver};
pub use record::LeaseId;
pub use source::BundleUri;
pub use state::{AssetStatus, BundleState, CacheStats};

/// A type that can be decoded out of a bundle.
pub trait Asset: Send + Sync + 'static {
    /// Human-readable name used in errors and logs.
    fn type_name() -> &'static str {
        std::any::type_name::<Self>()
    }
}

impl Asset for AssetBytes {
    fn type_name() -> &'static str {
        "AssetBytes"
    }
}

impl Asset for String {
    fn type_name() -> &'static str {
        "String"
    }
}

impl Asset for Vec<u8> {
    fn type_name() -> &'static str {
        "Vec<u8>"
    }
}
