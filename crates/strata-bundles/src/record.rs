//! Arena-resident bookkeeping for bundles and their assets.
//!
//! Records are owned by the manager's arena and mutated only on the owning
//! thread. Handles never point at a record directly; they go through the
//! arena's generation check first.

use std::fmt;
use std::num::NonZeroU64;
use std::panic::Location;
use std::time::Duration;

use crate::archive::BundleArchive;
use crate::error::{BundleResult, SharedResult};
use crate::index::IndexJob;
use crate::key::KeyHash;
use crate::payload::BundlePayload;
use crate::promise::{Promise, Resolver};
use crate::source::BundleUri;

#[cfg(debug_assertions)]
use strata_core::alloc::HashMap;

/// A random, non-zero token identifying one outstanding lease.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct LeaseId(NonZeroU64);

impl LeaseId {
    pub fn random() -> Self {
        Self(NonZeroU64::new(rand::random::<u64>()).unwrap_or(NonZeroU64::MIN))
    }

    pub fn raw(self) -> u64 {
        self.0.get()
    }
}

impl fmt::Debug for LeaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LeaseId({:016x})", self.0.get())
    }
}

/// Reference count over the leases issued for one asset.
///
/// Debug builds also remember which call site acquired each lease so that a
/// leak can be attributed.
#[derive(Debug, Default)]
pub struct LeaseSet {
    count: u32,
    #[cfg(debug_assertions)]
    sites: HashMap<LeaseId, &'static Location<'static>>,
}

impl LeaseSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn acquire(&mut self, site: &'static Location<'static>) -> LeaseId {
        #[cfg(debug_assertions)]
        let id = {
            let mut id = LeaseId::random();
            while self.sites.contains_key(&id) {
                id = LeaseId::random();
            }
            self.sites.insert(id, site);
            id
        };
        #[cfg(not(debug_assertions))]
        let id = {
            let _ = site;
            LeaseId::random()
        };

        self.count += 1;
        id
    }

    /// Release `id`. Returns the remaining count, or `None` if `id` is not
    /// outstanding. Release builds only track the count, so there any id is
    /// accepted while at least one lease is held.
    pub fn release(&mut self, id: LeaseId) -> Option<u32> {
        #[cfg(debug_assertions)]
        if self.sites.remove(&id).is_none() {
            return None;
        }
        #[cfg(not(debug_assertions))]
        let _ = id;

        if self.count == 0 {
            return None;
        }
        self.count -= 1;
        Some(self.count)
    }

    pub fn outstanding(&self) -> u32 {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// `file:line:column` of every outstanding lease. Empty in release builds.
    pub fn call_sites(&self) -> Vec<String> {
        #[cfg(debug_assertions)]
        {
            let mut sites: Vec<String> = self.sites.values().map(|l| l.to_string()).collect();
            sites.sort();
            sites
        }
        #[cfg(not(debug_assertions))]
        {
            Vec::new()
        }
    }

    pub fn clear(&mut self) {
        self.count = 0;
        #[cfg(debug_assertions)]
        self.sites.clear();
    }
}

/// One asset within a bundle.
#[derive(Debug)]
pub struct AssetRecord {
    pub key: Box<str>,
    pub hash: KeyHash,
    /// Index of the entry in the bundle archive.
    pub entry: u32,
    pub loaded: bool,
    pub pinned: bool,
    pub leases: LeaseSet,
    /// Clock time of the last lease acquire or of the release that emptied
    /// the lease set.
    pub last_used_at: Duration,
    pub eviction_queued: bool,
}

impl AssetRecord {
    pub fn new(key: impl Into<Box<str>>, hash: KeyHash, entry: u32) -> Self {
        Self {
            key: key.into(),
            hash,
            entry,
            loaded: false,
            pinned: false,
            leases: LeaseSet::new(),
            last_used_at: Duration::ZERO,
            eviction_queued: false,
        }
    }
}

/// An in-flight bundle fetch.
pub(crate) struct PendingFetch {
    pub task: strata_core::tasks::Task<BundleResult<BundleArchive>>,
    pub promise: Promise<SharedResult<BundlePayload>>,
    pub resolver: Resolver<SharedResult<BundlePayload>>,
}

/// One registered bundle.
pub(crate) struct BundleRecord {
    pub uri: BundleUri,
    pub canonical: String,
    pub crc: u32,
    pub loaded: bool,
    /// Incremented on every load so that leases from a previous load are
    /// recognisable.
    pub epoch: u32,
    pub payload: Option<BundlePayload>,
    /// `None` until the first index job of the current load is installed.
    pub assets: Option<Vec<AssetRecord>>,
    pub fetch: Option<PendingFetch>,
    pub index_job: Option<IndexJob>,
}

impl BundleRecord {
    pub fn new(uri: BundleUri, canonical: String, crc: u32) -> Self {
        Self {
            uri,
            canonical,
            crc,
            loaded: false,
            epoch: 0,
            payload: None,
            assets: None,
            fetch: None,
            index_job: None,
        }
    }

    pub fn label(&self) -> String {
        self.uri.to_string()
    }

    pub fn is_loading(&self) -> bool {
        self.fetch.is_some()
    }
}
