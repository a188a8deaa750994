//! Observable state of bundles and assets.

use std::time::Duration;

/// Lifecycle state of a registered bundle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BundleState {
    /// Registered, payload not fetched.
    Unloaded,
    /// A fetch is in flight.
    Loading,
    /// Payload resident; assets may still be indexing.
    Loaded,
}

impl BundleState {
    pub fn is_loaded(&self) -> bool {
        matches!(self, BundleState::Loaded)
    }
}

/// A snapshot of one asset's bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetStatus {
    pub key: String,
    /// Whether a decoded object is resident.
    pub loaded: bool,
    pub pinned: bool,
    /// Leases not yet reserved.
    pub outstanding: u32,
    /// Time since the asset was last leased or fully released.
    pub idle_for: Duration,
    pub eviction_queued: bool,
}

/// Cache-wide counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub registered_bundles: usize,
    pub loaded_bundles: usize,
    pub loading_bundles: usize,
    pub indexed_assets: usize,
    pub resident_assets: usize,
    pub outstanding_leases: u64,
    pub queued_evictions: usize,
    pub pending_index_jobs: usize,
    pub pending_asset_loads: usize,
}
