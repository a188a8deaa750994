//! Background indexing of freshly loaded bundles.
//!
//! An index job turns a bundle's entry names into [`AssetRecord`]s and
//! publishes `key -> (bundle, asset)` into the shared [`AssetMap`]. Names are
//! split into batches that run in parallel on the task pool. Local asset
//! indices are fixed before any batch starts, so the result does not depend
//! on scheduling.

use std::sync::Arc;

use dashmap::DashMap;
use strata_core::alloc::RandomState;
use strata_core::profiling::profile_function;
use strata_core::tasks::{Task, TaskPool, block_on};

use crate::handle::BundleHandle;
use crate::key::{KeyHash, MAX_KEY_LEN, Mapped};
use crate::record::AssetRecord;

/// Every indexed key, mapped to each bundle that contains it.
pub type AssetMap = DashMap<KeyHash, Vec<Mapped>, RandomState>;

pub fn new_asset_map() -> Arc<AssetMap> {
    Arc::new(DashMap::with_hasher(RandomState::new()))
}

/// Resolve `key` within the bundle at `bundle_index`.
pub fn lookup(map: &AssetMap, key: KeyHash, bundle_index: u32) -> Option<Mapped> {
    map.get(&key)?
        .iter()
        .find(|mapped| mapped.bundle_index == bundle_index)
        .copied()
}

/// Remove every mapping that points into `bundle_index`.
pub fn purge_bundle(map: &AssetMap, bundle_index: u32) {
    map.retain(|_, locations| {
        locations.retain(|mapped| mapped.bundle_index != bundle_index);
        !locations.is_empty()
    });
}

/// An in-flight index job for one bundle.
pub struct IndexJob {
    bundle: BundleHandle,
    epoch: u32,
    batches: Vec<Task<Vec<AssetRecord>>>,
}

impl IndexJob {
    /// Purge `bundle`'s old mappings and start indexing `names`.
    ///
    /// Each name's position in `names` is its archive entry index. Names
    /// longer than [`MAX_KEY_LEN`] are skipped.
    pub fn spawn(
        pool: &TaskPool,
        map: &Arc<AssetMap>,
        bundle: BundleHandle,
        epoch: u32,
        names: Vec<String>,
        batch_size: usize,
    ) -> Self {
        profile_function!();
        purge_bundle(map, bundle.index());

        let mut indexed = Vec::with_capacity(names.len());
        for (entry, name) in names.into_iter().enumerate() {
            if name.len() > MAX_KEY_LEN {
                tracing::warn!(
                    "Skipping asset key longer than {} bytes: {}...",
                    MAX_KEY_LEN,
                    name.chars().take(32).collect::<String>()
                );
                continue;
            }
            indexed.push((entry as u32, name));
        }

        let batch_size = batch_size.max(1);
        let mut batches = Vec::with_capacity(indexed.len().div_ceil(batch_size));
        let mut local = 0u32;
        let mut iter = indexed.into_iter().peekable();
        while iter.peek().is_some() {
            let batch: Vec<(u32, u32, String)> = iter
                .by_ref()
                .take(batch_size)
                .map(|(entry, name)| {
                    let item = (local, entry, name);
                    local += 1;
                    item
                })
                .collect();
            let map = map.clone();
            let bundle_index = bundle.index();
            batches.push(pool.spawn(async move { index_batch(&map, bundle_index, batch) }));
        }

        tracing::trace!(
            "Indexing bundle {:?} in {} batches",
            bundle,
            batches.len()
        );

        Self {
            bundle,
            epoch,
            batches,
        }
    }

    pub fn bundle(&self) -> BundleHandle {
        self.bundle
    }

    pub fn epoch(&self) -> u32 {
        self.epoch
    }

    pub fn is_finished(&self) -> bool {
        self.batches.iter().all(Task::is_finished)
    }

    /// Wait for every batch and return the records in local-index order.
    pub fn complete(self) -> Vec<AssetRecord> {
        profile_function!();
        let mut records = Vec::new();
        for batch in self.batches {
            records.extend(block_on(batch));
        }
        records
    }
}

fn index_batch(map: &AssetMap, bundle_index: u32, batch: Vec<(u32, u32, String)>) -> Vec<AssetRecord> {
    profile_function!();
    batch
        .into_iter()
        .map(|(local, entry, name)| {
            let hash = KeyHash::new(&name);
            map.entry(hash)
                .or_default()
                .push(Mapped::new(bundle_index, local));
            AssetRecord::new(name, hash, entry)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_core::alloc::sparse_set::IndexSlot;

    fn names(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("asset_{}.bin", i)).collect()
    }

    #[test]
    fn test_index_assigns_local_indices_in_order() {
        let pool = TaskPool::new(4);
        let map = new_asset_map();
        let bundle = BundleHandle::new(IndexSlot::new(0, 2));

        let records = IndexJob::spawn(&pool, &map, bundle, 1, names(100), 7).complete();
        assert_eq!(records.len(), 100);
        for (i, record) in records.iter().enumerate() {
            assert_eq!(&*record.key, format!("asset_{}.bin", i));
            let mapped = lookup(&map, KeyHash::new(&record.key), 2).unwrap();
            assert_eq!(mapped.asset_index, i as u32);
        }
    }

    #[test]
    fn test_reindex_does_not_duplicate() {
        let pool = TaskPool::new(2);
        let map = new_asset_map();
        let bundle = BundleHandle::new(IndexSlot::new(0, 0));

        IndexJob::spawn(&pool, &map, bundle, 1, names(10), 3).complete();
        IndexJob::spawn(&pool, &map, bundle, 2, names(10), 3).complete();

        let entry = map.get(&KeyHash::new("asset_3.bin")).unwrap();
        assert_eq!(entry.len(), 1);
    }

    #[test]
    fn test_same_key_in_two_bundles() {
        let pool = TaskPool::new(2);
        let map = new_asset_map();
        let a = BundleHandle::new(IndexSlot::new(0, 0));
        let b = BundleHandle::new(IndexSlot::new(0, 1));

        IndexJob::spawn(&pool, &map, a, 1, vec!["shared".into()], 8).complete();
        IndexJob::spawn(&pool, &map, b, 1, vec!["x".into(), "shared".into()], 8).complete();

        assert_eq!(lookup(&map, KeyHash::new("SHARED"), 0).unwrap().asset_index, 0);
        assert_eq!(lookup(&map, KeyHash::new("shared"), 1).unwrap().asset_index, 1);

        purge_bundle(&map, 1);
        assert!(lookup(&map, KeyHash::new("shared"), 1).is_none());
        assert!(lookup(&map, KeyHash::new("shared"), 0).is_some());
    }

    #[test]
    fn test_empty_bundle_finishes_immediately() {
        let pool = TaskPool::new(1);
        let map = new_asset_map();
        let job = IndexJob::spawn(&pool, &map, BundleHandle::new(IndexSlot::new(0, 0)), 1, Vec::new(), 64);
        assert!(job.is_finished());
        assert!(job.complete().is_empty());
    }

    #[test]
    fn test_overlong_keys_are_skipped() {
        let pool = TaskPool::new(1);
        let map = new_asset_map();
        let long = "k".repeat(MAX_KEY_LEN + 1);
        let records = IndexJob::spawn(
            &pool,
            &map,
            BundleHandle::new(IndexSlot::new(0, 0)),
            1,
            vec![long, "ok".into()],
            64,
        )
        .complete();

        assert_eq!(records.len(), 1);
        assert_eq!(records[0].entry, 1);
        assert_eq!(lookup(&map, KeyHash::new("ok"), 0).unwrap().asset_index, 0);
    }
}
