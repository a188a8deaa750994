//! Integration tests for the bundle cache.
//!
//! These tests use tempfile to create isolated bundle directories and a
//! manual clock to drive idle eviction.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use strata_bundles::*;
use strata_core::time::ManualClock;

// ============================================================================
// Test Asset Types
// ============================================================================

/// A simple test config asset.
#[derive(Debug, Clone, PartialEq)]
struct TestConfig {
    name: String,
    value: i32,
}

impl Asset for TestConfig {
    fn type_name() -> &'static str {
        "TestConfig"
    }
}

/// Loader for test config files (simple "name:value" format).
struct TestConfigLoader;

impl AssetLoader for TestConfigLoader {
    type Asset = TestConfig;

    fn extensions(&self) -> &[&str] {
        &["cfg", "config"]
    }

    fn load(&self, ctx: LoadContext<'_>) -> Result<Self::Asset, BundleError> {
        let text = std::str::from_utf8(ctx.bytes).map_err(|e| ctx.error(format!("Invalid UTF-8: {}", e)))?;

        let mut name = String::new();
        let mut value = 0;

        for line in text.lines() {
            if let Some((key, val)) = line.trim().split_once(':') {
                match key.trim() {
                    "name" => name = val.trim().to_string(),
                    "value" => value = val.trim().parse().unwrap_or(0),
                    _ => {}
                }
            }
        }

        Ok(TestConfig { name, value })
    }
}

// ============================================================================
// Helpers
// ============================================================================

const THRESHOLD: Duration = Duration::from_secs(60);

fn config() -> BundleCacheConfig {
    BundleCacheConfig::default()
        .with_worker_threads(2)
        .with_index_batch_size(2)
        .with_eviction_threshold(THRESHOLD)
        .with_leak_policy(LeakPolicy::Strict)
}

fn cache() -> (BundleManager, ManualClock) {
    let clock = ManualClock::new();
    (BundleManager::with_clock(config(), clock.clone()), clock)
}

fn foo_bar() -> Vec<u8> {
    BundleArchiveBuilder::new()
        .with_entry("foo", b"foo".to_vec())
        .with_entry("bar", b"bar".to_vec())
        .build()
}

fn write_bundle(dir: &tempfile::TempDir, name: &str, bytes: &[u8]) -> String {
    let path = dir.path().join(name);
    std::fs::write(&path, bytes).unwrap();
    format!("file://{}", path.display())
}

// ============================================================================
// Bundle Lifecycle
// ============================================================================

#[test]
fn test_file_bundle_lifecycle() {
    let dir = tempfile::tempdir().unwrap();
    let uri = write_bundle(&dir, "a.bundle", &foo_bar());
    let (mut cache, clock) = cache();

    let bundle = cache.register_bundle_by_uri(&uri, 0xdead_beef).unwrap();
    assert_eq!(cache.bundle_state(bundle), Some(BundleState::Unloaded));

    cache.load_bundle(bundle).unwrap();
    assert!(cache.has_asset(bundle, "foo"));
    assert!(cache.has_asset(bundle, "bar"));
    assert!(!cache.has_asset(bundle, "baz"));

    let foo = cache.load_asset::<AssetBytes>(bundle, "foo").unwrap();
    assert_eq!(cache.get(&foo).unwrap().as_slice(), b"foo");
    assert_eq!(cache.asset_status(bundle, "foo").unwrap().outstanding, 1);

    cache.reserve(foo).unwrap();
    let status = cache.asset_status(bundle, "foo").unwrap();
    assert_eq!(status.outstanding, 0);
    assert!(status.loaded);

    clock.advance(THRESHOLD);
    cache.update();

    assert!(!cache.asset_status(bundle, "foo").unwrap().loaded);
    assert!(cache.is_loaded(bundle));
    assert!(cache.has_asset(bundle, "foo"));
}

#[test]
fn test_relative_uri_resolves_against_base_path() {
    let dir = tempfile::tempdir().unwrap();
    let absolute = write_bundle(&dir, "a.bundle", &foo_bar());

    let config = config().with_base_path(dir.path());
    let mut cache = BundleManager::with_clock(config, ManualClock::new());

    let relative = cache.register_bundle_by_uri("a.bundle", 0).unwrap();
    let by_uri = cache.register_bundle_by_uri(&absolute, 0).unwrap();
    let by_path = cache
        .register_bundle_absolute_path(dir.path().join("a.bundle"), 0)
        .unwrap();

    assert_eq!(relative, by_uri);
    assert_eq!(relative, by_path);
    assert_eq!(cache.stats().registered_bundles, 1);

    cache.load_bundle(relative).unwrap();
    assert_eq!(cache.asset_names(relative).unwrap(), vec!["foo", "bar"]);
}

#[test]
fn test_register_is_idempotent_and_keeps_crc_while_loaded() {
    let (mut cache, _) = cache();
    cache.add_embedded("boot", foo_bar());
    let first = cache.register_bundle_by_uri("memory://boot", 1).unwrap();
    let second = cache.register_bundle_by_uri("memory://boot", 2).unwrap();
    assert_eq!(first, second);
    assert_eq!(cache.bundle_crc(first), Some(2));

    cache.load_bundle(first).unwrap();
    cache.register_bundle_by_uri("memory://boot", 3).unwrap();
    assert_eq!(cache.bundle_crc(first), Some(2));
}

#[test]
fn test_relative_path_is_rejected_as_absolute() {
    let (mut cache, _) = cache();
    assert!(cache.register_bundle_absolute_path("a.bundle", 0).is_err());
}

#[test]
fn test_load_twice_returns_resident_payload() {
    let (mut cache, _) = cache();
    let bundle = cache.add_embedded("boot", foo_bar());

    let first = cache.load_bundle(bundle).unwrap();
    let second = cache.load_bundle(bundle).unwrap();
    assert_eq!(first.origin(), second.origin());
    assert_eq!(cache.stats().loaded_bundles, 1);
}

#[test]
fn test_missing_file_fails_and_stays_unloaded() {
    let dir = tempfile::tempdir().unwrap();
    let (mut cache, _) = cache();
    let bundle = cache
        .register_bundle_absolute_path(dir.path().join("missing.bundle"), 0)
        .unwrap();

    let result = cache.load_bundle(bundle);
    assert!(matches!(result, Err(BundleError::NotFound { .. })));
    assert_eq!(cache.bundle_state(bundle), Some(BundleState::Unloaded));
    assert!(cache.drain_events().any(|e| e.is_failed()));
}

#[test]
fn test_corrupt_bundle_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let uri = write_bundle(&dir, "junk.bundle", b"not a bundle at all");
    let (mut cache, _) = cache();
    let bundle = cache.register_bundle_by_uri(&uri, 0).unwrap();

    assert!(matches!(
        cache.load_bundle(bundle),
        Err(BundleError::Corrupt { .. })
    ));
}

#[test]
fn test_unsupported_schemes() {
    let (mut cache, _) = cache();
    assert!(matches!(
        cache.register_bundle_by_uri("ftp://host/a.bundle", 0),
        Err(BundleError::UnsupportedScheme { .. })
    ));

    let remote = cache
        .register_bundle_by_uri("https://cdn.example.com/a.bundle", 0)
        .unwrap();
    assert!(matches!(
        cache.load_bundle(remote),
        Err(BundleError::UnsupportedScheme { .. })
    ));
}

#[test]
fn test_load_bundle_async_completes_on_update() {
    let (mut cache, _) = cache();
    let bundle = cache.add_embedded("boot", foo_bar());

    let promise = cache.load_bundle_async(bundle).unwrap();
    let again = cache.load_bundle_async(bundle).unwrap();

    let fired = Arc::new(AtomicUsize::new(0));
    let f = fired.clone();
    promise.on_complete(move |result| {
        assert!(result.is_ok());
        f.fetch_add(1, Ordering::SeqCst);
    });

    while !promise.is_complete() {
        cache.update();
        thread::yield_now();
    }

    assert!(again.is_complete());
    assert_eq!(fired.load(Ordering::SeqCst), 1);
    assert_eq!(cache.bundle_state(bundle), Some(BundleState::Loaded));
    assert!(cache.has_asset(bundle, "bar"));
}

// ============================================================================
// Handles and Leases
// ============================================================================

#[test]
fn test_stale_bundle_handle_after_slot_reuse() {
    let (mut cache, _) = cache();
    let old = cache.register_bundle_by_uri("memory://a", 0).unwrap();
    cache.unregister_bundle(old).unwrap();

    let new = cache.register_bundle_by_uri("memory://b", 0).unwrap();
    assert_eq!(old.index(), new.index());
    assert_ne!(old, new);

    assert!(!cache.is_valid(old));
    assert!(cache.bundle_state(old).is_none());
    assert!(matches!(
        cache.load_bundle(old),
        Err(BundleError::StaleHandle { .. })
    ));
    assert!(!cache.has_asset(old, "foo"));
}

#[test]
fn test_unregister_refuses_loaded_bundle() {
    let (mut cache, _) = cache();
    let bundle = cache.register_bundle("boot", BundleArchive::decode("boot", foo_bar().into()).unwrap());

    assert!(matches!(
        cache.unregister_bundle(bundle),
        Err(BundleError::StillLoaded { .. })
    ));

    cache.unload_bundle(bundle, false).unwrap();
    cache.unregister_bundle(bundle).unwrap();
    assert!(!cache.is_valid(bundle));
}

#[test]
fn test_every_lease_must_be_reserved_before_unload() {
    let (mut cache, _) = cache();
    let bundle = cache.add_embedded("boot", foo_bar());
    cache.load_bundle(bundle).unwrap();

    let a = cache.load_asset::<AssetBytes>(bundle, "foo").unwrap();
    let b = cache.load_asset::<AssetBytes>(bundle, "foo").unwrap();
    assert_ne!(a.untyped().lease(), b.untyped().lease());

    let err = cache.unload_bundle(bundle, true).unwrap_err();
    let BundleError::LeakedReference { leaks, .. } = err else {
        panic!("expected LeakedReference, got {:?}", err);
    };
    assert_eq!(leaks.len(), 1);
    assert_eq!(leaks[0].key, "foo");
    assert_eq!(leaks[0].outstanding, 2);
    #[cfg(debug_assertions)]
    assert!(leaks[0].call_sites.iter().all(|site| site.contains("integration_tests.rs")));

    assert!(cache.is_loaded(bundle));
    assert_eq!(cache.get(&a).unwrap().as_slice(), b"foo");

    cache.reserve(a).unwrap();
    assert!(cache.unload_bundle(bundle, true).is_err());
    cache.reserve(b).unwrap();
    cache.unload_bundle(bundle, true).unwrap();

    assert_eq!(cache.bundle_state(bundle), Some(BundleState::Unloaded));
    assert!(matches!(
        cache.load_asset::<AssetBytes>(bundle, "foo"),
        Err(BundleError::NotLoaded { .. })
    ));
}

#[test]
fn test_permissive_unload_invalidates_leases() {
    let config = config().with_leak_policy(LeakPolicy::Permissive);
    let mut cache = BundleManager::with_clock(config, ManualClock::new());
    let bundle = cache.add_embedded("boot", foo_bar());
    cache.load_bundle(bundle).unwrap();

    let foo = cache.load_asset::<AssetBytes>(bundle, "foo").unwrap();
    cache.unload_bundle(bundle, true).unwrap();

    assert!(!cache.is_asset_valid(&foo.untyped()));
    assert!(cache.get(&foo).is_err());
    assert!(cache.reserve(foo).is_err());
}

#[test]
fn test_reserve_in_checks_ownership() {
    let (mut cache, _) = cache();
    let a = cache.add_embedded("a", foo_bar());
    let b = cache.add_embedded("b", foo_bar());
    cache.load_bundle(a).unwrap();
    cache.load_bundle(b).unwrap();

    let foo = cache.load_asset::<AssetBytes>(a, "foo").unwrap();
    assert!(matches!(
        cache.reserve_in(b, foo),
        Err(BundleError::OwnershipMismatch { .. })
    ));
    assert_eq!(cache.asset_status(a, "foo").unwrap().outstanding, 1);

    cache.reserve_in(a, foo).unwrap();
    assert_eq!(cache.asset_status(a, "foo").unwrap().outstanding, 0);
}

#[test]
fn test_same_key_in_two_bundles_is_independent() {
    let (mut cache, _) = cache();
    let a = cache.add_embedded("a", foo_bar());
    let b = cache.add_embedded(
        "b",
        BundleArchiveBuilder::new().with_entry("foo", b"other".to_vec()).build(),
    );
    cache.load_bundle(a).unwrap();
    cache.load_bundle(b).unwrap();

    let from_a = cache.load_asset::<AssetBytes>(a, "foo").unwrap();
    let from_b = cache.load_asset::<AssetBytes>(b, "FOO").unwrap();
    assert_eq!(cache.get(&from_a).unwrap().as_slice(), b"foo");
    assert_eq!(cache.get(&from_b).unwrap().as_slice(), b"other");

    cache.reserve(from_a).unwrap();
    cache.reserve(from_b).unwrap();
    cache.unload_bundle(b, false).unwrap();
    assert!(cache.has_asset(a, "foo"));
    assert!(!cache.has_asset(b, "foo"));
}

// ============================================================================
// Asset Loading
// ============================================================================

#[test]
fn test_custom_loader() {
    let (mut cache, _) = cache();
    cache.register_loader(TestConfigLoader);
    assert!(cache.has_loader_for::<TestConfig>("cfg"));

    let bundle = cache.add_embedded(
        "settings",
        BundleArchiveBuilder::new()
            .with_entry("game.cfg", b"name: Strata\nvalue: 42".to_vec())
            .build(),
    );
    cache.load_bundle(bundle).unwrap();

    let handle = cache.load_asset::<TestConfig>(bundle, "game.cfg").unwrap();
    let config = cache.get(&handle).unwrap();
    assert_eq!(config.name, "Strata");
    assert_eq!(config.value, 42);
    cache.reserve(handle).unwrap();
}

#[test]
fn test_missing_loader_reports_type_and_extension() {
    let (mut cache, _) = cache();
    let bundle = cache.add_embedded("boot", foo_bar());
    cache.load_bundle(bundle).unwrap();

    let err = cache.load_asset::<TestConfig>(bundle, "foo").unwrap_err();
    assert!(matches!(err, BundleError::NoLoader { .. }));
    assert_eq!(cache.stats().outstanding_leases, 0);
}

#[test]
fn test_concurrent_async_loads_share_one_fetch() {
    let (mut cache, _) = cache();
    let bundle = cache.add_embedded("boot", foo_bar());
    let payload = cache.load_bundle(bundle).unwrap();

    let first = cache.load_asset_async::<AssetBytes>(bundle, "foo").unwrap();
    let second = cache.load_asset_async::<AssetBytes>(bundle, "foo").unwrap();

    let a = first.wait().unwrap();
    let b = second.wait().unwrap();
    assert!(Arc::ptr_eq(&a, &b));
    assert_eq!(payload.fetch_count(), 1);

    cache.update();
    let status = cache.asset_status(bundle, "foo").unwrap();
    assert!(status.loaded);
    assert_eq!(status.outstanding, 2);

    cache.reserve(first.handle).unwrap();
    cache.reserve(second.handle).unwrap();
}

#[test]
fn test_async_asset_callback_runs_once_decoded() {
    let (mut cache, _) = cache();
    let bundle = cache.add_embedded(
        "text",
        BundleArchiveBuilder::new()
            .with_entry("readme.md", b"# strata".to_vec())
            .build(),
    );
    cache.load_bundle(bundle).unwrap();

    let seen = Arc::new(parking_lot::Mutex::new(None));
    let request = cache.load_asset_async::<String>(bundle, "readme.md").unwrap();
    let s = seen.clone();
    request.on_complete(move |result| {
        *s.lock() = Some(result.map(|text| text.to_string()));
    });

    assert_eq!(*request.wait().unwrap(), "# strata");
    // Callbacks run after the value is published.
    while seen.lock().is_none() {
        thread::yield_now();
    }
    assert_eq!(seen.lock().take().unwrap().unwrap(), "# strata");
    cache.reserve(request.handle).unwrap();
}

// ============================================================================
// Idle Eviction
// ============================================================================

#[test]
fn test_leased_asset_is_never_evicted() {
    let (mut cache, clock) = cache();
    let bundle = cache.add_embedded("boot", foo_bar());
    let payload = cache.load_bundle(bundle).unwrap();

    let foo = cache.load_asset::<AssetBytes>(bundle, "foo").unwrap();
    clock.advance(THRESHOLD * 10);
    cache.update();
    assert!(cache.asset_status(bundle, "foo").unwrap().loaded);

    cache.reserve(foo).unwrap();
    clock.advance(THRESHOLD - Duration::from_secs(1));
    cache.update();
    assert!(cache.asset_status(bundle, "foo").unwrap().loaded);

    clock.advance(Duration::from_secs(1));
    cache.update();
    assert!(!cache.asset_status(bundle, "foo").unwrap().loaded);
    assert_eq!(payload.object_count(), 0);

    let foo = cache.load_asset::<AssetBytes>(bundle, "foo").unwrap();
    assert_eq!(payload.fetch_count(), 2);
    cache.reserve(foo).unwrap();
}

#[test]
fn test_pinned_asset_is_never_evicted() {
    let (mut cache, clock) = cache();
    let bundle = cache.add_embedded("boot", foo_bar());
    cache.load_bundle(bundle).unwrap();

    let bar = cache.load_asset::<AssetBytes>(bundle, "bar").unwrap();
    cache.pin_asset(bundle, "bar").unwrap();
    cache.reserve(bar).unwrap();

    clock.advance(THRESHOLD * 2);
    assert_eq!(cache.sweep_idle(), 0);
    assert!(cache.asset_status(bundle, "bar").unwrap().pinned);
    assert!(cache.asset_status(bundle, "bar").unwrap().loaded);
}

#[test]
fn test_events_follow_lifecycle() {
    let (mut cache, clock) = cache();
    let bundle = cache.add_embedded("boot", foo_bar());
    cache.load_bundle(bundle).unwrap();
    let foo = cache.load_asset::<AssetBytes>(bundle, "foo").unwrap();
    cache.reserve(foo).unwrap();
    clock.advance(THRESHOLD);
    cache.update();
    cache.unload_bundle(bundle, false).unwrap();
    cache.unregister_bundle(bundle).unwrap();

    let events: Vec<BundleEvent> = cache.drain_events().collect();
    assert_eq!(
        events,
        vec![
            BundleEvent::Registered {
                bundle,
                uri: "memory://boot".to_string(),
            },
            BundleEvent::Loaded { bundle },
            BundleEvent::AssetLoaded {
                bundle,
                key: "foo".to_string(),
            },
            BundleEvent::AssetEvicted {
                bundle,
                key: "foo".to_string(),
            },
            BundleEvent::Unloaded { bundle },
            BundleEvent::Unregistered { bundle },
        ]
    );
    assert!(cache.drain_events().next().is_none());
}

// ============================================================================
// Manifest and Remote Bundles
// ============================================================================

#[test]
fn test_manifest_rejects_tampered_file() {
    let dir = tempfile::tempdir().unwrap();
    let uri = write_bundle(&dir, "a.bundle", &foo_bar());
    let (mut cache, _) = cache();

    let mut manifest = BundleManifest::new();
    manifest.insert(
        "a.bundle",
        ManifestEntry {
            content_hash: ContentHash::of(b"something else"),
            size: None,
        },
    );
    cache.register_manifest(manifest);

    let bundle = cache.register_bundle_by_uri(&uri, 0).unwrap();
    assert!(matches!(
        cache.load_bundle(bundle),
        Err(BundleError::ContentHashMismatch { .. })
    ));
    assert!(!cache.is_loaded(bundle));
}

#[test]
fn test_remote_bundle_is_cached_by_content_hash() {
    let cache_dir = tempfile::tempdir().unwrap();
    let url = "https://cdn.example.com/levels/levels.bundle";
    let bytes = foo_bar();
    let manifest = BundleManifest::new().with_bundle("levels.bundle", &bytes);

    let remote = MemoryReader::new();
    remote.insert(url, bytes.clone());

    let config = config().with_cache_dir(cache_dir.path());
    let mut cache = BundleManager::with_clock(config.clone(), ManualClock::new());
    cache.set_remote_reader(remote);
    cache.register_manifest(manifest.clone());

    let bundle = cache.register_bundle_by_uri(url, 0).unwrap();
    cache.load_bundle(bundle).unwrap();
    assert!(cache.has_asset(bundle, "bar"));

    let cached = cache_dir
        .path()
        .join(format!("{}.bundle", ContentHash::of(&bytes).to_hex()));
    assert_eq!(std::fs::read(&cached).unwrap(), bytes);

    // A second cache whose remote has nothing must be served from disk.
    let mut offline = BundleManager::with_clock(config, ManualClock::new());
    offline.set_remote_reader(MemoryReader::new());
    offline.register_manifest(manifest);
    let bundle = offline.register_bundle_by_uri(url, 0).unwrap();
    offline.load_bundle(bundle).unwrap();
    assert!(offline.has_asset(bundle, "foo"));
}

#[test]
fn test_remote_hash_mismatch_is_not_cached() {
    let cache_dir = tempfile::tempdir().unwrap();
    let url = "https://cdn.example.com/a.bundle";
    let remote = MemoryReader::new();
    remote.insert(url, foo_bar());

    let mut cache = BundleManager::with_clock(config().with_cache_dir(cache_dir.path()), ManualClock::new());
    cache.set_remote_reader(remote);
    cache.register_manifest(BundleManifest::new().with_bundle("a.bundle", b"expected"));

    let bundle = cache.register_bundle_by_uri(url, 0).unwrap();
    assert!(matches!(
        cache.load_bundle(bundle),
        Err(BundleError::ContentHashMismatch { .. })
    ));
    assert_eq!(std::fs::read_dir(cache_dir.path()).unwrap().count(), 0);
}
