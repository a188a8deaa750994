//! Walks one bundle through its whole lifecycle.
//!
//! Run with:
//! ```bash
//! RUST_LOG=debug cargo run --package strata-bundles --example bundle_lifecycle
//! ```

use std::time::Duration;

use strata_bundles::{AssetBytes, BundleArchiveBuilder, BundleCacheConfig, BundleManager, LeakPolicy};
use strata_core::logging;
use strata_core::time::ManualClock;

fn main() {
    logging::init();

    let dir = std::env::temp_dir().join("strata-bundles-demo");
    std::fs::create_dir_all(&dir).expect("create demo directory");
    let bytes = BundleArchiveBuilder::new()
        .with_entry("readme.txt", b"Hello from a bundle".to_vec())
        .with_entry("icons/close.png", vec![0x89, b'P', b'N', b'G'])
        .build();
    std::fs::write(dir.join("demo.bundle"), &bytes).expect("write demo bundle");

    let clock = ManualClock::new();
    let config = BundleCacheConfig::default()
        .with_base_path(&dir)
        .with_eviction_threshold(Duration::from_secs(30))
        .with_leak_policy(LeakPolicy::Strict);
    let mut cache = BundleManager::with_clock(config, clock.clone());

    let bundle = cache.register_bundle_by_uri("demo.bundle", 0).expect("register");
    cache.load_bundle(bundle).expect("load");
    println!("assets: {:?}", cache.asset_names(bundle).expect("names"));

    let readme = cache.load_asset::<String>(bundle, "readme.txt").expect("readme");
    println!("readme: {}", cache.get(&readme).expect("get"));

    let icon = cache.load_asset::<AssetBytes>(bundle, "icons/close.png").expect("icon");
    println!("icon: {} bytes", cache.get(&icon).expect("get").len());

    if let Err(e) = cache.unload_bundle(bundle, true) {
        println!("unload refused: {}", e);
    }

    cache.reserve(readme).expect("reserve readme");
    cache.reserve(icon).expect("reserve icon");

    clock.advance(Duration::from_secs(30));
    cache.update();
    println!("{:?}", cache.stats());

    for event in cache.drain_events() {
        println!("event: {:?}", event);
    }

    cache.unload_bundle(bundle, true).expect("unload");
    cache.unregister_bundle(bundle).expect("unregister");
}
