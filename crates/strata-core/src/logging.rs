use tracing_subscriber::EnvFilter;

/// Default filter used when `RUST_LOG` is not set.
pub const DEFAULT_FILTER: &str = "info";

/// Install the global `tracing` subscriber.
pub fn init() {
    init_with_filter(DEFAULT_FILTER);
}

/// Install the global `tracing` subscriber, falling back to `default_filter`
/// when `RUST_LOG` is absent or invalid. Calling this twice is harmless.
pub fn init_with_filter(default_filter: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
