//! Profiling utilities based on the `puffin` crate.
//!
//! With the `profiling` feature disabled the scope macros expand to nothing.

#[cfg(feature = "profiling")]
use std::sync::OnceLock;

#[cfg(feature = "profiling")]
pub use puffin::{profile_function, profile_scope};

#[cfg(not(feature = "profiling"))]
#[doc(hidden)]
#[macro_export]
macro_rules! __strata_profile_noop {
    ($($arg:tt)*) => {};
}

#[cfg(not(feature = "profiling"))]
pub use crate::__strata_profile_noop as profile_function;
#[cfg(not(feature = "profiling"))]
pub use crate::__strata_profile_noop as profile_scope;

/// Default address for the puffin HTTP server.
pub const DEFAULT_PROFILER_ADDR: &str = "0.0.0.0:8585";

#[cfg(feature = "profiling")]
static PROFILING_SERVER: OnceLock<puffin_http::Server> = OnceLock::new();

/// Turn on puffin scopes and serve them over HTTP at `addr`.
///
/// Returns `false` if the server could not be started.
#[cfg(feature = "profiling")]
pub fn init_profiling(addr: &str) -> bool {
    puffin::set_scopes_on(true);

    match puffin_http::Server::new(addr) {
        Ok(server) => {
            tracing::info!("Puffin profiler server started on http://{}", addr);
            let _ = PROFILING_SERVER.set(server);
            true
        }
        Err(e) => {
            tracing::error!("Failed to start puffin server: {}", e);
            false
        }
    }
}

#[cfg(not(feature = "profiling"))]
pub fn init_profiling(_addr: &str) -> bool {
    false
}

/// Mark a frame boundary. Call once per cache tick.
#[inline]
pub fn new_frame() {
    #[cfg(feature = "profiling")]
    puffin::GlobalProfiler::lock().new_frame();
}
