//! Strata Core
//!
//! Runtime plumbing shared by the Strata crates: generational storage,
//! the background task pool, clocks, logging and profiling hooks.

pub mod alloc;
pub mod logging;
pub mod profiling;
pub mod tasks;
pub mod time;
