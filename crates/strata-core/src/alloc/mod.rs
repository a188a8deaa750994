//! Collection types used across Strata.
//!
//! This module provides:
//! - Re-exports of AHash-backed hash collections
//! - The generational [`SparseSet`](sparse_set::SparseSet) arena backing handle-based storage

pub mod sparse_set;

pub use ahash::{AHashMap as HashMap, AHashSet as HashSet, RandomState};
