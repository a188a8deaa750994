//! Bundle and asset handles.
//!
//! Handles are copyable, carry no ownership, and are validated against the
//! arena's generation counter before every use. A handle whose slot has been
//! recycled fails with [`BundleError::StaleHandle`](crate::BundleError::StaleHandle)
//! instead of reaching the new occupant.

use std::any::TypeId;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;

use strata_core::alloc::sparse_set::IndexSlot;

use crate::Asset;
use crate::key::KeyHash;
use crate::record::LeaseId;

/// A generation-checked reference to a registered bundle.
///
/// Two handles are equal when they name the same slot in the same
/// generation, however they were obtained.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct BundleHandle {
    pub(crate) slot: IndexSlot,
}

impl BundleHandle {
    pub(crate) fn new(slot: IndexSlot) -> Self {
        Self { slot }
    }

    pub fn index(&self) -> u32 {
        self.slot.index()
    }

    pub fn generation(&self) -> u32 {
        self.slot.generation()
    }
}

impl fmt::Debug for BundleHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BundleHandle")
            .field("index", &self.index())
            .field("generation", &self.generation())
            .finish()
    }
}

/// A lease on one asset, to be released exactly once with
/// [`BundleManager::reserve`](crate::BundleManager::reserve).
///
/// Copying the handle does not copy the lease.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AssetHandle {
    pub(crate) bundle: BundleHandle,
    pub(crate) lease: LeaseId,
    pub(crate) key: KeyHash,
    pub(crate) asset_index: u32,
    pub(crate) epoch: u32,
    pub(crate) type_id: TypeId,
}

impl AssetHandle {
    /// The bundle that issued this lease.
    pub fn bundle(&self) -> BundleHandle {
        self.bundle
    }

    pub fn lease(&self) -> LeaseId {
        self.lease
    }

    pub fn key(&self) -> KeyHash {
        self.key
    }

    /// The type the asset was loaded as.
    pub fn type_id(&self) -> TypeId {
        self.type_id
    }

    /// Try to convert to a typed handle.
    ///
    /// Returns `None` if the type doesn't match.
    pub fn typed<T: Asset>(self) -> Option<Handle<T>> {
        if self.type_id == TypeId::of::<T>() {
            Some(Handle::new(self))
        } else {
            None
        }
    }
}

/// An [`AssetHandle`] that remembers the asset's type.
pub struct Handle<T: Asset> {
    pub(crate) inner: AssetHandle,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Asset> Handle<T> {
    pub(crate) fn new(inner: AssetHandle) -> Self {
        debug_assert_eq!(inner.type_id, TypeId::of::<T>());
        Self {
            inner,
            _marker: PhantomData,
        }
    }

    pub fn untyped(self) -> AssetHandle {
        self.inner
    }

    pub fn bundle(&self) -> BundleHandle {
        self.inner.bundle
    }

    pub fn type_name(&self) -> &'static str {
        T::type_name()
    }
}

impl<T: Asset> fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handle")
            .field("type", &T::type_name())
            .field("bundle", &self.inner.bundle)
            .field("key", &self.inner.key)
            .field("lease", &self.inner.lease)
            .finish()
    }
}

impl<T: Asset> Clone for Handle<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T: Asset> Copy for Handle<T> {}

impl<T: Asset> PartialEq for Handle<T> {
    fn eq(&self, other: &Self) -> bool {
        self.inner == other.inner
    }
}

impl<T: Asset> Eq for Handle<T> {}

impl<T: Asset> Hash for Handle<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.inner.hash(state);
    }
}

impl<T: Asset> From<Handle<T>> for AssetHandle {
    fn from(handle: Handle<T>) -> Self {
        handle.untyped()
    }
}
