//! Bundle cache events for change detection.

use crate::handle::BundleHandle;

/// Events emitted by the bundle cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BundleEvent {
    /// A bundle was registered (not yet fetched).
    Registered {
        bundle: BundleHandle,
        uri: String,
    },

    /// A bundle's payload finished fetching and indexing was scheduled.
    Loaded { bundle: BundleHandle },

    /// A bundle fetch failed.
    LoadFailed {
        bundle: BundleHandle,
        /// Error message.
        error: String,
    },

    /// A bundle's payload and asset list were released.
    Unloaded { bundle: BundleHandle },

    /// A bundle's slot was returned to the arena.
    Unregistered { bundle: BundleHandle },

    /// An asset's object became resident.
    AssetLoaded { bundle: BundleHandle, key: String },

    /// The idle sweep evicted an asset's object.
    AssetEvicted { bundle: BundleHandle, key: String },
}

impl BundleEvent {
    /// The bundle this event relates to.
    pub fn bundle(&self) -> BundleHandle {
        match self {
            BundleEvent::Registered { bundle, .. }
            | BundleEvent::Loaded { bundle }
            | BundleEvent::LoadFailed { bundle, .. }
            | BundleEvent::Unloaded { bundle }
            | BundleEvent::Unregistered { bundle }
            | BundleEvent::AssetLoaded { bundle, .. }
            | BundleEvent::AssetEvicted { bundle, .. } => *bundle,
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, BundleEvent::LoadFailed { .. })
    }
}

/// A buffer of bundle events that can be drained each frame.
#[derive(Debug, Default)]
pub struct BundleEventBuffer {
    events: Vec<BundleEvent>,
}

impl BundleEventBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, event: BundleEvent) {
        self.events.push(event);
    }

    pub fn drain(&mut self) -> impl Iterator<Item = BundleEvent> + '_ {
        self.events.drain(..)
    }

    pub fn iter(&self) -> impl Iterator<Item = &BundleEvent> {
        self.events.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }
}
