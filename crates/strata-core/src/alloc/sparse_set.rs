//! Generational slot storage.
//!
//! Values live in a growable vector of slots. Growth only ever appends, and
//! removing a value bumps the slot's generation so that every [`IndexSlot`]
//! issued for the previous occupant stops resolving.

use std::num::{NonZeroU32, NonZeroU64};

use crate::profiling::profile_function;

/// A `(generation, index)` pair packed into a non-zero `u64`.
///
/// The low half stores `index + 1`, the high half stores the generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct IndexSlot(NonZeroU64);

impl IndexSlot {
    /// Largest index that can be encoded.
    pub const MAX_INDEX: u32 = u32::MAX - 1;

    pub fn new(generation: u32, idx: u32) -> Self {
        debug_assert!(idx <= Self::MAX_INDEX, "slot index out of range");
        let low = NonZeroU64::from(NonZeroU32::MIN.saturating_add(idx));
        Self(low | ((generation as u64) << 32))
    }

    pub fn generation(&self) -> u32 {
        (self.0.get() >> 32) as u32
    }

    pub fn index(&self) -> u32 {
        (self.0.get() as u32) - 1
    }
}

struct Entry<T> {
    generation: u32,
    data: Option<T>,
}

/// Generational arena with slot reuse.
///
/// Vacant slots are found with a linear scan, which keeps the arena compact
/// without maintaining a separate free list.
pub struct SparseSet<T> {
    vec: Vec<Entry<T>>,
    len: usize,
}

impl<T> Default for SparseSet<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> SparseSet<T> {
    pub const fn new() -> Self {
        Self {
            vec: Vec::new(),
            len: 0,
        }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            vec: Vec::with_capacity(capacity),
            len: 0,
        }
    }

    /// Index of the first slot that holds no value, if any.
    pub fn first_vacant(&self) -> Option<u32> {
        self.vec
            .iter()
            .position(|entry| entry.data.is_none())
            .map(|idx| idx as u32)
    }

    pub fn push(&mut self, data: T) -> IndexSlot {
        profile_function!();
        self.len += 1;
        if let Some(idx) = self.first_vacant() {
            let entry = &mut self.vec[idx as usize];
            entry.data = Some(data);
            return IndexSlot::new(entry.generation, idx);
        }

        let idx = self.vec.len() as u32;
        self.vec.push(Entry {
            generation: 0,
            data: Some(data),
        });
        IndexSlot::new(0, idx)
    }

    /// Returns `true` if `idx` still refers to a live value.
    pub fn contains(&self, idx: IndexSlot) -> bool {
        self.try_get(idx).is_some()
    }

    pub fn try_get(&self, idx: IndexSlot) -> Option<&T> {
        self.vec
            .get(idx.index() as usize)
            .filter(|entry| entry.generation == idx.generation())
            .and_then(|entry| entry.data.as_ref())
    }

    pub fn try_get_mut(&mut self, idx: IndexSlot) -> Option<&mut T> {
        self.vec
            .get_mut(idx.index() as usize)
            .filter(|entry| entry.generation == idx.generation())
            .and_then(|entry| entry.data.as_mut())
    }

    /// # Panics
    ///
    /// Panics if `idx` is stale.
    pub fn get(&self, idx: IndexSlot) -> &T {
        profile_function!();
        self.try_get(idx)
            .unwrap_or_else(|| panic!("invalid generation, use after free! ({idx:?})"))
    }

    /// # Panics
    ///
    /// Panics if `idx` is stale.
    pub fn get_mut(&mut self, idx: IndexSlot) -> &mut T {
        profile_function!();
        self.try_get_mut(idx)
            .unwrap_or_else(|| panic!("invalid generation, use after free! ({idx:?})"))
    }

    /// The slot currently occupying `index`, if it holds a value.
    pub fn slot_at(&self, index: u32) -> Option<IndexSlot> {
        self.vec
            .get(index as usize)
            .filter(|entry| entry.data.is_some())
            .map(|entry| IndexSlot::new(entry.generation, index))
    }

    /// Removes the value and retires `idx`; returns `None` if `idx` is stale.
    pub fn try_remove(&mut self, idx: IndexSlot) -> Option<T> {
        profile_function!();
        let entry = self.vec.get_mut(idx.index() as usize)?;
        if entry.generation != idx.generation() {
            return None;
        }
        let data = entry.data.take()?;
        entry.generation = entry.generation.wrapping_add(1);
        self.len -= 1;
        Some(data)
    }

    /// # Panics
    ///
    /// Panics if `idx` is stale.
    pub fn remove(&mut self, idx: IndexSlot) -> T {
        self.try_remove(idx)
            .unwrap_or_else(|| panic!("invalid generation, use after free! ({idx:?})"))
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of slots ever allocated, occupied or not.
    pub fn slot_count(&self) -> usize {
        self.vec.len()
    }

    /// Drops every value, retiring all outstanding slots.
    pub fn clear(&mut self) {
        for entry in &mut self.vec {
            if entry.data.take().is_some() {
                entry.generation = entry.generation.wrapping_add(1);
            }
        }
        self.len = 0;
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.vec.iter().filter_map(|entry| entry.data.as_ref())
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut T> {
        self.vec.iter_mut().filter_map(|entry| entry.data.as_mut())
    }

    /// Iterates live values together with their current slots.
    pub fn iter_slots(&self) -> impl Iterator<Item = (IndexSlot, &T)> {
        self.vec.iter().enumerate().filter_map(|(idx, entry)| {
            entry
                .data
                .as_ref()
                .map(|data| (IndexSlot::new(entry.generation, idx as u32), data))
        })
    }
}

static_assertions::assert_eq_size!(IndexSlot, Option<IndexSlot>);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_index_slot_packing() {
        let slot = IndexSlot::new(7, 3);
        assert_eq!(slot.generation(), 7);
        assert_eq!(slot.index(), 3);

        let max = IndexSlot::new(u32::MAX, IndexSlot::MAX_INDEX);
        assert_eq!(max.generation(), u32::MAX);
        assert_eq!(max.index(), IndexSlot::MAX_INDEX);
    }

    #[test]
    fn test_first_vacant_scans_for_holes() {
        let mut set = SparseSet::<u8>::new();
        assert_eq!(set.first_vacant(), None);

        let a = set.push(1);
        set.push(2);
        assert_eq!(set.first_vacant(), None);

        set.remove(a);
        assert_eq!(set.first_vacant(), Some(0));
    }

    #[test]
    fn test_slot_at_tracks_current_generation() {
        let mut set = SparseSet::<u8>::new();
        let first = set.push(1);
        assert_eq!(set.slot_at(0), Some(first));

        set.remove(first);
        assert_eq!(set.slot_at(0), None);

        let second = set.push(2);
        assert_eq!(set.slot_at(0), Some(second));
        assert_ne!(first, second);
    }

    #[test]
    fn test_try_remove_stale_is_none() {
        let mut set = SparseSet::<u8>::new();
        let idx = set.push(15);
        assert_eq!(set.try_remove(idx), Some(15));
        assert_eq!(set.try_remove(idx), None);
        assert!(set.is_empty());
    }
}
