//! Generation-checked instance arena backing the handle-based API.
//!
//! A [`Handle`] carries a slot index plus the generation the slot had when the
//! instance was inserted. Removing an instance bumps the slot generation, so a
//! stale handle never resolves to whatever occupies the slot later.
use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;
use std::sync::Arc;

use parking_lot::RwLock;

/// Typed, copyable reference to an instance held in a [`Registry`].
pub struct Handle<T> {
    index: u32,
    generation: u32,
    _kind: PhantomData<fn() -> T>,
}

impl<T> Handle<T> {
    fn new(index: u32, generation: u32) -> Self {
        Self {
            index,
            generation,
            _kind: PhantomData,
        }
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }
}

impl<T> Clone for Handle<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Handle<T> {}

impl<T> PartialEq for Handle<T> {
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index && self.generation == other.generation
    }
}

impl<T> Eq for Handle<T> {}

impl<T> Hash for Handle<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.index.hash(state);
        self.generation.hash(state);
    }
}

impl<T> fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Handle({}v{})", self.index, self.generation)
    }
}

struct Slot<T> {
    generation: u32,
    value: Option<Arc<T>>,
}

struct Slots<T> {
    entries: Vec<Slot<T>>,
    free: Vec<u32>,
    live: usize,
}

/// Arena of shared instances.
///
/// The registry lock only guards slot bookkeeping; lookups clone the `Arc` out
/// so instance-level locks are never taken while it is held.
pub struct Registry<T> {
    slots: RwLock<Slots<T>>,
}

impl<T> Registry<T> {
    pub fn new() -> Self {
        Self {
            slots: RwLock::new(Slots {
                entries: Vec::new(),
                free: Vec::new(),
                live: 0,
            }),
        }
    }

    pub fn insert(&self, value: T) -> Handle<T> {
        let mut slots = self.slots.write();
        slots.live += 1;
        if let Some(index) = slots.free.pop() {
            let slot = &mut slots.entries[index as usize];
            slot.value = Some(Arc::new(value));
            return Handle::new(index, slot.generation);
        }
        let index = slots.entries.len() as u32;
        slots.entries.push(Slot {
            generation: 0,
            value: Some(Arc::new(value)),
        });
        Handle::new(index, 0)
    }

    /// Resolves a handle; `None` for unknown or stale handles.
    pub fn get(&self, handle: Handle<T>) -> Option<Arc<T>> {
        let slots = self.slots.read();
        slots
            .entries
            .get(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.value.clone())
    }

    /// Detaches an instance and retires its handle.
    ///
    /// Callers still holding the returned `Arc` (or one cloned earlier) keep the
    /// instance alive until they drop it.
    pub fn remove(&self, handle: Handle<T>) -> Option<Arc<T>> {
        let mut slots = self.slots.write();
        let slot = slots.entries.get_mut(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        let value = slot.value.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        slots.free.push(handle.index);
        slots.live -= 1;
        Some(value)
    }

    pub fn contains(&self, handle: Handle<T>) -> bool {
        self.get(handle).is_some()
    }

    pub fn len(&self) -> usize {
        self.slots.read().live
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> Default for Registry<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stale_handle_does_not_resolve_reused_slot() {
        let registry = Registry::new();
        let first = registry.insert("first");
        assert!(registry.remove(first).is_some());

        let second = registry.insert("second");
        assert_eq!(first.index(), second.index());
        assert_ne!(first, second);
        assert!(registry.get(first).is_none());
        assert_eq!(registry.get(second).as_deref(), Some(&"second"));
    }

    #[test]
    fn double_remove_fails() {
        let registry = Registry::new();
        let handle = registry.insert(7u8);
        assert!(registry.remove(handle).is_some());
        assert!(registry.remove(handle).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn out_of_range_index_is_unknown() {
        let registry: Registry<u8> = Registry::new();
        registry.insert(1);
        assert!(registry.get(Handle::new(42, 0)).is_none());
        assert_eq!(registry.len(), 1);
    }
}
