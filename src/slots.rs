//! Fixed-capacity slot arena with per-slot generations.
//!
//! Handles are `(index, generation)` pairs. Releasing a slot bumps its generation so
//! any handle still pointing at the old occupant stops resolving, even after the slot
//! has been handed out again.

use crate::error::Result;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct SlotHandle {
    index: u32,
    generation: u32,
}

impl SlotHandle {
    pub fn index(&self) -> usize {
        self.index as usize
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }
}

impl std::fmt::Display for SlotHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}v{}", self.index, self.generation)
    }
}

#[derive(Debug)]
struct Slot<T> {
    generation: u32,
    occupied: bool,
    value: T,
}

/// Arena whose values are constructed once up front and recycled in place.
///
/// Values are never dropped on release, so any buffers they own stay allocated and
/// are reused by the next occupant.
#[derive(Debug)]
pub struct SlotPool<T> {
    slots: Vec<Slot<T>>,
    occupied: usize,
}

impl<T> SlotPool<T> {
    pub fn with_capacity(capacity: usize, mut make: impl FnMut() -> Result<T>) -> Result<Self> {
        let mut slots = Vec::new();
        slots.try_reserve_exact(capacity)?;
        for _ in 0..capacity {
            slots.push(Slot {
                generation: 0,
                occupied: false,
                value: make()?,
            });
        }
        Ok(Self { slots, occupied: 0 })
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn len(&self) -> usize {
        self.occupied
    }

    pub fn is_empty(&self) -> bool {
        self.occupied == 0
    }

    /// Claim the first vacant slot, scanning from index 0.
    pub fn allocate(&mut self) -> Option<(SlotHandle, &mut T)> {
        let index = self.slots.iter().position(|slot| !slot.occupied)?;
        let slot = &mut self.slots[index];
        slot.occupied = true;
        self.occupied += 1;
        let handle = SlotHandle {
            index: index as u32,
            generation: slot.generation,
        };
        Some((handle, &mut slot.value))
    }

    /// Vacate the slot and invalidate every outstanding handle to it.
    ///
    /// Returns the value so the caller can clear it for reuse.
    pub fn release(&mut self, handle: SlotHandle) -> Option<&mut T> {
        let slot = self.slots.get_mut(handle.index())?;
        if !slot.occupied || slot.generation != handle.generation {
            return None;
        }
        slot.occupied = false;
        slot.generation = slot.generation.wrapping_add(1);
        self.occupied -= 1;
        Some(&mut slot.value)
    }

    pub fn contains(&self, handle: SlotHandle) -> bool {
        self.get(handle).is_some()
    }

    pub fn get(&self, handle: SlotHandle) -> Option<&T> {
        self.slots
            .get(handle.index())
            .filter(|slot| slot.occupied && slot.generation == handle.generation)
            .map(|slot| &slot.value)
    }

    pub fn get_mut(&mut self, handle: SlotHandle) -> Option<&mut T> {
        self.slots
            .get_mut(handle.index())
            .filter(|slot| slot.occupied && slot.generation == handle.generation)
            .map(|slot| &mut slot.value)
    }

    /// Value stored at `index`, occupied or not.
    pub(crate) fn value_at_mut(&mut self, index: usize) -> Option<&mut T> {
        self.slots.get_mut(index).map(|slot| &mut slot.value)
    }

    pub fn iter(&self) -> impl Iterator<Item = (SlotHandle, &T)> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.occupied)
            .map(|(index, slot)| {
                (
                    SlotHandle {
                        index: index as u32,
                        generation: slot.generation,
                    },
                    &slot.value,
                )
            })
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (SlotHandle, &mut T)> {
        self.slots
            .iter_mut()
            .enumerate()
            .filter(|(_, slot)| slot.occupied)
            .map(|(index, slot)| {
                (
                    SlotHandle {
                        index: index as u32,
                        generation: slot.generation,
                    },
                    &mut slot.value,
                )
            })
    }

    /// Occupied handles, in slot order.
    pub fn handles(&self) -> Vec<SlotHandle> {
        self.iter().map(|(handle, _)| handle).collect()
    }

    /// Handle of the occupant at `index`, if any. Lets callers walk the pool by index
    /// while mutating it, without collecting handles first.
    pub fn handle_at(&self, index: usize) -> Option<SlotHandle> {
        self.slots
            .get(index)
            .filter(|slot| slot.occupied)
            .map(|slot| SlotHandle {
                index: index as u32,
                generation: slot.generation,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(capacity: usize) -> SlotPool<u32> {
        SlotPool::with_capacity(capacity, || Ok(0)).unwrap()
    }

    #[test]
    fn test_allocate_until_full() {
        let mut pool = pool(3);
        for _ in 0..3 {
            assert!(pool.allocate().is_some());
        }
        assert!(pool.allocate().is_none());
        assert_eq!(pool.len(), 3);
    }

    #[test]
    fn test_stale_handle_rejected_after_reuse() {
        let mut pool = pool(1);
        let (first, value) = pool.allocate().unwrap();
        *value = 7;
        assert!(pool.release(first).is_some());

        let (second, _) = pool.allocate().unwrap();
        assert_eq!(first.index(), second.index());
        assert_ne!(first, second);
        assert!(pool.get(first).is_none());
        assert!(pool.release(first).is_none());
        assert!(pool.get(second).is_some());
    }

    #[test]
    fn test_release_keeps_value_for_reuse() {
        let mut pool = pool(2);
        let (handle, value) = pool.allocate().unwrap();
        *value = 42;
        assert_eq!(pool.release(handle).copied(), Some(42));
        let (_, recycled) = pool.allocate().unwrap();
        assert_eq!(*recycled, 42);
    }

    #[test]
    fn test_value_at_ignores_occupancy() {
        let mut pool = pool(2);
        let (handle, value) = pool.allocate().unwrap();
        *value = 5;
        pool.release(handle);
        assert_eq!(pool.value_at_mut(0).copied(), Some(5));
        assert!(pool.value_at_mut(2).is_none());
    }

    #[test]
    fn test_iteration_skips_vacant_slots() {
        let mut pool = pool(4);
        let a = pool.allocate().unwrap().0;
        let b = pool.allocate().unwrap().0;
        let c = pool.allocate().unwrap().0;
        pool.release(b);
        assert_eq!(pool.handles(), vec![a, c]);
        assert_eq!(pool.handle_at(1), None);
        assert_eq!(pool.handle_at(2), Some(c));
        for (_, value) in pool.iter_mut() {
            *value += 1;
        }
        assert_eq!(pool.get(a), Some(&1));
    }

    #[test]
    fn test_handle_display() {
        let mut pool = pool(1);
        let h = pool.allocate().unwrap().0;
        assert_eq!(h.to_string(), "0v0");
    }
}
