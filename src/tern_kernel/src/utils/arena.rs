//! Generation-checked object arenas.
//!
//! Control blocks live in per-kind arenas instead of being linked through
//! raw pointers. A public handle is an `{index, generation}` pair; the
//! generation is bumped on every insertion, so a handle to a deleted object
//! keeps failing the lookup even after its slot has been reused. Kernel
//! internals that maintain their own link invariants address slots by bare
//! index.
use slab::Slab;

/// An untyped handle into an [`Arena`]. The public `*Id` newtypes wrap
/// this.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RawHandle {
    pub(crate) index: u32,
    pub(crate) gen: u32,
}

struct Entry<T> {
    gen: u32,
    value: T,
}

pub(crate) struct Arena<T> {
    slab: Slab<Entry<T>>,
    /// Bumped on every insertion; generation 0 is never issued so a
    /// zeroed handle is always stale.
    next_gen: u32,
}

impl<T> Arena<T> {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            slab: Slab::with_capacity(capacity),
            next_gen: 1,
        }
    }

    pub fn insert(&mut self, value: T) -> RawHandle {
        let gen = self.next_gen;
        self.next_gen = self.next_gen.wrapping_add(1).max(1);
        let index = self.slab.insert(Entry { gen, value }) as u32;
        RawHandle { index, gen }
    }

    pub fn remove(&mut self, handle: RawHandle) -> Option<T> {
        match self.slab.get(handle.index as usize) {
            Some(e) if e.gen == handle.gen => Some(self.slab.remove(handle.index as usize).value),
            _ => None,
        }
    }

    pub fn get(&self, handle: RawHandle) -> Option<&T> {
        self.slab
            .get(handle.index as usize)
            .filter(|e| e.gen == handle.gen)
            .map(|e| &e.value)
    }

    pub fn get_mut(&mut self, handle: RawHandle) -> Option<&mut T> {
        self.slab
            .get_mut(handle.index as usize)
            .filter(|e| e.gen == handle.gen)
            .map(|e| &mut e.value)
    }

    /// Look up a slot by bare index, bypassing the generation check.
    ///
    /// Only for kernel-internal links (ready lists, wait queues, held-mutex
    /// chains), which are unlinked before a slot is freed.
    ///
    /// # Panics
    ///
    /// Panics if the slot is vacant, which would indicate a broken link
    /// invariant.
    #[inline]
    pub fn by_index(&self, index: u32) -> &T {
        &self.slab[index as usize].value
    }

    /// Mutable variant of [`by_index`](Self::by_index).
    #[inline]
    pub fn by_index_mut(&mut self, index: u32) -> &mut T {
        &mut self.slab[index as usize].value
    }

    pub fn len(&self) -> usize {
        self.slab.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stale_handle_is_rejected_after_slot_reuse() {
        let mut arena = Arena::with_capacity(4);
        let a = arena.insert("a");
        assert_eq!(arena.get(a), Some(&"a"));
        assert_eq!(arena.remove(a), Some("a"));

        // The slab reuses the lowest vacant slot, so `b` lands on `a`'s
        // index with a fresh generation.
        let b = arena.insert("b");
        assert_eq!(b.index, a.index);
        assert_ne!(b.gen, a.gen);

        assert_eq!(arena.get(a), None);
        assert_eq!(arena.remove(a), None);
        assert_eq!(arena.get(b), Some(&"b"));
    }

    #[test]
    fn by_index_bypasses_generation() {
        let mut arena = Arena::with_capacity(2);
        let a = arena.insert(7u32);
        *arena.by_index_mut(a.index) += 1;
        assert_eq!(arena.get(a), Some(&8));
        assert_eq!(*arena.by_index(a.index), 8);
    }
}
