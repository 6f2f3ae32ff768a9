//! Fixed-element-size memory pool shared by the IPset trie and the Bag
//! radix/red-black trees (spec §4.4).
//!
//! Elements are allocated in chunks and addressed by index rather than by
//! pointer, so growing the backing storage never invalidates outstanding
//! handles — the arena-of-indices replacement for the original's raw
//! `union { child*; leaf* }` pointer trees (see DESIGN.md REDESIGN FLAGS).
//! A free list recycles freed slots; the pool itself never shrinks.

/// An index into a [`Pool`]. `u32::MAX` is reserved as the "absent" sentinel
/// (mirrored by `NONE`), so a pool can never legitimately hold that many
/// live elements.
pub type PoolIndex = u32;

/// Sentinel meaning "no element" — used in place of a null child pointer.
pub const NONE: PoolIndex = u32::MAX;

/// Chunk size for IPset trie node/leaf pools (spec §4.4).
pub const TRIE_CHUNK: usize = 256;

/// Chunk size for wide-key Bag red-black tree node pools (spec §4.4).
pub const RBTREE_CHUNK: usize = 524_288;

enum Slot<T> {
    Occupied(T),
    Free { next: PoolIndex },
}

/// A chunked, free-list-backed pool of fixed-size elements.
pub struct Pool<T> {
    chunk_size: usize,
    slots: Vec<Slot<T>>,
    free_head: PoolIndex,
    live: usize,
}

impl<T> Pool<T> {
    pub fn new(chunk_size: usize) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
            slots: Vec::new(),
            free_head: NONE,
            live: 0,
        }
    }

    /// Number of currently occupied slots.
    #[inline]
    pub fn live_count(&self) -> usize {
        self.live
    }

    /// Allocate space for one element, growing the pool by a full chunk if
    /// the free list is empty. Returns `None` only if the index space
    /// itself would be exhausted (never happens in practice below 2^32
    /// elements).
    pub fn alloc(&mut self, value: T) -> Option<PoolIndex> {
        if self.free_head == NONE {
            self.grow()?;
        }
        let idx = self.free_head;
        let next = match &self.slots[idx as usize] {
            Slot::Free { next } => *next,
            Slot::Occupied(_) => unreachable!("free list points at occupied slot"),
        };
        self.free_head = next;
        self.slots[idx as usize] = Slot::Occupied(value);
        self.live += 1;
        Some(idx)
    }

    fn grow(&mut self) -> Option<()> {
        let start = self.slots.len();
        if start.checked_add(self.chunk_size)? >= NONE as usize {
            return None;
        }
        for i in 0..self.chunk_size {
            let this = start + i;
            let next = if i + 1 == self.chunk_size {
                NONE
            } else {
                (this + 1) as PoolIndex
            };
            self.slots.push(Slot::Free { next: next });
        }
        self.free_head = start as PoolIndex;
        Some(())
    }

    #[inline]
    pub fn get(&self, idx: PoolIndex) -> &T {
        match &self.slots[idx as usize] {
            Slot::Occupied(v) => v,
            Slot::Free { .. } => panic!("pool index {idx} refers to a freed slot"),
        }
    }

    #[inline]
    pub fn get_mut(&mut self, idx: PoolIndex) -> &mut T {
        match &mut self.slots[idx as usize] {
            Slot::Occupied(v) => v,
            Slot::Free { .. } => panic!("pool index {idx} refers to a freed slot"),
        }
    }

    /// Return a slot to the free list. The stored value is dropped.
    pub fn free(&mut self, idx: PoolIndex) {
        let old = std::mem::replace(
            &mut self.slots[idx as usize],
            Slot::Free { next: self.free_head },
        );
        debug_assert!(matches!(old, Slot::Occupied(_)), "double free at {idx}");
        self.free_head = idx;
        self.live -= 1;
    }

    pub fn clear(&mut self) {
        self.slots.clear();
        self.free_head = NONE;
        self.live = 0;
    }
}

impl<T: Clone> Clone for Pool<T> {
    fn clone(&self) -> Self {
        let slots = self
            .slots
            .iter()
            .map(|s| match s {
                Slot::Occupied(v) => Slot::Occupied(v.clone()),
                Slot::Free { next } => Slot::Free { next: *next },
            })
            .collect();
        Self {
            chunk_size: self.chunk_size,
            slots,
            free_head: self.free_head,
            live: self.live,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_free_reuse() {
        let mut pool: Pool<u32> = Pool::new(4);
        let a = pool.alloc(1).unwrap();
        let b = pool.alloc(2).unwrap();
        assert_eq!(pool.live_count(), 2);
        pool.free(a);
        assert_eq!(pool.live_count(), 1);
        let c = pool.alloc(3).unwrap();
        assert_eq!(c, a, "freed slot should be recycled before growing");
        assert_eq!(*pool.get(b), 2);
        assert_eq!(*pool.get(c), 3);
    }

    #[test]
    fn grows_across_chunk_boundary() {
        let mut pool: Pool<u8> = Pool::new(2);
        let idxs: Vec<_> = (0..10).map(|i| pool.alloc(i).unwrap()).collect();
        assert_eq!(pool.live_count(), 10);
        for (i, idx) in idxs.iter().enumerate() {
            assert_eq!(*pool.get(*idx), i as u8);
        }
    }
}
