//! Slab of fixed-size slots carved out of supplier pages.
//!
//! Slots are addressed by `u32` index so tree links stay small and never
//! dangle across chunk growth. Freed slots are threaded onto an intrusive
//! free list. Chunks go back to the page supplier when the arena drops.

#![allow(unsafe_code)]

use std::marker::PhantomData;
use std::mem::size_of;

use crate::page_supplier::{PageSupplier, fatal_page_error, global_page_supplier};

/// Sentinel index for "no slot".
pub(crate) const NIL: u32 = u32::MAX;

#[derive(Clone, Copy)]
enum Slot<T: Copy> {
    Occupied(T),
    Vacant { next_free: u32 },
}

pub(crate) struct NodeArena<T: Copy> {
    supplier: &'static PageSupplier,
    /// Base address of each chunk.
    chunks: Vec<usize>,
    chunk_pages: usize,
    per_chunk: usize,
    /// Slots ever handed out; indices below this are initialized.
    high_water: usize,
    free_head: u32,
    live: usize,
    _marker: PhantomData<T>,
}

impl<T: Copy> NodeArena<T> {
    pub(crate) fn new() -> Self {
        Self::with_supplier(global_page_supplier())
    }

    pub(crate) fn with_supplier(supplier: &'static PageSupplier) -> Self {
        let page = supplier.page_size();
        let slot = size_of::<Slot<T>>().max(1);
        let chunk_pages = slot.div_ceil(page).max(1);
        let per_chunk = chunk_pages * page / slot;
        Self {
            supplier,
            chunks: Vec::new(),
            chunk_pages,
            per_chunk,
            high_water: 0,
            free_head: NIL,
            live: 0,
            _marker: PhantomData,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.live
    }

    pub(crate) fn alloc(&mut self, value: T) -> u32 {
        let idx = if self.free_head != NIL {
            let idx = self.free_head;
            self.free_head = match self.slot(idx) {
                Slot::Vacant { next_free } => *next_free,
                Slot::Occupied(_) => panic!("node arena free list points at a live slot"),
            };
            idx
        } else {
            if self.high_water == self.chunks.len() * self.per_chunk {
                self.grow();
            }
            let idx = self.high_water;
            if idx >= NIL as usize {
                fatal_page_error(&crate::error::PageError::Exhausted {
                    pages: self.chunks.len() * self.chunk_pages,
                    errno: libc::ENOMEM,
                });
            }
            self.high_water += 1;
            idx as u32
        };
        // SAFETY: idx < high_water, so it addresses a slot inside a mapped chunk.
        unsafe { self.slot_ptr(idx).write(Slot::Occupied(value)) };
        self.live += 1;
        idx
    }

    pub(crate) fn free(&mut self, idx: u32) {
        debug_assert!(matches!(self.slot(idx), Slot::Occupied(_)));
        let next_free = self.free_head;
        // SAFETY: idx addresses an initialized slot.
        unsafe { self.slot_ptr(idx).write(Slot::Vacant { next_free }) };
        self.free_head = idx;
        self.live -= 1;
    }

    pub(crate) fn get(&self, idx: u32) -> &T {
        match self.slot(idx) {
            Slot::Occupied(value) => value,
            Slot::Vacant { .. } => panic!("node arena read of vacant slot {idx}"),
        }
    }

    pub(crate) fn get_mut(&mut self, idx: u32) -> &mut T {
        assert!((idx as usize) < self.high_water, "node index {idx} out of range");
        // SAFETY: idx < high_water and we hold &mut self.
        match unsafe { &mut *self.slot_ptr(idx) } {
            Slot::Occupied(value) => value,
            Slot::Vacant { .. } => panic!("node arena write to vacant slot {idx}"),
        }
    }

    /// Drop every slot but keep the chunks for reuse.
    pub(crate) fn clear(&mut self) {
        self.high_water = 0;
        self.free_head = NIL;
        self.live = 0;
    }

    fn slot(&self, idx: u32) -> &Slot<T> {
        assert!((idx as usize) < self.high_water, "node index {idx} out of range");
        // SAFETY: idx < high_water, so the slot was written by alloc/free.
        unsafe { &*self.slot_ptr(idx) }
    }

    fn slot_ptr(&self, idx: u32) -> *mut Slot<T> {
        let idx = idx as usize;
        let chunk = self.chunks[idx / self.per_chunk];
        (chunk as *mut Slot<T>).wrapping_add(idx % self.per_chunk)
    }

    fn grow(&mut self) {
        match self.supplier.acquire_pages(self.chunk_pages) {
            Ok(addr) => self.chunks.push(addr),
            Err(err) => fatal_page_error(&err),
        }
    }
}

impl<T: Copy> Drop for NodeArena<T> {
    fn drop(&mut self) {
        for &chunk in &self.chunks {
            self.supplier.release_pages(chunk, self.chunk_pages);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaked_supplier() -> &'static PageSupplier {
        Box::leak(Box::new(PageSupplier::new()))
    }

    #[test]
    fn alloc_get_free_reuses_slots() {
        let mut arena: NodeArena<(usize, usize)> = NodeArena::with_supplier(leaked_supplier());
        let a = arena.alloc((1, 2));
        let b = arena.alloc((3, 4));
        assert_eq!(*arena.get(a), (1, 2));
        assert_eq!(*arena.get(b), (3, 4));
        arena.free(a);
        assert_eq!(arena.len(), 1);
        let c = arena.alloc((5, 6));
        assert_eq!(c, a, "freed slot is recycled first");
        arena.get_mut(c).0 = 50;
        assert_eq!(*arena.get(c), (50, 6));
    }

    #[test]
    fn grows_across_chunks() {
        let supplier = leaked_supplier();
        let mut arena: NodeArena<[u64; 8]> = NodeArena::with_supplier(supplier);
        let n = arena.per_chunk * 3 + 1;
        let ids: Vec<u32> = (0..n).map(|i| arena.alloc([i as u64; 8])).collect();
        assert_eq!(arena.chunks.len(), 4);
        for (i, id) in ids.iter().enumerate() {
            assert_eq!(arena.get(*id)[7], i as u64);
        }
    }

    #[test]
    fn drop_returns_chunks_to_supplier() {
        let supplier = leaked_supplier();
        {
            let mut arena: NodeArena<u64> = NodeArena::with_supplier(supplier);
            arena.alloc(1);
        }
        assert_eq!(supplier.stats().released_pages, 1);
    }
}
