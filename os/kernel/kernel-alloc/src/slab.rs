//! # Slab Caches
//!
//! Fixed-size chunks carved from kernel heap blocks of `chunk_count` chunks.
//! Free chunks form an intrusive stack; a fresh block is taken from the heap
//! only when the stack is empty. Blocks are never returned to the heap.

use crate::heap::{GRANULE, HeapBackend, KernelHeap};
use core::ptr::null_mut;
use kernel_sync::SpinLock;
use log::trace;

struct FreeChunk {
    next: *mut FreeChunk,
}

struct SlabState {
    free: *mut FreeChunk,
    blocks: usize,
}

unsafe impl Send for SlabState {}

pub struct SlabCache<'h, B> {
    heap: &'h KernelHeap<B>,
    stride: usize,
    chunk_count: usize,
    state: SpinLock<SlabState>,
}

impl<'h, B: HeapBackend> SlabCache<'h, B> {
    /// A cache of `chunk_size` byte chunks, `chunk_count` per heap block.
    ///
    /// Returns `None` if either parameter is zero.
    pub fn new(heap: &'h KernelHeap<B>, chunk_size: usize, chunk_count: usize) -> Option<Self> {
        if chunk_size == 0 || chunk_count == 0 {
            return None;
        }
        let stride = chunk_size
            .max(size_of::<FreeChunk>())
            .checked_next_multiple_of(GRANULE)?;
        stride.checked_mul(chunk_count)?;

        Some(Self {
            heap,
            stride,
            chunk_count,
            state: SpinLock::new(SlabState {
                free: null_mut(),
                blocks: 0,
            }),
        })
    }

    /// Distance between neighbouring chunks of a block.
    #[must_use]
    pub const fn stride(&self) -> usize {
        self.stride
    }

    /// Heap blocks taken so far.
    pub fn blocks(&self) -> usize {
        self.state.lock().blocks
    }

    /// One chunk, 16-byte aligned, or null if the heap is exhausted.
    pub fn allocate(&self) -> *mut u8 {
        let mut state = self.state.lock();
        if state.free.is_null() && !self.refill(&mut state) {
            return null_mut();
        }

        let chunk = state.free;
        state.free = unsafe { (*chunk).next };
        chunk.cast()
    }

    /// Push a chunk back onto the free stack. Null is ignored.
    ///
    /// # Safety
    /// `ptr` is null or came from [`allocate`](Self::allocate) of this cache
    /// and is not used afterwards.
    pub unsafe fn free(&self, ptr: *mut u8) {
        if ptr.is_null() {
            return;
        }
        let chunk = ptr.cast::<FreeChunk>();
        let mut state = self.state.lock();
        unsafe { chunk.write(FreeChunk { next: state.free }) };
        state.free = chunk;
    }

    fn refill(&self, state: &mut SlabState) -> bool {
        let block = self.heap.allocate(self.stride * self.chunk_count);
        if block.is_null() {
            return false;
        }

        let mut next = null_mut();
        for index in (0..self.chunk_count).rev() {
            let chunk = block.wrapping_add(index * self.stride).cast::<FreeChunk>();
            unsafe { chunk.write(FreeChunk { next }) };
            next = chunk;
        }
        state.free = next;
        state.blocks += 1;
        trace!("slab cache of {} byte chunks took block {block:p}", self.stride);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::HeapGrowError;
    use kernel_memory_addresses::VirtualAddress;
    use std::cell::Cell;

    const REGION: usize = 8 * 4096;

    #[repr(C, align(4096))]
    struct Region([u8; REGION]);

    struct Budget {
        left: Cell<u64>,
    }

    impl HeapBackend for Budget {
        fn grow(&self, _at: VirtualAddress, len: u64) -> Result<(), HeapGrowError> {
            if len > self.left.get() {
                return Err(HeapGrowError::OutOfMemory);
            }
            self.left.set(self.left.get() - len);
            Ok(())
        }
    }

    fn heap(region: &mut Region, budget: u64) -> KernelHeap<Budget> {
        KernelHeap::new(
            VirtualAddress::from_ptr(region.0.as_mut_ptr()),
            REGION as u64,
            Budget {
                left: Cell::new(budget),
            },
        )
    }

    #[test]
    fn rejects_empty_geometry() {
        let mut region = Box::new(Region([0; REGION]));
        let heap = heap(&mut region, REGION as u64);
        assert!(SlabCache::new(&heap, 0, 4).is_none());
        assert!(SlabCache::new(&heap, 24, 0).is_none());
        assert_eq!(SlabCache::new(&heap, 24, 4).unwrap().stride(), 32);
        assert_eq!(SlabCache::new(&heap, 1, 4).unwrap().stride(), GRANULE);
    }

    #[test]
    fn grows_one_block_at_a_time() {
        let mut region = Box::new(Region([0; REGION]));
        let heap = heap(&mut region, REGION as u64);
        let cache = SlabCache::new(&heap, 48, 4).unwrap();

        let chunks: Vec<_> = (0..5).map(|_| cache.allocate()).collect();
        assert!(chunks.iter().all(|c| !c.is_null() && c.addr() % GRANULE == 0));
        assert_eq!(cache.blocks(), 2);
        for pair in chunks[..4].windows(2) {
            assert_eq!(pair[1].addr() - pair[0].addr(), 48);
        }
    }

    #[test]
    fn freed_chunks_are_reused_first() {
        let mut region = Box::new(Region([0; REGION]));
        let heap = heap(&mut region, REGION as u64);
        let cache = SlabCache::new(&heap, 64, 2).unwrap();

        let a = cache.allocate();
        let b = cache.allocate();
        unsafe {
            cache.free(a);
            cache.free(b);
            cache.free(null_mut());
        }
        assert_eq!(cache.allocate(), b);
        assert_eq!(cache.allocate(), a);
        assert_eq!(cache.blocks(), 1);
    }

    #[test]
    fn exhausted_heap_yields_null() {
        let mut region = Box::new(Region([0; REGION]));
        let heap = heap(&mut region, 4096);
        let cache = SlabCache::new(&heap, 1024, 3).unwrap();

        assert!(!cache.allocate().is_null());
        assert!(!cache.allocate().is_null());
        assert!(!cache.allocate().is_null());
        assert!(cache.allocate().is_null());
        assert_eq!(cache.blocks(), 1);
    }
}
