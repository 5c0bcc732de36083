//! # Kernel Heap
//!
//! A first-fit allocator over a contiguous, growable block chain. Every block
//! starts with a [`BlockHeader`]; blocks are laid out back to back from the
//! heap start to the current top, and the header list mirrors that order.
//!
//! ```text
//! start                                                      top      start + max
//! ┌────────┬──────────┬────────┬───────┬────────┬──────────┐          ┐
//! │ header │ payload  │ header │ free  │ header │ payload  │ (unbacked)│
//! └────────┴──────────┴────────┴───────┴────────┴──────────┘          ┘
//! ```
//!
//! ## Invariants
//! - Payloads are multiples of 16 bytes and 16-byte aligned.
//! - No two neighbouring blocks are both free.
//! - The last block ends exactly at `top`; `[start, top)` is backed memory.
//!
//! The heap grows by whole pages through a [`HeapBackend`]. Growth runs with
//! the heap lock held, so a second allocating CPU waits instead of growing
//! the heap concurrently.

use core::alloc::{GlobalAlloc, Layout};
use core::ptr::{self, null_mut};
use kernel_info::memory::PAGE_SIZE;
use kernel_memory_addresses::VirtualAddress;
use kernel_sync::SpinLock;
use kernel_vmem::MapError;
use log::{debug, trace};

/// Allocation granule; sizes are rounded up to it and payloads aligned to it.
pub const GRANULE: usize = 16;

#[allow(clippy::cast_possible_truncation)]
const PAGE: usize = PAGE_SIZE as usize;

#[repr(C, align(16))]
struct BlockHeader {
    /// Payload bytes following the header.
    size: usize,
    next: *mut BlockHeader,
    prev: *mut BlockHeader,
    free: bool,
}

const HEADER: usize = size_of::<BlockHeader>();

/// Smallest excess worth splitting off as a block of its own.
const MIN_SPLIT: usize = HEADER + GRANULE;

const _: () = assert!(HEADER.is_multiple_of(GRANULE));

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum HeapGrowError {
    #[error("heap would grow past its reserved region")]
    RegionExhausted,
    #[error("out of physical memory")]
    OutOfMemory,
    #[error(transparent)]
    Map(#[from] MapError),
}

/// Backs heap growth with memory.
pub trait HeapBackend {
    /// Make `[at, at + len)` readable and writable. `at` and `len` are page
    /// aligned, and `at` is the previous end of the heap.
    ///
    /// # Errors
    /// Any failure leaves the range unusable; the allocation that needed it
    /// returns null.
    fn grow(&self, at: VirtualAddress, len: u64) -> Result<(), HeapGrowError>;
}

impl<B: HeapBackend + ?Sized> HeapBackend for &B {
    fn grow(&self, at: VirtualAddress, len: u64) -> Result<(), HeapGrowError> {
        (**self).grow(at, len)
    }
}

const fn round_up(size: usize) -> Option<usize> {
    size.checked_next_multiple_of(GRANULE)
}

fn payload(block: *mut BlockHeader) -> *mut u8 {
    block.cast::<u8>().wrapping_add(HEADER)
}

#[allow(clippy::cast_ptr_alignment)]
fn header_after(block: *mut BlockHeader, offset: usize) -> *mut BlockHeader {
    block.cast::<u8>().wrapping_add(offset).cast()
}

#[allow(clippy::cast_ptr_alignment)]
fn header_of(ptr: *mut u8) -> *mut BlockHeader {
    ptr.wrapping_sub(HEADER).cast()
}

/// The block chain. Every header pointer reachable from `head` lies in
/// `[start, top)`, which the backend has made usable.
struct BlockChain {
    start: usize,
    limit: usize,
    top: usize,
    head: *mut BlockHeader,
    tail: *mut BlockHeader,
}

unsafe impl Send for BlockChain {}

impl BlockChain {
    /// Extend `[start, top)` by `bytes`, rounded up to pages.
    fn grow(&mut self, backend: &impl HeapBackend, bytes: usize) -> Result<(usize, usize), HeapGrowError> {
        let len = bytes
            .checked_next_multiple_of(PAGE)
            .ok_or(HeapGrowError::RegionExhausted)?;
        if len > self.limit - self.top {
            return Err(HeapGrowError::RegionExhausted);
        }

        let at = self.top;
        backend.grow(VirtualAddress::new(at as u64), len as u64)?;
        self.top += len;
        trace!("heap grown by {len:#x} bytes to {:#x}", self.top);
        Ok((at, len))
    }

    fn grow_or_log(&mut self, backend: &impl HeapBackend, bytes: usize) -> Option<usize> {
        match self.grow(backend, bytes) {
            Ok((_, len)) => Some(len),
            Err(e) => {
                debug!("heap growth by {bytes:#x} bytes failed: {e}");
                None
            }
        }
    }

    fn contains(&self, ptr: *mut u8) -> bool {
        let address = ptr.addr();
        address >= self.start + HEADER && address < self.top && address.is_multiple_of(GRANULE)
    }

    /// First fit for a payload of `size` bytes, a multiple of [`GRANULE`].
    fn allocate(&mut self, size: usize, backend: &impl HeapBackend) -> *mut u8 {
        let mut block = self.head;
        while !block.is_null() {
            unsafe {
                if (*block).free {
                    if (*block).size >= size {
                        return self.claim(block, size);
                    }
                    if (*block).next.is_null() {
                        let Some(len) = self.grow_or_log(backend, size - (*block).size) else {
                            return null_mut();
                        };
                        (*block).size += len;
                        return self.claim(block, size);
                    }
                }
                block = (*block).next;
            }
        }
        self.append(size, backend)
    }

    fn claim(&mut self, block: *mut BlockHeader, size: usize) -> *mut u8 {
        self.split(block, size);
        unsafe { (*block).free = false };
        payload(block)
    }

    /// Grow the heap and put a new used block at the tail.
    fn append(&mut self, size: usize, backend: &impl HeapBackend) -> *mut u8 {
        let Some(total) = size.checked_add(HEADER) else {
            return null_mut();
        };
        let Ok((at, len)) = self.grow(backend, total).inspect_err(|e| {
            debug!("heap growth by {total:#x} bytes failed: {e}");
        }) else {
            return null_mut();
        };

        let block: *mut BlockHeader = VirtualAddress::new(at as u64).as_ptr();
        unsafe {
            block.write(BlockHeader {
                size: len - HEADER,
                next: null_mut(),
                prev: self.tail,
                free: false,
            });
            if self.tail.is_null() {
                self.head = block;
            } else {
                (*self.tail).next = block;
            }
        }
        self.tail = block;
        self.split(block, size);
        payload(block)
    }

    /// Cut `block` down to `size` payload bytes if the excess can hold a block.
    ///
    /// The excess becomes a free block, merged with a free successor.
    fn split(&mut self, block: *mut BlockHeader, size: usize) {
        unsafe {
            let excess = (*block).size - size;
            if excess < MIN_SPLIT {
                return;
            }

            let rest = header_after(block, HEADER + size);
            rest.write(BlockHeader {
                size: excess - HEADER,
                next: (*block).next,
                prev: block,
                free: true,
            });
            (*block).next = rest;
            (*block).size = size;

            let next = (*rest).next;
            if next.is_null() {
                self.tail = rest;
            } else {
                (*next).prev = rest;
                if (*next).free {
                    self.absorb(rest, next);
                }
            }
        }
    }

    /// Fold `second`, the block right after `first`, into `first`.
    fn absorb(&mut self, first: *mut BlockHeader, second: *mut BlockHeader) {
        unsafe {
            (*first).size += HEADER + (*second).size;
            (*first).next = (*second).next;
            if (*first).next.is_null() {
                self.tail = first;
            } else {
                (*(*first).next).prev = first;
            }
        }
    }

    fn free(&mut self, ptr: *mut u8) {
        if !self.contains(ptr) {
            return;
        }

        let block = header_of(ptr);
        unsafe {
            assert!(!(*block).free, "double free of heap block {:#x}", ptr.addr());
            (*block).free = true;

            let next = (*block).next;
            if !next.is_null() && (*next).free {
                self.absorb(block, next);
            }
            let prev = (*block).prev;
            if !prev.is_null() && (*prev).free {
                self.absorb(prev, block);
            }
        }
    }

    /// Allocate with `align > GRANULE` by over-allocating and returning the
    /// front padding as a free block.
    fn allocate_aligned(&mut self, size: usize, align: usize, backend: &impl HeapBackend) -> *mut u8 {
        let Some(request) = size
            .checked_add(align)
            .and_then(|r| r.checked_add(MIN_SPLIT))
        else {
            return null_mut();
        };
        let ptr = self.allocate(request, backend);
        if ptr.is_null() {
            return ptr;
        }

        let block = header_of(ptr);
        let address = ptr.addr();
        if address.is_multiple_of(align) {
            self.split(block, size);
            return ptr;
        }

        let lead = (address + MIN_SPLIT).next_multiple_of(align) - address;
        let moved = header_after(block, lead);
        unsafe {
            moved.write(BlockHeader {
                size: (*block).size - lead,
                next: (*block).next,
                prev: block,
                free: false,
            });
            if (*moved).next.is_null() {
                self.tail = moved;
            } else {
                (*(*moved).next).prev = moved;
            }
            (*block).next = moved;
            (*block).size = lead - HEADER;
            (*block).free = true;

            let prev = (*block).prev;
            if !prev.is_null() && (*prev).free {
                self.absorb(prev, block);
            }
        }
        self.split(moved, size);
        payload(moved)
    }

    fn reallocate(&mut self, ptr: *mut u8, size: usize, backend: &impl HeapBackend) -> *mut u8 {
        if !self.contains(ptr) {
            return null_mut();
        }

        let block = header_of(ptr);
        unsafe {
            if (*block).size >= size {
                self.split(block, size);
                return ptr;
            }

            let next = (*block).next;
            if !next.is_null() && (*next).free && (*block).size + HEADER + (*next).size >= size {
                self.absorb(block, next);
                self.split(block, size);
                return ptr;
            }

            if next.is_null() {
                let Some(len) = self.grow_or_log(backend, size - (*block).size) else {
                    return null_mut();
                };
                (*block).size += len;
                self.split(block, size);
                return ptr;
            }

            let old = (*block).size;
            let moved = self.allocate(size, backend);
            if !moved.is_null() {
                ptr::copy_nonoverlapping(ptr, moved, old.min(size));
                self.free(ptr);
            }
            moved
        }
    }
}

/// The kernel heap over `[start, start + max_size)`.
pub struct KernelHeap<B> {
    chain: SpinLock<BlockChain>,
    backend: B,
}

impl<B: HeapBackend> KernelHeap<B> {
    /// An empty heap; nothing is backed until the first allocation.
    ///
    /// `start` must be page aligned.
    #[allow(clippy::cast_possible_truncation)]
    pub const fn new(start: VirtualAddress, max_size: u64, backend: B) -> Self {
        let start = start.as_u64() as usize;
        Self {
            chain: SpinLock::new(BlockChain {
                start,
                limit: start + max_size as usize,
                top: start,
                head: null_mut(),
                tail: null_mut(),
            }),
            backend,
        }
    }

    #[inline]
    pub const fn backend(&self) -> &B {
        &self.backend
    }

    /// Bytes between the heap start and its current top.
    pub fn committed_bytes(&self) -> usize {
        let chain = self.chain.lock();
        chain.top - chain.start
    }

    /// At least `size` bytes, 16-byte aligned. Null for `size == 0` or when
    /// the heap cannot grow.
    pub fn allocate(&self, size: usize) -> *mut u8 {
        match round_up(size) {
            Some(size) if size > 0 => self.chain.lock().allocate(size, &self.backend),
            _ => null_mut(),
        }
    }

    /// Like [`allocate`](Self::allocate), with the memory zeroed.
    pub fn allocate_zeroed(&self, size: usize) -> *mut u8 {
        let ptr = self.allocate(size);
        if !ptr.is_null() {
            unsafe { ptr::write_bytes(ptr, 0, size) };
        }
        ptr
    }

    /// At least `size` bytes aligned to `align`, a power of two.
    pub fn allocate_aligned(&self, size: usize, align: usize) -> *mut u8 {
        if !align.is_power_of_two() {
            return null_mut();
        }
        if align <= GRANULE {
            return self.allocate(size);
        }
        match round_up(size) {
            Some(size) if size > 0 => self
                .chain
                .lock()
                .allocate_aligned(size, align, &self.backend),
            _ => null_mut(),
        }
    }

    /// Resize the allocation at `ptr` to `size` bytes, in place if possible.
    ///
    /// A null `ptr` allocates; a zero `size` frees and returns null. On
    /// failure null is returned and the old allocation is untouched.
    ///
    /// # Safety
    /// `ptr` is null or a live allocation of this heap.
    pub unsafe fn reallocate(&self, ptr: *mut u8, size: usize) -> *mut u8 {
        if ptr.is_null() {
            return self.allocate(size);
        }
        if size == 0 {
            unsafe { self.free(ptr) };
            return null_mut();
        }
        match round_up(size) {
            Some(size) => self.chain.lock().reallocate(ptr, size, &self.backend),
            None => null_mut(),
        }
    }

    /// Return an allocation. Null and pointers outside the heap are ignored.
    ///
    /// # Safety
    /// A non-null `ptr` inside the heap must come from this heap.
    ///
    /// # Panics
    /// If the block is already free.
    pub unsafe fn free(&self, ptr: *mut u8) {
        self.chain.lock().free(ptr);
    }
}

unsafe impl<B: HeapBackend> GlobalAlloc for KernelHeap<B> {
    /// # Safety
    /// The `GlobalAlloc` contract applies. Null is returned on exhaustion.
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        self.allocate_aligned(layout.size(), layout.align())
    }

    /// # Safety
    /// `ptr` was returned by this allocator for `layout`.
    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        unsafe { self.free(ptr) };
    }

    /// # Safety
    /// The `GlobalAlloc` contract applies.
    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        let ptr = unsafe { self.alloc(layout) };
        if !ptr.is_null() {
            unsafe { ptr::write_bytes(ptr, 0, layout.size()) };
        }
        ptr
    }

    /// # Safety
    /// The `GlobalAlloc` contract applies.
    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        if layout.align() <= GRANULE {
            return unsafe { self.reallocate(ptr, new_size) };
        }

        let moved = self.allocate_aligned(new_size, layout.align());
        if !moved.is_null() {
            unsafe {
                ptr::copy_nonoverlapping(ptr, moved, layout.size().min(new_size));
                self.free(ptr);
            }
        }
        moved
    }
}
