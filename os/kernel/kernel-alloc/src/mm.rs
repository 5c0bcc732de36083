//! # Memory Manager
//!
//! Ties the frame allocator, the page table manager, the dynamic region
//! allocator and the kernel heap together:
//!
//! ```text
//!             ┌──────────────┐      ┌──────────────────────┐
//!  heap ────► │ BackedMemory │ ───► │ PageTableManager     │ ───► frames
//!             └──────────────┘      └──────────────────────┘
//!  dynmap ──────────────────────────────────▲
//! ```
//!
//! Locks are only ever taken in the direction of the arrows.

use crate::dynmap::{DynMapError, DynamicRegionAllocator, InitError};
use crate::frame_alloc::{BitmapStorageTooSmall, FrameRun, LockedFrameAllocator, PoolId};
use crate::heap::{HeapBackend, HeapGrowError, KernelHeap};
use kernel_info::boot::BootMemory;
use kernel_info::memory::{
    DYNAMIC_MAX_SIZE, DYNAMIC_START, KERNEL_HEAP_MAX_SIZE, KERNEL_HEAP_START, PAGE_SIZE,
};
use kernel_memory_addresses::{PhysicalAddress, Size4K, VirtualAddress};
use kernel_vmem::{FrameAlloc, MapError, MemoryFlags, PageTableManager, TableAccess, UnmapError};
use log::{debug, info};

/// Page tables backed by the kernel frame allocator.
pub type KernelPageTables<'m, T> = PageTableManager<'m, T, LockedFrameAllocator<'m>>;

/// Flags of memory-mapped device registers.
pub const MMIO_FLAGS: MemoryFlags = MemoryFlags::WRITABLE
    .union(MemoryFlags::CACHE_DISABLE)
    .union(MemoryFlags::WRITE_THROUGH);

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum MemoryError {
    #[error("out of physical memory")]
    OutOfMemory,
    #[error("memory manager is already initialized")]
    AlreadyInitialized,
    #[error(transparent)]
    Map(#[from] MapError),
    #[error(transparent)]
    Unmap(#[from] UnmapError),
    #[error(transparent)]
    DynMap(#[from] DynMapError),
    #[error(transparent)]
    DynamicPool(#[from] InitError),
    #[error(transparent)]
    FrameBitmap(#[from] BitmapStorageTooSmall),
}

impl From<MemoryError> for HeapGrowError {
    fn from(e: MemoryError) -> Self {
        match e {
            MemoryError::Map(e) => Self::Map(e),
            _ => Self::OutOfMemory,
        }
    }
}

/// Virtual ranges the memory manager hands out.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct MemoryLayout {
    pub heap_start: VirtualAddress,
    pub heap_max_size: u64,
    pub dynamic_start: VirtualAddress,
    pub dynamic_size: u64,
}

impl MemoryLayout {
    /// The layout of the kernel address space.
    pub const KERNEL: Self = Self {
        heap_start: VirtualAddress::new(KERNEL_HEAP_START),
        heap_max_size: KERNEL_HEAP_MAX_SIZE,
        dynamic_start: VirtualAddress::new(DYNAMIC_START),
        dynamic_size: DYNAMIC_MAX_SIZE,
    };
}

/// Virtual memory at caller-chosen addresses, backed by individually
/// allocated frames.
pub struct BackedMemory<'m, T> {
    frames: &'m LockedFrameAllocator<'m>,
    tables: &'m KernelPageTables<'m, T>,
}

impl<'m, T: TableAccess> BackedMemory<'m, T> {
    pub const fn new(frames: &'m LockedFrameAllocator<'m>, tables: &'m KernelPageTables<'m, T>) -> Self {
        Self { frames, tables }
    }

    /// Back `[va, va + size)` (rounded up to pages) with fresh frames.
    ///
    /// The frames need not be physically contiguous. On failure every page
    /// mapped by this call is unmapped and its frame returned.
    ///
    /// # Errors
    /// - [`MapError::Unaligned`] if `va` is not page aligned.
    /// - [`MemoryError::OutOfMemory`] if frames run out.
    /// - [`MapError::AlreadyMapped`] if part of the range is mapped.
    pub fn allocate_memory(&self, va: VirtualAddress, size: u64, flags: MemoryFlags) -> Result<(), MemoryError> {
        if !va.is_aligned::<Size4K>() {
            return Err(MapError::Unaligned.into());
        }

        let pages = size.div_ceil(PAGE_SIZE);
        for page in 0..pages {
            let at = va + page * PAGE_SIZE;
            if let Err(e) = self.back_page(at, flags) {
                self.release(va, page);
                return Err(e);
            }
        }
        Ok(())
    }

    /// Unmap `[va, va + size)` and return its frames.
    ///
    /// # Errors
    /// [`UnmapError::Unaligned`] if `va` is not page aligned.
    ///
    /// # Panics
    /// If a page in the range is not mapped.
    pub fn free_memory(&self, va: VirtualAddress, size: u64) -> Result<(), MemoryError> {
        if !va.is_aligned::<Size4K>() {
            return Err(UnmapError::Unaligned.into());
        }
        self.release(va, size.div_ceil(PAGE_SIZE));
        Ok(())
    }

    fn back_page(&self, at: VirtualAddress, flags: MemoryFlags) -> Result<(), MemoryError> {
        let frame = self.frames.alloc_4k().ok_or(MemoryError::OutOfMemory)?;
        self.tables.map(at, frame.base(), flags).map_err(|e| {
            self.frames.free(frame.base(), PAGE_SIZE);
            MemoryError::from(e)
        })
    }

    fn release(&self, va: VirtualAddress, pages: u64) {
        for page in 0..pages {
            let at = va + page * PAGE_SIZE;
            let frame = self.tables.translate(at);
            if self.tables.unmap(at).is_ok()
                && let Some(frame) = frame
            {
                self.frames.free(frame, PAGE_SIZE);
            }
        }
    }
}

impl<T: TableAccess> HeapBackend for BackedMemory<'_, T> {
    fn grow(&self, at: VirtualAddress, len: u64) -> Result<(), HeapGrowError> {
        debug!("backing heap range {at}+{len:#x}");
        Ok(self.allocate_memory(at, len, MemoryFlags::WRITABLE)?)
    }
}

pub struct MemoryManager<'m, T> {
    layout: MemoryLayout,
    memory: BackedMemory<'m, T>,
    dynmap: DynamicRegionAllocator,
    heap: KernelHeap<BackedMemory<'m, T>>,
}

impl<'m, T: TableAccess> MemoryManager<'m, T> {
    pub const fn new(
        frames: &'m LockedFrameAllocator<'m>,
        tables: &'m KernelPageTables<'m, T>,
        layout: MemoryLayout,
    ) -> Self {
        Self {
            layout,
            memory: BackedMemory::new(frames, tables),
            dynmap: DynamicRegionAllocator::empty(),
            heap: KernelHeap::new(
                layout.heap_start,
                layout.heap_max_size,
                BackedMemory::new(frames, tables),
            ),
        }
    }

    /// Boot-time setup: take over physical memory, create the shared kernel
    /// page tables and open the dynamic pool.
    ///
    /// # Errors
    /// - [`MapError::OutOfMemory`] if the kernel page tables cannot be created.
    /// - [`MemoryError::DynamicPool`] if the pool or the initrd is misplaced.
    pub fn init(&self, boot: &BootMemory<'_>) -> Result<(), MemoryError> {
        self.memory.frames.init(boot);
        self.memory.tables.init_kernel_space()?;
        self.dynmap
            .init(self.layout.dynamic_start, self.layout.dynamic_size, boot.initrd)?;
        info!(
            "kernel heap at {} (up to {} MiB), {} KiB physical memory free",
            self.layout.heap_start,
            self.layout.heap_max_size >> 20,
            self.memory.frames.free_bytes() / 1024
        );
        Ok(())
    }

    #[inline]
    pub const fn layout(&self) -> &MemoryLayout {
        &self.layout
    }

    #[inline]
    pub const fn frames(&self) -> &'m LockedFrameAllocator<'m> {
        self.memory.frames
    }

    #[inline]
    pub const fn tables(&self) -> &'m KernelPageTables<'m, T> {
        self.memory.tables
    }

    #[inline]
    pub const fn dynmap(&self) -> &DynamicRegionAllocator {
        &self.dynmap
    }

    #[inline]
    pub const fn heap(&self) -> &KernelHeap<BackedMemory<'m, T>> {
        &self.heap
    }

    pub fn allocate_physical(&self, bytes: u64, pool: PoolId) -> Option<FrameRun> {
        self.frames().allocate(bytes, pool)
    }

    pub fn allocate_contiguous(&self, bytes: u64, align: u64, pool: PoolId) -> Option<FrameRun> {
        self.frames().allocate_contiguous(bytes, align, pool)
    }

    /// # Panics
    /// On a double free.
    pub fn free_physical(&self, address: PhysicalAddress, bytes: u64) {
        self.frames().free(address, bytes);
    }

    /// See [`BackedMemory::allocate_memory`].
    ///
    /// # Errors
    /// See [`BackedMemory::allocate_memory`].
    pub fn allocate_memory(&self, va: VirtualAddress, size: u64, flags: MemoryFlags) -> Result<(), MemoryError> {
        self.memory.allocate_memory(va, size, flags)
    }

    /// See [`BackedMemory::free_memory`].
    ///
    /// # Errors
    /// See [`BackedMemory::free_memory`].
    pub fn free_memory(&self, va: VirtualAddress, size: u64) -> Result<(), MemoryError> {
        self.memory.free_memory(va, size)
    }

    /// Map a physical range into the dynamic pool.
    ///
    /// # Errors
    /// See [`DynamicRegionAllocator::map`].
    pub fn map_dynamic(&self, pa: PhysicalAddress, bytes: u64, flags: MemoryFlags) -> Result<VirtualAddress, MemoryError> {
        Ok(self.dynmap.map(self.tables(), pa, bytes, flags)?)
    }

    /// # Errors
    /// See [`DynamicRegionAllocator::unmap`].
    pub fn unmap_dynamic(&self, va: VirtualAddress) -> Result<(), MemoryError> {
        Ok(self.dynmap.unmap(self.tables(), va)?)
    }

    /// Map device registers uncached.
    ///
    /// # Errors
    /// See [`DynamicRegionAllocator::map`].
    pub fn map_mmio(&self, pa: PhysicalAddress, bytes: u64) -> Result<VirtualAddress, MemoryError> {
        self.map_dynamic(pa, bytes, MMIO_FLAGS)
    }

    /// # Errors
    /// See [`DynamicRegionAllocator::unmap`].
    pub fn unmap_mmio(&self, va: VirtualAddress) -> Result<(), MemoryError> {
        self.unmap_dynamic(va)
    }
}
