//! # Dynamic Region Allocator
//!
//! Hands out page-granular ranges of kernel virtual address space from a fixed
//! pool (`DYNAMIC_START` on the target), typically to map device memory or
//! scattered physical ranges into the kernel.
//!
//! Free space is tracked as region records in an [`Arena`], indexed twice:
//!
//! - by base address, to find neighbours when a range is released;
//! - by `(size, base)`, for best-fit lookups.
//!
//! Both indexes hold the record's [`Handle`], so removing a region through
//! either side cannot leave the other pointing at a dead record. Outstanding
//! reservations are kept in a third tree, base address to size.
//!
//! All three trees sit behind one lock. The lock is not held while pages are
//! mapped; [`map`](DynamicRegionAllocator::map) reserves, drops the lock, maps,
//! and only takes it again to roll back.

use kernel_info::boot::Initrd;
use kernel_info::memory::PAGE_SIZE;
use kernel_memory_addresses::{PhysicalAddress, VirtualAddress, align_down, align_up};
use kernel_sync::SpinLock;
use kernel_tree::{Arena, AvlTree, Handle, TreeError};
use kernel_vmem::{FrameAlloc, MapError, MemoryFlags, PageTableManager, TableAccess, UnmapError};
use log::{debug, info, warn};

/// Remainders smaller than this are handed out with the reservation.
const SPLIT_THRESHOLD: u64 = PAGE_SIZE;

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum DynMapError {
    #[error("no free dynamic region is large enough")]
    OutOfSpace,
    #[error("zero-sized dynamic mapping")]
    Empty,
    #[error(transparent)]
    Map(#[from] MapError),
    #[error(transparent)]
    Unmap(#[from] UnmapError),
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum InitError {
    #[error("dynamic pool bounds are not page aligned")]
    UnalignedPool,
    #[error("initrd at {0:#x} is not page aligned")]
    UnalignedInitrd(u64),
    #[error("initrd at {0:#x} lies outside the dynamic pool")]
    InitrdOutsidePool(u64),
    #[error(transparent)]
    Tree(#[from] TreeError),
}

#[derive(Copy, Clone, Debug)]
struct FreeRegion {
    base: u64,
    size: u64,
}

struct Regions {
    records: Arena<FreeRegion>,
    by_address: AvlTree<u64, Handle>,
    by_size: AvlTree<(u64, u64), Handle>,
    used: AvlTree<u64, u64>,
    free_bytes: u64,
    used_bytes: u64,
}

impl Regions {
    const fn new() -> Self {
        Self {
            records: Arena::new(),
            by_address: AvlTree::new(),
            by_size: AvlTree::new(),
            used: AvlTree::new(),
            free_bytes: 0,
            used_bytes: 0,
        }
    }

    fn clear(&mut self) {
        self.records.clear();
        self.by_address.clear();
        self.by_size.clear();
        self.used.clear();
        self.free_bytes = 0;
        self.used_bytes = 0;
    }

    /// Add `[base, base + size)` as one free region, indexed both ways.
    fn insert_free(&mut self, base: u64, size: u64) -> Result<(), TreeError> {
        let handle = self.records.insert(FreeRegion { base, size })?;
        if let Err(e) = self.by_address.insert(base, handle) {
            self.records.remove(handle);
            return Err(e);
        }
        if let Err(e) = self.by_size.insert((size, base), handle) {
            self.by_address.remove_key(&base);
            self.records.remove(handle);
            return Err(e);
        }
        self.free_bytes += size;
        Ok(())
    }

    /// Drop a free region from both indexes.
    fn remove_free(&mut self, handle: Handle) -> Option<FreeRegion> {
        let region = self.records.remove(handle)?;
        self.by_address.remove_key(&region.base);
        self.by_size.remove_key(&(region.size, region.base));
        self.free_bytes -= region.size;
        Some(region)
    }

    fn free_at(&self, base: u64) -> Option<Handle> {
        let id = self.by_address.find_exact(&base)?;
        self.by_address.value(id).copied()
    }

    fn free_below(&self, base: u64) -> Option<Handle> {
        let id = self.by_address.find_less(&base)?;
        self.by_address.value(id).copied()
    }

    fn best_fit(&self, size: u64) -> Option<Handle> {
        let id = self.by_size.find_greater_or_equal(&(size, 0))?;
        self.by_size.value(id).copied()
    }
}

pub struct DynamicRegionAllocator {
    regions: SpinLock<Regions>,
}

impl Default for DynamicRegionAllocator {
    fn default() -> Self {
        Self::empty()
    }
}

impl DynamicRegionAllocator {
    /// An allocator without any free space; see [`init`](Self::init).
    #[must_use]
    pub const fn empty() -> Self {
        Self {
            regions: SpinLock::new(Regions::new()),
        }
    }

    /// An allocator whose whole pool `[base, base + size)` is free.
    ///
    /// # Errors
    /// See [`init`](Self::init).
    pub fn new(base: VirtualAddress, size: u64) -> Result<Self, InitError> {
        let allocator = Self::empty();
        allocator.init(base, size, None)?;
        Ok(allocator)
    }

    /// Reset the pool to `[base, base + size)`.
    ///
    /// A boot `initrd` already mapped inside the pool is recorded as a
    /// reservation, so it can be unmapped like any other dynamic mapping once
    /// it has been consumed.
    ///
    /// # Errors
    /// - [`InitError::UnalignedPool`] if the pool is not page aligned.
    /// - [`InitError::UnalignedInitrd`] or [`InitError::InitrdOutsidePool`] for
    ///   a misplaced initrd.
    /// - [`InitError::Tree`] if region bookkeeping cannot be allocated.
    pub fn init(&self, base: VirtualAddress, size: u64, initrd: Option<Initrd>) -> Result<(), InitError> {
        let start = base.as_u64();
        if !start.is_multiple_of(PAGE_SIZE) || !size.is_multiple_of(PAGE_SIZE) {
            return Err(InitError::UnalignedPool);
        }
        let end = start + size;

        let mut regions = self.regions.lock();
        regions.clear();

        let mut free_start = start;
        if let Some(initrd) = initrd.filter(|i| i.size > 0) {
            let initrd_start = initrd.virtual_base;
            if !initrd_start.is_multiple_of(PAGE_SIZE) {
                return Err(InitError::UnalignedInitrd(initrd_start));
            }
            let initrd_end = initrd_start
                .checked_add(initrd.size)
                .and_then(|e| align_up(e, PAGE_SIZE))
                .ok_or(InitError::InitrdOutsidePool(initrd_start))?;
            if initrd_start < start || initrd_end > end {
                return Err(InitError::InitrdOutsidePool(initrd_start));
            }

            if initrd_start > start {
                regions.insert_free(start, initrd_start - start)?;
            }
            regions.used.insert(initrd_start, initrd_end - initrd_start)?;
            regions.used_bytes += initrd_end - initrd_start;
            free_start = initrd_end;
        }

        if end > free_start {
            regions.insert_free(free_start, end - free_start)?;
        }

        info!(
            "dynamic region pool {base}..{:#x}: {} KiB free",
            end,
            regions.free_bytes / 1024
        );
        Ok(())
    }

    /// Reserve `bytes` (rounded up to pages) of address space, best fit.
    pub fn reserve(&self, bytes: u64) -> Option<VirtualAddress> {
        let size = align_up(bytes, PAGE_SIZE)?;
        if size == 0 {
            return None;
        }

        let mut regions = self.regions.lock();
        let handle = regions.best_fit(size)?;
        let region = regions.remove_free(handle)?;

        let remainder = region.size - size;
        let mut consumed = region.size;
        if remainder >= SPLIT_THRESHOLD {
            match regions.insert_free(region.base + size, remainder) {
                Ok(()) => consumed = size,
                Err(e) => warn!("keeping {remainder:#x} bytes with the reservation: {e}"),
            }
        }

        if let Err(e) = regions.used.insert(region.base, consumed) {
            warn!("cannot record dynamic reservation at {:#x}: {e}", region.base);
            if consumed != region.size {
                if let Some(rest) = regions.free_at(region.base + size) {
                    regions.remove_free(rest);
                }
            }
            if regions.insert_free(region.base, region.size).is_err() {
                warn!("lost dynamic region {:#x}+{:#x}", region.base, region.size);
            }
            return None;
        }

        regions.used_bytes += consumed;
        Some(VirtualAddress::new(region.base))
    }

    /// Give back the reservation starting at `va`, merging it with its free
    /// neighbours. Returns the reservation size.
    ///
    /// # Panics
    /// If `va` is not the start of a reservation.
    pub fn release(&self, va: VirtualAddress) -> u64 {
        let mut regions = self.regions.lock();
        let Some((base, size)) = regions.used.remove_key(&va.as_u64()) else {
            panic!("release of {va}: no dynamic reservation starts here");
        };
        regions.used_bytes -= size;

        let mut start = base;
        let mut end = base + size;

        if let Some(next) = regions.free_at(end)
            && let Some(region) = regions.remove_free(next)
        {
            debug!("merging released {base:#x} with following {:#x}", region.base);
            end += region.size;
        }

        if let Some(prev) = regions.free_below(start)
            && regions
                .records
                .get(prev)
                .is_some_and(|r| r.base + r.size == start)
            && let Some(region) = regions.remove_free(prev)
        {
            debug!("merging released {base:#x} with preceding {:#x}", region.base);
            start = region.base;
        }

        if let Err(e) = regions.insert_free(start, end - start) {
            warn!("lost dynamic region {start:#x}..{end:#x}: {e}");
        }
        size
    }

    /// Map the physical range `[pa, pa + bytes)` somewhere in the pool.
    ///
    /// The range is widened to whole pages; the returned address carries the
    /// in-page offset of `pa`.
    ///
    /// # Errors
    /// - [`DynMapError::Empty`] for a zero-sized range.
    /// - [`DynMapError::OutOfSpace`] if no region is large enough.
    /// - [`DynMapError::Map`] if mapping failed; the reservation is released.
    pub fn map<T: TableAccess, F: FrameAlloc>(
        &self,
        tables: &PageTableManager<'_, T, F>,
        pa: PhysicalAddress,
        bytes: u64,
        flags: MemoryFlags,
    ) -> Result<VirtualAddress, DynMapError> {
        let first = align_down(pa.as_u64(), PAGE_SIZE);
        let last = pa
            .as_u64()
            .checked_add(bytes)
            .and_then(|e| align_up(e, PAGE_SIZE))
            .ok_or(DynMapError::OutOfSpace)?;
        let span = last - first;
        if span == 0 {
            return Err(DynMapError::Empty);
        }

        let va = self.reserve(span).ok_or(DynMapError::OutOfSpace)?;
        if let Err(e) = tables.map_range(va, PhysicalAddress::new(first), span, flags | MemoryFlags::PRESENT) {
            self.release(va);
            return Err(e.into());
        }

        debug!("mapped {pa}+{bytes:#x} at {va}");
        Ok(va + (pa.as_u64() - first))
    }

    /// Unmap and release the reservation containing `va`.
    ///
    /// The reservation is released even when unmapping fails.
    ///
    /// # Errors
    /// [`DynMapError::Unmap`] if the pages could not be unmapped.
    ///
    /// # Panics
    /// If `va` is not inside a reservation, or one of its pages is not mapped.
    pub fn unmap<T: TableAccess, F: FrameAlloc>(
        &self,
        tables: &PageTableManager<'_, T, F>,
        va: VirtualAddress,
    ) -> Result<(), DynMapError> {
        let page = align_down(va.as_u64(), PAGE_SIZE);
        let (base, size) = {
            let regions = self.regions.lock();
            regions
                .used
                .find_less(&(page + 1))
                .and_then(|id| regions.used.get(id))
                .map(|(base, size)| (*base, *size))
                .filter(|(base, size)| page < base + size)
                .unwrap_or_else(|| panic!("unmap of {va}: not inside a dynamic reservation"))
        };

        let base = VirtualAddress::new(base);
        let unmapped = tables.unmap_range(base, size);
        if let Err(e) = unmapped {
            warn!("unmapping dynamic region {base}+{size:#x} failed: {e}");
        }
        self.release(base);
        unmapped.map_err(DynMapError::from)
    }

    /// Bytes currently available for reservation.
    pub fn free_bytes(&self) -> u64 {
        self.regions.lock().free_bytes
    }

    /// Bytes held by outstanding reservations.
    pub fn used_bytes(&self) -> u64 {
        self.regions.lock().used_bytes
    }
}
