//! # Page Table Manager
//!
//! Maps and unmaps 4 KiB pages in the **active** address space, creating page
//! tables on demand, and builds new address spaces that share the kernel half.
//!
//! ## Table creation
//!
//! A page table is created the first time a page inside its 4 MiB region is
//! mapped. Checking the directory entry and creating the table happen under a
//! single narrow lock, so two racing mappers never install two tables for the
//! same slot. The new table is zeroed through the table window after its
//! directory entry is written and the window's TLB entry is flushed.
//!
//! ## Kernel half
//!
//! Directory entries from [`KERNEL_SPACE_START`] up to (excluding) the
//! self-reference slot are copied into every new address space. Once
//! [`init_kernel_space`](PageTableManager::init_kernel_space) has created all
//! of those tables up front, a kernel mapping made in any space is visible in
//! all of them.

use crate::access::{EntrySlot, TableAccess};
use crate::entry::{PageDirectoryEntry, PageTableEntry, PdIndex, PtIndex, join};
use crate::{FrameAlloc, MemoryFlags};
use kernel_info::memory::{KERNEL_SPACE_START, PAGE_SIZE, PAGE_TABLES_WINDOW};
use kernel_memory_addresses::{PageSize, PhysicalAddress, PhysicalPage, Size4K, Size4M, VirtualAddress};
use kernel_sync::SpinLock;
use log::{debug, info};

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum MapError {
    #[error("address is not page aligned")]
    Unaligned,
    #[error("page is already mapped")]
    AlreadyMapped,
    #[error("out of physical memory for a page table")]
    OutOfMemory,
    #[error("address lies in the page table window")]
    PageTableWindow,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum UnmapError {
    #[error("address is not page aligned")]
    Unaligned,
    #[error("address lies in the page table window")]
    PageTableWindow,
}

/// First directory slot of the kernel half.
#[allow(clippy::cast_possible_truncation)]
const KERNEL_FIRST_SLOT: u16 = (KERNEL_SPACE_START >> Size4M::SHIFT) as u16;

pub struct PageTableManager<'f, T, F> {
    tables: T,
    frames: &'f F,
    /// Guards "is there a table for this slot" plus its creation.
    creation_lock: SpinLock<()>,
}

impl<'f, T: TableAccess, F: FrameAlloc> PageTableManager<'f, T, F> {
    pub const fn new(tables: T, frames: &'f F) -> Self {
        Self {
            tables,
            frames,
            creation_lock: SpinLock::new(()),
        }
    }

    #[inline]
    pub const fn tables(&self) -> &T {
        &self.tables
    }

    #[inline]
    pub const fn frames(&self) -> &'f F {
        self.frames
    }

    /// Map the 4 KiB page at `va` to `pa`. `PRESENT` is always added.
    ///
    /// # Errors
    /// - [`MapError::Unaligned`] if either address is not page aligned; nothing is touched.
    /// - [`MapError::AlreadyMapped`] if `va` is mapped already.
    /// - [`MapError::PageTableWindow`] if `va` lies in the self-referenced
    ///   table window; nothing is touched.
    /// - [`MapError::OutOfMemory`] if a needed page table cannot be allocated.
    pub fn map(
        &self,
        va: VirtualAddress,
        pa: PhysicalAddress,
        flags: MemoryFlags,
    ) -> Result<(), MapError> {
        if !va.is_aligned::<Size4K>() || !pa.is_aligned::<Size4K>() {
            return Err(MapError::Unaligned);
        }

        let pd = PdIndex::of(va);
        if pd == PdIndex::SELF_REFERENCE {
            return Err(MapError::PageTableWindow);
        }
        self.ensure_table(pd)?;

        let slot = EntrySlot::Table(pd, PtIndex::of(va));
        if PageTableEntry::from_bits(self.tables.read_entry(slot)).present() {
            return Err(MapError::AlreadyMapped);
        }

        let pte = PageTableEntry::to_page(pa.page(), flags | MemoryFlags::PRESENT);
        self.tables.write_entry(slot, pte.into_bits());
        self.tables.flush(va);
        Ok(())
    }

    /// Map `size` bytes (rounded up to pages) starting at `va` to `pa`.
    ///
    /// Stops at the first failure and unmaps whatever this call mapped.
    ///
    /// # Errors
    /// See [`map`](Self::map).
    pub fn map_range(
        &self,
        va: VirtualAddress,
        pa: PhysicalAddress,
        size: u64,
        flags: MemoryFlags,
    ) -> Result<(), MapError> {
        if !va.is_aligned::<Size4K>() || !pa.is_aligned::<Size4K>() {
            return Err(MapError::Unaligned);
        }

        let pages = size.div_ceil(PAGE_SIZE);
        for page in 0..pages {
            let offset = page * PAGE_SIZE;
            let result = self.map(
                VirtualAddress::new(va.as_u64() + offset),
                PhysicalAddress::new(pa.as_u64() + offset),
                flags,
            );
            if let Err(e) = result {
                for done in 0..page {
                    self.unmap_page(VirtualAddress::new(va.as_u64() + done * PAGE_SIZE));
                }
                return Err(e);
            }
        }
        Ok(())
    }

    /// Remove the mapping of the page at `va`.
    ///
    /// # Errors
    /// - [`UnmapError::Unaligned`] if `va` is not page aligned.
    /// - [`UnmapError::PageTableWindow`] if `va` lies in the table window.
    ///
    /// # Panics
    /// If the page is not mapped.
    pub fn unmap(&self, va: VirtualAddress) -> Result<(), UnmapError> {
        if !va.is_aligned::<Size4K>() {
            return Err(UnmapError::Unaligned);
        }
        if PdIndex::of(va) == PdIndex::SELF_REFERENCE {
            return Err(UnmapError::PageTableWindow);
        }
        self.unmap_page(va);
        Ok(())
    }

    /// Unmap `size` bytes (rounded up to pages) starting at `va`.
    ///
    /// # Errors
    /// - [`UnmapError::Unaligned`] if `va` is not page aligned.
    /// - [`UnmapError::PageTableWindow`] if any page lies in the table window;
    ///   nothing is unmapped.
    ///
    /// # Panics
    /// If any page in the range is not mapped.
    pub fn unmap_range(&self, va: VirtualAddress, size: u64) -> Result<(), UnmapError> {
        if !va.is_aligned::<Size4K>() {
            return Err(UnmapError::Unaligned);
        }
        let pages = size.div_ceil(PAGE_SIZE);
        let end = va.as_u64().saturating_add(pages.saturating_mul(PAGE_SIZE));
        if pages > 0 && end > PAGE_TABLES_WINDOW {
            return Err(UnmapError::PageTableWindow);
        }

        let mut page = va.page::<Size4K>();
        for _ in 0..pages {
            self.unmap_page(page.base());
            page = page.next();
        }
        Ok(())
    }

    /// Physical address `va` translates to, including the in-page offset.
    #[must_use]
    pub fn translate(&self, va: VirtualAddress) -> Option<PhysicalAddress> {
        self.leaf(va)?.page().map(|page| join(page, va))
    }

    /// Flags of the page containing `va`.
    #[must_use]
    pub fn page_flags(&self, va: VirtualAddress) -> Option<MemoryFlags> {
        let pte = self.leaf(va)?;
        pte.present().then(|| pte.flags())
    }

    /// Build a new directory sharing the kernel half of the active one.
    ///
    /// # Errors
    /// [`MapError::OutOfMemory`] if no frame is available for the directory.
    pub fn create_address_space(&self) -> Result<PhysicalPage<Size4K>, MapError> {
        let directory = self.frames.alloc_4k().ok_or(MapError::OutOfMemory)?;

        for index in 0..usize::from(KERNEL_FIRST_SLOT) {
            self.tables.write_entry(EntrySlot::Frame(directory, index), 0);
        }
        for slot in KERNEL_FIRST_SLOT..PdIndex::SELF_REFERENCE.raw() {
            let pd = PdIndex::new(slot);
            let raw = self.tables.read_entry(EntrySlot::Directory(pd));
            self.tables.write_entry(EntrySlot::Frame(directory, pd.as_usize()), raw);
        }
        let self_reference =
            PageDirectoryEntry::to_table(directory, MemoryFlags::PRESENT | MemoryFlags::WRITABLE);
        self.tables.write_entry(
            EntrySlot::Frame(directory, PdIndex::SELF_REFERENCE.as_usize()),
            self_reference.into_bits(),
        );

        debug!("created address space with directory {directory}");
        Ok(directory)
    }

    /// Activate `directory`; does nothing if it is active already.
    ///
    /// # Safety
    /// `directory` must come from [`create_address_space`](Self::create_address_space)
    /// (or be the boot directory) and must not have been torn down.
    pub unsafe fn switch_address_space(&self, directory: PhysicalPage<Size4K>) {
        if self.tables.current_directory() == directory {
            return;
        }
        unsafe { self.tables.load_directory(directory) };
    }

    /// Create every missing kernel-half page table.
    ///
    /// Returns the number of tables created.
    ///
    /// # Errors
    /// [`MapError::OutOfMemory`] if a table cannot be allocated; tables created
    /// before the failure stay in place.
    pub fn init_kernel_space(&self) -> Result<usize, MapError> {
        let mut created = 0;
        for slot in KERNEL_FIRST_SLOT..PdIndex::SELF_REFERENCE.raw() {
            if self.ensure_table(PdIndex::new(slot))? {
                created += 1;
            }
        }
        info!("kernel space: created {created} page tables");
        Ok(created)
    }

    /// Drop every user-half directory entry of the active space, e.g. the
    /// loader's identity mapping, and flush the whole TLB.
    ///
    /// The tables themselves are not freed.
    pub fn clear_user_space(&self) {
        for slot in 0..KERNEL_FIRST_SLOT {
            self.tables.write_entry(EntrySlot::Directory(PdIndex::new(slot)), 0);
        }
        let active = self.tables.current_directory();
        // Reloading the active directory is always sound.
        unsafe { self.tables.load_directory(active) };
    }

    fn directory_entry(&self, pd: PdIndex) -> PageDirectoryEntry {
        PageDirectoryEntry::from_bits(self.tables.read_entry(EntrySlot::Directory(pd)))
    }

    fn leaf(&self, va: VirtualAddress) -> Option<PageTableEntry> {
        let pd = PdIndex::of(va);
        if !self.directory_entry(pd).present() {
            return None;
        }
        let raw = self.tables.read_entry(EntrySlot::Table(pd, PtIndex::of(va)));
        Some(PageTableEntry::from_bits(raw))
    }

    /// Make sure directory slot `pd` has a page table; `true` if one was created.
    fn ensure_table(&self, pd: PdIndex) -> Result<bool, MapError> {
        let _guard = self.creation_lock.lock();
        if self.directory_entry(pd).present() {
            return Ok(false);
        }

        let table = self.frames.alloc_4k().ok_or(MapError::OutOfMemory)?;
        let mut flags = MemoryFlags::PRESENT | MemoryFlags::WRITABLE;
        if pd.base().as_u64() < KERNEL_SPACE_START {
            flags |= MemoryFlags::USER;
        }
        let pde = PageDirectoryEntry::to_table(table, flags);
        self.tables.write_entry(EntrySlot::Directory(pd), pde.into_bits());
        self.tables.flush(table_window(pd));

        for index in 0..1024 {
            self.tables.write_entry(EntrySlot::Table(pd, PtIndex::new(index)), 0);
        }

        debug!("created page table {table} for {}", pd.base());
        Ok(true)
    }

    fn unmap_page(&self, va: VirtualAddress) {
        let pd = PdIndex::of(va);
        assert!(
            self.directory_entry(pd).present(),
            "unmap of {va}: no page table for this region"
        );
        let slot = EntrySlot::Table(pd, PtIndex::of(va));
        assert!(
            PageTableEntry::from_bits(self.tables.read_entry(slot)).present(),
            "unmap of {va}: page is not mapped"
        );
        self.tables.write_entry(slot, 0);
        self.tables.flush(va);
    }
}

/// Virtual address at which the table for `pd` appears.
const fn table_window(pd: PdIndex) -> VirtualAddress {
    VirtualAddress::new(PAGE_TABLES_WINDOW + (pd.as_usize() as u64) * PAGE_SIZE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::EmulatedTables;
    use core::cell::Cell;
    use core::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Barrier;
    use std::thread;

    /// Hands out consecutive frames from `[next, end)`.
    struct BumpAlloc {
        next: Cell<u64>,
        end: u64,
    }

    impl BumpAlloc {
        fn new(start: u64, end: u64) -> Self {
            Self {
                next: Cell::new(start),
                end,
            }
        }

        fn used(&self, start: u64) -> u64 {
            (self.next.get() - start) / PAGE_SIZE
        }
    }

    impl FrameAlloc for BumpAlloc {
        fn alloc_4k(&self) -> Option<PhysicalPage<Size4K>> {
            let p = self.next.get();
            if p + PAGE_SIZE > self.end {
                return None;
            }
            self.next.set(p + PAGE_SIZE);
            Some(PhysicalPage::containing_address(PhysicalAddress::new(p)))
        }
    }

    const BOOT_DIRECTORY: u64 = 0x0010_0000;
    const POOL: u64 = 0x0020_0000;

    fn setup(frames: &BumpAlloc) -> PageTableManager<'_, EmulatedTables, BumpAlloc> {
        let tables = EmulatedTables::new(PhysicalPage::containing_address(PhysicalAddress::new(
            BOOT_DIRECTORY,
        )));
        PageTableManager::new(tables, frames)
    }

    fn va(v: u64) -> VirtualAddress {
        VirtualAddress::new(v)
    }

    fn pa(p: u64) -> PhysicalAddress {
        PhysicalAddress::new(p)
    }

    /// [`BumpAlloc`] for several threads at once.
    struct SharedBumpAlloc {
        next: AtomicU64,
        end: u64,
    }

    impl FrameAlloc for SharedBumpAlloc {
        fn alloc_4k(&self) -> Option<PhysicalPage<Size4K>> {
            let p = self.next.fetch_add(PAGE_SIZE, Ordering::Relaxed);
            (p + PAGE_SIZE <= self.end).then(|| PhysicalPage::containing_address(PhysicalAddress::new(p)))
        }
    }

    #[test]
    fn map_creates_a_zeroed_table_and_the_leaf() {
        let frames = BumpAlloc::new(POOL, POOL + 64 * PAGE_SIZE);
        let mm = setup(&frames);

        mm.map(va(0xD000_0000), pa(0x0030_0000), MemoryFlags::WRITABLE)
            .unwrap();
        assert_eq!(frames.used(POOL), 1);

        assert_eq!(mm.translate(va(0xD000_0123)), Some(pa(0x0030_0123)));
        assert_eq!(
            mm.page_flags(va(0xD000_0000)),
            Some(MemoryFlags::PRESENT | MemoryFlags::WRITABLE)
        );

        // Every other entry of the fresh table reads as zero.
        let pd = PdIndex::of(va(0xD000_0000));
        for index in 1..1024 {
            let raw = mm.tables().read_entry(EntrySlot::Table(pd, PtIndex::new(index)));
            assert_eq!(raw, 0, "entry {index} not cleared");
        }

        let pde = mm.directory_entry(pd);
        assert!(pde.present() && pde.writable() && !pde.user());

        // A second page in the same 4 MiB region reuses the table.
        mm.map(va(0xD000_1000), pa(0x0030_1000), MemoryFlags::empty())
            .unwrap();
        assert_eq!(frames.used(POOL), 1);
        assert_eq!(mm.page_flags(va(0xD000_1000)), Some(MemoryFlags::PRESENT));
    }

    #[test]
    fn user_half_tables_allow_user_access() {
        let frames = BumpAlloc::new(POOL, POOL + 4 * PAGE_SIZE);
        let mm = setup(&frames);
        mm.map(va(0x0040_0000), pa(0x0050_0000), MemoryFlags::USER | MemoryFlags::WRITABLE)
            .unwrap();
        assert!(mm.directory_entry(PdIndex::of(va(0x0040_0000))).user());
    }

    #[test]
    fn unaligned_map_touches_nothing() {
        let frames = BumpAlloc::new(POOL, POOL + 4 * PAGE_SIZE);
        let mm = setup(&frames);
        let flushes = mm.tables().flush_count();

        assert_eq!(
            mm.map(va(0xD000_0010), pa(0x0030_0000), MemoryFlags::WRITABLE),
            Err(MapError::Unaligned)
        );
        assert_eq!(
            mm.map(va(0xD000_0000), pa(0x0030_0001), MemoryFlags::WRITABLE),
            Err(MapError::Unaligned)
        );
        assert_eq!(frames.used(POOL), 0);
        assert_eq!(mm.tables().flush_count(), flushes);
        assert!(!mm.directory_entry(PdIndex::of(va(0xD000_0000))).present());
    }

    #[test]
    fn mapping_twice_is_reported() {
        let frames = BumpAlloc::new(POOL, POOL + 4 * PAGE_SIZE);
        let mm = setup(&frames);
        mm.map(va(0xE000_0000), pa(0x0030_0000), MemoryFlags::WRITABLE)
            .unwrap();
        assert_eq!(
            mm.map(va(0xE000_0000), pa(0x0040_0000), MemoryFlags::WRITABLE),
            Err(MapError::AlreadyMapped)
        );
        assert_eq!(mm.translate(va(0xE000_0000)), Some(pa(0x0030_0000)));
    }

    #[test]
    fn table_allocation_failure_is_out_of_memory() {
        let frames = BumpAlloc::new(POOL, POOL);
        let mm = setup(&frames);
        assert_eq!(
            mm.map(va(0xD000_0000), pa(0x0030_0000), MemoryFlags::WRITABLE),
            Err(MapError::OutOfMemory)
        );
        assert_eq!(mm.translate(va(0xD000_0000)), None);
        assert!(!mm.directory_entry(PdIndex::of(va(0xD000_0000))).present());
    }

    #[test]
    fn map_range_rolls_back_on_failure() {
        let frames = BumpAlloc::new(POOL, POOL + 4 * PAGE_SIZE);
        let mm = setup(&frames);
        let base = 0xF800_0000;

        mm.map(va(base + 2 * PAGE_SIZE), pa(0x0090_0000), MemoryFlags::WRITABLE)
            .unwrap();

        let result = mm.map_range(va(base), pa(0x0030_0000), 4 * PAGE_SIZE, MemoryFlags::WRITABLE);
        assert_eq!(result, Err(MapError::AlreadyMapped));
        assert_eq!(mm.translate(va(base)), None);
        assert_eq!(mm.translate(va(base + PAGE_SIZE)), None);
        assert_eq!(mm.translate(va(base + 2 * PAGE_SIZE)), Some(pa(0x0090_0000)));
        assert_eq!(mm.translate(va(base + 3 * PAGE_SIZE)), None);
    }

    #[test]
    fn map_range_rounds_size_up_to_pages() {
        let frames = BumpAlloc::new(POOL, POOL + 4 * PAGE_SIZE);
        let mm = setup(&frames);
        mm.map_range(va(0xF800_0000), pa(0x0030_0000), PAGE_SIZE + 1, MemoryFlags::WRITABLE)
            .unwrap();
        assert!(mm.translate(va(0xF800_1FFF)).is_some());
        assert!(mm.translate(va(0xF800_2000)).is_none());

        mm.unmap_range(va(0xF800_0000), 2 * PAGE_SIZE).unwrap();
        assert!(mm.translate(va(0xF800_0000)).is_none());
        assert!(mm.translate(va(0xF800_1000)).is_none());
    }

    #[test]
    fn unmap_clears_the_entry_and_flushes() {
        let frames = BumpAlloc::new(POOL, POOL + 4 * PAGE_SIZE);
        let mm = setup(&frames);
        mm.map(va(0xD000_0000), pa(0x0030_0000), MemoryFlags::WRITABLE)
            .unwrap();

        let flushes = mm.tables().flush_count();
        assert_eq!(mm.unmap(va(0xD000_0001)), Err(UnmapError::Unaligned));
        mm.unmap(va(0xD000_0000)).unwrap();
        assert_eq!(mm.tables().flush_count(), flushes + 1);
        assert_eq!(mm.translate(va(0xD000_0000)), None);
        assert_eq!(mm.page_flags(va(0xD000_0000)), None);
    }

    #[test]
    #[should_panic(expected = "page is not mapped")]
    fn unmapping_an_unmapped_page_panics() {
        let frames = BumpAlloc::new(POOL, POOL + 4 * PAGE_SIZE);
        let mm = setup(&frames);
        mm.map(va(0xD000_0000), pa(0x0030_0000), MemoryFlags::WRITABLE)
            .unwrap();
        let _ = mm.unmap(va(0xD000_1000));
    }

    #[test]
    #[should_panic(expected = "no page table")]
    fn unmapping_without_a_table_panics() {
        let frames = BumpAlloc::new(POOL, POOL + 4 * PAGE_SIZE);
        let mm = setup(&frames);
        let _ = mm.unmap(va(0xD000_0000));
    }

    #[test]
    fn init_kernel_space_creates_every_kernel_table_once() {
        let frames = BumpAlloc::new(POOL, POOL + 512 * PAGE_SIZE);
        let mm = setup(&frames);

        mm.map(va(0xD000_0000), pa(0x0030_0000), MemoryFlags::WRITABLE)
            .unwrap();
        let expected = 1023 - usize::from(KERNEL_FIRST_SLOT) - 1;
        assert_eq!(mm.init_kernel_space(), Ok(expected));
        assert_eq!(mm.init_kernel_space(), Ok(0));
        assert_eq!(mm.translate(va(0xD000_0000)), Some(pa(0x0030_0000)));
    }

    #[test]
    fn clear_user_space_drops_low_mappings() {
        let frames = BumpAlloc::new(POOL, POOL + 8 * PAGE_SIZE);
        let mm = setup(&frames);
        mm.map(va(0x0010_0000), pa(0x0010_0000), MemoryFlags::WRITABLE)
            .unwrap();
        mm.map(va(0xD000_0000), pa(0x0010_0000), MemoryFlags::WRITABLE)
            .unwrap();

        mm.clear_user_space();
        assert_eq!(mm.translate(va(0x0010_0000)), None);
        assert_eq!(mm.translate(va(0xD000_0000)), Some(pa(0x0010_0000)));
        assert_eq!(mm.tables().directory_loads(), 1);
    }

    #[test]
    fn new_address_spaces_share_the_kernel_half() {
        let frames = BumpAlloc::new(POOL, POOL + 512 * PAGE_SIZE);
        let mm = setup(&frames);
        mm.init_kernel_space().unwrap();
        mm.map(va(0x0040_0000), pa(0x0070_0000), MemoryFlags::USER)
            .unwrap();

        let boot = mm.tables().current_directory();
        let space = mm.create_address_space().unwrap();
        assert_ne!(space, boot);

        for slot in 0..1024u16 {
            let pd = PdIndex::new(slot);
            let raw = mm.tables().read_entry(EntrySlot::Frame(space, pd.as_usize()));
            if slot < KERNEL_FIRST_SLOT {
                assert_eq!(raw, 0, "user slot {slot} must start empty");
            } else if pd == PdIndex::SELF_REFERENCE {
                assert_eq!(u64::from(raw), space.base().as_u64() | 0b11);
            } else {
                assert_eq!(raw, mm.tables().read_entry(EntrySlot::Directory(pd)));
            }
        }

        unsafe { mm.switch_address_space(space) };
        assert_eq!(mm.tables().directory_loads(), 1);
        unsafe { mm.switch_address_space(space) };
        assert_eq!(mm.tables().directory_loads(), 1);

        // Kernel mappings made in one space appear in the other.
        assert_eq!(mm.translate(va(0x0040_0000)), None);
        mm.map(va(0xE800_0000), pa(0x0080_0000), MemoryFlags::WRITABLE)
            .unwrap();
        unsafe { mm.switch_address_space(boot) };
        assert_eq!(mm.translate(va(0xE800_0000)), Some(pa(0x0080_0000)));
        assert_eq!(mm.translate(va(0x0040_0000)), Some(pa(0x0070_0000)));
    }

    #[test]
    fn racing_mappers_share_one_new_table() {
        const THREADS: u64 = 8;
        let frames = SharedBumpAlloc {
            next: AtomicU64::new(POOL),
            end: POOL + 64 * PAGE_SIZE,
        };
        let tables = EmulatedTables::new(PhysicalPage::containing_address(PhysicalAddress::new(
            BOOT_DIRECTORY,
        )));
        let mm = PageTableManager::new(tables, &frames);
        let barrier = Barrier::new(usize::try_from(THREADS).unwrap());

        thread::scope(|s| {
            for t in 0..THREADS {
                let (mm, barrier) = (&mm, &barrier);
                s.spawn(move || {
                    barrier.wait();
                    mm.map(
                        va(0xE000_0000 + t * PAGE_SIZE),
                        pa(0x0100_0000 + t * PAGE_SIZE),
                        MemoryFlags::WRITABLE,
                    )
                    .unwrap();
                });
            }
        });

        assert_eq!(frames.next.load(Ordering::Relaxed), POOL + PAGE_SIZE, "one table frame");
        for t in 0..THREADS {
            assert_eq!(
                mm.translate(va(0xE000_0000 + t * PAGE_SIZE)),
                Some(pa(0x0100_0000 + t * PAGE_SIZE))
            );
        }
        assert_eq!(mm.translate(va(0xE000_0000 + THREADS * PAGE_SIZE)), None);
    }

    #[test]
    fn table_window_is_never_mapped_or_unmapped() {
        let frames = BumpAlloc::new(POOL, POOL + 4 * PAGE_SIZE);
        let mm = setup(&frames);
        mm.map(va(0x0140_0000), pa(0x0030_0000), MemoryFlags::WRITABLE)
            .unwrap();
        let slot = EntrySlot::Directory(PdIndex::new(5));
        let directory_entry = mm.tables().read_entry(slot);
        let flushes = mm.tables().flush_count();

        // The window page for slot 5 aliases its directory entry.
        assert_eq!(
            mm.map(va(0xFFC0_5000), pa(0x0090_0000), MemoryFlags::WRITABLE),
            Err(MapError::PageTableWindow)
        );
        assert_eq!(mm.unmap(va(0xFFC0_5000)), Err(UnmapError::PageTableWindow));
        assert_eq!(
            mm.unmap_range(va(0xFFBF_F000), 2 * PAGE_SIZE),
            Err(UnmapError::PageTableWindow)
        );
        assert_eq!(mm.tables().read_entry(slot), directory_entry);
        assert_eq!(mm.tables().flush_count(), flushes);
        assert_eq!(mm.translate(va(0x0140_0000)), Some(pa(0x0030_0000)));

        // A range running into the window is rolled back.
        assert_eq!(
            mm.map_range(va(0xFFBF_F000), pa(0x0090_0000), 2 * PAGE_SIZE, MemoryFlags::WRITABLE),
            Err(MapError::PageTableWindow)
        );
        assert_eq!(mm.translate(va(0xFFBF_F000)), None);
    }
}
