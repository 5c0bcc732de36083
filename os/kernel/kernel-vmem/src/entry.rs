//! # 32-bit Paging Entries
//!
//! Without PAE, x86 translates a 32-bit virtual address in two steps:
//!
//! ```text
//! | 31‒22 | 21‒12 | 11‒0   |
//! |  PD   |  PT   | Offset |
//! ```
//!
//! Both levels hold 1024 entries of 4 bytes. A directory entry covers 4 MiB
//! and points at a page table; a table entry maps one 4 KiB frame.
//!
//! | Bits  | PDE               | PTE               |
//! |-------|-------------------|-------------------|
//! | 0     | present           | present           |
//! | 1     | writable          | writable          |
//! | 2     | user              | user              |
//! | 3     | write-through     | write-through     |
//! | 4     | cache disable     | cache disable     |
//! | 5     | accessed          | accessed          |
//! | 6     | ignored           | dirty             |
//! | 7     | page size (0)     | PAT               |
//! | 8     | ignored           | global            |
//! | 9‒11  | OS available      | OS available      |
//! | 12‒31 | table frame       | page frame        |
//!
//! The low five bits line up with [`MemoryFlags`], so flags are stored and
//! read back without translation.

use crate::MemoryFlags;
use bitfield_struct::bitfield;
use kernel_memory_addresses::{PageSize, PhysicalAddress, PhysicalPage, Size4K, Size4M, VirtualAddress};

/// Entries per directory and per table.
pub const ENTRIES_PER_TABLE: usize = 1024;

const FLAG_MASK: u32 = 0x1F;

/// A page directory entry pointing at a page table.
#[doc(alias = "PDE")]
#[bitfield(u32)]
pub struct PageDirectoryEntry {
    pub present: bool,
    pub writable: bool,
    pub user: bool,
    pub write_through: bool,
    pub cache_disabled: bool,
    pub accessed: bool,
    #[bits(1)]
    _ignored: u8,
    /// Must stay clear; 4 MiB pages are not used.
    pub page_size: bool,
    #[bits(4)]
    _available: u8,
    /// Physical frame number of the page table.
    #[bits(20)]
    pub frame: u32,
}

/// A page table entry mapping one 4 KiB frame.
#[doc(alias = "PTE")]
#[bitfield(u32)]
pub struct PageTableEntry {
    pub present: bool,
    pub writable: bool,
    pub user: bool,
    pub write_through: bool,
    pub cache_disabled: bool,
    pub accessed: bool,
    pub dirty: bool,
    pub pat: bool,
    pub global: bool,
    #[bits(3)]
    pub available: u8,
    /// Physical frame number of the mapped page.
    #[bits(20)]
    pub frame: u32,
}

impl PageDirectoryEntry {
    /// Entry pointing at `table`.
    #[must_use]
    pub fn to_table(table: PhysicalPage<Size4K>, flags: MemoryFlags) -> Self {
        Self::from_bits(frame_bits(table) | flags.bits())
    }

    #[must_use]
    pub fn table(self) -> Option<PhysicalPage<Size4K>> {
        self.present()
            .then(|| PhysicalPage::from_number(u64::from(self.frame())))
    }
}

impl PageTableEntry {
    /// Leaf entry mapping `page`.
    #[must_use]
    pub fn to_page(page: PhysicalPage<Size4K>, flags: MemoryFlags) -> Self {
        Self::from_bits(frame_bits(page) | flags.bits())
    }

    #[must_use]
    pub fn page(self) -> Option<PhysicalPage<Size4K>> {
        self.present()
            .then(|| PhysicalPage::from_number(u64::from(self.frame())))
    }

    #[must_use]
    pub const fn flags(self) -> MemoryFlags {
        MemoryFlags::from_bits_truncate(self.into_bits() & FLAG_MASK)
    }
}

#[allow(clippy::cast_possible_truncation)]
fn frame_bits(page: PhysicalPage<Size4K>) -> u32 {
    // Frames above 4 GiB cannot be expressed without PAE.
    debug_assert!(page.base().as_u64() <= u64::from(u32::MAX));
    page.base().as_u64() as u32
}

/// Index into the page directory (VA bits `[31:22]`).
#[repr(transparent)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PdIndex(u16);

/// Index into a page table (VA bits `[21:12]`).
#[repr(transparent)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PtIndex(u16);

impl PdIndex {
    /// The directory slot that refers back to the directory itself.
    pub const SELF_REFERENCE: Self = Self(1023);

    #[inline]
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn of(va: VirtualAddress) -> Self {
        Self((va.page::<Size4M>().number() & 0x3FF) as u16)
    }

    #[inline]
    #[must_use]
    pub const fn new(v: u16) -> Self {
        debug_assert!(v < 1024);
        Self(v)
    }

    #[inline]
    #[must_use]
    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }

    #[inline]
    #[must_use]
    pub const fn raw(self) -> u16 {
        self.0
    }

    /// First virtual address covered by this directory slot.
    #[inline]
    #[must_use]
    pub const fn base(self) -> VirtualAddress {
        VirtualAddress::new((self.0 as u64) << Size4M::SHIFT)
    }
}

impl PtIndex {
    #[inline]
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn of(va: VirtualAddress) -> Self {
        Self((va.page::<Size4K>().number() & 0x3FF) as u16)
    }

    #[inline]
    #[must_use]
    pub const fn new(v: u16) -> Self {
        debug_assert!(v < 1024);
        Self(v)
    }

    #[inline]
    #[must_use]
    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }
}

/// Join a mapped frame with the in-page offset of `va`.
#[must_use]
pub const fn join(page: PhysicalPage<Size4K>, va: VirtualAddress) -> PhysicalAddress {
    PhysicalAddress::new(page.base().as_u64() | va.offset::<Size4K>())
}
