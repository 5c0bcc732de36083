//! # Virtual Memory Support
//!
//! Two-level (non-PAE) x86 paging for the 32-bit kernel.
//!
//! ## What you get
//! - A [`PageTableManager`] that maps and unmaps 4 KiB pages in the active
//!   address space, translates addresses, and creates new address spaces that
//!   share the kernel half.
//! - Typed [`PageDirectoryEntry`] / [`PageTableEntry`] layouts and the
//!   [`MemoryFlags`] set.
//! - A [`TableAccess`] seam over the hardware, with [`SelfMappedTables`] for
//!   the target and [`EmulatedTables`] (feature `emulated`) for host tests.
//! - A minimal [`FrameAlloc`] interface through which page-table frames are
//!   obtained.
//!
//! ## Virtual Address → Physical Address Walk
//!
//! ```text
//!  cr3 → Page Directory (1024 PDEs, 4 MiB each)
//!              │
//!              └──► Page Table (1024 PTEs, 4 KiB each) ──► Physical Page
//! ```
//!
//! ## Self-Referencing Directory
//!
//! Directory entry 1023 points at the directory itself. The MMU then treats
//! the directory as the page table of the topmost 4 MiB, so:
//!
//! - the active directory appears at `0xFFFF_F000`,
//! - the page table for directory slot `i` appears at `0xFFC0_0000 + i * 4096`.
//!
//! Every table of the active space is therefore reachable without a physical
//! memory map. Frames outside the active walk (a directory under
//! construction) are reached through a single scratch page.
//!
//! ## Locking
//!
//! The manager owns exactly one lock, taken only around "does this slot have a
//! table" and the creation of that table. Frame allocation happens under it, so
//! the lock order is tables → frames.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

#[cfg(any(test, feature = "emulated"))]
extern crate alloc;

mod access;
#[cfg(any(test, feature = "emulated"))]
mod emulated;
mod entry;
mod manager;
#[cfg(target_arch = "x86")]
mod self_mapped;

pub use crate::access::{EntrySlot, TableAccess};
#[cfg(any(test, feature = "emulated"))]
pub use crate::emulated::{EmulatedTables, UNTOUCHED_ENTRY};
pub use crate::entry::{ENTRIES_PER_TABLE, PageDirectoryEntry, PageTableEntry, PdIndex, PtIndex};
pub use crate::manager::{MapError, PageTableManager, UnmapError};
#[cfg(target_arch = "x86")]
pub use crate::self_mapped::SelfMappedTables;

/// Re-export constants as info module.
pub use kernel_info::memory as info;

use kernel_memory_addresses::{PhysicalPage, Size4K};

bitflags::bitflags! {
    /// Page attributes accepted by the mapping functions.
    ///
    /// The values are the hardware bits of a 32-bit PTE/PDE, so they are
    /// stored into entries unchanged.
    #[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
    pub struct MemoryFlags: u32 {
        /// Entry is valid. Always added by [`PageTableManager::map`].
        const PRESENT = 1 << 0;

        /// Writes are allowed; otherwise the page is read-only.
        const WRITABLE = 1 << 1;

        /// Accessible from ring 3.
        const USER = 1 << 2;

        /// Write-through caching, typically for device memory.
        const WRITE_THROUGH = 1 << 3;

        /// Bypass the caches; used for MMIO.
        const CACHE_DISABLE = 1 << 4;
    }
}

/// Source of **physical** 4 KiB frames for page tables and directories.
///
/// Returned frames must be page aligned. The content is unspecified; the
/// manager zeroes every frame it turns into a table.
pub trait FrameAlloc {
    /// Allocate one frame, or `None` when physical memory is exhausted.
    fn alloc_4k(&self) -> Option<PhysicalPage<Size4K>>;
}

impl<A: FrameAlloc + ?Sized> FrameAlloc for &A {
    #[inline]
    fn alloc_4k(&self) -> Option<PhysicalPage<Size4K>> {
        (**self).alloc_4k()
    }
}
