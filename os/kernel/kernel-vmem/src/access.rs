//! # Hardware Access to Paging Structures
//!
//! The manager never dereferences table memory itself. Every read and write of
//! a directory or table entry goes through a [`TableAccess`] implementation:
//!
//! - [`SelfMappedTables`](crate::SelfMappedTables) on the 32-bit target, using
//!   the recursive directory slot and `cr3`/`invlpg`.
//! - [`EmulatedTables`](crate::EmulatedTables) on the host, which models
//!   physical frames in memory and reproduces the same windows.

use crate::entry::{PdIndex, PtIndex};
use kernel_memory_addresses::{PhysicalPage, Size4K, VirtualAddress};

/// Addresses one 32-bit paging entry.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum EntrySlot {
    /// Entry of the active page directory.
    Directory(PdIndex),
    /// Entry of the active space's page table for directory slot `PdIndex`.
    ///
    /// The directory entry must be present.
    Table(PdIndex, PtIndex),
    /// Entry `index` of an arbitrary table frame that need not be reachable
    /// from the active directory, e.g. a directory under construction.
    Frame(PhysicalPage<Size4K>, usize),
}

/// Raw access to paging entries of the active address space.
///
/// Methods take `&self`; implementations provide their own synchronization for
/// any scratch state. Callers serialize writes to the same entry.
pub trait TableAccess {
    fn read_entry(&self, slot: EntrySlot) -> u32;

    fn write_entry(&self, slot: EntrySlot, raw: u32);

    /// Drop the TLB entry for `va`.
    fn flush(&self, va: VirtualAddress);

    /// Frame of the active page directory.
    fn current_directory(&self) -> PhysicalPage<Size4K>;

    /// Make `directory` the active page directory.
    ///
    /// # Safety
    /// `directory` must hold a valid directory that maps the running code, the
    /// stack and the kernel half, with the self-reference slot installed.
    unsafe fn load_directory(&self, directory: PhysicalPage<Size4K>);
}
