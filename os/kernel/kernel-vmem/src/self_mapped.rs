//! # Recursive Table Windows (32-bit x86)
//!
//! Directory slot 1023 points at the directory itself. With that in place the
//! MMU exposes:
//!
//! - the active directory at [`PAGE_DIRECTORY_WINDOW`] (`0xFFFF_F000`),
//! - table `i` of the active space at [`PAGE_TABLES_WINDOW`] `+ i * 4096`.
//!
//! Frames outside the active walk are reached by pointing the PTE of
//! [`PAGE_TABLE_SCRATCH`] at them.

#![allow(clippy::cast_possible_truncation)]

use crate::access::{EntrySlot, TableAccess};
use crate::entry::{PageTableEntry, PdIndex, PtIndex};
use crate::MemoryFlags;
use core::arch::asm;
use core::ptr::{read_volatile, write_volatile};
use kernel_info::memory::{PAGE_DIRECTORY_WINDOW, PAGE_TABLE_SCRATCH, PAGE_TABLES_WINDOW};
use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, Size4K, VirtualAddress};
use kernel_sync::SpinLock;

pub struct SelfMappedTables {
    /// Serializes use of the scratch mapping.
    scratch: SpinLock<()>,
}

impl SelfMappedTables {
    /// # Safety
    /// - Paging is enabled and directory slot 1023 of every address space
    ///   refers back to its own directory.
    /// - The table covering [`PAGE_TABLE_SCRATCH`] exists before the first
    ///   [`EntrySlot::Frame`] access. It lives in the kernel half, so
    ///   [`PageTableManager::init_kernel_space`](crate::PageTableManager::init_kernel_space)
    ///   creates it.
    #[must_use]
    pub const unsafe fn new() -> Self {
        Self {
            scratch: SpinLock::new(()),
        }
    }

    fn window_ptr(slot: EntrySlot) -> Option<*mut u32> {
        let va = match slot {
            EntrySlot::Directory(pd) => PAGE_DIRECTORY_WINDOW + 4 * pd.as_usize() as u64,
            EntrySlot::Table(pd, pt) => {
                PAGE_TABLES_WINDOW + 4096 * pd.as_usize() as u64 + 4 * pt.as_usize() as u64
            }
            EntrySlot::Frame(..) => return None,
        };
        Some(VirtualAddress::new(va).as_ptr::<u32>())
    }

    /// Run `f` with the scratch page pointing at `frame`.
    fn with_scratch<R>(&self, frame: PhysicalPage<Size4K>, f: impl FnOnce(*mut u32) -> R) -> R {
        let _guard = self.scratch.lock();
        let scratch = VirtualAddress::new(PAGE_TABLE_SCRATCH);
        let pte = Self::window_ptr(EntrySlot::Table(PdIndex::of(scratch), PtIndex::of(scratch)));
        let raw = PageTableEntry::to_page(frame, MemoryFlags::PRESENT | MemoryFlags::WRITABLE);
        if let Some(pte) = pte {
            unsafe { write_volatile(pte, raw.into_bits()) };
        }
        self.flush(scratch);
        f(scratch.as_ptr::<u32>())
    }
}

impl TableAccess for SelfMappedTables {
    fn read_entry(&self, slot: EntrySlot) -> u32 {
        match slot {
            EntrySlot::Frame(frame, index) => {
                debug_assert!(index < 1024);
                self.with_scratch(frame, |base| unsafe { read_volatile(base.add(index)) })
            }
            _ => match Self::window_ptr(slot) {
                Some(ptr) => unsafe { read_volatile(ptr) },
                None => 0,
            },
        }
    }

    fn write_entry(&self, slot: EntrySlot, raw: u32) {
        match slot {
            EntrySlot::Frame(frame, index) => {
                debug_assert!(index < 1024);
                self.with_scratch(frame, |base| unsafe { write_volatile(base.add(index), raw) });
            }
            _ => {
                if let Some(ptr) = Self::window_ptr(slot) {
                    unsafe { write_volatile(ptr, raw) };
                }
            }
        }
    }

    #[inline]
    fn flush(&self, va: VirtualAddress) {
        let addr = va.as_u64() as usize;
        unsafe {
            asm!("invlpg [{}]", in(reg) addr, options(nostack, preserves_flags));
        }
    }

    #[inline]
    fn current_directory(&self) -> PhysicalPage<Size4K> {
        let cr3: usize;
        unsafe {
            asm!("mov {}, cr3", out(reg) cr3, options(nomem, nostack, preserves_flags));
        }
        PhysicalPage::containing_address(PhysicalAddress::new(cr3 as u64))
    }

    #[inline]
    unsafe fn load_directory(&self, directory: PhysicalPage<Size4K>) {
        let cr3 = directory.base().as_u64() as usize;
        unsafe {
            asm!("mov cr3, {}", in(reg) cr3, options(nostack, preserves_flags));
        }
    }
}
