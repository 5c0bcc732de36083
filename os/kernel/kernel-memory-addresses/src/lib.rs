//! # Physical and Virtual Address Types
//!
//! Strongly typed wrappers for the addresses handled by the memory manager of a
//! 32-bit, two-level paging kernel.
//!
//! ## Overview
//!
//! | Concept | Generic | Description |
//! |----------|----------|-------------|
//! | [`MemoryAddress`] | – | A raw address, either physical or virtual. |
//! | [`MemoryPage<S>`] | [`S: PageSize`](PageSize) | A page-aligned base of a page of size `S`. |
//!
//! Wrappers keep the two address spaces apart at compile time:
//!
//! | Wrapper | Meaning |
//! |----------|----------|
//! | [`VirtualAddress`] / [`VirtualPage<S>`] | Translated through the active page tables. |
//! | [`PhysicalAddress`] / [`PhysicalPage<S>`] | RAM or MMIO as seen by the bus. |
//!
//! ## Page Sizes
//!
//! - [`Size4K`]: the base page and the unit of every frame and mapping.
//! - [`Size4M`]: the span of a single page directory entry, i.e. one page table.
//!
//! Addresses are stored as `u64` so that sizes such as the full 4 GiB physical
//! space remain representable; the paging code narrows them to 32 bits when
//! encoding table entries.
//!
//! ```rust
//! # use kernel_memory_addresses::*;
//! let va = VirtualAddress::new(0xF800_1234);
//! assert_eq!(va.page::<Size4K>().base().as_u64(), 0xF800_1000);
//! assert_eq!(va.offset::<Size4K>(), 0x234);
//! assert_eq!(va.page::<Size4M>().base().as_u64(), 0xF800_0000);
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(clippy::inline_always)]

mod memory_address;
mod memory_page;
mod page_size;
mod physical_address;
mod physical_page;
mod virtual_address;
mod virtual_page;

pub use memory_address::MemoryAddress;
pub use memory_page::MemoryPage;
pub use page_size::{PageSize, Size4K, Size4M};
pub use physical_address::PhysicalAddress;
pub use physical_page::PhysicalPage;
pub use virtual_address::VirtualAddress;
pub use virtual_page::VirtualPage;

/// Round `value` up to the next multiple of `align` (a power of two).
///
/// Returns `None` on overflow.
#[inline]
#[must_use]
pub const fn align_up(value: u64, align: u64) -> Option<u64> {
    debug_assert!(align.is_power_of_two());
    match value.checked_add(align - 1) {
        Some(v) => Some(v & !(align - 1)),
        None => None,
    }
}

/// Round `value` down to a multiple of `align` (a power of two).
#[inline]
#[must_use]
pub const fn align_down(value: u64, align: u64) -> u64 {
    debug_assert!(align.is_power_of_two());
    value & !(align - 1)
}
