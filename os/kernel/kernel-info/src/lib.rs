//! # Memory Layout and Boot Handoff
//!
//! Compile-time layout of the 32-bit kernel address space and the boot-time
//! description of physical memory handed to the memory manager.
//!
//! ## Virtual Address Space
//!
//! ```text
//! 0x0000_0000          ┌──────────────────────────────┐
//!                      │  User space (per process)    │
//! KERNEL_SPACE_START   ├──────────────────────────────┤ 0xD000_0000
//!                      │  Kernel image                │
//! KERNEL_HEAP_START    ├──────────────────────────────┤ 0xD800_0000
//!                      │  Kernel heap (grows up)      │
//! DRIVERS_START        ├──────────────────────────────┤ 0xE800_0000
//!                      │  Loaded driver images        │
//! DYNAMIC_START        ├──────────────────────────────┤ 0xF800_0000
//!                      │  Dynamic regions (MMIO, ...) │
//!                      ├──────────────────────────────┤ 0xFF80_0000
//!                      │  unused, scratch table slot  │
//! PAGE_TABLES_WINDOW   ├──────────────────────────────┤ 0xFFC0_0000
//!                      │  Active page tables          │
//! PAGE_DIRECTORY_WINDOW├──────────────────────────────┤ 0xFFFF_F000
//!                      │  Active page directory       │
//!                      └──────────────────────────────┘
//! ```
//!
//! Everything at or above [`KERNEL_SPACE_START`](memory::KERNEL_SPACE_START)
//! is shared by every address space.
//!
//! ## Boot Handoff
//!
//! The loader passes the firmware memory map (E820 style entries), the physical
//! footprint of the kernel image, boot modules, and an optional initial ramdisk
//! already mapped into the dynamic area. See [`boot::BootMemory`].

#![cfg_attr(not(any(test, doctest)), no_std)]
#![deny(unsafe_code)]

pub mod boot;
pub mod memory;
