//! # Kernel Memory Allocation
//!
//! Physical frame allocation, the kernel heap, dynamic virtual regions and the
//! [`MemoryManager`](mm::MemoryManager) that ties them to the page tables of
//! `kernel-vmem`.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────┐   ┌───────────────────────────────┐
//! │ Kernel heap (heap)       │   │ Dynamic regions (dynmap)      │
//! │ • first fit, coalescing  │   │ • best fit over AVL trees     │
//! │ • grows page by page     │   │ • MMIO and scattered mappings │
//! └────────────┬─────────────┘   └──────────────┬────────────────┘
//!              │ BackedMemory                   │
//! ┌────────────▼────────────────────────────────▼────────────────┐
//! │             Page table manager (kernel-vmem)                  │
//! └────────────────────────────┬──────────────────────────────────┘
//!                              │ FrameAlloc
//! ┌────────────────────────────▼──────────────────────────────────┐
//! │          Buddy frame allocator (frame_alloc)                  │
//! │  • 8 orders, one bitmap each  • pools (low / standard)        │
//! └───────────────────────────────────────────────────────────────┘
//! ```
//!
//! [`slab`] caches sit on top of the heap for fixed-size objects.
//!
//! ## Components
//!
//! - [`frame_alloc`]: 4 KiB frames in blocks of up to 512 KiB, restricted to the
//!   usable regions of the boot memory map.
//! - [`dynmap`]: page-granular reservations in the dynamic pool, optionally
//!   mapped onto a physical range.
//! - [`heap`]: the kernel heap and its `GlobalAlloc` implementation.
//! - [`slab`]: fixed-size chunk caches.
//! - [`mm`]: backed memory at fixed addresses, MMIO helpers and the boot
//!   sequence.
//!
//! Every component owns exactly one [`SpinLock`](kernel_sync::SpinLock).
//! Locks are taken in one direction only: heap → tables → frames, and
//! dynmap → heap (tree nodes) or tables.
//!
//! ## Usage
//!
//! ```rust
//! use kernel_alloc::dynmap::DynamicRegionAllocator;
//! use kernel_memory_addresses::VirtualAddress;
//!
//! let pool = DynamicRegionAllocator::new(VirtualAddress::new(0xF800_0000), 0x80_0000).unwrap();
//! let va = pool.reserve(0x1800).unwrap();
//! assert_eq!(va.as_u64(), 0xF800_0000);
//! assert_eq!(pool.release(va), 0x2000);
//! ```
//!
//! On the target the single instance is built by `global::init`, and the
//! `global-allocator` feature installs `global::KernelHeapAllocator`.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

pub mod dynmap;
pub mod frame_alloc;
#[cfg(target_arch = "x86")]
pub mod global;
pub mod heap;
pub mod mm;
pub mod slab;
