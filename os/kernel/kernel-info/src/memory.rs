//! # Memory Layout

use crate::boot::PhysicalRange;

/// Base page size; every frame, mapping and dynamic region is a multiple of it.
pub const PAGE_SIZE: u64 = 4096;

/// Size of the physical address space tracked by the frame allocator (4 GiB).
pub const PHYSICAL_MEMORY_SIZE: u64 = 1 << 32;

/// End of the low memory pool usable for ISA DMA (16 MiB).
pub const LOW_MEMORY_END: u64 = 0x0100_0000;

/// Physical allocation pools, indexed by pool id: ISA-DMA capable memory
/// below [`LOW_MEMORY_END`], then everything above it.
pub const PHYSICAL_POOLS: [PhysicalRange; 2] = [
    PhysicalRange::new(0, LOW_MEMORY_END),
    PhysicalRange::new(LOW_MEMORY_END, PHYSICAL_MEMORY_SIZE - LOW_MEMORY_END),
];

/// Start of the kernel half; directory entries above it are shared by all spaces.
pub const KERNEL_SPACE_START: u64 = 0xD000_0000;

/// Where the kernel image is linked.
pub const KERNEL_IMAGE_BASE: u64 = KERNEL_SPACE_START;

/// First byte of the kernel heap.
pub const KERNEL_HEAP_START: u64 = 0xD800_0000;

/// Upper bound for the kernel heap; it never grows past this.
pub const KERNEL_HEAP_MAX_SIZE: u64 = 0x1000_0000;

/// Area for loaded driver images.
pub const DRIVERS_START: u64 = 0xE800_0000;

pub const DRIVERS_MAX_SIZE: u64 = 0x1000_0000;

/// Pool handed out by the dynamic region allocator.
pub const DYNAMIC_START: u64 = 0xF800_0000;

pub const DYNAMIC_MAX_SIZE: u64 = 0x0780_0000;

/// Page used to reach table frames that are not part of the active walk.
pub const PAGE_TABLE_SCRATCH: u64 = 0xFFBF_F000;

/// Window through which table `i` of the active space appears at `+ i * PAGE_SIZE`.
pub const PAGE_TABLES_WINDOW: u64 = 0xFFC0_0000;

/// Window through which the active page directory appears.
pub const PAGE_DIRECTORY_WINDOW: u64 = 0xFFFF_F000;

const _: () = {
    assert!(KERNEL_HEAP_START.is_multiple_of(PAGE_SIZE));
    assert!(DYNAMIC_START.is_multiple_of(PAGE_SIZE));
    assert!(DYNAMIC_MAX_SIZE.is_multiple_of(PAGE_SIZE));
    assert!(KERNEL_HEAP_START > KERNEL_IMAGE_BASE);
    assert!(KERNEL_HEAP_START + KERNEL_HEAP_MAX_SIZE <= DRIVERS_START);
    assert!(DRIVERS_START + DRIVERS_MAX_SIZE <= DYNAMIC_START);
    assert!(DYNAMIC_START + DYNAMIC_MAX_SIZE <= PAGE_TABLE_SCRATCH);
    assert!(PAGE_TABLE_SCRATCH + PAGE_SIZE == PAGE_TABLES_WINDOW);
    assert!(PAGE_TABLES_WINDOW + 1023 * PAGE_SIZE == PAGE_DIRECTORY_WINDOW);
};
