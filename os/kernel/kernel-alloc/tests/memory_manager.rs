//! Boot sequence of the memory manager against emulated page tables.
//!
//! The emulated tables have no memory behind their mappings and the heap
//! writes block headers into the pages it grows into, so the heap is checked
//! through its backend here and allocates over real buffers in its unit tests.

use kernel_alloc::frame_alloc::{BuddyFrameAllocator, LockedFrameAllocator, PoolId, storage_words};
use kernel_alloc::heap::HeapBackend;
use kernel_alloc::mm::{KernelPageTables, MMIO_FLAGS, MemoryLayout, MemoryManager};
use kernel_info::boot::{BootMemory, Initrd, MemoryMapEntry, PhysicalRange};
use kernel_info::memory::{DYNAMIC_MAX_SIZE, DYNAMIC_START, KERNEL_HEAP_MAX_SIZE, KERNEL_HEAP_START};
use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, VirtualAddress};
use kernel_vmem::{EmulatedTables, MemoryFlags, PageTableManager};

const MIB: u64 = 1024 * 1024;
const MEMORY_SIZE: u64 = 64 * MIB;
const POOLS: [PhysicalRange; 2] = [
    PhysicalRange::new(0, 16 * MIB),
    PhysicalRange::new(16 * MIB, MEMORY_SIZE - 16 * MIB),
];
const BOOT_DIRECTORY: u64 = 0x100;
const KERNEL_TABLES: u64 = 191;

const MEMORY_MAP: [MemoryMapEntry; 3] = [
    MemoryMapEntry::usable(0, 0x9F000),
    MemoryMapEntry::reserved(0xF0000, 0x10000),
    MemoryMapEntry::usable(MIB, MEMORY_SIZE - MIB),
];

fn boot_memory() -> BootMemory<'static> {
    BootMemory {
        memory_map: &MEMORY_MAP,
        kernel_image: PhysicalRange::new(MIB, MIB),
        modules: &[],
        initrd: Some(Initrd {
            virtual_base: DYNAMIC_START,
            size: 0x2800,
        }),
    }
}

fn frames(words: &mut [u32]) -> LockedFrameAllocator<'_> {
    LockedFrameAllocator::new(BuddyFrameAllocator::new(words, MEMORY_SIZE, &POOLS).unwrap())
}

fn tables<'m>(frames: &'m LockedFrameAllocator<'m>) -> KernelPageTables<'m, EmulatedTables> {
    PageTableManager::new(
        EmulatedTables::new(PhysicalPage::from_number(BOOT_DIRECTORY)),
        frames,
    )
}

#[test]
fn boot_sequence_sets_up_every_component() {
    let mut words = vec![0; storage_words(MEMORY_SIZE)];
    let frames = frames(&mut words);
    let tables = tables(&frames);
    let memory = MemoryManager::new(&frames, &tables, MemoryLayout::KERNEL);

    memory.init(&boot_memory()).unwrap();

    assert_eq!(
        frames.free_bytes(),
        0x9F000 + MEMORY_SIZE - 2 * MIB - KERNEL_TABLES * 4096
    );
    assert_eq!(memory.dynmap().used_bytes(), 0x3000);
    assert_eq!(memory.dynmap().free_bytes(), DYNAMIC_MAX_SIZE - 0x3000);

    let mmio = memory
        .map_mmio(PhysicalAddress::new(0xFEE0_0000), 0x400)
        .unwrap();
    assert_eq!(mmio.as_u64(), DYNAMIC_START + 0x3000);
    assert_eq!(
        tables.page_flags(mmio),
        Some(MMIO_FLAGS | MemoryFlags::PRESENT)
    );
    assert_eq!(tables.translate(mmio + 0x3FF), Some(PhysicalAddress::new(0xFEE0_03FF)));

    memory.unmap_mmio(mmio).unwrap();
    assert_eq!(tables.translate(mmio), None);
    assert_eq!(memory.dynmap().release(VirtualAddress::new(DYNAMIC_START)), 0x3000);
    assert_eq!(memory.dynmap().free_bytes(), DYNAMIC_MAX_SIZE);
}

#[test]
fn kernel_memory_is_shared_between_address_spaces() {
    let mut words = vec![0; storage_words(MEMORY_SIZE)];
    let frames = frames(&mut words);
    let tables = tables(&frames);
    let memory = MemoryManager::new(&frames, &tables, MemoryLayout::KERNEL);
    memory.init(&boot_memory()).unwrap();

    let heap = VirtualAddress::new(KERNEL_HEAP_START);
    memory
        .allocate_memory(heap, 2 * 4096, MemoryFlags::WRITABLE)
        .unwrap();
    let backing = tables.translate(heap).unwrap();

    let process = tables.create_address_space().unwrap();
    unsafe { tables.switch_address_space(process) };
    assert_eq!(tables.translate(heap), Some(backing));

    // A kernel mapping made from the process is visible after switching back.
    memory
        .allocate_memory(heap + 0x2000, 4096, MemoryFlags::WRITABLE)
        .unwrap();
    let late = tables.translate(heap + 0x2000).unwrap();
    unsafe { tables.switch_address_space(PhysicalPage::from_number(BOOT_DIRECTORY)) };
    assert_eq!(tables.translate(heap + 0x2000), Some(late));

    memory.free_memory(heap, 3 * 4096).unwrap();
    assert_eq!(tables.translate(heap), None);
}

#[test]
fn physical_pools_are_honoured() {
    let mut words = vec![0; storage_words(MEMORY_SIZE)];
    let frames = frames(&mut words);
    let tables = tables(&frames);
    let memory = MemoryManager::new(&frames, &tables, MemoryLayout::KERNEL);
    memory.init(&boot_memory()).unwrap();

    let dma = memory.allocate_physical(64 * 1024, PoolId::LOW).unwrap();
    assert!(dma.address.as_u64() + dma.actual_bytes <= 16 * MIB);
    assert_eq!(dma.actual_bytes, 64 * 1024);

    let run = memory
        .allocate_contiguous(3 * MIB, MIB, PoolId::STANDARD)
        .unwrap();
    assert!(run.address.as_u64() >= 16 * MIB);
    assert_eq!(run.address.as_u64() % MIB, 0);
    assert_eq!(run.actual_bytes, 3 * MIB);

    let before = frames.free_bytes();
    memory.free_physical(run.address, run.actual_bytes);
    memory.free_physical(dma.address, dma.actual_bytes);
    assert_eq!(frames.free_bytes(), before + 3 * MIB + 64 * 1024);
}

#[test]
fn heap_grows_into_backed_kernel_pages() {
    let mut words = vec![0; storage_words(MEMORY_SIZE)];
    let frames = frames(&mut words);
    let tables = tables(&frames);
    let memory = MemoryManager::new(&frames, &tables, MemoryLayout::KERNEL);
    memory.init(&boot_memory()).unwrap();

    let heap = memory.heap();
    assert_eq!(heap.committed_bytes(), 0);

    let start = VirtualAddress::new(KERNEL_HEAP_START);
    let before = frames.free_bytes();
    heap.backend().grow(start, 2 * 4096).unwrap();

    assert_eq!(frames.free_bytes(), before - 2 * 4096);
    let frame = tables.translate(start + 0x1000).unwrap();
    assert!(frame.as_u64() >= 16 * MIB, "heap pages come from the standard pool");
    assert_eq!(
        tables.page_flags(start),
        Some(MemoryFlags::WRITABLE | MemoryFlags::PRESENT)
    );

    // The end of the heap window is backed the same way.
    let last = VirtualAddress::new(KERNEL_HEAP_START + KERNEL_HEAP_MAX_SIZE - 4096);
    heap.backend().grow(last, 4096).unwrap();
    assert!(tables.translate(last).is_some());

    memory.free_memory(start, 2 * 4096).unwrap();
    memory.free_memory(last, 4096).unwrap();
    assert_eq!(frames.free_bytes(), before);
}
