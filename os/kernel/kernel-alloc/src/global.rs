//! # Global Memory Manager
//!
//! The single [`MemoryManager`] of the running kernel and the
//! [`KernelHeapAllocator`] that routes `alloc` through its heap.

use crate::frame_alloc::{BuddyFrameAllocator, LockedFrameAllocator, storage_words};
use crate::mm::{KernelPageTables, MemoryError, MemoryLayout, MemoryManager};
use core::alloc::{GlobalAlloc, Layout};
use core::ptr::null_mut;
use core::sync::atomic::{AtomicBool, Ordering};
use kernel_info::boot::BootMemory;
use kernel_info::memory::{PHYSICAL_MEMORY_SIZE, PHYSICAL_POOLS};
use kernel_sync::SyncOnceCell;
use kernel_vmem::{PageTableManager, SelfMappedTables};

const BITMAP_WORDS: usize = storage_words(PHYSICAL_MEMORY_SIZE);

static mut FRAME_BITMAP: [u32; BITMAP_WORDS] = [0; BITMAP_WORDS];

static INITIALIZED: AtomicBool = AtomicBool::new(false);
static FRAMES: SyncOnceCell<LockedFrameAllocator<'static>> = SyncOnceCell::new();
static TABLES: SyncOnceCell<KernelPageTables<'static, SelfMappedTables>> = SyncOnceCell::new();
static MEMORY: SyncOnceCell<MemoryManager<'static, SelfMappedTables>> = SyncOnceCell::new();

/// Build and initialize the global memory manager.
///
/// # Safety
/// - Paging is enabled on the loader's directory, with the self-reference
///   slot installed and the kernel image mapped.
/// - No other CPU runs yet.
///
/// # Errors
/// [`MemoryError::AlreadyInitialized`] on a second call, otherwise see
/// [`MemoryManager::init`].
pub unsafe fn init(boot: &BootMemory<'_>) -> Result<&'static MemoryManager<'static, SelfMappedTables>, MemoryError> {
    if INITIALIZED.swap(true, Ordering::AcqRel) {
        return Err(MemoryError::AlreadyInitialized);
    }

    // The swap above hands out the bitmap exactly once.
    let storage: &'static mut [u32] = unsafe { &mut *&raw mut FRAME_BITMAP };
    let buddy = BuddyFrameAllocator::new(storage, PHYSICAL_MEMORY_SIZE, &PHYSICAL_POOLS)?;

    let frames = FRAMES.get_or_init(|| LockedFrameAllocator::new(buddy));
    let tables = TABLES.get_or_init(|| PageTableManager::new(unsafe { SelfMappedTables::new() }, frames));
    let memory = MEMORY.get_or_init(|| MemoryManager::new(frames, tables, MemoryLayout::KERNEL));
    memory.init(boot)?;
    Ok(memory)
}

/// The global memory manager, once [`init`] has run.
pub fn memory() -> Option<&'static MemoryManager<'static, SelfMappedTables>> {
    MEMORY.get()
}

/// Forwards to the heap of the global memory manager; null before [`init`].
pub struct KernelHeapAllocator;

unsafe impl GlobalAlloc for KernelHeapAllocator {
    /// # Safety
    /// The `GlobalAlloc` contract applies.
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        MEMORY
            .get()
            .map_or(null_mut(), |m| unsafe { m.heap().alloc(layout) })
    }

    /// # Safety
    /// `ptr` was returned by this allocator for `layout`.
    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        if let Some(m) = MEMORY.get() {
            unsafe { m.heap().dealloc(ptr, layout) };
        }
    }

    /// # Safety
    /// The `GlobalAlloc` contract applies.
    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        MEMORY
            .get()
            .map_or(null_mut(), |m| unsafe { m.heap().alloc_zeroed(layout) })
    }

    /// # Safety
    /// The `GlobalAlloc` contract applies.
    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        MEMORY
            .get()
            .map_or(null_mut(), |m| unsafe { m.heap().realloc(ptr, layout, new_size) })
    }
}

#[cfg(all(target_os = "none", feature = "global-allocator"))]
#[global_allocator]
static GLOBAL_ALLOCATOR: KernelHeapAllocator = KernelHeapAllocator;
