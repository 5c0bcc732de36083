//! # Host Emulation of the Paging Structures
//!
//! Physical frames are modelled as a sparse map from frame number to 1024
//! entries. The active directory is tracked like `cr3`, and the
//! [`EntrySlot::Table`] window is resolved the same way the MMU resolves the
//! recursive slot: through the active directory's entry, which must be present.
//! With slot 1023 pointing back at the directory, `Table(1023, i)` therefore
//! aliases `Directory(i)` just as on hardware.
//!
//! Frames that were never written read as [`UNTOUCHED_ENTRY`], a value with
//! the present bit set, so a table that was not zeroed before use shows up as
//! bogus mappings instead of passing by accident.

use crate::access::{EntrySlot, TableAccess};
use crate::entry::{ENTRIES_PER_TABLE, PageDirectoryEntry, PdIndex};
use crate::MemoryFlags;
use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use kernel_memory_addresses::{PhysicalPage, Size4K, VirtualAddress};
use kernel_sync::SpinLock;

/// Content of every entry of a frame that was never written.
pub const UNTOUCHED_ENTRY: u32 = 0xDEAD_BEEF;

type Frame = Box<[u32; ENTRIES_PER_TABLE]>;

struct State {
    frames: BTreeMap<u64, Frame>,
    active: PhysicalPage<Size4K>,
    flushes: usize,
    directory_loads: usize,
}

pub struct EmulatedTables {
    state: SpinLock<State>,
}

impl EmulatedTables {
    /// An emulator whose active directory lives in `directory`.
    ///
    /// The directory starts out empty apart from the self-reference slot.
    #[must_use]
    pub fn new(directory: PhysicalPage<Size4K>) -> Self {
        let mut frame: Frame = Box::new([0; ENTRIES_PER_TABLE]);
        frame[PdIndex::SELF_REFERENCE.as_usize()] =
            PageDirectoryEntry::to_table(directory, MemoryFlags::PRESENT | MemoryFlags::WRITABLE)
                .into_bits();

        let mut frames = BTreeMap::new();
        frames.insert(directory.number(), frame);
        Self {
            state: SpinLock::new(State {
                frames,
                active: directory,
                flushes: 0,
                directory_loads: 0,
            }),
        }
    }

    /// Number of TLB invalidations issued so far.
    pub fn flush_count(&self) -> usize {
        self.state.lock().flushes
    }

    /// Number of `cr3` loads so far.
    pub fn directory_loads(&self) -> usize {
        self.state.lock().directory_loads
    }

    /// Number of frames that have been written at least once.
    pub fn touched_frames(&self) -> usize {
        self.state.lock().frames.len()
    }
}

impl State {
    fn read(&self, frame: u64, index: usize) -> u32 {
        self.frames.get(&frame).map_or(UNTOUCHED_ENTRY, |f| f[index])
    }

    /// Physical frame number and entry index behind `slot`.
    fn resolve(&self, slot: EntrySlot) -> (u64, usize) {
        match slot {
            EntrySlot::Directory(pd) => (self.active.number(), pd.as_usize()),
            EntrySlot::Table(pd, pt) => {
                let pde = PageDirectoryEntry::from_bits(self.read(self.active.number(), pd.as_usize()));
                let Some(table) = pde.table() else {
                    panic!(
                        "page fault: table window of {} accessed without a page table",
                        pd.base()
                    );
                };
                (table.number(), pt.as_usize())
            }
            EntrySlot::Frame(frame, index) => {
                assert!(index < ENTRIES_PER_TABLE, "entry index {index} out of range");
                (frame.number(), index)
            }
        }
    }
}

impl TableAccess for EmulatedTables {
    fn read_entry(&self, slot: EntrySlot) -> u32 {
        let state = self.state.lock();
        let (frame, index) = state.resolve(slot);
        state.read(frame, index)
    }

    fn write_entry(&self, slot: EntrySlot, raw: u32) {
        let mut state = self.state.lock();
        let (frame, index) = state.resolve(slot);
        let entries = state
            .frames
            .entry(frame)
            .or_insert_with(|| Box::new([UNTOUCHED_ENTRY; ENTRIES_PER_TABLE]));
        entries[index] = raw;
    }

    fn flush(&self, _va: VirtualAddress) {
        self.state.lock().flushes += 1;
    }

    fn current_directory(&self) -> PhysicalPage<Size4K> {
        self.state.lock().active
    }

    unsafe fn load_directory(&self, directory: PhysicalPage<Size4K>) {
        let mut state = self.state.lock();
        state.active = directory;
        state.directory_loads += 1;
    }
}
