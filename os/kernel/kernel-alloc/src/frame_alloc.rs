//! # Physical Frame Allocator
//!
//! A buddy-style allocator over 4 KiB frames with eight orders (4 KiB up to
//! 512 KiB blocks). Each order has its own [`OrderBitmap`]; a set bit means the
//! block contains at least one used frame.
//!
//! ```text
//! order 2  [    0    |    1    |    2    | ...
//! order 1  [ 0  | 1  | 2  | 3  | 4  | 5  | ...
//! order 0  [0|1|2|3|4|5|6|7|8|9|...
//! ```
//!
//! Allocation marks the run in every order. Freeing clears order-0 bits one
//! frame at a time and walks up while the buddy at the current order is free.
//!
//! Only frames inside one of the usable regions of the boot memory map are
//! ever handed out, and only from the requested pool.

use kernel_info::boot::{BootMemory, PhysicalRange};
use kernel_info::memory::PAGE_SIZE;
use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, Size4K, align_down, align_up};
use kernel_sync::SpinLock;
use kernel_vmem::FrameAlloc;
use log::{info, trace, warn};

/// Number of block orders; order `k` tracks blocks of `4096 << k` bytes.
pub const ORDER_COUNT: usize = 8;

/// Usable regions kept from the boot memory map; the rest are ignored.
pub const MAX_USABLE_REGIONS: usize = 16;

const WORD_BITS: usize = u32::BITS as usize;

/// Index into the pool table given to [`BuddyFrameAllocator::new`].
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct PoolId(pub u8);

impl PoolId {
    /// Memory below 16 MiB, reachable by ISA DMA.
    pub const LOW: Self = Self(0);
    /// Memory from 16 MiB up.
    pub const STANDARD: Self = Self(1);

    const fn index(self) -> usize {
        self.0 as usize
    }
}

/// A successful physical allocation.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct FrameRun {
    pub address: PhysicalAddress,
    /// Bytes actually reserved, at least one frame.
    pub actual_bytes: u64,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
#[error("bitmap storage holds {given} words, {needed} needed")]
pub struct BitmapStorageTooSmall {
    pub given: usize,
    pub needed: usize,
}

/// One bit per block of a single order.
///
/// Bits past the end read as set so that callers never hand them out.
pub struct OrderBitmap<'s> {
    words: &'s mut [u32],
    bits: usize,
}

impl OrderBitmap<'_> {
    #[must_use]
    pub const fn len(&self) -> usize {
        self.bits
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.bits == 0
    }

    #[must_use]
    pub fn test(&self, bit: usize) -> bool {
        bit >= self.bits || self.words[bit / WORD_BITS] & (1 << (bit % WORD_BITS)) != 0
    }

    pub fn set(&mut self, bit: usize) {
        if bit < self.bits {
            self.words[bit / WORD_BITS] |= 1 << (bit % WORD_BITS);
        }
    }

    pub fn clear(&mut self, bit: usize) {
        if bit < self.bits {
            self.words[bit / WORD_BITS] &= !(1 << (bit % WORD_BITS));
        }
    }

    /// First clear bit at or after `from`.
    #[must_use]
    pub fn find_first_clear(&self, from: usize) -> Option<usize> {
        if from >= self.bits {
            return None;
        }

        let mut index = from / WORD_BITS;
        let mut mask = u32::MAX << (from % WORD_BITS);
        while index < self.words.len() {
            let clear = !self.words[index] & mask;
            if clear != 0 {
                let bit = index * WORD_BITS + clear.trailing_zeros() as usize;
                return (bit < self.bits).then_some(bit);
            }
            index += 1;
            mask = u32::MAX;
        }
        None
    }

    fn reset(&mut self) {
        self.words.fill(0);
    }
}

#[allow(clippy::cast_possible_truncation)]
const fn frame_count(memory_size: u64) -> usize {
    (memory_size / PAGE_SIZE) as usize
}

const fn bits_at(frames: usize, order: usize) -> usize {
    frames.div_ceil(1 << order)
}

/// Number of `u32` words [`BuddyFrameAllocator::new`] needs for `memory_size`.
#[must_use]
pub const fn storage_words(memory_size: u64) -> usize {
    let frames = frame_count(memory_size);
    let mut words = 0;
    let mut order = 0;
    while order < ORDER_COUNT {
        words += bits_at(frames, order).div_ceil(WORD_BITS);
        order += 1;
    }
    words
}

/// Smallest order whose block holds `bytes`, capped at the largest order.
const fn order_for(bytes: u64) -> usize {
    let mut order = 0;
    while order < ORDER_COUNT - 1 && (PAGE_SIZE << order) < bytes {
        order += 1;
    }
    order
}

#[allow(clippy::cast_possible_truncation)]
const fn frame_index(address: u64) -> usize {
    (address / PAGE_SIZE) as usize
}

/// Frames covering `bytes`, or `None` if the count does not fit a `usize`.
fn frames_for(bytes: u64) -> Option<usize> {
    usize::try_from(bytes.div_ceil(PAGE_SIZE)).ok()
}

const fn frame_address(index: usize) -> u64 {
    index as u64 * PAGE_SIZE
}

pub struct BuddyFrameAllocator<'s> {
    orders: [OrderBitmap<'s>; ORDER_COUNT],
    memory_size: u64,
    pools: &'s [PhysicalRange],
    regions: [PhysicalRange; MAX_USABLE_REGIONS],
    region_count: usize,
}

impl<'s> BuddyFrameAllocator<'s> {
    /// An allocator for `[0, memory_size)` with every bit clear and no usable
    /// region; nothing can be allocated before [`init`](Self::init).
    ///
    /// `storage` is split into the per-order bitmaps and must hold at least
    /// [`storage_words`]`(memory_size)` words.
    ///
    /// # Errors
    /// [`BitmapStorageTooSmall`] if `storage` is too short.
    pub fn new(
        storage: &'s mut [u32],
        memory_size: u64,
        pools: &'s [PhysicalRange],
    ) -> Result<Self, BitmapStorageTooSmall> {
        let memory_size = align_down(memory_size, PAGE_SIZE);
        let needed = storage_words(memory_size);
        if storage.len() < needed {
            return Err(BitmapStorageTooSmall {
                given: storage.len(),
                needed,
            });
        }

        let frames = frame_count(memory_size);
        let mut rest = storage;
        let orders = core::array::from_fn(|order| {
            let bits = bits_at(frames, order);
            let (words, tail) = core::mem::take(&mut rest).split_at_mut(bits.div_ceil(WORD_BITS));
            rest = tail;
            let mut bitmap = OrderBitmap { words, bits };
            bitmap.reset();
            bitmap
        });

        Ok(Self {
            orders,
            memory_size,
            pools,
            regions: [PhysicalRange::default(); MAX_USABLE_REGIONS],
            region_count: 0,
        })
    }

    /// Take the usable regions from the boot memory map and mark the kernel
    /// image and boot modules as used.
    pub fn init(&mut self, boot: &BootMemory<'_>) {
        for bitmap in &mut self.orders {
            bitmap.reset();
        }
        self.region_count = 0;

        for entry in boot.memory_map.iter().filter(|e| e.is_usable()) {
            if self.region_count == MAX_USABLE_REGIONS {
                warn!(
                    "usable region table full, ignoring {:#x}+{:#x} and later regions",
                    entry.base, entry.length
                );
                break;
            }

            let Some(base) = align_up(entry.base, PAGE_SIZE) else {
                continue;
            };
            if base >= self.memory_size {
                warn!(
                    "dropping usable region {:#x}+{:#x}: beyond managed memory",
                    entry.base, entry.length
                );
                continue;
            }

            let end = align_down(entry.base.saturating_add(entry.length), PAGE_SIZE).min(self.memory_size);
            if end <= base {
                warn!(
                    "dropping usable region {:#x}+{:#x}: smaller than a page",
                    entry.base, entry.length
                );
                continue;
            }

            self.regions[self.region_count] = PhysicalRange::new(base, end - base);
            self.region_count += 1;
        }

        self.mark_range_used(boot.kernel_image);
        for module in boot.modules {
            self.mark_range_used(*module);
        }

        info!(
            "physical memory: {} usable regions, {} KiB free",
            self.region_count,
            self.free_bytes() / 1024
        );
    }

    #[must_use]
    pub fn usable_regions(&self) -> &[PhysicalRange] {
        &self.regions[..self.region_count]
    }

    /// Whether `[address, address + size)` lies inside one usable region.
    #[must_use]
    pub fn is_usable(&self, address: PhysicalAddress, size: u64) -> bool {
        let base = address.as_u64();
        let Some(end) = base.checked_add(size) else {
            return false;
        };
        self.usable_regions()
            .iter()
            .any(|r| r.base <= base && end <= r.end())
    }

    /// Bytes in usable regions whose frames are not allocated.
    #[must_use]
    pub fn free_bytes(&self) -> u64 {
        self.usable_regions()
            .iter()
            .flat_map(|r| frame_index(r.base)..frame_index(r.end()))
            .filter(|&frame| !self.orders[0].test(frame))
            .count() as u64
            * PAGE_SIZE
    }

    /// Allocate one block big enough for `bytes` from `pool`, or the largest
    /// smaller block still available.
    ///
    /// The block order is the smallest one holding `bytes` (at most 512 KiB).
    /// When that order has no free block, smaller orders are tried down to a
    /// single frame, so [`FrameRun::actual_bytes`] may be less than `bytes`.
    pub fn allocate(&mut self, bytes: u64, pool: PoolId) -> Option<FrameRun> {
        if bytes == 0 {
            return None;
        }
        let range = *self.pools.get(pool.index())?;

        let mut order = order_for(bytes);
        loop {
            if let Some(first) = self.find_block(order, range) {
                self.mark_used(first, 1 << order);
                let run = FrameRun {
                    address: PhysicalAddress::new(frame_address(first)),
                    actual_bytes: PAGE_SIZE << order,
                };
                trace!("allocated {:#x} bytes at {}", run.actual_bytes, run.address);
                return Some(run);
            }
            if order == 0 {
                return None;
            }
            order -= 1;
        }
    }

    /// Allocate `ceil(bytes / 4096)` physically contiguous frames whose first
    /// frame is aligned to `align` bytes.
    pub fn allocate_contiguous(&mut self, bytes: u64, align: u64, pool: PoolId) -> Option<FrameRun> {
        if bytes == 0 {
            return None;
        }

        let range = *self.pools.get(pool.index())?;
        let frames = frames_for(bytes)?;
        let step = usize::try_from(align / PAGE_SIZE).ok()?.max(1);
        let limit = frame_index(range.end().min(self.memory_size));

        let mut candidate = frame_index(align_up(range.base, PAGE_SIZE)?).checked_next_multiple_of(step)?;
        'scan: while candidate.checked_add(frames).is_some_and(|end| end <= limit) {
            for offset in 0..frames {
                if self.orders[0].test(candidate + offset) {
                    candidate = (candidate + offset + 1).checked_next_multiple_of(step)?;
                    continue 'scan;
                }
            }

            let address = PhysicalAddress::new(frame_address(candidate));
            let size = frame_address(frames);
            if self.is_usable(address, size) {
                self.mark_used(candidate, frames);
                return Some(FrameRun {
                    address,
                    actual_bytes: size,
                });
            }
            candidate = candidate.checked_add(step)?;
        }
        None
    }

    /// Return `ceil(bytes / 4096)` frames starting at `address`.
    ///
    /// Ranges outside the usable regions are ignored.
    ///
    /// # Panics
    /// If one of the frames is not allocated.
    pub fn free(&mut self, address: PhysicalAddress, bytes: u64) {
        if bytes == 0 {
            return;
        }

        let base = align_down(address.as_u64(), PAGE_SIZE);
        let Some(size) = bytes.checked_next_multiple_of(PAGE_SIZE) else {
            trace!("ignoring free of {address}+{bytes:#x}: size overflows");
            return;
        };
        if !self.is_usable(PhysicalAddress::new(base), size) {
            trace!("ignoring free of {address}+{bytes:#x} outside usable memory");
            return;
        }

        // Inside a usable region, so the frame range fits the bitmaps.
        let first = frame_index(base);
        for frame in first..first + frame_index(size) {
            self.free_frame(frame);
        }
    }

    fn free_frame(&mut self, frame: usize) {
        assert!(
            self.orders[0].test(frame),
            "double free of physical frame {:#x}",
            frame_address(frame)
        );

        for (order, bitmap) in self.orders.iter_mut().enumerate() {
            bitmap.clear(frame >> order);
            let buddy = (frame ^ (1 << order)) >> order;
            if bitmap.test(buddy) {
                break;
            }
        }
    }

    /// Mark `count` frames from `first` as used in every order.
    fn mark_used(&mut self, first: usize, count: usize) {
        if count == 0 {
            return;
        }
        let last = first + count - 1;
        for (order, bitmap) in self.orders.iter_mut().enumerate() {
            for bit in (first >> order)..=(last >> order) {
                bitmap.set(bit);
            }
        }
    }

    fn mark_range_used(&mut self, range: PhysicalRange) {
        let base = align_down(range.base, PAGE_SIZE);
        let end = align_up(range.end(), PAGE_SIZE)
            .unwrap_or(u64::MAX)
            .min(self.memory_size);
        if end > base {
            self.mark_used(frame_index(base), frame_index(end - base));
        }
    }

    /// First frame of a free block of `order` inside `pool` and one usable region.
    fn find_block(&self, order: usize, pool: PhysicalRange) -> Option<usize> {
        let block_size = PAGE_SIZE << order;
        let bitmap = &self.orders[order];

        let mut from = frame_index(pool.base.div_ceil(block_size) * PAGE_SIZE);
        while let Some(bit) = bitmap.find_first_clear(from) {
            let address = frame_address(bit) << order;
            if address.saturating_add(block_size) > pool.end() {
                return None;
            }
            if self.is_usable(PhysicalAddress::new(address), block_size) {
                return Some(bit << order);
            }
            from = match self.next_region_after(address) {
                Some(next) if next > address + block_size => frame_index(next.div_ceil(block_size) * PAGE_SIZE),
                Some(_) => bit + 1,
                None => return None,
            };
        }
        None
    }

    /// Base of the usable region containing `address`, or else the lowest
    /// region base above it.
    fn next_region_after(&self, address: u64) -> Option<u64> {
        self.usable_regions()
            .iter()
            .filter(|r| r.end() > address)
            .map(|r| r.base.max(address))
            .min()
    }
}

/// [`BuddyFrameAllocator`] behind the frame allocator's lock.
pub struct LockedFrameAllocator<'s> {
    inner: SpinLock<BuddyFrameAllocator<'s>>,
}

impl<'s> LockedFrameAllocator<'s> {
    pub const fn new(inner: BuddyFrameAllocator<'s>) -> Self {
        Self {
            inner: SpinLock::new(inner),
        }
    }

    pub fn init(&self, boot: &BootMemory<'_>) {
        self.inner.lock().init(boot);
    }

    pub fn allocate(&self, bytes: u64, pool: PoolId) -> Option<FrameRun> {
        self.inner.lock().allocate(bytes, pool)
    }

    pub fn allocate_contiguous(&self, bytes: u64, align: u64, pool: PoolId) -> Option<FrameRun> {
        self.inner.lock().allocate_contiguous(bytes, align, pool)
    }

    /// # Panics
    /// On a double free, see [`BuddyFrameAllocator::free`].
    pub fn free(&self, address: PhysicalAddress, bytes: u64) {
        self.inner.lock().free(address, bytes);
    }

    pub fn is_usable(&self, address: PhysicalAddress, size: u64) -> bool {
        self.inner.lock().is_usable(address, size)
    }

    pub fn free_bytes(&self) -> u64 {
        self.inner.lock().free_bytes()
    }
}

impl FrameAlloc for LockedFrameAllocator<'_> {
    /// Page-table frames come from the standard pool, then from low memory.
    fn alloc_4k(&self) -> Option<PhysicalPage<Size4K>> {
        let mut frames = self.inner.lock();
        let run = frames
            .allocate(PAGE_SIZE, PoolId::STANDARD)
            .or_else(|| frames.allocate(PAGE_SIZE, PoolId::LOW))?;
        PhysicalPage::from_aligned(run.address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kernel_info::boot::MemoryMapEntry;

    const MIB: u64 = 1024 * 1024;
    const POOL_16M: [PhysicalRange; 1] = [PhysicalRange::new(0, 16 * MIB)];

    fn storage(memory_size: u64) -> Vec<u32> {
        vec![0; storage_words(memory_size)]
    }

    fn boot(map: &[MemoryMapEntry]) -> BootMemory<'_> {
        BootMemory {
            memory_map: map,
            kernel_image: PhysicalRange::default(),
            modules: &[],
            initrd: None,
        }
    }

    #[test]
    fn bitmap_finds_clear_bits_across_words() {
        let mut words = [u32::MAX, 0xFFFF_FFF7, 0];
        let bitmap = OrderBitmap {
            words: &mut words,
            bits: 70,
        };
        assert_eq!(bitmap.find_first_clear(0), Some(35));
        assert_eq!(bitmap.find_first_clear(36), Some(64));
        assert_eq!(bitmap.find_first_clear(70), None);
        assert!(bitmap.test(70), "bits past the end read as used");
    }

    #[test]
    fn bitmap_ignores_bits_past_the_tail() {
        let mut words = [u32::MAX, 0];
        let mut bitmap = OrderBitmap {
            words: &mut words,
            bits: 33,
        };
        bitmap.set(32);
        assert_eq!(bitmap.find_first_clear(0), None);
        bitmap.clear(5);
        assert_eq!(bitmap.find_first_clear(0), Some(5));
        bitmap.set(40);
        assert_eq!(bitmap.words[1], 1);
    }

    #[test]
    fn rejects_short_storage() {
        let mut words = vec![0; storage_words(16 * MIB) - 1];
        let err = BuddyFrameAllocator::new(&mut words, 16 * MIB, &POOL_16M).err();
        assert_eq!(
            err,
            Some(BitmapStorageTooSmall {
                given: storage_words(16 * MIB) - 1,
                needed: storage_words(16 * MIB)
            })
        );
    }

    #[test]
    fn three_frames_take_an_order_two_block_and_come_back() {
        let mut words = storage(16 * MIB);
        let mut frames = BuddyFrameAllocator::new(&mut words, 16 * MIB, &POOL_16M).unwrap();
        frames.init(&boot(&[MemoryMapEntry::usable(0, 16 * MIB)]));

        let run = frames.allocate(3 * 4096, PoolId(0)).unwrap();
        assert_eq!(run.actual_bytes, 16384);
        assert_eq!(run.address.as_u64() % 16384, 0);

        frames.free(run.address, 16384);
        assert_eq!(frames.free_bytes(), 16 * MIB);

        let again = frames.allocate(3 * 4096, PoolId(0)).unwrap();
        assert_eq!(again, run);
    }

    #[test]
    fn zero_bytes_allocate_nothing() {
        let mut words = storage(16 * MIB);
        let mut frames = BuddyFrameAllocator::new(&mut words, 16 * MIB, &POOL_16M).unwrap();
        frames.init(&boot(&[MemoryMapEntry::usable(0, 16 * MIB)]));

        assert_eq!(frames.allocate(0, PoolId(0)), None);
        assert_eq!(frames.allocate_contiguous(0, 4096, PoolId(0)), None);
        assert_eq!(frames.free_bytes(), 16 * MIB);
    }

    #[test]
    fn oversized_requests_fail_without_side_effects() {
        let mut words = storage(16 * MIB);
        let mut frames = BuddyFrameAllocator::new(&mut words, 16 * MIB, &POOL_16M).unwrap();
        frames.init(&boot(&[MemoryMapEntry::usable(0, 16 * MIB)]));

        assert_eq!(frames.allocate_contiguous(u64::MAX, 0, PoolId(0)), None);
        assert_eq!(frames.allocate_contiguous(16 * MIB + 1, 0, PoolId(0)), None);
        assert_eq!(frames.free_bytes(), 16 * MIB);

        let run = frames.allocate(4096, PoolId(0)).unwrap();
        frames.free(run.address, u64::MAX);
        frames.free(run.address, u64::MAX - 4095);
        assert_eq!(frames.free_bytes(), 16 * MIB - 4096);

        let whole = frames.allocate(u64::MAX, PoolId(0)).unwrap();
        assert_eq!(whole.actual_bytes, 4096 << (ORDER_COUNT - 1));
    }

    #[test]
    fn steps_down_to_smaller_orders() {
        let mut words = storage(16 * MIB);
        let mut frames = BuddyFrameAllocator::new(&mut words, 16 * MIB, &POOL_16M).unwrap();
        frames.init(&boot(&[MemoryMapEntry::usable(0x1000, 0x2000)]));

        let first = frames.allocate(16384, PoolId(0)).unwrap();
        assert_eq!(first.address.as_u64(), 0x1000);
        assert_eq!(first.actual_bytes, 4096);

        let second = frames.allocate(16384, PoolId(0)).unwrap();
        assert_eq!(second.address.as_u64(), 0x2000);
        assert_eq!(frames.allocate(4096, PoolId(0)), None);
    }

    #[test]
    fn runs_never_overlap_or_exceed_the_pool() {
        let mut words = storage(16 * MIB);
        let mut frames = BuddyFrameAllocator::new(&mut words, 16 * MIB, &POOL_16M).unwrap();
        frames.init(&boot(&[
            MemoryMapEntry::usable(0, 0x9F000),
            MemoryMapEntry::usable(MIB, 3 * MIB),
        ]));

        let sizes = [4096, 12288, 100_000, 4096, 600_000, 8192, 65536];
        let mut runs = Vec::new();
        for size in sizes.iter().cycle() {
            match frames.allocate(*size, PoolId(0)) {
                Some(run) => runs.push(run),
                None => break,
            }
        }

        let total: u64 = runs.iter().map(|r| r.actual_bytes).sum();
        assert_eq!(total, 0x9F000 + 3 * MIB);
        assert_eq!(frames.free_bytes(), 0);

        runs.sort_by_key(|r| r.address);
        for pair in runs.windows(2) {
            assert!(pair[0].address.as_u64() + pair[0].actual_bytes <= pair[1].address.as_u64());
        }
        for run in &runs {
            assert!(frames.is_usable(run.address, run.actual_bytes));
        }

        for run in &runs {
            frames.free(run.address, run.actual_bytes);
        }
        assert_eq!(frames.free_bytes(), 0x9F000 + 3 * MIB);
    }

    #[test]
    #[should_panic(expected = "double free of physical frame 0x1000")]
    fn double_free_panics() {
        let mut words = storage(16 * MIB);
        let mut frames = BuddyFrameAllocator::new(&mut words, 16 * MIB, &POOL_16M).unwrap();
        frames.init(&boot(&[MemoryMapEntry::usable(0, 16 * MIB)]));

        let run = frames.allocate(8192, PoolId(0)).unwrap();
        frames.free(run.address + 0x1000, 4096);
        frames.free(run.address, 16384);
    }

    #[test]
    fn frees_outside_usable_memory_are_ignored() {
        let mut words = storage(16 * MIB);
        let mut frames = BuddyFrameAllocator::new(&mut words, 16 * MIB, &POOL_16M).unwrap();
        frames.init(&boot(&[MemoryMapEntry::usable(MIB, MIB)]));

        let before = frames.free_bytes();
        frames.free(PhysicalAddress::new(0x1000), 4096);
        frames.free(PhysicalAddress::new(2 * MIB - 4096), 8192);
        frames.free(PhysicalAddress::new(MIB), 0);
        assert_eq!(frames.free_bytes(), before);
    }

    #[test]
    fn init_filters_regions_and_reserves_the_image() {
        let mut words = storage(16 * MIB);
        let mut frames = BuddyFrameAllocator::new(&mut words, 16 * MIB, &POOL_16M).unwrap();
        let map = [
            MemoryMapEntry::usable(0x100, 0x9F000),
            MemoryMapEntry::reserved(0xA0000, 0x60000),
            MemoryMapEntry::usable(0x10_0100, 0x800),
            MemoryMapEntry::usable(MIB, 31 * MIB),
            MemoryMapEntry::usable(64 * MIB, MIB),
        ];
        let modules = [PhysicalRange::new(0x20_0800, 0x1000)];
        frames.init(&BootMemory {
            memory_map: &map,
            kernel_image: PhysicalRange::new(MIB, MIB),
            modules: &modules,
            initrd: None,
        });

        assert_eq!(
            frames.usable_regions(),
            &[
                PhysicalRange::new(0x1000, 0x9E000),
                PhysicalRange::new(MIB, 15 * MIB)
            ]
        );
        assert!(frames.is_usable(PhysicalAddress::new(MIB), MIB));
        assert!(!frames.is_usable(PhysicalAddress::new(0x9F000), 0x2000));

        // Image and module frames are marked; the next free run follows them.
        let run = frames.allocate_contiguous(MIB, MIB, PoolId(0)).unwrap();
        assert_eq!(run.address.as_u64(), 3 * MIB);
        let run = frames.allocate_contiguous(4096, 0, PoolId(0)).unwrap();
        assert_eq!(run.address.as_u64(), 0x1000);
        assert_eq!(
            frames.free_bytes(),
            0x9E000 - 0x1000 + 15 * MIB - MIB - 0x2000 - MIB
        );
    }

    #[test]
    fn keeps_at_most_sixteen_regions() {
        let mut words = storage(16 * MIB);
        let mut frames = BuddyFrameAllocator::new(&mut words, 16 * MIB, &POOL_16M).unwrap();
        let map: Vec<_> = (0..20)
            .map(|i| MemoryMapEntry::usable(i * 0x10000, 0x8000))
            .collect();
        frames.init(&boot(&map));
        assert_eq!(frames.usable_regions().len(), MAX_USABLE_REGIONS);
        assert_eq!(frames.free_bytes(), 16 * 0x8000);
    }

    #[test]
    fn contiguous_runs_honour_alignment_and_skip_used_frames() {
        let mut words = storage(16 * MIB);
        let mut frames = BuddyFrameAllocator::new(&mut words, 16 * MIB, &POOL_16M).unwrap();
        frames.init(&boot(&[MemoryMapEntry::usable(0, 16 * MIB)]));

        let page = frames.allocate(4096, PoolId(0)).unwrap();
        assert_eq!(page.address.as_u64(), 0);

        let run = frames.allocate_contiguous(3 * 4096, 16384, PoolId(0)).unwrap();
        assert_eq!(run.address.as_u64(), 0x4000);
        assert_eq!(run.actual_bytes, 3 * 4096);

        let next = frames.allocate(4096, PoolId(0)).unwrap();
        assert_eq!(next.address.as_u64(), 0x1000);
        assert_eq!(frames.allocate_contiguous(0, 4096, PoolId(0)), None);
    }

    #[test]
    fn pools_bound_the_search() {
        let pools = [PhysicalRange::new(0, MIB), PhysicalRange::new(MIB, 15 * MIB)];
        let mut words = storage(16 * MIB);
        let mut frames = BuddyFrameAllocator::new(&mut words, 16 * MIB, &pools).unwrap();
        frames.init(&boot(&[MemoryMapEntry::usable(0, 16 * MIB)]));

        let high = frames.allocate(4096, PoolId::STANDARD).unwrap();
        assert_eq!(high.address.as_u64(), MIB);
        let low = frames.allocate(4096, PoolId::LOW).unwrap();
        assert_eq!(low.address.as_u64(), 0);
        assert_eq!(frames.allocate(4096, PoolId(7)), None);
    }

    #[test]
    fn locked_allocator_hands_out_table_frames() {
        let mut words = storage(16 * MIB);
        let frames = LockedFrameAllocator::new(
            BuddyFrameAllocator::new(&mut words, 16 * MIB, &POOL_16M).unwrap(),
        );
        frames.init(&boot(&[MemoryMapEntry::usable(0x5000, 0x2000)]));

        // Only the low pool exists here, so the standard pool lookup fails over.
        assert_eq!(frames.alloc_4k(), Some(PhysicalPage::from_number(5)));
        assert_eq!(frames.alloc_4k(), Some(PhysicalPage::from_number(6)));
        assert_eq!(frames.alloc_4k(), None);

        frames.free(PhysicalAddress::new(0x5000), 4096);
        assert_eq!(frames.free_bytes(), 4096);
    }
}
