//! # Boot Memory Information

/// Attributes of a usable RAM entry: type 1 ("available") with the ACPI 3.0
/// "enabled" extended attribute set.
pub const USABLE_REGION_ATTRIBUTES: u64 = 0x1_0000_0001;

/// One entry of the firmware memory map as stored by the loader.
///
/// `attributes` packs the E820 type in the low 32 bits and the ACPI 3.0
/// extended attributes in the high 32 bits.
#[repr(C)]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct MemoryMapEntry {
    pub base: u64,
    pub length: u64,
    pub attributes: u64,
}

const _: () = assert!(size_of::<MemoryMapEntry>() == 24);

impl MemoryMapEntry {
    #[must_use]
    pub const fn usable(base: u64, length: u64) -> Self {
        Self {
            base,
            length,
            attributes: USABLE_REGION_ATTRIBUTES,
        }
    }

    #[must_use]
    pub const fn reserved(base: u64, length: u64) -> Self {
        Self {
            base,
            length,
            attributes: 0x1_0000_0002,
        }
    }

    /// Whether the region is plain RAM the frame allocator may hand out.
    #[must_use]
    pub const fn is_usable(&self) -> bool {
        self.attributes == USABLE_REGION_ATTRIBUTES
    }
}

/// A `[base, base + size)` range of physical memory.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct PhysicalRange {
    pub base: u64,
    pub size: u64,
}

impl PhysicalRange {
    #[must_use]
    pub const fn new(base: u64, size: u64) -> Self {
        Self { base, size }
    }

    #[must_use]
    pub const fn end(&self) -> u64 {
        self.base.saturating_add(self.size)
    }
}

/// Initial ramdisk, already mapped by the loader inside the dynamic area.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Initrd {
    /// Virtual base address; must be page aligned.
    pub virtual_base: u64,
    /// Size in bytes; rounded up to whole pages when reserved.
    pub size: u64,
}

/// Everything the memory manager needs to know about physical memory at boot.
#[derive(Copy, Clone, Debug)]
pub struct BootMemory<'a> {
    /// Firmware memory map.
    pub memory_map: &'a [MemoryMapEntry],
    /// Physical footprint of the kernel image.
    pub kernel_image: PhysicalRange,
    /// Boot modules and symbol tables that must never be handed out.
    pub modules: &'a [PhysicalRange],
    pub initrd: Option<Initrd>,
}
