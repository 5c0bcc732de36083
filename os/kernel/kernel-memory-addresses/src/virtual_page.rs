use crate::{MemoryPage, PageSize, VirtualAddress};
use core::fmt;

/// Virtual memory page base for size `S`.
///
/// ### Examples
/// ```rust
/// # use kernel_memory_addresses::*;
/// let va = VirtualAddress::new(0xD000_1234);
/// let vp = va.page::<Size4K>();
/// assert_eq!(vp.base().as_u64(), 0xD000_1000);
/// assert_eq!(vp.next().base().as_u64(), 0xD000_2000);
/// ```
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct VirtualPage<S: PageSize>(pub(crate) MemoryPage<S>);

impl<S: PageSize> VirtualPage<S> {
    /// Page that contains `addr` (aligns down to page boundary).
    #[inline]
    #[must_use]
    pub const fn containing_address(addr: VirtualAddress) -> Self {
        Self(MemoryPage::<S>::from_addr(addr.0))
    }

    /// `None` if `addr` is not aligned to `S`.
    #[inline]
    #[must_use]
    pub const fn from_aligned(addr: VirtualAddress) -> Option<Self> {
        match MemoryPage::<S>::from_aligned(addr.0) {
            Some(p) => Some(Self(p)),
            None => None,
        }
    }

    #[inline]
    #[must_use]
    pub const fn base(self) -> VirtualAddress {
        VirtualAddress(self.0.base())
    }

    #[inline]
    #[must_use]
    pub const fn number(self) -> u64 {
        self.0.number()
    }

    /// The page directly after this one.
    #[inline]
    #[must_use]
    pub const fn next(self) -> Self {
        Self(MemoryPage::<S>::from_number(self.0.number() + 1))
    }
}

impl<S> fmt::Display for VirtualPage<S>
where
    S: PageSize,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl<S: PageSize> fmt::Debug for VirtualPage<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VirtualPage<{}>(0x{:08X})", S::as_str(), self.base().as_u64())
    }
}
