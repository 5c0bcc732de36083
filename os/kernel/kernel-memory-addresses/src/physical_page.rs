use crate::{MemoryPage, PageSize, PhysicalAddress};
use core::fmt;

/// Physical memory page base for size `S`; for `Size4K` this is a page frame.
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PhysicalPage<S: PageSize>(pub(crate) MemoryPage<S>);

impl<S: PageSize> PhysicalPage<S> {
    /// Page that contains `addr` (aligns down to page boundary).
    #[inline]
    #[must_use]
    pub const fn containing_address(addr: PhysicalAddress) -> Self {
        Self(MemoryPage::<S>::from_addr(addr.0))
    }

    /// `None` if `addr` is not aligned to `S`.
    #[inline]
    #[must_use]
    pub const fn from_aligned(addr: PhysicalAddress) -> Option<Self> {
        match MemoryPage::<S>::from_aligned(addr.0) {
            Some(p) => Some(Self(p)),
            None => None,
        }
    }

    #[inline]
    #[must_use]
    pub const fn from_number(number: u64) -> Self {
        Self(MemoryPage::<S>::from_number(number))
    }

    #[inline]
    #[must_use]
    pub const fn base(self) -> PhysicalAddress {
        PhysicalAddress(self.0.base())
    }

    #[inline]
    #[must_use]
    pub const fn number(self) -> u64 {
        self.0.number()
    }
}

impl<S> fmt::Display for PhysicalPage<S>
where
    S: PageSize,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl<S: PageSize> fmt::Debug for PhysicalPage<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PhysicalPage<{}>(0x{:08X})", S::as_str(), self.base().as_u64())
    }
}
