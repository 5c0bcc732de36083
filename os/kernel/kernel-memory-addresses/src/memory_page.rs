use crate::{MemoryAddress, PageSize};
use core::fmt;
use core::marker::PhantomData;

/// A page base address (lower `S::SHIFT` bits are zero).
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct MemoryPage<S: PageSize> {
    value: u64,
    _phantom: PhantomData<S>,
}

impl<S> fmt::Display for MemoryPage<S>
where
    S: PageSize,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08X}/{}", self.value, S::as_str())
    }
}

impl<S: PageSize> MemoryPage<S> {
    /// Create from a raw value, aligning down to the page boundary.
    #[inline]
    #[must_use]
    pub const fn from_addr(addr: MemoryAddress) -> Self {
        Self {
            value: addr.as_u64() & !(S::SIZE - 1),
            _phantom: PhantomData,
        }
    }

    /// Create from an address that must already be aligned.
    #[inline]
    #[must_use]
    pub const fn from_aligned(addr: MemoryAddress) -> Option<Self> {
        if addr.is_aligned::<S>() {
            Some(Self::from_addr(addr))
        } else {
            None
        }
    }

    /// Page with the given page number (`base / S::SIZE`).
    #[inline]
    #[must_use]
    pub const fn from_number(number: u64) -> Self {
        Self::from_addr(MemoryAddress::new(number << S::SHIFT))
    }

    /// Return the base as `MemoryAddress`.
    #[inline]
    #[must_use]
    pub const fn base(self) -> MemoryAddress {
        MemoryAddress::new(self.value)
    }

    /// Page number, i.e. the base shifted right by `S::SHIFT`.
    #[inline]
    #[must_use]
    pub const fn number(self) -> u64 {
        self.value >> S::SHIFT
    }
}

impl<S: PageSize> fmt::Debug for MemoryPage<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MemoryPage<{}>(0x{:08X})", S::as_str(), self.value)
    }
}
