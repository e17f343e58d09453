//! # Physical Memory Address Types
//!
//! Strongly typed wrappers for physical addresses, page bases and page frame
//! numbers used by the physical allocator and the reservation layer.
//!
//! | Type | Description |
//! |------|-------------|
//! | [`PhysicalAddress`] | A raw 64-bit physical address. |
//! | [`PhysicalPage<S>`] | The base of a physical page of size `S`. |
//! | [`PageFrame`] | A page frame number: the index of a base (4 KiB) page. |
//!
//! ## Page Sizes
//!
//! The sizes a reservation can be promoted to are marker types implementing
//! [`PageSize`]:
//!
//! - [`Size4K`]: 4 KiB base pages
//! - [`Size64K`]: 64 KiB runs (16 base pages)
//! - [`Size2M`]: 2 MiB superpages
//!
//! ```rust
//! # use kernel_memory_addresses::*;
//! let pa = PhysicalAddress::new(0x0000_0010_2001_0042);
//! let page = pa.page::<Size64K>();
//! assert_eq!(page.base().as_u64(), 0x0000_0010_2001_0000);
//! assert_eq!(page.join(pa.offset::<Size64K>()), pa);
//!
//! let frame = PageFrame::containing(pa);
//! assert_eq!(frame.address().as_u64(), 0x0000_0010_2001_0000);
//! assert!(frame.is_aligned(4));
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]

use core::fmt;
use core::hash::Hash;
use core::marker::PhantomData;
use core::ops::{Add, AddAssign};

/// Sealed trait pattern to restrict `PageSize` impls to our markers.
mod sealed {
    pub trait Sealed {}
}

/// Marker trait for supported page sizes.
pub trait PageSize:
    sealed::Sealed + Clone + Copy + Eq + PartialEq + Ord + PartialOrd + Hash + fmt::Display + fmt::Debug
{
    /// Page size in bytes (power of two).
    const SIZE: u64;
    /// log2(SIZE), i.e., number of low bits used for the offset.
    const SHIFT: u32;
    /// Number of base pages per page of this size.
    const FRAMES: u64 = Self::SIZE >> PAGE_SHIFT;

    fn as_str() -> &'static str;
}

/// log2 of the base page size.
pub const PAGE_SHIFT: u32 = 12;

/// Base page size in bytes.
pub const PAGE_SIZE: u64 = 1 << PAGE_SHIFT;

macro_rules! page_size {
    ($(#[$meta:meta])* $name:ident, $shift:expr, $label:literal) => {
        $(#[$meta])*
        #[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
        pub struct $name;

        impl sealed::Sealed for $name {}

        impl PageSize for $name {
            const SIZE: u64 = 1 << $shift;
            const SHIFT: u32 = $shift;

            fn as_str() -> &'static str {
                $label
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str(Self::as_str())
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                fmt::Display::fmt(&self, f)
            }
        }
    };
}

page_size!(
    /// 4 KiB page (4096 bytes).
    Size4K, 12, "4K"
);
page_size!(
    /// 64 KiB run (`65_536` bytes).
    Size64K, 16, "64K"
);
page_size!(
    /// 2 MiB page (`2_097_152` bytes).
    Size2M, 21, "2M"
);

/// A physical memory address.
#[repr(transparent)]
#[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PhysicalAddress(u64);

impl PhysicalAddress {
    #[inline]
    #[must_use]
    pub const fn new(v: u64) -> Self {
        Self(v)
    }

    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// The page of size `S` containing this address.
    #[inline]
    #[must_use]
    pub const fn page<S: PageSize>(self) -> PhysicalPage<S> {
        PhysicalPage::from_addr(self)
    }

    /// The offset of this address within its page of size `S`.
    #[inline]
    #[must_use]
    pub const fn offset<S: PageSize>(self) -> u64 {
        self.0 & (S::SIZE - 1)
    }

    /// Whether the address is a multiple of `align`, which must be a power of two.
    #[inline]
    #[must_use]
    pub const fn is_aligned(self, align: u64) -> bool {
        debug_assert!(align.is_power_of_two());
        self.0 & (align - 1) == 0
    }

    /// Whether `[self, self + len)` stays within one `boundary`-aligned
    /// window. A zero boundary means "no boundary".
    #[inline]
    #[must_use]
    pub const fn fits_boundary(self, len: u64, boundary: u64) -> bool {
        if boundary == 0 || len == 0 {
            return true;
        }
        debug_assert!(boundary.is_power_of_two());
        (self.0 ^ (self.0 + len - 1)) & !(boundary - 1) == 0
    }

    #[inline]
    #[must_use]
    pub const fn checked_add(self, rhs: u64) -> Option<Self> {
        match self.0.checked_add(rhs) {
            Some(v) => Some(Self(v)),
            None => None,
        }
    }
}

impl fmt::Debug for PhysicalAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PhysicalAddress(0x{:016X})", self.0)
    }
}

impl fmt::Display for PhysicalAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:016X}", self.0)
    }
}

impl Add<u64> for PhysicalAddress {
    type Output = Self;
    #[inline]
    fn add(self, rhs: u64) -> Self::Output {
        Self(self.0 + rhs)
    }
}

impl AddAssign<u64> for PhysicalAddress {
    #[inline]
    fn add_assign(&mut self, rhs: u64) {
        self.0 += rhs;
    }
}

impl From<u64> for PhysicalAddress {
    #[inline]
    fn from(v: u64) -> Self {
        Self(v)
    }
}

/// The page-aligned base of a physical page of size `S`.
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PhysicalPage<S: PageSize> {
    value: u64,
    _phantom: PhantomData<S>,
}

impl<S: PageSize> PhysicalPage<S> {
    /// The page containing `addr` (aligns down).
    #[inline]
    #[must_use]
    pub const fn from_addr(addr: PhysicalAddress) -> Self {
        Self {
            value: addr.0 & !(S::SIZE - 1),
            _phantom: PhantomData,
        }
    }

    #[inline]
    #[must_use]
    pub const fn base(self) -> PhysicalAddress {
        PhysicalAddress(self.value)
    }

    /// Combine with an in-page offset to form a full address.
    #[inline]
    #[must_use]
    pub const fn join(self, offset: u64) -> PhysicalAddress {
        debug_assert!(offset < S::SIZE);
        PhysicalAddress(self.value + offset)
    }

    /// The first base page frame of this page.
    #[inline]
    #[must_use]
    pub const fn first_frame(self) -> PageFrame {
        PageFrame(self.value >> PAGE_SHIFT)
    }
}

impl<S: PageSize> fmt::Display for PhysicalPage<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:016X}/{}", self.value, S::as_str())
    }
}

impl<S: PageSize> fmt::Debug for PhysicalPage<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PhysicalPage<{}>(0x{:016X})", S::as_str(), self.value)
    }
}

/// A page frame number (PFN): the index of a base page in physical memory.
#[repr(transparent)]
#[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PageFrame(u64);

impl PageFrame {
    #[inline]
    #[must_use]
    pub const fn new(pfn: u64) -> Self {
        Self(pfn)
    }

    /// The frame containing `addr`.
    #[inline]
    #[must_use]
    pub const fn containing(addr: PhysicalAddress) -> Self {
        Self(addr.0 >> PAGE_SHIFT)
    }

    #[inline]
    #[must_use]
    pub const fn pfn(self) -> u64 {
        self.0
    }

    /// Physical address of the first byte of this frame.
    #[inline]
    #[must_use]
    pub const fn address(self) -> PhysicalAddress {
        PhysicalAddress(self.0 << PAGE_SHIFT)
    }

    /// The frame `n` frames after this one.
    #[inline]
    #[must_use]
    pub const fn nth(self, n: u64) -> Self {
        Self(self.0 + n)
    }

    /// Number of frames from `base` up to `self`.
    #[inline]
    #[must_use]
    pub const fn offset_from(self, base: Self) -> u64 {
        debug_assert!(self.0 >= base.0);
        self.0 - base.0
    }

    /// Whether the frame number is a multiple of `1 << order`.
    #[inline]
    #[must_use]
    pub const fn is_aligned(self, order: u32) -> bool {
        self.0 & ((1 << order) - 1) == 0
    }

    /// Round down to a multiple of `1 << order` frames.
    #[inline]
    #[must_use]
    pub const fn align_down(self, order: u32) -> Self {
        Self(self.0 & !((1 << order) - 1))
    }
}

impl fmt::Debug for PageFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PageFrame({:#x})", self.0)
    }
}

impl fmt::Display for PageFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pfn {:#x}", self.0)
    }
}

impl From<PageFrame> for PhysicalAddress {
    #[inline]
    fn from(value: PageFrame) -> Self {
        value.address()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_and_join_64k() {
        let a = PhysicalAddress::new(0x0000_0008_1234_5678);
        let p = a.page::<Size64K>();
        let o = a.offset::<Size64K>();
        assert_eq!(p.base().as_u64() & (Size64K::SIZE - 1), 0);
        assert_eq!(p.join(o), a);
    }

    #[test]
    fn frames_per_size() {
        assert_eq!(Size4K::FRAMES, 1);
        assert_eq!(Size64K::FRAMES, 16);
        assert_eq!(Size2M::FRAMES, 512);
    }

    #[test]
    fn frame_round_trip() {
        let a = PhysicalAddress::new(0x20_0fff);
        let f = PageFrame::containing(a);
        assert_eq!(f.pfn(), 0x200);
        assert_eq!(f.address().as_u64(), 0x20_0000);
        assert_eq!(a.page::<Size2M>().first_frame(), PageFrame::new(0x200));
    }

    #[test]
    fn frame_alignment() {
        let f = PageFrame::new(0x1230);
        assert!(f.is_aligned(4));
        assert!(!f.is_aligned(9));
        assert_eq!(f.align_down(9), PageFrame::new(0x1200));
        assert_eq!(f.nth(0x10).offset_from(f), 0x10);
    }

    #[test]
    fn boundary_crossing() {
        let a = PhysicalAddress::new(0x1f_f000);
        assert!(a.fits_boundary(0x1000, Size2M::SIZE));
        assert!(!a.fits_boundary(0x2000, Size2M::SIZE));
        assert!(a.fits_boundary(0x2000, 0));
    }

    #[test]
    fn display_formats() {
        let p = PhysicalAddress::new(0x20_0000).page::<Size2M>();
        assert_eq!(format!("{p}"), "0x0000000000200000/2M");
        assert_eq!(format!("{}", PageFrame::new(0x10)), "pfn 0x10");
    }
}
