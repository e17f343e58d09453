use crate::PhysError;
use core::fmt;
use kernel_info::memory::{MAX_DOMAINS, PAGE_SIZE};
use kernel_memory_addresses::{PageFrame, PhysicalAddress};

/// Index of a memory (NUMA) domain.
#[repr(transparent)]
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct DomainId(u8);

impl DomainId {
    #[inline]
    #[must_use]
    pub const fn new(id: u8) -> Self {
        Self(id)
    }

    #[inline]
    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for DomainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A contiguous range of physical memory belonging to one domain.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct PhysSegment {
    pub start: PhysicalAddress,
    pub end: PhysicalAddress,
    pub domain: DomainId,
}

impl PhysSegment {
    #[must_use]
    pub const fn new(start: u64, end: u64, domain: DomainId) -> Self {
        Self {
            start: PhysicalAddress::new(start),
            end: PhysicalAddress::new(end),
            domain,
        }
    }

    #[inline]
    #[must_use]
    pub const fn first_frame(&self) -> PageFrame {
        PageFrame::containing(self.start)
    }

    /// One past the last frame of the segment.
    #[inline]
    #[must_use]
    pub const fn end_frame(&self) -> PageFrame {
        PageFrame::containing(self.end)
    }

    #[inline]
    #[must_use]
    pub const fn frames(&self) -> u64 {
        self.end_frame().pfn() - self.first_frame().pfn()
    }

    #[inline]
    #[must_use]
    pub const fn contains(&self, frame: PageFrame) -> bool {
        frame.pfn() >= self.first_frame().pfn() && frame.pfn() < self.end_frame().pfn()
    }
}

/// Checks that `segments` are non-empty, page aligned, sorted and disjoint.
///
/// Returns the number of domains spanned (highest domain id plus one).
///
/// # Errors
/// The first [`PhysError`] found, in segment order.
pub fn validate_segments(segments: &[PhysSegment]) -> Result<usize, PhysError> {
    if segments.is_empty() {
        return Err(PhysError::NoSegments);
    }

    let mut ndomains = 0;
    let mut prev_end = 0;
    for seg in segments {
        let (start, end) = (seg.start.as_u64(), seg.end.as_u64());
        if start >= end || !seg.start.is_aligned(PAGE_SIZE) || !seg.end.is_aligned(PAGE_SIZE) {
            return Err(PhysError::BadSegment { start, end });
        }
        if start < prev_end {
            return Err(PhysError::Unordered(start));
        }
        if seg.domain.index() >= MAX_DOMAINS {
            return Err(PhysError::DomainOutOfRange(seg.domain.0));
        }
        prev_end = end;
        ndomains = ndomains.max(seg.domain.index() + 1);
    }
    Ok(ndomains)
}
