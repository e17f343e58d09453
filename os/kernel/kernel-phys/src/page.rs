//! Per-frame metadata.

use crate::PhysSegment;
use alloc::boxed::Box;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU8, Ordering};
use kernel_memory_addresses::PageFrame;

/// Metadata for one base page frame.
#[derive(Debug, Default)]
pub struct VmPage {
    /// Superpage index: 0 for a plain page, `n` when the run this page heads
    /// may be mapped with the `n`-th larger page size.
    psind: AtomicU8,
}

impl VmPage {
    #[inline]
    #[must_use]
    pub fn psind(&self) -> u8 {
        self.psind.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn set_psind(&self, psind: u8) {
        self.psind.store(psind, Ordering::Relaxed);
    }
}

struct Range {
    first: PageFrame,
    frames: u64,
    base: usize,
}

/// One [`VmPage`] for every frame of every segment.
pub struct PageArray {
    ranges: Vec<Range>,
    pages: Box<[VmPage]>,
}

impl PageArray {
    /// Segments must already be sorted.
    #[must_use]
    pub fn new(segments: &[PhysSegment]) -> Self {
        let mut ranges = Vec::with_capacity(segments.len());
        let mut base = 0;
        for seg in segments {
            ranges.push(Range {
                first: seg.first_frame(),
                frames: seg.frames(),
                base,
            });
            base += usize::try_from(seg.frames()).unwrap_or(usize::MAX);
        }

        let pages = (0..base).map(|_| VmPage::default()).collect();
        Self { ranges, pages }
    }

    /// The metadata of `frame`, if it is managed memory.
    #[must_use]
    pub fn get(&self, frame: PageFrame) -> Option<&VmPage> {
        let idx = self.ranges.partition_point(|r| r.first <= frame);
        let range = self.ranges.get(idx.checked_sub(1)?)?;
        let off = frame.offset_from(range.first);
        if off >= range.frames {
            return None;
        }
        self.pages.get(range.base + usize::try_from(off).ok()?)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.pages.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }
}
