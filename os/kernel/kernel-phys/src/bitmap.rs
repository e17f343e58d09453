//! Bitmap-backed physical page allocator.

use crate::{
    AllocRequest, BudgetLimits, DomainBudget, DomainId, FreePool, PageArray, PhysAllocator,
    PhysError, PhysSegment, validate_segments,
};
use alloc::vec;
use alloc::vec::Vec;
use kernel_info::memory::{MAX_FREE_ORDER, PAGE_SHIFT};
use kernel_memory_addresses::{PageFrame, PhysicalAddress};
use kernel_sync::TicketMutex;
use log::{debug, trace};

/// Allocation bits of one segment; a set bit is an allocated frame.
struct SegmentMap {
    first: PageFrame,
    frames: u64,
    used: Vec<u64>,
}

impl SegmentMap {
    fn new(seg: &PhysSegment) -> Self {
        let frames = seg.frames();
        let words = usize::try_from(frames.div_ceil(64)).unwrap_or(0);
        Self {
            first: seg.first_frame(),
            frames,
            used: vec![0; words],
        }
    }

    fn end(&self) -> u64 {
        self.first.pfn() + self.frames
    }

    #[allow(clippy::cast_possible_truncation)]
    fn is_used(&self, pfn: u64) -> bool {
        let i = pfn - self.first.pfn();
        self.used[(i / 64) as usize] & (1 << (i % 64)) != 0
    }

    #[allow(clippy::cast_possible_truncation)]
    fn set(&mut self, pfn: u64, used: bool) {
        let i = pfn - self.first.pfn();
        let word = &mut self.used[(i / 64) as usize];
        if used {
            *word |= 1 << (i % 64);
        } else {
            *word &= !(1 << (i % 64));
        }
    }

    /// Last used frame in `[start, start + n)`, if any.
    fn last_used(&self, start: u64, n: u64) -> Option<u64> {
        (start..start + n).rev().find(|&pfn| self.is_used(pfn))
    }

    fn free_frames(&self) -> u64 {
        self.frames - self.used.iter().map(|w| u64::from(w.count_ones())).sum::<u64>()
    }

    /// Lowest run of `n` free frames in `[lo, hi)` that starts on an
    /// `align` multiple and does not cross a `boundary` multiple (0: none).
    fn find_run(&self, n: u64, lo: u64, hi: u64, align: u64, boundary: u64) -> Option<u64> {
        let hi = hi.min(self.end());
        let mut start = lo.max(self.first.pfn()).next_multiple_of(align);
        while start.checked_add(n)? <= hi {
            if boundary != 0 && (start ^ (start + n - 1)) & !(boundary - 1) != 0 {
                start = start.next_multiple_of(boundary).next_multiple_of(align);
                continue;
            }
            match self.last_used(start, n) {
                None => return Some(start),
                Some(used) => start = (used + 1).next_multiple_of(align),
            }
        }
        None
    }
}

struct DomainFree {
    segments: Vec<SegmentMap>,
}

/// A [`PhysAllocator`] keeping one allocation bitmap per segment.
///
/// Each domain's bitmaps sit behind their own ticket lock.
pub struct BitmapPhysAlloc {
    segments: Vec<PhysSegment>,
    domains: Vec<TicketMutex<DomainFree>>,
    budgets: Vec<DomainBudget>,
    pages: PageArray,
}

impl BitmapPhysAlloc {
    /// # Errors
    /// The segment layout is invalid, see [`validate_segments`].
    pub fn new(segments: &[PhysSegment]) -> Result<Self, PhysError> {
        Self::with_limits(segments, BudgetLimits::default())
    }

    /// # Errors
    /// The segment layout is invalid, see [`validate_segments`].
    pub fn with_limits(segments: &[PhysSegment], limits: BudgetLimits) -> Result<Self, PhysError> {
        let ndomains = validate_segments(segments)?;

        let mut free = vec![0_u64; ndomains];
        let mut maps: Vec<Vec<SegmentMap>> = (0..ndomains).map(|_| Vec::new()).collect();
        for seg in segments {
            free[seg.domain.index()] += seg.frames();
            maps[seg.domain.index()].push(SegmentMap::new(seg));
        }

        for (domain, frames) in free.iter().enumerate() {
            debug!("vm phys: domain {domain}: {frames} free pages");
        }

        Ok(Self {
            segments: segments.to_vec(),
            domains: maps
                .into_iter()
                .map(|segments| TicketMutex::named("vm phys free", DomainFree { segments }))
                .collect(),
            budgets: free
                .into_iter()
                .map(|frames| DomainBudget::new(frames, limits))
                .collect(),
            pages: PageArray::new(segments),
        })
    }

    #[must_use]
    pub fn segments(&self) -> &[PhysSegment] {
        &self.segments
    }

    #[must_use]
    pub fn domains(&self) -> usize {
        self.domains.len()
    }

    /// Frames not handed out by the allocator, in `domain`.
    #[must_use]
    pub fn free_frames(&self, domain: DomainId) -> u64 {
        self.domains.get(domain.index()).map_or(0, |d| {
            d.lock().segments.iter().map(SegmentMap::free_frames).sum()
        })
    }

    /// Free page budget of `domain`.
    #[must_use]
    pub fn budget(&self, domain: DomainId) -> u64 {
        self.budgets.get(domain.index()).map_or(0, DomainBudget::free)
    }

    #[must_use]
    pub fn is_allocated(&self, frame: PageFrame) -> bool {
        let Some(seg) = self.segment_of(frame) else {
            return false;
        };
        let free = self.domains[seg.domain.index()].lock();
        free.segments
            .iter()
            .find(|m| m.first.pfn() <= frame.pfn() && frame.pfn() < m.end())
            .is_some_and(|m| m.is_used(frame.pfn()))
    }

    fn segment_of(&self, frame: PageFrame) -> Option<&PhysSegment> {
        self.segments.iter().find(|s| s.contains(frame))
    }
}

impl PhysAllocator for BitmapPhysAlloc {
    fn alloc_contig(
        &self,
        domain: DomainId,
        npages: u64,
        low: PhysicalAddress,
        high: PhysicalAddress,
        alignment: u64,
        boundary: u64,
    ) -> Option<PageFrame> {
        debug_assert!(alignment.is_power_of_two());
        debug_assert!(boundary == 0 || boundary.is_power_of_two());
        if npages == 0 {
            return None;
        }

        let align = (alignment >> PAGE_SHIFT).max(1);
        let bound = boundary >> PAGE_SHIFT;
        if bound != 0 && npages > bound {
            return None;
        }
        let lo = low.as_u64().div_ceil(1 << PAGE_SHIFT);
        let hi = high.as_u64() >> PAGE_SHIFT;

        let mut free = self.domains.get(domain.index())?.lock();
        for map in &mut free.segments {
            if let Some(start) = map.find_run(npages, lo, hi, align, bound) {
                for pfn in start..start + npages {
                    map.set(pfn, true);
                }
                trace!("vm phys: domain {domain}: alloc {npages} pages at pfn {start:#x}");
                return Some(PageFrame::new(start));
            }
        }
        None
    }

    fn alloc_pages(&self, domain: DomainId, pool: FreePool, order: u32) -> Option<PageFrame> {
        if order > MAX_FREE_ORDER {
            return None;
        }
        trace!("vm phys: domain {domain}: order {order} from {pool:?} pool");
        self.alloc_contig(
            domain,
            1 << order,
            PhysicalAddress::new(0),
            PhysicalAddress::new(u64::MAX),
            1 << (order + PAGE_SHIFT),
            0,
        )
    }

    fn free_pages(&self, frame: PageFrame, order: u32) {
        debug_assert!(frame.is_aligned(order), "{frame} not aligned to order {order}");
        self.free_contig(frame, 1 << order);
    }

    fn free_contig(&self, frame: PageFrame, npages: u64) {
        let Some(seg) = self.segment_of(frame) else {
            panic!("vm phys: free of unmanaged {frame}");
        };
        let mut free = self.domains[seg.domain.index()].lock();
        let map = free
            .segments
            .iter_mut()
            .find(|m| m.first.pfn() <= frame.pfn() && frame.pfn() < m.end());
        let Some(map) = map else {
            panic!("vm phys: no free map for {frame}");
        };
        assert!(frame.pfn() + npages <= map.end(), "vm phys: free crosses segment end");
        for pfn in frame.pfn()..frame.pfn() + npages {
            assert!(map.is_used(pfn), "vm phys: double free of pfn {pfn:#x}");
            map.set(pfn, false);
        }
        trace!("vm phys: domain {}: freed {npages} pages at {frame}", seg.domain);
    }

    fn reserve_budget(&self, domain: DomainId, request: AllocRequest, npages: u64) -> bool {
        self.budgets
            .get(domain.index())
            .is_some_and(|b| b.try_debit(request, npages))
    }

    fn release_budget(&self, domain: DomainId, npages: u64) {
        if let Some(b) = self.budgets.get(domain.index()) {
            b.credit(npages);
        }
    }

    fn page_array(&self) -> &PageArray {
        &self.pages
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const D0: DomainId = DomainId::new(0);
    const MB: u64 = 1 << 20;

    fn alloc() -> BitmapPhysAlloc {
        BitmapPhysAlloc::new(&[PhysSegment::new(0x10_0000, 8 * MB, D0)]).unwrap()
    }

    fn any() -> (PhysicalAddress, PhysicalAddress) {
        (PhysicalAddress::new(0), PhysicalAddress::new(u64::MAX))
    }

    #[test]
    fn order_allocations_are_naturally_aligned() {
        let a = alloc();
        let f = a.alloc_pages(D0, FreePool::Default, 9).unwrap();
        assert!(f.is_aligned(9));
        assert!(f.address().as_u64() >= 0x10_0000);
        assert!(a.is_allocated(f.nth(511)));
        assert!(!a.is_allocated(f.nth(512)));

        let before = a.free_frames(D0);
        a.free_pages(f, 9);
        assert_eq!(a.free_frames(D0), before + 512);
    }

    #[test]
    fn contig_honours_range_alignment_and_boundary() {
        let a = alloc();
        let (_, high) = any();
        let low = PhysicalAddress::new(3 * MB + 0x1000);
        let f = a.alloc_contig(D0, 8, low, high, 0x8000, 0x10000).unwrap();
        let addr = f.address();
        assert!(addr >= low);
        assert!(addr.is_aligned(0x8000));
        assert!(addr.fits_boundary(8 << PAGE_SHIFT, 0x10000));
    }

    #[test]
    fn contig_respects_high_limit() {
        let a = alloc();
        let (low, _) = any();
        let high = PhysicalAddress::new(0x10_4000);
        assert!(a.alloc_contig(D0, 4, low, high, 0x1000, 0).is_some());
        assert!(a.alloc_contig(D0, 1, low, high, 0x1000, 0).is_none());
    }

    #[test]
    fn freeing_partial_runs() {
        let a = alloc();
        let f = a.alloc_pages(D0, FreePool::Default, 4).unwrap();
        a.free_contig(f.nth(2), 3);
        assert!(a.is_allocated(f.nth(1)));
        assert!(!a.is_allocated(f.nth(2)));
        assert!(!a.is_allocated(f.nth(4)));
        assert!(a.is_allocated(f.nth(5)));
    }

    #[test]
    #[should_panic(expected = "double free")]
    fn double_free_panics() {
        let a = alloc();
        let f = a.alloc_pages(D0, FreePool::Default, 0).unwrap();
        a.free_pages(f, 0);
        a.free_pages(f, 0);
    }

    #[test]
    fn budget_is_per_domain() {
        let a = BitmapPhysAlloc::new(&[
            PhysSegment::new(0, MB, D0),
            PhysSegment::new(MB, 2 * MB, DomainId::new(1)),
        ])
        .unwrap();
        assert_eq!(a.domains(), 2);
        assert!(a.reserve_budget(DomainId::new(1), AllocRequest::normal(), 256));
        assert!(!a.reserve_budget(DomainId::new(1), AllocRequest::normal(), 1));
        assert_eq!(a.budget(D0), 256);
        a.release_budget(DomainId::new(1), 1);
        assert_eq!(a.budget(DomainId::new(1)), 1);
    }
}
