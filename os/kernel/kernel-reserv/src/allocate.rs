//! Allocation from existing or new reservations.

use crate::object::{ObjectPage, VmObject};
use crate::reserv::{Reserv, ReservState};
use crate::{ReservError, ReservLevel, ReservManager, to_usize};
use alloc::sync::Arc;
use core::cmp::max;
use kernel_info::memory::{PAGE_SHIFT, PAGE_SIZE};
use kernel_memory_addresses::{PageFrame, PhysicalAddress};
use kernel_phys::{AllocRequest, DomainId, FreePool};
use log::trace;

/// Physical constraints of a contiguous allocation.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct ContigRequest {
    pub npages: u64,
    /// Lowest acceptable address.
    pub low: PhysicalAddress,
    /// One past the highest acceptable address.
    pub high: PhysicalAddress,
    /// Power of two, in bytes.
    pub alignment: u64,
    /// Power of two in bytes the run must not cross; 0 for none.
    pub boundary: u64,
}

impl ContigRequest {
    /// `npages` anywhere, page aligned, without boundary.
    #[must_use]
    pub const fn new(npages: u64) -> Self {
        Self {
            npages,
            low: PhysicalAddress::new(0),
            high: PhysicalAddress::new(u64::MAX),
            alignment: PAGE_SIZE,
            boundary: 0,
        }
    }

    #[must_use]
    pub const fn with_range(mut self, low: PhysicalAddress, high: PhysicalAddress) -> Self {
        self.low = low;
        self.high = high;
        self
    }

    #[must_use]
    pub const fn with_alignment(mut self, alignment: u64) -> Self {
        self.alignment = alignment;
        self
    }

    #[must_use]
    pub const fn with_boundary(mut self, boundary: u64) -> Self {
        self.boundary = boundary;
        self
    }

    /// Bytes requested.
    #[inline]
    #[must_use]
    pub const fn size(&self) -> u64 {
        self.npages << PAGE_SHIFT
    }

    /// Whether a run starting at `pa` satisfies every constraint.
    #[must_use]
    pub const fn admits(&self, pa: PhysicalAddress) -> bool {
        let Some(end) = pa.as_u64().checked_add(self.size()) else {
            return false;
        };
        pa.as_u64() >= self.low.as_u64()
            && end <= self.high.as_u64()
            && pa.is_aligned(self.alignment)
            && pa.fits_boundary(self.size(), self.boundary)
    }
}

/// An existing reservation covering the requested offset, and the object's
/// next resident page after the predecessor.
struct Neighbourhood<'a> {
    found: Option<&'a Reserv>,
    succ: Option<ObjectPage>,
}

impl ReservManager {
    /// Allocates the page for `object` at `pindex` from a reservation,
    /// creating one in `domain` if none covers `pindex` yet.
    ///
    /// `mpred` must be the resident page immediately preceding `pindex` in
    /// `object`, if any.
    ///
    /// # Errors
    /// - [`ReservError::Impossible`] when `pindex` cannot be served from a
    ///   reservation at all.
    /// - [`ReservError::RaceLost`] when the covering reservation changed
    ///   before it was locked.
    /// - [`ReservError::Exhausted`] when the page budget or the physical
    ///   allocator ran dry.
    pub fn alloc_page(
        &self,
        object: &Arc<VmObject>,
        pindex: u64,
        domain: DomainId,
        request: AllocRequest,
        mpred: Option<ObjectPage>,
    ) -> Result<PageFrame, ReservError> {
        if pindex < object.reserv_index(pindex, self.capacity(ReservLevel::Level0))
            || pindex >= object.size()
        {
            return Err(ReservError::Impossible);
        }

        let near = self.find_in_object(object, pindex, mpred);
        if let Some(rv) = near.found {
            let level = rv.level();
            let index = to_usize(object.reserv_index(pindex, self.capacity(level)));
            let mut state = rv.state.lock();
            if !self.still_covers(rv, object, pindex, level) || state.popmap.is_set(index) {
                return Err(ReservError::RaceLost);
            }
            if !self.phys.reserve_budget(rv.domain, request, 1) {
                return Err(ReservError::Exhausted);
            }
            self.populate(rv, &mut state, index);
            return Ok(rv.first_frame().nth(index as u64));
        }

        for level in ReservLevel::LARGEST_FIRST {
            let cap = self.capacity(level);
            let index = object.reserv_index(pindex, cap);
            let Some(first) = pindex.checked_sub(index) else {
                continue;
            };
            let (leftcap, rightcap) = self.caps(object, mpred, near.succ);
            if leftcap > first || first + cap > rightcap {
                continue;
            }
            if !self.growth.may_grow(object) && first + cap > object.size() {
                continue;
            }

            if !self.phys.reserve_budget(domain, request, 1) {
                continue;
            }
            let Some(frame) =
                self.phys
                    .alloc_pages(domain, FreePool::Default, self.config.order(level))
            else {
                self.phys.release_budget(domain, 1);
                continue;
            };

            let rv = self.slot_for_run(frame, level);
            debug_assert_eq!(rv.domain, domain);
            let mut state = rv.state.lock();
            self.insert(rv, &mut state, object, first, level);
            self.populate(rv, &mut state, to_usize(index));
            return Ok(frame.nth(index));
        }

        Err(ReservError::Exhausted)
    }

    /// Allocates `contig.npages` physically contiguous pages for `object`
    /// starting at `pindex`, from an existing reservation or from new ones.
    /// A new run may span several reservations; pages past the last whole
    /// reservation are handed out as plain pages.
    ///
    /// Returns the frame backing `pindex`.
    ///
    /// # Errors
    /// As [`ReservManager::alloc_page`]; [`ReservError::Impossible`] also
    /// covers an existing reservation whose placement cannot meet the
    /// constraints.
    pub fn alloc_contig(
        &self,
        object: &Arc<VmObject>,
        pindex: u64,
        domain: DomainId,
        request: AllocRequest,
        mpred: Option<ObjectPage>,
        contig: &ContigRequest,
    ) -> Result<PageFrame, ReservError> {
        let npages = contig.npages;
        debug_assert!(contig.alignment.is_power_of_two());
        debug_assert!(contig.boundary == 0 || contig.boundary.is_power_of_two());
        if npages == 0 {
            return Err(ReservError::Impossible);
        }

        // The low bits of the physical address follow from the offset
        // within the smallest reservation.
        let index0 = object.reserv_index(pindex, self.capacity(ReservLevel::Level0));
        let fits_object = pindex
            .checked_add(npages)
            .is_some_and(|end| end <= object.size());
        if pindex < index0 || !fits_object {
            return Err(ReservError::Impossible);
        }
        let pa = PhysicalAddress::new(index0 << PAGE_SHIFT);
        if !pa.is_aligned(contig.alignment) || !pa.fits_boundary(contig.size(), contig.boundary) {
            return Err(ReservError::Impossible);
        }

        let near = self.find_in_object(object, pindex, mpred);
        if let Some(rv) = near.found {
            return self.alloc_contig_existing(rv, object, pindex, request, contig);
        }

        for level in ReservLevel::LARGEST_FIRST {
            let cap = self.capacity(level);
            let level_size = self.config.size(level);
            let index = object.reserv_index(pindex, cap);
            let Some(first) = pindex.checked_sub(index) else {
                continue;
            };

            let rel = PhysicalAddress::new(index << PAGE_SHIFT);
            if !rel.is_aligned(contig.alignment)
                || (contig.boundary <= level_size
                    && !rel.fits_boundary(contig.size(), contig.boundary))
            {
                continue;
            }

            let minpages = index + npages;
            let maxpages = minpages.next_multiple_of(cap);
            let mut allocpages = maxpages;

            let (leftcap, rightcap) = self.caps(object, mpred, near.succ);
            if leftcap > first {
                continue;
            }
            if first + maxpages > rightcap {
                if maxpages == cap {
                    continue;
                }
                // the last reservation would collide; allocate its pages
                // without one
                allocpages = minpages;
            }
            if !self.growth.may_grow(object) && first + maxpages > object.size() {
                if maxpages == cap {
                    continue;
                }
                allocpages = minpages;
            }

            if !self.phys.reserve_budget(domain, request, npages) {
                continue;
            }
            let boundary = if contig.boundary > level_size {
                contig.boundary
            } else {
                0
            };
            let Some(run) = self.phys.alloc_contig(
                domain,
                allocpages,
                contig.low,
                contig.high,
                max(contig.alignment, level_size),
                boundary,
            ) else {
                self.phys.release_budget(domain, npages);
                continue;
            };

            let ret = run.nth(index);
            self.bind_run(object, run, first, level, index, npages, allocpages);
            trace!(
                "vm reserv: contig {npages} pages for {} at pindex {pindex}: {ret}",
                object.id()
            );
            return Ok(ret);
        }

        Err(ReservError::Exhausted)
    }

    fn alloc_contig_existing(
        &self,
        rv: &Reserv,
        object: &VmObject,
        pindex: u64,
        request: AllocRequest,
        contig: &ContigRequest,
    ) -> Result<PageFrame, ReservError> {
        let level = rv.level();
        let index = object.reserv_index(pindex, self.capacity(level));
        if index + contig.npages > self.capacity(level) {
            return Err(ReservError::Impossible);
        }

        let mut state = rv.state.lock();
        if !self.still_covers(rv, object, pindex, level) {
            return Err(ReservError::RaceLost);
        }
        let frame = rv.first_frame().nth(index);
        if !contig.admits(frame.address()) {
            return Err(ReservError::Impossible);
        }
        let range = to_usize(index)..to_usize(index + contig.npages);
        if range.clone().any(|i| state.popmap.is_set(i)) {
            return Err(ReservError::RaceLost);
        }
        if !self.phys.reserve_budget(rv.domain, request, contig.npages) {
            return Err(ReservError::Exhausted);
        }
        for i in range {
            self.populate(rv, &mut state, i);
        }
        Ok(frame)
    }

    /// Binds every whole reservation of a fresh `allocpages` run and
    /// populates the `npages` pages starting at `index`.
    #[allow(clippy::too_many_arguments)]
    fn bind_run(
        &self,
        object: &Arc<VmObject>,
        mut frame: PageFrame,
        mut first: u64,
        level: ReservLevel,
        mut index: u64,
        mut npages: u64,
        mut allocpages: u64,
    ) {
        let cap = self.capacity(level);
        while allocpages >= cap {
            let rv = self.slot_for_run(frame, level);
            let mut state = rv.state.lock();
            self.insert(rv, &mut state, object, first, level);
            let n = (cap - index).min(npages);
            for i in index..index + n {
                self.populate(rv, &mut state, to_usize(i));
            }
            drop(state);

            npages -= n;
            index = 0;
            frame = frame.nth(cap);
            first += cap;
            allocpages -= cap;
        }
    }

    /// Looks for `object`'s reservation covering `pindex` through the
    /// predecessor page, then the successor page.
    fn find_in_object(
        &self,
        object: &VmObject,
        pindex: u64,
        mpred: Option<ObjectPage>,
    ) -> Neighbourhood<'_> {
        let succ = match mpred {
            Some(pred) => {
                debug_assert!(pred.pindex < pindex, "mpred doesn't precede pindex");
                if let Some(rv) = self.array.locate(pred.frame)
                    && self.covers(rv, object, pindex)
                {
                    return Neighbourhood {
                        found: Some(rv),
                        succ: None,
                    };
                }
                object.successor(Some(pred.pindex))
            }
            None => object.successor(None),
        };

        let found = succ.and_then(|s| {
            debug_assert!(s.pindex > pindex, "msucc doesn't succeed pindex");
            self.array
                .locate(s.frame)
                .filter(|rv| self.covers(rv, object, pindex))
        });
        Neighbourhood { found, succ }
    }

    fn covers(&self, rv: &Reserv, object: &VmObject, pindex: u64) -> bool {
        rv.belongs_to(object) && rv.has_pindex(pindex, self.capacity(rv.level()))
    }

    /// [`Self::covers`] after locking, with the level unchanged.
    fn still_covers(&self, rv: &Reserv, object: &VmObject, pindex: u64, level: ReservLevel) -> bool {
        rv.level() == level && self.covers(rv, object, pindex)
    }

    /// The first offset a new reservation may use (`leftcap`) and the first
    /// it may not (`rightcap`), judged from the neighbouring pages.
    fn caps(
        &self,
        object: &VmObject,
        mpred: Option<ObjectPage>,
        msucc: Option<ObjectPage>,
    ) -> (u64, u64) {
        // pindex and object of the neighbours' reservations are stable
        // against rename while the list lock is held
        let _rvq = object.rvq().lock();
        let leftcap = mpred.map_or(0, |pred| match self.array.locate(pred.frame) {
            Some(rv) if rv.belongs_to(object) => {
                rv.pindex().saturating_add(self.capacity(rv.level()))
            }
            _ => pred.pindex + 1,
        });
        let rightcap = msucc.map_or(u64::MAX, |succ| match self.array.locate(succ.frame) {
            Some(rv) if rv.belongs_to(object) => rv.pindex(),
            _ => succ.pindex,
        });
        (leftcap, rightcap)
    }

    /// Marks page `index` of `rv` populated.
    pub(crate) fn populate(&self, rv: &Reserv, state: &mut ReservState, index: usize) {
        let level = rv.level();
        let cap = self.capacity(level);
        let first = rv.first_frame();
        assert!(rv.is_active(), "vm reserv: {} is free", rv.index);
        assert!(
            state.popmap.is_clear(index),
            "vm reserv: {}'s popmap[{index}] is set",
            rv.index
        );
        assert!(
            u64::from(state.popcnt) < cap,
            "vm reserv: {} is already full",
            rv.index
        );
        debug_assert!(
            self.psind(first) < ReservLevel::Level1.psind(),
            "vm reserv: {} is already promoted",
            rv.index
        );

        state.popmap.set(index);
        let sub = to_usize(self.capacity(ReservLevel::Level0));
        let head = index - index % sub;
        if state.popmap.is_run_full(head, sub) {
            self.set_psind(first.nth(head as u64), ReservLevel::Level0.psind());
        }
        rv.set_popcnt(state, state.popcnt + 1);
        trace!(
            "vm reserv: populate {} [{index}] popcnt {}",
            rv.index,
            state.popcnt
        );

        let now = self.ticks();
        let full = u64::from(state.popcnt) == cap;
        if now.wrapping_sub(state.lasttick) < self.config.partpop_slop && state.inpartpopq && !full
        {
            return;
        }
        state.lasttick = now;
        self.requeue(rv, state);
        if full {
            self.set_psind(first, level.psind());
        }
    }
}
