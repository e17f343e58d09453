//! Freeing pages and breaking reservations.

use crate::allocate::ContigRequest;
use crate::domain::ReservDomain;
use crate::object::VmObject;
use crate::queue::{PartPopQueue, QueueNode};
use crate::reserv::{Reserv, ReservIndex, ReservState};
use crate::{ReservLevel, ReservManager, to_usize};
use kernel_info::memory::{PAGE_SHIFT, PAGE_SIZE, RESERV_LEVELS};
use kernel_memory_addresses::PageFrame;
use kernel_phys::DomainId;
use kernel_sync::SpinMutexGuard;
use log::{debug, trace};

type Queues<'a> = SpinMutexGuard<'a, [PartPopQueue; RESERV_LEVELS]>;

/// Outcome of trying to lock a queued reservation during a contiguous scan.
enum ScanStep<'a> {
    /// The candidate is locked and still queued.
    Found(&'a Reserv, SpinMutexGuard<'a, ReservState>),
    /// The candidate moved while the domain lock was dropped; resume at the
    /// reservation that followed the marker.
    Invalidated(Option<ReservIndex>),
    EndOfQueue,
}

impl ReservManager {
    /// Returns `frame` to its reservation. `false` if `frame` does not belong
    /// to one and must be freed as a plain page.
    pub fn free_page(&self, frame: PageFrame) -> bool {
        let Some(rv) = self.array.locate(frame) else {
            return false;
        };
        if !rv.is_active() {
            return false;
        }
        let mut state = rv.state.lock();
        if !rv.is_active() {
            return false;
        }
        let index = frame.offset_from(rv.first_frame());
        if index >= self.capacity(rv.level()) {
            return false;
        }
        self.depopulate(rv, &mut state, to_usize(index));
        true
    }

    /// Breaks every reservation of `object`, returning their unpopulated
    /// pages to the physical allocator. Populated pages stay with the object
    /// as plain pages.
    pub fn break_all(&self, object: &VmObject) {
        loop {
            // read without holding the list lock across the reservation lock
            let Some(idx) = object.rvq().lock().first().copied() else {
                break;
            };
            let rv = self.array.get(idx);
            let mut state = rv.state.lock();
            if !rv.belongs_to(object) {
                continue;
            }
            if state.inpartpopq {
                let mut queues = self.domains[rv.domain.index()].queues.lock();
                Self::dequeue(rv, &mut state, &mut queues);
            }
            self.break_reserv(rv, &mut state);
        }
    }

    /// Breaks the least recently changed reservation of `domain` that is not
    /// locked by someone else, largest level first.
    pub fn reclaim_inactive(&self, domain: DomainId) -> bool {
        let Some(rvd) = self.domain(domain) else {
            return false;
        };
        let mut queues = rvd.queues.lock();
        for level in ReservLevel::LARGEST_FIRST {
            let mut cursor = queues[level.index()].front();
            while let Some(idx) = cursor {
                let rv = self.array.get(idx);
                // a locked reservation is being changed; skip it
                if let Some(mut state) = rv.state.try_lock() {
                    Self::dequeue(rv, &mut state, &mut queues);
                    drop(queues);
                    self.break_reserv(rv, &mut state);
                    self.stats.count_reclaimed();
                    debug!("vm reserv: domain {domain}: reclaimed inactive {idx}");
                    return true;
                }
                cursor = queues[level.index()].next_reserv(idx);
            }
        }
        false
    }

    /// Breaks the least recently changed reservation of `domain` whose free
    /// pages could satisfy `contig`. Never breaks more than one.
    pub fn reclaim_contig(&self, domain: DomainId, contig: &ContigRequest) -> bool {
        debug_assert!(contig.alignment.is_power_of_two());
        debug_assert!(contig.boundary == 0 || contig.boundary.is_power_of_two());
        if contig.npages == 0 {
            return false;
        }
        // a run starting on a boundary multiple must not contain another
        if contig.boundary != 0 && contig.size() > contig.boundary {
            return false;
        }
        let Some(rvd) = self.domain(domain) else {
            return false;
        };
        ReservLevel::LARGEST_FIRST
            .into_iter()
            .filter(|&level| contig.npages < self.capacity(level))
            .any(|level| self.reclaim_contig_level(rvd, level, contig))
    }

    fn reclaim_contig_level(
        &self,
        rvd: &ReservDomain,
        level: ReservLevel,
        contig: &ContigRequest,
    ) -> bool {
        let q = level.index();
        let cap = self.capacity(level);
        let level_size = self.config.size(level);
        let size = contig.size();
        let (low, high) = (contig.low.as_u64(), contig.high.as_u64());

        // page-granular alignment and boundary, clamped to the level size
        let ppn_align = to_usize(contig.alignment.clamp(PAGE_SIZE, level_size) >> PAGE_SHIFT);
        let bound = if contig.boundary == 0 {
            level_size
        } else {
            contig.boundary.clamp(PAGE_SIZE, level_size)
        };
        let ppn_bound = to_usize(bound >> PAGE_SHIFT);

        let scan = rvd.scan[q].lock();
        let mut queues = rvd.queues.lock();
        let mut cursor = queues[q].front();
        loop {
            let step = match cursor {
                None => ScanStep::EndOfQueue,
                Some(idx) => {
                    let rv = self.array.get(idx);
                    let pa = rv.first_frame().address().as_u64();
                    if pa + level_size - size < low
                        || pa + size > high
                        || pa & (contig.alignment - 1) != 0
                    {
                        cursor = queues[q].next_reserv(idx);
                        continue;
                    }
                    match rv.state.try_lock() {
                        Some(state) => ScanStep::Found(rv, state),
                        None => {
                            let (relocked, step) = Self::lock_behind_marker(rvd, queues, q, rv);
                            queues = relocked;
                            step
                        }
                    }
                }
            };

            let (rv, mut state) = match step {
                ScanStep::EndOfQueue => return false,
                ScanStep::Invalidated(next) => {
                    cursor = next;
                    continue;
                }
                ScanStep::Found(rv, state) => (rv, state),
            };
            drop(queues);

            let pa = rv.first_frame().address().as_u64();
            let lo = if pa >= low {
                0
            } else {
                to_usize((low - pa).div_ceil(PAGE_SIZE))
            };
            let hi = if pa + level_size <= high {
                to_usize(cap)
            } else {
                to_usize((high - pa) >> PAGE_SHIFT)
            };
            let found = state.popmap.find_contig(
                to_usize(cap),
                lo,
                hi,
                to_usize(contig.npages),
                ppn_align,
                ppn_bound,
            );
            if let Some(posn) = found {
                let start = rv.first_frame().nth(posn as u64).address();
                debug_assert!(start.is_aligned(contig.alignment));
                debug_assert!(start.fits_boundary(size, contig.boundary));
                drop(scan);
                self.reclaim(rv, &mut state);
                debug!(
                    "vm reserv: reclaimed {} for {} contiguous pages at {start}",
                    rv.index, contig.npages
                );
                return true;
            }

            queues = rvd.queues.lock();
            cursor = queues[q].next_reserv(rv.index);
            drop(state);
        }
    }

    /// Locks `rv` without holding the domain lock while waiting: the marker
    /// keeps the scan position, and `rv` is only accepted if the marker still
    /// directly follows it afterwards.
    fn lock_behind_marker<'a>(
        rvd: &'a ReservDomain,
        mut queues: Queues<'a>,
        q: usize,
        rv: &'a Reserv,
    ) -> (Queues<'a>, ScanStep<'a>) {
        let node = QueueNode::Reserv(rv.index);
        queues[q].insert_after(node, QueueNode::Marker);
        drop(queues);

        let state = rv.state.lock();
        let mut queues = rvd.queues.lock();
        let unmoved = queues[q].prev(QueueNode::Marker) == Some(node);
        let after = queues[q].remove(QueueNode::Marker);
        if unmoved {
            return (queues, ScanStep::Found(rv, state));
        }
        drop(state);
        let next = queues[q].reserv_from(after);
        (queues, ScanStep::Invalidated(next))
    }

    /// Marks page `index` of `rv` unpopulated; frees the whole run once the
    /// reservation is empty.
    pub(crate) fn depopulate(&self, rv: &Reserv, state: &mut ReservState, index: usize) {
        let level = rv.level();
        let cap = self.capacity(level);
        let first = rv.first_frame();
        assert!(rv.is_active(), "vm reserv: {} is free", rv.index);
        assert!(
            state.popmap.is_set(index),
            "vm reserv: {}'s popmap[{index}] is clear",
            rv.index
        );
        assert!(state.popcnt > 0, "vm reserv: {}'s popcnt is corrupted", rv.index);

        // demote before the bit goes away
        if level == ReservLevel::Level1 && u64::from(state.popcnt) == cap {
            debug_assert_eq!(
                self.psind(first),
                level.psind(),
                "vm reserv: {} is already demoted",
                rv.index
            );
            self.set_psind(first, ReservLevel::Level0.psind());
        }
        let sub = to_usize(self.capacity(ReservLevel::Level0));
        let head = index - index % sub;
        if state.popmap.is_run_full(head, sub) {
            self.set_psind(first.nth(head as u64), 0);
        }

        state.popmap.clear(index);
        rv.set_popcnt(state, state.popcnt - 1);
        trace!(
            "vm reserv: depopulate {} [{index}] popcnt {}",
            rv.index,
            state.popcnt
        );

        let now = self.ticks();
        if now.wrapping_sub(state.lasttick) >= self.config.partpop_slop
            || state.popcnt == 0
            || !state.inpartpopq
        {
            self.requeue(rv, state);
            state.lasttick = now;
        }

        if state.popcnt == 0 {
            self.remove(rv, state);
            self.phys.free_pages(first, self.config.order(level));
            self.stats.count_freed();
        }
        self.phys.release_budget(rv.domain, 1);
    }

    /// Breaks `rv` for reclamation, taking it off its queue first.
    fn reclaim(&self, rv: &Reserv, state: &mut ReservState) {
        if state.inpartpopq {
            let mut queues = self.domains[rv.domain.index()].queues.lock();
            Self::dequeue(rv, state, &mut queues);
        }
        self.break_reserv(rv, state);
        self.stats.count_reclaimed();
    }

    /// Detaches `rv` and returns every unpopulated run to the physical
    /// allocator. `rv` must not be queued.
    pub(crate) fn break_reserv(&self, rv: &Reserv, state: &mut ReservState) {
        let cap = to_usize(self.capacity(rv.level()));
        let first = rv.first_frame();
        trace!(
            "vm reserv: break {} {} popcnt {}",
            rv.index,
            rv.object_id(),
            state.popcnt
        );
        self.remove(rv, state);

        for run in state.popmap.free_runs(cap) {
            self.phys
                .free_contig(first.nth(run.start as u64), run.len() as u64);
        }
        let sub = to_usize(self.capacity(ReservLevel::Level0));
        for head in (0..cap).step_by(sub) {
            self.set_psind(first.nth(head as u64), 0);
        }
        state.popmap.clear_all();
        rv.set_popcnt(state, 0);
        self.stats.count_broken();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::{ObjectKind, VmObject};
    use crate::testing::{D0, manager};
    use kernel_memory_addresses::PhysicalAddress;
    use kernel_phys::AllocRequest;
    use std::sync::Barrier;
    use std::time::Duration;

    fn anon_page(m: &ReservManager) -> (alloc::sync::Arc<VmObject>, PageFrame) {
        let object = VmObject::new(ObjectKind::Anonymous, 512);
        let frame = m
            .alloc_page(&object, 0, D0, AllocRequest::normal(), None)
            .unwrap();
        object.insert_page(0, frame);
        (object, frame)
    }

    #[test]
    fn contig_scan_skips_reservations_out_of_range_without_locking() {
        let (m, _) = manager(4);
        let (_object, frame) = anon_page(&m);
        let rv = m.array.locate(frame).unwrap();

        // a held lock would deadlock the scan if it tried to take it
        let _held = rv.state.lock();
        let below = ContigRequest::new(4)
            .with_range(PhysicalAddress::new(0), PhysicalAddress::new(0x10000));
        assert!(!m.reclaim_contig(D0, &below));
        assert!(!rvd_has_marker(&m));
    }

    #[test]
    fn contig_scan_waits_behind_marker() {
        let (m, _) = manager(4);
        let (_object, frame) = anon_page(&m);
        let rv = m.array.locate(frame).unwrap();
        let barrier = Barrier::new(2);

        std::thread::scope(|s| {
            s.spawn(|| {
                let held = rv.state.lock();
                barrier.wait();
                std::thread::sleep(Duration::from_millis(50));
                drop(held);
            });
            barrier.wait();
            assert!(m.reclaim_contig(D0, &ContigRequest::new(8)));
        });

        assert!(!rv.is_active());
        assert!(!rvd_has_marker(&m));
        assert_eq!(m.stats().reclaimed, 1);
        assert_eq!(m.stats().broken, 1);
    }

    #[test]
    fn contig_scan_resumes_after_moved_candidate() {
        let (m, _) = manager(4);
        let (_a, first) = anon_page(&m);
        let (_b, second) = anon_page(&m);
        let older = m.array.locate(first).unwrap();
        let newer = m.array.locate(second).unwrap();
        let barrier = Barrier::new(2);

        std::thread::scope(|s| {
            s.spawn(|| {
                let mut held = older.state.lock();
                barrier.wait();
                while !rvd_has_marker(&m) {
                    std::thread::yield_now();
                }
                // moved to the tail while the scanner waits on its lock
                m.requeue(older, &mut held);
                drop(held);
            });
            barrier.wait();
            assert!(m.reclaim_contig(D0, &ContigRequest::new(8)));
        });

        assert!(older.is_active());
        assert!(!newer.is_active());
        assert!(!rvd_has_marker(&m));
        assert_eq!(m.reservation(first).map(|rv| rv.queued), Some(true));
        assert_eq!(m.stats().reclaimed, 1);
        m.audit();
    }

    #[test]
    fn contig_scan_rejects_full_windows() {
        let (m, _) = manager(4);
        let (_object, _frame) = anon_page(&m);
        // 511 free pages remain, but never 512
        assert!(!m.reclaim_contig(D0, &ContigRequest::new(512)));
        let boundary = ContigRequest::new(32).with_boundary(16 * 4096);
        assert!(!m.reclaim_contig(D0, &boundary));
        assert_eq!(m.stats().reclaimed, 0);
    }

    #[test]
    fn inactive_reclaim_skips_locked_reservations() {
        let (m, phys) = manager(4);
        let (_a, first) = anon_page(&m);
        let (_b, second) = anon_page(&m);
        let older = m.array.locate(first).unwrap();
        let newer = m.array.locate(second).unwrap();
        let free_before = phys.free_frames(D0);

        let held = older.state.lock();
        assert!(m.reclaim_inactive(D0));
        drop(held);

        assert!(older.is_active());
        assert!(!newer.is_active());
        assert_eq!(phys.free_frames(D0), free_before + 511);
        // the populated page stays with its object as a plain page
        assert!(phys.is_allocated(second));
        assert!(!m.free_page(second));
    }

    #[test]
    fn break_all_dequeues_first() {
        let (m, phys) = manager(4);
        let (object, frame) = anon_page(&m);
        let total = phys.free_frames(D0) + 512;
        m.break_all(&object);
        assert!(object.reservations().is_empty());
        assert_eq!(m.audit().active, 0);
        assert_eq!(phys.free_frames(D0), total - 1);
        assert_eq!(m.level(frame), None);
    }

    fn rvd_has_marker(m: &ReservManager) -> bool {
        let queues = m.domains[0].queues.lock();
        queues.iter().any(|q| q.contains(QueueNode::Marker))
    }

    #[test]
    fn domain_out_of_range() {
        let (m, _) = manager(4);
        assert!(!m.reclaim_inactive(DomainId::new(3)));
        assert!(!m.reclaim_contig(DomainId::new(3), &ContigRequest::new(1)));
    }
}
