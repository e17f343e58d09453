//! The reservation manager: construction, bookkeeping shared by allocation
//! and reclamation, and the read-only queries.

use crate::array::ReservArray;
use crate::domain::ReservDomain;
use crate::object::{GrowthPolicy, ObjectId, VmObject};
use crate::queue::{PartPopQueue, QueueNode};
use crate::reserv::{Reserv, ReservIndex, ReservState};
use crate::stats::{PartPopReport, PartPopRow, ReservCounters, ReservStats};
use crate::{ArrayMode, ReservConfig, ReservLevel, StartupError, to_usize};
use alloc::boxed::Box;
use alloc::sync::{Arc, Weak};
use core::fmt;
use core::sync::atomic::{AtomicU32, Ordering};
use kernel_info::memory::{PAGE_SIZE, RESERV_LEVELS};
use kernel_memory_addresses::PageFrame;
use kernel_phys::{DomainId, PhysAllocator, PhysSegment, validate_segments};
use kernel_sync::SyncOnceCell;
use log::{info, trace};

static GLOBAL: SyncOnceCell<ReservManager> = SyncOnceCell::new();

/// Superpage reservations over one physical memory layout.
///
/// All operations may be called concurrently. Population of a single object
/// (the allocation functions together with inserting the returned pages
/// into the object) must be serialized by the caller.
pub struct ReservManager {
    pub(crate) config: ReservConfig,
    pub(crate) phys: Arc<dyn PhysAllocator>,
    pub(crate) array: ReservArray,
    pub(crate) domains: Box<[ReservDomain]>,
    pub(crate) growth: Box<dyn GrowthPolicy>,
    ticks: AtomicU32,
    pub(crate) stats: ReservStats,
}

/// Snapshot of an active reservation.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct ReservInfo {
    pub index: ReservIndex,
    pub object: ObjectId,
    /// Object offset of the reservation's first page.
    pub pindex: u64,
    pub level: ReservLevel,
    pub first: PageFrame,
    pub domain: DomainId,
    pub popcnt: u32,
    /// Whether the reservation sits in its domain's partially populated queue.
    pub queued: bool,
}

/// Result of [`ReservManager::audit`].
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct AuditReport {
    pub active: usize,
    pub queued: usize,
    pub full: usize,
}

impl ReservManager {
    /// Builds the reservation array for `segments`, which must be the
    /// segments `phys` manages.
    ///
    /// # Errors
    /// Invalid level orders or an invalid segment layout.
    pub fn new(
        config: ReservConfig,
        segments: &[PhysSegment],
        mode: ArrayMode,
        phys: Arc<dyn PhysAllocator>,
        growth: Box<dyn GrowthPolicy>,
    ) -> Result<Self, StartupError> {
        config.validate()?;
        let ndomains = validate_segments(segments)?;
        let array = ReservArray::new(&config, segments, mode)?;
        let domains = (0..ndomains).map(|_| ReservDomain::new()).collect();

        info!(
            "vm reserv: {} slots ({mode:?}), levels {}/{} pages, {ndomains} domains",
            array.len(),
            config.pages(ReservLevel::Level0),
            config.pages(ReservLevel::Level1),
        );

        Ok(Self {
            config,
            phys,
            array,
            domains,
            growth,
            ticks: AtomicU32::new(0),
            stats: ReservStats::default(),
        })
    }

    /// Publishes `self` as the process-wide manager.
    ///
    /// # Errors
    /// [`StartupError::AlreadyInstalled`] if a manager was installed before.
    pub fn install(self) -> Result<&'static Self, StartupError> {
        GLOBAL
            .set(self)
            .map_err(|_| StartupError::AlreadyInstalled)?;
        GLOBAL.get().ok_or(StartupError::AlreadyInstalled)
    }

    /// The manager published by [`ReservManager::install`].
    #[must_use]
    pub fn global() -> Option<&'static Self> {
        GLOBAL.get()
    }

    #[must_use]
    pub const fn config(&self) -> &ReservConfig {
        &self.config
    }

    #[must_use]
    pub fn phys(&self) -> &Arc<dyn PhysAllocator> {
        &self.phys
    }

    /// Advances the clock used to rate-limit queue moves.
    pub fn tick(&self) -> u32 {
        self.ticks.fetch_add(1, Ordering::Relaxed).wrapping_add(1)
    }

    #[must_use]
    pub fn ticks(&self) -> u32 {
        self.ticks.load(Ordering::Relaxed)
    }

    /// Byte size of a reservation level, `-1` meaning a plain page.
    #[must_use]
    pub const fn size(&self, level: i32) -> u64 {
        self.config.size_of_level(level)
    }

    #[inline]
    pub(crate) const fn capacity(&self, level: ReservLevel) -> u64 {
        self.config.pages(level)
    }

    pub(crate) fn domain(&self, domain: DomainId) -> Option<&ReservDomain> {
        self.domains.get(domain.index())
    }

    fn rv_domain(&self, rv: &Reserv) -> &ReservDomain {
        &self.domains[rv.domain.index()]
    }

    /// The level of the reservation holding `frame`, if any.
    #[must_use]
    pub fn level(&self, frame: PageFrame) -> Option<ReservLevel> {
        let rv = self.array.locate(frame)?;
        rv.is_active().then(|| rv.level())
    }

    /// The largest level whose fully populated (sub)reservation contains
    /// `frame`.
    #[must_use]
    pub fn level_iffullpop(&self, frame: PageFrame) -> Option<ReservLevel> {
        let rv = self.array.locate(frame)?;
        let state = rv.state.lock();
        if !rv.is_active() {
            return None;
        }
        let level = rv.level();
        let index = frame.offset_from(rv.first_frame());
        if index >= self.capacity(level) {
            return None;
        }
        if u64::from(state.popcnt) == self.capacity(level) {
            return Some(level);
        }
        let sub = to_usize(self.capacity(ReservLevel::Level0));
        let index = to_usize(index);
        (level == ReservLevel::Level1 && state.popmap.is_run_full(index - index % sub, sub))
            .then_some(ReservLevel::Level0)
    }

    /// Whether `frame` belongs to a reservation and is not populated.
    #[must_use]
    pub fn is_page_free(&self, frame: PageFrame) -> bool {
        let Some(rv) = self.array.locate(frame) else {
            return false;
        };
        if !rv.is_active() {
            return false;
        }
        let state = rv.state.lock();
        let index = frame.offset_from(rv.first_frame());
        rv.is_active()
            && index < self.capacity(rv.level())
            && state.popmap.is_clear(to_usize(index))
    }

    /// The first frame of the superpage containing `frame`, if `object`'s
    /// reservation there is fully populated.
    #[must_use]
    pub fn to_superpage(&self, object: &VmObject, frame: PageFrame) -> Option<PageFrame> {
        let rv = self.array.locate(frame)?;
        (rv.belongs_to(object) && u64::from(rv.popcnt()) == self.capacity(rv.level()))
            .then(|| rv.first_frame())
    }

    /// Moves the reservation holding `frame` from `old_object` to
    /// `new_object`, whose offset 0 corresponds to `old_offset` in the old
    /// object.
    pub fn rename(
        &self,
        frame: PageFrame,
        new_object: &Arc<VmObject>,
        old_object: &VmObject,
        old_offset: u64,
    ) {
        let Some(rv) = self.array.locate(frame) else {
            return;
        };
        if !rv.belongs_to(old_object) {
            return;
        }
        let mut state = rv.state.lock();
        if !rv.belongs_to(old_object) {
            return;
        }
        unlist(old_object, rv.index);
        let pindex = rv.pindex().wrapping_sub(old_offset);
        let mut rvq = new_object.rvq().lock();
        rv.rebind(&mut state, new_object, pindex);
        rvq.push(rv.index);
        trace!(
            "vm reserv: rename {} {} -> {} pindex {pindex}",
            rv.index,
            old_object.id(),
            new_object.id()
        );
    }

    /// The active reservation holding `frame`.
    #[must_use]
    pub fn reservation(&self, frame: PageFrame) -> Option<ReservInfo> {
        let rv = self.array.locate(frame)?;
        let state = rv.state.lock();
        if !rv.is_active() || frame.offset_from(rv.first_frame()) >= self.capacity(rv.level()) {
            return None;
        }
        Some(ReservInfo {
            index: rv.index,
            object: rv.object_id(),
            pindex: rv.pindex(),
            level: rv.level(),
            first: rv.first_frame(),
            domain: rv.domain,
            popcnt: state.popcnt,
            queued: state.inpartpopq,
        })
    }

    #[must_use]
    pub fn stats(&self) -> ReservCounters {
        self.stats.snapshot()
    }

    /// Fully populated reservations. Read without locks, so only a hint
    /// while allocations are in flight.
    #[must_use]
    pub fn fullpop(&self) -> usize {
        self.array
            .iter()
            .filter(|rv| {
                rv.pages.is_some()
                    && rv.is_active()
                    && u64::from(rv.popcnt()) == self.capacity(rv.level())
            })
            .count()
    }

    /// Queued reservations and their unpopulated space per domain and level.
    #[must_use]
    pub fn partpopq(&self) -> PartPopReport {
        let mut report = PartPopReport::default();
        for (d, rvd) in self.domains.iter().enumerate() {
            let domain = DomainId::new(u8::try_from(d).unwrap_or(u8::MAX));
            let queues = rvd.queues.lock();
            for level in [ReservLevel::Level0, ReservLevel::Level1] {
                let cap = self.capacity(level);
                let queue = &queues[level.index()];
                let unused: u64 = queue
                    .iter()
                    .map(|idx| cap - u64::from(self.array.get(idx).popcnt()))
                    .sum();
                report.rows.push(PartPopRow {
                    domain,
                    level,
                    unused_kib: unused * (PAGE_SIZE / 1024),
                    count: queue.len(),
                });
            }
        }
        report
    }

    /// Checks the bookkeeping of every reservation.
    ///
    /// # Panics
    /// When a population count disagrees with its bitmap, queue membership
    /// disagrees with the population, or an active reservation is missing
    /// from its object's list.
    pub fn audit(&self) -> AuditReport {
        let mut report = AuditReport::default();
        for rv in self.array.iter().filter(|rv| rv.pages.is_some()) {
            let state = rv.state.lock();
            assert_eq!(
                state.popmap.count(),
                to_usize(u64::from(state.popcnt)),
                "vm reserv: {} popcnt is corrupted",
                rv.index
            );
            assert_eq!(state.popcnt, rv.popcnt());

            let queued = self.rv_domain(rv).queues.lock()[rv.level().index()]
                .contains(QueueNode::Reserv(rv.index));
            assert_eq!(queued, state.inpartpopq, "vm reserv: {} inpartpopq", rv.index);

            if !rv.is_active() {
                assert_eq!(state.popcnt, 0, "vm reserv: free {} is populated", rv.index);
                assert!(!state.inpartpopq, "vm reserv: free {} is queued", rv.index);
                continue;
            }

            let cap = self.capacity(rv.level());
            let popcnt = u64::from(state.popcnt);
            assert!(popcnt > 0, "vm reserv: {} is active but empty", rv.index);
            assert_eq!(
                state.inpartpopq,
                popcnt < cap,
                "vm reserv: {} queue membership disagrees with popcnt {popcnt}",
                rv.index
            );
            if let Some(object) = state.owner.as_ref().and_then(Weak::upgrade) {
                assert_eq!(object.id(), rv.object_id());
                assert!(
                    object.rvq().lock().contains(&rv.index),
                    "vm reserv: {} missing from {}",
                    rv.index,
                    object.id()
                );
            }

            report.active += 1;
            report.queued += usize::from(state.inpartpopq);
            report.full += usize::from(popcnt == cap);
        }
        report
    }

    /// Binds the free reservation `rv` to `object` at `pindex`.
    pub(crate) fn insert(
        &self,
        rv: &Reserv,
        state: &mut ReservState,
        object: &Arc<VmObject>,
        pindex: u64,
        level: ReservLevel,
    ) {
        assert!(!rv.is_active(), "vm reserv: {} isn't free", rv.index);
        assert_eq!(state.popcnt, 0, "vm reserv: {} popcnt is corrupted", rv.index);
        assert!(!state.inpartpopq, "vm reserv: {} is queued", rv.index);
        debug_assert_eq!(state.popmap.count(), 0, "vm reserv: {} popmap is corrupted", rv.index);

        let mut rvq = object.rvq().lock();
        rv.bind(state, object, pindex, level);
        state.lasttick = self.ticks();
        rvq.push(rv.index);
        trace!(
            "vm reserv: insert {} ({}) {} pindex {pindex} level {level}",
            rv.index,
            rv.first_frame(),
            object.id()
        );
    }

    /// Detaches `rv` from its object. It must already be out of its queue.
    pub(crate) fn remove(&self, rv: &Reserv, state: &mut ReservState) {
        assert!(rv.is_active(), "vm reserv: {} is free", rv.index);
        assert!(!state.inpartpopq, "vm reserv: {} is queued", rv.index);
        trace!(
            "vm reserv: remove {} {} popcnt {}",
            rv.index,
            rv.object_id(),
            state.popcnt
        );
        match state.owner.as_ref().and_then(Weak::upgrade) {
            Some(object) => {
                let mut rvq = object.rvq().lock();
                if let Some(pos) = rvq.iter().position(|&i| i == rv.index) {
                    rvq.swap_remove(pos);
                }
                rv.unbind(state);
            }
            None => {
                rv.unbind(state);
            }
        }
    }

    /// Takes `rv` off its queue. The domain lock must be held.
    pub(crate) fn dequeue(
        rv: &Reserv,
        state: &mut ReservState,
        queues: &mut [PartPopQueue; RESERV_LEVELS],
    ) {
        assert!(state.inpartpopq, "vm reserv: {} isn't queued", rv.index);
        queues[rv.level().index()].remove(QueueNode::Reserv(rv.index));
        state.inpartpopq = false;
    }

    /// Moves `rv` to the tail of its queue, or takes it off when it is empty
    /// or full.
    pub(crate) fn requeue(&self, rv: &Reserv, state: &mut ReservState) {
        let cap = self.capacity(rv.level());
        let node = QueueNode::Reserv(rv.index);
        let mut queues = self.rv_domain(rv).queues.lock();
        let queue = &mut queues[rv.level().index()];
        if state.inpartpopq {
            queue.remove(node);
            state.inpartpopq = false;
        }
        if state.popcnt != 0 && u64::from(state.popcnt) < cap {
            queue.push_back(node);
            state.inpartpopq = true;
        }
    }

    pub(crate) fn set_psind(&self, frame: PageFrame, psind: u8) {
        match self.phys.page_array().get(frame) {
            Some(page) => page.set_psind(psind),
            None => debug_assert!(false, "vm reserv: {frame} has no page metadata"),
        }
    }

    pub(crate) fn psind(&self, frame: PageFrame) -> u8 {
        self.phys.page_array().get(frame).map_or(0, |page| page.psind())
    }

    /// The slot a fresh run of `level` at `frame` is recorded in.
    pub(crate) fn slot_for_run(&self, frame: PageFrame, level: ReservLevel) -> &Reserv {
        let Some(rv) = self.array.slot(frame, level) else {
            panic!("vm reserv: no reservation slot for {frame}");
        };
        assert_eq!(
            rv.pages,
            Some(frame),
            "vm reserv: {}'s pages are corrupted",
            rv.index
        );
        rv
    }
}

/// Drops `index` from `object`'s reservation list.
fn unlist(object: &VmObject, index: ReservIndex) {
    let mut rvq = object.rvq().lock();
    if let Some(pos) = rvq.iter().position(|&i| i == index) {
        rvq.swap_remove(pos);
    }
}

impl fmt::Debug for ReservManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReservManager")
            .field("config", &self.config)
            .field("slots", &self.array.len())
            .field("domains", &self.domains.len())
            .field("ticks", &self.ticks())
            .finish_non_exhaustive()
    }
}
