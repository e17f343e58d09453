//! The reservation record.

use crate::object::{ObjectId, VmObject};
use crate::popmap::PopMap;
use crate::ReservLevel;
use alloc::sync::{Arc, Weak};
use core::fmt;
use core::sync::atomic::{AtomicU8, AtomicU32, AtomicU64, Ordering};
use kernel_memory_addresses::PageFrame;
use kernel_phys::DomainId;
use kernel_sync::SpinMutex;

/// Position of a reservation record in the reservation array.
#[repr(transparent)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ReservIndex(usize);

impl ReservIndex {
    #[inline]
    #[must_use]
    pub const fn new(index: usize) -> Self {
        Self(index)
    }

    #[inline]
    #[must_use]
    pub const fn get(self) -> usize {
        self.0
    }
}

impl fmt::Display for ReservIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "rv#{}", self.0)
    }
}

/// State only touched with the reservation lock held.
pub(crate) struct ReservState {
    /// Back-reference to the owning object; `None` while free.
    pub owner: Option<Weak<VmObject>>,
    pub popmap: PopMap,
    pub popcnt: u32,
    /// Tick of the last move to the queue tail.
    pub lasttick: u32,
    /// Mirrors queue membership; changed only with the domain lock held too.
    pub inpartpopq: bool,
}

/// One level-0 slot of physical memory, and the reservation using it.
///
/// `pages` and `domain` are fixed at boot. `object`, `pindex`, `level` and
/// `popcnt` are written under the reservation lock and may be read without
/// it as hints; callers re-check them after locking.
pub(crate) struct Reserv {
    pub index: ReservIndex,
    /// First frame of this slot; `None` for slots without backing memory.
    pub pages: Option<PageFrame>,
    pub domain: DomainId,
    object: AtomicU64,
    pindex: AtomicU64,
    level: AtomicU8,
    popcnt: AtomicU32,
    pub state: SpinMutex<ReservState>,
}

impl Reserv {
    pub fn new(index: ReservIndex, pages: Option<PageFrame>, domain: DomainId, bits: usize) -> Self {
        Self {
            index,
            pages,
            domain,
            object: AtomicU64::new(ObjectId::NONE.get()),
            pindex: AtomicU64::new(0),
            level: AtomicU8::new(0),
            popcnt: AtomicU32::new(0),
            state: SpinMutex::named(
                "vm reserv",
                ReservState {
                    owner: None,
                    popmap: PopMap::new(bits),
                    popcnt: 0,
                    lasttick: 0,
                    inpartpopq: false,
                },
            ),
        }
    }

    #[inline]
    pub fn object_id(&self) -> ObjectId {
        ObjectId::from_raw(self.object.load(Ordering::Acquire))
    }

    #[inline]
    pub fn is_active(&self) -> bool {
        !self.object_id().is_none()
    }

    #[inline]
    pub fn belongs_to(&self, object: &VmObject) -> bool {
        self.object_id() == object.id()
    }

    #[inline]
    pub fn pindex(&self) -> u64 {
        self.pindex.load(Ordering::Acquire)
    }

    #[inline]
    pub fn level(&self) -> ReservLevel {
        ReservLevel::from_index(self.level.load(Ordering::Acquire))
    }

    #[inline]
    pub fn popcnt(&self) -> u32 {
        self.popcnt.load(Ordering::Relaxed)
    }

    /// The first frame; only slots with backing memory become reservations.
    #[inline]
    pub fn first_frame(&self) -> PageFrame {
        let Some(pages) = self.pages else {
            panic!("vm reserv: {} has no backing pages", self.index);
        };
        pages
    }

    /// Whether this reservation, bound at `self.pindex`, covers `pindex`.
    #[inline]
    pub fn has_pindex(&self, pindex: u64, npages: u64) -> bool {
        pindex.wrapping_sub(self.pindex()) & !(npages - 1) == 0
    }

    pub(crate) fn bind(
        &self,
        state: &mut ReservState,
        object: &Arc<VmObject>,
        pindex: u64,
        level: ReservLevel,
    ) {
        state.owner = Some(Arc::downgrade(object));
        self.pindex.store(pindex, Ordering::Release);
        self.level.store(level as u8, Ordering::Release);
        self.object.store(object.id().get(), Ordering::Release);
    }

    pub(crate) fn rebind(&self, state: &mut ReservState, object: &Arc<VmObject>, pindex: u64) {
        state.owner = Some(Arc::downgrade(object));
        self.pindex.store(pindex, Ordering::Release);
        self.object.store(object.id().get(), Ordering::Release);
    }

    pub(crate) fn unbind(&self, state: &mut ReservState) -> Option<Weak<VmObject>> {
        self.object.store(ObjectId::NONE.get(), Ordering::Release);
        state.owner.take()
    }

    pub(crate) fn set_popcnt(&self, state: &mut ReservState, popcnt: u32) {
        state.popcnt = popcnt;
        self.popcnt.store(popcnt, Ordering::Relaxed);
    }
}

impl fmt::Debug for Reserv {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reserv")
            .field("index", &self.index)
            .field("pages", &self.pages)
            .field("domain", &self.domain)
            .field("object", &self.object_id())
            .field("pindex", &self.pindex())
            .field("level", &self.level())
            .field("popcnt", &self.popcnt())
            .finish()
    }
}
