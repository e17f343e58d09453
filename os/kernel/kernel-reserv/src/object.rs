//! Memory objects as seen by the reservation layer.
//!
//! Only what reservations need is modelled: identity, size, colour, the
//! resident pages in offset order and the list of reservations the object
//! owns. Populating an object (inserting the pages returned by the
//! allocation functions) is the caller's job and must be serialized per
//! object.

use crate::ReservIndex;
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};
use kernel_memory_addresses::PageFrame;
use kernel_sync::{SpinMutex, TicketMutex};

static NEXT_OBJECT_ID: AtomicU64 = AtomicU64::new(1);

/// Unique object identity; never reused.
#[repr(transparent)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ObjectId(u64);

impl ObjectId {
    pub(crate) const NONE: Self = Self(0);

    #[inline]
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }

    #[inline]
    pub(crate) const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    #[inline]
    pub(crate) const fn is_none(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "obj#{}", self.0)
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ObjectKind {
    /// Swap-backed memory; expected to grow.
    Anonymous,
    /// Backed by a file of known size.
    Vnode,
    /// Device or physical memory aperture.
    Device,
}

/// A page resident in an object.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct ObjectPage {
    pub pindex: u64,
    pub frame: PageFrame,
}

pub struct VmObject {
    id: ObjectId,
    kind: ObjectKind,
    /// Size in pages.
    size: AtomicU64,
    pg_color: u64,
    memq: TicketMutex<BTreeMap<u64, PageFrame>>,
    rvq: SpinMutex<Vec<ReservIndex>>,
}

impl VmObject {
    #[must_use]
    pub fn new(kind: ObjectKind, size: u64) -> Arc<Self> {
        Self::with_color(kind, size, 0)
    }

    /// An object whose page at offset 0 prefers a physical page with colour
    /// `pg_color` within a reservation.
    #[must_use]
    pub fn with_color(kind: ObjectKind, size: u64, pg_color: u64) -> Arc<Self> {
        Arc::new(Self {
            id: ObjectId(NEXT_OBJECT_ID.fetch_add(1, Ordering::Relaxed)),
            kind,
            size: AtomicU64::new(size),
            pg_color,
            memq: TicketMutex::named("vm object memq", BTreeMap::new()),
            rvq: SpinMutex::named("vm reserv object", Vec::new()),
        })
    }

    #[inline]
    #[must_use]
    pub const fn id(&self) -> ObjectId {
        self.id
    }

    #[inline]
    #[must_use]
    pub const fn kind(&self) -> ObjectKind {
        self.kind
    }

    #[inline]
    #[must_use]
    pub fn size(&self) -> u64 {
        self.size.load(Ordering::Acquire)
    }

    pub fn set_size(&self, size: u64) {
        self.size.store(size, Ordering::Release);
    }

    #[inline]
    #[must_use]
    pub const fn pg_color(&self) -> u64 {
        self.pg_color
    }

    /// Index of `pindex` within a reservation of `npages` pages.
    #[inline]
    #[must_use]
    pub const fn reserv_index(&self, pindex: u64, npages: u64) -> u64 {
        self.pg_color.wrapping_add(pindex) & (npages - 1)
    }

    /// Records a resident page. Returns `false` if `pindex` was occupied.
    pub fn insert_page(&self, pindex: u64, frame: PageFrame) -> bool {
        self.memq.with_lock(|memq| {
            if memq.contains_key(&pindex) {
                return false;
            }
            memq.insert(pindex, frame);
            true
        })
    }

    pub fn remove_page(&self, pindex: u64) -> Option<PageFrame> {
        self.memq.with_lock(|memq| memq.remove(&pindex))
    }

    #[must_use]
    pub fn lookup(&self, pindex: u64) -> Option<PageFrame> {
        self.memq.with_lock(|memq| memq.get(&pindex).copied())
    }

    /// The resident page with the largest offset below `pindex`.
    #[must_use]
    pub fn predecessor(&self, pindex: u64) -> Option<ObjectPage> {
        self.memq.with_lock(|memq| {
            memq.range(..pindex)
                .next_back()
                .map(|(&pindex, &frame)| ObjectPage { pindex, frame })
        })
    }

    /// The resident page with the smallest offset above `pindex`, or the
    /// first page when `pindex` is `None`.
    #[must_use]
    pub fn successor(&self, pindex: Option<u64>) -> Option<ObjectPage> {
        self.memq.with_lock(|memq| {
            let next = match pindex {
                Some(p) => memq.range(p + 1..).next(),
                None => memq.iter().next(),
            };
            next.map(|(&pindex, &frame)| ObjectPage { pindex, frame })
        })
    }

    /// Resident pages, in offset order.
    #[must_use]
    pub fn pages(&self) -> Vec<ObjectPage> {
        self.memq.with_lock(|memq| {
            memq.iter()
                .map(|(&pindex, &frame)| ObjectPage { pindex, frame })
                .collect()
        })
    }

    #[must_use]
    pub fn resident_count(&self) -> usize {
        self.memq.with_lock(|memq| memq.len())
    }

    /// Snapshot of the reservations this object owns.
    #[must_use]
    pub fn reservations(&self) -> Vec<ReservIndex> {
        self.rvq.lock().clone()
    }

    pub(crate) fn rvq(&self) -> &SpinMutex<Vec<ReservIndex>> {
        &self.rvq
    }
}

impl fmt::Debug for VmObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VmObject")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("size", &self.size())
            .field("pg_color", &self.pg_color)
            .finish_non_exhaustive()
    }
}

/// Decides whether an object is expected to grow past its current size.
///
/// Objects that will not grow do not get reservations extending past their
/// end.
pub trait GrowthPolicy: Send + Sync {
    fn may_grow(&self, object: &VmObject) -> bool;
}

/// Anonymous memory may grow; everything else keeps its size.
#[derive(Copy, Clone, Debug, Default)]
pub struct AnonymousGrows;

impl GrowthPolicy for AnonymousGrows {
    fn may_grow(&self, object: &VmObject) -> bool {
        object.kind() == ObjectKind::Anonymous
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_unique() {
        let a = VmObject::new(ObjectKind::Anonymous, 1);
        let b = VmObject::new(ObjectKind::Anonymous, 1);
        assert_ne!(a.id(), b.id());
        assert!(!a.id().is_none());
    }

    #[test]
    fn neighbours_in_offset_order() {
        let o = VmObject::new(ObjectKind::Vnode, 100);
        assert!(o.insert_page(10, PageFrame::new(0x10)));
        assert!(o.insert_page(20, PageFrame::new(0x20)));
        assert!(!o.insert_page(20, PageFrame::new(0x99)));

        assert_eq!(o.predecessor(10), None);
        assert_eq!(o.predecessor(15).map(|p| p.pindex), Some(10));
        assert_eq!(o.successor(Some(10)).map(|p| p.pindex), Some(20));
        assert_eq!(o.successor(None).map(|p| p.pindex), Some(10));
        assert_eq!(o.successor(Some(20)), None);

        assert_eq!(o.remove_page(10), Some(PageFrame::new(0x10)));
        assert_eq!(o.resident_count(), 1);
    }

    #[test]
    fn colour_shifts_reservation_index() {
        let o = VmObject::with_color(ObjectKind::Anonymous, 64, 3);
        assert_eq!(o.reserv_index(0, 16), 3);
        assert_eq!(o.reserv_index(13, 16), 0);
        assert_eq!(VmObject::new(ObjectKind::Anonymous, 1).reserv_index(17, 16), 1);
    }

    #[test]
    fn default_growth_policy() {
        let p = AnonymousGrows;
        assert!(p.may_grow(&VmObject::new(ObjectKind::Anonymous, 1)));
        assert!(!p.may_grow(&VmObject::new(ObjectKind::Vnode, 1)));
    }
}
