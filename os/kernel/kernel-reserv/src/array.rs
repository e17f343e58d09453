//! The reservation arena and the page-to-reservation lookup.

use crate::reserv::{Reserv, ReservIndex};
use crate::{ArrayMode, ReservConfig, ReservLayout, ReservLevel, StartupError, to_usize};
use alloc::boxed::Box;
use alloc::vec;
use alloc::vec::Vec;
use kernel_memory_addresses::PageFrame;
use kernel_phys::{DomainId, PhysSegment};

/// Where a segment's slots start in the arena.
struct SegmentSlots {
    first: PageFrame,
    end: PageFrame,
    /// Slot of the level-1 run containing the segment start.
    first_slot: usize,
}

pub(crate) struct ReservArray {
    slots: Box<[Reserv]>,
    segments: Vec<SegmentSlots>,
    /// log2 of frames per level-0 and level-1 run.
    orders: [u32; 2],
}

impl ReservArray {
    /// Slots whose level-0 run lies entirely inside a segment get their
    /// first frame and domain; all others stay padding.
    pub fn new(
        config: &ReservConfig,
        segments: &[PhysSegment],
        mode: ArrayMode,
    ) -> Result<Self, StartupError> {
        let layout = ReservLayout::compute(config, segments, &[], mode)?;
        let count = usize::try_from(layout.slots).map_err(|_| StartupError::NoRoom(layout.slots))?;
        let orders = config.orders;
        let l0 = 1_u64 << orders[0];
        let l1 = 1_u64 << orders[1];

        let mut backing: Vec<Option<(PageFrame, DomainId)>> = vec![None; count];
        let mut seg_slots = Vec::with_capacity(segments.len());
        let mut used = 0;
        for seg in segments {
            let start = seg.first_frame().pfn();
            let end = seg.end_frame().pfn();
            let chunk = start - start % l1;
            let first_slot = match mode {
                ArrayMode::Dense => chunk >> orders[0],
                ArrayMode::Sparse => {
                    let first = used;
                    used += end.next_multiple_of(l1) / l0 - chunk / l0;
                    first
                }
            };
            let first_slot = to_usize(first_slot);

            let mut pfn = start.next_multiple_of(l0);
            let mut slot = first_slot + to_usize((pfn - chunk) >> orders[0]);
            while pfn + l0 <= end {
                backing[slot] = Some((PageFrame::new(pfn), seg.domain));
                pfn += l0;
                slot += 1;
            }

            seg_slots.push(SegmentSlots {
                first: seg.first_frame(),
                end: seg.end_frame(),
                first_slot,
            });
        }

        let bits = to_usize(l1);
        let slots = backing
            .into_iter()
            .enumerate()
            .map(|(i, b)| {
                let (pages, domain) = b.map_or((None, DomainId::default()), |(f, d)| (Some(f), d));
                Reserv::new(ReservIndex::new(i), pages, domain, bits)
            })
            .collect();

        Ok(Self {
            slots,
            segments: seg_slots,
            orders,
        })
    }

    #[inline]
    pub fn get(&self, index: ReservIndex) -> &Reserv {
        &self.slots[index.get()]
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Reserv> {
        self.slots.iter()
    }

    /// The slot a run of `level` starting at (or containing) `frame` is
    /// recorded in.
    pub fn slot(&self, frame: PageFrame, level: ReservLevel) -> Option<&Reserv> {
        let chunk = self.chunk_slot(frame)?;
        let slot = match level {
            ReservLevel::Level1 => chunk,
            ReservLevel::Level0 => chunk + self.subslot_of(frame),
        };
        self.slots.get(slot)
    }

    /// The reservation that may hold `frame`: the active level-1 reservation
    /// over its run, else the level-0 slot. Lock free; the result is a hint
    /// until the reservation is locked and re-checked.
    pub fn locate(&self, frame: PageFrame) -> Option<&Reserv> {
        let chunk = self.chunk_slot(frame)?;
        let rv = self.slots.get(chunk)?;
        if rv.level() == ReservLevel::Level1 && rv.is_active() {
            return Some(rv);
        }
        self.slots.get(chunk + self.subslot_of(frame))
    }

    fn chunk_slot(&self, frame: PageFrame) -> Option<usize> {
        let idx = self.segments.partition_point(|s| s.first <= frame);
        let seg = self.segments.get(idx.checked_sub(1)?)?;
        if frame >= seg.end {
            return None;
        }
        let runs = (frame.pfn() >> self.orders[1]) - (seg.first.pfn() >> self.orders[1]);
        Some(seg.first_slot + to_usize(runs << (self.orders[1] - self.orders[0])))
    }

    fn subslot_of(&self, frame: PageFrame) -> usize {
        let mask = (1 << (self.orders[1] - self.orders[0])) - 1;
        to_usize((frame.pfn() >> self.orders[0]) & mask)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::{ObjectKind, VmObject};

    const MB: u64 = 1 << 20;

    fn segs() -> [PhysSegment; 2] {
        [
            // starts mid level-0 run, ends mid level-1 run
            PhysSegment::new(MB + 0x3000, 5 * MB, DomainId::new(0)),
            PhysSegment::new(16 * MB, 18 * MB, DomainId::new(1)),
        ]
    }

    fn frame(addr: u64) -> PageFrame {
        PageFrame::new(addr >> 12)
    }

    #[test]
    fn only_complete_runs_are_backed() {
        for mode in [ArrayMode::Dense, ArrayMode::Sparse] {
            let a = ReservArray::new(&ReservConfig::default(), &segs(), mode).unwrap();
            let first = a.locate(frame(MB + 0x3000)).unwrap();
            assert_eq!(first.pages, None, "{mode:?}");
            let next = a.locate(frame(MB + 0x10000)).unwrap();
            assert_eq!(next.pages, Some(frame(MB + 0x10000)));
            assert_eq!(next.domain, DomainId::new(0));
            let far = a.locate(frame(17 * MB + 0x2000)).unwrap();
            assert_eq!(far.pages, Some(frame(17 * MB)));
            assert_eq!(far.domain, DomainId::new(1));
        }
    }

    #[test]
    fn unmanaged_frames_have_no_slot() {
        let a = ReservArray::new(&ReservConfig::default(), &segs(), ArrayMode::Sparse).unwrap();
        assert!(a.locate(frame(8 * MB)).is_none());
        assert!(a.locate(frame(18 * MB)).is_none());
        assert_eq!(a.len(), (6 + 2) * 16);
    }

    #[test]
    fn active_level1_shadows_its_subslots() {
        let a = ReservArray::new(&ReservConfig::default(), &segs(), ArrayMode::Dense).unwrap();
        let page = frame(16 * MB + 0x5_0000);
        let head = a.slot(page, ReservLevel::Level1).unwrap();
        let sub = a.slot(page, ReservLevel::Level0).unwrap();
        assert_eq!(sub.index.get(), head.index.get() + 5);
        assert_eq!(a.locate(page).unwrap().index, sub.index);

        let object = VmObject::new(ObjectKind::Anonymous, 512);
        let mut state = head.state.lock();
        head.bind(&mut state, &object, 0, ReservLevel::Level1);
        drop(state);
        assert_eq!(a.locate(page).unwrap().index, head.index);
    }
}
