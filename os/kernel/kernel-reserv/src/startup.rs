//! Sizing and placement of the reservation metadata at boot.

use crate::reserv::Reserv;
use crate::{ReservConfig, ReservLevel, StartupError};
use core::ops::Range;
use kernel_info::memory::PAGE_SIZE;
use kernel_memory_addresses::PhysicalAddress;
use kernel_phys::PhysSegment;
use log::debug;

/// How reservation slots map to physical addresses.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum ArrayMode {
    /// One slot per level-0 run from address 0 up to the highest segment.
    #[default]
    Dense,
    /// Slots only for the level-1 aligned span of each segment.
    Sparse,
}

/// Metadata footprint for a physical memory layout.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct ReservLayout {
    /// Reservation slots, one per level-0 run.
    pub slots: u64,
    /// Bytes of the reservation array.
    pub array_bytes: u64,
    /// Bytes of the population bitmaps.
    pub popmap_bytes: u64,
}

impl ReservLayout {
    /// Every small page inside `segments` or `phys_avail` must map to a slot;
    /// partial level-1 runs at either end are rounded out.
    ///
    /// # Errors
    /// The configured orders are invalid.
    pub fn compute(
        config: &ReservConfig,
        segments: &[PhysSegment],
        phys_avail: &[Range<PhysicalAddress>],
        mode: ArrayMode,
    ) -> Result<Self, StartupError> {
        config.validate()?;
        let l0 = config.size(ReservLevel::Level0);
        let l1 = config.size(ReservLevel::Level1);

        let spans = segments
            .iter()
            .map(|s| (s.start.as_u64(), s.end.as_u64()))
            .chain(phys_avail.iter().map(|r| (r.start.as_u64(), r.end.as_u64())));

        let mut slots = 0;
        for (start, end) in spans {
            let top = end.next_multiple_of(l1) / l0;
            slots = match mode {
                ArrayMode::Dense => slots.max(top),
                ArrayMode::Sparse => slots + top - (start - start % l1) / l0,
            };
        }

        let popmap_words = config.pages(ReservLevel::Level1).div_ceil(64);
        Ok(Self {
            slots,
            array_bytes: slots * size_of::<Reserv>() as u64,
            popmap_bytes: slots * popmap_words * size_of::<u64>() as u64,
        })
    }

    /// Places the array and then the bitmaps directly below `end`, each
    /// rounded to whole pages. Returns the new end of usable memory.
    ///
    /// # Errors
    /// [`StartupError::NoRoom`] when the metadata is larger than `end`.
    pub fn carve(&self, end: PhysicalAddress) -> Result<PhysicalAddress, StartupError> {
        let array = self.array_bytes.next_multiple_of(PAGE_SIZE);
        let popmaps = self.popmap_bytes.next_multiple_of(PAGE_SIZE);
        let new_end = end
            .as_u64()
            .checked_sub(array)
            .and_then(|e| e.checked_sub(popmaps))
            .ok_or(StartupError::NoRoom(end.as_u64()))?;
        debug!(
            "vm reserv: {} slots, array {array:#x} + popmaps {popmaps:#x} bytes below {:#x}",
            self.slots,
            end.as_u64()
        );
        Ok(PhysicalAddress::new(new_end))
    }
}
