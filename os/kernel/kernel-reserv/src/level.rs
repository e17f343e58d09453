//! Reservation size classes.

use crate::StartupError;
use core::fmt;
use kernel_info::memory::{
    LEVEL0_ORDER, LEVEL1_ORDER, MAX_FREE_ORDER, PAGE_SHIFT, PAGE_SIZE, PARTPOP_SLOP_TICKS,
    RESERV_LEVELS,
};

/// Size class of a reservation.
///
/// A level-1 reservation spans `1 << (order1 - order0)` level-0 runs.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[repr(u8)]
pub enum ReservLevel {
    Level0 = 0,
    Level1 = 1,
}

impl ReservLevel {
    /// Levels in the order allocation and reclamation try them.
    pub const LARGEST_FIRST: [Self; RESERV_LEVELS] = [Self::Level1, Self::Level0];

    #[inline]
    #[must_use]
    pub const fn index(self) -> usize {
        self as usize
    }

    #[inline]
    #[must_use]
    pub(crate) const fn from_index(index: u8) -> Self {
        if index == 0 { Self::Level0 } else { Self::Level1 }
    }

    /// The superpage index a fully populated reservation of this level
    /// advertises on its first page.
    #[inline]
    #[must_use]
    pub const fn psind(self) -> u8 {
        self as u8 + 1
    }
}

impl fmt::Display for ReservLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.index())
    }
}

/// Runtime reservation geometry.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct ReservConfig {
    /// log2 of the page count of each level.
    pub orders: [u32; RESERV_LEVELS],
    /// Ticks between two moves of a reservation to its queue tail.
    pub partpop_slop: u32,
}

impl Default for ReservConfig {
    fn default() -> Self {
        Self {
            orders: [LEVEL0_ORDER, LEVEL1_ORDER],
            partpop_slop: PARTPOP_SLOP_TICKS,
        }
    }
}

impl ReservConfig {
    /// # Errors
    /// [`StartupError::InvalidOrders`] unless `0 < order0 < order1 <= MAX_FREE_ORDER`,
    /// [`StartupError::InvalidSlop`] for a zero debounce interval.
    pub const fn validate(&self) -> Result<(), StartupError> {
        let [o0, o1] = self.orders;
        if o0 == 0 || o0 >= o1 || o1 > MAX_FREE_ORDER {
            return Err(StartupError::InvalidOrders(o0, o1));
        }
        if self.partpop_slop == 0 {
            return Err(StartupError::InvalidSlop);
        }
        Ok(())
    }

    #[inline]
    #[must_use]
    pub const fn order(&self, level: ReservLevel) -> u32 {
        self.orders[level.index()]
    }

    /// Pages per reservation of `level`.
    #[inline]
    #[must_use]
    pub const fn pages(&self, level: ReservLevel) -> u64 {
        1 << self.order(level)
    }

    /// log2 of the byte size of `level`.
    #[inline]
    #[must_use]
    pub const fn shift(&self, level: ReservLevel) -> u32 {
        self.order(level) + PAGE_SHIFT
    }

    /// Byte size of `level`.
    #[inline]
    #[must_use]
    pub const fn size(&self, level: ReservLevel) -> u64 {
        1 << self.shift(level)
    }

    /// Level-0 slots per level-1 reservation.
    #[inline]
    #[must_use]
    pub const fn subslots(&self) -> u64 {
        1 << (self.orders[1] - self.orders[0])
    }

    /// Byte size of a level, `-1` meaning a plain page. Unknown levels are 0.
    #[must_use]
    pub const fn size_of_level(&self, level: i32) -> u64 {
        match level {
            -1 => PAGE_SIZE,
            0 => self.size(ReservLevel::Level0),
            1 => self.size(ReservLevel::Level1),
            _ => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_geometry() {
        let c = ReservConfig::default();
        assert_eq!(c.validate(), Ok(()));
        assert_eq!(c.pages(ReservLevel::Level0), 16);
        assert_eq!(c.pages(ReservLevel::Level1), 512);
        assert_eq!(c.size(ReservLevel::Level0), 64 * 1024);
        assert_eq!(c.size(ReservLevel::Level1), 2 * 1024 * 1024);
        assert_eq!(c.subslots(), 32);
    }

    #[test]
    fn size_of_level_covers_plain_pages() {
        let c = ReservConfig::default();
        assert_eq!(c.size_of_level(-1), 4096);
        assert_eq!(c.size_of_level(1), 2 * 1024 * 1024);
        assert_eq!(c.size_of_level(2), 0);
    }

    #[test]
    fn rejects_inverted_orders() {
        let c = ReservConfig {
            orders: [9, 4],
            ..ReservConfig::default()
        };
        assert_eq!(c.validate(), Err(StartupError::InvalidOrders(9, 4)));
        let c = ReservConfig {
            partpop_slop: 0,
            ..ReservConfig::default()
        };
        assert_eq!(c.validate(), Err(StartupError::InvalidSlop));
    }

    #[test]
    fn psind_per_level() {
        assert_eq!(ReservLevel::Level0.psind(), 1);
        assert_eq!(ReservLevel::Level1.psind(), 2);
        assert_eq!(ReservLevel::from_index(1), ReservLevel::Level1);
    }
}
