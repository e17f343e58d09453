//! Counters and the partially populated queue report.

use alloc::vec::Vec;
use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};
use kernel_phys::DomainId;

use crate::ReservLevel;

#[derive(Default)]
pub(crate) struct ReservStats {
    broken: AtomicU64,
    freed: AtomicU64,
    reclaimed: AtomicU64,
}

impl ReservStats {
    pub fn count_broken(&self) {
        self.broken.fetch_add(1, Ordering::Relaxed);
    }

    pub fn count_freed(&self) {
        self.freed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn count_reclaimed(&self) {
        self.reclaimed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ReservCounters {
        ReservCounters {
            broken: self.broken.load(Ordering::Relaxed),
            freed: self.freed.load(Ordering::Relaxed),
            reclaimed: self.reclaimed.load(Ordering::Relaxed),
        }
    }
}

/// Cumulative reservation events.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct ReservCounters {
    /// Reservations broken while partially populated.
    pub broken: u64,
    /// Reservations that returned to the free state when emptied.
    pub freed: u64,
    /// Reservations broken to satisfy a contiguous request.
    pub reclaimed: u64,
}

/// One row of [`PartPopReport`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct PartPopRow {
    pub domain: DomainId,
    pub level: ReservLevel,
    /// Unpopulated KiB across the queued reservations.
    pub unused_kib: u64,
    pub count: usize,
}

/// Partially populated reservations per domain and level.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct PartPopReport {
    pub rows: Vec<PartPopRow>,
}

impl fmt::Display for PartPopReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\nDOMAIN    LEVEL     SIZE  NUMBER\n\n")?;
        for row in &self.rows {
            writeln!(
                f,
                "{:6}, {:7}, {:6}K, {:6}",
                row.domain.index(),
                row.level.index(),
                row.unused_kib,
                row.count
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_snapshot() {
        let s = ReservStats::default();
        s.count_broken();
        s.count_freed();
        s.count_freed();
        assert_eq!(
            s.snapshot(),
            ReservCounters {
                broken: 1,
                freed: 2,
                reclaimed: 0
            }
        );
    }

    #[test]
    fn report_table() {
        let report = PartPopReport {
            rows: alloc::vec![PartPopRow {
                domain: DomainId::new(0),
                level: ReservLevel::Level1,
                unused_kib: 2040,
                count: 1,
            }],
        };
        let text = alloc::format!("{report}");
        assert_eq!(
            text,
            "\nDOMAIN    LEVEL     SIZE  NUMBER\n\n     0,       1,   2040K,      1\n"
        );
    }
}
