use crate::{AllocClass, AllocRequest};
use core::sync::atomic::{AtomicU64, Ordering};

/// Free page thresholds of a domain.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct BudgetLimits {
    /// Pages only system and interrupt requests may use.
    pub free_reserved: u64,
    /// Pages only interrupt requests may use.
    pub interrupt_min: u64,
}

/// Free page accounting of one domain.
///
/// Pages sitting unpopulated inside a reservation still count as free; only
/// populated pages are debited.
#[derive(Debug)]
pub struct DomainBudget {
    free: AtomicU64,
    limits: BudgetLimits,
}

impl DomainBudget {
    #[must_use]
    pub const fn new(free: u64, limits: BudgetLimits) -> Self {
        Self {
            free: AtomicU64::new(free),
            limits,
        }
    }

    #[inline]
    #[must_use]
    pub fn free(&self) -> u64 {
        self.free.load(Ordering::Relaxed)
    }

    /// Debits `npages` unless that would take the free count below the
    /// floor of `request`'s class.
    pub fn try_debit(&self, request: AllocRequest, npages: u64) -> bool {
        let floor = match request.class() {
            AllocClass::Normal => self.limits.free_reserved,
            AllocClass::System => self.limits.interrupt_min,
            AllocClass::Interrupt => 0,
        };

        let mut old = self.free.load(Ordering::Relaxed);
        loop {
            let new = match old.checked_sub(npages) {
                Some(new) if new >= floor => new,
                _ => return false,
            };
            match self
                .free
                .compare_exchange_weak(old, new, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => return true,
                Err(cur) => old = cur,
            }
        }
    }

    #[inline]
    pub fn credit(&self, npages: u64) {
        self.free.fetch_add(npages, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classes_respect_their_floor() {
        let limits = BudgetLimits {
            free_reserved: 10,
            interrupt_min: 4,
        };
        let b = DomainBudget::new(12, limits);

        assert!(b.try_debit(AllocRequest::normal(), 2));
        assert!(!b.try_debit(AllocRequest::normal(), 1));
        assert!(b.try_debit(AllocRequest::system(), 6));
        assert!(!b.try_debit(AllocRequest::system(), 1));
        assert!(b.try_debit(AllocRequest::interrupt(), 4));
        assert!(!b.try_debit(AllocRequest::interrupt(), 1));
        assert_eq!(b.free(), 0);

        b.credit(3);
        assert_eq!(b.free(), 3);
    }
}
