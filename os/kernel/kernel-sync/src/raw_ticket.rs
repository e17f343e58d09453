use crate::{RawLock, RawUnlock};
use core::hint::spin_loop;
use core::sync::atomic::{AtomicU64, Ordering};

const NEXT_ONE: u64 = 1 << 32;

/// FIFO spin lock. The high half of `word` is the next ticket to hand out,
/// the low half the ticket currently being served; both wrap.
pub struct RawTicket {
    word: AtomicU64,
}

impl Default for RawTicket {
    fn default() -> Self {
        Self::new()
    }
}

#[allow(clippy::cast_possible_truncation)]
const fn halves(word: u64) -> (u32, u32) {
    ((word >> 32) as u32, word as u32)
}

impl RawTicket {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            word: AtomicU64::new(0),
        }
    }

    #[inline]
    pub fn lock(&self) {
        let (ticket, mut serving) = halves(self.word.fetch_add(NEXT_ONE, Ordering::Acquire));
        while serving != ticket {
            spin_loop();
            serving = halves(self.word.load(Ordering::Acquire)).1;
        }
    }

    /// Takes a ticket only if it would be served right away.
    #[inline]
    pub fn try_lock(&self) -> bool {
        let word = self.word.load(Ordering::Relaxed);
        let (next, serving) = halves(word);
        next == serving
            && self
                .word
                .compare_exchange(
                    word,
                    word.wrapping_add(NEXT_ONE),
                    Ordering::Acquire,
                    Ordering::Relaxed,
                )
                .is_ok()
    }

    #[inline]
    pub fn is_locked(&self) -> bool {
        let (next, serving) = halves(self.word.load(Ordering::Relaxed));
        next != serving
    }

    #[inline]
    pub unsafe fn unlock(&self) {
        // only the holder touches the low half; a carry must not leak into
        // the ticket counter
        let mut word = self.word.load(Ordering::Relaxed);
        loop {
            let (next, serving) = halves(word);
            let new = (u64::from(next) << 32) | u64::from(serving.wrapping_add(1));
            match self
                .word
                .compare_exchange_weak(word, new, Ordering::Release, Ordering::Relaxed)
            {
                Ok(_) => return,
                Err(cur) => word = cur,
            }
        }
    }
}

impl RawLock for RawTicket {
    fn raw_lock(&self) {
        self.lock();
    }

    fn raw_try_lock(&self) -> bool {
        self.try_lock()
    }

    fn raw_is_locked(&self) -> bool {
        self.is_locked()
    }
}

impl RawUnlock for RawTicket {
    unsafe fn raw_unlock(&self) {
        unsafe { self.unlock() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tickets_wrap() {
        let t = RawTicket {
            word: AtomicU64::new((u64::from(u32::MAX) << 32) | u64::from(u32::MAX)),
        };
        assert!(!t.is_locked());
        assert!(t.try_lock());
        assert!(t.is_locked());
        assert!(!t.try_lock());
        unsafe { t.unlock() };
        assert!(!t.is_locked());
        assert_eq!(halves(t.word.load(Ordering::Relaxed)), (0, 0));
    }
}
