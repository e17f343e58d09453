//! # Kernel synchronization primitives
//!
//! Short-critical-section locks used by the memory subsystems. All locks
//! spin; none of them ever sleeps or parks the calling thread.
//!
//! - [`Mutex<T, R>`] pairs a value with a raw lock `R` ([`RawSpin`] or
//!   [`RawTicket`]) and carries a static name for diagnostics.
//! - [`SyncOnceCell<T>`] publishes a value exactly once.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

mod mutex;
mod raw_spin;
mod raw_ticket;
mod sync_once_cell;

pub use mutex::{Mutex, MutexGuard};
pub use raw_spin::RawSpin;
pub use raw_ticket::RawTicket;
pub use sync_once_cell::SyncOnceCell;

pub type SpinMutex<T> = Mutex<T, RawSpin>;
pub type SpinMutexGuard<'a, T> = MutexGuard<'a, T, RawSpin>;
pub type TicketMutex<T> = Mutex<T, RawTicket>;

impl<T> SpinMutex<T> {
    pub const fn new(value: T) -> Self {
        Self::from_raw(RawSpin::new(), value)
    }

    /// Like [`SpinMutex::new`], with a name reported by `Debug`.
    pub const fn named(name: &'static str, value: T) -> Self {
        Self::from_raw(RawSpin::new(), value).with_name(name)
    }
}

impl<T> TicketMutex<T> {
    pub const fn new(value: T) -> Self {
        Self::from_raw(RawTicket::new(), value)
    }

    /// Like [`TicketMutex::new`], with a name reported by `Debug`.
    pub const fn named(name: &'static str, value: T) -> Self {
        Self::from_raw(RawTicket::new(), value).with_name(name)
    }
}

pub trait RawLock {
    fn raw_lock(&self);
    fn raw_try_lock(&self) -> bool;

    /// Racy snapshot of the lock state; only meaningful for assertions.
    fn raw_is_locked(&self) -> bool;
}

pub trait RawUnlock {
    unsafe fn raw_unlock(&self);
}
