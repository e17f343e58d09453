//! # Superpage Reservations
//!
//! Physical memory is handed to memory objects in naturally aligned runs
//! ("reservations") so that an object's pages end up physically contiguous
//! and can later be mapped with a larger page size.
//!
//! ```text
//!  object offsets   0 ........................... 511
//!                   │ │ │ │ ...                   │
//!  reservation      [ level 1: 512 pages, 2 MiB         ]
//!                   [ L0 ][ L0 ][ L0 ] ... 32 x 16 pages
//! ```
//!
//! When the first page of a run is requested, the whole run is taken from
//! the physical allocator and bound to the object. Later requests for
//! offsets inside the run are served from it without touching the physical
//! allocator. A reservation is released when its last page is freed, or
//! broken (its free pages returned) when memory runs low.
//!
//! ## Components
//!
//! - [`ReservManager`]: the context owning the reservation array, the
//!   per-domain queues of partially populated reservations and the
//!   counters.
//! - [`VmObject`]: the memory object view reservations bind to.
//! - [`ReservLayout`]: boot-time sizing of the reservation metadata.
//!
//! ## Locking
//!
//! Every reservation has its own spin lock. Blocking acquisitions nest as
//! scan lock, reservation lock, domain queue lock, object list lock. Queue
//! walks hold the domain lock first, so they take a reservation lock only
//! with `try_lock`, or after parking a marker behind the candidate and
//! releasing the domain lock; the reverse nesting therefore never waits.

#![cfg_attr(not(any(test, doctest)), no_std)]

extern crate alloc;

mod allocate;
mod array;
mod domain;
mod error;
mod level;
mod manager;
mod object;
mod popmap;
mod queue;
mod reclaim;
mod reserv;
mod startup;
mod stats;
#[cfg(test)]
mod testing;

pub use allocate::ContigRequest;
pub use error::{ReservError, StartupError};
pub use level::{ReservConfig, ReservLevel};
pub use manager::{AuditReport, ReservInfo, ReservManager};
pub use object::{AnonymousGrows, GrowthPolicy, ObjectId, ObjectKind, ObjectPage, VmObject};
pub use reserv::ReservIndex;
pub use startup::{ArrayMode, ReservLayout};
pub use stats::{PartPopReport, PartPopRow, ReservCounters};

/// Page counts and slot numbers are bounded by physical memory, which fits
/// the address space.
#[allow(clippy::cast_possible_truncation)]
#[inline]
pub(crate) const fn to_usize(v: u64) -> usize {
    v as usize
}
