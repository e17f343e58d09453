//! # Physical Page Allocation
//!
//! The layer below the superpage reservations: hands out naturally aligned
//! runs of physical page frames per memory domain and keeps the free page
//! budget that admission control checks against.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │          Reservation layer (kernel-reserv)          │
//! └─────────────────┬───────────────────────────────────┘
//!                   │ PhysAllocator
//! ┌─────────────────▼───────────────────────────────────┐
//! │  per-domain free maps  │  DomainBudget  │ PageArray │
//! └─────────────────────────────────────────────────────┘
//! ```
//!
//! ## Components
//!
//! - [`PhysAllocator`]: the interface the reservation layer consumes.
//! - [`BitmapPhysAlloc`]: a bitmap-per-segment implementation.
//! - [`DomainBudget`]: free page accounting with per-class floors
//!   ([`AllocClass`]).
//! - [`PageArray`]: per-frame metadata ([`VmPage`]), notably the superpage
//!   index the mapping layer reads to decide on promotion.
//!
//! ## Budget versus free maps
//!
//! The free maps track which frames are physically handed out. The budget
//! tracks how many pages are *logically* free: a reservation takes its whole
//! run out of the free maps at once but debits the budget one populated page
//! at a time, and credits it back on every freed page.

#![cfg_attr(not(any(test, doctest)), no_std)]

extern crate alloc;

mod bitmap;
mod budget;
mod error;
pub mod page;
mod request;
mod segment;

pub use bitmap::BitmapPhysAlloc;
pub use budget::{BudgetLimits, DomainBudget};
pub use error::PhysError;
pub use page::{PageArray, VmPage};
pub use request::{AllocClass, AllocRequest, FreePool};
pub use segment::{DomainId, PhysSegment, validate_segments};

use kernel_memory_addresses::{PageFrame, PhysicalAddress};

/// Source of physical page runs.
///
/// Implementations synchronize internally; every method may be called
/// concurrently from any thread.
pub trait PhysAllocator: Send + Sync {
    /// Allocates `npages` contiguous frames from `domain` whose addresses lie
    /// in `[low, high)`, start on an `alignment` multiple and do not cross a
    /// `boundary` multiple. `boundary == 0` means no boundary. Both are in
    /// bytes and powers of two.
    fn alloc_contig(
        &self,
        domain: DomainId,
        npages: u64,
        low: PhysicalAddress,
        high: PhysicalAddress,
        alignment: u64,
        boundary: u64,
    ) -> Option<PageFrame>;

    /// Allocates a naturally aligned run of `1 << order` frames.
    fn alloc_pages(&self, domain: DomainId, pool: FreePool, order: u32) -> Option<PageFrame>;

    /// Returns a run obtained from [`PhysAllocator::alloc_pages`].
    fn free_pages(&self, frame: PageFrame, order: u32);

    /// Returns any run of allocated frames.
    fn free_contig(&self, frame: PageFrame, npages: u64);

    /// Debits `npages` from `domain`'s free page budget if the request class
    /// allows it.
    fn reserve_budget(&self, domain: DomainId, request: AllocRequest, npages: u64) -> bool;

    /// Credits `npages` back to `domain`'s free page budget.
    fn release_budget(&self, domain: DomainId, npages: u64);

    fn page_array(&self) -> &PageArray;
}
