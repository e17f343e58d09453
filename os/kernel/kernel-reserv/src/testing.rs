//! Fixtures for unit tests.

use crate::{AnonymousGrows, ArrayMode, ReservConfig, ReservManager};
use alloc::boxed::Box;
use alloc::sync::Arc;
use kernel_phys::{BitmapPhysAlloc, DomainId, PhysSegment};

pub const MB: u64 = 1 << 20;
pub const D0: DomainId = DomainId::new(0);

/// A manager over `[2 MiB, 2 MiB + mb MiB)` in domain 0.
pub fn manager(mb: u64) -> (ReservManager, Arc<BitmapPhysAlloc>) {
    let segments = [PhysSegment::new(2 * MB, (2 + mb) * MB, D0)];
    let phys = Arc::new(BitmapPhysAlloc::new(&segments).unwrap());
    let m = ReservManager::new(
        ReservConfig::default(),
        &segments,
        ArrayMode::Dense,
        phys.clone(),
        Box::new(AnonymousGrows),
    )
    .unwrap();
    (m, phys)
}
