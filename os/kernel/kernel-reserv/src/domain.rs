//! Per-domain queues of partially populated reservations.

use crate::queue::PartPopQueue;
use kernel_info::memory::RESERV_LEVELS;
use kernel_sync::SpinMutex;

/// Queues of one memory domain, one per level.
///
/// `queues` holds each level's LRU of partially populated reservations and
/// that level's marker. `scan` serializes contiguous reclamation per level so
/// only one thread at a time owns a marker.
#[repr(align(64))]
pub(crate) struct ReservDomain {
    pub queues: SpinMutex<[PartPopQueue; RESERV_LEVELS]>,
    pub scan: [SpinMutex<()>; RESERV_LEVELS],
}

impl ReservDomain {
    pub fn new() -> Self {
        Self {
            queues: SpinMutex::named(
                "vm reserv domain",
                [PartPopQueue::new(), PartPopQueue::new()],
            ),
            scan: [
                SpinMutex::named("vm reserv scan", ()),
                SpinMutex::named("vm reserv scan", ()),
            ],
        }
    }
}
