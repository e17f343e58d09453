//! # Memory Layout

use kernel_memory_addresses::{PageSize, Size2M, Size64K};

pub use kernel_memory_addresses::{PAGE_SHIFT, PAGE_SIZE};

/// Number of reservation levels.
pub const RESERV_LEVELS: usize = 2;

/// log2 of the number of base pages in a level-0 reservation.
pub const LEVEL0_ORDER: u32 = 4;

/// log2 of the number of base pages in a level-1 reservation.
pub const LEVEL1_ORDER: u32 = 9;

/// Largest order the physical allocator keeps free lists for.
pub const MAX_FREE_ORDER: u32 = 12;

/// Upper bound on the number of memory (NUMA) domains.
pub const MAX_DOMAINS: usize = 8;

/// Ticks that must pass before a partially populated reservation is moved
/// to the tail of its queue again.
pub const PARTPOP_SLOP_TICKS: u32 = 1;

/// Pages per level-0 reservation.
pub const LEVEL0_PAGES: usize = 1 << LEVEL0_ORDER;

/// Pages per level-1 reservation.
pub const LEVEL1_PAGES: usize = 1 << LEVEL1_ORDER;

/// Level-0 runs per level-1 reservation.
pub const LEVEL0_PER_LEVEL1: usize = 1 << (LEVEL1_ORDER - LEVEL0_ORDER);

const _: () = {
    assert!(LEVEL0_ORDER < LEVEL1_ORDER);
    assert!(LEVEL1_ORDER <= MAX_FREE_ORDER);
    assert!(LEVEL0_ORDER + PAGE_SHIFT == Size64K::SHIFT);
    assert!(LEVEL1_ORDER + PAGE_SHIFT == Size2M::SHIFT);
    assert!(LEVEL0_PAGES as u64 == Size64K::FRAMES);
    assert!(LEVEL1_PAGES as u64 == Size2M::FRAMES);
    assert!(MAX_DOMAINS <= u8::MAX as usize);
    assert!(PARTPOP_SLOP_TICKS > 0);
};
