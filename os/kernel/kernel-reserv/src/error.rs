use kernel_phys::PhysError;

/// Why a reservation allocation failed.
///
/// None of these leave state behind; the caller falls back to a plain page
/// allocation.
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum ReservError {
    #[error("request cannot be satisfied from a reservation")]
    Impossible,
    #[error("free page budget or physical runs exhausted")]
    Exhausted,
    #[error("reservation changed before it was locked")]
    RaceLost,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum StartupError {
    #[error("invalid reservation orders {0} and {1}")]
    InvalidOrders(u32, u32),
    #[error("partial population slop must be at least one tick")]
    InvalidSlop,
    #[error("physical memory layout: {0}")]
    Phys(#[from] PhysError),
    #[error("reservation metadata does not fit below {0:#x}")]
    NoRoom(u64),
    #[error("a reservation manager is already installed")]
    AlreadyInstalled,
}
