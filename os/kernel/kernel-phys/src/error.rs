use kernel_info::memory::MAX_DOMAINS;

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum PhysError {
    #[error("no physical memory segments")]
    NoSegments,
    #[error("segment {start:#x}..{end:#x} is empty or not page aligned")]
    BadSegment { start: u64, end: u64 },
    #[error("segment at {0:#x} overlaps or precedes the previous segment")]
    Unordered(u64),
    #[error("domain {0} exceeds the supported maximum of {max}", max = MAX_DOMAINS)]
    DomainOutOfRange(u8),
}
