use bitfield_struct::bitfield;

/// Priority class of an allocation request.
///
/// Each class may drain the free page count down to a lower floor:
/// normal requests stop at the reserve, system requests at the interrupt
/// minimum, interrupt requests may take the last page.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
#[repr(u8)]
pub enum AllocClass {
    #[default]
    Normal = 0,
    System = 1,
    Interrupt = 2,
}

impl AllocClass {
    #[inline]
    pub const fn into_bits(self) -> u8 {
        self as u8
    }

    #[inline]
    pub const fn from_bits(v: u8) -> Self {
        match v & 0b11 {
            0 => Self::Normal,
            1 => Self::System,
            _ => Self::Interrupt,
        }
    }
}

/// Allocation request flags.
#[bitfield(u32)]
#[derive(Eq, PartialEq)]
pub struct AllocRequest {
    /// Request class (bits 0..1).
    #[bits(2)]
    pub class: AllocClass,
    /// Caller wants zero-filled pages.
    pub zero: bool,
    /// Caller must not sleep.
    pub nowait: bool,
    /// Caller may sleep but fails rather than retrying.
    pub waitfail: bool,
    /// Pages will be wired on return.
    pub wired: bool,
    #[bits(26, default = 0)]
    _reserved_6_31: u32,
}

impl AllocRequest {
    #[inline]
    #[must_use]
    pub const fn normal() -> Self {
        Self::new().with_class(AllocClass::Normal)
    }

    #[inline]
    #[must_use]
    pub const fn system() -> Self {
        Self::new().with_class(AllocClass::System)
    }

    #[inline]
    #[must_use]
    pub const fn interrupt() -> Self {
        Self::new().with_class(AllocClass::Interrupt)
    }
}

/// Free list pool a run is taken from.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum FreePool {
    #[default]
    Default,
    Direct,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn class_round_trips_through_bits() {
        let r = AllocRequest::system().with_nowait(true);
        assert_eq!(r.class(), AllocClass::System);
        assert!(r.nowait());
        assert!(!r.zero());
        assert_eq!(r.into_bits() & 0b11, 1);
    }

    #[test]
    fn default_request_is_normal() {
        assert_eq!(AllocRequest::new().class(), AllocClass::Normal);
        assert_eq!(AllocRequest::new(), AllocRequest::normal());
    }
}
