//! Syscall status codes.
//!
//! Every syscall returns a 32-bit signed value in `eax`: negative values are
//! one of these errors, non-negative values are payload (a PID, a byte
//! count, or a pointer cast). Kernel-internal helpers use the same variants
//! so nothing gets lost translating between layers.

/// Kernel status taxonomy. Discriminants are the wire values.
#[repr(i32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Status {
    Ok = 0,
    Error = -1,
    InvalidParam = -2,
    OutOfMemory = -3,
    PermissionDenied = -4,
    NotFound = -5,
    Timeout = -6,
    AlreadyExists = -7,
    NotImplemented = -8,
}

impl Status {
    #[inline]
    pub const fn as_raw(self) -> i32 {
        self as i32
    }

    /// Decode a raw syscall return. Non-negative values and unknown
    /// negatives both collapse to the closest meaning.
    #[inline]
    pub const fn from_raw(raw: i32) -> Self {
        match raw {
            0 => Self::Ok,
            -2 => Self::InvalidParam,
            -3 => Self::OutOfMemory,
            -4 => Self::PermissionDenied,
            -5 => Self::NotFound,
            -6 => Self::Timeout,
            -7 => Self::AlreadyExists,
            -8 => Self::NotImplemented,
            raw if raw >= 0 => Self::Ok,
            _ => Self::Error,
        }
    }

    #[inline]
    pub const fn is_ok(self) -> bool {
        matches!(self, Self::Ok)
    }

    #[inline]
    pub const fn is_err(self) -> bool {
        !self.is_ok()
    }
}

impl core::fmt::Display for Status {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let name = match self {
            Self::Ok => "ok",
            Self::Error => "error",
            Self::InvalidParam => "invalid parameter",
            Self::OutOfMemory => "out of memory",
            Self::PermissionDenied => "permission denied",
            Self::NotFound => "not found",
            Self::Timeout => "timeout",
            Self::AlreadyExists => "already exists",
            Self::NotImplemented => "not implemented",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_round_trip() {
        for status in [
            Status::Ok,
            Status::Error,
            Status::InvalidParam,
            Status::OutOfMemory,
            Status::PermissionDenied,
            Status::NotFound,
            Status::Timeout,
            Status::AlreadyExists,
            Status::NotImplemented,
        ] {
            assert_eq!(Status::from_raw(status.as_raw()), status);
        }
    }

    #[test]
    fn positive_values_are_ok() {
        assert_eq!(Status::from_raw(17), Status::Ok);
        assert_eq!(Status::from_raw(i32::MAX), Status::Ok);
    }

    #[test]
    fn unknown_negative_is_generic_error() {
        assert_eq!(Status::from_raw(-100), Status::Error);
    }
}
