//! Memory-management error type.
//!
//! Internal helpers return these; the syscall layer folds them into the
//! ABI status codes (`NoMemory` → `OUT_OF_MEMORY`, the rest →
//! `INVALID_PARAM`). User-pointer validation has its own error in
//! [`crate::user_copy`].

use core::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MmError {
    /// Frame or page-table allocation failed.
    NoMemory,
    /// Address outside the tracked range, or a null page directory.
    InvalidAddress,
    /// No present mapping at the requested address.
    NotMapped,
}

impl fmt::Display for MmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoMemory => write!(f, "out of physical memory"),
            Self::InvalidAddress => write!(f, "invalid address"),
            Self::NotMapped => write!(f, "address not mapped"),
        }
    }
}

pub type MmResult<T = ()> = Result<T, MmError>;
