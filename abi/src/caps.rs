//! Capability kinds and permission bits.

use bitflags::bitflags;

/// Upper bound on capabilities held by a single process.
pub const CAPS_PER_PROCESS: usize = 16;

/// What a capability governs.
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CapabilityKind {
    Process = 0,
    Memory = 1,
    Driver = 2,
    Hardware = 3,
    System = 4,
    Ipc = 5,
}

impl CapabilityKind {
    #[inline]
    pub const fn as_u32(self) -> u32 {
        self as u32
    }

    pub const fn from_u32(value: u32) -> Option<Self> {
        match value {
            0 => Some(Self::Process),
            1 => Some(Self::Memory),
            2 => Some(Self::Driver),
            3 => Some(Self::Hardware),
            4 => Some(Self::System),
            5 => Some(Self::Ipc),
            _ => None,
        }
    }
}

bitflags! {
    /// Permission bitmask carried by a capability.
    #[repr(transparent)]
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
    pub struct CapPerms: u32 {
        const READ = 0x01;
        const WRITE = 0x02;
        const EXECUTE = 0x04;
        const CREATE = 0x08;
        const DELETE = 0x10;
        const TRANSFER = 0x20;
        const ALLOC = 0x40;
        const FREE = 0x80;
    }
}
