//! Process states, limits, and the fixed service geometry.
//!
//! Shared between the process manager, the scheduler, and the boot service
//! spawner. The state machine here is the authority on which transitions
//! the process manager may perform.

/// Upper bound on live processes; also the PCB arena size.
pub const MAX_PROCESSES: usize = 64;

/// Kernel stack size per task (two frames).
pub const KERNEL_STACK_SIZE: u32 = 8192;
/// User stack size per ring-3 task (four frames).
pub const USER_STACK_SIZE: u32 = 16384;

pub const PRIORITY_DEFAULT: u32 = 5;

/// PID of the kernel's own bookkeeping identity. Never assigned to a task.
pub const KERNEL_PID: u32 = 0;

/// Slot sentinel for intrusive index links.
pub const NO_SLOT: u8 = 0xFF;

// --- Boot service geometry ---

/// Physical staging base where the boot loader deposits service images.
pub const SERVICE_STAGING_BASE: u32 = 0x0040_0000;
/// Stride between staged images.
pub const SERVICE_IMAGE_STRIDE: u32 = 0x8000;
/// Maximum size of one service image (32 KiB, 8 frames).
pub const SERVICE_IMAGE_SIZE: u32 = 0x8000;
/// Virtual address every service is mapped and entered at.
pub const SERVICE_ENTRY_VA: u32 = 0x0040_0000;
/// Number of staged services (init, keyboard, console, timer, shell).
pub const SERVICE_COUNT: usize = 5;

pub const INIT_PID: u32 = 1;
pub const KEYBOARD_DRIVER_PID: u32 = 2;
pub const CONSOLE_DRIVER_PID: u32 = 3;
pub const TIMER_DRIVER_PID: u32 = 4;
pub const SHELL_PID: u32 = 5;

/// Process lifecycle state.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum ProcessState {
    /// Slot reserved, resources allocated, not yet schedulable.
    #[default]
    Created = 0,
    /// On the ready queue.
    Ready = 1,
    /// The single currently executing task.
    Running = 2,
    /// Waiting in `ipc_receive`; off every queue.
    Blocked = 3,
    /// Tearing down; the slot is about to be reused.
    Terminated = 4,
}

impl ProcessState {
    #[inline]
    pub const fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Created,
            1 => Self::Ready,
            2 => Self::Running,
            3 => Self::Blocked,
            _ => Self::Terminated,
        }
    }

    #[inline]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    /// Legal lifecycle transitions. Everything may terminate; only the
    /// running task may block.
    #[inline]
    pub const fn can_transition_to(self, target: Self) -> bool {
        match self {
            Self::Created => matches!(target, Self::Ready | Self::Terminated),
            Self::Ready => matches!(target, Self::Running | Self::Terminated),
            Self::Running => matches!(target, Self::Ready | Self::Blocked | Self::Terminated),
            Self::Blocked => matches!(target, Self::Ready | Self::Terminated),
            Self::Terminated => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_round_trip() {
        for state in [
            ProcessState::Created,
            ProcessState::Ready,
            ProcessState::Running,
            ProcessState::Blocked,
            ProcessState::Terminated,
        ] {
            assert_eq!(ProcessState::from_u8(state.as_u8()), state);
        }
    }

    #[test]
    fn only_running_may_block() {
        assert!(ProcessState::Running.can_transition_to(ProcessState::Blocked));
        assert!(!ProcessState::Ready.can_transition_to(ProcessState::Blocked));
        assert!(!ProcessState::Created.can_transition_to(ProcessState::Blocked));
        assert!(!ProcessState::Blocked.can_transition_to(ProcessState::Blocked));
    }

    #[test]
    fn terminated_is_final() {
        for target in [
            ProcessState::Created,
            ProcessState::Ready,
            ProcessState::Running,
            ProcessState::Blocked,
            ProcessState::Terminated,
        ] {
            assert!(!ProcessState::Terminated.can_transition_to(target));
        }
    }

    #[test]
    fn service_geometry() {
        assert_eq!(SERVICE_IMAGE_SIZE % crate::addr::PAGE_SIZE, 0);
        assert_eq!(KERNEL_STACK_SIZE % crate::addr::PAGE_SIZE, 0);
        assert_eq!(USER_STACK_SIZE % crate::addr::PAGE_SIZE, 0);
    }
}
