//! Kernel support library for catos.
//!
//! Everything here is subsystem-agnostic plumbing: CPU intrinsics, port
//! I/O, the interrupt-safe spinlock, the logging funnel, the uniform trap
//! frame, and the in-kernel test harness. Higher layers (`hal`, `mm`,
//! `kernel`) build on these; this crate depends only on `catos_abi`.
//!
//! All x86 instruction sequences live behind `#[cfg(target_arch = "x86")]`
//! with functional stand-ins elsewhere, so the whole kernel logic builds
//! and tests on a hosted target.

#![no_std]

#[cfg(test)]
extern crate std;

#[cfg(test)]
pub(crate) mod test_support {
    //! Serialises the tests that toggle the simulated interrupt flag.

    use std::sync::{Mutex, MutexGuard};

    static LOCK: Mutex<()> = Mutex::new(());

    pub fn lock() -> MutexGuard<'static, ()> {
        LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

pub mod cpu;
pub mod frame;
pub mod io;
pub mod klog;
pub mod ports;
pub mod spinlock;
pub mod testing;

pub use frame::TrapFrame;
pub use spinlock::{IrqMutex, IrqMutexGuard};

// Re-exported for the test-suite macros in `testing`.
pub use paste;

/// One-shot initialisation flag for subsystems with a `*_init` entry point.
pub struct InitFlag(core::sync::atomic::AtomicBool);

impl InitFlag {
    pub const fn new() -> Self {
        Self(core::sync::atomic::AtomicBool::new(false))
    }

    /// Returns true exactly once; later calls see the flag already set.
    #[inline]
    pub fn begin_init(&self) -> bool {
        !self
            .0
            .swap(true, core::sync::atomic::Ordering::AcqRel)
    }

    #[inline]
    pub fn is_initialized(&self) -> bool {
        self.0.load(core::sync::atomic::Ordering::Acquire)
    }

    /// Clears the flag so `*_init` may run again (test fixtures only).
    #[inline]
    pub fn reset(&self) {
        self.0.store(false, core::sync::atomic::Ordering::Release);
    }
}

impl Default for InitFlag {
    fn default() -> Self {
        Self::new()
    }
}
