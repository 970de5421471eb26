//! Hosted test fixtures.
//!
//! Kernel state is process-wide, so tests serialise on one lock and
//! rebuild every subsystem before running — the same reset path the boot
//! sequence uses.

use std::sync::{Mutex, MutexGuard};

static KERNEL_LOCK: Mutex<()> = Mutex::new(());

pub fn kernel_lock() -> MutexGuard<'static, ()> {
    KERNEL_LOCK
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// RAII fixture: acquires the kernel lock and re-initialises every
/// subsystem. Dropping it releases the lock; state is left for the next
/// fixture to reset.
pub struct KernelFixture {
    _guard: MutexGuard<'static, ()>,
}

impl KernelFixture {
    pub fn new() -> Self {
        let guard = kernel_lock();

        catos_hal::gdt::gdt_init();
        catos_hal::pit::timer_reset_ticks();
        catos_mm::memory_init().expect("memory init");
        crate::process::process_init();
        crate::sched::scheduler_init();
        crate::ipc::ipc_init();
        crate::capability::capability_init();
        crate::drivers::drivers_init();
        crate::irq::irq_init();

        Self { _guard: guard }
    }
}
