//! The catos core kernel.
//!
//! A preemptive multitasking supervisor for 32-bit x86: trap/interrupt
//! handling, per-process address spaces, a round-robin scheduler with
//! voluntary blocking, synchronous message-passing IPC, and the syscall
//! gate that ties them together. Drivers and services are ordinary ring-3
//! tasks; the kernel knows them only as message endpoints with fixed PIDs.
//!
//! The boot loader jumps to `_start` with interrupts disabled, flat
//! segments, and ESP at 0x90000; `kernel_main` brings the subsystems up
//! in dependency order and then idles in `hlt`, ceding the CPU to
//! whatever the timer IRQ schedules.

#![no_std]

#[cfg(test)]
extern crate std;

pub mod capability;
pub mod console;
pub mod drivers;
pub mod interrupt;
pub mod ipc;
pub mod irq;
pub mod process;
pub mod sched;
pub mod services;
pub mod syscall;

#[cfg(any(test, feature = "builtin-tests"))]
pub mod ktests;

#[cfg(test)]
pub(crate) mod test_support;

use catos_lib::{cpu, klog_info};

pub const KERNEL_VERSION: &str = "catos 0.3.0";

/// Bring up every subsystem in dependency order. Mirrors the boot path on
/// hardware and doubles as the reset entry for test fixtures, so each
/// `*_init` rebuilds its state from scratch.
pub fn kernel_init() {
    console::console_init();
    klog_info!("{} starting", KERNEL_VERSION);

    catos_hal::gdt::gdt_init();
    catos_hal::hal_init();
    catos_hal::pic::pic_init();

    if catos_mm::memory_init().is_err() {
        kernel_panic(format_args!("memory init failed during boot"));
    }

    process::process_init();
    sched::scheduler_init();
    ipc::ipc_init();
    capability::capability_init();
    drivers::drivers_init();

    syscall::syscall_init();
    interrupt::interrupt_init();
    irq::irq_init();

    catos_hal::pit::timer_set_tick_handler(sched::scheduler_tick);
    catos_hal::pit::timer_init(catos_hal::pit::PIT_DEFAULT_FREQUENCY_HZ);

    klog_info!("kernel initialization complete");
}

/// Entry point proper: initialise, start the staged services, open the
/// interrupt gate, and idle. The timer IRQ takes scheduling from here.
#[cfg(target_arch = "x86")]
#[no_mangle]
pub extern "C" fn kernel_main() -> ! {
    kernel_init();

    // A test boot owns the machine: the suites reset kernel state at
    // will, so the staged services are not started.
    #[cfg(feature = "builtin-tests")]
    {
        cpu::enable_interrupts();
        ktests::run_all();
        cpu::halt_loop();
    }

    #[cfg(not(feature = "builtin-tests"))]
    {
        services::spawn_boot_services();
        cpu::enable_interrupts();
        cpu::halt_loop();
    }
}

#[cfg(target_arch = "x86")]
core::arch::global_asm!(
    r#"
.section .text.entry
.global _start
_start:
    cli
    mov esp, 0x90000
    call kernel_main
1:
    hlt
    jmp 1b
"#
);

/// Unrecoverable kernel state: disable interrupts, dump diagnostics to
/// VGA and serial, halt forever. (Hosted builds surface this as a Rust
/// panic so `#[should_panic]` tests can observe it.)
pub fn kernel_panic(args: core::fmt::Arguments<'_>) -> ! {
    cpu::disable_interrupts();
    console::panic_print(args);
    #[cfg(not(target_arch = "x86"))]
    panic!("kernel panic");
    #[cfg(target_arch = "x86")]
    cpu::halt_loop();
}

#[cfg(all(target_arch = "x86", not(test)))]
#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    kernel_panic(format_args!("{}", info));
}

/// Kernel uptime in timer ticks.
pub fn kernel_get_uptime() -> u32 {
    catos_hal::pit::timer_get_ticks()
}
