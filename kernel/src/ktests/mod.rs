//! In-kernel test suites.
//!
//! Compiled under the `builtin-tests` feature and run from `kernel_main`
//! instead of the boot services (a test boot owns the machine). The same
//! suites run hosted under `cargo test` through a wrapper that holds the
//! kernel lock.
//!
//! Helpers here drive the kernel exactly the way the trap layer does:
//! syscalls go through `syscall_dispatch` with a synthetic ring-3 frame,
//! user buffers live in real user-mapped pages reached via `user_copy`.

pub mod sched_tests;

use catos_abi::addr::PhysAddr;
use catos_abi::ipc::{Message, MESSAGE_SIZE};
use catos_abi::task::SERVICE_ENTRY_VA;
use catos_hal::gdt::USER_CODE_SELECTOR;
use catos_lib::testing::{run_suites, TestRunSummary};
use catos_lib::TrapFrame;

use crate::process::{self, Pcb};
use crate::{sched, syscall};

/// Rebuild kernel state for one test. A test boot has no services to
/// preserve, so the reset path is the same one `kernel_init` uses.
pub(crate) fn reset_kernel_state() {
    catos_hal::pit::timer_reset_ticks();
    let _ = catos_mm::memory_init();
    process::process_init();
    sched::scheduler_init();
    crate::ipc::ipc_init();
    crate::capability::capability_init();
    crate::drivers::drivers_init();
}

/// Issue a syscall exactly as the 0x80 stub would deliver it.
pub(crate) fn do_syscall(number: u32, ebx: u32, ecx: u32, edx: u32) -> i32 {
    let mut frame = TrapFrame::default();
    frame.eax = number;
    frame.ebx = ebx;
    frame.ecx = ecx;
    frame.edx = edx;
    frame.cs = USER_CODE_SELECTOR as u32;
    frame.int_no = catos_abi::syscall::SYSCALL_VECTOR as u32;
    syscall::syscall_dispatch(&mut frame);
    frame.eax as i32
}

/// Create, frame, and enqueue a user task.
pub(crate) fn spawn_user_task() -> *mut Pcb {
    let pcb = process::process_create(0, true);
    if !pcb.is_null() {
        process::process_setup_initial_frame(pcb, SERVICE_ENTRY_VA);
        sched::scheduler_add_process(pcb);
    }
    pcb
}

/// Rotate until `pcb` is the current task. False if it never surfaces
/// (blocked or gone).
pub(crate) fn rotate_to(pcb: *mut Pcb) -> bool {
    for _ in 0..catos_abi::task::MAX_PROCESSES {
        if sched::scheduler_get_current() == pcb {
            return true;
        }
        sched::scheduler_yield();
    }
    false
}

/// Write `msg` into a task's user buffer.
pub(crate) fn write_message_to_user(dir: PhysAddr, user_ptr: u32, msg: &Message) -> bool {
    // SAFETY: Message is a plain #[repr(C)] byte bag.
    let bytes = unsafe {
        core::slice::from_raw_parts(msg as *const Message as *const u8, MESSAGE_SIZE)
    };
    catos_mm::user_copy::copy_to_user(dir, user_ptr, bytes).is_ok()
}

/// Read a `Message` back out of a task's user buffer.
pub(crate) fn read_message_from_user(dir: PhysAddr, user_ptr: u32) -> Option<Message> {
    let mut msg = Message::empty();
    // SAFETY: as above.
    let bytes = unsafe {
        core::slice::from_raw_parts_mut(&mut msg as *mut Message as *mut u8, MESSAGE_SIZE)
    };
    catos_mm::user_copy::copy_from_user(dir, user_ptr, bytes)
        .ok()
        .map(|_| msg)
}

/// Run every suite; called from `kernel_main` on a test boot.
pub fn run_all() -> TestRunSummary {
    run_suites(&[
        &sched_tests::SCHED_E2E_SUITE,
        &ipc_tests::IPC_E2E_SUITE,
    ])
}
