//! Interrupt and trap layer.
//!
//! `stubs` (the only assembly here besides the context switch) builds one
//! uniform [`TrapFrame`] for every vector and funnels into
//! [`trap_dispatch`]; `idt` wires the vectors up. Dispatch rules:
//!
//! - 0–31: CPU exception. Ring-3 faults terminate the offending task with
//!   `exit_code = vector`; ring-0 faults are fatal.
//! - 32–47: hardware IRQ. The registered handler runs, the PIC gets its
//!   EOI, and a pending preemption request (timer quantum) is honoured on
//!   the way out — after EOI, so the next tick can arrive.
//! - 0x80: the syscall gate.
//!
//! On return the stub restores every saved register, skips the normalised
//! `(int_no, err_code)` pair, and `iret`s, unwinding same-ring and
//! cross-ring entries alike.

pub mod idt;
pub mod stubs;

use catos_lib::{cpu, klog_error, klog_warn, TrapFrame};

use crate::{irq, kernel_panic, process, sched, syscall};

pub const EXCEPTION_VECTORS: u32 = 32;
pub const IRQ_BASE_VECTOR: u32 = 32;
pub const IRQ_LAST_VECTOR: u32 = 47;

/// Install the IDT. Interrupts stay disabled until `kernel_main` opens
/// the gate after services are up.
pub fn interrupt_init() {
    idt::idt_init();
}

/// Common dispatch target for every stub.
///
/// # Safety
/// Called from the assembly stubs with `frame` pointing at the trap frame
/// they just built on the current kernel stack.
#[no_mangle]
pub extern "C-unwind" fn trap_dispatch(frame: *mut TrapFrame) {
    if frame.is_null() {
        return;
    }
    // SAFETY: the stub hands us a live frame on this stack.
    let frame = unsafe { &mut *frame };

    match frame.int_no {
        vector if vector < EXCEPTION_VECTORS => handle_exception(frame),
        vector if (IRQ_BASE_VECTOR..=IRQ_LAST_VECTOR).contains(&vector) => {
            let irq_line = (vector - IRQ_BASE_VECTOR) as u8;
            irq::handle_irq(irq_line, frame);
            catos_hal::pic::pic_send_eoi(irq_line);
            sched::scheduler_handle_post_irq();
        }
        vector if vector == catos_abi::syscall::SYSCALL_VECTOR as u32 => {
            syscall::syscall_dispatch(frame);
        }
        vector => {
            klog_warn!("INT: unknown vector {} ignored", vector);
        }
    }
}

fn handle_exception(frame: &mut TrapFrame) {
    klog_error!(
        "EXC: vector {} ({}) err={:#x} eip={:#010x} cs={:#x} eflags={:#x}",
        frame.int_no,
        exception_name(frame.int_no),
        frame.err_code,
        frame.eip,
        frame.cs,
        frame.eflags
    );
    if frame.int_no == 14 {
        klog_error!("EXC: page fault address {:#010x}", cpu::read_cr2());
    }

    if frame.is_user() {
        let current = sched::scheduler_get_current();
        if !current.is_null() {
            // SAFETY: current PCB stays valid until process_exit reclaims it.
            let pid = unsafe { (*current).pid };
            klog_error!("EXC: terminating PID {} (exit code {})", pid, frame.int_no);
            process::process_exit(current, frame.int_no);
            return;
        }
    }

    kernel_panic(format_args!(
        "unhandled CPU exception {} ({}) in ring 0 at {:#010x}",
        frame.int_no,
        exception_name(frame.int_no),
        frame.eip
    ));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ktests::{rotate_to, spawn_user_task};
    use crate::test_support::KernelFixture;
    use crate::{ipc, process};
    use catos_abi::addr::VirtAddr;
    use catos_abi::ipc::{Message, MSG_SIGNAL};
    use catos_abi::syscall::{SYS_MEMORY_MAP, SYSCALL_VECTOR};
    use catos_hal::gdt::{KERNEL_CODE_SELECTOR, USER_CODE_SELECTOR};
    use catos_mm::paging;

    fn exception_frame(vector: u32, cs: u16) -> catos_lib::TrapFrame {
        let mut frame = catos_lib::TrapFrame::default();
        frame.int_no = vector;
        frame.cs = cs as u32;
        frame.eip = 0x0040_0123;
        frame.eflags = 0x202;
        frame
    }

    #[test]
    fn ring3_fault_terminates_task_and_signals_parent() {
        let _fixture = KernelFixture::new();
        let parent = process::process_create(0, true);
        let parent_pid = unsafe { (*parent).pid };
        let child = process::process_create(parent_pid, true);
        let child_pid = unsafe { (*child).pid };
        process::process_setup_initial_frame(child, 0x0040_0000);
        crate::sched::scheduler_add_process(child);
        crate::sched::scheduler_yield();
        assert_eq!(crate::sched::scheduler_get_current(), child);

        // A user task executing a privileged instruction takes a GPF.
        let mut frame = exception_frame(13, USER_CODE_SELECTOR);
        trap_dispatch(&mut frame);

        assert!(process::process_find(child_pid).is_null());
        let mut out = Message::empty();
        assert!(ipc::ipc_receive(parent, child_pid, &mut out, false).is_ok());
        assert_eq!(out.header.msg_type, MSG_SIGNAL);
        assert_eq!(out.payload(), child_pid.to_le_bytes());
    }

    #[test]
    #[should_panic]
    fn ring0_fault_is_fatal() {
        let _fixture = KernelFixture::new();
        let mut frame = exception_frame(13, KERNEL_CODE_SELECTOR);
        trap_dispatch(&mut frame);
    }

    #[test]
    fn cross_address_space_isolation() {
        let _fixture = KernelFixture::new();
        let a = spawn_user_task();
        let b = spawn_user_task();
        let b_pid = unsafe { (*b).pid };
        crate::sched::scheduler_yield();

        // A maps a user page at 0x800000 in its own address space.
        assert!(rotate_to(a));
        let frame_pa = catos_mm::page_alloc::alloc_page().unwrap();
        let mut syscall_frame = catos_lib::TrapFrame::default();
        syscall_frame.eax = SYS_MEMORY_MAP;
        syscall_frame.ebx = 0x0080_0000;
        syscall_frame.ecx = frame_pa.as_u32();
        syscall_frame.edx = 0x7;
        syscall_frame.cs = USER_CODE_SELECTOR as u32;
        syscall_frame.int_no = SYSCALL_VECTOR as u32;
        trap_dispatch(&mut syscall_frame);
        assert_eq!(syscall_frame.eax, 0);

        let a_dir = unsafe { (*a).page_directory };
        let b_dir = unsafe { (*b).page_directory };
        let probe = VirtAddr::new(0x0080_0000);
        assert!(paging::page_is_user_accessible(a_dir, probe));
        // The same address in B's space stays supervisor-only, so B's
        // access faults and terminates B.
        assert!(!paging::page_is_user_accessible(b_dir, probe));

        assert!(rotate_to(b));
        #[cfg(not(target_arch = "x86"))]
        catos_lib::cpu::sim_set_cr2(0x0080_0000);
        let mut fault = exception_frame(14, USER_CODE_SELECTOR);
        trap_dispatch(&mut fault);

        assert!(process::process_find(b_pid).is_null());
        // The kernel and A are untouched.
        assert!(paging::translate(paging::kernel_directory(), probe.page_base()).is_some());
        assert!(paging::page_is_user_accessible(a_dir, probe));
    }

    #[test]
    fn timer_irq_preempts_through_trap_exit() {
        let _fixture = KernelFixture::new();
        catos_hal::pit::timer_set_tick_handler(crate::sched::scheduler_tick);
        let a = spawn_user_task();
        let b = spawn_user_task();
        crate::sched::scheduler_yield();
        assert_eq!(crate::sched::scheduler_get_current(), a);

        // A full quantum of timer interrupts arriving through the trap
        // layer rotates the CPU to the other task.
        for _ in 0..crate::sched::TIME_QUANTUM {
            let mut frame = exception_frame(32, KERNEL_CODE_SELECTOR);
            trap_dispatch(&mut frame);
        }
        assert_eq!(crate::sched::scheduler_get_current(), b);
        assert!(crate::irq::irq_count(0) >= crate::sched::TIME_QUANTUM as u64);
    }

    #[test]
    fn unknown_vector_is_ignored() {
        let _fixture = KernelFixture::new();
        let mut frame = exception_frame(0xC0, KERNEL_CODE_SELECTOR);
        trap_dispatch(&mut frame);
        // Nothing to assert beyond "did not panic / did not dispatch".
        assert_eq!(frame.eax, 0);
    }
}

pub fn exception_name(vector: u32) -> &'static str {
    match vector {
        0 => "divide error",
        1 => "debug",
        2 => "nmi",
        3 => "breakpoint",
        4 => "overflow",
        5 => "bound range",
        6 => "invalid opcode",
        7 => "device not available",
        8 => "double fault",
        10 => "invalid tss",
        11 => "segment not present",
        12 => "stack segment fault",
        13 => "general protection fault",
        14 => "page fault",
        16 => "x87 fpu error",
        17 => "alignment check",
        18 => "machine check",
        19 => "simd fp exception",
        _ => "reserved",
    }
}
