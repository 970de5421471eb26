//! Syscall dispatch.
//!
//! The trap layer hands vector 0x80 frames here. `eax` selects the
//! handler, `ebx/ecx/edx` are its arguments, and whatever the handler
//! returns is written back into the frame's `eax` slot for the stub to
//! restore. The number space is fixed at compile time, so dispatch is a
//! `match` rather than a mutable table.
//!
//! Gating: `system_shutdown` and `driver_request` require a capability
//! before their handlers run; `process_yield` is exempt from all gating
//! so the reschedule path can never be inverted by the capability table.
//! The remaining syscalls carry their own checks (kill: ownership;
//! ipc_register: kernel identity) or are admitted.

pub mod handlers;

use catos_abi::caps::{CapPerms, CapabilityKind};
use catos_abi::status::Status;
use catos_abi::syscall::{
    syscall_name, SYS_DEBUG_PRINT, SYS_DRIVER_REGISTER, SYS_DRIVER_REQUEST, SYS_IPC_RECEIVE,
    SYS_IPC_REGISTER, SYS_IPC_SEND, SYS_MEMORY_ALLOC, SYS_MEMORY_FREE, SYS_MEMORY_MAP,
    SYS_PROCESS_CREATE, SYS_PROCESS_EXIT, SYS_PROCESS_KILL, SYS_PROCESS_YIELD,
    SYS_SYSTEM_SHUTDOWN,
};
use catos_lib::{klog_info, klog_warn, TrapFrame};

use crate::capability::capability_check;
use crate::process::Pcb;
use crate::sched;

pub type SyscallHandler = fn(caller: *mut Pcb, frame: &mut TrapFrame) -> i32;

fn syscall_lookup(number: u32) -> Option<SyscallHandler> {
    Some(match number {
        SYS_PROCESS_CREATE => handlers::sys_process_create,
        SYS_PROCESS_EXIT => handlers::sys_process_exit,
        SYS_PROCESS_YIELD => handlers::sys_process_yield,
        SYS_PROCESS_KILL => handlers::sys_process_kill,
        SYS_MEMORY_ALLOC => handlers::sys_memory_alloc,
        SYS_MEMORY_FREE => handlers::sys_memory_free,
        SYS_MEMORY_MAP => handlers::sys_memory_map,
        SYS_IPC_SEND => handlers::sys_ipc_send,
        SYS_IPC_RECEIVE => handlers::sys_ipc_receive,
        SYS_IPC_REGISTER => handlers::sys_ipc_register,
        SYS_DRIVER_REGISTER => handlers::sys_driver_register,
        SYS_DRIVER_REQUEST => handlers::sys_driver_request,
        SYS_SYSTEM_SHUTDOWN => handlers::sys_system_shutdown,
        SYS_DEBUG_PRINT => handlers::sys_debug_print,
        _ => return None,
    })
}

/// Capability gate applied before the handler runs.
fn required_capability(number: u32) -> Option<(CapabilityKind, CapPerms)> {
    match number {
        SYS_SYSTEM_SHUTDOWN => Some((CapabilityKind::System, CapPerms::empty())),
        SYS_DRIVER_REQUEST => Some((CapabilityKind::Driver, CapPerms::empty())),
        _ => None,
    }
}

pub fn syscall_init() {
    let registered = (0u32..256).filter(|&n| syscall_lookup(n).is_some()).count();
    klog_info!("SYS: {} syscalls registered", registered);
}

/// Dispatch one syscall frame. Always writes the frame's return slot
/// (except when the handler never returns, e.g. a self-exit on
/// hardware).
pub fn syscall_dispatch(frame: &mut TrapFrame) {
    let caller = sched::scheduler_get_current();
    if caller.is_null() {
        frame.set_return(Status::PermissionDenied.as_raw());
        return;
    }

    let number = frame.syscall_number();

    if number != SYS_PROCESS_YIELD {
        if let Some((kind, perms)) = required_capability(number) {
            // SAFETY: current PCB is live for the duration of its syscall.
            let pid = unsafe { (*caller).pid };
            if capability_check(pid, kind, perms).is_err() {
                frame.set_return(Status::PermissionDenied.as_raw());
                return;
            }
        }
    }

    match syscall_lookup(number) {
        Some(handler) => {
            let result = handler(caller, frame);
            frame.set_return(result);
        }
        None => {
            klog_warn!(
                "SYS: unknown syscall {:#x} ({})",
                number,
                syscall_name(number).unwrap_or("unassigned")
            );
            frame.set_return(Status::NotImplemented.as_raw());
        }
    }
}
