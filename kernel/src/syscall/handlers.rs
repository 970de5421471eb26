//! Syscall handlers.
//!
//! Every handler takes the calling task and its trap frame, returns the
//! 32-bit value the dispatcher writes into `eax`: a negative `Status` or
//! a non-negative payload (PID, byte count, pointer cast). User pointers
//! are only ever touched through `catos_mm::user_copy` against the
//! caller's own address space.

use catos_abi::addr::{PhysAddr, VirtAddr, PAGE_SIZE};
use catos_abi::ipc::{Message, MESSAGE_SIZE};
use catos_abi::status::Status;
use catos_lib::{cpu, klog_info, TrapFrame};
use catos_mm::paging::{self, PageFlags};
use catos_mm::phys::TRACKED_RAM_SIZE;
use catos_mm::user_copy::{self, CopyError};
use catos_mm::page_alloc;

use crate::capability::capability_check;
use catos_abi::caps::{CapPerms, CapabilityKind};

use crate::process::{self, Pcb};
use crate::{drivers, ipc, sched};

/// Frames the boot image reserves (below 2 MiB): never a legal target
/// for a user-requested mapping.
const USER_MAPPABLE_FLOOR: u32 = 2 * 1024 * 1024;

fn copy_error_status(_err: CopyError) -> i32 {
    Status::InvalidParam.as_raw()
}

/// Copy a full `Message` record in from the caller's address space.
fn read_user_message(dir: PhysAddr, user_ptr: u32) -> Result<Message, i32> {
    let mut msg = Message::empty();
    // SAFETY: Message is a plain #[repr(C)] byte bag; any bit pattern is
    // valid.
    let bytes = unsafe {
        core::slice::from_raw_parts_mut(&mut msg as *mut Message as *mut u8, MESSAGE_SIZE)
    };
    user_copy::copy_from_user(dir, user_ptr, bytes).map_err(copy_error_status)?;
    Ok(msg)
}

fn write_user_message(dir: PhysAddr, user_ptr: u32, msg: &Message) -> Result<(), i32> {
    // SAFETY: as above, plain bytes out.
    let bytes = unsafe {
        core::slice::from_raw_parts(msg as *const Message as *const u8, MESSAGE_SIZE)
    };
    user_copy::copy_to_user(dir, user_ptr, bytes).map_err(copy_error_status)
}

// --- Process management ---

/// Spawn a child of the caller: a copy of its user-visible mappings,
/// fresh stacks, entry at the caller's recorded entry point. Returns the
/// child PID.
pub fn sys_process_create(caller: *mut Pcb, _frame: &mut TrapFrame) -> i32 {
    // SAFETY: live caller PCB for the duration of the syscall.
    let parent = unsafe { &*caller };
    if parent.entry_point == 0 {
        return Status::InvalidParam.as_raw();
    }

    let child = process::process_create(parent.pid, true);
    if child.is_null() {
        return Status::OutOfMemory.as_raw();
    }
    // SAFETY: freshly created, unscheduled PCB.
    let child_ref = unsafe { &mut *child };

    if paging::clone_user_mappings(parent.page_directory, child_ref.page_directory).is_err() {
        process::process_exit(child, 0);
        return Status::OutOfMemory.as_raw();
    }

    process::process_setup_initial_frame(child, parent.entry_point);
    sched::scheduler_add_process(child);
    child_ref.pid as i32
}

pub fn sys_process_exit(caller: *mut Pcb, frame: &mut TrapFrame) -> i32 {
    process::process_exit(caller, frame.ebx);
    // Unreachable on hardware; hosted builds fall through for tests.
    Status::Ok.as_raw()
}

pub fn sys_process_yield(_caller: *mut Pcb, _frame: &mut TrapFrame) -> i32 {
    sched::scheduler_yield();
    Status::Ok.as_raw()
}

/// Kill by PID: the caller must be the target itself, its parent, or
/// hold a system capability.
pub fn sys_process_kill(caller: *mut Pcb, frame: &mut TrapFrame) -> i32 {
    let target_pid = frame.ebx;
    let target = process::process_find(target_pid);
    if target.is_null() {
        return Status::NotFound.as_raw();
    }
    // SAFETY: both PCBs live.
    let (caller_pid, target_parent) = unsafe { ((*caller).pid, (*target).parent_pid) };
    let owns = caller_pid == target_pid || caller_pid == target_parent;
    if !owns
        && capability_check(caller_pid, CapabilityKind::System, CapPerms::empty()).is_err()
    {
        return Status::PermissionDenied.as_raw();
    }
    process::process_exit(target, 0);
    Status::Ok.as_raw()
}

// --- Memory management ---

/// Allocate whole pages and map them user/RW into the caller's address
/// space at their physical address. Returns the base address.
pub fn sys_memory_alloc(caller: *mut Pcb, frame: &mut TrapFrame) -> i32 {
    let bytes = frame.ebx;
    if bytes == 0 {
        return Status::InvalidParam.as_raw();
    }
    let pages = bytes.div_ceil(PAGE_SIZE);

    let Some(base) = page_alloc::alloc_pages(pages) else {
        return Status::OutOfMemory.as_raw();
    };

    // SAFETY: live caller PCB.
    let dir = unsafe { (*caller).page_directory };
    for page in 0..pages {
        let addr = base.offset(page * PAGE_SIZE);
        if paging::map_page(
            dir,
            VirtAddr::new(addr.as_u32()),
            addr,
            PageFlags::USER_RW,
        )
        .is_err()
        {
            page_alloc::free_pages(base, pages);
            return Status::OutOfMemory.as_raw();
        }
    }
    base.as_u32() as i32
}

/// Unmap and free a single page previously handed out by `memory_alloc`.
pub fn sys_memory_free(caller: *mut Pcb, frame: &mut TrapFrame) -> i32 {
    let addr = frame.ebx;
    if addr == 0 || addr % PAGE_SIZE != 0 {
        return Status::InvalidParam.as_raw();
    }
    let va = VirtAddr::new(addr);
    // SAFETY: live caller PCB.
    let dir = unsafe { (*caller).page_directory };

    // Only user-visible mappings may be surrendered; everything else in
    // this address space is kernel identity.
    match paging::translate(dir, va) {
        Some((_, flags)) if flags.contains(PageFlags::USER) => {}
        _ => return Status::InvalidParam.as_raw(),
    }

    match paging::unmap_page(dir, va) {
        Ok(frame_pa) => {
            page_alloc::free_page(frame_pa);
            Status::Ok.as_raw()
        }
        Err(_) => Status::InvalidParam.as_raw(),
    }
}

/// Explicit mapping in the caller's address space. The user bit is
/// forced on, and physical targets below the boot reservations are
/// refused — a user task cannot alias the kernel image into ring 3.
pub fn sys_memory_map(caller: *mut Pcb, frame: &mut TrapFrame) -> i32 {
    let (va, pa, raw_flags) = frame.syscall_args();
    if va % PAGE_SIZE != 0 || pa % PAGE_SIZE != 0 {
        return Status::InvalidParam.as_raw();
    }
    if va >= TRACKED_RAM_SIZE || pa >= TRACKED_RAM_SIZE {
        return Status::InvalidParam.as_raw();
    }
    if pa < USER_MAPPABLE_FLOOR || va < USER_MAPPABLE_FLOOR {
        return Status::PermissionDenied.as_raw();
    }

    let flags = (PageFlags::from_bits_truncate(raw_flags) & PageFlags::USER_RW)
        | PageFlags::PRESENT
        | PageFlags::USER;

    // SAFETY: live caller PCB.
    let dir = unsafe { (*caller).page_directory };
    match paging::map_page(dir, VirtAddr::new(va), PhysAddr::new(pa), flags) {
        Ok(()) => Status::Ok.as_raw(),
        Err(catos_mm::MmError::NoMemory) => Status::OutOfMemory.as_raw(),
        Err(_) => Status::InvalidParam.as_raw(),
    }
}

// --- IPC ---

pub fn sys_ipc_send(caller: *mut Pcb, frame: &mut TrapFrame) -> i32 {
    let (receiver_pid, msg_ptr, _) = frame.syscall_args();
    // SAFETY: live caller PCB.
    let (pid, dir) = unsafe { ((*caller).pid, (*caller).page_directory) };
    let msg = match read_user_message(dir, msg_ptr) {
        Ok(msg) => msg,
        Err(status) => return status,
    };
    ipc::ipc_send_from(pid, receiver_pid, &msg).as_raw()
}

pub fn sys_ipc_receive(caller: *mut Pcb, frame: &mut TrapFrame) -> i32 {
    let (sender_pid, msg_ptr, block) = frame.syscall_args();
    // SAFETY: live caller PCB.
    let dir = unsafe { (*caller).page_directory };

    let mut msg = Message::empty();
    let status = ipc::ipc_receive(caller, sender_pid, &mut msg, block != 0);
    if status.is_err() {
        return status.as_raw();
    }
    match write_user_message(dir, msg_ptr, &msg) {
        Ok(()) => Status::Ok.as_raw(),
        Err(status) => status,
    }
}

/// Message-type hooks run in kernel context, so only the kernel identity
/// may install them; no task ever carries PID 0, which closes this
/// syscall by construction.
pub fn sys_ipc_register(caller: *mut Pcb, frame: &mut TrapFrame) -> i32 {
    let msg_type = frame.ebx;
    // SAFETY: live caller PCB.
    let pid = unsafe { (*caller).pid };
    if pid != catos_abi::task::KERNEL_PID {
        return Status::PermissionDenied.as_raw();
    }
    if msg_type as usize >= catos_abi::ipc::MSG_TYPE_HOOK_SLOTS {
        return Status::InvalidParam.as_raw();
    }
    Status::Ok.as_raw()
}

// --- Drivers ---

pub fn sys_driver_register(caller: *mut Pcb, frame: &mut TrapFrame) -> i32 {
    let (name_ptr, capabilities, _) = frame.syscall_args();
    // SAFETY: live caller PCB.
    let (pid, dir) = unsafe { ((*caller).pid, (*caller).page_directory) };

    let mut name = [0u8; drivers::DRIVER_NAME_MAX + 1];
    let len = match user_copy::copy_cstr_from_user(dir, name_ptr, &mut name) {
        Ok(len) => len,
        Err(err) => return copy_error_status(err),
    };
    drivers::driver_register(pid, &name[..len], capabilities).as_raw()
}

/// Alias for `ipc_send`; the dispatcher has already enforced the driver
/// capability.
pub fn sys_driver_request(caller: *mut Pcb, frame: &mut TrapFrame) -> i32 {
    sys_ipc_send(caller, frame)
}

// --- System ---

#[cfg(not(target_arch = "x86"))]
static SHUTDOWN_REQUESTED: core::sync::atomic::AtomicBool =
    core::sync::atomic::AtomicBool::new(false);

/// Observability for the hosted harness.
#[cfg(not(target_arch = "x86"))]
pub fn shutdown_requested() -> bool {
    SHUTDOWN_REQUESTED.swap(false, core::sync::atomic::Ordering::AcqRel)
}

pub fn sys_system_shutdown(_caller: *mut Pcb, _frame: &mut TrapFrame) -> i32 {
    klog_info!("SYS: shutdown requested");
    cpu::disable_interrupts();
    #[cfg(target_arch = "x86")]
    cpu::halt_loop();
    #[cfg(not(target_arch = "x86"))]
    {
        SHUTDOWN_REQUESTED.store(true, core::sync::atomic::Ordering::Release);
        cpu::enable_interrupts();
        Status::Ok.as_raw()
    }
}

/// Copy in a NUL-terminated string (bounded at one payload's worth) and
/// emit it on the boot console. Returns the byte count.
pub fn sys_debug_print(caller: *mut Pcb, frame: &mut TrapFrame) -> i32 {
    let str_ptr = frame.ebx;
    // SAFETY: live caller PCB.
    let dir = unsafe { (*caller).page_directory };

    let mut buf = [0u8; 257];
    let len = match user_copy::copy_cstr_from_user(dir, str_ptr, &mut buf) {
        Ok(len) => len,
        Err(err) => return copy_error_status(err),
    };
    match core::str::from_utf8(&buf[..len]) {
        Ok(text) => klog_info!("{}", text),
        Err(_) => klog_info!("<non-utf8 debug output, {} bytes>", len),
    }
    len as i32
}
