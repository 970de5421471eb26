//! Process manager.
//!
//! PCBs live in a fixed arena indexed by slot; the scheduler's intrusive
//! ready-queue links are slot indices, never pointers, so nothing here
//! owns anything cyclically. `parent_pid` and `waiting_for` are weak
//! references resolved by PID lookup and tolerate the target having
//! vanished.
//!
//! The initial kernel-stack frame built by [`process_setup_initial_frame`]
//! is the subtlest invariant in the kernel: for a user task it emulates
//! the exact stack a trap handler leaves just before `iret` to ring 3, so
//! the very first context switch "returns" into the first-run trampoline
//! and drops into user mode indistinguishably from a trap return.

use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicU8, AtomicU32, Ordering};

use catos_abi::addr::{PhysAddr, VirtAddr, PAGE_SIZE};
use catos_abi::status::Status;
use catos_abi::task::{
    ProcessState, KERNEL_PID, KERNEL_STACK_SIZE, MAX_PROCESSES, NO_SLOT, PRIORITY_DEFAULT,
    USER_STACK_SIZE,
};
use catos_hal::gdt::{USER_CODE_SELECTOR, USER_DATA_SELECTOR};
use catos_lib::cpu::EFLAGS_TASK_INITIAL;
use catos_lib::{klog_info, klog_warn, IrqMutex};
use catos_mm::{page_alloc, paging, phys};

use crate::sched::switch::first_run_trampoline_addr;
use crate::{capability, drivers, ipc, sched};

const KERNEL_STACK_PAGES: u32 = KERNEL_STACK_SIZE / PAGE_SIZE;
const USER_STACK_PAGES: u32 = USER_STACK_SIZE / PAGE_SIZE;

/// Process control block. Fields are mutated through raw pointers under
/// the single-CPU interrupt discipline; only `state` is interior-mutable
/// because IRQ-side wakeups transition it concurrently with task-side
/// reads.
pub struct Pcb {
    pub pid: u32,
    pub parent_pid: u32,
    state: AtomicU8,
    pub priority: u32,
    pub cpu_time: u32,
    pub is_user: bool,
    pub page_directory: PhysAddr,
    /// Kernel stack base (identity-mapped, supervisor).
    pub kernel_stack: PhysAddr,
    /// User stack base; `NULL` for kernel tasks.
    pub user_stack: PhysAddr,
    pub entry_point: u32,
    /// Kernel-stack pointer captured by the last context switch out.
    pub saved_sp: u32,
    pub exit_code: u32,
    /// Sender PID a blocked receive is waiting for (0 = any).
    pub waiting_for: u32,
    // Intrusive ready-queue links (slot indices).
    pub(crate) next_ready: u8,
    pub(crate) prev_ready: u8,
}

impl Pcb {
    const fn empty() -> Self {
        Self {
            pid: 0,
            parent_pid: 0,
            state: AtomicU8::new(ProcessState::Created as u8),
            priority: 0,
            cpu_time: 0,
            is_user: false,
            page_directory: PhysAddr::NULL,
            kernel_stack: PhysAddr::NULL,
            user_stack: PhysAddr::NULL,
            entry_point: 0,
            saved_sp: 0,
            exit_code: 0,
            waiting_for: 0,
            next_ready: NO_SLOT,
            prev_ready: NO_SLOT,
        }
    }

    #[inline]
    pub fn state(&self) -> ProcessState {
        ProcessState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Perform `current → target` if the state machine allows it.
    pub fn try_transition(&self, target: ProcessState) -> bool {
        let current = self.state.load(Ordering::Acquire);
        if !ProcessState::from_u8(current).can_transition_to(target) {
            return false;
        }
        self.state
            .compare_exchange(current, target.as_u8(), Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Reset to Created, bypassing the state machine (slot recycling).
    fn reset_state(&self) {
        self.state
            .store(ProcessState::Created.as_u8(), Ordering::Release);
    }

    #[inline]
    pub fn kernel_stack_top(&self) -> u32 {
        self.kernel_stack.as_u32() + KERNEL_STACK_SIZE
    }
}

struct PcbArena {
    used: UnsafeCell<[bool; MAX_PROCESSES]>,
    slots: UnsafeCell<[Pcb; MAX_PROCESSES]>,
}

// SAFETY: slot reservation goes through TABLE_LOCK; PCB field access
// follows the single-CPU interrupt discipline described on `Pcb`.
unsafe impl Sync for PcbArena {}

const EMPTY_PCB: Pcb = Pcb::empty();

static ARENA: PcbArena = PcbArena {
    used: UnsafeCell::new([false; MAX_PROCESSES]),
    slots: UnsafeCell::new([EMPTY_PCB; MAX_PROCESSES]),
};

static TABLE_LOCK: IrqMutex<()> = IrqMutex::new(());
static NEXT_PID: AtomicU32 = AtomicU32::new(1);

#[inline]
pub(crate) fn pcb_by_slot(slot: u8) -> *mut Pcb {
    if slot as usize >= MAX_PROCESSES {
        return core::ptr::null_mut();
    }
    // SAFETY: in-bounds arena index.
    unsafe { (ARENA.slots.get() as *mut Pcb).add(slot as usize) }
}

#[inline]
pub(crate) fn slot_of(pcb: *const Pcb) -> u8 {
    let base = ARENA.slots.get() as *const Pcb;
    // SAFETY: pcb points into the arena (callers only hand out arena PCBs).
    let index = unsafe { pcb.offset_from(base) };
    index as u8
}

/// Reset the table. Also the boot-time init.
pub fn process_init() {
    let _guard = TABLE_LOCK.lock();
    // SAFETY: guarded by TABLE_LOCK.
    unsafe {
        for used in (*ARENA.used.get()).iter_mut() {
            *used = false;
        }
        for pcb in (*ARENA.slots.get()).iter_mut() {
            *pcb = Pcb::empty();
        }
    }
    NEXT_PID.store(1, Ordering::Release);
    klog_info!("PROC: process table ready ({} slots)", MAX_PROCESSES);
}

/// Rolling PID allocator: skips 0, skips live collisions, wraps inside
/// `MAX_PROCESSES` so a PID always doubles as a mailbox index.
fn allocate_pid_locked(used: &[bool; MAX_PROCESSES], slots: &[Pcb; MAX_PROCESSES]) -> u32 {
    let next = NEXT_PID.load(Ordering::Acquire);
    for attempt in 0..MAX_PROCESSES as u32 {
        let pid = (next + attempt) % MAX_PROCESSES as u32;
        if pid == KERNEL_PID {
            continue;
        }
        let collides = used
            .iter()
            .zip(slots.iter())
            .any(|(used, pcb)| *used && pcb.pid == pid);
        if !collides {
            NEXT_PID.store(pid + 1, Ordering::Release);
            return pid;
        }
    }
    0
}

/// Create a process: PCB slot, PID, address space with the kernel
/// identity mapping, kernel stack, and (for ring-3 tasks) user stack.
/// The task still needs [`process_setup_initial_frame`] before it can be
/// scheduled. Returns null when the table or memory is exhausted.
pub fn process_create(parent_pid: u32, is_user: bool) -> *mut Pcb {
    let pcb = {
        let _guard = TABLE_LOCK.lock();
        // SAFETY: guarded by TABLE_LOCK.
        let used = unsafe { &mut *ARENA.used.get() };
        let slots = unsafe { &mut *ARENA.slots.get() };

        let Some(slot) = used.iter().position(|in_use| !*in_use) else {
            klog_warn!("PROC: table full");
            return core::ptr::null_mut();
        };
        let pid = allocate_pid_locked(used, slots);
        if pid == 0 {
            return core::ptr::null_mut();
        }

        let pcb = &mut slots[slot];
        *pcb = Pcb::empty();
        pcb.pid = pid;
        pcb.parent_pid = parent_pid;
        pcb.priority = PRIORITY_DEFAULT;
        pcb.is_user = is_user;
        pcb.reset_state();
        used[slot] = true;
        pcb as *mut Pcb
    };

    // Resource allocation happens outside the table lock; the slot is
    // already reserved so nothing else can claim it.
    // SAFETY: freshly reserved arena slot.
    let p = unsafe { &mut *pcb };

    let Some(dir) = paging::create_page_directory() else {
        return release_failed_create(p);
    };
    p.page_directory = dir;
    if paging::map_kernel_range(dir).is_err() {
        return release_failed_create(p);
    }

    let Some(kernel_stack) = page_alloc::alloc_pages(KERNEL_STACK_PAGES) else {
        return release_failed_create(p);
    };
    p.kernel_stack = kernel_stack;
    for page in 0..KERNEL_STACK_PAGES {
        let addr = kernel_stack.offset(page * PAGE_SIZE);
        if paging::map_page(
            dir,
            VirtAddr::new(addr.as_u32()),
            addr,
            paging::PageFlags::KERNEL_RW,
        )
        .is_err()
        {
            return release_failed_create(p);
        }
    }

    if is_user {
        let Some(user_stack) = page_alloc::alloc_pages(USER_STACK_PAGES) else {
            return release_failed_create(p);
        };
        p.user_stack = user_stack;
        for page in 0..USER_STACK_PAGES {
            let addr = user_stack.offset(page * PAGE_SIZE);
            if paging::map_page(
                dir,
                VirtAddr::new(addr.as_u32()),
                addr,
                paging::PageFlags::USER_RW,
            )
            .is_err()
            {
                return release_failed_create(p);
            }
        }
    }

    pcb
}

/// Undo a partial `process_create`. Directory teardown frees the mapped
/// user frames; the trailing user-stack free catches frames a failed
/// mapping pass never reached (freeing a clear bitmap bit is a no-op).
fn release_failed_create(p: &mut Pcb) -> *mut Pcb {
    if !p.page_directory.is_null() {
        paging::destroy_page_directory(p.page_directory);
    }
    if !p.user_stack.is_null() {
        page_alloc::free_pages(p.user_stack, USER_STACK_PAGES);
    }
    if !p.kernel_stack.is_null() {
        page_alloc::free_pages(p.kernel_stack, KERNEL_STACK_PAGES);
    }
    release_slot(p);
    core::ptr::null_mut()
}

fn release_slot(p: &mut Pcb) {
    let slot = slot_of(p);
    let _guard = TABLE_LOCK.lock();
    // SAFETY: guarded by TABLE_LOCK.
    unsafe {
        (*ARENA.used.get())[slot as usize] = false;
        (*ARENA.slots.get())[slot as usize] = Pcb::empty();
    }
}

/// Build the initial kernel-stack frame.
///
/// User task, top of kernel stack downward: the `iret` record (user SS,
/// user ESP, EFLAGS with IF, user CS, entry EIP), a synthesised `(0, 0)`
/// error pair, eight zeroed `pusha` slots, four user data-segment slots,
/// and the first-run trampoline's address as the "return address" the
/// context switch will pop. Below that, the five scheduler-saved slots
/// (EFLAGS, EBP, EBX, ESI, EDI) the switch itself pops.
///
/// Kernel task: just the entry point as the return address, plus the five
/// scheduler-saved slots.
pub fn process_setup_initial_frame(pcb: *mut Pcb, entry_point: u32) {
    if pcb.is_null() || entry_point == 0 {
        crate::kernel_panic(format_args!("invalid initial frame request"));
    }
    // SAFETY: caller owns this not-yet-scheduled PCB.
    let p = unsafe { &mut *pcb };

    let mut sp = p.kernel_stack_top();
    let mut push = |value: u32| {
        sp -= 4;
        phys::write_u32(PhysAddr::new(sp), value);
    };

    if p.is_user {
        push(USER_DATA_SELECTOR as u32); // ss
        push(p.user_stack.as_u32() + USER_STACK_SIZE); // user esp
        push(EFLAGS_TASK_INITIAL);
        push(USER_CODE_SELECTOR as u32); // cs
        push(entry_point);

        push(0); // err_code
        push(0); // int_no

        // pusha order: eax, ecx, edx, ebx, esp, ebp, esi, edi.
        for _ in 0..8 {
            push(0);
        }

        push(USER_DATA_SELECTOR as u32); // ds
        push(USER_DATA_SELECTOR as u32); // es
        push(USER_DATA_SELECTOR as u32); // fs
        push(USER_DATA_SELECTOR as u32); // gs

        push(first_run_trampoline_addr());
    } else {
        push(entry_point);
    }

    // Slots popped by the context switch itself.
    push(EFLAGS_TASK_INITIAL);
    push(0); // ebp
    push(0); // ebx
    push(0); // esi
    push(0); // edi

    p.saved_sp = sp;
    p.entry_point = entry_point;
}

/// Terminate `pcb`: notify the parent, re-parent children, purge the
/// mailbox and capabilities, release the address space and stacks, free
/// the slot, and — when the dying task is the current one — leave through
/// the scheduler for good.
///
/// The last steps of a self-exit run on the already-freed kernel stack;
/// that is safe here because nothing allocates between the release and
/// the final switch, and no other context can run before it.
pub fn process_exit(pcb: *mut Pcb, exit_code: u32) {
    if pcb.is_null() {
        return;
    }
    // SAFETY: live PCB handed in by scheduler/syscall paths.
    let p = unsafe { &mut *pcb };
    let pid = p.pid;

    klog_info!("PROC: terminating PID {} (exit code {})", pid, exit_code);
    p.exit_code = exit_code;
    if !p.try_transition(ProcessState::Terminated) {
        // Already terminated; nothing left to do.
        return;
    }

    let was_current = sched::scheduler_get_current() == pcb;
    sched::scheduler_remove_process(pcb);

    // Exit notification: signal message whose payload is the dying PID.
    if p.parent_pid != KERNEL_PID && !process_find(p.parent_pid).is_null() {
        ipc::send_exit_notification(p.parent_pid, pid);
    }

    // Orphans fall to the kernel identity.
    {
        let _guard = TABLE_LOCK.lock();
        // SAFETY: guarded by TABLE_LOCK.
        unsafe {
            let used = &*ARENA.used.get();
            let slots = &mut *ARENA.slots.get();
            for (used, child) in used.iter().zip(slots.iter_mut()) {
                if *used && child.parent_pid == pid {
                    child.parent_pid = KERNEL_PID;
                }
            }
        }
    }

    ipc::ipc_clear_queue(pid);
    capability::capability_remove_all(pid);
    drivers::driver_unregister_pid(pid);

    // Running on this address space? Move to the kernel directory before
    // tearing it down.
    if was_current && paging::current_directory() == p.page_directory {
        paging::set_current_directory(paging::kernel_directory());
    }
    paging::destroy_page_directory(p.page_directory);
    page_alloc::free_pages(p.kernel_stack, KERNEL_STACK_PAGES);

    release_slot(p);

    if was_current {
        sched::scheduler_exit_current();
    }
}

/// Terminate by PID. Permission checks live at the syscall boundary.
pub fn process_kill(pid: u32) -> Status {
    let target = process_find(pid);
    if target.is_null() {
        return Status::NotFound;
    }
    process_exit(target, 0);
    Status::Ok
}

pub fn process_find(pid: u32) -> *mut Pcb {
    if pid == KERNEL_PID {
        return core::ptr::null_mut();
    }
    let _guard = TABLE_LOCK.lock();
    // SAFETY: guarded by TABLE_LOCK.
    unsafe {
        let used = &*ARENA.used.get();
        let slots = &mut *ARENA.slots.get();
        for (slot, (used, pcb)) in used.iter().zip(slots.iter_mut()).enumerate() {
            if *used && pcb.pid == pid {
                return pcb_by_slot(slot as u8);
            }
        }
    }
    core::ptr::null_mut()
}

/// Live PCB count.
pub fn process_count() -> usize {
    let _guard = TABLE_LOCK.lock();
    // SAFETY: guarded by TABLE_LOCK.
    unsafe { (*ARENA.used.get()).iter().filter(|used| **used).count() }
}

/// Run `f` over every live PCB slot (diagnostics, invariant checks).
pub fn for_each_process(mut f: impl FnMut(&Pcb)) {
    let _guard = TABLE_LOCK.lock();
    // SAFETY: guarded by TABLE_LOCK.
    unsafe {
        let used = &*ARENA.used.get();
        let slots = &*ARENA.slots.get();
        for (used, pcb) in used.iter().zip(slots.iter()) {
            if *used {
                f(pcb);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::KernelFixture;

    #[test]
    fn create_allocates_pid_and_address_space() {
        let _fixture = KernelFixture::new();
        let p = process_create(0, true);
        assert!(!p.is_null());
        let p = unsafe { &mut *p };
        assert_eq!(p.pid, 1);
        assert_eq!(p.state(), ProcessState::Created);
        assert!(!p.page_directory.is_null());
        assert!(!p.kernel_stack.is_null());
        assert!(!p.user_stack.is_null());

        // Kernel identity stays supervisor; the user stack is ring-3
        // reachable with the PDE user bit propagated.
        let stack_va = VirtAddr::new(p.user_stack.as_u32());
        assert!(paging::page_is_user_accessible(p.page_directory, stack_va));
        assert!(!paging::page_is_user_accessible(
            p.page_directory,
            VirtAddr::new(0x0010_0000)
        ));
    }

    #[test]
    fn pids_are_unique_and_skip_zero() {
        let _fixture = KernelFixture::new();
        let mut seen = [false; MAX_PROCESSES];
        for _ in 0..10 {
            let p = process_create(0, false);
            assert!(!p.is_null());
            let pid = unsafe { (*p).pid } as usize;
            assert!(pid != 0 && pid < MAX_PROCESSES);
            assert!(!seen[pid], "duplicate pid {}", pid);
            seen[pid] = true;
        }
        assert_eq!(process_count(), 10);
    }

    #[test]
    fn pid_allocator_skips_live_collisions_after_wrap() {
        let _fixture = KernelFixture::new();
        let keeper = process_create(0, false);
        let keeper_pid = unsafe { (*keeper).pid };
        // Churn through enough create/exit cycles to wrap the rolling
        // counter past the live PID.
        for _ in 0..(2 * MAX_PROCESSES) {
            let p = process_create(0, false);
            assert!(!p.is_null());
            let pid = unsafe { (*p).pid };
            assert_ne!(pid, keeper_pid);
            assert_ne!(pid, 0);
            process_exit(p, 0);
        }
        assert_eq!(process_count(), 1);
    }

    #[test]
    fn create_then_exit_restores_frames_and_slots() {
        let _fixture = KernelFixture::new();
        let slots_before = process_count();
        let frames_before = page_alloc::allocated_pages();

        let p = process_create(0, true);
        assert!(!p.is_null());
        process_setup_initial_frame(p, 0x0040_0000);
        process_exit(p, 0);

        assert_eq!(process_count(), slots_before);
        assert_eq!(page_alloc::allocated_pages(), frames_before);
    }

    #[test]
    fn user_initial_frame_layout() {
        let _fixture = KernelFixture::new();
        let p = process_create(0, true);
        assert!(!p.is_null());
        let p = unsafe { &mut *p };
        let entry = 0x0040_0000;
        process_setup_initial_frame(p, entry);

        let top = p.kernel_stack_top();
        let word = |addr: u32| phys::read_u32(PhysAddr::new(addr));

        // iret record.
        assert_eq!(word(top - 4), USER_DATA_SELECTOR as u32);
        assert_eq!(word(top - 8), p.user_stack.as_u32() + USER_STACK_SIZE);
        assert_eq!(word(top - 12), EFLAGS_TASK_INITIAL);
        assert_eq!(word(top - 16), USER_CODE_SELECTOR as u32);
        assert_eq!(word(top - 20), entry);
        // Synthesised error pair.
        assert_eq!(word(top - 24), 0);
        assert_eq!(word(top - 28), 0);
        // Segments below the zeroed pusha block.
        assert_eq!(word(top - 64), USER_DATA_SELECTOR as u32); // ds
        assert_eq!(word(top - 76), USER_DATA_SELECTOR as u32); // gs
        // The switch "returns" into the trampoline.
        assert_eq!(word(top - 80), first_run_trampoline_addr());
        // Scheduler-saved slots, EFLAGS first.
        assert_eq!(word(top - 84), EFLAGS_TASK_INITIAL);
        assert_eq!(word(top - 100), 0); // edi

        assert_eq!(p.saved_sp, top - 100);
        assert!(p.saved_sp > p.kernel_stack.as_u32());
        assert_eq!(p.entry_point, entry);
    }

    #[test]
    fn kernel_initial_frame_is_bare() {
        let _fixture = KernelFixture::new();
        let p = process_create(0, false);
        assert!(!p.is_null());
        let p = unsafe { &mut *p };
        process_setup_initial_frame(p, 0x0030_0000);

        let top = p.kernel_stack_top();
        assert_eq!(phys::read_u32(PhysAddr::new(top - 4)), 0x0030_0000);
        assert_eq!(phys::read_u32(PhysAddr::new(top - 8)), EFLAGS_TASK_INITIAL);
        assert_eq!(p.saved_sp, top - 24);
    }

    #[test]
    fn exit_reparents_children_to_kernel() {
        let _fixture = KernelFixture::new();
        let parent = process_create(0, false);
        let parent_pid = unsafe { (*parent).pid };
        let child = process_create(parent_pid, false);
        process_exit(parent, 0);
        assert_eq!(unsafe { (*child).parent_pid }, KERNEL_PID);
        // The weak parent reference tolerates the vanished target.
        assert!(process_find(parent_pid).is_null());
    }
}
