//! Round-robin scheduler.
//!
//! One ready queue, FIFO (priority is advisory in this revision: the
//! queue head is always picked). The queue is intrusive over PCB slot
//! indices. State machine:
//!
//! - `scheduler_add_process` — Created/Blocked task becomes Ready on the
//!   tail.
//! - `scheduler_yield` — a still-Running current rotates to the tail; the
//!   head becomes Running and gets the CPU via the two-phase context
//!   switch (CR3, TSS `esp0`, then the register dance in `switch`).
//! - `scheduler_block_current` — Running → Blocked, then yield; blocked
//!   tasks are on no queue.
//!
//! Preemption: the PIT tick handler calls [`scheduler_tick`] in interrupt
//! context, which only *requests* a reschedule on quantum expiry; the
//! trap layer honours the request after the EOI
//! ([`scheduler_handle_post_irq`]), when the interrupted task's full trap
//! frame is on its kernel stack, so resuming it later replays the `iret`
//! into the original ring.

pub mod switch;

use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use catos_abi::task::{ProcessState, NO_SLOT};
use catos_lib::{cpu, klog_info, IrqMutex};
use catos_mm::paging;

use crate::process::{pcb_by_slot, slot_of, Pcb};

/// Timer ticks per time slice.
pub const TIME_QUANTUM: u32 = 10;

struct SchedState {
    head: u8,
    tail: u8,
    current: u8,
    ready_count: u32,
    context_switches: u64,
    yields: u64,
}

impl SchedState {
    const fn new() -> Self {
        Self {
            head: NO_SLOT,
            tail: NO_SLOT,
            current: NO_SLOT,
            ready_count: 0,
            context_switches: 0,
            yields: 0,
        }
    }
}

static SCHED: IrqMutex<SchedState> = IrqMutex::new(SchedState::new());
static SCHEDULER_TICKS: AtomicU32 = AtomicU32::new(0);
static RESCHEDULE_PENDING: AtomicBool = AtomicBool::new(false);

/// Reset all scheduler state. Boot init and test fixtures.
pub fn scheduler_init() {
    *SCHED.lock() = SchedState::new();
    SCHEDULER_TICKS.store(0, Ordering::Release);
    RESCHEDULE_PENDING.store(false, Ordering::Release);
    klog_info!("SCHED: ready (quantum {} ticks)", TIME_QUANTUM);
}

fn enqueue_locked(state: &mut SchedState, slot: u8) {
    // SAFETY: slot indexes a live PCB; links are guarded by the SCHED lock.
    unsafe {
        let pcb = pcb_by_slot(slot);
        (*pcb).next_ready = NO_SLOT;
        (*pcb).prev_ready = state.tail;
        if state.tail != NO_SLOT {
            (*pcb_by_slot(state.tail)).next_ready = slot;
        } else {
            state.head = slot;
        }
        state.tail = slot;
    }
    state.ready_count += 1;
}

fn dequeue_locked(state: &mut SchedState) -> u8 {
    let slot = state.head;
    if slot == NO_SLOT {
        return NO_SLOT;
    }
    // SAFETY: head indexes a live queued PCB; guarded by the SCHED lock.
    unsafe {
        let pcb = pcb_by_slot(slot);
        state.head = (*pcb).next_ready;
        if state.head != NO_SLOT {
            (*pcb_by_slot(state.head)).prev_ready = NO_SLOT;
        } else {
            state.tail = NO_SLOT;
        }
        (*pcb).next_ready = NO_SLOT;
        (*pcb).prev_ready = NO_SLOT;
    }
    state.ready_count -= 1;
    slot
}

fn unlink_locked(state: &mut SchedState, slot: u8) {
    // SAFETY: guarded by the SCHED lock.
    unsafe {
        let pcb = pcb_by_slot(slot);
        let prev = (*pcb).prev_ready;
        let next = (*pcb).next_ready;
        let queued = prev != NO_SLOT || next != NO_SLOT || state.head == slot;
        if !queued {
            return;
        }
        if prev != NO_SLOT {
            (*pcb_by_slot(prev)).next_ready = next;
        } else {
            state.head = next;
        }
        if next != NO_SLOT {
            (*pcb_by_slot(next)).prev_ready = prev;
        } else {
            state.tail = prev;
        }
        (*pcb).next_ready = NO_SLOT;
        (*pcb).prev_ready = NO_SLOT;
        state.ready_count -= 1;
    }
}

/// Make `pcb` schedulable: transition to Ready and enqueue at the tail.
pub fn scheduler_add_process(pcb: *mut Pcb) {
    if pcb.is_null() {
        return;
    }
    // SAFETY: live PCB from the arena.
    let p = unsafe { &*pcb };
    if p.state() == ProcessState::Ready {
        return;
    }
    if !p.try_transition(ProcessState::Ready) {
        return;
    }
    let mut state = SCHED.lock();
    enqueue_locked(&mut state, slot_of(pcb));
}

/// Detach `pcb` from the scheduler: off the ready queue, and no longer
/// current. Does not switch; termination paths do that themselves.
pub fn scheduler_remove_process(pcb: *mut Pcb) {
    if pcb.is_null() {
        return;
    }
    let slot = slot_of(pcb);
    let mut state = SCHED.lock();
    unlink_locked(&mut state, slot);
    if state.current == slot {
        state.current = NO_SLOT;
    }
}

pub fn scheduler_get_current() -> *mut Pcb {
    let state = SCHED.lock();
    if state.current == NO_SLOT {
        core::ptr::null_mut()
    } else {
        pcb_by_slot(state.current)
    }
}

/// Cooperative rotation. A still-Running current goes to the tail; the
/// head gets the CPU. With an empty queue the current task simply keeps
/// running (even a Blocked one: its receive loop re-scans with
/// interrupts enabled, so an IRQ-driven send can still free it).
pub fn scheduler_yield() {
    let flags = cpu::save_flags_cli();

    let (prev, next) = {
        let mut state = SCHED.lock();
        if state.head == NO_SLOT {
            (core::ptr::null_mut(), core::ptr::null_mut())
        } else {
            let mut prev: *mut Pcb = core::ptr::null_mut();
            let cur_slot = state.current;
            if cur_slot != NO_SLOT {
                let cur = pcb_by_slot(cur_slot);
                // SAFETY: current PCB is live.
                unsafe {
                    if (*cur).state() == ProcessState::Running
                        && (*cur).try_transition(ProcessState::Ready)
                    {
                        enqueue_locked(&mut state, cur_slot);
                    }
                }
                prev = cur;
            }

            let next_slot = dequeue_locked(&mut state);
            let next = pcb_by_slot(next_slot);
            // SAFETY: dequeued PCB is live and Ready.
            unsafe {
                (*next).try_transition(ProcessState::Running);
            }
            state.current = next_slot;
            state.yields += 1;
            if prev != next {
                state.context_switches += 1;
            }
            (prev, next)
        }
    };

    if !next.is_null() && prev != next {
        switch_to(prev, next);
    }

    cpu::restore_flags(flags);
}

/// Phase 2 of the switch: load the incoming address space, point the TSS
/// at the incoming kernel stack, then the register dance.
fn switch_to(prev: *mut Pcb, next: *mut Pcb) {
    // SAFETY: `next` is the live PCB the scheduler just made Running;
    // `prev` (when non-null) still owns its kernel stack.
    unsafe {
        paging::set_current_directory((*next).page_directory);
        catos_hal::gdt::tss_set_esp0((*next).kernel_stack_top());

        let prev_sp_slot = if prev.is_null() {
            core::ptr::null_mut()
        } else {
            &mut (*prev).saved_sp as *mut u32
        };

        // Hosted stand-in for phase 1: the real switch stores esp here.
        #[cfg(not(target_arch = "x86"))]
        if !prev.is_null() {
            (*prev).saved_sp = (*prev).kernel_stack_top() - 20;
        }

        switch::context_switch(prev_sp_slot, (*next).saved_sp);
    }
}

/// Timer-driven accounting, in interrupt context: advance the tick
/// counter, charge the current task, and request preemption at quantum
/// expiry. Wait-free on the queue; the actual switch happens at trap
/// exit.
pub fn scheduler_tick() {
    let ticks = SCHEDULER_TICKS.fetch_add(1, Ordering::Relaxed) + 1;

    let current = scheduler_get_current();
    if current.is_null() {
        // Nothing running yet; try to start the first task.
        RESCHEDULE_PENDING.store(true, Ordering::Release);
        return;
    }
    // SAFETY: current PCB is live.
    unsafe { (*current).cpu_time += 1 };

    if ticks % TIME_QUANTUM == 0 {
        RESCHEDULE_PENDING.store(true, Ordering::Release);
    }
}

/// Honour a pending preemption request. Called by the trap layer after
/// the EOI, with the interrupted task's trap frame complete on its
/// kernel stack.
pub fn scheduler_handle_post_irq() {
    if RESCHEDULE_PENDING.swap(false, Ordering::AcqRel) {
        scheduler_yield();
    }
}

/// Block the current task and give up the CPU.
pub fn scheduler_block_current() {
    let current = scheduler_get_current();
    if current.is_null() {
        return;
    }
    // SAFETY: current PCB is live.
    if unsafe { (*current).try_transition(ProcessState::Blocked) } {
        scheduler_yield();
    }
}

/// Return a Blocked task to the ready tail.
pub fn scheduler_unblock_process(pcb: *mut Pcb) {
    if pcb.is_null() {
        return;
    }
    // SAFETY: live PCB.
    if unsafe { (*pcb).try_transition(ProcessState::Ready) } {
        let mut state = SCHED.lock();
        enqueue_locked(&mut state, slot_of(pcb));
    }
}

/// Leave a terminated context for good. The caller has already been
/// detached; on hardware this never returns — the switch abandons the
/// dead stack, idling in `hlt` until an IRQ readies someone. Hosted
/// builds return so tests can continue.
pub fn scheduler_exit_current() {
    #[cfg(target_arch = "x86")]
    loop {
        scheduler_yield();
        cpu::enable_interrupts();
        cpu::hlt();
    }
    #[cfg(not(target_arch = "x86"))]
    scheduler_yield();
}

pub fn scheduler_ticks() -> u32 {
    SCHEDULER_TICKS.load(Ordering::Relaxed)
}

pub fn scheduler_ready_count() -> u32 {
    SCHED.lock().ready_count
}

/// `(context_switches, yields)` counters.
pub fn scheduler_stats() -> (u64, u64) {
    let state = SCHED.lock();
    (state.context_switches, state.yields)
}

/// Whether `pcb` sits on the ready queue (invariant checks).
pub fn scheduler_is_queued(pcb: *const Pcb) -> bool {
    let slot = slot_of(pcb);
    let state = SCHED.lock();
    let mut cursor = state.head;
    while cursor != NO_SLOT {
        if cursor == slot {
            return true;
        }
        // SAFETY: queue links are consistent under the SCHED lock.
        cursor = unsafe { (*pcb_by_slot(cursor)).next_ready };
    }
    false
}
