//! Context-switch primitives — the only assembly in the scheduler.
//!
//! `context_switch(prev_sp_slot, next_sp)` is the two-phase switch:
//! phase 1 pushes EFLAGS and the callee-saved registers on the outgoing
//! kernel stack and stores `esp` through `prev_sp_slot`; phase 2 adopts
//! `next_sp`, pops the same five slots, and `ret`s. A null `prev_sp_slot`
//! skips phase 1 (first schedule, or a context being abandoned).
//!
//! For a task that has never run, that final `ret` lands in
//! `first_run_trampoline` (user tasks: pops the synthetic trap frame and
//! `iret`s into ring 3) or directly at the entry point (kernel tasks) —
//! see `process_setup_initial_frame`.
//!
//! Hosted builds keep the same call shape but only record the hand-off:
//! scheduler bookkeeping is exercised by tests, the register dance is not.

#[cfg(target_arch = "x86")]
core::arch::global_asm!(
    r#"
.global context_switch
context_switch:
    mov eax, [esp + 4]
    mov edx, [esp + 8]
    test eax, eax
    jz 2f
    pushfd
    push ebp
    push ebx
    push esi
    push edi
    mov [eax], esp
2:
    mov esp, edx
    pop edi
    pop esi
    pop ebx
    pop ebp
    popfd
    ret

.global first_run_trampoline
first_run_trampoline:
    pop gs
    pop fs
    pop es
    pop ds
    popad
    add esp, 8
    iretd
"#
);

#[cfg(target_arch = "x86")]
extern "C" {
    pub fn context_switch(prev_sp_slot: *mut u32, next_sp: u32);
    fn first_run_trampoline();
}

#[cfg(target_arch = "x86")]
pub fn first_run_trampoline_addr() -> u32 {
    first_run_trampoline as usize as u32
}

#[cfg(not(target_arch = "x86"))]
mod hosted {
    use core::sync::atomic::{AtomicU32, Ordering};

    static LAST_SWITCH_SP: AtomicU32 = AtomicU32::new(0);

    /// Recorded hand-off; the caller has already done the bookkeeping
    /// (including simulating the phase-1 `saved_sp` capture).
    ///
    /// # Safety
    /// Mirrors the signature of the real switch; nothing unsafe happens
    /// in the stand-in.
    pub unsafe fn context_switch(_prev_sp_slot: *mut u32, next_sp: u32) {
        LAST_SWITCH_SP.store(next_sp, Ordering::SeqCst);
    }

    /// Sentinel well outside tracked RAM; only ever stored into initial
    /// frames, never executed.
    pub fn first_run_trampoline_addr() -> u32 {
        0xFFF0_0000
    }

    /// Test observability: the `next_sp` of the latest hand-off.
    pub fn last_switch_sp() -> u32 {
        LAST_SWITCH_SP.load(Ordering::SeqCst)
    }
}

#[cfg(not(target_arch = "x86"))]
pub use hosted::*;
