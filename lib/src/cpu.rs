//! CPU control primitives.
//!
//! The narrowest architectural surface the kernel needs: interrupt-flag
//! discipline, control registers, TLB flush, `hlt`, the cycle counter, and
//! the CPUID feature probe. On `target_arch = "x86"` these are the real
//! instructions; elsewhere the interrupt flag and control registers are
//! modelled with atomics so kernel logic can run under a hosted test
//! harness. Code above this module must not contain inline assembly.

pub const EFLAGS_IF: u32 = 1 << 9;
/// EFLAGS value for a freshly created task: IF set, reserved bit 1 set.
pub const EFLAGS_TASK_INITIAL: u32 = 0x202;

pub const CR0_PE: u32 = 0x0000_0001;
pub const CR0_PG: u32 = 0x8000_0000;

// CPU feature bits reported by `probe_features`.
pub const CPU_FEAT_FPU: u32 = 0x01;
pub const CPU_FEAT_MMX: u32 = 0x02;
pub const CPU_FEAT_SSE: u32 = 0x04;
pub const CPU_FEAT_SSE2: u32 = 0x08;
pub const CPU_FEAT_APIC: u32 = 0x10;

#[cfg(target_arch = "x86")]
mod imp {
    use core::arch::asm;

    use super::{CPU_FEAT_APIC, CPU_FEAT_FPU, CPU_FEAT_MMX, CPU_FEAT_SSE, CPU_FEAT_SSE2, EFLAGS_IF};

    #[inline(always)]
    pub fn hlt() {
        unsafe { asm!("hlt", options(nomem, nostack, preserves_flags)) };
    }

    #[inline(always)]
    pub fn pause() {
        unsafe { asm!("pause", options(nomem, nostack, preserves_flags)) };
    }

    #[inline(always)]
    pub fn enable_interrupts() {
        unsafe { asm!("sti", options(nomem, nostack)) };
    }

    #[inline(always)]
    pub fn disable_interrupts() {
        unsafe { asm!("cli", options(nomem, nostack)) };
    }

    #[inline(always)]
    pub fn read_eflags() -> u32 {
        let flags: u32;
        unsafe { asm!("pushfd", "pop {}", out(reg) flags, options(nomem, preserves_flags)) };
        flags
    }

    /// Save EFLAGS and disable interrupts (irqsave pattern).
    #[inline(always)]
    pub fn save_flags_cli() -> u32 {
        let flags: u32;
        unsafe { asm!("pushfd", "pop {}", "cli", out(reg) flags, options(nomem)) };
        flags
    }

    /// Re-enable interrupts only if they were enabled in `flags`.
    #[inline(always)]
    pub fn restore_flags(flags: u32) {
        if flags & EFLAGS_IF != 0 {
            enable_interrupts();
        }
    }

    #[inline(always)]
    pub fn read_cr0() -> u32 {
        let value: u32;
        unsafe { asm!("mov {}, cr0", out(reg) value, options(nomem, nostack, preserves_flags)) };
        value
    }

    #[inline(always)]
    pub fn write_cr0(value: u32) {
        unsafe { asm!("mov cr0, {}", in(reg) value, options(nostack, preserves_flags)) };
    }

    #[inline(always)]
    pub fn read_cr2() -> u32 {
        let value: u32;
        unsafe { asm!("mov {}, cr2", out(reg) value, options(nomem, nostack, preserves_flags)) };
        value
    }

    #[inline(always)]
    pub fn read_cr3() -> u32 {
        let value: u32;
        unsafe { asm!("mov {}, cr3", out(reg) value, options(nomem, nostack, preserves_flags)) };
        value
    }

    #[inline(always)]
    pub fn write_cr3(value: u32) {
        unsafe { asm!("mov cr3, {}", in(reg) value, options(nostack, preserves_flags)) };
    }

    /// Full TLB flush by reloading CR3.
    #[inline(always)]
    pub fn flush_tlb() {
        unsafe {
            asm!(
                "mov {tmp}, cr3",
                "mov cr3, {tmp}",
                tmp = out(reg) _,
                options(nostack, preserves_flags)
            )
        };
    }

    #[inline(always)]
    pub fn rdtsc() -> u64 {
        let low: u32;
        let high: u32;
        unsafe { asm!("rdtsc", out("eax") low, out("edx") high, options(nomem, nostack)) };
        ((high as u64) << 32) | low as u64
    }

    /// CPUID feature probe: toggle EFLAGS.ID, then leaf 1 EDX bits.
    /// `ebx` is saved around `cpuid` because LLVM reserves it.
    pub fn probe_features() -> u32 {
        let supported: u32;
        unsafe {
            asm!(
                "pushfd",
                "pop eax",
                "mov ecx, eax",
                "xor eax, 0x200000",
                "push eax",
                "popfd",
                "pushfd",
                "pop eax",
                "xor eax, ecx",
                out("eax") supported,
                out("ecx") _,
                options(nomem)
            );
        }
        if supported & 0x0020_0000 == 0 {
            return 0;
        }

        let edx: u32;
        unsafe {
            asm!(
                "mov {saved_ebx}, ebx",
                "cpuid",
                "mov ebx, {saved_ebx}",
                saved_ebx = out(reg) _,
                inout("eax") 1u32 => _,
                out("ecx") _,
                out("edx") edx,
                options(nomem, nostack)
            );
        }

        let mut features = 0;
        if edx & (1 << 0) != 0 {
            features |= CPU_FEAT_FPU;
        }
        if edx & (1 << 23) != 0 {
            features |= CPU_FEAT_MMX;
        }
        if edx & (1 << 25) != 0 {
            features |= CPU_FEAT_SSE;
        }
        if edx & (1 << 26) != 0 {
            features |= CPU_FEAT_SSE2;
        }
        if edx & (1 << 9) != 0 {
            features |= CPU_FEAT_APIC;
        }
        features
    }

    pub fn halt_loop() -> ! {
        loop {
            hlt();
        }
    }
}

#[cfg(not(target_arch = "x86"))]
mod imp {
    //! Hosted stand-in: interrupt flag and control registers are recorded
    //! state so scheduler/paging logic can be exercised without a CPU.

    use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

    use super::{CPU_FEAT_FPU, EFLAGS_IF};

    static SIM_IF: AtomicBool = AtomicBool::new(true);
    static SIM_CR0: AtomicU32 = AtomicU32::new(super::CR0_PE);
    static SIM_CR2: AtomicU32 = AtomicU32::new(0);
    static SIM_CR3: AtomicU32 = AtomicU32::new(0);
    static SIM_TSC: AtomicU64 = AtomicU64::new(0);

    #[inline]
    pub fn hlt() {}

    #[inline]
    pub fn pause() {
        core::hint::spin_loop();
    }

    #[inline]
    pub fn enable_interrupts() {
        SIM_IF.store(true, Ordering::SeqCst);
    }

    #[inline]
    pub fn disable_interrupts() {
        SIM_IF.store(false, Ordering::SeqCst);
    }

    #[inline]
    pub fn read_eflags() -> u32 {
        if SIM_IF.load(Ordering::SeqCst) {
            super::EFLAGS_TASK_INITIAL
        } else {
            0x002
        }
    }

    #[inline]
    pub fn save_flags_cli() -> u32 {
        let was_enabled = SIM_IF.swap(false, Ordering::SeqCst);
        if was_enabled {
            EFLAGS_IF
        } else {
            0
        }
    }

    #[inline]
    pub fn restore_flags(flags: u32) {
        if flags & EFLAGS_IF != 0 {
            SIM_IF.store(true, Ordering::SeqCst);
        }
    }

    #[inline]
    pub fn read_cr0() -> u32 {
        SIM_CR0.load(Ordering::SeqCst)
    }

    #[inline]
    pub fn write_cr0(value: u32) {
        SIM_CR0.store(value, Ordering::SeqCst);
    }

    #[inline]
    pub fn read_cr2() -> u32 {
        SIM_CR2.load(Ordering::SeqCst)
    }

    /// Test hook: plant a faulting address for #PF dispatch tests.
    pub fn sim_set_cr2(value: u32) {
        SIM_CR2.store(value, Ordering::SeqCst);
    }

    #[inline]
    pub fn read_cr3() -> u32 {
        SIM_CR3.load(Ordering::SeqCst)
    }

    #[inline]
    pub fn write_cr3(value: u32) {
        SIM_CR3.store(value, Ordering::SeqCst);
    }

    #[inline]
    pub fn flush_tlb() {}

    #[inline]
    pub fn rdtsc() -> u64 {
        SIM_TSC.fetch_add(1, Ordering::Relaxed)
    }

    pub fn probe_features() -> u32 {
        CPU_FEAT_FPU
    }

    pub fn halt_loop() -> ! {
        panic!("cpu halted");
    }
}

pub use imp::*;

#[inline]
pub fn interrupts_enabled() -> bool {
    read_eflags() & EFLAGS_IF != 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn irqsave_restores_prior_state() {
        let _guard = crate::test_support::lock();
        enable_interrupts();
        let flags = save_flags_cli();
        assert!(flags & EFLAGS_IF != 0);
        assert!(!interrupts_enabled());

        // Nested section: already disabled, so the inner restore must not
        // re-enable.
        let inner = save_flags_cli();
        assert_eq!(inner & EFLAGS_IF, 0);
        restore_flags(inner);
        assert!(!interrupts_enabled());

        restore_flags(flags);
        assert!(interrupts_enabled());
    }

    #[test]
    fn cr3_round_trip() {
        write_cr3(0x1000);
        assert_eq!(read_cr3(), 0x1000);
        write_cr3(0x2000);
        assert_eq!(read_cr3(), 0x2000);
    }
}
