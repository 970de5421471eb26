//! GDT and TSS.
//!
//! Six fixed descriptors: null, kernel code/data, user code/data, TSS.
//! The selector values are ABI — the trap stubs, the IDT gates, and the
//! initial user frames all hard-code them — so they are published here as
//! constants and never computed.
//!
//! The TSS is used for exactly one thing: `esp0`, the kernel stack the CPU
//! loads on a ring-3 → ring-0 transition. The scheduler points it at the
//! incoming task's kernel-stack top on every switch.

use core::cell::UnsafeCell;
use core::mem::size_of;

use catos_lib::IrqMutex;

pub const GDT_ENTRIES: usize = 6;

pub const KERNEL_CODE_SELECTOR: u16 = 0x08;
pub const KERNEL_DATA_SELECTOR: u16 = 0x10;
/// Ring-3 selectors carry RPL 3 in the low bits.
pub const USER_CODE_SELECTOR: u16 = 0x1B;
pub const USER_DATA_SELECTOR: u16 = 0x23;
pub const TSS_SELECTOR: u16 = 0x28;

#[repr(C, packed)]
#[derive(Clone, Copy, Default)]
pub struct GdtEntry {
    limit_low: u16,
    base_low: u16,
    base_middle: u8,
    access: u8,
    granularity: u8,
    base_high: u8,
}

const _: () = assert!(size_of::<GdtEntry>() == 8);

impl GdtEntry {
    const fn null() -> Self {
        Self {
            limit_low: 0,
            base_low: 0,
            base_middle: 0,
            access: 0,
            granularity: 0,
            base_high: 0,
        }
    }

    fn new(base: u32, limit: u32, access: u8, gran: u8) -> Self {
        Self {
            limit_low: (limit & 0xFFFF) as u16,
            base_low: (base & 0xFFFF) as u16,
            base_middle: ((base >> 16) & 0xFF) as u8,
            access,
            granularity: (((limit >> 16) & 0x0F) as u8) | (gran & 0xF0),
            base_high: ((base >> 24) & 0xFF) as u8,
        }
    }

    pub fn access(&self) -> u8 {
        self.access
    }

    pub fn base(&self) -> u32 {
        let e = *self;
        e.base_low as u32 | ((e.base_middle as u32) << 16) | ((e.base_high as u32) << 24)
    }
}

/// 32-bit Task State Segment. Only `ss0`/`esp0` and `iomap_base` matter;
/// the rest exists because the CPU defines the layout.
#[repr(C, packed)]
#[derive(Clone, Copy)]
pub struct Tss {
    prev_tss: u32,
    esp0: u32,
    ss0: u32,
    esp1: u32,
    ss1: u32,
    esp2: u32,
    ss2: u32,
    cr3: u32,
    eip: u32,
    eflags: u32,
    eax: u32,
    ecx: u32,
    edx: u32,
    ebx: u32,
    esp: u32,
    ebp: u32,
    esi: u32,
    edi: u32,
    es: u32,
    cs: u32,
    ss: u32,
    ds: u32,
    fs: u32,
    gs: u32,
    ldt: u32,
    trap: u16,
    iomap_base: u16,
}

const _: () = assert!(size_of::<Tss>() == 104);

impl Tss {
    const fn zeroed() -> Self {
        // SAFETY: Tss is plain integers; all-zero is a valid value.
        unsafe { core::mem::zeroed() }
    }
}

struct GdtTables {
    entries: UnsafeCell<[GdtEntry; GDT_ENTRIES]>,
    tss: UnsafeCell<Tss>,
}

// SAFETY: all access goes through GDT_LOCK.
unsafe impl Sync for GdtTables {}

static TABLES: GdtTables = GdtTables {
    entries: UnsafeCell::new([GdtEntry::null(); GDT_ENTRIES]),
    tss: UnsafeCell::new(Tss::zeroed()),
};

static GDT_LOCK: IrqMutex<()> = IrqMutex::new(());

#[cfg(target_arch = "x86")]
#[repr(C, packed)]
struct GdtPointer {
    limit: u16,
    base: u32,
}

/// Build the descriptors and (on x86) load GDTR, reload the segment
/// registers, and load the task register.
pub fn gdt_init() {
    let _guard = GDT_LOCK.lock();
    // SAFETY: guarded by GDT_LOCK.
    let entries = unsafe { &mut *TABLES.entries.get() };
    let tss = unsafe { &mut *TABLES.tss.get() };

    entries[0] = GdtEntry::null();
    entries[1] = GdtEntry::new(0, 0xFFFF_FFFF, 0x9A, 0xCF); // kernel code
    entries[2] = GdtEntry::new(0, 0xFFFF_FFFF, 0x92, 0xCF); // kernel data
    entries[3] = GdtEntry::new(0, 0xFFFF_FFFF, 0xFA, 0xCF); // user code
    entries[4] = GdtEntry::new(0, 0xFFFF_FFFF, 0xF2, 0xCF); // user data

    *tss = Tss::zeroed();
    tss.ss0 = KERNEL_DATA_SELECTOR as u32;
    tss.iomap_base = size_of::<Tss>() as u16;

    let tss_base = tss as *const Tss as usize as u32;
    let tss_limit = (size_of::<Tss>() - 1) as u32;
    entries[5] = GdtEntry::new(tss_base, tss_limit, 0x89, 0x00);

    #[cfg(target_arch = "x86")]
    unsafe {
        load(entries.as_ptr());
    }
}

#[cfg(target_arch = "x86")]
unsafe fn load(entries: *const GdtEntry) {
    use core::arch::asm;

    let pointer = GdtPointer {
        limit: (size_of::<GdtEntry>() * GDT_ENTRIES - 1) as u16,
        base: entries as u32,
    };
    unsafe {
        asm!("lgdt [{}]", in(reg) &pointer, options(readonly, nostack, preserves_flags));
        // Reload data segments, then far-jump to reload CS.
        asm!(
            "mov ds, {sel:x}",
            "mov es, {sel:x}",
            "mov fs, {sel:x}",
            "mov gs, {sel:x}",
            "mov ss, {sel:x}",
            sel = in(reg) KERNEL_DATA_SELECTOR as u32,
            options(nostack)
        );
        asm!(
            "push {code}",
            "lea {tmp}, [2f]",
            "push {tmp}",
            "retf",
            "2:",
            code = in(reg) KERNEL_CODE_SELECTOR as u32,
            tmp = out(reg) _,
        );
        asm!("ltr {sel:x}", sel = in(reg) TSS_SELECTOR as u32, options(nostack, preserves_flags));
    }
}

/// Point `esp0` at the next task's kernel-stack top. Called by the
/// scheduler on every switch to a user task.
pub fn tss_set_esp0(esp0: u32) {
    let _guard = GDT_LOCK.lock();
    // SAFETY: guarded by GDT_LOCK.
    unsafe { (*TABLES.tss.get()).esp0 = esp0 };
}

pub fn tss_esp0() -> u32 {
    let _guard = GDT_LOCK.lock();
    // SAFETY: guarded by GDT_LOCK.
    unsafe { (*TABLES.tss.get()).esp0 }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptor_packing() {
        let entry = GdtEntry::new(0x0012_3456, 0xFFFF_FFFF, 0x9A, 0xCF);
        assert_eq!(entry.base(), 0x0012_3456);
        assert_eq!(entry.access(), 0x9A);
    }

    #[test]
    fn selectors_carry_rpl() {
        assert_eq!(USER_CODE_SELECTOR & 3, 3);
        assert_eq!(USER_DATA_SELECTOR & 3, 3);
        assert_eq!(KERNEL_CODE_SELECTOR & 3, 0);
    }

    #[test]
    fn esp0_round_trip() {
        gdt_init();
        tss_set_esp0(0x0050_2000);
        assert_eq!(tss_esp0(), 0x0050_2000);
    }
}
