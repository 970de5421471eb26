//! Low-level interrupt stubs.
//!
//! One stub per installed vector, all converging on `trap_common`, which
//! lays down the uniform [`catos_lib::TrapFrame`]:
//!
//! - vectors where the CPU pushes no error code push a synthesised 0,
//!   then the vector number;
//! - vectors with a CPU error code (8, 10–14, 17) push only the vector
//!   number, landing on the same layout.
//!
//! `trap_common` then mirrors the C-visible frame: `pusha`, the four data
//! segments, kernel segment reload, and a call to `trap_dispatch` with
//! `esp` as the frame pointer. The unwind path restores everything the
//! entry saved, drops the `(int_no, err_code)` pair, and `iretd`s.
//!
//! Layout contract with `TrapFrame` (offsets asserted there): gs at +0,
//! pusha block at +16, int_no at +48, eip at +56.
//!
//! Hosted builds get synthetic stub addresses — the IDT is built but
//! never loaded, and dispatch is driven directly by tests.

#[cfg(target_arch = "x86")]
core::arch::global_asm!(
    r#"
.macro ISR_NOERR vec
.global isr_\vec
isr_\vec:
    push 0
    push \vec
    jmp trap_common
.endm

.macro ISR_ERR vec
.global isr_\vec
isr_\vec:
    push \vec
    jmp trap_common
.endm

ISR_NOERR 0
ISR_NOERR 1
ISR_NOERR 2
ISR_NOERR 3
ISR_NOERR 4
ISR_NOERR 5
ISR_NOERR 6
ISR_NOERR 7
ISR_ERR   8
ISR_ERR   10
ISR_ERR   11
ISR_ERR   12
ISR_ERR   13
ISR_ERR   14
ISR_NOERR 16
ISR_ERR   17
ISR_NOERR 18
ISR_NOERR 19
ISR_NOERR 32
ISR_NOERR 33
ISR_NOERR 128

trap_common:
    pusha
    push ds
    push es
    push fs
    push gs
    mov ax, 0x10
    mov ds, ax
    mov es, ax
    mov fs, ax
    mov gs, ax
    push esp
    call trap_dispatch
    add esp, 4
    pop gs
    pop fs
    pop es
    pop ds
    popa
    add esp, 8
    iretd
"#
);

#[cfg(target_arch = "x86")]
extern "C" {
    fn isr_0();
    fn isr_1();
    fn isr_2();
    fn isr_3();
    fn isr_4();
    fn isr_5();
    fn isr_6();
    fn isr_7();
    fn isr_8();
    fn isr_10();
    fn isr_11();
    fn isr_12();
    fn isr_13();
    fn isr_14();
    fn isr_16();
    fn isr_17();
    fn isr_18();
    fn isr_19();
    fn isr_32();
    fn isr_33();
    fn isr_128();
}

/// Entry address for `vector`'s stub; 0 for vectors without one.
#[cfg(target_arch = "x86")]
pub fn stub_addr(vector: u8) -> u32 {
    let f: unsafe extern "C" fn() = match vector {
        0 => isr_0,
        1 => isr_1,
        2 => isr_2,
        3 => isr_3,
        4 => isr_4,
        5 => isr_5,
        6 => isr_6,
        7 => isr_7,
        8 => isr_8,
        10 => isr_10,
        11 => isr_11,
        12 => isr_12,
        13 => isr_13,
        14 => isr_14,
        16 => isr_16,
        17 => isr_17,
        18 => isr_18,
        19 => isr_19,
        32 => isr_32,
        33 => isr_33,
        128 => isr_128,
        _ => return 0,
    };
    f as usize as u32
}

/// Synthetic stub addresses for hosted builds: unique, inside the kernel
/// image range, never executed.
#[cfg(not(target_arch = "x86"))]
pub fn stub_addr(vector: u8) -> u32 {
    0x0010_0000 + (vector as u32) * 0x10
}
