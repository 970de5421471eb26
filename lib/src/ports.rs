//! Well-known port assignments and low-level serial output.
//!
//! Security-significant devices (PIC, PIT) must be driven through
//! `catos_hal`; the constants live here so the HAL and the early-boot
//! logging fallback share one set of addresses.

use crate::io::Port;

pub const COM1: Port<u8> = Port::new(0x3F8);

pub const PIC_MASTER_CMD: Port<u8> = Port::new(0x20);
pub const PIC_MASTER_DATA: Port<u8> = Port::new(0x21);
pub const PIC_SLAVE_CMD: Port<u8> = Port::new(0xA0);
pub const PIC_SLAVE_DATA: Port<u8> = Port::new(0xA1);

pub const PIT_CHANNEL0: Port<u8> = Port::new(0x40);
pub const PIT_COMMAND: Port<u8> = Port::new(0x43);

pub const PS2_DATA: Port<u8> = Port::new(0x60);
pub const PS2_STATUS: Port<u8> = Port::new(0x64);

// 8250/16550 UART register offsets from the base port.
pub const UART_REG_THR: u16 = 0;
pub const UART_REG_LSR: u16 = 5;
pub const UART_LSR_TX_EMPTY: u8 = 0x20;

/// Write one byte to a UART, polling LSR until the transmit register
/// drains.
///
/// # Safety
/// Port I/O. `base` must be an initialised 8250-compatible UART and the
/// caller must serialise concurrent access.
#[inline]
pub unsafe fn serial_putc(base: Port<u8>, byte: u8) {
    let lsr = base.offset(UART_REG_LSR);
    let thr = base.offset(UART_REG_THR);
    unsafe {
        while (lsr.read() & UART_LSR_TX_EMPTY) == 0 {
            core::hint::spin_loop();
        }
        thr.write(byte);
    }
}

/// Write a byte slice to a UART, expanding lone `\n` to `\r\n`.
///
/// # Safety
/// Same requirements as [`serial_putc`].
pub unsafe fn serial_write_bytes(base: Port<u8>, bytes: &[u8]) {
    for &b in bytes {
        if b == b'\n' {
            unsafe { serial_putc(base, b'\r') };
        }
        unsafe { serial_putc(base, b) };
    }
}
