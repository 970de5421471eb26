//! Boot console: VGA text mode mirrored to COM1.
//!
//! The only output device the kernel owns. Regular logging goes through
//! `klog`, for which this module registers itself as the backend; the
//! panic path writes here directly so diagnostics survive a wedged klog
//! level. VGA memory is touched through the phys window, which keeps the
//! writer testable on hosted builds.

use core::fmt::{self, Write};

use catos_abi::addr::PhysAddr;
use catos_lib::klog::klog_register_backend;
use catos_lib::ports::{serial_write_bytes, COM1};
use catos_lib::IrqMutex;
use catos_mm::phys;
use spin::Once;

const VGA_BASE: PhysAddr = PhysAddr::new(0xB8000);
const VGA_WIDTH: usize = 80;
const VGA_HEIGHT: usize = 25;
/// Light grey on black.
const VGA_ATTR: u16 = 0x0700;
const VGA_BLANK: u16 = VGA_ATTR | b' ' as u16;

struct Console {
    position: usize,
}

impl Console {
    const fn new() -> Self {
        Self { position: 0 }
    }

    fn cell(&self, index: usize) -> *mut u16 {
        // SAFETY: index is kept below VGA_WIDTH * VGA_HEIGHT by all callers.
        unsafe { phys::phys_as_mut::<u16>(VGA_BASE.offset((index * 2) as u32)) }
    }

    fn put_cell(&self, index: usize, value: u16) {
        // SAFETY: in-bounds VGA cell; volatile because this is device memory.
        unsafe { core::ptr::write_volatile(self.cell(index), value) };
    }

    fn clear(&mut self) {
        for index in 0..VGA_WIDTH * VGA_HEIGHT {
            self.put_cell(index, VGA_BLANK);
        }
        self.position = 0;
    }

    fn scroll(&mut self) {
        for index in 0..VGA_WIDTH * (VGA_HEIGHT - 1) {
            // SAFETY: both cells in bounds.
            let below = unsafe { core::ptr::read_volatile(self.cell(index + VGA_WIDTH)) };
            self.put_cell(index, below);
        }
        for index in VGA_WIDTH * (VGA_HEIGHT - 1)..VGA_WIDTH * VGA_HEIGHT {
            self.put_cell(index, VGA_BLANK);
        }
        self.position -= VGA_WIDTH;
    }

    fn put_byte(&mut self, byte: u8) {
        match byte {
            b'\n' => {
                self.position = (self.position / VGA_WIDTH + 1) * VGA_WIDTH;
            }
            b'\r' => {
                self.position = (self.position / VGA_WIDTH) * VGA_WIDTH;
            }
            _ => {
                self.put_cell(self.position, VGA_ATTR | byte as u16);
                self.position += 1;
            }
        }
        if self.position >= VGA_WIDTH * VGA_HEIGHT {
            self.scroll();
        }
    }
}

impl Write for Console {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        // SAFETY: COM1 output; serialised by the CONSOLE lock.
        unsafe { serial_write_bytes(COM1, s.as_bytes()) };
        for &byte in s.as_bytes() {
            self.put_byte(byte);
        }
        Ok(())
    }
}

static CONSOLE: IrqMutex<Console> = IrqMutex::new(Console::new());

/// klog backend: one line per call, trailing newline appended here.
fn console_backend(args: fmt::Arguments<'_>) {
    let mut console = CONSOLE.lock();
    let _ = console.write_fmt(args);
    let _ = console.write_str("\n");
}

static CONSOLE_READY: Once<()> = Once::new();

/// Clear the screen and take over klog output. One-shot; later calls
/// (fixture re-inits) keep the established backend.
pub fn console_init() {
    CONSOLE_READY.call_once(|| {
        CONSOLE.lock().clear();
        klog_register_backend(console_backend);
    });
}

/// Panic diagnostics, bypassing klog entirely.
pub fn panic_print(args: fmt::Arguments<'_>) {
    let mut console = CONSOLE.lock();
    let _ = console.write_str("\nKERNEL PANIC: ");
    let _ = console.write_fmt(args);
    let _ = console.write_str("\n");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read_cell(index: usize) -> u16 {
        // SAFETY: in-bounds VGA cell in the hosted RAM image.
        unsafe { core::ptr::read_volatile(phys::phys_as_mut::<u16>(VGA_BASE.offset((index * 2) as u32))) }
    }

    #[test]
    fn writes_land_in_vga_memory() {
        let _guard = crate::test_support::kernel_lock();
        {
            let mut console = CONSOLE.lock();
            console.clear();
            let _ = console.write_str("ok");
        }
        assert_eq!(read_cell(0), VGA_ATTR | b'o' as u16);
        assert_eq!(read_cell(1), VGA_ATTR | b'k' as u16);
        assert_eq!(read_cell(2), VGA_BLANK);
    }

    #[test]
    fn newline_and_scroll() {
        let _guard = crate::test_support::kernel_lock();
        {
            let mut console = CONSOLE.lock();
            console.clear();
            for _ in 0..VGA_HEIGHT {
                let _ = console.write_str("line\n");
            }
            // One full screen written: the next line forced a scroll.
            assert_eq!(console.position / VGA_WIDTH, VGA_HEIGHT - 1);
        }
        assert_eq!(read_cell(0), VGA_ATTR | b'l' as u16);
    }
}
