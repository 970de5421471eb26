//! 8253/8254 programmable interval timer.
//!
//! Channel 0 runs in square-wave mode at a configured frequency (100 Hz by
//! default) and raises IRQ 0. `timer_tick_handler` — invoked by the IRQ
//! dispatch layer — is the sole producer of ticks: it advances the
//! counter and forwards to the handler the scheduler registered, keeping
//! this crate free of any upward dependency.

use core::sync::atomic::{AtomicPtr, AtomicU32, Ordering};

use catos_lib::ports::{PIT_CHANNEL0, PIT_COMMAND};

use crate::pic;

pub const PIT_BASE_FREQUENCY_HZ: u32 = 1_193_182;
pub const PIT_DEFAULT_FREQUENCY_HZ: u32 = 100;

// Command byte: channel 0, lobyte/hibyte access, square wave, binary.
const PIT_COMMAND_CHANNEL0: u8 = 0x00;
const PIT_COMMAND_ACCESS_LOHI: u8 = 0x30;
const PIT_COMMAND_MODE_SQUARE: u8 = 0x06;
const PIT_COMMAND_BINARY: u8 = 0x00;

static TIMER_TICKS: AtomicU32 = AtomicU32::new(0);
static TIMER_FREQUENCY: AtomicU32 = AtomicU32::new(PIT_DEFAULT_FREQUENCY_HZ);

/// Handler invoked on every tick, registered by the scheduler at init.
/// Null until then; early ticks are counted but not forwarded.
static TICK_HANDLER: AtomicPtr<()> = AtomicPtr::new(core::ptr::null_mut());

/// Program channel 0 and unmask IRQ 0.
pub fn timer_init(frequency_hz: u32) {
    timer_set_frequency(frequency_hz);
    pic::pic_unmask_irq(pic::IRQ_TIMER);
}

pub fn timer_set_frequency(frequency_hz: u32) {
    let hz = frequency_hz.max(19); // divisor must fit in 16 bits
    let divisor = PIT_BASE_FREQUENCY_HZ / hz;
    // SAFETY: documented PIT programming sequence.
    unsafe {
        PIT_COMMAND.write(
            PIT_COMMAND_CHANNEL0
                | PIT_COMMAND_ACCESS_LOHI
                | PIT_COMMAND_MODE_SQUARE
                | PIT_COMMAND_BINARY,
        );
        PIT_CHANNEL0.write((divisor & 0xFF) as u8);
        PIT_CHANNEL0.write((divisor >> 8) as u8);
    }
    TIMER_FREQUENCY.store(hz, Ordering::Relaxed);
}

/// Register the per-tick callback. One consumer (the scheduler); later
/// registrations replace earlier ones.
pub fn timer_set_tick_handler(handler: fn()) {
    TICK_HANDLER.store(handler as *mut (), Ordering::Release);
}

/// Advance the tick counter and forward to the registered handler.
/// Runs in interrupt context; must not block.
pub fn timer_tick_handler() {
    TIMER_TICKS.fetch_add(1, Ordering::Relaxed);
    let ptr = TICK_HANDLER.load(Ordering::Acquire);
    if !ptr.is_null() {
        // SAFETY: only `timer_set_tick_handler` stores here, and it stores
        // valid `fn()` pointers.
        let handler: fn() = unsafe { core::mem::transmute(ptr) };
        handler();
    }
}

pub fn timer_get_ticks() -> u32 {
    TIMER_TICKS.load(Ordering::Relaxed)
}

pub fn timer_get_frequency() -> u32 {
    TIMER_FREQUENCY.load(Ordering::Relaxed)
}

pub fn timer_get_ms() -> u32 {
    let freq = timer_get_frequency().max(1);
    (timer_get_ticks().wrapping_mul(1000)) / freq
}

/// Test fixtures only.
pub fn timer_reset_ticks() {
    TIMER_TICKS.store(0, Ordering::Relaxed);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn divisor_fits_sixteen_bits() {
        // The lowest accepted frequency must still produce a 16-bit divisor.
        assert!(PIT_BASE_FREQUENCY_HZ / 19 <= 0xFFFF);
        assert_eq!(PIT_BASE_FREQUENCY_HZ / PIT_DEFAULT_FREQUENCY_HZ, 11_931);
    }

    // Single test for the global tick state: the counter, handler
    // forwarding, and the ms conversion share statics.
    #[test]
    fn tick_counter_forwarding_and_conversion() {
        static FORWARDED: AtomicU32 = AtomicU32::new(0);
        fn on_tick() {
            FORWARDED.fetch_add(1, Ordering::Relaxed);
        }

        timer_reset_ticks();
        TIMER_FREQUENCY.store(100, Ordering::Relaxed);
        timer_set_tick_handler(on_tick);
        let before = FORWARDED.load(Ordering::Relaxed);
        for _ in 0..250 {
            timer_tick_handler();
        }
        assert_eq!(timer_get_ticks(), 250);
        assert_eq!(FORWARDED.load(Ordering::Relaxed), before + 250);
        assert_eq!(timer_get_ms(), 2500);
    }
}
