//! IRQ dispatch table.
//!
//! The trap layer funnels vectors 32–47 here; handlers registered per
//! line run in interrupt context and must not block. Two lines are wired
//! at boot: the timer (feeding the PIT tick path) and the keyboard
//! (scancode → `MSG_DRIVER` message to the keyboard driver task).

use catos_abi::ipc::{Message, MSG_DRIVER};
use catos_abi::task::KEYBOARD_DRIVER_PID;
use catos_hal::pic::{self, IRQ_KEYBOARD, IRQ_LINES, IRQ_TIMER};
use catos_lib::ports::PS2_DATA;
use catos_lib::{klog_warn, IrqMutex, TrapFrame};

use crate::ipc;

pub type IrqHandler = fn(irq: u8, frame: &mut TrapFrame);

#[derive(Clone, Copy)]
struct IrqEntry {
    handler: Option<IrqHandler>,
    count: u64,
    reported_unhandled: bool,
}

impl IrqEntry {
    const fn vacant() -> Self {
        Self {
            handler: None,
            count: 0,
            reported_unhandled: false,
        }
    }
}

static IRQ_TABLE: IrqMutex<[IrqEntry; IRQ_LINES]> = IrqMutex::new([IrqEntry::vacant(); IRQ_LINES]);

/// Install the boot handlers and unmask their lines.
pub fn irq_init() {
    {
        let mut table = IRQ_TABLE.lock();
        for entry in table.iter_mut() {
            *entry = IrqEntry::vacant();
        }
        table[IRQ_TIMER as usize].handler = Some(timer_irq_handler);
        table[IRQ_KEYBOARD as usize].handler = Some(keyboard_irq_handler);
    }
    pic::pic_unmask_irq(IRQ_KEYBOARD);
    // The timer line is unmasked by `pit::timer_init`.
}

pub fn register_irq_handler(irq: u8, handler: IrqHandler) -> bool {
    if irq as usize >= IRQ_LINES {
        return false;
    }
    let mut table = IRQ_TABLE.lock();
    table[irq as usize].handler = Some(handler);
    table[irq as usize].reported_unhandled = false;
    pic::pic_unmask_irq(irq);
    true
}

/// Dispatch one IRQ. The handler is copied out of the table before the
/// call so a handler that reschedules never runs under the table lock.
pub fn handle_irq(irq: u8, frame: &mut TrapFrame) {
    if irq as usize >= IRQ_LINES {
        return;
    }
    let handler = {
        let mut table = IRQ_TABLE.lock();
        let entry = &mut table[irq as usize];
        entry.count += 1;
        match entry.handler {
            Some(handler) => Some(handler),
            None => {
                if !entry.reported_unhandled {
                    entry.reported_unhandled = true;
                    None
                } else {
                    return;
                }
            }
        }
    };

    match handler {
        Some(handler) => handler(irq, frame),
        None => klog_warn!("IRQ: no handler for line {}", irq),
    }
}

pub fn irq_count(irq: u8) -> u64 {
    if irq as usize >= IRQ_LINES {
        return 0;
    }
    IRQ_TABLE.lock()[irq as usize].count
}

/// Timer line: the PIT module owns the tick counter and forwards to the
/// scheduler's registered handler.
fn timer_irq_handler(_irq: u8, _frame: &mut TrapFrame) {
    catos_hal::pit::timer_tick_handler();
}

/// Keyboard line: drain the scancode and route it at the keyboard driver
/// task as a driver message. No driver task, no delivery — the scancode
/// is dropped, which is all a microkernel can do for an absent server.
fn keyboard_irq_handler(_irq: u8, _frame: &mut TrapFrame) {
    // SAFETY: PS/2 data port read in interrupt context.
    let scancode = unsafe { PS2_DATA.read() };

    let mut msg = Message::empty();
    msg.header.msg_type = MSG_DRIVER;
    msg.header.data_size = 1;
    msg.data[0] = scancode;
    let _ = ipc::ipc_send_kernel(KEYBOARD_DRIVER_PID, &msg);
}
