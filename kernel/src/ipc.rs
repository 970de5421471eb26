//! Message-passing IPC.
//!
//! The sole inter-task communication primitive. Each PID owns one
//! mailbox: an ordered queue of kernel-owned messages, each living in its
//! own frame from the page allocator and linked by physical address.
//! Sends never block; a full mailbox drops its oldest message. Receives
//! are selective by sender and may block, which parks the caller in the
//! scheduler until a matching send readies it again.
//!
//! Trust boundary: `sender_pid`, `msg_id`, and `timestamp` are filled in
//! here from kernel-observed state; user-supplied values in those fields
//! are ignored.

use core::sync::atomic::{AtomicU32, Ordering};

use catos_abi::addr::PhysAddr;
use catos_abi::ipc::{
    Message, MessageHeader, MAILBOX_MAX_MESSAGES, MSG_MAX_DATA, MSG_SIGNAL, MSG_TYPE_HOOK_SLOTS,
};
use catos_abi::status::Status;
use catos_abi::task::{KERNEL_PID, MAX_PROCESSES};
use catos_lib::{klog_info, IrqMutex};
use catos_mm::page_alloc::{alloc_page, free_page};
use catos_mm::phys;

use crate::process::{self, Pcb};
use crate::sched;

/// Kernel-side message record, resident at the base of its own frame.
#[repr(C)]
struct FrameMessage {
    header: MessageHeader,
    data: [u8; MSG_MAX_DATA],
    /// Physical address of the next queued message; 0 terminates.
    next: u32,
}

const _: () = assert!(core::mem::size_of::<FrameMessage>() <= catos_abi::addr::PAGE_SIZE as usize);

/// # Safety
/// `pa` must be a frame owned by this module (allocated in `ipc_send_from`).
#[inline]
unsafe fn frame_message(pa: PhysAddr) -> *mut FrameMessage {
    unsafe { phys::phys_as_mut::<FrameMessage>(pa) }
}

#[derive(Clone, Copy)]
struct Mailbox {
    head: u32,
    tail: u32,
    count: u32,
}

impl Mailbox {
    const fn empty() -> Self {
        Self {
            head: 0,
            tail: 0,
            count: 0,
        }
    }
}

static MAILBOXES: IrqMutex<[Mailbox; MAX_PROCESSES]> =
    IrqMutex::new([Mailbox::empty(); MAX_PROCESSES]);
static NEXT_MSG_ID: AtomicU32 = AtomicU32::new(1);

/// Kernel-side hooks keyed by message type, invoked on every enqueue of
/// that type. Registered by kernel components only.
pub type MessageHook = fn(&MessageHeader, &[u8]);

static HOOKS: IrqMutex<[Option<MessageHook>; MSG_TYPE_HOOK_SLOTS]> =
    IrqMutex::new([None; MSG_TYPE_HOOK_SLOTS]);

/// Reset all IPC state. Boot init and test fixtures (queued frames are
/// reclaimed by the allocator reset that precedes this in both paths).
pub fn ipc_init() {
    let mut mailboxes = MAILBOXES.lock();
    for mailbox in mailboxes.iter_mut() {
        *mailbox = Mailbox::empty();
    }
    drop(mailboxes);
    NEXT_MSG_ID.store(1, Ordering::Release);
    let mut hooks = HOOKS.lock();
    for hook in hooks.iter_mut() {
        *hook = None;
    }
    drop(hooks);
    klog_info!("IPC: mailboxes ready ({} queues)", MAX_PROCESSES);
}

fn dequeue_head_locked(mailbox: &mut Mailbox) -> Option<PhysAddr> {
    if mailbox.head == 0 {
        return None;
    }
    let pa = PhysAddr::new(mailbox.head);
    // SAFETY: queued frames are owned by this module.
    unsafe {
        mailbox.head = (*frame_message(pa)).next;
        (*frame_message(pa)).next = 0;
    }
    if mailbox.head == 0 {
        mailbox.tail = 0;
    }
    mailbox.count -= 1;
    Some(pa)
}

/// Append at the tail, dropping the oldest message when the queue is at
/// capacity.
fn enqueue(pid: u32, pa: PhysAddr) {
    let mut mailboxes = MAILBOXES.lock();
    let mailbox = &mut mailboxes[pid as usize];

    if mailbox.count >= MAILBOX_MAX_MESSAGES {
        if let Some(oldest) = dequeue_head_locked(mailbox) {
            free_page(oldest);
        }
    }

    // SAFETY: `pa` is the freshly built frame owned by the caller.
    unsafe {
        (*frame_message(pa)).next = 0;
        if mailbox.tail != 0 {
            (*frame_message(PhysAddr::new(mailbox.tail))).next = pa.as_u32();
        } else {
            mailbox.head = pa.as_u32();
        }
    }
    mailbox.tail = pa.as_u32();
    mailbox.count += 1;
}

/// Detach the first message matching `from_pid` (0 = any sender).
fn detach_matching(pid: u32, from_pid: u32) -> Option<PhysAddr> {
    let mut mailboxes = MAILBOXES.lock();
    let mailbox = &mut mailboxes[pid as usize];

    let mut prev = 0u32;
    let mut cursor = mailbox.head;
    while cursor != 0 {
        let pa = PhysAddr::new(cursor);
        // SAFETY: queued frames are owned by this module.
        let (sender, next) = unsafe {
            let msg = frame_message(pa);
            ((*msg).header.sender_pid, (*msg).next)
        };
        if from_pid == 0 || sender == from_pid {
            // SAFETY: unlink under the mailbox lock.
            unsafe {
                if prev != 0 {
                    (*frame_message(PhysAddr::new(prev))).next = next;
                } else {
                    mailbox.head = next;
                }
                if mailbox.tail == cursor {
                    mailbox.tail = prev;
                }
                (*frame_message(pa)).next = 0;
            }
            mailbox.count -= 1;
            return Some(pa);
        }
        prev = cursor;
        cursor = next;
    }
    None
}

fn run_hooks(header: &MessageHeader, payload: &[u8]) {
    let hook = {
        let hooks = HOOKS.lock();
        let index = header.msg_type as usize;
        if index < MSG_TYPE_HOOK_SLOTS {
            hooks[index]
        } else {
            None
        }
    };
    if let Some(hook) = hook {
        hook(header, payload);
    }
}

/// Deposit `msg` in `receiver_pid`'s mailbox on behalf of `sender_pid`
/// (0 = the kernel itself), waking a receiver blocked on this sender or
/// on any sender.
pub fn ipc_send_from(sender_pid: u32, receiver_pid: u32, msg: &Message) -> Status {
    let receiver = process::process_find(receiver_pid);
    if receiver.is_null() {
        return Status::NotFound;
    }
    if msg.header.data_size as usize > MSG_MAX_DATA {
        return Status::InvalidParam;
    }

    let Some(frame) = alloc_page() else {
        return Status::OutOfMemory;
    };

    let header = MessageHeader {
        msg_id: NEXT_MSG_ID.fetch_add(1, Ordering::Relaxed),
        sender_pid,
        receiver_pid,
        msg_type: msg.header.msg_type,
        flags: msg.header.flags,
        timestamp: catos_hal::pit::timer_get_ticks(),
        data_size: msg.header.data_size,
        reserved: 0,
    };
    // SAFETY: freshly allocated frame, exclusively ours until enqueued.
    unsafe {
        let out = frame_message(frame);
        (*out).header = header;
        (&mut (*out).data)[..msg.header.data_size as usize]
            .copy_from_slice(&msg.data[..msg.header.data_size as usize]);
        (*out).next = 0;
    }

    enqueue(receiver_pid, frame);
    run_hooks(&header, msg.payload());

    // SAFETY: receiver PCB is live (looked up above; single-CPU kernel
    // context cannot lose it in between).
    unsafe {
        if (*receiver).state() == catos_abi::task::ProcessState::Blocked {
            let waiting_for = (*receiver).waiting_for;
            if waiting_for == 0 || waiting_for == sender_pid {
                (*receiver).waiting_for = 0;
                sched::scheduler_unblock_process(receiver);
            }
        }
    }

    Status::Ok
}

/// Receive into `out` the first message matching `from_pid` (0 = any).
/// With `block`, the caller parks until a matching send arrives and
/// re-scans on every wakeup. (Hosted builds bound the loop to one wakeup
/// so the single-threaded test harness stays finite.)
pub fn ipc_receive(receiver: *mut Pcb, from_pid: u32, out: &mut Message, block: bool) -> Status {
    if receiver.is_null() {
        return Status::PermissionDenied;
    }
    // SAFETY: live PCB of the calling task.
    let r = unsafe { &mut *receiver };

    #[cfg(not(target_arch = "x86"))]
    let mut wakeups = 0u32;

    loop {
        if let Some(frame) = detach_matching(r.pid, from_pid) {
            // SAFETY: detached frame is exclusively ours.
            unsafe {
                let msg = frame_message(frame);
                out.header = (*msg).header;
                let len = ((*msg).header.data_size as usize).min(MSG_MAX_DATA);
                out.data[..len].copy_from_slice(&(&(*msg).data)[..len]);
            }
            free_page(frame);
            return Status::Ok;
        }

        if !block {
            return Status::NotFound;
        }

        r.waiting_for = from_pid;
        sched::scheduler_block_current();
        r.waiting_for = 0;

        #[cfg(not(target_arch = "x86"))]
        {
            wakeups += 1;
            if wakeups >= 2 {
                return Status::NotFound;
            }
        }
    }
}

/// Deliver a copy of `msg` to every live process except the sender.
/// `Ok` if at least one delivery succeeded.
pub fn ipc_broadcast(sender_pid: u32, msg: &Message) -> Status {
    let mut delivered = 0u32;
    for pid in 1..MAX_PROCESSES as u32 {
        if pid == sender_pid {
            continue;
        }
        if process::process_find(pid).is_null() {
            continue;
        }
        if ipc_send_from(sender_pid, pid, msg).is_ok() {
            delivered += 1;
        }
    }
    if delivered > 0 {
        Status::Ok
    } else {
        Status::Error
    }
}

/// Drop and free every queued message for `pid`.
pub fn ipc_clear_queue(pid: u32) -> Status {
    if pid as usize >= MAX_PROCESSES {
        return Status::InvalidParam;
    }
    let mut mailboxes = MAILBOXES.lock();
    let mailbox = &mut mailboxes[pid as usize];
    while let Some(frame) = dequeue_head_locked(mailbox) {
        free_page(frame);
    }
    Status::Ok
}

/// `(queued, capacity)` for `pid`'s mailbox.
pub fn mailbox_stats(pid: u32) -> (u32, u32) {
    if pid as usize >= MAX_PROCESSES {
        return (0, 0);
    }
    let mailboxes = MAILBOXES.lock();
    (mailboxes[pid as usize].count, MAILBOX_MAX_MESSAGES)
}

/// Register a kernel-side hook for `msg_type`. Kernel components only;
/// the syscall surface gates this to the kernel identity.
pub fn ipc_register_handler(msg_type: u32, hook: MessageHook) -> Status {
    if msg_type as usize >= MSG_TYPE_HOOK_SLOTS {
        return Status::InvalidParam;
    }
    HOOKS.lock()[msg_type as usize] = Some(hook);
    Status::Ok
}

/// Signal-type message to `parent_pid` carrying the terminated PID.
pub fn send_exit_notification(parent_pid: u32, dying_pid: u32) {
    let mut msg = Message::empty();
    msg.header.msg_type = MSG_SIGNAL;
    msg.header.data_size = 4;
    msg.data[..4].copy_from_slice(&dying_pid.to_le_bytes());
    let _ = ipc_send_from(dying_pid, parent_pid, &msg);
}

/// Kernel-originated send (IRQ paths): sender is the kernel identity.
pub fn ipc_send_kernel(receiver_pid: u32, msg: &Message) -> Status {
    ipc_send_from(KERNEL_PID, receiver_pid, msg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::{process_create, process_exit};
    use crate::test_support::KernelFixture;
    use catos_abi::ipc::{MSG_DATA, MSG_RESPONSE};
    use catos_abi::task::ProcessState;
    use core::sync::atomic::AtomicU32 as TestCounter;

    fn data_message(bytes: &[u8]) -> Message {
        let mut msg = Message::empty();
        msg.header.msg_type = MSG_DATA;
        msg.header.data_size = bytes.len() as u32;
        msg.data[..bytes.len()].copy_from_slice(bytes);
        msg
    }

    fn spawn_pair() -> (*mut Pcb, u32, *mut Pcb, u32) {
        let a = process_create(0, true);
        let b = process_create(0, true);
        assert!(!a.is_null() && !b.is_null());
        // SAFETY: live PCBs.
        unsafe { (a, (*a).pid, b, (*b).pid) }
    }

    #[test]
    fn send_fills_kernel_fields_and_receive_round_trips() {
        let _fixture = KernelFixture::new();
        let (_a, a_pid, b, b_pid) = spawn_pair();

        let mut msg = data_message(&0xDEAD_BEEFu32.to_le_bytes());
        // Spoofed fields must be ignored.
        msg.header.sender_pid = 99;
        msg.header.msg_id = 4242;
        assert_eq!(ipc_send_from(a_pid, b_pid, &msg), Status::Ok);

        let mut out = Message::empty();
        assert_eq!(ipc_receive(b, 0, &mut out, false), Status::Ok);
        assert_eq!(out.header.sender_pid, a_pid);
        assert_eq!(out.header.receiver_pid, b_pid);
        assert_eq!(out.header.data_size, 4);
        assert_eq!(out.payload(), 0xDEAD_BEEFu32.to_le_bytes());
        assert_ne!(out.header.msg_id, 4242);

        // Mailbox drained; message frame returned.
        assert_eq!(mailbox_stats(b_pid).0, 0);
        assert_eq!(ipc_receive(b, 0, &mut out, false), Status::NotFound);
    }

    #[test]
    fn single_sender_fifo_order_and_monotonic_ids() {
        let _fixture = KernelFixture::new();
        let (_a, a_pid, b, b_pid) = spawn_pair();

        for value in 0u32..5 {
            let msg = data_message(&value.to_le_bytes());
            assert_eq!(ipc_send_from(a_pid, b_pid, &msg), Status::Ok);
        }

        let mut last_id = 0;
        for value in 0u32..5 {
            let mut out = Message::empty();
            assert_eq!(ipc_receive(b, a_pid, &mut out, false), Status::Ok);
            assert_eq!(out.payload(), value.to_le_bytes());
            assert!(out.header.msg_id > last_id);
            last_id = out.header.msg_id;
        }
    }

    #[test]
    fn receive_is_selective_by_sender() {
        let _fixture = KernelFixture::new();
        let (_a, a_pid, b, b_pid) = spawn_pair();
        let c = process_create(0, true);
        let c_pid = unsafe { (*c).pid };

        assert_eq!(
            ipc_send_from(c_pid, b_pid, &data_message(b"from-c")),
            Status::Ok
        );
        assert_eq!(
            ipc_send_from(a_pid, b_pid, &data_message(b"from-a")),
            Status::Ok
        );

        // Selecting a's message skips over c's, which stays queued.
        let mut out = Message::empty();
        assert_eq!(ipc_receive(b, a_pid, &mut out, false), Status::Ok);
        assert_eq!(out.payload(), b"from-a");
        assert_eq!(mailbox_stats(b_pid).0, 1);

        assert_eq!(ipc_receive(b, 0, &mut out, false), Status::Ok);
        assert_eq!(out.payload(), b"from-c");
    }

    #[test]
    fn overflow_drops_oldest() {
        let _fixture = KernelFixture::new();
        let (_a, a_pid, b, b_pid) = spawn_pair();

        for value in 1u32..=MAILBOX_MAX_MESSAGES + 1 {
            let msg = data_message(&value.to_le_bytes());
            assert_eq!(ipc_send_from(a_pid, b_pid, &msg), Status::Ok);
        }
        assert_eq!(mailbox_stats(b_pid).0, MAILBOX_MAX_MESSAGES);

        // Message #1 was dropped; the first receive yields #2.
        let mut out = Message::empty();
        assert_eq!(ipc_receive(b, 0, &mut out, false), Status::Ok);
        assert_eq!(out.payload(), 2u32.to_le_bytes());
    }

    #[test]
    fn send_to_missing_pid_and_oversized_payload_fail() {
        let _fixture = KernelFixture::new();
        let (_a, a_pid, _b, b_pid) = spawn_pair();

        assert_eq!(
            ipc_send_from(a_pid, 42, &data_message(b"x")),
            Status::NotFound
        );

        let mut oversized = data_message(b"y");
        oversized.header.data_size = (MSG_MAX_DATA + 1) as u32;
        assert_eq!(ipc_send_from(a_pid, b_pid, &oversized), Status::InvalidParam);
    }

    #[test]
    fn matching_send_unblocks_selective_receiver() {
        let _fixture = KernelFixture::new();
        let (a, a_pid, b, b_pid) = spawn_pair();
        sched::scheduler_add_process(a);
        sched::scheduler_add_process(b);
        sched::scheduler_yield(); // a running

        // Park b as if it had issued a blocking receive from a.
        sched::scheduler_yield(); // b running
        assert_eq!(sched::scheduler_get_current(), b);
        unsafe { (*b).waiting_for = a_pid };
        sched::scheduler_block_current();
        assert_eq!(unsafe { (*b).state() }, ProcessState::Blocked);

        // A send from an unrelated pid must not wake it.
        let c = process_create(0, true);
        let c_pid = unsafe { (*c).pid };
        assert_eq!(
            ipc_send_from(c_pid, b_pid, &data_message(b"noise")),
            Status::Ok
        );
        assert_eq!(unsafe { (*b).state() }, ProcessState::Blocked);

        // The awaited sender readies it and the queued message matches.
        assert_eq!(
            ipc_send_from(a_pid, b_pid, &data_message(b"ping")),
            Status::Ok
        );
        assert_eq!(unsafe { (*b).state() }, ProcessState::Ready);
        assert_eq!(unsafe { (*b).waiting_for }, 0);

        let mut out = Message::empty();
        assert_eq!(ipc_receive(b, a_pid, &mut out, false), Status::Ok);
        assert_eq!(out.payload(), b"ping");
    }

    #[test]
    fn broadcast_skips_sender() {
        let _fixture = KernelFixture::new();
        let (_a, a_pid, _b, b_pid) = spawn_pair();
        let c = process_create(0, true);
        let c_pid = unsafe { (*c).pid };

        assert_eq!(ipc_broadcast(a_pid, &data_message(b"all")), Status::Ok);
        assert_eq!(mailbox_stats(a_pid).0, 0);
        assert_eq!(mailbox_stats(b_pid).0, 1);
        assert_eq!(mailbox_stats(c_pid).0, 1);
    }

    #[test]
    fn exit_notification_reaches_parent() {
        let _fixture = KernelFixture::new();
        let parent = process_create(0, true);
        let parent_pid = unsafe { (*parent).pid };
        let child = process_create(parent_pid, true);
        let child_pid = unsafe { (*child).pid };

        process_exit(child, 13);

        let mut out = Message::empty();
        assert_eq!(ipc_receive(parent, child_pid, &mut out, false), Status::Ok);
        assert_eq!(out.header.msg_type, MSG_SIGNAL);
        assert_eq!(out.header.sender_pid, child_pid);
        assert_eq!(out.payload(), child_pid.to_le_bytes());
    }

    #[test]
    fn exit_clears_mailbox_and_frees_frames() {
        let _fixture = KernelFixture::new();
        let (_a, a_pid, b, b_pid) = spawn_pair();
        let frames_idle = catos_mm::page_alloc::allocated_pages();

        for _ in 0..5 {
            assert_eq!(
                ipc_send_from(a_pid, b_pid, &data_message(b"queued")),
                Status::Ok
            );
        }
        assert_eq!(mailbox_stats(b_pid).0, 5);
        process_exit(b, 0);
        assert_eq!(mailbox_stats(b_pid).0, 0);
        // 5 message frames reclaimed along with b's own resources.
        assert!(catos_mm::page_alloc::allocated_pages() < frames_idle);
    }

    #[test]
    fn hooks_fire_on_matching_type() {
        static SEEN: TestCounter = TestCounter::new(0);
        fn hook(header: &MessageHeader, payload: &[u8]) {
            assert_eq!(header.msg_type, MSG_RESPONSE);
            assert_eq!(payload, b"hooked");
            SEEN.fetch_add(1, Ordering::Relaxed);
        }

        let _fixture = KernelFixture::new();
        let (_a, a_pid, _b, b_pid) = spawn_pair();
        assert_eq!(ipc_register_handler(MSG_RESPONSE, hook), Status::Ok);
        assert_eq!(
            ipc_register_handler(MSG_TYPE_HOOK_SLOTS as u32, hook),
            Status::InvalidParam
        );

        let before = SEEN.load(Ordering::Relaxed);
        let mut msg = data_message(b"hooked");
        msg.header.msg_type = MSG_RESPONSE;
        assert_eq!(ipc_send_from(a_pid, b_pid, &msg), Status::Ok);
        assert_eq!(SEEN.load(Ordering::Relaxed), before + 1);
    }
}
