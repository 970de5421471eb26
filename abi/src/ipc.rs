//! IPC message wire format.
//!
//! The on-wire contract is a 32-byte little-endian header followed by a
//! 256-byte payload area. The header layout is frozen; assembly-free code
//! on both sides of the boundary relies on the `#[repr(C)]` field order,
//! and the compile-time asserts below pin every offset.
//!
//! `msg_id`, `sender_pid`, and `timestamp` are kernel-filled on send —
//! whatever userland writes there is ignored.

use core::mem::{offset_of, size_of};

/// Maximum payload bytes per message.
pub const MSG_MAX_DATA: usize = 256;
/// Maximum queued messages per mailbox; the oldest is dropped beyond this.
pub const MAILBOX_MAX_MESSAGES: u32 = 100;

// Reserved msg_type values.
pub const MSG_DATA: u32 = 0x01;
pub const MSG_CONTROL: u32 = 0x02;
/// Used by the kernel for exit notifications (payload = terminated PID).
pub const MSG_SIGNAL: u32 = 0x03;
pub const MSG_RESPONSE: u32 = 0x04;
pub const MSG_DRIVER: u32 = 0x05;

/// Number of registrable kernel-side message-type hooks.
pub const MSG_TYPE_HOOK_SLOTS: usize = 32;

// Driver message sub-codes (first payload word of MSG_DRIVER messages).
pub const DRIVER_MSG_READ: u32 = 0x01;
pub const DRIVER_MSG_WRITE: u32 = 0x02;
pub const DRIVER_MSG_IOCTL: u32 = 0x03;

/// Fixed 32-byte message header.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MessageHeader {
    /// Kernel-assigned, monotonically increasing.
    pub msg_id: u32,
    /// Kernel-observed sender at send time.
    pub sender_pid: u32,
    pub receiver_pid: u32,
    /// User-defined type; `MSG_*` values are reserved.
    pub msg_type: u32,
    pub flags: u32,
    /// Kernel-filled, tick-based.
    pub timestamp: u32,
    /// Valid payload bytes, `<= MSG_MAX_DATA`.
    pub data_size: u32,
    /// Must be zero.
    pub reserved: u32,
}

pub const MESSAGE_HEADER_SIZE: usize = 32;

const _: () = assert!(size_of::<MessageHeader>() == MESSAGE_HEADER_SIZE);
const _: () = {
    assert!(offset_of!(MessageHeader, msg_id) == 0);
    assert!(offset_of!(MessageHeader, sender_pid) == 4);
    assert!(offset_of!(MessageHeader, receiver_pid) == 8);
    assert!(offset_of!(MessageHeader, msg_type) == 12);
    assert!(offset_of!(MessageHeader, flags) == 16);
    assert!(offset_of!(MessageHeader, timestamp) == 20);
    assert!(offset_of!(MessageHeader, data_size) == 24);
    assert!(offset_of!(MessageHeader, reserved) == 28);
};

impl MessageHeader {
    /// Serialise to the little-endian wire layout.
    pub fn encode(&self) -> [u8; MESSAGE_HEADER_SIZE] {
        let mut out = [0u8; MESSAGE_HEADER_SIZE];
        let words = [
            self.msg_id,
            self.sender_pid,
            self.receiver_pid,
            self.msg_type,
            self.flags,
            self.timestamp,
            self.data_size,
            self.reserved,
        ];
        for (i, word) in words.iter().enumerate() {
            out[i * 4..i * 4 + 4].copy_from_slice(&word.to_le_bytes());
        }
        out
    }

    /// Deserialise from the little-endian wire layout.
    pub fn decode(bytes: &[u8; MESSAGE_HEADER_SIZE]) -> Self {
        let word = |i: usize| {
            u32::from_le_bytes([bytes[i * 4], bytes[i * 4 + 1], bytes[i * 4 + 2], bytes[i * 4 + 3]])
        };
        Self {
            msg_id: word(0),
            sender_pid: word(1),
            receiver_pid: word(2),
            msg_type: word(3),
            flags: word(4),
            timestamp: word(5),
            data_size: word(6),
            reserved: word(7),
        }
    }
}

/// The full user-visible message record: header plus payload area.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct Message {
    pub header: MessageHeader,
    pub data: [u8; MSG_MAX_DATA],
}

pub const MESSAGE_SIZE: usize = MESSAGE_HEADER_SIZE + MSG_MAX_DATA;

const _: () = assert!(size_of::<Message>() == MESSAGE_SIZE);
const _: () = assert!(offset_of!(Message, data) == MESSAGE_HEADER_SIZE);

impl Message {
    pub const fn empty() -> Self {
        Self {
            header: MessageHeader {
                msg_id: 0,
                sender_pid: 0,
                receiver_pid: 0,
                msg_type: 0,
                flags: 0,
                timestamp: 0,
                data_size: 0,
                reserved: 0,
            },
            data: [0; MSG_MAX_DATA],
        }
    }

    /// Payload slice clipped to the declared (and maximum) size.
    pub fn payload(&self) -> &[u8] {
        let len = (self.header.data_size as usize).min(MSG_MAX_DATA);
        &self.data[..len]
    }
}

impl Default for Message {
    fn default() -> Self {
        Self::empty()
    }
}
