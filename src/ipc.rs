//! Message passing.
//!
//! Syscalls are delivered to the kernel thread as [`Message`]s on its
//! mailbox; the payload travels out of band in the sender's IPC buffer,
//! a 4 KiB page the kernel shares into every service's address space.

use crate::context::ThreadId;
use crate::sync::MpmcQueue;

/// A per-thread bounded mailbox.
pub type Mailbox<T> = MpmcQueue<T>;

/// A request delivered to the kernel thread's mailbox.
#[derive(Clone, Copy, Debug)]
pub struct Message {
    pub origin: ThreadId,
}

/// A hardware interrupt event, queued from IRQ context and drained by the
/// kernel loop.
#[derive(Clone, Copy, Debug)]
pub struct HardwareInterrupt {
    pub irq: u8,
}

/// Maximum payload carried by one IPC datagram.
pub const MAX_PAYLOAD_SIZE: usize = 128;

/// Layout of a datagram inside the shared IPC buffer. The kernel treats
/// the buffer as opaque; this is the contract with user space.
#[derive(Clone, Copy)]
#[repr(C)]
pub struct Datagram {
    pub sender: u64,
    pub receiver: u64,
    pub parameters: [u64; 4],
    pub size: u64,
    pub data: [u8; MAX_PAYLOAD_SIZE],
}
