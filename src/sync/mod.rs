//! Synchronization primitives.
//!
//! The IRQ/syscall hot paths never take locks: interrupt delivery goes
//! through [`SpscQueue`], mailbox delivery through [`MpmcQueue`].

pub use self::mpmc::{InvalidCapacity, MpmcQueue};
pub use self::spsc::SpscQueue;

mod mpmc;
mod spsc;
