//! The thread structure.

use alloc::sync::Arc;
use core::mem::offset_of;

use crate::context::arch::Context;
use crate::context::memory::{AddressSpace, Region};
use crate::ipc::{Mailbox, Message};
use crate::paging::VirtualAddress;

int_like!(ThreadId, usize);

/// A schedulable unit: the saved context, the owned address space, the
/// mailbox syscalls are delivered through, and the IPC buffer shared with
/// user space.
///
/// `context` is the first field on purpose: the syscall path hands the
/// kernel a raw `*mut Context`, and with the context at offset zero that
/// pointer doubles as a pointer to the whole thread.
#[repr(C)]
pub struct Thread {
    context: Context,
    id: ThreadId,
    address_space: AddressSpace,
    mailbox: Arc<Mailbox<Message>>,
    ipc_buffer: Option<Region>,
    ipc_buffer_user_address: Option<VirtualAddress>,
}

const _: () = {
    if offset_of!(Thread, context) != 0 {
        panic!("the syscall path requires the context at offset zero");
    }
};

impl Thread {
    pub fn new(
        id: ThreadId,
        context: Context,
        address_space: AddressSpace,
        mailbox: Arc<Mailbox<Message>>,
        ipc_buffer: Option<Region>,
        ipc_buffer_user_address: Option<VirtualAddress>,
    ) -> Self {
        Self {
            context,
            id,
            address_space,
            mailbox,
            ipc_buffer,
            ipc_buffer_user_address,
        }
    }

    pub fn id(&self) -> ThreadId {
        self.id
    }

    pub fn context_ptr(&mut self) -> *mut Context {
        &mut self.context
    }

    pub fn address_space(&self) -> &AddressSpace {
        &self.address_space
    }

    pub fn address_space_mut(&mut self) -> &mut AddressSpace {
        &mut self.address_space
    }

    pub fn mailbox(&self) -> &Arc<Mailbox<Message>> {
        &self.mailbox
    }

    pub fn ipc_buffer(&self) -> Option<&Region> {
        self.ipc_buffer.as_ref()
    }

    pub fn ipc_buffer_user_address(&self) -> Option<VirtualAddress> {
        self.ipc_buffer_user_address
    }

    /// Recover the thread from the saved-context pointer the assembly
    /// trampoline passes around.
    ///
    /// # Safety
    ///
    /// `context` must be the `context` field of a live `Thread` owned by
    /// the thread list, and no other reference to that thread may exist.
    pub unsafe fn from_context<'a>(context: *mut Context) -> &'a mut Thread {
        &mut *(context as *mut Thread)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_sits_at_offset_zero() {
        assert_eq!(offset_of!(Thread, context), 0);
    }
}
