//! Process loading.
//!
//! Segments are copied into freshly allocated frames one 4 KiB chunk at
//! a time through the identity window, so no part of the segment ever
//! needs a kernel-side virtual mapping of its own.

use alloc::sync::Arc;
use core::cmp;
use core::ptr;

use crate::arch::x86_64::consts::{
    IPC_BUFFER_SIZE, KERNEL_OFFSET, QUEUE_DEPTH, USER_END_OFFSET, USER_STACK_OFFSET,
    USER_STACK_SIZE,
};
use crate::context::memory::AddressSpace;
use crate::context::{Context, ContextFlags, Thread};
use crate::elf::{Elf, ElfError, PF_W, PF_X, PT_LOAD};
use crate::initrd::{self, InputStream};
use crate::ipc::Mailbox;
use crate::log::info;
use crate::paging::{round_down_pages, round_up_pages, EntryFlags, PageSize, VirtualAddress, PAGE_SIZE};

use super::kernel::{Kernel, KernelError};

/// Name of the initial service inside the boot archive.
const SERVICE_NAME: &str = "serial.elf";

impl Kernel {
    /// Find the service in the archive, validate it, and build a thread
    /// for it. Returns the context to schedule.
    pub(super) fn load_service(
        &'static self,
        archive: &'static [u8],
    ) -> Result<*mut Context, KernelError> {
        let stream = InputStream::new(archive);
        let file = initrd::lookup(&stream, SERVICE_NAME)?;
        let elf = Elf::from(file)?;
        info!("{}: entry {:#x}", SERVICE_NAME, elf.entry());
        self.load_process(&elf)
    }

    fn load_process(&'static self, elf: &Elf) -> Result<*mut Context, KernelError> {
        let mut space = AddressSpace::make(
            self.page_mapper,
            VirtualAddress::new(0),
            USER_END_OFFSET,
        )?;

        // Pin the kernel half into the new root, so the syscall entry
        // and interrupt handlers stay reachable while the service runs
        {
            let _threads = self.threads.lock();
            // SAFETY: the lock serializes against thread teardown, and
            // the kernel thread is never removed
            let kernel_thread = unsafe { &*self.kernel_thread.as_ptr() };
            space.shallow_copy_root_mapping(
                kernel_thread.address_space(),
                VirtualAddress::new(KERNEL_OFFSET),
                VirtualAddress::new(usize::MAX),
            );
        }

        for segment in elf.segments() {
            if segment.p_type != PT_LOAD {
                continue;
            }
            if segment.p_memsz < segment.p_filesz || segment.p_memsz == 0 {
                continue;
            }
            self.load_segment(&mut space, elf, segment)?;
        }

        // The stack's top touches the end of user space
        space.allocate(
            Some(VirtualAddress::new(USER_STACK_OFFSET)),
            USER_STACK_SIZE,
            EntryFlags::PRESENT
                | EntryFlags::WRITABLE
                | EntryFlags::USER_ACCESSIBLE
                | EntryFlags::NO_EXECUTE,
            PageSize::Size4KiB,
        )?;

        // The IPC buffer lives in kernel memory and is shared writable
        // into the service
        let (ipc_buffer, ipc_buffer_user_address) = {
            let _threads = self.threads.lock();
            // SAFETY: as above
            let kernel_thread = unsafe { &mut *self.kernel_thread.as_ptr() };
            let buffer = kernel_thread.address_space_mut().allocate(
                None,
                IPC_BUFFER_SIZE,
                EntryFlags::PRESENT | EntryFlags::WRITABLE | EntryFlags::NO_EXECUTE,
                PageSize::Size4KiB,
            )?;
            let user_mapping = space.share(
                kernel_thread.address_space(),
                &buffer,
                EntryFlags::PRESENT
                    | EntryFlags::WRITABLE
                    | EntryFlags::USER_ACCESSIBLE
                    | EntryFlags::NO_EXECUTE,
            )?;
            (buffer, user_mapping.start())
        };

        let context = Context::make(
            ContextFlags::empty(),
            space.root_table_physical_address(),
            elf.entry(),
            USER_END_OFFSET,
        );
        let mailbox = Arc::new(Mailbox::new(QUEUE_DEPTH)?);

        let mut threads = self.threads.lock();
        let thread = threads.add(|id| {
            Thread::new(
                id,
                context,
                space,
                mailbox,
                Some(ipc_buffer),
                Some(ipc_buffer_user_address),
            )
        });
        Ok(thread.context_ptr())
    }

    /// Copy one `PT_LOAD` segment in, frame by frame: allocate, zero,
    /// overlay the file bytes that land in that frame, map.
    fn load_segment(
        &self,
        space: &mut AddressSpace,
        elf: &Elf,
        segment: &goblin::elf64::program_header::ProgramHeader,
    ) -> Result<(), KernelError> {
        let virtual_start = segment.p_vaddr as usize;
        let file_size = segment.p_filesz as usize;
        let memory_size = segment.p_memsz as usize;

        let file_end = (segment.p_offset as usize)
            .checked_add(file_size)
            .ok_or(ElfError::InvalidElf)?;
        let file_bytes = elf
            .data
            .get(segment.p_offset as usize..file_end)
            .ok_or(ElfError::InvalidElf)?;

        let memory_end = virtual_start
            .checked_add(memory_size)
            .ok_or(ElfError::InvalidElf)?;
        let region_start = round_down_pages(virtual_start);
        let region_end = round_up_pages(memory_end);
        let region = space.reserve(
            Some(VirtualAddress::new(region_start)),
            region_end - region_start,
            segment_flags(segment),
            PageSize::Size4KiB,
        )?;

        for page_index in 0..region.size_in_frames() {
            let page_start = region_start + page_index * PAGE_SIZE;

            let frame = {
                let mut mapper = self.page_mapper.lock();
                let frame = mapper.allocate_frame()?;
                unsafe {
                    ptr::write_bytes(frame.ptr, 0, PAGE_SIZE);
                }

                // The part of the file image that lands in this frame
                let copy_start = cmp::max(page_start, virtual_start);
                let copy_end = cmp::min(page_start + PAGE_SIZE, virtual_start + file_size);
                if copy_start < copy_end {
                    unsafe {
                        ptr::copy_nonoverlapping(
                            file_bytes[copy_start - virtual_start..].as_ptr(),
                            frame.ptr.add(copy_start - page_start),
                            copy_end - copy_start,
                        );
                    }
                }
                frame
            };

            space.map_page(&region, frame.physical_address, page_index)?;
        }

        Ok(())
    }
}

/// Present and user-accessible always; writable only for data segments,
/// executable never writable.
fn segment_flags(segment: &goblin::elf64::program_header::ProgramHeader) -> EntryFlags {
    let mut flags = EntryFlags::PRESENT | EntryFlags::USER_ACCESSIBLE;
    if segment.p_flags & PF_X == 0 {
        flags |= EntryFlags::NO_EXECUTE;
    }
    if segment.p_flags & PF_W != 0 && segment.p_flags & PF_X == 0 {
        flags |= EntryFlags::WRITABLE;
    }
    flags
}
