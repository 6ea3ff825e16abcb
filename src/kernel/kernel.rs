//! Kernel construction and the dispatch loop.

use alloc::boxed::Box;
use alloc::sync::Arc;
use core::ptr::NonNull;
use core::slice;

use spin::Mutex;
use x86::controlregs;

use crate::allocator;
use crate::arch::x86_64::consts::{
    KERNEL_HEAP_SIZE, KERNEL_OFFSET, KERNEL_SPACE_SIZE, KERNEL_STACK_OFFSET, KERNEL_STACK_SIZE,
    PHYS_OFFSET, QUEUE_DEPTH,
};
use crate::arch::x86_64::cpu::{Cpu, CpuError, CpuObserver};
use crate::context::memory::AddressSpace;
use crate::context::{Context, ContextFlags, Thread, ThreadId, ThreadList};
use crate::elf::ElfError;
use crate::initrd::InitrdError;
use crate::ipc::{HardwareInterrupt, Mailbox, Message};
use crate::log::{debug, info};
use crate::memory::{self, Block, FrameAllocator, IdentityMapping, MemoryError, PageMapper};
use crate::paging::entry::ADDRESS_MASK;
use crate::paging::{EntryFlags, PageSize, TableView, VirtualAddress, PAGE_SIZE};
use crate::startup::{self, FramebufferInfo};
use crate::sync::{InvalidCapacity, SpscQueue};

/// Everything the boot path hands over before the bootloader's mappings
/// disappear.
pub struct BootConfig {
    pub framebuffer: FramebufferInfo,
    /// Physical location of the boot archive
    pub initrd: Block,
    pub code_start: usize,
    pub writable_data_start: usize,
    pub writable_data_end: usize,
}

#[derive(Debug)]
pub enum KernelError {
    Memory(MemoryError),
    Cpu(CpuError),
    Elf(ElfError),
    Initrd(InitrdError),
    InvalidQueueCapacity,
}

impl From<MemoryError> for KernelError {
    fn from(error: MemoryError) -> Self {
        Self::Memory(error)
    }
}
impl From<CpuError> for KernelError {
    fn from(error: CpuError) -> Self {
        Self::Cpu(error)
    }
}
impl From<ElfError> for KernelError {
    fn from(error: ElfError) -> Self {
        Self::Elf(error)
    }
}
impl From<InitrdError> for KernelError {
    fn from(error: InitrdError) -> Self {
        Self::Initrd(error)
    }
}
impl From<InvalidCapacity> for KernelError {
    fn from(_: InvalidCapacity) -> Self {
        Self::InvalidQueueCapacity
    }
}

/// A raw handle to the kernel thread inside the thread list. The box
/// behind the list entry gives it a stable address; the single core plus
/// the thread-list lock serialize every dereference.
pub(super) struct KernelThreadRef(NonNull<Thread>);

unsafe impl Send for KernelThreadRef {}
unsafe impl Sync for KernelThreadRef {}

impl KernelThreadRef {
    fn new(thread: &mut Thread) -> Self {
        Self(NonNull::from(thread))
    }

    pub(super) fn as_ptr(&self) -> *mut Thread {
        self.0.as_ptr()
    }
}

pub struct Kernel {
    pub(super) page_mapper: &'static Mutex<PageMapper>,
    pub(super) threads: Mutex<ThreadList>,
    pub(super) kernel_thread: KernelThreadRef,
    kernel_thread_id: ThreadId,
    /// The kernel thread's mailbox, cached so the syscall path reaches
    /// it without locking the thread list.
    kernel_mailbox: Arc<Mailbox<Message>>,
    irq_queue: SpscQueue<HardwareInterrupt, QUEUE_DEPTH>,
    initrd: &'static [u8],
    cpu: &'static Cpu,
}

impl Kernel {
    /// Build the kernel: frame allocator and page mapper over the boot
    /// memory map, the higher-half kernel address space, the heap, the
    /// kernel thread, and the CPU singleton.
    pub fn make(config: BootConfig) -> Result<&'static Kernel, KernelError> {
        // The bootloader identity-maps physical memory at the low end,
        // so translation starts as the identity function proper
        let boot_identity = IdentityMapping::new(0);
        let frame_allocator =
            unsafe { FrameAllocator::new(startup::free_blocks(), boot_identity) };
        let total_memory = startup::total_physical_memory();
        info!("{} MiB of physical memory", total_memory >> 20);

        let page_mapper =
            memory::init_page_mapper(unsafe { PageMapper::new(boot_identity, frame_allocator) });

        let boot_root_physical_address = unsafe { controlregs::cr3() } & ADDRESS_MASK;

        let mut kernel_space = AddressSpace::make(
            page_mapper,
            VirtualAddress::new(KERNEL_OFFSET),
            KERNEL_SPACE_SIZE,
        )?;

        // All of physical memory, mapped at the higher-half base with
        // 1 GiB pages: the identity window every later translation uses
        let identity_region = kernel_space.reserve(
            Some(VirtualAddress::new(PHYS_OFFSET)),
            total_memory,
            EntryFlags::PRESENT | EntryFlags::WRITABLE | EntryFlags::NO_EXECUTE,
            PageSize::Size1GiB,
        )?;
        for gigabyte in 0..identity_region.size_in_frames() {
            kernel_space.map_page(
                &identity_region,
                (gigabyte * PageSize::Size1GiB.bytes()) as u64,
                gigabyte,
            )?;
        }

        // The kernel image and its data, with the physical frames the
        // bootloader already placed them in
        let boot_root = {
            let mapper = page_mapper.lock();
            mapper.table_view(boot_root_physical_address)
        };
        copy_boot_region(
            &mut kernel_space,
            page_mapper,
            boot_root,
            config.code_start,
            config.writable_data_start - config.code_start,
            EntryFlags::PRESENT,
        )?;
        copy_boot_region(
            &mut kernel_space,
            page_mapper,
            boot_root,
            config.writable_data_start,
            config.writable_data_end - config.writable_data_start,
            EntryFlags::PRESENT | EntryFlags::WRITABLE | EntryFlags::NO_EXECUTE,
        )?;

        // The kernel stack: the top pages exist in the boot mapping and
        // are carried over, the rest of the reservation is fresh
        let stack_region = kernel_space.reserve(
            Some(VirtualAddress::new(KERNEL_STACK_OFFSET)),
            KERNEL_STACK_SIZE,
            EntryFlags::PRESENT | EntryFlags::WRITABLE | EntryFlags::NO_EXECUTE,
            PageSize::Size4KiB,
        )?;
        for page in 0..stack_region.size_in_frames() {
            let address = stack_region.start().next_by(page * PAGE_SIZE);
            let existing = page_mapper.lock().read(boot_root, address);
            match existing {
                Some(physical_address) => {
                    kernel_space.map_page(&stack_region, physical_address, page)?
                }
                None => kernel_space.allocate_page(&stack_region, page)?,
            }
        }

        // The framebuffer, kept at the virtual base the loader chose
        let fb_region = kernel_space.reserve(
            Some(VirtualAddress::new(config.framebuffer.virtual_base)),
            config.framebuffer.size,
            EntryFlags::PRESENT | EntryFlags::WRITABLE | EntryFlags::NO_EXECUTE,
            PageSize::Size2MiB,
        )?;
        for page in 0..fb_region.size_in_frames() {
            let address = fb_region.start().next_by(page * PageSize::Size2MiB.bytes());
            let physical_address = page_mapper
                .lock()
                .read(boot_root, address)
                .ok_or(MemoryError::NotMapped)?;
            kernel_space.map_page(&fb_region, physical_address, page)?;
        }

        // Point of no return: leave the bootloader's address space and
        // move the identity window to the higher half
        unsafe {
            Cpu::set_root_page_table(kernel_space.root_table_physical_address());
        }
        page_mapper
            .lock()
            .relocate(IdentityMapping::new(PHYS_OFFSET));
        info!("kernel address space installed");

        // The heap proper; the static bump arena has carried us so far
        let heap_region = kernel_space.allocate(
            None,
            KERNEL_HEAP_SIZE,
            EntryFlags::PRESENT | EntryFlags::WRITABLE | EntryFlags::NO_EXECUTE,
            PageSize::Size4KiB,
        )?;
        unsafe {
            allocator::init(heap_region.start().data(), heap_region.size());
            Cpu::flush_tlb();
        }
        // The log ring allocates; it has to wait for the heap
        crate::log::init();

        let kernel_mailbox = Arc::new(Mailbox::new(QUEUE_DEPTH)?);
        let root_physical_address = kernel_space.root_table_physical_address();

        let mut threads = ThreadList::new();
        let kernel_thread = threads.add(|id| {
            Thread::new(
                id,
                Context::empty(ContextFlags::KERNEL_MODE, root_physical_address),
                kernel_space,
                Arc::clone(&kernel_mailbox),
                None,
                None,
            )
        });
        let kernel_thread_id = kernel_thread.id();
        let kernel_context = kernel_thread.context_ptr();
        let kernel_thread = KernelThreadRef::new(kernel_thread);

        let cpu = Cpu::make(kernel_context)?;

        let initrd = unsafe {
            slice::from_raw_parts(
                IdentityMapping::new(PHYS_OFFSET).translate(config.initrd.start_address),
                config.initrd.size,
            )
        };

        Ok(Box::leak(Box::new(Kernel {
            page_mapper,
            threads: Mutex::new(threads),
            kernel_thread,
            kernel_thread_id,
            kernel_mailbox,
            irq_queue: SpscQueue::new(),
            initrd,
            cpu,
        })))
    }

    /// Load the initial service, hand the CPU to it, and dispatch events
    /// forever.
    pub fn run(&'static self) -> ! {
        self.cpu.register_observer(self);

        let service_context = self
            .load_service(self.initrd)
            .unwrap_or_else(|error| panic!("failed to load initial service: {:?}", error));
        info!("scheduling initial service");
        self.cpu.schedule_context(service_context);

        // Control returns here whenever a syscall resumes the kernel
        // thread
        loop {
            let mut idle = true;

            while let Some(event) = self.irq_queue.dequeue() {
                idle = false;
                self.handle_interrupt(event);
            }

            while let Some(message) = self.kernel_mailbox.dequeue() {
                idle = false;
                self.kill(message.origin);
            }

            if idle {
                self.cpu.halt();
            }
        }
    }

    fn handle_interrupt(&self, event: HardwareInterrupt) {
        // No driver model yet: the service polls its devices, the kernel
        // only records delivery
        debug!("IRQ {}", event.irq);
    }

    /// Tear a thread down: its address space unmaps and returns every
    /// owned frame, and the kernel-side IPC buffer region backing it is
    /// released from the kernel address space.
    fn kill(&self, id: ThreadId) {
        if id == self.kernel_thread_id {
            panic!("attempted to kill the kernel thread");
        }

        let mut threads = self.threads.lock();
        match threads.remove(id) {
            Some(thread) => {
                let ipc_buffer = thread.ipc_buffer().copied();
                drop(thread);

                if let Some(buffer) = ipc_buffer {
                    // SAFETY: the thread-list lock serializes access, and
                    // the kernel thread is never removed
                    let kernel_thread = unsafe { &mut *self.kernel_thread.as_ptr() };
                    kernel_thread.address_space_mut().release(&buffer);
                }

                info!("thread {:?} exited", id);
            }
            None => debug!("kill for unknown thread {:?}", id),
        }
    }
}

impl CpuObserver for Kernel {
    fn on_interrupt(&self, irq: u8) {
        if !self.irq_queue.enqueue(HardwareInterrupt { irq }) {
            panic!("interrupt queue overflow");
        }
    }

    fn on_syscall(&self, sender: *mut Context) -> *mut Context {
        // The context pointer is the thread pointer; see Thread's layout
        let origin = unsafe { Thread::from_context(sender) }.id();
        if !self.kernel_mailbox.enqueue(Message { origin }) {
            panic!("kernel mailbox overflow");
        }

        // Always resume the kernel thread; it drains the mailbox
        unsafe { (*self.kernel_thread.as_ptr()).context_ptr() }
    }
}

/// Reserve `[start, start + size)` and re-map it from the boot page
/// tables, frame by frame, under new flags.
fn copy_boot_region(
    space: &mut AddressSpace,
    page_mapper: &'static Mutex<PageMapper>,
    boot_root: TableView,
    start: usize,
    size: usize,
    flags: EntryFlags,
) -> Result<(), KernelError> {
    if size == 0 {
        return Ok(());
    }

    let region = space.reserve(
        Some(VirtualAddress::new(start)),
        size,
        flags,
        PageSize::Size4KiB,
    )?;
    for page in 0..region.size_in_frames() {
        let address = region.start().next_by(page * PAGE_SIZE);
        let physical_address = page_mapper
            .lock()
            .read(boot_root, address)
            .ok_or(MemoryError::NotMapped)?;
        space.map_page(&region, physical_address, page)?;
    }
    Ok(())
}
