//! The CPU facade.
//!
//! A singleton that owns the descriptor tables, the dedicated interrupt
//! and syscall stacks, and the per-core [`Core`] block the syscall entry
//! reaches through GSBASE. After `make`, the tables are immutable; the
//! only shared mutable state is the active-context slot, the observer
//! (set once), and the spurious interrupt counter.

use core::alloc::{GlobalAlloc, Layout};
use core::cell::UnsafeCell;
use core::mem;
use core::ptr::NonNull;

use spin::Once;
use x86::bits64::task::TaskStateSegment;
use x86::controlregs;
use x86::msr;

use crate::context::arch::{syscall_entry, Context, Core};

use super::device::pic;
use super::{gdt, idt, interrupt};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CpuError {
    /// The singleton was constructed twice
    AlreadyCreated,
    /// Stack allocation failed
    OutOfMemory,
}

/// The receiver of hardware interrupts and syscalls. Exactly one exists;
/// its methods run in interrupt or syscall context and must only
/// enqueue.
pub trait CpuObserver: Sync {
    fn on_interrupt(&self, irq: u8);

    /// Handle a syscall from the thread owning `sender`, returning the
    /// context the assembly should resume.
    fn on_syscall(&self, sender: *mut Context) -> *mut Context;
}

const INTERRUPT_STACK_SIZE: usize = 1024;
const SYSCALL_STACK_SIZE: usize = 1024;

/// Alignment of RSP at the moment an entry path starts using a stack.
const STACK_ALIGN: usize = 16;

/// A dedicated stack for one of the CPU entry paths (interrupt delivery
/// via the IST, or the syscall trampoline). Zeroed bytes off the kernel
/// heap; the hardware only ever sees the top address.
struct EntryStack {
    base: NonNull<u8>,
    layout: Layout,
}

impl EntryStack {
    fn allocate(size: usize) -> Result<Self, CpuError> {
        let layout =
            Layout::from_size_align(size, STACK_ALIGN).map_err(|_| CpuError::OutOfMemory)?;
        let base = unsafe { crate::ALLOCATOR.alloc_zeroed(layout) };
        match NonNull::new(base) {
            Some(base) => Ok(Self { base, layout }),
            None => Err(CpuError::OutOfMemory),
        }
    }

    /// Stacks grow down: the CPU is handed the end of the allocation.
    fn top(&self) -> usize {
        self.base.as_ptr() as usize + self.layout.size()
    }
}

impl Drop for EntryStack {
    fn drop(&mut self) {
        unsafe {
            crate::ALLOCATOR.dealloc(self.base.as_ptr(), self.layout);
        }
    }
}

struct Tables {
    gdt: [gdt::GdtEntry; 7],
    tss: TaskStateSegment,
    idt: idt::IdtEntries,
}

pub struct Cpu {
    tables: UnsafeCell<Tables>,
    core: UnsafeCell<Core>,
    /// Kept for ownership; the CPU holds their top addresses in the TSS
    /// and the per-core block.
    #[allow(dead_code)]
    interrupt_stack: EntryStack,
    #[allow(dead_code)]
    syscall_stack: EntryStack,
}

// Single logical core: the cells are only touched by the boot path, the
// syscall entry, and the kernel loop, which never run concurrently.
unsafe impl Sync for Cpu {}
unsafe impl Send for Cpu {}

static CPU: Once<Cpu> = Once::new();
static OBSERVER: Once<&'static dyn CpuObserver> = Once::new();

pub fn observer() -> Option<&'static dyn CpuObserver> {
    OBSERVER.get().copied()
}

impl Cpu {
    /// Build and install the singleton: descriptor tables, PIC remap,
    /// syscall MSRs, GSBASE. `initial_context` is the kernel thread's
    /// context, published as the active context.
    pub fn make(initial_context: *mut Context) -> Result<&'static Cpu, CpuError> {
        if CPU.is_completed() {
            return Err(CpuError::AlreadyCreated);
        }

        let interrupt_stack = EntryStack::allocate(INTERRUPT_STACK_SIZE)?;
        let syscall_stack = EntryStack::allocate(SYSCALL_STACK_SIZE)?;

        let interrupt_stack_top = interrupt_stack.top();
        let syscall_stack_top = syscall_stack.top();

        let mut tss: TaskStateSegment = unsafe { mem::zeroed() };
        tss.ist[idt::IST_INDEX as usize - 1] = interrupt_stack_top as u64;
        // No IO permission bitmap: the base points past the segment limit
        tss.iomap_base = mem::size_of::<TaskStateSegment>() as u16;

        let cpu = CPU.call_once(|| Cpu {
            tables: UnsafeCell::new(Tables {
                gdt: gdt::BASE_GDT,
                tss,
                idt: [idt::IdtEntry::new(); 256],
            }),
            core: UnsafeCell::new(Core {
                kernel_stack: syscall_stack_top,
                active_context: initial_context,
            }),
            interrupt_stack,
            syscall_stack,
        });

        unsafe {
            cpu.install();
        }
        Ok(cpu)
    }

    /// # Safety
    ///
    /// Must run exactly once, with interrupts disabled, right after the
    /// singleton is placed at its final address.
    unsafe fn install(&'static self) {
        let tables = &mut *self.tables.get();

        gdt::install(&mut tables.gdt, &tables.tss);

        idt::init(&mut tables.idt);
        idt::load(&tables.idt);

        pic::init();

        // SYSCALL/SYSRET: enable in EFER, install the entry point and
        // selector bases, mask IF and TF while the entry runs
        msr::wrmsr(msr::IA32_EFER, msr::rdmsr(msr::IA32_EFER) | 1);
        msr::wrmsr(
            msr::IA32_STAR,
            ((gdt::SYSRET_BASE_SELECTOR as u64) << 48)
                | ((gdt::KERNEL_CODE_SELECTOR as u64) << 32),
        );
        let entry: unsafe extern "C" fn() = syscall_entry;
        msr::wrmsr(msr::IA32_LSTAR, entry as usize as u64);
        msr::wrmsr(msr::IA32_FMASK, 0x0300);

        // GSBASE reaches the per-core block from kernel mode; userspace
        // gets a zeroed base, swapped in by the entry paths
        msr::wrmsr(msr::IA32_GS_BASE, self.core.get() as u64);
        msr::wrmsr(msr::IA32_KERNEL_GSBASE, 0);
    }

    /// Store the observer and unmask interrupts.
    pub fn register_observer(&self, observer: &'static dyn CpuObserver) {
        OBSERVER.call_once(|| observer);
        unsafe {
            interrupt::enable();
        }
    }

    /// Switch to `next`. Does not return while `next` runs; the call
    /// completes when the syscall path hands control back to the calling
    /// (kernel) context.
    pub fn schedule_context(&self, next: *mut Context) {
        unsafe {
            let core = self.core.get();
            let previous = (*core).active_context;
            crate::context::arch::switch_context(previous, next);
        }
    }

    pub fn halt(&self) {
        unsafe {
            interrupt::halt();
        }
    }

    /// Write CR3.
    ///
    /// # Safety
    ///
    /// `root_table_physical_address` must point at a page table
    /// hierarchy that maps the currently executing code and stack.
    pub unsafe fn set_root_page_table(root_table_physical_address: u64) {
        controlregs::cr3_write(root_table_physical_address);
    }

    /// Flush the TLB by reloading CR3. Required after mutating mappings
    /// that may affect the active address space, before returning to
    /// user code.
    ///
    /// # Safety
    ///
    /// Paging must be fully set up.
    pub unsafe fn flush_tlb() {
        controlregs::cr3_write(controlregs::cr3());
    }
}

/// The C-ABI handler the syscall entry assembly calls on the syscall
/// stack. Forwards to the observer and returns the context to resume;
/// with no observer registered the syscall is an identity hop back into
/// the caller.
pub unsafe extern "C" fn system_call_handler() -> *mut Context {
    let cpu = CPU.get().expect("syscall before CPU initialization");
    let core = cpu.core.get();

    match observer() {
        None => (*core).active_context,
        Some(observer) => {
            let next = observer.on_syscall((*core).active_context);
            (*core).active_context = next;
            next
        }
    }
}
