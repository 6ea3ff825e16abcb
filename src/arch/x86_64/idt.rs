//! Interrupt descriptor table.
//!
//! Only two kinds of gates exist in this kernel: the double fault trap
//! gate and the sixteen hardware interrupt gates behind the legacy PIC.
//! Everything else stays non-present; an unexpected exception triple
//! faults, which is as good a diagnosis as this kernel can give.

use core::mem;

use x86::dtables::{self, DescriptorTablePointer};
use x86::segmentation::Descriptor as X86IdtEntry;

use super::gdt;
use super::interrupt::{exception, irq};

/// The interrupt stack table slot used by every installed gate.
pub const IST_INDEX: u8 = 1;

/// Vector of the first hardware interrupt gate; the PIC is programmed to
/// match.
pub const IRQ_BASE: u8 = 32;

const DOUBLE_FAULT_VECTOR: usize = 8;

pub type IdtEntries = [IdtEntry; 256];

bitflags! {
    pub struct IdtFlags: u8 {
        const PRESENT = 1 << 7;
        const RING_0 = 0 << 5;
        const RING_3 = 3 << 5;
        const SS = 1 << 4;
        const INTERRUPT = 0xE;
        const TRAP = 0xF;
    }
}

#[derive(Copy, Clone, Debug)]
#[repr(C, packed)]
pub struct IdtEntry {
    offsetl: u16,
    selector: u16,
    ist: u8,
    attribute: u8,
    offsetm: u16,
    offseth: u32,
    zero: u32,
}

impl IdtEntry {
    pub const fn new() -> IdtEntry {
        IdtEntry {
            offsetl: 0,
            selector: 0,
            ist: 0,
            attribute: 0,
            offsetm: 0,
            offseth: 0,
            zero: 0,
        }
    }

    pub fn set_flags(&mut self, flags: IdtFlags) {
        self.attribute = flags.bits();
    }

    pub fn set_ist(&mut self, ist: u8) {
        assert_eq!(ist & 0x07, ist, "interrupt stack table must be within 0..=7");
        self.ist &= 0xF8;
        self.ist |= ist;
    }

    pub fn set_offset(&mut self, selector: u16, base: usize) {
        self.selector = selector;
        self.offsetl = base as u16;
        self.offsetm = (base >> 16) as u16;
        self.offseth = (base >> 32) as u32;
    }

    // A function to set the offset more easily
    pub fn set_func(&mut self, func: unsafe extern "C" fn()) {
        self.set_flags(IdtFlags::PRESENT | IdtFlags::RING_0 | IdtFlags::INTERRUPT);
        self.set_offset(gdt::KERNEL_CODE_SELECTOR, func as usize);
    }
}

/// Populate the table: double fault on its own stack, one gate per PIC
/// line, each stub carrying its IRQ number.
pub fn init(idt: &mut IdtEntries) {
    idt[DOUBLE_FAULT_VECTOR].set_func(exception::double_fault);
    idt[DOUBLE_FAULT_VECTOR].set_flags(IdtFlags::PRESENT | IdtFlags::RING_0 | IdtFlags::TRAP);
    idt[DOUBLE_FAULT_VECTOR].set_ist(IST_INDEX);

    for (line, stub) in irq::IRQ_STUBS.iter().enumerate() {
        let vector = IRQ_BASE as usize + line;
        idt[vector].set_func(*stub);
        idt[vector].set_ist(IST_INDEX);
    }
}

/// # Safety
///
/// `idt` must stay alive at its address for as long as interrupts can
/// fire.
pub unsafe fn load(idt: &IdtEntries) {
    dtables::lidt(&DescriptorTablePointer {
        limit: (idt.len() * mem::size_of::<IdtEntry>() - 1) as u16,
        base: idt.as_ptr() as *const X86IdtEntry,
    });
}
