//! Legacy programmable interrupt controller pair.

use x86::io::{inb, outb};

use crate::arch::x86_64::idt::IRQ_BASE;

static MASTER: Pic = Pic::new(0x20);
static SLAVE: Pic = Pic::new(0xA0);

/// Remap both controllers onto vectors 32..48 and unmask everything.
///
/// # Safety
///
/// Touches the PIC IO ports; the IDT gates for the remapped vectors must
/// be in place before interrupts are enabled.
pub unsafe fn init() {
    // Start initialization
    MASTER.command(0x11);
    SLAVE.command(0x11);

    // Set offsets
    MASTER.data(IRQ_BASE);
    SLAVE.data(IRQ_BASE + 8);

    // Set up cascade
    MASTER.data(4);
    SLAVE.data(2);

    // Set up interrupt mode (1 is 8086/88 mode, 2 is auto EOI)
    MASTER.data(1);
    SLAVE.data(1);

    // Unmask interrupts
    MASTER.data(0);
    SLAVE.data(0);

    // Ack remaining interrupts
    MASTER.ack();
    SLAVE.ack();
}

/// Signal end of interrupt for `irq`, detecting spurious deliveries.
///
/// Returns true when the controller reported the line as spurious: the
/// in-service register has no bit for it, so nothing is acknowledged
/// (except the master's cascade line for a spurious slave IRQ).
///
/// # Safety
///
/// Only from interrupt context, after `init`.
pub unsafe fn notify_end_of_interrupt(irq: u8) -> bool {
    debug_assert!(irq < 16);

    if irq == 7 && MASTER.isr() & (1 << 7) == 0 {
        return true;
    }
    if irq == 15 && SLAVE.isr() & (1 << 7) == 0 {
        // The cascade line on the master was genuinely serviced
        MASTER.ack();
        return true;
    }

    if irq >= 8 {
        SLAVE.ack();
    }
    MASTER.ack();
    false
}

struct Pic {
    cmd: u16,
    data: u16,
}

impl Pic {
    const fn new(port: u16) -> Pic {
        Pic {
            cmd: port,
            data: port + 1,
        }
    }

    unsafe fn command(&self, value: u8) {
        outb(self.cmd, value);
    }

    unsafe fn data(&self, value: u8) {
        outb(self.data, value);
    }

    unsafe fn ack(&self) {
        outb(self.cmd, 0x20);
    }

    /// A bitmap of all currently serviced IRQs. Spurious IRQs will not
    /// have their bit set.
    unsafe fn isr(&self) -> u8 {
        outb(self.cmd, 0x0A);
        inb(self.cmd)
    }
}
