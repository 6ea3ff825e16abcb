//! Hardware interrupt dispatch.
//!
//! Each stub forwards its line number to [`irq_inner`], which hands the
//! event to the registered observer and acknowledges the PIC. The
//! handler runs on the interrupt stack and must not block: the observer
//! only enqueues.

use core::sync::atomic::{AtomicUsize, Ordering};

use crate::arch::x86_64::cpu;
use crate::arch::x86_64::device::pic;
use crate::{pop_scratch, push_scratch};

static SPURIOUS_IRQ_COUNT: AtomicUsize = AtomicUsize::new(0);

pub fn spurious_irq_count() -> usize {
    SPURIOUS_IRQ_COUNT.load(Ordering::Relaxed)
}

pub(crate) extern "C" fn irq_inner(irq: u8) {
    if let Some(observer) = cpu::observer() {
        observer.on_interrupt(irq);
    }

    // true means the PIC reported the line as spurious; there is nothing
    // to acknowledge then, only to count
    if unsafe { pic::notify_end_of_interrupt(irq) } {
        SPURIOUS_IRQ_COUNT.fetch_add(1, Ordering::Relaxed);
    }
}

irq_stub!(0);
irq_stub!(1);
irq_stub!(2);
irq_stub!(3);
irq_stub!(4);
irq_stub!(5);
irq_stub!(6);
irq_stub!(7);
irq_stub!(8);
irq_stub!(9);
irq_stub!(10);
irq_stub!(11);
irq_stub!(12);
irq_stub!(13);
irq_stub!(14);
irq_stub!(15);

/// The sixteen stubs in line order, for the IDT builder.
pub static IRQ_STUBS: [unsafe extern "C" fn(); 16] = [
    irq_0, irq_1, irq_2, irq_3, irq_4, irq_5, irq_6, irq_7, irq_8, irq_9, irq_10, irq_11,
    irq_12, irq_13, irq_14, irq_15,
];
