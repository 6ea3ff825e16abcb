//! Assembly building blocks for interrupt stubs.

#[macro_export]
macro_rules! push_scratch {
    () => {
        "
        // Push scratch registers
        push rcx
        push rdx
        push rdi
        push rsi
        push r8
        push r9
        push r10
        push r11
    "
    };
}

#[macro_export]
macro_rules! pop_scratch {
    () => {
        "
        // Pop scratch registers
        pop r11
        pop r10
        pop r9
        pop r8
        pop rsi
        pop rdi
        pop rdx
        pop rcx
        pop rax
    "
    };
}

/// A hardware interrupt stub, parameterised by its IRQ line at compile
/// time. Saves the caller-saved half of the register file (the Rust
/// handler preserves the rest per the C ABI), hands the line number to
/// the shared dispatcher, and IRETs.
#[macro_export]
macro_rules! irq_stub {
    ($irq:literal) => {
        paste::paste! {
            #[unsafe(naked)]
            pub unsafe extern "C" fn [<irq_ $irq>]() {
                core::arch::naked_asm!(
                    concat!(
                        "push rax",
                        push_scratch!(),
                        "
                        mov edi, ", stringify!($irq), "
                        call {inner}
                        ",
                        pop_scratch!(),
                        "iretq",
                    ),
                    inner = sym $crate::arch::x86_64::interrupt::irq::irq_inner,
                )
            }
        }
    };
}
