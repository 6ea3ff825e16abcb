//! Exception handlers.

/// Double faults land here on their own IST stack: the main stacks may
/// be the very thing that broke. There is no recovery.
#[unsafe(naked)]
pub unsafe extern "C" fn double_fault() {
    core::arch::naked_asm!(
        "
        // Error code (always zero for #DF) stays on the stack; this
        // never returns
        cld
        call {inner}
        ",
        inner = sym double_fault_inner,
    )
}

extern "C" fn double_fault_inner() -> ! {
    panic!("double fault");
}
