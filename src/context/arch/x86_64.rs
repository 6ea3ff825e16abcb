//! Saved execution state and the context switch.
//!
//! The layouts here are shared with the assembly entry paths: `Context`
//! and `Core` are `repr(C, packed)` and every field offset the assembly
//! dereferences is taken from `offset_of!`, so the two cannot drift apart.

use core::mem::offset_of;

bitflags! {
    pub struct ContextFlags: u16 {
        /// The context runs in ring 0 and resumes via IRET with kernel
        /// selectors instead of SYSRET
        const KERNEL_MODE = 1;
    }
}

/// The minimal register set required to resume a thread: callee-saved
/// GPRs, instruction and stack pointers, RFLAGS, CR3 and the kernel/user
/// flag. Everything else is caller-saved across the only suspension
/// points (syscall and `schedule_context`).
#[derive(Clone, Copy, Debug)]
#[repr(C, packed)]
pub struct Context {
    pub rflags: u64,
    pub cr3: u64,
    pub rip: u64,
    pub rbx: u64,
    pub rsp: u64,
    pub rbp: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub flags: ContextFlags,
}

/// Interrupts enabled, all reserved bits at their mandatory values.
const INITIAL_RFLAGS: u64 = 0x202;

impl Context {
    /// A fresh context that will begin executing at `entry_point` on
    /// `stack_top`, under the address space rooted at
    /// `root_table_physical_address`.
    pub fn make(
        flags: ContextFlags,
        root_table_physical_address: u64,
        entry_point: usize,
        stack_top: usize,
    ) -> Context {
        Context {
            rflags: INITIAL_RFLAGS,
            cr3: root_table_physical_address,
            rip: entry_point as u64,
            rbx: 0,
            rsp: stack_top as u64,
            rbp: 0,
            r12: 0,
            r13: 0,
            r14: 0,
            r15: 0,
            flags,
        }
    }

    /// A zeroed placeholder, filled in by the first context switch away
    /// from the running thread.
    pub fn empty(flags: ContextFlags, root_table_physical_address: u64) -> Context {
        Context {
            rflags: 0,
            cr3: root_table_physical_address,
            rip: 0,
            rbx: 0,
            rsp: 0,
            rbp: 0,
            r12: 0,
            r13: 0,
            r14: 0,
            r15: 0,
            flags,
        }
    }
}

/// Per-core state reached through GSBASE from the syscall entry. The
/// assembly reads `kernel_stack` at offset 0 and `active_context` at
/// offset 8.
#[repr(C, packed)]
pub struct Core {
    pub kernel_stack: usize,
    pub active_context: *mut Context,
}

const _: () = {
    if core::mem::size_of::<Context>() != 10 * 8 + 2 {
        panic!("Context layout does not match the assembly contract");
    }
    if core::mem::size_of::<Core>() != 16 {
        panic!("Core layout does not match the assembly contract");
    }
    if offset_of!(Core, kernel_stack) != 0 || offset_of!(Core, active_context) != 8 {
        panic!("Core field order does not match the assembly contract");
    }
};

pub const CONTEXT_RFLAGS: usize = offset_of!(Context, rflags);
pub const CONTEXT_CR3: usize = offset_of!(Context, cr3);
pub const CONTEXT_RIP: usize = offset_of!(Context, rip);
pub const CONTEXT_RBX: usize = offset_of!(Context, rbx);
pub const CONTEXT_RSP: usize = offset_of!(Context, rsp);
pub const CONTEXT_RBP: usize = offset_of!(Context, rbp);
pub const CONTEXT_R12: usize = offset_of!(Context, r12);
pub const CONTEXT_R13: usize = offset_of!(Context, r13);
pub const CONTEXT_R14: usize = offset_of!(Context, r14);
pub const CONTEXT_R15: usize = offset_of!(Context, r15);
pub const CONTEXT_FLAGS: usize = offset_of!(Context, flags);

/// Save the running (kernel) context into `prev` and resume `next`.
///
/// Does not return until something switches back into `prev`: the kernel
/// resumes just after this call when the syscall path hands control back
/// to its context.
///
/// # Safety
///
/// Both pointers must refer to live contexts; `next` must describe a
/// resumable thread whose CR3 maps the kernel half; GSBASE must point at
/// the per-core `Core`.
#[cfg(not(test))]
#[unsafe(naked)]
pub unsafe extern "C" fn switch_context(prev: *mut Context, next: *const Context) {
    core::arch::naked_asm!(
        "
        // Save the calling context. RSP still includes our return
        // address, so resuming at 2f and executing RET returns to the
        // caller of switch_context.
        mov [rdi + {off_rbx}], rbx
        mov [rdi + {off_rsp}], rsp
        mov [rdi + {off_rbp}], rbp
        mov [rdi + {off_r12}], r12
        mov [rdi + {off_r13}], r13
        mov [rdi + {off_r14}], r14
        mov [rdi + {off_r15}], r15
        pushfq
        pop qword ptr [rdi + {off_rflags}]
        mov rax, cr3
        mov [rdi + {off_cr3}], rax
        lea rax, [rip + 2f]
        mov [rdi + {off_rip}], rax

        // Publish the context we are about to run
        mov gs:[{core_active}], rsi

        // Load the next context. Writing CR3 also flushes the TLB.
        mov rax, [rsi + {off_cr3}]
        mov cr3, rax
        mov rbx, [rsi + {off_rbx}]
        mov rbp, [rsi + {off_rbp}]
        mov r12, [rsi + {off_r12}]
        mov r13, [rsi + {off_r13}]
        mov r14, [rsi + {off_r14}]
        mov r15, [rsi + {off_r15}]

        test word ptr [rsi + {off_flags}], {kernel_mode}
        jz 3f

        // Ring 0: IRET with kernel selectors
        push {kernel_ss}
        push qword ptr [rsi + {off_rsp}]
        push qword ptr [rsi + {off_rflags}]
        push {kernel_cs}
        push qword ptr [rsi + {off_rip}]
        iretq

    3:  // Ring 3: IRET with user selectors, user GSBASE
        push {user_ss}
        push qword ptr [rsi + {off_rsp}]
        push qword ptr [rsi + {off_rflags}]
        push {user_cs}
        push qword ptr [rsi + {off_rip}]
        swapgs
        iretq

    2:  ret
        ",
        off_rflags = const CONTEXT_RFLAGS,
        off_cr3 = const CONTEXT_CR3,
        off_rip = const CONTEXT_RIP,
        off_rbx = const CONTEXT_RBX,
        off_rsp = const CONTEXT_RSP,
        off_rbp = const CONTEXT_RBP,
        off_r12 = const CONTEXT_R12,
        off_r13 = const CONTEXT_R13,
        off_r14 = const CONTEXT_R14,
        off_r15 = const CONTEXT_R15,
        off_flags = const CONTEXT_FLAGS,
        core_active = const offset_of!(Core, active_context),
        kernel_mode = const ContextFlags::KERNEL_MODE.bits() as usize,
        kernel_cs = const crate::gdt::KERNEL_CODE_SELECTOR as usize,
        kernel_ss = const crate::gdt::KERNEL_DATA_SELECTOR as usize,
        user_cs = const crate::gdt::USER_CODE_SELECTOR as usize,
        user_ss = const crate::gdt::USER_DATA_SELECTOR as usize,
    )
}

/// The SYSCALL entry installed in `IA32_LSTAR`.
///
/// Spills the interrupted user state into `*core.active_context`, runs
/// the Rust-side handler on the dedicated syscall stack, then resumes
/// whatever context the handler returned: SYSRET for user contexts, IRET
/// for the kernel thread.
#[cfg(not(test))]
#[unsafe(naked)]
pub unsafe extern "C" fn syscall_entry() {
    core::arch::naked_asm!(
        "
        swapgs
        mov rax, gs:[{core_active}]

        // Spill the caller. SYSCALL leaves the return RIP in RCX and
        // RFLAGS in R11.
        mov [rax + {off_rbx}], rbx
        mov [rax + {off_rsp}], rsp
        mov [rax + {off_rbp}], rbp
        mov [rax + {off_r12}], r12
        mov [rax + {off_r13}], r13
        mov [rax + {off_r14}], r14
        mov [rax + {off_r15}], r15
        mov [rax + {off_rip}], rcx
        mov [rax + {off_rflags}], r11
        mov rdx, cr3
        mov [rax + {off_cr3}], rdx

        mov rsp, gs:[{core_stack}]
        call {handler}

        // RAX holds the context to resume
        mov rdx, [rax + {off_cr3}]
        mov cr3, rdx
        mov rbx, [rax + {off_rbx}]
        mov rbp, [rax + {off_rbp}]
        mov r12, [rax + {off_r12}]
        mov r13, [rax + {off_r13}]
        mov r14, [rax + {off_r14}]
        mov r15, [rax + {off_r15}]

        test word ptr [rax + {off_flags}], {kernel_mode}
        jnz 2f

        mov rcx, [rax + {off_rip}]
        mov r11, [rax + {off_rflags}]
        mov rsp, [rax + {off_rsp}]
        swapgs
        sysretq

    2:  // Resuming the kernel thread: IRET off the syscall stack
        push {kernel_ss}
        push qword ptr [rax + {off_rsp}]
        push qword ptr [rax + {off_rflags}]
        push {kernel_cs}
        push qword ptr [rax + {off_rip}]
        iretq
        ",
        off_rflags = const CONTEXT_RFLAGS,
        off_cr3 = const CONTEXT_CR3,
        off_rip = const CONTEXT_RIP,
        off_rbx = const CONTEXT_RBX,
        off_rsp = const CONTEXT_RSP,
        off_rbp = const CONTEXT_RBP,
        off_r12 = const CONTEXT_R12,
        off_r13 = const CONTEXT_R13,
        off_r14 = const CONTEXT_R14,
        off_r15 = const CONTEXT_R15,
        off_flags = const CONTEXT_FLAGS,
        core_stack = const offset_of!(Core, kernel_stack),
        core_active = const offset_of!(Core, active_context),
        kernel_mode = const ContextFlags::KERNEL_MODE.bits() as usize,
        kernel_cs = const crate::gdt::KERNEL_CODE_SELECTOR as usize,
        kernel_ss = const crate::gdt::KERNEL_DATA_SELECTOR as usize,
        handler = sym crate::cpu::system_call_handler,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::mem::size_of;

    #[test]
    fn layouts_match_the_assembly_contract() {
        assert_eq!(size_of::<Context>(), 10 * 8 + 2);
        assert_eq!(size_of::<Core>(), 16);
        assert_eq!(offset_of!(Core, kernel_stack), 0);
        assert_eq!(offset_of!(Core, active_context), 8);
    }

    #[test]
    fn make_enables_interrupts() {
        let context = Context::make(ContextFlags::empty(), 0x1000, 0x40_0000, 0x7000_0000);
        assert_eq!({ context.rflags }, 0x202);
        assert_eq!({ context.cr3 }, 0x1000);
        assert_eq!({ context.rip }, 0x40_0000);
        assert_eq!({ context.rsp }, 0x7000_0000);
        assert!(!{ context.flags }.contains(ContextFlags::KERNEL_MODE));
    }
}
