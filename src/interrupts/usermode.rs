//! Ring 3 support: the int 0x80 syscall entry and the trampoline that first
//! drops a fresh process into user code.

use core::arch::naked_asm;

/// The int 0x80 handler, entered from Ring 3 on the current process's
/// kernel stack (RSP0).
///
/// Convention: RAX=syscall number, RDI=arg0, RSI=arg1, RDX=arg2; the result
/// comes back in RAX.
#[unsafe(naked)]
pub extern "C" fn syscall_handler_asm() {
    naked_asm!(
        "push r15",
        "push r14",
        "push r13",
        "push r12",
        "push r11",
        "push r10",
        "push r9",
        "push r8",
        "push rbp",
        "push rdx",
        "push rsi",
        "push rdi",
        "push rbx",
        "push rcx",
        // CPU pushed 5 qwords, we pushed 14: one more padding qword keeps
        // the System V 16-byte alignment for the call below.
        "sub rsp, 8",
        // dispatch(number, arg0, arg1, arg2)
        "mov rcx, rdx",
        "mov rdx, rsi",
        "mov rsi, rdi",
        "mov rdi, rax",
        "call {dispatch}",
        "add rsp, 8",
        // RAX holds the result and flows back to the user untouched.
        "pop rcx",
        "pop rbx",
        "pop rdi",
        "pop rsi",
        "pop rdx",
        "pop rbp",
        "pop r8",
        "pop r9",
        "pop r10",
        "pop r11",
        "pop r12",
        "pop r13",
        "pop r14",
        "pop r15",
        "iretq",
        dispatch = sym crate::syscalls::dispatch,
    );
}

/// First instructions a new process ever runs, still in Ring 0 on its own
/// kernel stack. The initial context carries the user entry point in R12
/// and the user stack top in R13; this builds the iretq frame and drops to
/// Ring 3 with interrupts enabled.
///
/// Selectors match the GDT layout: user data 0x1B, user code 0x23.
#[unsafe(naked)]
pub extern "C" fn usermode_trampoline() {
    naked_asm!(
        "mov ax, 0x1B",
        "mov ds, ax",
        "mov es, ax",
        "mov fs, ax",
        "mov gs, ax",
        "push 0x1B",  // SS
        "push r13",   // RSP
        "push 0x202", // RFLAGS, IF set
        "push 0x23",  // CS
        "push r12",   // RIP
        "iretq",
    );
}
