//! x86_64 context switch stub.
//!
//! Saves the outgoing thread's callee-saved registers, stack pointer, and
//! FPU area into its [`Context`] and restores the incoming thread's. The
//! store/load offsets are the `#[repr(C)]` field order of `Context`:
//!
//! | offset | field |
//! |---|---|
//! | 0x00..0x28 | rbx rbp r12 r13 r14 r15 |
//! | 0x30 | rsp |
//! | 0x38 | rip (fresh-thread entry) |
//! | 0x40 | rflags |
//! | 0x48 | cr3 |
//! | 0x50 | fpu (FXSAVE area, 16-aligned) |
//!
//! A fresh thread's context has `rip` pointing at its entry trampoline
//! and `rsp` at the top of its stack; the `ret` at the end of the stub
//! lands there. A previously-switched-out thread resumes inside this stub
//! instead, because its saved `rsp` points at the frame the switch call
//! pushed.

use anillo_sched::context::Context;

core::arch::global_asm!(
    ".global anillo_context_switch",
    "anillo_context_switch:",
    // rdi = from (*mut Context), rsi = to (*const Context)
    "mov [rdi + 0x00], rbx",
    "mov [rdi + 0x08], rbp",
    "mov [rdi + 0x10], r12",
    "mov [rdi + 0x18], r13",
    "mov [rdi + 0x20], r14",
    "mov [rdi + 0x28], r15",
    // Save the return address (pushed by call) as rip, and the stack
    // pointer as it will be after this function returns.
    "mov rax, [rsp]",
    "mov [rdi + 0x38], rax",
    "lea rax, [rsp + 8]",
    "mov [rdi + 0x30], rax",
    "pushfq",
    "pop qword ptr [rdi + 0x40]",
    "mov rax, cr3",
    "mov [rdi + 0x48], rax",
    "fxsave [rdi + 0x50]",
    // Restore the incoming context.
    "fxrstor [rsi + 0x50]",
    "mov rax, [rsi + 0x48]",
    "mov rcx, cr3",
    "cmp rax, rcx",
    "je 2f",
    "mov cr3, rax",
    "2:",
    "push qword ptr [rsi + 0x40]",
    "popfq",
    "mov rbx, [rsi + 0x00]",
    "mov rbp, [rsi + 0x08]",
    "mov r12, [rsi + 0x10]",
    "mov r13, [rsi + 0x18]",
    "mov r14, [rsi + 0x20]",
    "mov r15, [rsi + 0x28]",
    "mov rsp, [rsi + 0x30]",
    "jmp qword ptr [rsi + 0x38]",
);

unsafe extern "C" {
    /// The assembly stub above.
    fn anillo_context_switch(from: *mut Context, to: *const Context);
}

/// Rust-callable wrapper matching the scheduler's switch hook signature.
pub fn context_switch(from: *mut Context, to: *const Context) {
    // SAFETY: The scheduler only passes contexts of threads it owns, with
    // `to` not running anywhere else.
    unsafe { anillo_context_switch(from, to) };
}
