//! aarch64 context switch stub.
//!
//! Offsets follow the `#[repr(C)]` layout of `Context`:
//!
//! | offset | field |
//! |---|---|
//! | 0x00..0x50 | x19-x28 |
//! | 0x50 | fp (x29) |
//! | 0x58 | lr (x30, resume address) |
//! | 0x60 | sp |
//! | 0x68 | spsr |
//! | 0x70 | ttbr0 |
//! | 0x80..0x100 | q8-q15 (16-aligned) |
//! | 0x100 | fpcr |
//! | 0x108 | fpsr |

use anillo_sched::context::Context;

core::arch::global_asm!(
    ".global anillo_context_switch",
    "anillo_context_switch:",
    // x0 = from (*mut Context), x1 = to (*const Context)
    "stp x19, x20, [x0, #0x00]",
    "stp x21, x22, [x0, #0x10]",
    "stp x23, x24, [x0, #0x20]",
    "stp x25, x26, [x0, #0x30]",
    "stp x27, x28, [x0, #0x40]",
    "stp x29, x30, [x0, #0x50]",
    "mov x9, sp",
    "str x9, [x0, #0x60]",
    "mrs x9, TTBR0_EL1",
    "str x9, [x0, #0x70]",
    "stp q8, q9, [x0, #0x80]",
    "stp q10, q11, [x0, #0xA0]",
    "stp q12, q13, [x0, #0xC0]",
    "stp q14, q15, [x0, #0xE0]",
    "mrs x9, FPCR",
    "str x9, [x0, #0x100]",
    "mrs x9, FPSR",
    "str x9, [x0, #0x108]",
    // Restore the incoming context.
    "ldr x9, [x1, #0x108]",
    "msr FPSR, x9",
    "ldr x9, [x1, #0x100]",
    "msr FPCR, x9",
    "ldp q8, q9, [x1, #0x80]",
    "ldp q10, q11, [x1, #0xA0]",
    "ldp q12, q13, [x1, #0xC0]",
    "ldp q14, q15, [x1, #0xE0]",
    "ldr x9, [x1, #0x70]",
    "mrs x10, TTBR0_EL1",
    "cmp x9, x10",
    "b.eq 2f",
    "msr TTBR0_EL1, x9",
    "isb",
    "2:",
    "ldr x9, [x1, #0x60]",
    "mov sp, x9",
    "ldp x19, x20, [x1, #0x00]",
    "ldp x21, x22, [x1, #0x10]",
    "ldp x23, x24, [x1, #0x20]",
    "ldp x25, x26, [x1, #0x30]",
    "ldp x27, x28, [x1, #0x40]",
    "ldp x29, x30, [x1, #0x50]",
    "ret",
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
