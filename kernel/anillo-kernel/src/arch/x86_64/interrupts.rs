//! x86_64 interrupt masking and the idle halt.

use anillo_core::sync::interrupts::InterruptOps;

fn mask() {
    // SAFETY: cli has no effect beyond masking interrupts; ring 0 only.
    unsafe { core::arch::asm!("cli", options(nomem, nostack, preserves_flags)) };
}

fn unmask() {
    // SAFETY: sti has no effect beyond unmasking interrupts; ring 0 only.
    unsafe { core::arch::asm!("sti", options(nomem, nostack, preserves_flags)) };
}

/// The mask/unmask pair registered with the interrupt discipline.
pub fn ops() -> InterruptOps {
    InterruptOps { mask, unmask }
}

/// Unmasks interrupts and halts until the next one arrives.
///
/// `sti; hlt` is a single interruptible sequence: an interrupt pending
/// after `sti` is delivered on the `hlt` boundary, so the wakeup cannot
/// be missed.
pub fn wait_for_interrupt() {
    // SAFETY: Ring 0; masking state is restored by the interrupt return.
    unsafe { core::arch::asm!("sti; hlt; cli", options(nomem, nostack)) };
}
