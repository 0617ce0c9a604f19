//! aarch64 interrupt masking and the idle wait.

use anillo_core::sync::interrupts::InterruptOps;

fn mask() {
    // SAFETY: Masking IRQ/FIQ at EL1 has no other effect.
    unsafe { core::arch::asm!("msr DAIFSet, #0b0011", options(nomem, nostack, preserves_flags)) };
}

fn unmask() {
    // SAFETY: Unmasking IRQ/FIQ at EL1 has no other effect.
    unsafe { core::arch::asm!("msr DAIFClr, #0b0011", options(nomem, nostack, preserves_flags)) };
}

/// The mask/unmask pair registered with the interrupt discipline.
pub fn ops() -> InterruptOps {
    InterruptOps { mask, unmask }
}

/// Unmasks interrupts and waits for the next one.
pub fn wait_for_interrupt() {
    // SAFETY: wfi with interrupts unmasked wakes on the next interrupt;
    // the handler return restores the mask state.
    unsafe {
        core::arch::asm!(
            "msr DAIFClr, #0b0011",
            "wfi",
            "msr DAIFSet, #0b0011",
            options(nomem, nostack),
        );
    }
}
