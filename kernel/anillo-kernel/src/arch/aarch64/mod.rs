//! aarch64 backend.

pub mod paging;

#[cfg(target_os = "none")]
pub use tlb::{flush_all as tlb_flush_all, flush_page as tlb_flush_page};

#[cfg(target_os = "none")]
mod interrupts;
#[cfg(target_os = "none")]
mod switch;
#[cfg(target_os = "none")]
mod timer;
#[cfg(target_os = "none")]
mod tlb;

/// Writes the per-CPU base into `TPIDR_EL1`.
///
/// # Safety
///
/// `base` must point to a live per-CPU block; EL1 only.
#[cfg(target_os = "none")]
pub unsafe fn write_tpidr(base: u64) {
    // SAFETY: TPIDR_EL1 is a scratch register reserved for this use.
    unsafe {
        core::arch::asm!("msr TPIDR_EL1, {}", in(reg) base, options(nomem, nostack, preserves_flags));
    }
}

/// Reads the per-CPU base from `TPIDR_EL1`.
#[cfg(target_os = "none")]
pub fn read_tpidr() -> u64 {
    let base: u64;
    // SAFETY: Reading TPIDR_EL1 has no side effects.
    unsafe {
        core::arch::asm!("mrs {}, TPIDR_EL1", out(reg) base, options(nomem, nostack, preserves_flags));
    }
    base
}

/// Registers the aarch64 hooks with the subsystem crates.
///
/// # Safety
///
/// EL1 only; once per CPU.
#[cfg(target_os = "none")]
pub unsafe fn init_arch() {
    // SAFETY: The mask/unmask hooks only touch DAIF at EL1.
    unsafe {
        anillo_core::sync::interrupts::register_ops(interrupts::ops());
    }
    anillo_mm::mapper::register_tlb_flush(tlb::flush_page);
    anillo_sched::run::register_halt(interrupts::wait_for_interrupt);
    // SAFETY: The switch stub implements the Context save/restore
    // contract.
    unsafe {
        anillo_sched::run::register_switch(switch::context_switch);
    }
    timer::install();
}
