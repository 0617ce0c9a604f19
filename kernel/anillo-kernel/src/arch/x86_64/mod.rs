//! x86_64 backend.

pub mod paging;

#[cfg(target_os = "none")]
mod interrupts;
#[cfg(target_os = "none")]
mod switch;
#[cfg(target_os = "none")]
mod timer;
#[cfg(target_os = "none")]
mod tlb;

#[cfg(target_os = "none")]
pub use timer::{register_timer_device, set_tsc_frequency};
#[cfg(target_os = "none")]
pub use tlb::{flush_all as tlb_flush_all, flush_page as tlb_flush_page};

/// IA32_GS_BASE model-specific register.
#[cfg(target_os = "none")]
const IA32_GS_BASE: u32 = 0xC000_0101;

/// Writes the GS base MSR.
///
/// # Safety
///
/// `base` must point to a live per-CPU block; kernel mode only.
#[cfg(target_os = "none")]
pub unsafe fn write_gs_base(base: u64) {
    // SAFETY: wrmsr with IA32_GS_BASE is safe in ring 0; the value is the
    // caller's contract.
    unsafe {
        core::arch::asm!(
            "wrmsr",
            in("ecx") IA32_GS_BASE,
            in("eax") base as u32,
            in("edx") (base >> 32) as u32,
            options(nomem, nostack, preserves_flags),
        );
    }
}

/// Reads the GS base MSR.
#[cfg(target_os = "none")]
pub fn read_gs_base() -> u64 {
    let (lo, hi): (u32, u32);
    // SAFETY: rdmsr with IA32_GS_BASE is safe in ring 0.
    unsafe {
        core::arch::asm!(
            "rdmsr",
            in("ecx") IA32_GS_BASE,
            out("eax") lo,
            out("edx") hi,
            options(nomem, nostack, preserves_flags),
        );
    }
    ((hi as u64) << 32) | lo as u64
}

/// Registers the x86_64 hooks with the subsystem crates.
///
/// # Safety
///
/// Kernel mode only; once per CPU.
#[cfg(target_os = "none")]
pub unsafe fn init_arch() {
    // SAFETY: The mask/unmask hooks only execute cli/sti in ring 0.
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
