//! aarch64 generic timer backend.
//!
//! Fully architectural: `CNTVCT_EL0` provides the timestamp and
//! `CNTV_TVAL_EL0`/`CNTV_CTL_EL0` schedule the one pending fire. The
//! interrupt controller routing of the timer PPI is the boot
//! collaborator's job; its handler calls `anillo_sched::timer::on_interrupt`.

use anillo_sched::timer::{TimerBackendOps, register_backend};

const NSEC_PER_SEC: u64 = 1_000_000_000;

fn counter_freq() -> u64 {
    let freq: u64;
    // SAFETY: CNTFRQ_EL0 is read-only and always accessible.
    unsafe {
        core::arch::asm!("mrs {}, CNTFRQ_EL0", out(reg) freq, options(nomem, nostack, preserves_flags));
    }
    freq.max(1)
}

fn counter() -> u64 {
    let ticks: u64;
    // SAFETY: Reading the virtual counter has no side effects; isb orders
    // it against surrounding code.
    unsafe {
        core::arch::asm!("isb", "mrs {}, CNTVCT_EL0", out(reg) ticks, options(nomem, nostack));
    }
    ticks
}

fn now_ns() -> u64 {
    let freq = counter_freq();
    let ticks = counter();
    // Split to avoid overflow: whole seconds plus the fractional part.
    (ticks / freq) * NSEC_PER_SEC + (ticks % freq) * NSEC_PER_SEC / freq
}

fn arm(deadline_ns: u64) {
    let now = now_ns();
    let delta_ns = deadline_ns.saturating_sub(now);
    let ticks = delta_ns.saturating_mul(counter_freq()) / NSEC_PER_SEC;
    // SAFETY: Programming the virtual timer compare/control registers at
    // EL1.
    unsafe {
        core::arch::asm!(
            "msr CNTV_TVAL_EL0, {tval}",
            "msr CNTV_CTL_EL0, {ctl}",
            tval = in(reg) ticks.max(1),
            ctl = in(reg) 1u64, // ENABLE=1, IMASK=0
            options(nomem, nostack, preserves_flags),
        );
    }
}

fn disarm() {
    // SAFETY: Clearing ENABLE stops the pending fire.
    unsafe {
        core::arch::asm!(
            "msr CNTV_CTL_EL0, {}",
            in(reg) 0u64,
            options(nomem, nostack, preserves_flags),
        );
    }
}

/// Registers the generic-timer backend with the scheduling crate.
pub fn install() {
    // SAFETY: All three hooks are interrupt-safe (system registers only).
    unsafe {
        register_backend(TimerBackendOps {
            now_ns,
            arm,
            disarm,
        });
    }
}
