//! x86_64 timer backend: TSC timestamps, local-APIC deadline via the
//! registered device hooks.
//!
//! The timestamp side is purely architectural (rdtsc scaled by the boot
//! calibration). The "schedule one hardware fire" side belongs to the
//! interrupt controller driver, which is an external collaborator: it
//! registers its arm/disarm pair with [`register_timer_device`] and calls
//! `anillo_sched::timer::on_interrupt` from its vector.

use core::sync::atomic::{AtomicPtr, AtomicU64, Ordering};

use anillo_sched::timer::{TimerBackendOps, register_backend};

/// TSC increments per microsecond, set by boot-time calibration.
static TSC_PER_US: AtomicU64 = AtomicU64::new(1000);

fn nop_arm(_deadline_ns: u64) {}
fn nop_disarm() {}

static DEVICE_ARM: AtomicPtr<()> = AtomicPtr::new(nop_arm as *mut ());
static DEVICE_DISARM: AtomicPtr<()> = AtomicPtr::new(nop_disarm as *mut ());

/// Stores the calibrated TSC frequency.
pub fn set_tsc_frequency(ticks_per_us: u64) {
    TSC_PER_US.store(ticks_per_us.max(1), Ordering::Release);
}

/// Registers the interrupt-controller timer device (arm/disarm pair).
pub fn register_timer_device(arm: fn(u64), disarm: fn()) {
    DEVICE_ARM.store(arm as *mut (), Ordering::Release);
    DEVICE_DISARM.store(disarm as *mut (), Ordering::Release);
}

fn rdtsc() -> u64 {
    let (lo, hi): (u32, u32);
    // SAFETY: rdtsc reads the timestamp counter without side effects.
    unsafe {
        core::arch::asm!("rdtsc", out("eax") lo, out("edx") hi, options(nomem, nostack));
    }
    ((hi as u64) << 32) | lo as u64
}

fn now_ns() -> u64 {
    rdtsc() * 1000 / TSC_PER_US.load(Ordering::Acquire)
}

fn arm(deadline_ns: u64) {
    let ptr = DEVICE_ARM.load(Ordering::Acquire);
    // SAFETY: Only valid `fn(u64)` pointers are stored into DEVICE_ARM.
    let f: fn(u64) = unsafe { core::mem::transmute(ptr) };
    f(deadline_ns);
}

fn disarm() {
    let ptr = DEVICE_DISARM.load(Ordering::Acquire);
    // SAFETY: Only valid `fn()` pointers are stored into DEVICE_DISARM.
    let f: fn() = unsafe { core::mem::transmute(ptr) };
    f();
}

/// Registers the TSC-backed timer with the scheduling crate.
pub fn install() {
    // SAFETY: All three hooks are interrupt-safe (asm + atomics only).
    unsafe {
        register_backend(TimerBackendOps {
            now_ns,
            arm,
            disarm,
        });
    }
}
