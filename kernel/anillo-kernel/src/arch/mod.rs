//! Architecture backends.
//!
//! The paging modules are plain memory manipulation (they walk tables
//! through the HHDM) and are compiled — and host-tested — for their
//! target architecture. Privileged instructions (interrupt masking, TLB
//! invalidation, per-CPU base registers, timers, the context switch stub)
//! only exist on bare-metal builds (`target_os = "none"`); host builds
//! fall back to no-ops so the rest of the kernel stays testable.

#[cfg(target_arch = "x86_64")]
pub mod x86_64;

#[cfg(target_arch = "aarch64")]
pub mod aarch64;

use anillo_core::id::CpuId;

/// The page-table mapper serving every address space on this
/// architecture.
#[cfg(target_arch = "x86_64")]
pub type KernelMapper = x86_64::paging::PageTableMapper;

/// The page-table mapper serving every address space on this
/// architecture.
#[cfg(target_arch = "aarch64")]
pub type KernelMapper = aarch64::paging::PageTableMapper;

// ---------------------------------------------------------------------------
// Per-CPU base register
// ---------------------------------------------------------------------------

/// Host fallback for the per-CPU base register.
#[cfg(not(target_os = "none"))]
static HOST_PERCPU_BASE: core::sync::atomic::AtomicU64 = core::sync::atomic::AtomicU64::new(0);

/// Publishes the per-CPU block pointer in the architecture base register
/// (`IA32_GS_BASE` on x86_64, `TPIDR_EL1` on aarch64).
///
/// # Safety
///
/// `base` must point to a live, initialized per-CPU block.
pub unsafe fn set_percpu_base(base: u64) {
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    // SAFETY: Writing IA32_GS_BASE with a valid pointer is the caller's
    // contract.
    unsafe {
        x86_64::write_gs_base(base);
    }
    #[cfg(all(target_arch = "aarch64", target_os = "none"))]
    // SAFETY: Writing TPIDR_EL1 with a valid pointer is the caller's
    // contract.
    unsafe {
        aarch64::write_tpidr(base);
    }
    #[cfg(not(target_os = "none"))]
    HOST_PERCPU_BASE.store(base, core::sync::atomic::Ordering::Release);
}

/// Reads the per-CPU base register. Zero before [`set_percpu_base`].
pub fn percpu_base() -> u64 {
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    {
        x86_64::read_gs_base()
    }
    #[cfg(all(target_arch = "aarch64", target_os = "none"))]
    {
        aarch64::read_tpidr()
    }
    #[cfg(not(target_os = "none"))]
    {
        HOST_PERCPU_BASE.load(core::sync::atomic::Ordering::Acquire)
    }
}

// ---------------------------------------------------------------------------
// Bring-up
// ---------------------------------------------------------------------------

/// Registers this architecture's hooks with the subsystem crates:
/// interrupt masking, TLB invalidation, the context switch stub, the idle
/// halt, and the timer backend.
///
/// # Safety
///
/// Must run once per CPU during bring-up, before the scheduler starts on
/// that CPU.
pub unsafe fn init(cpu: CpuId) {
    let _ = cpu;
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    // SAFETY: Forwarded caller contract.
    unsafe {
        x86_64::init_arch();
    }
    #[cfg(all(target_arch = "aarch64", target_os = "none"))]
    // SAFETY: Forwarded caller contract.
    unsafe {
        aarch64::init_arch();
    }
    // Host builds keep the registered no-op defaults.
}
