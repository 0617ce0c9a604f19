//! Per-CPU block.
//!
//! Each CPU carries one [`PerCpu`] instance holding its identity and the
//! kernel stack pointer the syscall entry stub switches to. The block is
//! reached through an architecture-specific self-pointer (GS base on
//! x86_64, `TPIDR_EL1` on aarch64); [`install`] wires the lookup into
//! `anillo-core` so `CpuLocal` indexing works everywhere below us.
//!
//! `#[repr(C)]` field order is part of the contract with the assembly
//! entry stubs:
//! - offset 0: `self_ptr`
//! - offset 8: `kernel_sp`
//! - offset 16: `user_sp`
//! - offset 24: `cpu_id`

use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use anillo_core::cpu_local::MAX_CPUS;
use anillo_core::id::CpuId;

/// Per-CPU state block.
#[repr(C)]
pub struct PerCpu {
    /// Self-pointer for the `base:[0]` access pattern (offset 0).
    pub self_ptr: AtomicU64,
    /// Kernel stack pointer for syscall entry (offset 8).
    pub kernel_sp: AtomicU64,
    /// Saved user stack pointer during syscall handling (offset 16).
    pub user_sp: AtomicU64,
    /// Logical CPU id (offset 24).
    cpu_id: AtomicU32,
    initialized: AtomicBool,
}

impl PerCpu {
    const fn new() -> Self {
        Self {
            self_ptr: AtomicU64::new(0),
            kernel_sp: AtomicU64::new(0),
            user_sp: AtomicU64::new(0),
            cpu_id: AtomicU32::new(0),
            initialized: AtomicBool::new(false),
        }
    }

    /// Returns this block's CPU id.
    pub fn cpu_id(&self) -> CpuId {
        CpuId::new(self.cpu_id.load(Ordering::Relaxed))
    }

    /// Returns whether this block has been initialized.
    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }
}

/// Static blocks for every possible CPU; secondary CPUs claim theirs
/// during bring-up.
static BLOCKS: [PerCpu; MAX_CPUS] = [const { PerCpu::new() }; MAX_CPUS];

/// Returns the block of a specific CPU.
pub fn block_for(cpu: CpuId) -> &'static PerCpu {
    &BLOCKS[cpu.as_usize()]
}

/// Initializes the calling CPU's block and publishes the self-pointer via
/// the architecture register.
///
/// # Safety
///
/// Must run exactly once per CPU during its bring-up, before anything on
/// that CPU queries `current_cpu_id`.
pub unsafe fn install(cpu: CpuId) {
    let block = block_for(cpu);
    block
        .self_ptr
        .store(block as *const PerCpu as u64, Ordering::Relaxed);
    block.cpu_id.store(cpu.as_raw(), Ordering::Relaxed);
    block.initialized.store(true, Ordering::Release);

    // SAFETY: The block is 'static and now initialized.
    unsafe { crate::arch::set_percpu_base(block as *const PerCpu as u64) };

    // SAFETY: current_percpu_cpu_id only reads the block published above.
    unsafe { anillo_core::cpu_local::set_cpu_id_fn(current_percpu_cpu_id) };
}

/// CPU-id source registered into `anillo-core`.
///
/// Reads the architecture per-CPU base register; falls back to the boot
/// CPU while no block is published (early boot, host tests).
fn current_percpu_cpu_id() -> CpuId {
    let base = crate::arch::percpu_base();
    if base == 0 {
        return CpuId::BOOT;
    }
    // SAFETY: The base register only ever holds a pointer to a 'static
    // PerCpu block published by `install`.
    let block = unsafe { &*(base as *const PerCpu) };
    block.cpu_id()
}
