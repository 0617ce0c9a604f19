//! Per-CPU storage.
//!
//! Provides [`CpuLocal`] indexed by CPU ID. The CPU ID source is a function
//! registered at boot by the kernel crate (which reads it from the per-CPU
//! block); before registration — and on the host — the ID is always 0, which
//! is correct for the single-CPU boot phase and for single-threaded tests.
//! Multi-CPU host tests can register a thread-local source.

use core::sync::atomic::{AtomicPtr, AtomicU32, Ordering};

use crate::id::CpuId;

/// Maximum supported CPUs.
pub const MAX_CPUS: usize = 64;

/// The signature of the CPU-ID source function.
pub type CpuIdFn = fn() -> CpuId;

fn boot_cpu_id() -> CpuId {
    CpuId::BOOT
}

static CPU_ID_FN: AtomicPtr<()> = AtomicPtr::new(boot_cpu_id as *mut ());

/// Number of online CPUs.
static CPU_COUNT: AtomicU32 = AtomicU32::new(1);

/// Registers the CPU-ID source.
///
/// # Safety
///
/// The provided function must be safe to call from any context, including
/// interrupt context, and must return a value below [`MAX_CPUS`].
pub unsafe fn set_cpu_id_fn(f: CpuIdFn) {
    CPU_ID_FN.store(f as *mut (), Ordering::Release);
}

/// Returns the current CPU's ID.
#[inline]
pub fn current_cpu_id() -> CpuId {
    let ptr = CPU_ID_FN.load(Ordering::Acquire);
    // SAFETY: Only valid `CpuIdFn` pointers (or the initial `boot_cpu_id`)
    // are ever stored into CPU_ID_FN.
    let f: CpuIdFn = unsafe { core::mem::transmute(ptr) };
    f()
}

/// Returns the number of online CPUs.
pub fn cpu_count() -> u32 {
    CPU_COUNT.load(Ordering::Acquire)
}

/// Sets the number of online CPUs. Called once per CPU during bring-up.
pub fn set_cpu_count(count: u32) {
    debug_assert!(count as usize <= MAX_CPUS);
    CPU_COUNT.store(count, Ordering::Release);
}

/// Per-CPU storage. Wraps `[T; MAX_CPUS]`, indexed by the current CPU ID.
pub struct CpuLocal<T> {
    data: [T; MAX_CPUS],
}

impl<T> CpuLocal<T> {
    /// Creates a new `CpuLocal` wrapping the given array.
    pub const fn new(data: [T; MAX_CPUS]) -> Self {
        Self { data }
    }

    /// Returns a reference to the current CPU's instance.
    ///
    /// If the registered source returns an out-of-range ID (possible during
    /// secondary-CPU early boot before its per-CPU block is wired up), falls
    /// back to CPU 0's slot rather than indexing out of bounds.
    pub fn get(&self) -> &T {
        let id = current_cpu_id().as_usize();
        if id < MAX_CPUS {
            &self.data[id]
        } else {
            &self.data[0]
        }
    }

    /// Returns a reference to a specific CPU's instance.
    ///
    /// # Panics
    ///
    /// Panics if `cpu` is at or above [`MAX_CPUS`].
    pub fn get_for(&self, cpu: CpuId) -> &T {
        &self.data[cpu.as_usize()]
    }

    /// Iterates over the slots of all online CPUs.
    pub fn iter_online(&self) -> impl Iterator<Item = (CpuId, &T)> {
        let online = cpu_count() as usize;
        self.data
            .iter()
            .take(online)
            .enumerate()
            .map(|(i, t)| (CpuId::new(i as u32), t))
    }
}

// SAFETY: CpuLocal<T> is designed for per-CPU access. Send/Sync are safe
// because each CPU primarily accesses its own slot and cross-CPU access
// goes through `T`'s own synchronization.
unsafe impl<T: Send> Send for CpuLocal<T> {}
unsafe impl<T: Sync> Sync for CpuLocal<T> {}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::AtomicU64;

    #[test]
    fn default_cpu_id_is_boot() {
        assert_eq!(current_cpu_id(), CpuId::BOOT);
    }

    #[test]
    fn get_uses_slot_zero_by_default() {
        static LOCAL: CpuLocal<AtomicU64> =
            CpuLocal::new([const { AtomicU64::new(0) }; MAX_CPUS]);
        LOCAL.get().store(7, Ordering::Relaxed);
        assert_eq!(LOCAL.get_for(CpuId::BOOT).load(Ordering::Relaxed), 7);
    }

    #[test]
    fn get_for_addresses_distinct_slots() {
        let local: CpuLocal<AtomicU64> =
            CpuLocal::new([const { AtomicU64::new(0) }; MAX_CPUS]);
        local.get_for(CpuId::new(1)).store(11, Ordering::Relaxed);
        local.get_for(CpuId::new(2)).store(22, Ordering::Relaxed);
        assert_eq!(local.get_for(CpuId::new(1)).load(Ordering::Relaxed), 11);
        assert_eq!(local.get_for(CpuId::new(2)).load(Ordering::Relaxed), 22);
        assert_eq!(local.get_for(CpuId::new(0)).load(Ordering::Relaxed), 0);
    }

    #[test]
    fn iter_online_respects_cpu_count() {
        let local: CpuLocal<u32> = CpuLocal::new([0; MAX_CPUS]);
        // cpu_count defaults to 1 (other tests may have raised it; accept >= 1).
        let seen = local.iter_online().count();
        assert!(seen >= 1);
    }
}
