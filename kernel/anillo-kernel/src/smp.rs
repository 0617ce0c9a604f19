//! Multi-CPU TLB shootdown.
//!
//! A global invalidation publishes one request, bumps the generation
//! counter, and raises an IPI on every other online CPU. Each CPU's IPI
//! handler performs the local invalidation and checkpoints the current
//! generation; the originating CPU blocks (spinning with interrupts
//! enabled) until every online CPU has checkpointed past the request.
//!
//! The IPI transport belongs to the interrupt-controller collaborator; it
//! registers its send function with [`register_ipi`] and calls
//! [`on_shootdown_interrupt`] from the shootdown vector. Until more than
//! one CPU is online, everything degrades to the local flush.

use core::sync::atomic::{AtomicPtr, AtomicU64, Ordering};

use anillo_core::addr::VirtAddr;
use anillo_core::cpu_local::{CpuLocal, MAX_CPUS, cpu_count, current_cpu_id};
use anillo_core::id::CpuId;
use anillo_core::sync::SpinLock;

fn nop_ipi(_cpu: CpuId) {}

static IPI_FN: AtomicPtr<()> = AtomicPtr::new(nop_ipi as *mut ());

/// Registers the shootdown IPI sender.
pub fn register_ipi(f: fn(CpuId)) {
    IPI_FN.store(f as *mut (), Ordering::Release);
}

fn send_ipi(cpu: CpuId) {
    let ptr = IPI_FN.load(Ordering::Acquire);
    // SAFETY: Only valid `fn(CpuId)` pointers are stored into IPI_FN.
    let f: fn(CpuId) = unsafe { core::mem::transmute(ptr) };
    f(cpu);
}

/// The published request: `None` means "flush everything".
static REQUEST: SpinLock<Option<Option<VirtAddr>>> = SpinLock::new(None);

/// Serializes broadcasters (one request in flight at a time).
static BROADCAST_LOCK: SpinLock<()> = SpinLock::new(());

/// Monotonic request generation.
static GENERATION: AtomicU64 = AtomicU64::new(0);

/// Per-CPU checkpoint: the last generation this CPU has processed.
static CHECKPOINT: CpuLocal<AtomicU64> = CpuLocal::new([const { AtomicU64::new(0) }; MAX_CPUS]);

fn local_flush(virt: Option<VirtAddr>) {
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    match virt {
        Some(virt) => crate::arch::x86_64::tlb_flush_page(virt),
        None => crate::arch::x86_64::tlb_flush_all(),
    }
    #[cfg(all(target_arch = "aarch64", target_os = "none"))]
    match virt {
        Some(virt) => crate::arch::aarch64::tlb_flush_page(virt),
        None => crate::arch::aarch64::tlb_flush_all(),
    }
    #[cfg(not(target_os = "none"))]
    let _ = virt;
}

/// Invalidates on every online CPU and blocks until all have
/// checkpointed past the request.
///
/// Registered as the `flush_broadcast` backend; must be called with
/// interrupts enabled (the wait would otherwise deadlock against this
/// CPU's own shootdown vector).
pub fn shootdown(virt: Option<VirtAddr>) {
    local_flush(virt);
    let cpus = cpu_count();
    if cpus <= 1 {
        return;
    }

    let _broadcast = BROADCAST_LOCK.lock();
    *REQUEST.lock() = Some(virt);
    let generation = GENERATION.fetch_add(1, Ordering::AcqRel) + 1;
    let this_cpu = current_cpu_id();
    CHECKPOINT.get().store(generation, Ordering::Release);

    for cpu in 0..cpus {
        let cpu = CpuId::new(cpu);
        if cpu != this_cpu {
            send_ipi(cpu);
        }
    }
    for cpu in 0..cpus {
        let cpu = CpuId::new(cpu);
        while CHECKPOINT.get_for(cpu).load(Ordering::Acquire) < generation {
            core::hint::spin_loop();
        }
    }
}

/// Shootdown IPI handler body: flush locally and checkpoint.
pub fn on_shootdown_interrupt() {
    let request = *REQUEST.lock();
    if let Some(virt) = request {
        local_flush(virt);
    }
    CHECKPOINT
        .get()
        .store(GENERATION.load(Ordering::Acquire), Ordering::Release);
}

/// Returns a CPU's checkpoint generation (diagnostics and tests).
pub fn checkpoint(cpu: CpuId) -> u64 {
    CHECKPOINT.get_for(cpu).load(Ordering::Acquire)
}

/// Registers [`shootdown`] as the global flush backend.
pub fn install() {
    anillo_mm::mapper::register_tlb_broadcast(shootdown);
}

#[cfg(test)]
mod tests {
    use super::*;
    use anillo_core::cpu_local::{set_cpu_count, set_cpu_id_fn};
    use std::sync::atomic::AtomicU32;

    // Simulated CPU identity: threads that set this local pose as other
    // CPUs; everyone else keeps reading CPU 0, so the hijacked source is
    // harmless to concurrently running tests.
    thread_local! {
        static SIM_CPU: core::cell::Cell<u32> = const { core::cell::Cell::new(0) };
    }

    fn sim_cpu_id() -> CpuId {
        CpuId::new(SIM_CPU.with(|c| c.get()))
    }

    static IPIS_SENT: AtomicU32 = AtomicU32::new(0);

    fn counting_ipi(_cpu: CpuId) {
        IPIS_SENT.fetch_add(1, Ordering::SeqCst);
    }

    #[test]
    fn single_cpu_shootdown_is_local_only() {
        let _serial = crate::test_sync::lock();
        set_cpu_count(1);
        register_ipi(counting_ipi);
        let before = IPIS_SENT.load(Ordering::SeqCst);
        shootdown(Some(VirtAddr::new(0x1000)));
        assert_eq!(IPIS_SENT.load(Ordering::SeqCst), before);
    }

    #[test]
    fn broadcast_waits_for_remote_checkpoint() {
        let _serial = crate::test_sync::lock();
        // SAFETY: sim_cpu_id only reads a thread local.
        unsafe { set_cpu_id_fn(sim_cpu_id) };
        set_cpu_count(2);
        register_ipi(counting_ipi);

        // The "remote CPU" services shootdown IPIs until told to stop.
        let stop = std::sync::Arc::new(core::sync::atomic::AtomicBool::new(false));
        let remote = {
            let stop = stop.clone();
            std::thread::spawn(move || {
                SIM_CPU.with(|c| c.set(1));
                while !stop.load(Ordering::SeqCst) {
                    on_shootdown_interrupt();
                    std::thread::yield_now();
                }
            })
        };

        let generation_before = GENERATION.load(Ordering::SeqCst);
        shootdown(None);
        shootdown(Some(VirtAddr::new(0x4000)));
        // Both broadcasts completed, so CPU 1 checkpointed past both.
        assert_eq!(GENERATION.load(Ordering::SeqCst), generation_before + 2);
        assert!(checkpoint(CpuId::new(1)) >= generation_before + 2);

        stop.store(true, Ordering::SeqCst);
        remote.join().unwrap();
        set_cpu_count(1);
        // SAFETY: Restore the default source for later tests.
        unsafe { set_cpu_id_fn(default_cpu_id) };
    }

    fn default_cpu_id() -> CpuId {
        CpuId::BOOT
    }
}
