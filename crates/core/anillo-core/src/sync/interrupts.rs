//! Interrupt discipline.
//!
//! Maintains a per-CPU nested disable counter. [`disable`] masks interrupts
//! and increments the counter; [`enable`] decrements it and unmasks only
//! when the count returns to zero. Unbalanced calls are fatal: an underflow
//! panics, and so does a final [`enable`] from inside an interrupt handler
//! (handlers run masked; the return path restores the interrupted state).
//!
//! The actual mask/unmask instructions are architecture-specific and are
//! registered at boot via [`register_ops`]. The host default is a no-op
//! pair, which preserves the counting semantics for tests.

use core::marker::PhantomData;
use core::sync::atomic::{AtomicPtr, AtomicU32, Ordering};

use crate::cpu_local::{CpuLocal, MAX_CPUS};

/// Architecture hooks for interrupt masking.
#[derive(Clone, Copy)]
pub struct InterruptOps {
    /// Masks interrupts on the current CPU.
    pub mask: fn(),
    /// Unmasks interrupts on the current CPU.
    pub unmask: fn(),
}

fn nop() {}

static MASK_FN: AtomicPtr<()> = AtomicPtr::new(nop as *mut ());
static UNMASK_FN: AtomicPtr<()> = AtomicPtr::new(nop as *mut ());

/// Per-CPU nested disable depth.
static DISABLE_DEPTH: CpuLocal<AtomicU32> = CpuLocal::new([const { AtomicU32::new(0) }; MAX_CPUS]);

/// Per-CPU interrupt-handler nesting depth.
static INTERRUPT_DEPTH: CpuLocal<AtomicU32> =
    CpuLocal::new([const { AtomicU32::new(0) }; MAX_CPUS]);

/// Registers the architecture mask/unmask hooks.
///
/// # Safety
///
/// Both functions must be safe to call from any context on the current CPU.
pub unsafe fn register_ops(ops: InterruptOps) {
    MASK_FN.store(ops.mask as *mut (), Ordering::Release);
    UNMASK_FN.store(ops.unmask as *mut (), Ordering::Release);
}

#[inline]
fn arch_mask() {
    let ptr = MASK_FN.load(Ordering::Acquire);
    // SAFETY: Only valid `fn()` pointers are ever stored into MASK_FN.
    let f: fn() = unsafe { core::mem::transmute(ptr) };
    f();
}

#[inline]
fn arch_unmask() {
    let ptr = UNMASK_FN.load(Ordering::Acquire);
    // SAFETY: Only valid `fn()` pointers are ever stored into UNMASK_FN.
    let f: fn() = unsafe { core::mem::transmute(ptr) };
    f();
}

/// Disables interrupts on the current CPU, incrementing the nest count.
///
/// Masks before incrementing so that an interrupt arriving between the two
/// steps observes a consistent (already masked) state.
pub fn disable() {
    arch_mask();
    DISABLE_DEPTH.get().fetch_add(1, Ordering::Relaxed);
}

/// Re-enables interrupts on the current CPU when the nest count drops to
/// zero.
///
/// # Panics
///
/// Panics on underflow (more enables than disables) and when the final
/// enable happens inside an interrupt handler.
pub fn enable() {
    let depth = DISABLE_DEPTH.get();
    let prev = depth.fetch_sub(1, Ordering::Relaxed);
    assert!(prev != 0, "interrupt disable count underflow");
    if prev == 1 {
        assert!(
            !in_interrupt(),
            "interrupts re-enabled inside an interrupt handler"
        );
        arch_unmask();
    }
}

/// Returns the current CPU's nested disable depth.
pub fn disable_depth() -> u32 {
    DISABLE_DEPTH.get().load(Ordering::Relaxed)
}

/// Returns `true` if the current CPU is executing an interrupt handler.
pub fn in_interrupt() -> bool {
    INTERRUPT_DEPTH.get().load(Ordering::Relaxed) != 0
}

/// Marks interrupt-handler entry. Called by the architecture trap entry
/// with interrupts already masked by hardware.
pub fn enter_interrupt() {
    INTERRUPT_DEPTH.get().fetch_add(1, Ordering::Relaxed);
    DISABLE_DEPTH.get().fetch_add(1, Ordering::Relaxed);
}

/// Marks interrupt-handler exit. The architecture return path restores the
/// interrupted context's mask state, so no unmask happens here.
pub fn leave_interrupt() {
    let prev = DISABLE_DEPTH.get().fetch_sub(1, Ordering::Relaxed);
    assert!(prev != 0, "interrupt disable count underflow on handler exit");
    let prev = INTERRUPT_DEPTH.get().fetch_sub(1, Ordering::Relaxed);
    assert!(prev != 0, "interrupt handler exit without entry");
}

/// RAII guard for a disabled-interrupts section.
///
/// Not `Send`: the nest count is per-CPU state.
pub struct InterruptGuard {
    _not_send: PhantomData<*const ()>,
}

impl InterruptGuard {
    /// Disables interrupts for the lifetime of the returned guard.
    pub fn new() -> Self {
        disable();
        Self {
            _not_send: PhantomData,
        }
    }
}

impl Default for InterruptGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for InterruptGuard {
    fn drop(&mut self) {
        enable();
    }
}
