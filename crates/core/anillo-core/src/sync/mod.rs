//! Synchronization primitives for the kernel.
//!
//! Provides [`SpinLock`] and [`IrqSpinLock`] suitable for use in `static`
//! items and usable before any allocator or scheduler is available, plus the
//! kernel-wide interrupt discipline ([`interrupts`]).
//!
//! Lock ordering is documented per subsystem; the global rules are:
//! address-space locks before mapping locks before the frame-allocator lock,
//! and wait-queue locks are always leaves. No code blocks while holding a
//! non-waitq lock except through the wait-locked primitives in the
//! scheduling crate.

pub mod interrupts;

mod irq_spinlock;
mod spinlock;

pub use irq_spinlock::{IrqSpinLock, IrqSpinLockGuard};
pub use spinlock::{SpinLock, SpinLockGuard};
