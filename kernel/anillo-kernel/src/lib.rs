//! The Anillo kernel proper.
//!
//! Everything above the subsystem crates lives here: the boot handoff and
//! init pipeline ([`boot`]), the per-CPU block ([`percpu`]), the log sink
//! registry ([`log`]), processes with their descriptor tables ([`proc`]),
//! userspace thread attachment ([`uthread`]), syscall dispatch
//! ([`syscall`]), TLB shootdown coordination ([`smp`]), and the
//! architecture backends ([`arch`]).

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod arch;
pub mod boot;
pub mod log;
pub mod percpu;
pub mod proc;
pub mod smp;
pub mod syscall;
pub mod uthread;

/// Serialization for tests that touch process-global kernel state
/// (CPU count, scheduler current-thread, shootdown generation).
#[cfg(test)]
pub(crate) mod test_sync {
    use std::sync::{Mutex, MutexGuard};

    static GLOBAL: Mutex<()> = Mutex::new(());

    pub(crate) fn lock() -> MutexGuard<'static, ()> {
        GLOBAL.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
