//! Counting semaphore.
//!
//! Permits are tracked in an atomic; threads that find none park on a wait
//! queue and are woken one per released permit. [`Semaphore::up`] is safe
//! to call from wake callbacks and interrupt context (it only touches the
//! atomic and the wait queue).

use alloc::sync::Arc;
use core::sync::atomic::{AtomicU32, Ordering};

use anillo_core::status::{KResult, Status};

use crate::thread::Thread;
use crate::waitq::WaitQueue;

/// A counting semaphore.
pub struct Semaphore {
    permits: AtomicU32,
    waiters: WaitQueue,
}

impl Semaphore {
    /// Creates a semaphore with the given number of permits.
    pub fn new(permits: u32) -> Self {
        Self {
            permits: AtomicU32::new(permits),
            waiters: WaitQueue::new(),
        }
    }

    /// Takes a permit without blocking.
    ///
    /// Returns [`Status::NoWait`] if none is available.
    pub fn try_down(&self) -> KResult<()> {
        loop {
            let current = self.permits.load(Ordering::Relaxed);
            if current == 0 {
                return Err(Status::NoWait);
            }
            if self
                .permits
                .compare_exchange_weak(
                    current,
                    current - 1,
                    Ordering::Acquire,
                    Ordering::Relaxed,
                )
                .is_ok()
            {
                return Ok(());
            }
        }
    }

    /// Takes a permit, parking `thread` until one is available.
    ///
    /// Propagates `timed-out`, `cancelled`, and `signalled` from the wait.
    pub fn down(&self, thread: &Arc<Thread>, timeout_ns: Option<u64>) -> KResult<()> {
        loop {
            // Atomic park: recheck the count under the queue lock so an
            // `up` between check and park cannot be lost.
            let guard = self.waiters.locked();
            if self.try_down().is_ok() {
                return Ok(());
            }
            thread.wait_on_locked(&self.waiters, guard, timeout_ns)?;
        }
    }

    /// Releases a permit and wakes one parked thread.
    pub fn up(&self) {
        self.permits.fetch_add(1, Ordering::Release);
        self.waiters.wake_one();
    }

    /// Returns the number of available permits.
    pub fn permits(&self) -> u32 {
        self.permits.load(Ordering::Relaxed)
    }
}
