//! Wait queues.
//!
//! A [`WaitQueue`] holds parked [`Waiter`] records in FIFO order. Waking
//! pops a waiter and invokes its callback with its context; callbacks run
//! after the queue lock is dropped and must not block (atomic flags and
//! wake-ups only).
//!
//! Waiter records are pre-owned by the caller and their linkage state is
//! guaranteed on every exit: after [`wait`](WaitQueue::wait) the record is
//! queued; after a wake or [`unwait`](WaitQueue::unwait) it is not, and it
//! can be reused.
//!
//! The queue handle is cheaply clonable (shared interior), so a parked
//! thread can remember which queue it is on without lifetime ties.

use alloc::collections::VecDeque;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use anillo_core::status::{KResult, Status};
use anillo_core::sync::{IrqSpinLock, IrqSpinLockGuard};

/// A wake callback. Receives the waiter's context. Must not block.
pub type WakeFn = fn(usize);

/// A parked waiter: a callback and its context.
pub struct Waiter {
    callback: WakeFn,
    context: AtomicUsize,
    queued: AtomicBool,
}

impl Waiter {
    /// Creates a waiter record.
    pub fn new(callback: WakeFn, context: usize) -> Arc<Self> {
        Arc::new(Self {
            callback,
            context: AtomicUsize::new(context),
            queued: AtomicBool::new(false),
        })
    }

    /// Returns `true` while the waiter is linked into a queue.
    pub fn is_queued(&self) -> bool {
        self.queued.load(Ordering::Acquire)
    }

    /// Replaces the context delivered to the callback.
    pub fn set_context(&self, context: usize) {
        self.context.store(context, Ordering::Release);
    }

    fn fire(&self) {
        (self.callback)(self.context.load(Ordering::Acquire));
    }
}

struct Inner {
    waiters: IrqSpinLock<VecDeque<Arc<Waiter>>>,
}

/// A FIFO list of parked waiters. Clones share the same queue.
#[derive(Clone)]
pub struct WaitQueue {
    inner: Arc<Inner>,
}

impl Default for WaitQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl WaitQueue {
    /// Creates an empty wait queue.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                waiters: IrqSpinLock::new(VecDeque::new()),
            }),
        }
    }

    /// Returns `true` if both handles refer to the same queue.
    pub fn same_queue(&self, other: &WaitQueue) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Appends `waiter` to the queue.
    ///
    /// Fails with [`Status::AlreadyInProgress`] if the record is still
    /// linked somewhere.
    pub fn wait(&self, waiter: &Arc<Waiter>) -> KResult<()> {
        let mut guard = self.locked();
        guard.enqueue(waiter)
    }

    /// Removes `waiter` from the queue without waking it.
    ///
    /// Fails with [`Status::NoSuchResource`] if the record is not queued
    /// here (typically because a wake already consumed it).
    pub fn unwait(&self, waiter: &Arc<Waiter>) -> KResult<()> {
        let mut waiters = self.inner.waiters.lock();
        let idx = waiters
            .iter()
            .position(|w| Arc::ptr_eq(w, waiter))
            .ok_or(Status::NoSuchResource)?;
        waiters.remove(idx);
        waiter.queued.store(false, Ordering::Release);
        Ok(())
    }

    /// Wakes the oldest waiter, if any. The callback runs after the queue
    /// lock is dropped. Returns `true` if a waiter was woken.
    pub fn wake_one(&self) -> bool {
        let popped = {
            let mut waiters = self.inner.waiters.lock();
            waiters.pop_front()
        };
        match popped {
            Some(waiter) => {
                waiter.queued.store(false, Ordering::Release);
                waiter.fire();
                true
            }
            None => false,
        }
    }

    /// Wakes every waiter in FIFO order. Callbacks run after the queue
    /// lock is dropped. Returns the number woken.
    pub fn wake_all(&self) -> usize {
        let drained: Vec<Arc<Waiter>> = {
            let mut waiters = self.inner.waiters.lock();
            waiters.drain(..).collect()
        };
        for waiter in &drained {
            waiter.queued.store(false, Ordering::Release);
            waiter.fire();
        }
        drained.len()
    }

    /// Returns the number of queued waiters.
    pub fn len(&self) -> usize {
        self.inner.waiters.lock().len()
    }

    /// Returns `true` if nobody is parked.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Locks the queue for an atomic check-then-park sequence.
    pub fn locked(&self) -> WaitQueueGuard<'_> {
        WaitQueueGuard {
            waiters: self.inner.waiters.lock(),
        }
    }
}

/// Exclusive access to a locked wait queue.
///
/// Used by the atomic park pattern: the caller checks its wake condition
/// under this guard, enqueues itself, and only then releases the lock,
/// so a concurrent wake cannot slip between check and park.
pub struct WaitQueueGuard<'a> {
    waiters: IrqSpinLockGuard<'a, VecDeque<Arc<Waiter>>>,
}

impl WaitQueueGuard<'_> {
    /// Appends `waiter` while the lock is held.
    pub fn enqueue(&mut self, waiter: &Arc<Waiter>) -> KResult<()> {
        if waiter.queued.swap(true, Ordering::AcqRel) {
            return Err(Status::AlreadyInProgress);
        }
        self.waiters.push_back(waiter.clone());
        Ok(())
    }

    /// Returns the number of queued waiters.
    pub fn len(&self) -> usize {
        self.waiters.len()
    }

    /// Returns `true` if nobody is parked.
    pub fn is_empty(&self) -> bool {
        self.waiters.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    static FIRED: Mutex<Vec<usize>> = Mutex::new(Vec::new());

    fn record(context: usize) {
        FIRED.lock().unwrap().push(context);
    }

    fn noop(_context: usize) {}

    fn drain_fired() -> Vec<usize> {
        core::mem::take(&mut *FIRED.lock().unwrap())
    }

    // The FIRED static is shared; tests that read it serialize through
    // this lock.
    static SERIAL: Mutex<()> = Mutex::new(());

    #[test]
    fn wake_one_is_fifo() {
        let _serial = SERIAL.lock().unwrap();
        drain_fired();
        let queue = WaitQueue::new();
        let first = Waiter::new(record, 1);
        let second = Waiter::new(record, 2);
        queue.wait(&first).unwrap();
        queue.wait(&second).unwrap();

        assert!(queue.wake_one());
        assert!(queue.wake_one());
        assert!(!queue.wake_one());
        assert_eq!(drain_fired(), vec![1, 2]);
    }

    #[test]
    fn wake_all_preserves_order() {
        let _serial = SERIAL.lock().unwrap();
        drain_fired();
        let queue = WaitQueue::new();
        for ctx in 10..15 {
            queue.wait(&Waiter::new(record, ctx)).unwrap();
        }
        assert_eq!(queue.wake_all(), 5);
        assert_eq!(drain_fired(), vec![10, 11, 12, 13, 14]);
        assert!(queue.is_empty());
    }

    #[test]
    fn double_wait_is_already_in_progress() {
        let queue = WaitQueue::new();
        let waiter = Waiter::new(noop, 0);
        queue.wait(&waiter).unwrap();
        assert_eq!(queue.wait(&waiter).unwrap_err(), Status::AlreadyInProgress);
    }

    #[test]
    fn unwait_unlinks() {
        let queue = WaitQueue::new();
        let waiter = Waiter::new(noop, 0);
        queue.wait(&waiter).unwrap();
        assert!(waiter.is_queued());

        queue.unwait(&waiter).unwrap();
        assert!(!waiter.is_queued());
        assert!(!queue.wake_one());

        // The record is reusable after unwait.
        queue.wait(&waiter).unwrap();
        assert!(queue.wake_one());
    }

    #[test]
    fn unwait_after_wake_reports_missing() {
        let queue = WaitQueue::new();
        let waiter = Waiter::new(noop, 0);
        queue.wait(&waiter).unwrap();
        queue.wake_one();
        assert_eq!(queue.unwait(&waiter).unwrap_err(), Status::NoSuchResource);
    }

    #[test]
    fn clones_share_the_queue() {
        let queue = WaitQueue::new();
        let alias = queue.clone();
        assert!(queue.same_queue(&alias));

        let waiter = Waiter::new(noop, 0);
        queue.wait(&waiter).unwrap();
        assert_eq!(alias.len(), 1);
        assert!(alias.wake_one());
    }

    #[test]
    fn locked_guard_parks_atomically() {
        let queue = WaitQueue::new();
        let waiter = Waiter::new(noop, 0);
        {
            let mut guard = queue.locked();
            assert!(guard.is_empty());
            guard.enqueue(&waiter).unwrap();
            assert_eq!(guard.len(), 1);
        }
        assert!(queue.wake_one());
    }

    #[test]
    fn concurrent_wake_hits_every_waiter() {
        use std::sync::Arc as StdArc;
        use std::sync::atomic::AtomicUsize;

        static WOKEN: AtomicUsize = AtomicUsize::new(0);
        fn count(_context: usize) {
            WOKEN.fetch_add(1, Ordering::SeqCst);
        }

        let queue = WaitQueue::new();
        for i in 0..100 {
            queue.wait(&Waiter::new(count, i)).unwrap();
        }

        let queue = StdArc::new(queue);
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let queue = queue.clone();
                std::thread::spawn(move || while queue.wake_one() {})
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(WOKEN.load(Ordering::SeqCst), 100);
        assert!(queue.is_empty());
    }
}
