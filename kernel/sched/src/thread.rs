//! Kernel thread lifecycle.
//!
//! A [`Thread`] moves between the execution states suspended, running,
//! interrupted, and dead, with pending flags tracking requested
//! transitions. All state changes happen under the thread's spin lock.
//!
//! Blocking follows the atomic park pattern: the waiter enqueues itself on
//! a [`WaitQueue`] while holding the queue lock (so a wake cannot slip in
//! between the condition check and the park), then spins or switches away
//! through its [`ThreadManager`] until a wake arrives. Wake-versus-timeout
//! races are settled by a compare-and-swap on the wake slot: whoever sets
//! it first wins and the loser's wake is suppressed.
//!
//! Death is asynchronous: [`kill`](Thread::kill) sets the die-pending flag
//! and wakes the thread with `cancelled`; the scheduler's next pass runs
//! [`reap`](Thread::reap) on a different stack, which fires the death wait
//! queue. The destroy wait queue fires when the last reference drops.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicU8, AtomicU32, AtomicU64, Ordering};

use anillo_core::id::{CpuId, ThreadId};
use anillo_core::status::{KResult, Status};
use anillo_core::sync::{IrqSpinLock, SpinLock};

use crate::context::Context;
use crate::timer;
use crate::waitq::{WaitQueue, WaitQueueGuard, Waiter};

/// Execution state of a thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecState {
    /// Parked or not yet scheduled; not eligible to run.
    Suspended,
    /// Eligible to run or currently on a CPU.
    Running,
    /// On a CPU that is currently executing an interrupt handler.
    Interrupted,
    /// Terminated; never runs again.
    Dead,
}

bitflags::bitflags! {
    /// Pending transition requests, independent of the execution state.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PendingFlags: u8 {
        /// A suspend was requested while the thread was running.
        const SUSPEND = 1 << 0;
        /// A resume was requested while a suspend was still in flight.
        const RESUME = 1 << 1;
        /// The thread must die at the next scheduler exit path.
        const DIE = 1 << 2;
        /// The thread holds a wait-queue lock (park in progress).
        const HOLDING_WAITQ_LOCK = 1 << 3;
        /// The last wakeup was caused by a signal.
        const INTERRUPTED_BY_SIGNAL = 1 << 4;
    }
}

/// How a blocked thread was woken. Stored in the wake slot CAS.
const WAKE_NONE: u8 = 0;
const WAKE_NORMAL: u8 = 1;
const WAKE_TIMED_OUT: u8 = 2;
const WAKE_CANCELLED: u8 = 3;
const WAKE_SIGNALLED: u8 = 4;

/// Scheduling callbacks a thread delegates to.
///
/// The scheduler implements this for managed threads; [`SpinManager`]
/// covers early boot (before the scheduler runs) and hosted tests.
pub trait ThreadManager: Send + Sync {
    /// Makes a woken thread runnable again.
    fn resume(&self, thread: &Arc<Thread>);

    /// Requests that a thread running on some CPU stop executing (either
    /// inline if it is not on a CPU, or via an inter-processor interrupt).
    fn suspend(&self, thread: &Arc<Thread>);

    /// Called repeatedly by a blocked thread until its wake slot is set.
    /// The scheduler switches away here; a busy-wait manager just spins.
    fn block_current(&self, thread: &Arc<Thread>);
}

/// Busy-wait manager used before the scheduler is up and by hosted tests.
pub struct SpinManager;

/// The shared instance.
pub static SPIN_MANAGER: SpinManager = SpinManager;

impl ThreadManager for SpinManager {
    fn resume(&self, _thread: &Arc<Thread>) {}

    fn suspend(&self, _thread: &Arc<Thread>) {}

    fn block_current(&self, _thread: &Arc<Thread>) {
        #[cfg(test)]
        std::thread::yield_now();
        #[cfg(not(test))]
        core::hint::spin_loop();
    }
}

/// No CPU assignment.
pub const NO_CPU: u32 = u32::MAX;

struct ThreadState {
    exec: ExecState,
    pending: PendingFlags,
    /// The queue this thread is parked on, if any.
    parked_on: Option<WaitQueue>,
    /// Pending wait timeout, if any.
    timeout: Option<anillo_core::id::TimerId>,
}

/// A kernel thread.
pub struct Thread {
    id: ThreadId,
    name: &'static str,
    state: IrqSpinLock<ThreadState>,
    /// Wake slot: who woke the thread first (see the `WAKE_*` constants).
    wake_slot: AtomicU8,
    /// Incremented on every wait; stale timeout callbacks are filtered by
    /// comparing epochs.
    wait_epoch: AtomicU32,
    /// This thread's reusable waiter record.
    waiter: Arc<Waiter>,
    manager: &'static dyn ThreadManager,
    /// Saved register context, touched only by the switch path.
    context: UnsafeCell<Context>,
    /// Entry point for a fresh kernel thread.
    entry: Option<(fn(usize), usize)>,
    /// CPU this thread is assigned to ([`NO_CPU`] before `manage`).
    cpu: AtomicU32,
    /// Woken when the thread dies.
    death_waitq: WaitQueue,
    /// Woken when the thread's memory is about to be reclaimed.
    destroy_waitq: WaitQueue,
}

// SAFETY: The context cell is only accessed by the switch path while the
// thread is not running anywhere else; everything else is behind locks or
// atomics.
unsafe impl Send for Thread {}
unsafe impl Sync for Thread {}

/// Registry of live threads, for callback context resolution.
static THREADS: SpinLock<BTreeMap<u64, alloc::sync::Weak<Thread>>> =
    SpinLock::new(BTreeMap::new());

static NEXT_THREAD_ID: AtomicU64 = AtomicU64::new(1);

/// Packs (thread id, wait epoch) into a callback context word.
fn pack_timeout_context(id: ThreadId, epoch: u32) -> usize {
    ((id.as_raw() as usize) << 32) | epoch as usize
}

fn unpack_timeout_context(context: usize) -> (ThreadId, u32) {
    (
        ThreadId::new((context >> 32) as u64),
        (context & 0xFFFF_FFFF) as u32,
    )
}

/// Waitq wake callback: context is the thread id.
fn waitq_wake_thread(context: usize) {
    if let Some(thread) = lookup(ThreadId::new(context as u64)) {
        thread.wake(WAKE_NORMAL);
    }
}

/// Timer callback for wait timeouts: context packs (id, epoch).
fn timeout_wake_thread(context: usize) {
    let (id, epoch) = unpack_timeout_context(context);
    if let Some(thread) = lookup(id) {
        // A stale timeout from an earlier wait must not wake this one.
        if thread.wait_epoch.load(Ordering::Acquire) == epoch {
            thread.wake_from_timeout();
        }
    }
}

/// Looks up a live thread by id.
pub fn lookup(id: ThreadId) -> Option<Arc<Thread>> {
    THREADS.lock().get(&id.as_raw()).and_then(|weak| weak.upgrade())
}

impl Thread {
    /// Creates a new suspended kernel thread.
    ///
    /// The thread is registered but not scheduled; hand it to the
    /// scheduler's `manage` to make it runnable.
    pub fn new(
        name: &'static str,
        manager: &'static dyn ThreadManager,
        entry: Option<(fn(usize), usize)>,
    ) -> Arc<Self> {
        let id = ThreadId::new(NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed));
        let thread = Arc::new(Self {
            id,
            name,
            state: IrqSpinLock::new(ThreadState {
                exec: ExecState::Suspended,
                pending: PendingFlags::empty(),
                parked_on: None,
                timeout: None,
            }),
            wake_slot: AtomicU8::new(WAKE_NONE),
            wait_epoch: AtomicU32::new(0),
            waiter: Waiter::new(waitq_wake_thread, id.as_raw() as usize),
            manager,
            context: UnsafeCell::new(Context::new()),
            entry,
            cpu: AtomicU32::new(NO_CPU),
            death_waitq: WaitQueue::new(),
            destroy_waitq: WaitQueue::new(),
        });
        THREADS.lock().insert(id.as_raw(), Arc::downgrade(&thread));
        thread
    }

    /// Returns the thread id.
    pub fn id(&self) -> ThreadId {
        self.id
    }

    /// Returns the debug name.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Returns the entry point of a fresh kernel thread.
    pub fn entry(&self) -> Option<(fn(usize), usize)> {
        self.entry
    }

    /// Returns the current execution state.
    pub fn exec_state(&self) -> ExecState {
        self.state.lock().exec
    }

    /// Returns `true` if a wake has been posted but not yet consumed by
    /// the wait loop (the thread is mid-wakeup).
    pub fn has_pending_wake(&self) -> bool {
        self.wake_slot.load(Ordering::Acquire) != WAKE_NONE
    }

    /// Scheduler-only: marks a freshly managed thread eligible to run.
    ///
    /// Parked threads are left alone; their wait loop settles the state.
    pub fn mark_runnable(&self) {
        let mut state = self.state.lock();
        if state.exec == ExecState::Suspended && state.parked_on.is_none() {
            state.exec = ExecState::Running;
        }
    }

    /// Returns `true` once a kill has been requested or completed.
    pub fn is_dying(&self) -> bool {
        let state = self.state.lock();
        state.pending.contains(PendingFlags::DIE) || state.exec == ExecState::Dead
    }

    /// The wait queue woken when this thread dies.
    pub fn death_waitq(&self) -> &WaitQueue {
        &self.death_waitq
    }

    /// The wait queue woken when this thread's memory is reclaimed.
    pub fn destroy_waitq(&self) -> &WaitQueue {
        &self.destroy_waitq
    }

    /// CPU assignment accessor for the scheduler.
    pub fn cpu(&self) -> Option<CpuId> {
        match self.cpu.load(Ordering::Acquire) {
            NO_CPU => None,
            id => Some(CpuId::new(id)),
        }
    }

    /// Assigns the thread to a CPU (scheduler only).
    pub fn set_cpu(&self, cpu: Option<CpuId>) {
        self.cpu
            .store(cpu.map_or(NO_CPU, |c| c.as_raw()), Ordering::Release);
    }

    /// Raw pointer to the saved context, for the switch stubs.
    ///
    /// # Safety
    ///
    /// Only the scheduler may use this, and only while the thread is not
    /// executing on any other CPU.
    pub unsafe fn context_ptr(&self) -> *mut Context {
        self.context.get()
    }

    // -- blocking -----------------------------------------------------------

    /// Parks the calling thread on `queue` until woken.
    ///
    /// Returns `Ok(())` for a normal wake and `Err` with
    /// [`Status::TimedOut`], [`Status::Cancelled`], or
    /// [`Status::Signalled`] otherwise.
    pub fn wait_on(self: &Arc<Self>, queue: &WaitQueue, timeout_ns: Option<u64>) -> KResult<()> {
        let guard = queue.locked();
        self.wait_on_locked(queue, guard, timeout_ns)
    }

    /// Parks on an already locked queue (atomic park pattern).
    ///
    /// The caller checks its condition under `guard` before calling; the
    /// park happens before the lock is released, so no wake can be lost.
    pub fn wait_on_locked(
        self: &Arc<Self>,
        queue: &WaitQueue,
        mut guard: WaitQueueGuard<'_>,
        timeout_ns: Option<u64>,
    ) -> KResult<()> {
        {
            let mut state = self.state.lock();
            if state.pending.contains(PendingFlags::DIE) || state.exec == ExecState::Dead {
                return Err(Status::Cancelled);
            }
            state.pending.insert(PendingFlags::HOLDING_WAITQ_LOCK);
            state.exec = ExecState::Suspended;
            state.parked_on = Some(queue.clone());
        }

        // New epoch: stale timeouts from earlier waits are filtered out.
        let epoch = self.wait_epoch.fetch_add(1, Ordering::AcqRel) + 1;
        self.wake_slot.store(WAKE_NONE, Ordering::Release);

        if let Err(err) = guard.enqueue(&self.waiter) {
            let mut state = self.state.lock();
            state.pending.remove(PendingFlags::HOLDING_WAITQ_LOCK);
            state.exec = ExecState::Running;
            state.parked_on = None;
            return Err(err);
        }
        drop(guard);
        self.state
            .lock()
            .pending
            .remove(PendingFlags::HOLDING_WAITQ_LOCK);

        if let Some(ns) = timeout_ns {
            let tid = timer::oneshot(ns, timeout_wake_thread, pack_timeout_context(self.id, epoch));
            self.state.lock().timeout = Some(tid);
        }

        loop {
            if self.wake_slot.load(Ordering::Acquire) != WAKE_NONE {
                break;
            }
            self.manager.block_current(self);
        }

        // Unpark bookkeeping: settle state before reporting the outcome.
        let kind = self.wake_slot.swap(WAKE_NONE, Ordering::AcqRel);
        let (stale_queue, stale_timer) = {
            let mut state = self.state.lock();
            if state.exec != ExecState::Dead {
                state.exec = ExecState::Running;
            }
            state.pending.remove(PendingFlags::INTERRUPTED_BY_SIGNAL);
            (state.parked_on.take(), state.timeout.take())
        };
        // A timeout, kill, or signal wake leaves the waiter linked; a
        // normal wake already popped it.
        if let Some(queue) = stale_queue {
            let _ = queue.unwait(&self.waiter);
        }
        if let Some(tid) = stale_timer {
            let _ = timer::cancel(tid);
        }

        match kind {
            WAKE_NORMAL => Ok(()),
            WAKE_TIMED_OUT => Err(Status::TimedOut),
            WAKE_CANCELLED => Err(Status::Cancelled),
            WAKE_SIGNALLED => Err(Status::Signalled),
            _ => Err(Status::Aborted),
        }
    }

    /// Sets the wake slot if the thread is parked and nobody else won the
    /// race. Returns `true` if this call is the one that woke the thread.
    fn wake(self: &Arc<Self>, kind: u8) -> bool {
        {
            let state = self.state.lock();
            // Only a parked thread can be woken; anything else is a stale
            // callback racing with unpark bookkeeping.
            if state.exec != ExecState::Suspended || state.parked_on.is_none() {
                return false;
            }
            if self
                .wake_slot
                .compare_exchange(WAKE_NONE, kind, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                return false;
            }
        }
        self.manager.resume(self);
        true
    }

    fn wake_from_timeout(self: &Arc<Self>) {
        self.wake(WAKE_TIMED_OUT);
    }

    /// Wakes the thread as preempted-by-signal: the wait returns
    /// [`Status::Signalled`] without consuming the awaited event.
    pub fn signal(self: &Arc<Self>) -> bool {
        {
            let mut state = self.state.lock();
            if state.exec == ExecState::Dead {
                return false;
            }
            state.pending.insert(PendingFlags::INTERRUPTED_BY_SIGNAL);
        }
        self.wake(WAKE_SIGNALLED)
    }

    // -- suspension and death ----------------------------------------------

    /// Requests that the thread stop running.
    ///
    /// If the thread is parked this is a no-op (it is already suspended);
    /// if it is running somewhere its manager preempts it.
    pub fn suspend(self: &Arc<Self>) -> KResult<()> {
        let running = {
            let mut state = self.state.lock();
            match state.exec {
                ExecState::Dead => return Err(Status::PermanentOutage),
                ExecState::Suspended => false,
                ExecState::Running | ExecState::Interrupted => {
                    state.pending.insert(PendingFlags::SUSPEND);
                    true
                }
            }
        };
        if running {
            self.manager.suspend(self);
        }
        Ok(())
    }

    /// Makes a suspended thread runnable again.
    pub fn resume(self: &Arc<Self>) -> KResult<()> {
        {
            let mut state = self.state.lock();
            match state.exec {
                ExecState::Dead => return Err(Status::PermanentOutage),
                ExecState::Suspended if state.parked_on.is_some() => {
                    // Parked on a queue: resuming would forge a wake.
                    return Err(Status::AlreadyInProgress);
                }
                ExecState::Suspended => {
                    state.exec = ExecState::Running;
                }
                ExecState::Running | ExecState::Interrupted => {
                    state.pending.remove(PendingFlags::SUSPEND);
                    state.pending.insert(PendingFlags::RESUME);
                }
            }
        }
        self.manager.resume(self);
        Ok(())
    }

    /// Requests asynchronous termination.
    ///
    /// Returns `Ok(())` if this call set the die-pending flag and
    /// [`Status::AlreadyInProgress`] if a kill was already underway. The
    /// thread will not execute further user instructions, but may still
    /// run short kernel teardown.
    pub fn kill(self: &Arc<Self>) -> KResult<()> {
        let (was_parked, queue, timeout) = {
            let mut state = self.state.lock();
            if state.pending.contains(PendingFlags::DIE) || state.exec == ExecState::Dead {
                return Err(Status::AlreadyInProgress);
            }
            state.pending.insert(PendingFlags::DIE);
            let was_parked = state.exec == ExecState::Suspended && state.parked_on.is_some();
            (was_parked, state.parked_on.clone(), state.timeout.take())
        };

        if let Some(tid) = timeout {
            let _ = timer::cancel(tid);
        }
        if was_parked {
            if self
                .wake_slot
                .compare_exchange(WAKE_NONE, WAKE_CANCELLED, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                if let Some(queue) = queue {
                    let _ = queue.unwait(&self.waiter);
                }
                self.manager.resume(self);
            }
        } else {
            // Running somewhere: the manager preempts it and the scheduler
            // reaps on its next pass.
            self.manager.suspend(self);
        }
        Ok(())
    }

    /// Marks interrupt entry on the CPU currently running this thread.
    pub fn interrupt_start(&self) {
        let mut state = self.state.lock();
        debug_assert_eq!(state.exec, ExecState::Running);
        state.exec = ExecState::Interrupted;
    }

    /// Marks interrupt exit.
    pub fn interrupt_end(&self) {
        let mut state = self.state.lock();
        debug_assert_eq!(state.exec, ExecState::Interrupted);
        state.exec = ExecState::Running;
    }

    /// Finishes a kill: marks the thread dead, unregisters it, and fires
    /// the death wait queue.
    ///
    /// Runs on the scheduler's stack (never the dying thread's own).
    pub fn reap(self: &Arc<Self>) {
        {
            let mut state = self.state.lock();
            debug_assert_ne!(state.exec, ExecState::Dead, "thread reaped twice");
            state.exec = ExecState::Dead;
            state.parked_on = None;
        }
        THREADS.lock().remove(&self.id.as_raw());
        self.death_waitq.wake_all();
    }
}

impl Drop for Thread {
    fn drop(&mut self) {
        // Last reference gone: subscribers waiting for reclamation run now.
        self.destroy_waitq.wake_all();
    }
}

impl core::fmt::Debug for Thread {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Thread")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("exec", &self.exec_state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn spawn_thread(name: &'static str) -> Arc<Thread> {
        Thread::new(name, &SPIN_MANAGER, None)
    }

    #[test]
    fn new_thread_is_suspended_and_looked_up() {
        let thread = spawn_thread("lookup");
        assert_eq!(thread.exec_state(), ExecState::Suspended);
        assert!(lookup(thread.id()).is_some());
    }

    #[test]
    fn wait_and_wake_roundtrip() {
        let thread = spawn_thread("roundtrip");
        let queue = WaitQueue::new();

        let waker = {
            let queue = queue.clone();
            std::thread::spawn(move || {
                // Wait for the waiter to park, then wake it.
                while queue.is_empty() {
                    std::thread::yield_now();
                }
                assert!(queue.wake_one());
            })
        };

        assert_eq!(thread.wait_on(&queue, None), Ok(()));
        assert_eq!(thread.exec_state(), ExecState::Running);
        waker.join().unwrap();
    }

    #[test]
    fn atomic_park_prevents_lost_wakeup() {
        // The wake fires between the condition check and the park; the
        // locked-guard pattern must still deliver it.
        let thread = spawn_thread("no-lost-wake");
        let queue = WaitQueue::new();

        let guard = queue.locked();
        let waker = {
            let queue = queue.clone();
            std::thread::spawn(move || {
                // This wake can only run once the parker released the lock
                // with itself enqueued.
                while !queue.wake_one() {
                    std::thread::yield_now();
                }
            })
        };
        assert_eq!(thread.wait_on_locked(&queue, guard, None), Ok(()));
        waker.join().unwrap();
    }

    #[test]
    fn kill_while_parked_returns_cancelled() {
        // Literal scenario: T1 parks; T2 kills it; T1's wait returns
        // cancelled; the death waitq wakes its subscribers.
        let thread = spawn_thread("killed");
        let queue = WaitQueue::new();

        static DEATH_SEEN: AtomicUsize = AtomicUsize::new(0);
        fn on_death(_context: usize) {
            DEATH_SEEN.fetch_add(1, Ordering::SeqCst);
        }
        let subscriber = Waiter::new(on_death, 0);
        thread.death_waitq().wait(&subscriber).unwrap();

        let killer = {
            let thread = thread.clone();
            let queue = queue.clone();
            std::thread::spawn(move || {
                while queue.is_empty() {
                    std::thread::yield_now();
                }
                assert_eq!(thread.kill(), Ok(()));
                // Second kill is redundant.
                assert_eq!(thread.kill().unwrap_err(), Status::AlreadyInProgress);
            })
        };

        assert_eq!(thread.wait_on(&queue, None).unwrap_err(), Status::Cancelled);
        killer.join().unwrap();

        // Scheduler exit path.
        thread.reap();
        assert_eq!(thread.exec_state(), ExecState::Dead);
        assert_eq!(DEATH_SEEN.load(Ordering::SeqCst), 1);
        assert!(lookup(thread.id()).is_none());

        // No further waits are possible.
        assert_eq!(
            thread.wait_on(&queue, None).unwrap_err(),
            Status::Cancelled
        );
    }

    #[test]
    fn signal_wakes_without_consuming() {
        let thread = spawn_thread("signalled");
        let queue = WaitQueue::new();

        let signaller = {
            let thread = thread.clone();
            let queue = queue.clone();
            std::thread::spawn(move || {
                while queue.is_empty() {
                    std::thread::yield_now();
                }
                while !thread.signal() {
                    std::thread::yield_now();
                }
            })
        };

        assert_eq!(thread.wait_on(&queue, None).unwrap_err(), Status::Signalled);
        signaller.join().unwrap();
        // The waiter was unlinked; the queue is reusable and empty.
        assert!(queue.is_empty());
    }

    #[test]
    fn wait_timeout_fires() {
        use crate::timer::testing;
        let _serial = crate::test_sync::lock();
        testing::install_fake_backend();
        testing::FAKE_NOW.store(0, Ordering::SeqCst);

        let thread = spawn_thread("timed-out");
        let queue = WaitQueue::new();

        let ticker = {
            let queue = queue.clone();
            std::thread::spawn(move || {
                while queue.is_empty() {
                    std::thread::yield_now();
                }
                testing::FAKE_NOW.store(2_000_000, Ordering::SeqCst);
                crate::timer::on_interrupt();
            })
        };

        assert_eq!(
            thread.wait_on(&queue, Some(1_000_000)).unwrap_err(),
            Status::TimedOut
        );
        ticker.join().unwrap();
        // The timed-out waiter was unlinked from the queue.
        assert!(queue.is_empty());
        testing::FAKE_NOW.store(0, Ordering::SeqCst);
    }

    #[test]
    fn wake_and_timeout_race_has_one_winner() {
        let thread = spawn_thread("race");
        let queue = WaitQueue::new();

        for _ in 0..20 {
            let waker = {
                let queue = queue.clone();
                let thread = thread.clone();
                std::thread::spawn(move || {
                    while queue.is_empty() {
                        std::thread::yield_now();
                    }
                    // Normal wake races the direct timeout wake below.
                    queue.wake_one();
                    thread.wake_from_timeout();
                })
            };
            let result = thread.wait_on(&queue, None);
            assert!(
                result == Ok(()) || result == Err(Status::TimedOut),
                "unexpected wake outcome: {result:?}"
            );
            waker.join().unwrap();
            assert!(queue.is_empty());
        }
    }

    #[test]
    fn suspend_resume_running_state() {
        let thread = spawn_thread("suspend");
        // A fresh thread is suspended; resuming marks it running.
        thread.resume().unwrap();
        assert_eq!(thread.exec_state(), ExecState::Running);

        thread.interrupt_start();
        assert_eq!(thread.exec_state(), ExecState::Interrupted);
        thread.interrupt_end();
        assert_eq!(thread.exec_state(), ExecState::Running);
    }

    #[test]
    fn resume_of_parked_thread_is_rejected() {
        let thread = spawn_thread("parked-resume");
        let queue = WaitQueue::new();

        let resumer = {
            let thread = thread.clone();
            let queue = queue.clone();
            std::thread::spawn(move || {
                while queue.is_empty() {
                    std::thread::yield_now();
                }
                // A bare resume must not forge a wakeup.
                assert_eq!(thread.resume().unwrap_err(), Status::AlreadyInProgress);
                queue.wake_one();
            })
        };
        assert_eq!(thread.wait_on(&queue, None), Ok(()));
        resumer.join().unwrap();
    }

    #[test]
    fn destroy_waitq_fires_on_drop() {
        static DESTROYED: AtomicUsize = AtomicUsize::new(0);
        fn on_destroy(_context: usize) {
            DESTROYED.fetch_add(1, Ordering::SeqCst);
        }

        let thread = spawn_thread("destroyed");
        let subscriber = Waiter::new(on_destroy, 0);
        thread.destroy_waitq().wait(&subscriber).unwrap();
        thread.reap();
        assert_eq!(DESTROYED.load(Ordering::SeqCst), 0);
        drop(thread);
        assert_eq!(DESTROYED.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn many_waiters_wake_in_fifo_order() {
        let queue = WaitQueue::new();
        let results: Arc<SpinLock<Vec<u64>>> = Arc::new(SpinLock::new(Vec::new()));

        let mut handles = Vec::new();
        for i in 0..8u64 {
            let queue = queue.clone();
            let results = results.clone();
            handles.push(std::thread::spawn(move || {
                let me = Thread::new("fifo", &SPIN_MANAGER, None);
                // Stagger the parks so arrival order is deterministic.
                while queue.len() < i as usize {
                    std::thread::yield_now();
                }
                me.wait_on(&queue, None).unwrap();
                results.lock().push(i);
            }));
        }

        while queue.len() < 8 {
            std::thread::yield_now();
        }
        for woken in 1..=8 {
            assert!(queue.wake_one());
            // Wait for the woken thread to record itself before waking the
            // next one, so the recorded order is the wake order.
            let deadline = std::time::Instant::now() + Duration::from_secs(5);
            while results.lock().len() < woken {
                assert!(std::time::Instant::now() < deadline, "waiter never woke");
                std::thread::yield_now();
            }
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(*results.lock(), vec![0, 1, 2, 3, 4, 5, 6, 7]);
    }
}
