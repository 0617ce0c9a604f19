//! Kernel work items.
//!
//! A [`Worker`] wraps a function and a context word. Scheduling appends it
//! to the per-CPU worker queue with the smallest backlog; a dedicated
//! worker thread per CPU dequeues and runs items. Cancellation is
//! accepted only while the item is still queued.

use alloc::collections::VecDeque;
use alloc::sync::Arc;
use core::sync::atomic::{AtomicU8, Ordering};

use anillo_core::cpu_local::{CpuLocal, MAX_CPUS, cpu_count, current_cpu_id};
use anillo_core::id::CpuId;
use anillo_core::status::{KResult, Status};
use anillo_core::sync::{IrqSpinLock, SpinLock};

use crate::thread::Thread;
use crate::waitq::WaitQueue;

/// A work item body.
pub type WorkFn = fn(usize);

const STATE_IDLE: u8 = 0;
const STATE_QUEUED: u8 = 1;
const STATE_RUNNING: u8 = 2;
const STATE_DONE: u8 = 3;
const STATE_CANCELLED: u8 = 4;

/// A schedulable unit of deferred kernel work.
pub struct Worker {
    func: WorkFn,
    context: usize,
    state: AtomicU8,
}

impl Worker {
    /// Creates a new idle worker.
    pub fn new(func: WorkFn, context: usize) -> Arc<Self> {
        Arc::new(Self {
            func,
            context,
            state: AtomicU8::new(STATE_IDLE),
        })
    }

    /// Returns `true` once the work has run to completion.
    pub fn is_done(&self) -> bool {
        self.state.load(Ordering::Acquire) == STATE_DONE
    }

    /// Returns `true` if the worker was cancelled before running.
    pub fn is_cancelled(&self) -> bool {
        self.state.load(Ordering::Acquire) == STATE_CANCELLED
    }
}

/// Per-CPU pending work.
static QUEUES: CpuLocal<IrqSpinLock<VecDeque<Arc<Worker>>>> =
    CpuLocal::new([const { IrqSpinLock::new(VecDeque::new()) }; MAX_CPUS]);

/// Per-CPU wakeup for the worker thread (created lazily).
static SIGNALS: CpuLocal<SpinLock<Option<WaitQueue>>> =
    CpuLocal::new([const { SpinLock::new(None) }; MAX_CPUS]);

fn signal_queue(cpu: CpuId) -> WaitQueue {
    let mut slot = SIGNALS.get_for(cpu).lock();
    slot.get_or_insert_with(WaitQueue::new).clone()
}

/// Enqueues a worker on the CPU with the smallest backlog.
///
/// Returns [`Status::AlreadyInProgress`] if the worker is already queued,
/// running, or finished without being re-armed.
pub fn schedule(worker: &Arc<Worker>) -> KResult<()> {
    if worker
        .state
        .compare_exchange(
            STATE_IDLE,
            STATE_QUEUED,
            Ordering::AcqRel,
            Ordering::Acquire,
        )
        .is_err()
    {
        return Err(Status::AlreadyInProgress);
    }

    let mut target = CpuId::BOOT;
    let mut best = usize::MAX;
    for cpu in 0..cpu_count() {
        let cpu = CpuId::new(cpu);
        let len = QUEUES.get_for(cpu).lock().len();
        if len < best {
            target = cpu;
            best = len;
        }
    }
    QUEUES.get_for(target).lock().push_back(worker.clone());
    signal_queue(target).wake_one();
    Ok(())
}

/// Cancels a queued worker.
///
/// Returns [`Status::AlreadyInProgress`] if the work has started (or
/// finished) and [`Status::NoSuchResource`] if it was never scheduled.
pub fn cancel(worker: &Arc<Worker>) -> KResult<()> {
    match worker.state.compare_exchange(
        STATE_QUEUED,
        STATE_CANCELLED,
        Ordering::AcqRel,
        Ordering::Acquire,
    ) {
        Ok(_) => Ok(()),
        Err(STATE_RUNNING) | Err(STATE_DONE) => Err(Status::AlreadyInProgress),
        Err(_) => Err(Status::NoSuchResource),
    }
}

/// Runs every pending worker on the current CPU. Returns the number run.
///
/// Called by the worker thread loop; tests call it directly.
pub fn drain_current_cpu() -> usize {
    let mut ran = 0;
    loop {
        let next = QUEUES.get().lock().pop_front();
        let Some(worker) = next else { break };
        if worker
            .state
            .compare_exchange(
                STATE_QUEUED,
                STATE_RUNNING,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            // Cancelled while queued; drop it.
            continue;
        }
        (worker.func)(worker.context);
        worker.state.store(STATE_DONE, Ordering::Release);
        ran += 1;
    }
    ran
}

/// Worker thread body: drain the queue, then park until new work arrives.
///
/// The kernel spawns one thread per CPU with this as its entry loop.
pub fn run_loop(thread: &Arc<Thread>) -> ! {
    let signals = signal_queue(current_cpu_id());
    loop {
        drain_current_cpu();
        // Atomic park: if work arrived after the drain, skip the sleep.
        let guard = signals.locked();
        if QUEUES.get().lock().is_empty() {
            let _ = thread.wait_on_locked(&signals, guard, None);
        }
    }
}
