//! One-shot kernel timers.
//!
//! Each CPU keeps a min-heap of pending timers keyed on an absolute
//! deadline (backend timestamp at arming time plus the requested delay).
//! The hardware backend is armed for exactly one fire: the earliest
//! pending deadline. When it fires, [`on_interrupt`] pops and runs every
//! expired timer, then re-arms for the next earliest. A backend that fires
//! early is harmless: nothing expires and the heap is simply re-armed for
//! the remaining delay.
//!
//! Cancellation is best-effort: the entry is flagged disabled and skipped
//! when its deadline arrives.

use alloc::collections::{BTreeMap, BinaryHeap};
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::cmp::{Ordering as CmpOrdering, Reverse};
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use anillo_core::cpu_local::{CpuLocal, MAX_CPUS};
use anillo_core::id::TimerId;
use anillo_core::status::{KResult, Status};
use anillo_core::sync::IrqSpinLock;

/// A timer callback. Runs from the timer interrupt path; must not block.
pub type TimerFn = fn(usize);

/// Architecture hooks for the hardware timer.
#[derive(Clone, Copy)]
pub struct TimerBackendOps {
    /// Returns the current monotonic timestamp in nanoseconds.
    pub now_ns: fn() -> u64,
    /// Schedules a single hardware fire at the given absolute deadline.
    pub arm: fn(u64),
    /// Cancels any scheduled hardware fire.
    pub disarm: fn(),
}

fn null_now() -> u64 {
    0
}
fn null_arm(_deadline: u64) {}
fn null_disarm() {}

static NOW_FN: core::sync::atomic::AtomicPtr<()> =
    core::sync::atomic::AtomicPtr::new(null_now as *mut ());
static ARM_FN: core::sync::atomic::AtomicPtr<()> =
    core::sync::atomic::AtomicPtr::new(null_arm as *mut ());
static DISARM_FN: core::sync::atomic::AtomicPtr<()> =
    core::sync::atomic::AtomicPtr::new(null_disarm as *mut ());

/// Registers the hardware timer backend.
///
/// # Safety
///
/// All three functions must be safe to call from any context, including
/// the timer interrupt itself.
pub unsafe fn register_backend(ops: TimerBackendOps) {
    NOW_FN.store(ops.now_ns as *mut (), Ordering::Release);
    ARM_FN.store(ops.arm as *mut (), Ordering::Release);
    DISARM_FN.store(ops.disarm as *mut (), Ordering::Release);
}

/// Returns the backend's current timestamp.
pub fn now_ns() -> u64 {
    let ptr = NOW_FN.load(Ordering::Acquire);
    // SAFETY: Only valid `fn() -> u64` pointers are stored into NOW_FN.
    let f: fn() -> u64 = unsafe { core::mem::transmute(ptr) };
    f()
}

fn backend_arm(deadline: u64) {
    let ptr = ARM_FN.load(Ordering::Acquire);
    // SAFETY: Only valid `fn(u64)` pointers are stored into ARM_FN.
    let f: fn(u64) = unsafe { core::mem::transmute(ptr) };
    f(deadline);
}

fn backend_disarm() {
    let ptr = DISARM_FN.load(Ordering::Acquire);
    // SAFETY: Only valid `fn()` pointers are stored into DISARM_FN.
    let f: fn() = unsafe { core::mem::transmute(ptr) };
    f();
}

struct TimerEntry {
    deadline: u64,
    id: TimerId,
    callback: TimerFn,
    context: usize,
    disabled: Arc<AtomicBool>,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.id == other.id
    }
}

impl Eq for TimerEntry {}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.deadline
            .cmp(&other.deadline)
            .then(self.id.cmp(&other.id))
    }
}

#[derive(Default)]
struct TimerCpu {
    heap: BinaryHeap<Reverse<TimerEntry>>,
    cancel_flags: BTreeMap<TimerId, Arc<AtomicBool>>,
}

/// Per-CPU pending timers.
static QUEUES: CpuLocal<IrqSpinLock<TimerCpu>> = CpuLocal::new(
    [const {
        IrqSpinLock::new(TimerCpu {
            heap: BinaryHeap::new(),
            cancel_flags: BTreeMap::new(),
        })
    }; MAX_CPUS],
);

static NEXT_TIMER_ID: AtomicU64 = AtomicU64::new(1);

/// Schedules `callback(context)` to run after `delay_ns` on the current
/// CPU.
pub fn oneshot(delay_ns: u64, callback: TimerFn, context: usize) -> TimerId {
    let id = TimerId::new(NEXT_TIMER_ID.fetch_add(1, Ordering::Relaxed));
    let deadline = now_ns().saturating_add(delay_ns);
    let disabled = Arc::new(AtomicBool::new(false));

    let mut queue = QUEUES.get().lock();
    let was_earliest = queue
        .heap
        .peek()
        .map(|Reverse(e)| deadline < e.deadline)
        .unwrap_or(true);
    queue.cancel_flags.insert(id, disabled.clone());
    queue.heap.push(Reverse(TimerEntry {
        deadline,
        id,
        callback,
        context,
        disabled,
    }));
    drop(queue);

    if was_earliest {
        backend_arm(deadline);
    }
    id
}

/// Cancels a pending timer, best-effort.
///
/// Returns [`Status::NoSuchResource`] if the timer has already fired (or
/// was already cancelled) on every online CPU.
pub fn cancel(id: TimerId) -> KResult<()> {
    for (_cpu, queue) in QUEUES.iter_online() {
        let mut queue = queue.lock();
        if let Some(flag) = queue.cancel_flags.remove(&id) {
            flag.store(true, Ordering::Release);
            return Ok(());
        }
    }
    Err(Status::NoSuchResource)
}

/// Handles a hardware timer fire on the current CPU.
///
/// Pops every expired entry, invokes the live callbacks outside the queue
/// lock, and re-arms the backend for the next earliest deadline.
pub fn on_interrupt() {
    let now = now_ns();
    let mut expired: Vec<TimerEntry> = Vec::new();

    {
        let mut queue = QUEUES.get().lock();
        while let Some(Reverse(head)) = queue.heap.peek() {
            if head.deadline > now {
                break;
            }
            let Reverse(entry) = queue.heap.pop().unwrap();
            queue.cancel_flags.remove(&entry.id);
            if !entry.disabled.load(Ordering::Acquire) {
                expired.push(entry);
            }
        }
        match queue.heap.peek() {
            // The backend fired early or more timers remain: re-arm for
            // the remaining delay.
            Some(Reverse(next)) => backend_arm(next.deadline),
            None => backend_disarm(),
        }
    }

    for entry in expired {
        (entry.callback)(entry.context);
    }
}

/// Returns the number of live (not cancelled) timers on the current CPU.
pub fn pending() -> usize {
    QUEUES.get().lock().cancel_flags.len()
}

/// Returns the earliest live deadline on the current CPU.
pub fn next_deadline() -> Option<u64> {
    let queue = QUEUES.get().lock();
    queue
        .heap
        .iter()
        .filter(|Reverse(e)| !e.disabled.load(Ordering::Acquire))
        .map(|Reverse(e)| e.deadline)
        .min()
}

/// Shared manual clock for this crate's tests.
///
/// The timer queue and backend registration are process-global, so every
/// test touching them (here and in `thread.rs`) serializes through
/// `test_sync::lock()` and installs this one fake backend.
#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    pub(crate) static FAKE_NOW: AtomicU64 = AtomicU64::new(0);
    pub(crate) static LAST_ARMED: AtomicU64 = AtomicU64::new(0);
    pub(crate) static DISARMED: AtomicBool = AtomicBool::new(false);

    fn fake_now() -> u64 {
        FAKE_NOW.load(Ordering::SeqCst)
    }
    fn fake_arm(deadline: u64) {
        DISARMED.store(false, Ordering::SeqCst);
        LAST_ARMED.store(deadline, Ordering::SeqCst);
    }
    fn fake_disarm() {
        DISARMED.store(true, Ordering::SeqCst);
    }

    pub(crate) fn install_fake_backend() {
        // SAFETY: The fake functions only touch atomics.
        unsafe {
            register_backend(TimerBackendOps {
                now_ns: fake_now,
                arm: fake_arm,
                disarm: fake_disarm,
            });
        }
    }
}
