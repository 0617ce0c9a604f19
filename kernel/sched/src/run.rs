//! Per-CPU scheduler.
//!
//! Each CPU owns a ready queue behind its own lock. A global bootstrap
//! queue collects threads created before the scheduler is up (their CPU
//! affinity is undecided). [`manage`] places a thread on the lightest
//! queue; load balancing happens only there — there is no work stealing,
//! so scheduling decisions stay CPU-local.
//!
//! Preemption points: the timer tick, voluntary [`yield_now`], blocking
//! waits (via the [`SchedManager`]'s `block_current`), and the
//! return-to-user path. The actual context switch and the idle halt are
//! architecture hooks registered at boot; the host defaults are no-ops so
//! the queue and state logic is testable without real switching.
//!
//! A dying thread is never torn down on its own stack: [`reschedule`]
//! parks it in a per-CPU reap slot and [`Thread::reap`] runs after the
//! switch, on the next thread's stack.

use alloc::collections::VecDeque;
use alloc::sync::Arc;
use core::sync::atomic::{AtomicBool, AtomicPtr, Ordering};

use anillo_core::cpu_local::{CpuLocal, MAX_CPUS, cpu_count, current_cpu_id};
use anillo_core::id::CpuId;
use anillo_core::sync::IrqSpinLock;

use crate::context::Context;
use crate::thread::{ExecState, Thread, ThreadManager};

/// Timeslice between preemption ticks: 10 ms.
pub const TIMESLICE_NS: u64 = 10_000_000;

// ---------------------------------------------------------------------------
// Architecture hooks
// ---------------------------------------------------------------------------

/// Saves the outgoing context and loads the incoming one.
pub type SwitchFn = fn(*mut Context, *const Context);

/// Prepares a fresh thread for its first switch-in (stack + entry).
pub type PrepareFn = fn(&Arc<Thread>);

fn nop_switch(_from: *mut Context, _to: *const Context) {}
fn nop_prepare(_thread: &Arc<Thread>) {}
fn nop_halt() {}
fn nop_kick(_cpu: CpuId) {}

static SWITCH_FN: AtomicPtr<()> = AtomicPtr::new(nop_switch as *mut ());
static PREPARE_FN: AtomicPtr<()> = AtomicPtr::new(nop_prepare as *mut ());
static HALT_FN: AtomicPtr<()> = AtomicPtr::new(nop_halt as *mut ());
static KICK_FN: AtomicPtr<()> = AtomicPtr::new(nop_kick as *mut ());

/// Registers the context-switch stub.
///
/// # Safety
///
/// The function must implement the [`Context`] save/restore contract.
pub unsafe fn register_switch(f: SwitchFn) {
    SWITCH_FN.store(f as *mut (), Ordering::Release);
}

/// Registers the fresh-thread preparation hook (stack allocation and
/// initial context seeding).
pub fn register_prepare(f: PrepareFn) {
    PREPARE_FN.store(f as *mut (), Ordering::Release);
}

/// Registers the idle halt ("wait for interrupt") instruction.
pub fn register_halt(f: fn()) {
    HALT_FN.store(f as *mut (), Ordering::Release);
}

/// Registers the cross-CPU preemption kick (IPI send).
pub fn register_kick(f: fn(CpuId)) {
    KICK_FN.store(f as *mut (), Ordering::Release);
}

fn arch_switch(from: *mut Context, to: *const Context) {
    let ptr = SWITCH_FN.load(Ordering::Acquire);
    // SAFETY: Only valid `SwitchFn` pointers are stored into SWITCH_FN.
    let f: SwitchFn = unsafe { core::mem::transmute(ptr) };
    f(from, to);
}

fn arch_prepare(thread: &Arc<Thread>) {
    let ptr = PREPARE_FN.load(Ordering::Acquire);
    // SAFETY: Only valid `PrepareFn` pointers are stored into PREPARE_FN.
    let f: PrepareFn = unsafe { core::mem::transmute(ptr) };
    f(thread);
}

fn arch_halt() {
    let ptr = HALT_FN.load(Ordering::Acquire);
    // SAFETY: Only valid `fn()` pointers are stored into HALT_FN.
    let f: fn() = unsafe { core::mem::transmute(ptr) };
    f();
}

fn arch_kick(cpu: CpuId) {
    let ptr = KICK_FN.load(Ordering::Acquire);
    // SAFETY: Only valid `fn(CpuId)` pointers are stored into KICK_FN.
    let f: fn(CpuId) = unsafe { core::mem::transmute(ptr) };
    f(cpu);
}

// ---------------------------------------------------------------------------
// Scheduler state
// ---------------------------------------------------------------------------

/// Per-CPU ready queues.
static READY: CpuLocal<IrqSpinLock<VecDeque<Arc<Thread>>>> =
    CpuLocal::new([const { IrqSpinLock::new(VecDeque::new()) }; MAX_CPUS]);

/// Per-CPU currently running thread.
static CURRENT: CpuLocal<IrqSpinLock<Option<Arc<Thread>>>> =
    CpuLocal::new([const { IrqSpinLock::new(None) }; MAX_CPUS]);

/// Per-CPU idle thread (runs when the ready queue is empty).
static IDLE: CpuLocal<IrqSpinLock<Option<Arc<Thread>>>> =
    CpuLocal::new([const { IrqSpinLock::new(None) }; MAX_CPUS]);

/// Per-CPU thread awaiting teardown on another stack.
static REAP_PENDING: CpuLocal<IrqSpinLock<Option<Arc<Thread>>>> =
    CpuLocal::new([const { IrqSpinLock::new(None) }; MAX_CPUS]);

/// Threads created before the scheduler started.
static BOOTSTRAP: IrqSpinLock<VecDeque<Arc<Thread>>> = IrqSpinLock::new(VecDeque::new());

static STARTED: AtomicBool = AtomicBool::new(false);

/// Manager routing thread transitions through the scheduler.
pub struct SchedManager;

/// The shared instance handed to scheduled threads.
pub static SCHED_MANAGER: SchedManager = SchedManager;

impl ThreadManager for SchedManager {
    fn resume(&self, thread: &Arc<Thread>) {
        enqueue_ready(thread.clone());
    }

    fn suspend(&self, thread: &Arc<Thread>) {
        // Running on some CPU: kick it so its next scheduler pass sees the
        // pending state. If it is this CPU, reschedule directly.
        if let Some(cpu) = thread.cpu() {
            if cpu == current_cpu_id() {
                reschedule();
            } else {
                arch_kick(cpu);
            }
        }
    }

    fn block_current(&self, _thread: &Arc<Thread>) {
        reschedule();
        // Without a real switch hook (host tests, pre-SMP boot) the switch
        // is a no-op; yield so the waker can make progress.
        #[cfg(test)]
        std::thread::yield_now();
        #[cfg(not(test))]
        core::hint::spin_loop();
    }
}

/// Idle loop body. Each CPU's idle thread runs this.
fn idle_entry(_arg: usize) {
    loop {
        arch_halt();
        reschedule();
    }
}

/// Starts the scheduler: creates one idle thread per online CPU and
/// drains the bootstrap queue onto the per-CPU ready queues.
pub fn start() {
    if STARTED.swap(true, Ordering::AcqRel) {
        return;
    }
    for cpu in 0..cpu_count() {
        let cpu = CpuId::new(cpu);
        let idle = Thread::new("idle", &SCHED_MANAGER, Some((idle_entry, 0)));
        idle.set_cpu(Some(cpu));
        arch_prepare(&idle);
        *IDLE.get_for(cpu).lock() = Some(idle);
    }
    loop {
        let thread = BOOTSTRAP.lock().pop_front();
        match thread {
            Some(thread) => manage(thread),
            None => break,
        }
    }
}

/// Returns `true` once [`start`] has run.
pub fn is_started() -> bool {
    STARTED.load(Ordering::Acquire)
}

/// Hands a thread to the scheduler.
///
/// Before [`start`] the thread parks on the bootstrap queue. Afterwards it
/// is prepared for its first run and placed on the ready queue with the
/// lightest load; this is the only point of load balancing.
pub fn manage(thread: Arc<Thread>) {
    if !is_started() {
        BOOTSTRAP.lock().push_back(thread);
        return;
    }
    arch_prepare(&thread);
    thread.mark_runnable();
    let target = lightest_cpu();
    thread.set_cpu(Some(target));
    READY.get_for(target).lock().push_back(thread);
}

/// Moves a woken thread back onto its CPU's ready queue.
fn enqueue_ready(thread: Arc<Thread>) {
    match thread.cpu() {
        Some(cpu) => READY.get_for(cpu).lock().push_back(thread),
        // Affinity undecided (woken before manage): balance now.
        None => manage(thread),
    }
}

/// Picks the online CPU with the shortest ready queue.
fn lightest_cpu() -> CpuId {
    let mut best = CpuId::BOOT;
    let mut best_len = usize::MAX;
    for cpu in 0..cpu_count() {
        let cpu = CpuId::new(cpu);
        let len = READY.get_for(cpu).lock().len();
        if len < best_len {
            best = cpu;
            best_len = len;
        }
    }
    best
}

/// Returns the thread currently running on this CPU.
pub fn current_thread() -> Option<Arc<Thread>> {
    CURRENT.get().lock().clone()
}

/// Returns the ready-queue length of a CPU (diagnostics and tests).
pub fn queue_len(cpu: CpuId) -> usize {
    READY.get_for(cpu).lock().len()
}

/// Timer-tick preemption point.
pub fn tick() {
    reschedule();
}

/// Voluntary yield.
pub fn yield_now() {
    reschedule();
}

/// Forces a specific running thread off its CPU and back onto its ready
/// queue.
pub fn preempt_thread(thread: &Arc<Thread>) {
    let Some(cpu) = thread.cpu() else { return };
    if cpu == current_cpu_id() {
        if current_thread().is_some_and(|current| current.id() == thread.id()) {
            reschedule();
        }
    } else {
        arch_kick(cpu);
    }
}

/// Core scheduling pass on the current CPU.
///
/// Puts the outgoing thread back on the ready queue (or into the reap
/// slot if it is dying, or nowhere if it blocked), picks the next ready
/// thread (the idle thread if none), and switches.
pub fn reschedule() {
    finish_reap();

    let cpu = current_cpu_id();
    let outgoing = CURRENT.get_for(cpu).lock().take();

    let outgoing_ctx = if let Some(out) = outgoing {
        // SAFETY: `out` is no longer CURRENT; only this CPU touches its
        // context until it is re-queued.
        let ctx = unsafe { out.context_ptr() };
        if out.is_dying() {
            *REAP_PENDING.get_for(cpu).lock() = Some(out);
        } else {
            match out.exec_state() {
                // Preempted while runnable: back of the ready queue.
                ExecState::Running | ExecState::Interrupted => {
                    READY.get_for(cpu).lock().push_back(out);
                }
                // Mid-wakeup (wake posted but not yet consumed): the wake
                // path already ran, so nobody else will requeue it.
                ExecState::Suspended if out.has_pending_wake() => {
                    READY.get_for(cpu).lock().push_back(out);
                }
                // Genuinely blocked or already dead: the wake path (or the
                // reaper) takes it from here.
                ExecState::Suspended | ExecState::Dead => {}
            }
        }
        ctx
    } else {
        core::ptr::null_mut()
    };

    let next = pick_next(cpu);
    let next_ctx = match &next {
        // SAFETY: `next` was just dequeued; nothing else runs it.
        Some(thread) => unsafe { thread.context_ptr() as *const Context },
        None => core::ptr::null(),
    };
    *CURRENT.get_for(cpu).lock() = next.clone();

    if !outgoing_ctx.is_null() && !next_ctx.is_null() && outgoing_ctx as *const _ != next_ctx {
        arch_switch(outgoing_ctx, next_ctx);
    }

    // Execution resumes here (possibly much later, on this thread's next
    // timeslice). Tear down whatever died while we were away.
    finish_reap();
}

/// Dequeues the next runnable thread, falling back to the idle thread.
fn pick_next(cpu: CpuId) -> Option<Arc<Thread>> {
    loop {
        let candidate = READY.get_for(cpu).lock().pop_front();
        match candidate {
            Some(thread) if thread.is_dying() => {
                thread.reap();
            }
            Some(thread) => return Some(thread),
            None => break,
        }
    }
    IDLE.get_for(cpu).lock().clone()
}

/// Runs the deferred teardown of a thread that died on this CPU.
fn finish_reap() {
    let dead = REAP_PENDING.get().lock().take();
    if let Some(thread) = dead {
        thread.reap();
    }
}
