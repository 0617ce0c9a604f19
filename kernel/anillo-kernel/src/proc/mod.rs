//! Process management.
//!
//! A process owns one address space, a descriptor table, a futex table,
//! and a list of attached threads. Threads reach their process through a
//! weak back-reference (held in a side table keyed by thread id), so the
//! process ↔ thread cycle cannot keep either alive: teardown severs the
//! backpointers before the process drops its own references.
//!
//! `kill` terminates every attached thread, releases the descriptors, and
//! tears the address space down. `detach` severs one thread's link
//! without terminating it — but only for threads that never attached a
//! user context, since a user thread cannot outlive its address space.

pub mod desc;

use alloc::collections::BTreeMap;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU8, AtomicU64, Ordering};

use anillo_core::id::{ProcessId, ThreadId};
use anillo_core::status::{KResult, Status};
use anillo_core::sync::SpinLock;
use anillo_ipc::futex::FutexTable;
use anillo_mm::FrameSource;
use anillo_mm::space::AddressSpace;
use anillo_sched::thread::Thread;
use anillo_sched::waitq::WaitQueue;

use crate::arch::KernelMapper;
use desc::DescriptorTable;

const STATE_ALIVE: u8 = 0;
const STATE_DYING: u8 = 1;
const STATE_DEAD: u8 = 2;

/// A process: an address space, a descriptor table, threads, futexes.
pub struct Process {
    id: ProcessId,
    space: Arc<AddressSpace<KernelMapper>>,
    descriptors: DescriptorTable,
    futexes: FutexTable,
    threads: SpinLock<Vec<ThreadId>>,
    state: AtomicU8,
    /// Woken when the process finishes dying.
    death_waitq: WaitQueue,
}

/// Global process table.
static PROCESSES: SpinLock<BTreeMap<u64, Arc<Process>>> = SpinLock::new(BTreeMap::new());

/// Thread → process weak back-references.
static THREAD_PROCESS: SpinLock<BTreeMap<u64, Weak<Process>>> = SpinLock::new(BTreeMap::new());

static NEXT_PROCESS_ID: AtomicU64 = AtomicU64::new(1);

impl Process {
    /// Creates and registers a new process around an address space.
    pub fn create(space: Arc<AddressSpace<KernelMapper>>) -> Arc<Self> {
        let id = ProcessId::new(NEXT_PROCESS_ID.fetch_add(1, Ordering::Relaxed));
        let process = Arc::new(Self {
            id,
            space,
            descriptors: DescriptorTable::new(),
            futexes: FutexTable::new(),
            threads: SpinLock::new(Vec::new()),
            state: AtomicU8::new(STATE_ALIVE),
            death_waitq: WaitQueue::new(),
        });
        PROCESSES.lock().insert(id.as_raw(), process.clone());
        process
    }

    /// Returns the process id.
    pub fn id(&self) -> ProcessId {
        self.id
    }

    /// The process's address space.
    pub fn space(&self) -> &Arc<AddressSpace<KernelMapper>> {
        &self.space
    }

    /// The process's descriptor table.
    pub fn descriptors(&self) -> &DescriptorTable {
        &self.descriptors
    }

    /// The process's futex table.
    pub fn futexes(&self) -> &FutexTable {
        &self.futexes
    }

    /// Woken when the process has been torn down.
    pub fn death_waitq(&self) -> &WaitQueue {
        &self.death_waitq
    }

    /// Returns `true` while the process accepts new threads and syscalls.
    pub fn is_alive(&self) -> bool {
        self.state.load(Ordering::Acquire) == STATE_ALIVE
    }

    /// Ids of the currently attached threads.
    pub fn thread_ids(&self) -> Vec<ThreadId> {
        self.threads.lock().clone()
    }

    /// Attaches a thread to this process.
    pub fn attach_thread(self: &Arc<Self>, thread: &Arc<Thread>) -> KResult<()> {
        if !self.is_alive() {
            return Err(Status::PermanentOutage);
        }
        let mut backrefs = THREAD_PROCESS.lock();
        if backrefs.contains_key(&thread.id().as_raw()) {
            return Err(Status::AlreadyInProgress);
        }
        backrefs.insert(thread.id().as_raw(), Arc::downgrade(self));
        drop(backrefs);
        self.threads.lock().push(thread.id());
        Ok(())
    }

    /// Severs a thread's link to this process without terminating it.
    ///
    /// The thread keeps running as a plain kernel thread. Threads that
    /// attached a user context are refused: a user thread cannot outlive
    /// its address space, so killing is the only way out for those.
    pub fn detach_thread(&self, thread: &Arc<Thread>) -> KResult<()> {
        if crate::uthread::for_thread(thread.id()).is_some() {
            return Err(Status::Forbidden);
        }
        let mut threads = self.threads.lock();
        let idx = threads
            .iter()
            .position(|&id| id == thread.id())
            .ok_or(Status::NoSuchResource)?;
        threads.remove(idx);
        drop(threads);
        THREAD_PROCESS.lock().remove(&thread.id().as_raw());
        Ok(())
    }

    /// Kills the process: terminates every attached thread, releases the
    /// descriptors, and tears the address space down.
    ///
    /// Returns [`Status::AlreadyInProgress`] if a kill is already
    /// underway.
    pub fn kill(self: &Arc<Self>, frames: &mut dyn FrameSource) -> KResult<()> {
        if self
            .state
            .compare_exchange(
                STATE_ALIVE,
                STATE_DYING,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return Err(Status::AlreadyInProgress);
        }

        // Sever the backpointers first, then terminate; a dying thread
        // must not resolve a half-dead process.
        let threads = core::mem::take(&mut *self.threads.lock());
        {
            let mut backrefs = THREAD_PROCESS.lock();
            for id in &threads {
                backrefs.remove(&id.as_raw());
            }
        }
        for id in threads {
            crate::uthread::unregister(id);
            if let Some(thread) = anillo_sched::thread::lookup(id) {
                // Already-dying threads are fine; the kill is idempotent.
                match thread.kill() {
                    Ok(()) | Err(Status::AlreadyInProgress) => {}
                    Err(err) => return Err(err),
                }
            }
        }

        self.descriptors.clear();
        self.space.tear_down(frames);

        self.state.store(STATE_DEAD, Ordering::Release);
        PROCESSES.lock().remove(&self.id.as_raw());
        self.death_waitq.wake_all();
        Ok(())
    }
}

impl core::fmt::Debug for Process {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Process")
            .field("id", &self.id)
            .field("threads", &self.threads.lock().len())
            .finish()
    }
}

/// Looks up a live process by id.
pub fn lookup(id: ProcessId) -> Option<Arc<Process>> {
    PROCESSES.lock().get(&id.as_raw()).cloned()
}

/// Resolves the process a thread belongs to.
pub fn process_of(thread: ThreadId) -> Option<Arc<Process>> {
    THREAD_PROCESS
        .lock()
        .get(&thread.as_raw())
        .and_then(|weak| weak.upgrade())
}
