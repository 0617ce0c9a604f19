//! Kernel-mediated wait-on-address.
//!
//! Futexes are keyed on (physical address, channel tag): using the
//! physical address means a word in shared memory resolves to the same
//! futex from every process mapping it. Each process owns a [`FutexTable`]
//! of lazily created entries.
//!
//! The no-lost-wakeup contract: [`FutexTable::wait`] rereads the word
//! under the futex's wait-queue lock before parking and bails with
//! `should-restart` on a mismatch; a waker that writes the word and then
//! calls [`FutexTable::wake`] therefore either changes the value before
//! the reread or wakes the parked waiter.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;

use anillo_core::addr::PhysAddr;
use anillo_core::status::{KResult, Status};
use anillo_core::sync::SpinLock;
use anillo_sched::thread::Thread;
use anillo_sched::waitq::WaitQueue;

/// A single wait-on-address entry.
pub struct Futex {
    waiters: WaitQueue,
}

impl Futex {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            waiters: WaitQueue::new(),
        })
    }

    /// The wait queue woken when the watched word changes.
    pub fn waitq(&self) -> &WaitQueue {
        &self.waiters
    }
}

/// Per-process table of futexes keyed on (physical address, channel tag).
pub struct FutexTable {
    entries: SpinLock<BTreeMap<(u64, u64), Arc<Futex>>>,
}

impl Default for FutexTable {
    fn default() -> Self {
        Self::new()
    }
}

impl FutexTable {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self {
            entries: SpinLock::new(BTreeMap::new()),
        }
    }

    /// Returns the futex for (`phys`, `channel`), creating it on first
    /// use.
    pub fn lookup_or_create(&self, phys: PhysAddr, channel: u64) -> Arc<Futex> {
        let mut entries = self.entries.lock();
        entries
            .entry((phys.as_u64(), channel))
            .or_insert_with(Futex::new)
            .clone()
    }

    /// Returns the futex for (`phys`, `channel`) if one exists.
    pub fn lookup(&self, phys: PhysAddr, channel: u64) -> Option<Arc<Futex>> {
        self.entries.lock().get(&(phys.as_u64(), channel)).cloned()
    }

    /// Parks `thread` until the word at `phys` is woken.
    ///
    /// `read_word` must read the current value of the watched word (the
    /// caller owns the translation and mapping of the user address). If
    /// the value no longer equals `expected` at park time, returns
    /// [`Status::ShouldRestart`] without parking. Timeouts, kills, and
    /// signals surface as `timed-out`, `cancelled`, and `signalled`.
    pub fn wait(
        &self,
        thread: &Arc<Thread>,
        phys: PhysAddr,
        channel: u64,
        expected: u64,
        read_word: &dyn Fn() -> u64,
        timeout_ns: Option<u64>,
    ) -> KResult<()> {
        let futex = self.lookup_or_create(phys, channel);
        // Atomic reread under the wait-queue lock: a waker that stores a
        // new value and then wakes cannot slip between check and park.
        let guard = futex.waiters.locked();
        if read_word() != expected {
            return Err(Status::ShouldRestart);
        }
        thread.wait_on_locked(&futex.waiters, guard, timeout_ns)
    }

    /// Wakes up to `count` waiters of (`phys`, `channel`).
    ///
    /// Returns the number actually woken.
    pub fn wake(&self, phys: PhysAddr, channel: u64, count: usize) -> usize {
        let Some(futex) = self.lookup(phys, channel) else {
            return 0;
        };
        let mut woken = 0;
        while woken < count && futex.waiters.wake_one() {
            woken += 1;
        }
        // Entries with no parked waiters are dropped; the next wait
        // recreates them.
        if futex.waiters.is_empty() {
            self.entries.lock().remove(&(phys.as_u64(), channel));
        }
        woken
    }

    /// Number of live futex entries (diagnostics).
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Returns `true` if no futexes exist.
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}
