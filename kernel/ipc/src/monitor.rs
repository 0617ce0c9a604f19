//! Readiness monitors.
//!
//! A [`Monitor`] multiplexes events from channels, futexes, and one-shot
//! timeouts to a single polling thread. Each item watches one source:
//! level-triggered items report whenever the source reads high at poll
//! time; edge-triggered items latch transitions (observed through wait
//! queue hooks on the source) and clear on poll consumption. `ACTIVE_LOW`
//! inverts polarity. Items can disable or delete themselves after firing,
//! and `KEEP_ALIVE` items survive a monitor close.
//!
//! Futex and timeout items have no meaningful level; they always behave
//! edge-triggered.
//!
//! Internally a counting semaphore tracks "something may have triggered":
//! source hooks up it, pollers down it. The semaphore may run ahead of the
//! actual triggered set, so [`Monitor::poll`] loops — a spurious wakeup
//! just re-collects and parks again.

use alloc::collections::BTreeMap;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use anillo_core::id::TimerId;
use anillo_core::status::{KResult, Status};
use anillo_core::sync::SpinLock;
use anillo_sched::sem::Semaphore;
use anillo_sched::thread::Thread;
use anillo_sched::timer;
use anillo_sched::waitq::{WaitQueue, Waiter};

use crate::channel::Channel;
use crate::futex::Futex;

bitflags::bitflags! {
    /// Events a monitor item can report.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MonitorEvents: u32 {
        /// A message arrived on the watched channel half.
        const MESSAGE_ARRIVED = 1 << 0;
        /// Space is available to send toward the peer.
        const QUEUE_SPACE_AVAILABLE = 1 << 1;
        /// The peer's queue has fully drained.
        const PEER_QUEUE_EMPTIED = 1 << 2;
        /// The peer half closed.
        const PEER_CLOSED = 1 << 3;
        /// The peer can enqueue toward this half again.
        const PEER_QUEUE_SPACE_AVAILABLE = 1 << 4;
        /// The watched half itself closed.
        const CLOSED = 1 << 5;
        /// The watched futex was woken (value change).
        const FUTEX_WOKEN = 1 << 6;
        /// The item's one-shot timeout fired.
        const TIMEOUT = 1 << 7;
    }
}

bitflags::bitflags! {
    /// Per-item behavior flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ItemFlags: u32 {
        /// Latch transitions instead of reporting levels.
        const EDGE_TRIGGERED = 1 << 0;
        /// Invert polarity: report when the source reads low.
        const ACTIVE_LOW = 1 << 1;
        /// Disable the item after it fires once.
        const DISABLE_ON_TRIGGER = 1 << 2;
        /// Remove the item after it fires once.
        const DELETE_ON_TRIGGER = 1 << 3;
        /// Keep the item when the monitor closes.
        const KEEP_ALIVE = 1 << 4;
    }
}

/// What a monitor item watches.
pub enum MonitorTarget {
    /// A channel half, filtered to the given event set.
    Channel {
        /// The watched half.
        channel: Arc<Channel>,
        /// Which of its events this item reports.
        events: MonitorEvents,
    },
    /// A futex; reports [`MonitorEvents::FUTEX_WOKEN`].
    Futex {
        /// The watched futex.
        futex: Arc<Futex>,
    },
    /// A one-shot timeout; reports [`MonitorEvents::TIMEOUT`].
    Timeout {
        /// Delay until the fire, in nanoseconds.
        delay_ns: u64,
    },
}

/// One reported readiness event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ItemEvent {
    /// The item that fired.
    pub item: u64,
    /// The events observed.
    pub events: MonitorEvents,
}

struct MonitorItem {
    id: u64,
    target: MonitorTarget,
    flags: ItemFlags,
    enabled: AtomicBool,
    /// Latched edge events (bits of [`MonitorEvents`]).
    pending: AtomicU32,
    monitor: Weak<Monitor>,
    /// Wait-queue hooks: (queue, waiter) pairs parked on the source.
    hooks: SpinLock<Vec<(WaitQueue, Arc<Waiter>)>>,
    /// Pending timer for timeout items.
    timer: SpinLock<Option<TimerId>>,
}

/// Registry resolving hook-callback contexts back to items.
static ITEM_REGISTRY: SpinLock<BTreeMap<u64, Weak<MonitorItem>>> = SpinLock::new(BTreeMap::new());

static NEXT_ITEM_ID: AtomicU64 = AtomicU64::new(1);

/// Packs (item id, event bit index) into a hook context word.
fn pack_hook_context(id: u64, event: MonitorEvents) -> usize {
    ((id as usize) << 8) | event.bits().trailing_zeros() as usize
}

/// Source hook callback: latches the event and nudges the monitor.
///
/// Runs from wake paths, so it only does flag work, wait-queue
/// re-enqueues, and a semaphore up.
fn item_hook(context: usize) {
    let id = (context >> 8) as u64;
    let event = MonitorEvents::from_bits_truncate(1 << (context & 0xFF));
    let item = {
        let registry = ITEM_REGISTRY.lock();
        registry.get(&id).and_then(|weak| weak.upgrade())
    };
    let Some(item) = item else { return };

    // Verify the event is actually observable right now; wait queues fan
    // out wakes broadly and a latch without a real transition would report
    // phantom edges.
    if item.event_is_high(event) {
        item.pending.fetch_or(event.bits(), Ordering::AcqRel);
        if item.enabled.load(Ordering::Acquire) {
            if let Some(monitor) = item.monitor.upgrade() {
                monitor.triggered.up();
            }
        }
    }

    // Persistent hooks re-arm themselves for the next transition.
    let hooks = item.hooks.lock();
    for (queue, waiter) in hooks.iter() {
        if !waiter.is_queued() {
            let _ = queue.wait(waiter);
        }
    }
}

impl MonitorItem {
    /// Whether `event` currently reads high (polarity-adjusted).
    fn event_is_high(&self, event: MonitorEvents) -> bool {
        let raw = match &self.target {
            MonitorTarget::Channel { channel, .. } => match event {
                MonitorEvents::MESSAGE_ARRIVED => channel.queued_messages() > 0,
                MonitorEvents::QUEUE_SPACE_AVAILABLE => {
                    channel.peer().is_some_and(|peer| peer.has_queue_space())
                }
                MonitorEvents::PEER_QUEUE_EMPTIED => {
                    channel.peer().is_some_and(|peer| peer.queued_messages() == 0)
                }
                MonitorEvents::PEER_CLOSED => channel.peer_gone_or_closed(),
                MonitorEvents::PEER_QUEUE_SPACE_AVAILABLE => channel.has_queue_space(),
                MonitorEvents::CLOSED => channel.is_closed(),
                _ => false,
            },
            // No level exists; hooks latch unconditionally.
            MonitorTarget::Futex { .. } => event == MonitorEvents::FUTEX_WOKEN,
            MonitorTarget::Timeout { .. } => event == MonitorEvents::TIMEOUT,
        };
        raw != self.flags.contains(ItemFlags::ACTIVE_LOW)
    }

    /// Computes the level-mode event mask at poll time.
    fn level_events(&self) -> MonitorEvents {
        match &self.target {
            MonitorTarget::Channel { events, .. } => {
                let mut high = MonitorEvents::empty();
                for event in events.iter() {
                    if self.event_is_high(event) {
                        high |= event;
                    }
                }
                high
            }
            // Futexes and timeouts are always edge-collected.
            MonitorTarget::Futex { .. } | MonitorTarget::Timeout { .. } => {
                MonitorEvents::from_bits_truncate(self.pending.swap(0, Ordering::AcqRel))
            }
        }
    }

    /// Detaches every hook and cancels the timer.
    fn unhook(&self) {
        let hooks = core::mem::take(&mut *self.hooks.lock());
        for (queue, waiter) in hooks {
            let _ = queue.unwait(&waiter);
        }
        if let Some(timer_id) = self.timer.lock().take() {
            let _ = timer::cancel(timer_id);
        }
        ITEM_REGISTRY.lock().remove(&self.id);
    }
}

/// A readiness multiplexer.
pub struct Monitor {
    items: SpinLock<Vec<Arc<MonitorItem>>>,
    /// Counts "an item may have triggered" signals.
    triggered: Semaphore,
    closed: AtomicBool,
    outstanding_polls: AtomicU32,
}

impl Monitor {
    /// Creates an empty monitor.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            items: SpinLock::new(Vec::new()),
            triggered: Semaphore::new(0),
            closed: AtomicBool::new(false),
            outstanding_polls: AtomicU32::new(0),
        })
    }

    /// Adds an item watching `target`. Returns the item id.
    pub fn add_item(
        self: &Arc<Self>,
        target: MonitorTarget,
        flags: ItemFlags,
    ) -> KResult<u64> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Status::PermanentOutage);
        }
        if let MonitorTarget::Channel { events, .. } = &target {
            if events.is_empty() {
                return Err(Status::InvalidArgument);
            }
        }

        let id = NEXT_ITEM_ID.fetch_add(1, Ordering::Relaxed);
        let item = Arc::new(MonitorItem {
            id,
            target,
            flags,
            enabled: AtomicBool::new(true),
            pending: AtomicU32::new(0),
            monitor: Arc::downgrade(self),
            hooks: SpinLock::new(Vec::new()),
            timer: SpinLock::new(None),
        });
        ITEM_REGISTRY.lock().insert(id, Arc::downgrade(&item));

        // Wire the source hooks.
        match &item.target {
            MonitorTarget::Channel { channel, events } => {
                let mut hooks = Vec::new();
                let hook = |queue: &WaitQueue, event: MonitorEvents| {
                    let waiter = Waiter::new(item_hook, pack_hook_context(id, event));
                    let _ = queue.wait(&waiter);
                    (queue.clone(), waiter)
                };
                if events.contains(MonitorEvents::MESSAGE_ARRIVED) {
                    hooks.push(hook(
                        channel.message_arrival_waitq(),
                        MonitorEvents::MESSAGE_ARRIVED,
                    ));
                }
                if events.contains(MonitorEvents::PEER_QUEUE_SPACE_AVAILABLE) {
                    hooks.push(hook(
                        channel.queue_space_waitq(),
                        MonitorEvents::PEER_QUEUE_SPACE_AVAILABLE,
                    ));
                }
                if events.contains(MonitorEvents::PEER_CLOSED) {
                    hooks.push(hook(channel.peer_closed_waitq(), MonitorEvents::PEER_CLOSED));
                }
                if events.contains(MonitorEvents::CLOSED) {
                    hooks.push(hook(channel.message_arrival_waitq(), MonitorEvents::CLOSED));
                }
                if let Some(peer) = channel.peer() {
                    if events.contains(MonitorEvents::QUEUE_SPACE_AVAILABLE) {
                        hooks.push(hook(
                            peer.queue_space_waitq(),
                            MonitorEvents::QUEUE_SPACE_AVAILABLE,
                        ));
                    }
                    if events.contains(MonitorEvents::PEER_QUEUE_EMPTIED) {
                        hooks.push(hook(
                            peer.queue_space_waitq(),
                            MonitorEvents::PEER_QUEUE_EMPTIED,
                        ));
                    }
                }
                *item.hooks.lock() = hooks;

                // A level item that is already high must not strand a
                // waiting poller.
                if !flags.contains(ItemFlags::EDGE_TRIGGERED)
                    && !item.level_events().is_empty()
                {
                    self.triggered.up();
                }
            }
            MonitorTarget::Futex { futex } => {
                let waiter = Waiter::new(item_hook, pack_hook_context(id, MonitorEvents::FUTEX_WOKEN));
                let _ = futex.waitq().wait(&waiter);
                item.hooks.lock().push((futex.waitq().clone(), waiter));
            }
            MonitorTarget::Timeout { delay_ns } => {
                let timer_id = timer::oneshot(
                    *delay_ns,
                    item_hook,
                    pack_hook_context(id, MonitorEvents::TIMEOUT),
                );
                *item.timer.lock() = Some(timer_id);
            }
        }

        self.items.lock().push(item);
        Ok(id)
    }

    /// Removes an item by id.
    pub fn remove_item(&self, id: u64) -> KResult<()> {
        let item = {
            let mut items = self.items.lock();
            let idx = items
                .iter()
                .position(|i| i.id == id)
                .ok_or(Status::NoSuchResource)?;
            items.remove(idx)
        };
        item.unhook();
        Ok(())
    }

    /// Re-enables a disabled item.
    pub fn enable_item(&self, id: u64) -> KResult<()> {
        let items = self.items.lock();
        let item = items
            .iter()
            .find(|i| i.id == id)
            .ok_or(Status::NoSuchResource)?;
        item.enabled.store(true, Ordering::Release);
        Ok(())
    }

    /// Waits for up to `max` triggered items.
    ///
    /// Level-triggered items report whenever their source reads high;
    /// edge-triggered items consume their latched transitions. Returns
    /// [`Status::TimedOut`] if `timeout_ns` elapses with nothing
    /// triggered, and [`Status::PermanentOutage`] once the monitor is
    /// closed and drained.
    pub fn poll(
        &self,
        thread: &Arc<Thread>,
        max: usize,
        timeout_ns: Option<u64>,
    ) -> KResult<Vec<ItemEvent>> {
        if max == 0 {
            return Err(Status::InvalidArgument);
        }
        self.outstanding_polls.fetch_add(1, Ordering::AcqRel);
        let result = loop {
            let events = self.collect(max);
            if !events.is_empty() {
                break Ok(events);
            }
            if self.closed.load(Ordering::Acquire) {
                break Err(Status::PermanentOutage);
            }
            if let Err(status) = self.triggered.down(thread, timeout_ns) {
                break Err(status);
            }
        };
        self.outstanding_polls.fetch_sub(1, Ordering::AcqRel);
        result
    }

    /// Drains currently triggered items into an event list.
    fn collect(&self, max: usize) -> Vec<ItemEvent> {
        let items: Vec<Arc<MonitorItem>> = self.items.lock().clone();
        let mut out = Vec::new();
        let mut deleted = Vec::new();

        for item in items {
            if out.len() >= max {
                break;
            }
            if !item.enabled.load(Ordering::Acquire) {
                continue;
            }
            let events = if item.flags.contains(ItemFlags::EDGE_TRIGGERED) {
                MonitorEvents::from_bits_truncate(item.pending.swap(0, Ordering::AcqRel))
            } else {
                item.level_events()
            };
            if events.is_empty() {
                continue;
            }
            out.push(ItemEvent {
                item: item.id,
                events,
            });
            if item.flags.contains(ItemFlags::DISABLE_ON_TRIGGER) {
                item.enabled.store(false, Ordering::Release);
            }
            if item.flags.contains(ItemFlags::DELETE_ON_TRIGGER) {
                deleted.push(item.id);
            }
        }
        for id in deleted {
            let _ = self.remove_item(id);
        }
        out
    }

    /// Closes the monitor. Idempotent.
    ///
    /// Items without `KEEP_ALIVE` are detached; pollers wake and report
    /// `permanent-outage` once the triggered set is drained.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let removed: Vec<Arc<MonitorItem>> = {
            let mut items = self.items.lock();
            let (keep, removed): (Vec<_>, Vec<_>) = items
                .drain(..)
                .partition(|item| item.flags.contains(ItemFlags::KEEP_ALIVE));
            *items = keep;
            removed
        };
        for item in removed {
            item.unhook();
        }
        // Every outstanding poll gets a wake so it can observe the close.
        for _ in 0..=self.outstanding_polls.load(Ordering::Acquire) {
            self.triggered.up();
        }
    }

    /// Returns `true` once the monitor has been closed.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Number of installed items.
    pub fn item_count(&self) -> usize {
        self.items.lock().len()
    }
}

impl Drop for Monitor {
    fn drop(&mut self) {
        let items = core::mem::take(&mut *self.items.lock());
        for item in items {
            item.unhook();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::Message;
    use crate::futex::FutexTable;
    use anillo_core::addr::PhysAddr;
    use anillo_sched::thread::SPIN_MANAGER;
    use anillo_sched::timer::{TimerBackendOps, register_backend};
    use std::sync::Mutex;
    use std::sync::atomic::AtomicU64;

    /// Serializes tests that use the global timer queue and backend.
    static TIMER_SERIAL: Mutex<()> = Mutex::new(());

    static FAKE_NOW: AtomicU64 = AtomicU64::new(0);

    fn fake_now() -> u64 {
        FAKE_NOW.load(Ordering::SeqCst)
    }
    fn fake_arm(_deadline: u64) {}
    fn fake_disarm() {}

    fn install_fake_clock() {
        // SAFETY: The fake functions only touch atomics.
        unsafe {
            register_backend(TimerBackendOps {
                now_ns: fake_now,
                arm: fake_arm,
                disarm: fake_disarm,
            });
        }
    }

    fn test_thread() -> Arc<Thread> {
        Thread::new("monitor-test", &SPIN_MANAGER, None)
    }

    #[test]
    fn level_triggered_channel_item() {
        let (a, b) = Channel::new_pair();
        let monitor = Monitor::new();
        let thread = test_thread();

        let id = monitor
            .add_item(
                MonitorTarget::Channel {
                    channel: b.clone(),
                    events: MonitorEvents::MESSAGE_ARRIVED,
                },
                ItemFlags::empty(),
            )
            .unwrap();

        a.send(&thread, Message::new(b"x".to_vec())).unwrap();
        let events = monitor.poll(&thread, 8, None).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].item, id);
        assert!(events[0].events.contains(MonitorEvents::MESSAGE_ARRIVED));

        // Level semantics: still high while the message is queued.
        let again = monitor.poll(&thread, 8, None).unwrap();
        assert_eq!(again.len(), 1);

        // Drained: a poll now blocks; use the close path to unblock below.
        b.receive(&thread).unwrap();
        assert!(monitor.collect(8).is_empty());
    }

    #[test]
    fn edge_triggered_clears_on_consumption() {
        let (a, b) = Channel::new_pair();
        let monitor = Monitor::new();
        let thread = test_thread();

        let id = monitor
            .add_item(
                MonitorTarget::Channel {
                    channel: b.clone(),
                    events: MonitorEvents::MESSAGE_ARRIVED,
                },
                ItemFlags::EDGE_TRIGGERED,
            )
            .unwrap();

        a.send(&thread, Message::new(b"x".to_vec())).unwrap();
        let events = monitor.poll(&thread, 8, None).unwrap();
        assert_eq!(events[0].item, id);

        // Edge consumed: nothing more until the next transition, even
        // though the message still sits in the queue.
        assert!(monitor.collect(8).is_empty());

        a.send(&thread, Message::new(b"y".to_vec())).unwrap();
        assert_eq!(monitor.collect(8).len(), 1);
    }

    #[test]
    fn monitor_timeout_item_fires() {
        // Literal scenario: one edge channel item plus a 100 ms timeout
        // item; only the timeout reports.
        let _serial = TIMER_SERIAL.lock().unwrap();
        install_fake_clock();
        FAKE_NOW.store(0, Ordering::SeqCst);

        let (_a, b) = Channel::new_pair();
        let monitor = Monitor::new();
        let thread = test_thread();

        monitor
            .add_item(
                MonitorTarget::Channel {
                    channel: b.clone(),
                    events: MonitorEvents::MESSAGE_ARRIVED,
                },
                ItemFlags::EDGE_TRIGGERED,
            )
            .unwrap();
        let timeout_id = monitor
            .add_item(
                MonitorTarget::Timeout {
                    delay_ns: 100_000_000,
                },
                ItemFlags::empty(),
            )
            .unwrap();

        let ticker = std::thread::spawn(|| {
            while anillo_sched::timer::pending() == 0 {
                std::thread::yield_now();
            }
            FAKE_NOW.store(100_000_000, Ordering::SeqCst);
            anillo_sched::timer::on_interrupt();
        });

        let events = monitor.poll(&thread, 8, None).unwrap();
        ticker.join().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].item, timeout_id);
        assert_eq!(events[0].events, MonitorEvents::TIMEOUT);
        FAKE_NOW.store(0, Ordering::SeqCst);
    }

    #[test]
    fn futex_item_reports_wake() {
        let monitor = Monitor::new();
        let thread = test_thread();
        let table = FutexTable::new();
        let futex = table.lookup_or_create(PhysAddr::new(0x9000), 0);

        let id = monitor
            .add_item(MonitorTarget::Futex { futex: futex.clone() }, ItemFlags::empty())
            .unwrap();

        assert!(monitor.collect(8).is_empty());
        table.wake(PhysAddr::new(0x9000), 0, 1);

        let events = monitor.poll(&thread, 8, None).unwrap();
        assert_eq!(events[0].item, id);
        assert_eq!(events[0].events, MonitorEvents::FUTEX_WOKEN);
    }

    #[test]
    fn peer_close_event() {
        let (a, b) = Channel::new_pair();
        let monitor = Monitor::new();
        let thread = test_thread();

        let id = monitor
            .add_item(
                MonitorTarget::Channel {
                    channel: b.clone(),
                    events: MonitorEvents::PEER_CLOSED,
                },
                ItemFlags::EDGE_TRIGGERED,
            )
            .unwrap();

        assert!(monitor.collect(8).is_empty());
        a.close();
        let events = monitor.poll(&thread, 8, None).unwrap();
        assert_eq!(events[0].item, id);
        assert!(events[0].events.contains(MonitorEvents::PEER_CLOSED));
    }

    #[test]
    fn disable_on_trigger() {
        let (a, b) = Channel::new_pair();
        let monitor = Monitor::new();
        let thread = test_thread();

        let id = monitor
            .add_item(
                MonitorTarget::Channel {
                    channel: b.clone(),
                    events: MonitorEvents::MESSAGE_ARRIVED,
                },
                ItemFlags::DISABLE_ON_TRIGGER,
            )
            .unwrap();

        a.send(&thread, Message::new(b"x".to_vec())).unwrap();
        assert_eq!(monitor.poll(&thread, 8, None).unwrap().len(), 1);
        // Auto-disabled: the still-queued message no longer reports.
        assert!(monitor.collect(8).is_empty());

        monitor.enable_item(id).unwrap();
        assert_eq!(monitor.collect(8).len(), 1);
    }

    #[test]
    fn delete_on_trigger() {
        let (a, b) = Channel::new_pair();
        let monitor = Monitor::new();
        let thread = test_thread();

        monitor
            .add_item(
                MonitorTarget::Channel {
                    channel: b.clone(),
                    events: MonitorEvents::MESSAGE_ARRIVED,
                },
                ItemFlags::DELETE_ON_TRIGGER,
            )
            .unwrap();

        a.send(&thread, Message::new(b"x".to_vec())).unwrap();
        assert_eq!(monitor.poll(&thread, 8, None).unwrap().len(), 1);
        assert_eq!(monitor.item_count(), 0);
    }

    #[test]
    fn active_low_inverts_levels() {
        let (_a, b) = Channel::new_pair();
        let monitor = Monitor::new();

        // MESSAGE_ARRIVED active-low = "queue is empty", which is true
        // from the start.
        monitor
            .add_item(
                MonitorTarget::Channel {
                    channel: b.clone(),
                    events: MonitorEvents::MESSAGE_ARRIVED,
                },
                ItemFlags::ACTIVE_LOW,
            )
            .unwrap();

        let events = monitor.collect(8);
        assert_eq!(events.len(), 1);
        assert!(events[0].events.contains(MonitorEvents::MESSAGE_ARRIVED));
    }

    #[test]
    fn close_reports_outage_when_drained() {
        let monitor = Monitor::new();
        let thread = test_thread();

        let poller = {
            let monitor = monitor.clone();
            std::thread::spawn(move || {
                let thread = test_thread();
                monitor.poll(&thread, 8, None)
            })
        };
        while monitor.outstanding_polls.load(Ordering::SeqCst) == 0 {
            std::thread::yield_now();
        }
        monitor.close();
        monitor.close(); // idempotent
        assert_eq!(
            poller.join().unwrap().unwrap_err(),
            Status::PermanentOutage
        );
        assert_eq!(
            monitor.poll(&thread, 8, None).unwrap_err(),
            Status::PermanentOutage
        );
    }

    #[test]
    fn keep_alive_items_survive_close() {
        let (_a, b) = Channel::new_pair();
        let monitor = Monitor::new();

        monitor
            .add_item(
                MonitorTarget::Channel {
                    channel: b.clone(),
                    events: MonitorEvents::MESSAGE_ARRIVED,
                },
                ItemFlags::KEEP_ALIVE,
            )
            .unwrap();
        monitor
            .add_item(
                MonitorTarget::Channel {
                    channel: b.clone(),
                    events: MonitorEvents::PEER_CLOSED,
                },
                ItemFlags::empty(),
            )
            .unwrap();

        assert_eq!(monitor.item_count(), 2);
        monitor.close();
        assert_eq!(monitor.item_count(), 1);
    }

    #[test]
    fn max_limits_reported_events() {
        let (a, b) = Channel::new_pair();
        let (c, d) = Channel::new_pair();
        let monitor = Monitor::new();
        let thread = test_thread();

        for half in [&b, &d] {
            monitor
                .add_item(
                    MonitorTarget::Channel {
                        channel: half.clone(),
                        events: MonitorEvents::MESSAGE_ARRIVED,
                    },
                    ItemFlags::empty(),
                )
                .unwrap();
        }
        a.send(&thread, Message::new(b"x".to_vec())).unwrap();
        c.send(&thread, Message::new(b"y".to_vec())).unwrap();

        assert_eq!(monitor.poll(&thread, 1, None).unwrap().len(), 1);
        assert_eq!(monitor.poll(&thread, 8, None).unwrap().len(), 2);
    }

    #[test]
    fn zero_max_is_invalid() {
        let monitor = Monitor::new();
        let thread = test_thread();
        assert_eq!(
            monitor.poll(&thread, 0, None).unwrap_err(),
            Status::InvalidArgument
        );
    }
}
