//! Typed descriptors and per-process descriptor tables.
//!
//! A descriptor is a (pointer, class-vtable) pair; the class supplies
//! retain/release and a class id, so the table can hold channels,
//! mappings, monitors, processes, and threads uniformly without trait
//! objects in the hot path. Descriptor ids are dense (lowest free slot
//! first) and reused after uninstall.

use alloc::sync::Arc;
use alloc::vec::Vec;

use anillo_core::id::DescriptorId;
use anillo_core::status::{KResult, Status};
use anillo_core::sync::SpinLock;
use anillo_ipc::channel::Channel;
use anillo_ipc::monitor::Monitor;
use anillo_mm::mapping::Mapping;
use anillo_sched::thread::Thread;

use super::Process;

/// Class vtable: how to retain/release the pointed-to object.
pub struct DescriptorClass {
    /// Human-readable class name.
    pub name: &'static str,
    /// Stable class discriminator.
    pub class_id: u32,
    /// Increments the object's reference count.
    ///
    /// # Safety
    ///
    /// `ptr` must have come from this class's constructor.
    pub retain: unsafe fn(*const ()),
    /// Decrements the object's reference count.
    ///
    /// # Safety
    ///
    /// `ptr` must have come from this class's constructor, balancing a
    /// prior retain (or the construction itself).
    pub release: unsafe fn(*const ()),
}

/// Class id for channels.
pub const CLASS_CHANNEL: u32 = 1;
/// Class id for shared memory mappings.
pub const CLASS_MAPPING: u32 = 2;
/// Class id for monitors.
pub const CLASS_MONITOR: u32 = 3;
/// Class id for processes.
pub const CLASS_PROCESS: u32 = 4;
/// Class id for threads.
pub const CLASS_THREAD: u32 = 5;

unsafe fn arc_retain<T>(ptr: *const ()) {
    // SAFETY: Caller contract: ptr came from Arc::into_raw::<T>.
    unsafe { Arc::increment_strong_count(ptr as *const T) };
}

unsafe fn arc_release<T>(ptr: *const ()) {
    // SAFETY: Caller contract: balances a retain or the construction.
    unsafe { Arc::decrement_strong_count(ptr as *const T) };
}

macro_rules! define_class {
    ($(#[$meta:meta])* $static_name:ident, $ty:ty, $name:literal, $id:expr) => {
        $(#[$meta])*
        pub static $static_name: DescriptorClass = DescriptorClass {
            name: $name,
            class_id: $id,
            retain: arc_retain::<$ty>,
            release: arc_release::<$ty>,
        };
    };
}

define_class!(
    /// Channels.
    CHANNEL_CLASS, Channel, "channel", CLASS_CHANNEL
);
define_class!(
    /// Shared memory mappings.
    MAPPING_CLASS, Mapping, "mapping", CLASS_MAPPING
);
define_class!(
    /// Monitors.
    MONITOR_CLASS, Monitor, "monitor", CLASS_MONITOR
);
define_class!(
    /// Processes.
    PROCESS_CLASS, Process, "process", CLASS_PROCESS
);
define_class!(
    /// Threads.
    THREAD_CLASS, Thread, "thread", CLASS_THREAD
);

/// An owning, typed handle: a raw pointer plus its class vtable.
pub struct Descriptor {
    ptr: *const (),
    class: &'static DescriptorClass,
}

// SAFETY: The pointed-to objects are all Send + Sync (Arc payloads), and
// the vtable functions only touch the refcount.
unsafe impl Send for Descriptor {}
unsafe impl Sync for Descriptor {}

impl Descriptor {
    fn from_arc<T>(arc: Arc<T>, class: &'static DescriptorClass) -> Self {
        Self {
            ptr: Arc::into_raw(arc) as *const (),
            class,
        }
    }

    fn to_arc<T>(&self, class: &'static DescriptorClass) -> Option<Arc<T>> {
        if self.class.class_id != class.class_id {
            return None;
        }
        // SAFETY: Class ids match, so ptr came from Arc::into_raw::<T>;
        // the extra count pays for the Arc we hand out.
        unsafe {
            Arc::increment_strong_count(self.ptr as *const T);
            Some(Arc::from_raw(self.ptr as *const T))
        }
    }

    /// Wraps a channel.
    pub fn channel(channel: Arc<Channel>) -> Self {
        Self::from_arc(channel, &CHANNEL_CLASS)
    }

    /// Wraps a mapping.
    pub fn mapping(mapping: Arc<Mapping>) -> Self {
        Self::from_arc(mapping, &MAPPING_CLASS)
    }

    /// Wraps a monitor.
    pub fn monitor(monitor: Arc<Monitor>) -> Self {
        Self::from_arc(monitor, &MONITOR_CLASS)
    }

    /// Wraps a process.
    pub fn process(process: Arc<Process>) -> Self {
        Self::from_arc(process, &PROCESS_CLASS)
    }

    /// Wraps a thread.
    pub fn thread(thread: Arc<Thread>) -> Self {
        Self::from_arc(thread, &THREAD_CLASS)
    }

    /// The class vtable.
    pub fn class(&self) -> &'static DescriptorClass {
        self.class
    }

    /// Downcasts to a channel.
    pub fn as_channel(&self) -> Option<Arc<Channel>> {
        self.to_arc(&CHANNEL_CLASS)
    }

    /// Downcasts to a mapping.
    pub fn as_mapping(&self) -> Option<Arc<Mapping>> {
        self.to_arc(&MAPPING_CLASS)
    }

    /// Downcasts to a monitor.
    pub fn as_monitor(&self) -> Option<Arc<Monitor>> {
        self.to_arc(&MONITOR_CLASS)
    }

    /// Downcasts to a process.
    pub fn as_process(&self) -> Option<Arc<Process>> {
        self.to_arc(&PROCESS_CLASS)
    }

    /// Downcasts to a thread.
    pub fn as_thread(&self) -> Option<Arc<Thread>> {
        self.to_arc(&THREAD_CLASS)
    }
}

impl Clone for Descriptor {
    fn clone(&self) -> Self {
        // SAFETY: ptr came from this class's constructor.
        unsafe { (self.class.retain)(self.ptr) };
        Self {
            ptr: self.ptr,
            class: self.class,
        }
    }
}

impl Drop for Descriptor {
    fn drop(&mut self) {
        // SAFETY: Balances the construction or clone.
        unsafe { (self.class.release)(self.ptr) };
    }
}

impl core::fmt::Debug for Descriptor {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Descriptor<{}>({:p})", self.class.name, self.ptr)
    }
}

/// Per-process descriptor table.
pub struct DescriptorTable {
    inner: SpinLock<TableInner>,
}

struct TableInner {
    slots: Vec<Option<Descriptor>>,
}

impl Default for DescriptorTable {
    fn default() -> Self {
        Self::new()
    }
}

impl DescriptorTable {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self {
            inner: SpinLock::new(TableInner { slots: Vec::new() }),
        }
    }

    /// Installs a descriptor, returning its id (lowest free slot).
    pub fn install(&self, descriptor: Descriptor) -> DescriptorId {
        let mut inner = self.inner.lock();
        for (idx, slot) in inner.slots.iter_mut().enumerate() {
            if slot.is_none() {
                *slot = Some(descriptor);
                return DescriptorId::new(idx as u64);
            }
        }
        inner.slots.push(Some(descriptor));
        DescriptorId::new((inner.slots.len() - 1) as u64)
    }

    /// Returns a retained copy of a descriptor.
    pub fn get(&self, id: DescriptorId) -> KResult<Descriptor> {
        let inner = self.inner.lock();
        inner
            .slots
            .get(id.as_usize())
            .and_then(|slot| slot.clone())
            .ok_or(Status::NoSuchResource)
    }

    /// Removes and returns a descriptor; the id becomes reusable.
    pub fn uninstall(&self, id: DescriptorId) -> KResult<Descriptor> {
        let mut inner = self.inner.lock();
        inner
            .slots
            .get_mut(id.as_usize())
            .and_then(|slot| slot.take())
            .ok_or(Status::NoSuchResource)
    }

    /// Number of installed descriptors.
    pub fn len(&self) -> usize {
        self.inner.lock().slots.iter().filter(|s| s.is_some()).count()
    }

    /// Returns `true` if nothing is installed.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Removes every descriptor (process teardown).
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.slots.clear();
    }

    /// Visits every installed descriptor.
    pub fn for_each(&self, mut f: impl FnMut(DescriptorId, &Descriptor)) {
        let inner = self.inner.lock();
        for (idx, slot) in inner.slots.iter().enumerate() {
            if let Some(descriptor) = slot {
                f(DescriptorId::new(idx as u64), descriptor);
            }
        }
    }
}
