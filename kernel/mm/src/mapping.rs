//! Ref-counted shared-memory mappings.
//!
//! A [`Mapping`] is an ordered sequence of page slots that one or more
//! address spaces can install views of. Slots start as zero-on-demand and
//! are materialised to physical frames on first fault. A slot can also
//! redirect to another mapping's slot ([`bind_indirect`](Mapping::bind_indirect),
//! used to share a sub-range) or copy from one on first access
//! ([`bind_copy_of`](Mapping::bind_copy_of), used for copy-on-fault views).
//!
//! The mapping itself is reference-counted with `Arc`; per-slot refcounts
//! track how many installed views currently reference the slot's frame.
//! Owned frames are returned through the release hook when the mapping is
//! dropped.
//!
//! Lock order: space lock → mapping lock → frame allocator lock. The
//! mapping lock is dropped before following indirect/copy links, so chains
//! never hold two mapping locks at once.

use alloc::sync::Arc;
use alloc::vec::Vec;

use anillo_core::page::{PhysFrame, Size4KiB};
use anillo_core::status::{KResult, Status};
use anillo_core::sync::SpinLock;

use crate::FrameAllocator;

/// Returns frames owned by a dropped mapping to the frame allocator.
///
/// Stored at construction so `Drop` needs no allocator parameter.
pub type FrameReleaseFn = fn(PhysFrame<Size4KiB>, usize);

/// Initialisation the caller must perform before activating a freshly
/// resolved frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotInit {
    /// The frame already holds valid content.
    None,
    /// The frame must be zero-filled.
    Zero,
    /// The frame must be filled with a copy of the given frame.
    CopyFrom(PhysFrame<Size4KiB>),
}

/// The result of resolving a slot to a physical frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolved {
    /// The backing frame for the slot.
    pub frame: PhysFrame<Size4KiB>,
    /// What the caller must do with the frame's content before use.
    pub init: SlotInit,
}

enum SlotBacking {
    /// Not yet materialised; resolves to a fresh zero-filled frame.
    ZeroOnDemand,
    /// Materialised (or adopted) frame. `owned` frames return to the
    /// allocator when the mapping is dropped.
    Frame {
        frame: PhysFrame<Size4KiB>,
        owned: bool,
    },
    /// Redirect: resolving this slot resolves the source slot instead.
    Indirect {
        source: Arc<Mapping>,
        index: usize,
    },
    /// Copy-on-fault: resolving allocates a private frame initialised from
    /// the source slot.
    CopyOf {
        source: Arc<Mapping>,
        index: usize,
    },
}

struct Slot {
    backing: SlotBacking,
    /// Number of installed views referencing this slot's frame.
    refs: u32,
}

/// A ref-counted, ordered sequence of page slots shareable across address
/// spaces.
pub struct Mapping {
    slots: SpinLock<Vec<Slot>>,
    release: FrameReleaseFn,
}

impl Mapping {
    /// Creates a mapping of `page_count` zero-on-demand slots.
    pub fn new_zeroed(page_count: usize, release: FrameReleaseFn) -> KResult<Arc<Self>> {
        if page_count == 0 {
            return Err(Status::InvalidArgument);
        }
        let mut slots = Vec::new();
        if slots.try_reserve_exact(page_count).is_err() {
            return Err(Status::TemporaryOutage);
        }
        for _ in 0..page_count {
            slots.push(Slot {
                backing: SlotBacking::ZeroOnDemand,
                refs: 0,
            });
        }
        Ok(Arc::new(Self {
            slots: SpinLock::new(slots),
            release,
        }))
    }

    /// Returns the number of slots.
    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    /// Returns `true` if the mapping has no slots (never the case for a
    /// successfully constructed mapping).
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Resolves a slot to a physical frame, materialising it if needed.
    ///
    /// The returned [`SlotInit`] tells the caller how to initialise the
    /// frame's content; the mapping itself never touches memory.
    pub fn resolve(
        self: &Arc<Self>,
        index: usize,
        alloc: &mut dyn FrameAllocator<Size4KiB>,
    ) -> KResult<Resolved> {
        let mut slots = self.slots.lock();
        let slot = slots.get_mut(index).ok_or(Status::InvalidArgument)?;
        match &slot.backing {
            SlotBacking::Frame { frame, .. } => Ok(Resolved {
                frame: *frame,
                init: SlotInit::None,
            }),
            SlotBacking::ZeroOnDemand => {
                let frame = alloc.allocate_frame().ok_or(Status::TemporaryOutage)?;
                slot.backing = SlotBacking::Frame { frame, owned: true };
                Ok(Resolved {
                    frame,
                    init: SlotInit::Zero,
                })
            }
            SlotBacking::Indirect { source, index } => {
                let (source, index) = (source.clone(), *index);
                drop(slots);
                source.resolve(index, alloc)
            }
            SlotBacking::CopyOf {
                source,
                index: copy_of_index,
            } => {
                let (source, source_index) = (source.clone(), *copy_of_index);
                drop(slots);
                // Materialise the source first so there is something to copy.
                let origin = source.resolve(source_index, alloc)?;
                let init = match origin.init {
                    // The source itself was fresh: our copy is just zeroes.
                    SlotInit::Zero => SlotInit::Zero,
                    _ => SlotInit::CopyFrom(origin.frame),
                };
                // Re-check under the lock: another space may have settled
                // the slot while we resolved the source.
                let mut slots = self.slots.lock();
                if let SlotBacking::Frame { frame, .. } = slots[index].backing {
                    return Ok(Resolved {
                        frame,
                        init: SlotInit::None,
                    });
                }
                let frame = alloc.allocate_frame().ok_or(Status::TemporaryOutage)?;
                slots[index].backing = SlotBacking::Frame { frame, owned: true };
                Ok(Resolved { frame, init })
            }
        }
    }

    /// Increments a slot's view refcount.
    pub fn retain_slot(&self, index: usize) -> KResult<()> {
        let mut slots = self.slots.lock();
        let slot = slots.get_mut(index).ok_or(Status::InvalidArgument)?;
        slot.refs += 1;
        Ok(())
    }

    /// Decrements a slot's view refcount.
    pub fn release_slot(&self, index: usize) -> KResult<()> {
        let mut slots = self.slots.lock();
        let slot = slots.get_mut(index).ok_or(Status::InvalidArgument)?;
        debug_assert!(slot.refs > 0, "slot {index} released more than retained");
        slot.refs = slot.refs.saturating_sub(1);
        Ok(())
    }

    /// Returns a slot's current view refcount.
    pub fn slot_refs(&self, index: usize) -> KResult<u32> {
        let slots = self.slots.lock();
        slots
            .get(index)
            .map(|s| s.refs)
            .ok_or(Status::InvalidArgument)
    }

    /// Returns the frame backing a slot, if it is materialised locally.
    pub fn slot_frame(&self, index: usize) -> Option<PhysFrame<Size4KiB>> {
        let slots = self.slots.lock();
        match slots.get(index)?.backing {
            SlotBacking::Frame { frame, .. } => Some(frame),
            _ => None,
        }
    }

    /// Redirects `count` slots starting at `target_offset` to the slots of
    /// `source` starting at `source_offset`.
    ///
    /// Only zero-on-demand (not yet materialised) slots can be rebound.
    pub fn bind_indirect(
        self: &Arc<Self>,
        target_offset: usize,
        source: &Arc<Mapping>,
        source_offset: usize,
        count: usize,
    ) -> KResult<()> {
        self.bind(target_offset, source, source_offset, count, false)
    }

    /// Marks `count` slots starting at `target_offset` as private copies of
    /// the slots of `source`: the first resolve allocates a fresh frame and
    /// reports the source frame to copy from.
    pub fn bind_copy_of(
        self: &Arc<Self>,
        target_offset: usize,
        source: &Arc<Mapping>,
        source_offset: usize,
        count: usize,
    ) -> KResult<()> {
        self.bind(target_offset, source, source_offset, count, true)
    }

    fn bind(
        self: &Arc<Self>,
        target_offset: usize,
        source: &Arc<Mapping>,
        source_offset: usize,
        count: usize,
        copy: bool,
    ) -> KResult<()> {
        if Arc::ptr_eq(self, source) {
            return Err(Status::InvalidArgument);
        }
        if source_offset + count > source.len() {
            return Err(Status::InvalidArgument);
        }
        let mut slots = self.slots.lock();
        if target_offset + count > slots.len() {
            return Err(Status::InvalidArgument);
        }
        for slot in &slots[target_offset..target_offset + count] {
            if !matches!(slot.backing, SlotBacking::ZeroOnDemand) {
                return Err(Status::AlreadyInProgress);
            }
        }
        for i in 0..count {
            slots[target_offset + i].backing = if copy {
                SlotBacking::CopyOf {
                    source: source.clone(),
                    index: source_offset + i,
                }
            } else {
                SlotBacking::Indirect {
                    source: source.clone(),
                    index: source_offset + i,
                }
            };
        }
        Ok(())
    }

    /// Installs an externally materialised frame into a slot.
    ///
    /// Used when transferring ownership of already-backed pages into the
    /// mapping. The slot must not be materialised yet. `owned` frames are
    /// returned to the allocator when the mapping is dropped.
    pub fn adopt_frame(
        &self,
        index: usize,
        frame: PhysFrame<Size4KiB>,
        owned: bool,
    ) -> KResult<()> {
        let mut slots = self.slots.lock();
        let slot = slots.get_mut(index).ok_or(Status::InvalidArgument)?;
        if !matches!(slot.backing, SlotBacking::ZeroOnDemand) {
            return Err(Status::AlreadyInProgress);
        }
        slot.backing = SlotBacking::Frame { frame, owned };
        Ok(())
    }
}

impl Drop for Mapping {
    fn drop(&mut self) {
        let slots = self.slots.get_mut();
        for slot in slots.iter() {
            if let SlotBacking::Frame { frame, owned: true } = slot.backing {
                (self.release)(frame, 1);
            }
        }
    }
}
