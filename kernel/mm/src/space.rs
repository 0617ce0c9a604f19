//! Per-process address spaces.
//!
//! An [`AddressSpace`] couples a root page table with a buddy allocator for
//! the user half and the bookkeeping needed to resolve faults: which ranges
//! are anonymous allocations, which are views of a shared [`Mapping`], and
//! which are windows onto externally owned physical memory. The kernel half
//! of every address space points at the same shared kernel tables; this
//! module only ever touches the user half and refuses requests that cross
//! the boundary.
//!
//! Fault policy: an access to an address covered by a view materialises the
//! mapping slot (zero-fill, copy-out-of-parent, or follow-indirect) and
//! installs the entry; an access to a lazy anonymous range materialises a
//! zeroed frame; anything else is reported to the caller, which kills the
//! thread or forwards the fault to userspace.
//!
//! Lock order: space lock → mapping lock → frame allocator lock.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::marker::PhantomData;

use anillo_core::addr::{PhysAddr, VirtAddr};
use anillo_core::page::{Page, PhysFrame, Size4KiB};
use anillo_core::status::{KResult, Status};
use anillo_core::sync::SpinLock;

use crate::layout::{KERNEL_BASE, VirtRegion};
use crate::mapper::{MapFlags, PageMapper, PageTranslator, flush_broadcast};
use crate::mapping::{Mapping, SlotInit};
use crate::region::BuddyRegionAllocator;
use crate::{FrameSource, PAGE_SIZE};

/// Frees the root table frame when the space is dropped.
pub type RootReleaseFn = fn(PhysFrame<Size4KiB>);

/// Capability token for lock-free early-boot table walks.
///
/// Constructing one asserts that exactly one CPU is running and no
/// concurrent table mutation can happen; it cannot be sent to another
/// thread. Call [`finish`](Self::finish) before starting secondary CPUs.
pub struct EarlyBoot {
    _not_send: PhantomData<*const ()>,
}

impl EarlyBoot {
    /// Creates the token.
    ///
    /// # Safety
    ///
    /// Only a single CPU may be running, and the token must be consumed
    /// via [`finish`](Self::finish) before any other CPU starts.
    pub unsafe fn new() -> Self {
        Self {
            _not_send: PhantomData,
        }
    }

    /// Consumes the token; lock-free walks are no longer possible.
    pub fn finish(self) {}
}

/// What a virtual range is backed by.
enum RangeKind {
    /// Anonymous memory owned by this space. Pages materialise lazily
    /// unless they were prefaulted.
    Anon { pages: u64, flags: MapFlags },
    /// A window onto externally owned physical memory. Never freed here.
    Phys { pages: u64 },
    /// A view of `pages` slots of a shared mapping starting at `offset`.
    View {
        mapping: Arc<Mapping>,
        offset: usize,
        pages: u64,
        flags: MapFlags,
    },
}

/// One installed virtual range.
struct RangeRec {
    base: VirtAddr,
    /// Pages reserved in the user buddy allocator (0 for windows installed
    /// at a caller-chosen address).
    reserved: u64,
    kind: RangeKind,
}

struct SpaceInner {
    user_alloc: BuddyRegionAllocator,
    ranges: Vec<RangeRec>,
}

/// A per-process address space.
pub struct AddressSpace<M: PageMapper + PageTranslator> {
    root_phys: PhysAddr,
    mapper: M,
    hhdm_offset: u64,
    release_root: RootReleaseFn,
    inner: SpinLock<SpaceInner>,
}

impl<M: PageMapper + PageTranslator> AddressSpace<M> {
    /// Wraps an already-constructed root table (kernel half pre-populated
    /// by the architecture code) into an address space managing the user
    /// half.
    pub fn new(
        root_phys: PhysAddr,
        mapper: M,
        hhdm_offset: u64,
        release_root: RootReleaseFn,
    ) -> Self {
        Self {
            root_phys,
            mapper,
            hhdm_offset,
            release_root,
            inner: SpinLock::new(SpaceInner {
                user_alloc: BuddyRegionAllocator::new(VirtRegion::user()),
                ranges: Vec::new(),
            }),
        }
    }

    /// Returns the physical address of the root table (for loading into the
    /// page-table base register on context switch).
    pub fn root_phys(&self) -> PhysAddr {
        self.root_phys
    }

    /// Returns the HHDM offset used to reach frames of this space.
    pub fn hhdm_offset(&self) -> u64 {
        self.hhdm_offset
    }

    /// Allocates `page_count` pages of anonymous memory aligned to
    /// `2^alignment_power` pages.
    ///
    /// With `prefault` the frames are materialised and zeroed immediately;
    /// otherwise the first access to each page faults one in.
    pub fn allocate(
        &self,
        page_count: u64,
        alignment_power: u32,
        flags: MapFlags,
        prefault: bool,
        frames: &mut dyn FrameSource,
    ) -> KResult<VirtAddr> {
        let mut inner = self.inner.lock();
        let (base, reserved) = inner.user_alloc.allocate(page_count, alignment_power)?;

        if prefault {
            for i in 0..page_count {
                let va = base + i * PAGE_SIZE as u64;
                match self.materialise_zeroed(va, flags, frames) {
                    Ok(()) => {}
                    Err(err) => {
                        // Roll back what was mapped so far.
                        for j in 0..i {
                            let page = Page::containing_address(base + j * PAGE_SIZE as u64);
                            // SAFETY: We own root_phys and just mapped these.
                            if let Ok((frame, _, flush)) =
                                unsafe { self.mapper.unmap(self.root_phys, page) }
                            {
                                flush.ignore();
                                // SAFETY: The frame was allocated above and
                                // is no longer referenced.
                                unsafe { frames.deallocate_frame(frame) };
                            }
                        }
                        inner.user_alloc.free(base, reserved)?;
                        return Err(err);
                    }
                }
            }
        }

        inner.ranges.push(RangeRec {
            base,
            reserved,
            kind: RangeKind::Anon {
                pages: page_count,
                flags,
            },
        });
        Ok(base)
    }

    /// Installs entries pointing at an externally owned physical range.
    ///
    /// The frames are never freed by this space.
    pub fn map_physical(
        &self,
        phys: PhysAddr,
        virt: VirtAddr,
        page_count: u64,
        flags: MapFlags,
        frames: &mut dyn FrameSource,
    ) -> KResult<()> {
        if !phys.is_aligned(PAGE_SIZE as u64) || !virt.is_aligned(PAGE_SIZE as u64) {
            return Err(Status::InvalidArgument);
        }
        if page_count == 0 {
            return Err(Status::InvalidArgument);
        }
        self.check_user_range(virt, page_count)?;

        let mut inner = self.inner.lock();
        for i in 0..page_count {
            let page = Page::containing_address(virt + i * PAGE_SIZE as u64);
            let frame = PhysFrame::containing_address(phys + i * PAGE_SIZE as u64);
            // SAFETY: We own root_phys; the caller vouches for the physical
            // range.
            let flush = unsafe {
                self.mapper.map(
                    self.root_phys,
                    page,
                    frame,
                    self.effective_flags(virt, flags),
                    &mut || frames.allocate_frame(),
                )?
            };
            flush.ignore();
        }

        inner.ranges.push(RangeRec {
            base: virt,
            reserved: 0,
            kind: RangeKind::Phys { pages: page_count },
        });
        Ok(())
    }

    /// Reserves a virtual range and points it at `page_count` slots of the
    /// given mapping starting at `offset`.
    ///
    /// Nothing is materialised up front; the first access to each page
    /// resolves the slot.
    pub fn insert_mapping(
        &self,
        mapping: &Arc<Mapping>,
        offset: usize,
        page_count: u64,
        alignment_power: u32,
        flags: MapFlags,
    ) -> KResult<VirtAddr> {
        if page_count == 0 || offset + page_count as usize > mapping.len() {
            return Err(Status::InvalidArgument);
        }
        let mut inner = self.inner.lock();
        let (base, reserved) = inner.user_alloc.allocate(page_count, alignment_power)?;
        inner.ranges.push(RangeRec {
            base,
            reserved,
            kind: RangeKind::View {
                mapping: mapping.clone(),
                offset,
                pages: page_count,
                flags,
            },
        });
        Ok(base)
    }

    /// Tears down the view installed at `va`, releasing its slot
    /// references.
    pub fn remove_mapping(&self, va: VirtAddr) -> KResult<()> {
        let mut inner = self.inner.lock();
        let idx = inner
            .ranges
            .iter()
            .position(|r| r.base == va && matches!(r.kind, RangeKind::View { .. }))
            .ok_or(Status::NoSuchResource)?;
        let rec = inner.ranges.remove(idx);
        let RangeKind::View {
            mapping,
            offset,
            pages,
            ..
        } = &rec.kind
        else {
            unreachable!()
        };

        for i in 0..*pages {
            let page = Page::containing_address(rec.base + i * PAGE_SIZE as u64);
            // SAFETY: We own root_phys; the entries belong to this view.
            if let Ok((_frame, _, flush)) = unsafe { self.mapper.unmap(self.root_phys, page) } {
                flush.ignore();
                mapping.release_slot(offset + i as usize)?;
            }
        }
        // One shootdown for the whole range, instead of one per page.
        flush_broadcast(None);

        if rec.reserved > 0 {
            inner.user_alloc.free(rec.base, rec.reserved)?;
        }
        Ok(())
    }

    /// Unmaps and frees an anonymous allocation, or unmaps a physical
    /// window.
    ///
    /// `page_count` must not exceed the original allocation; the whole
    /// range is released.
    pub fn free(&self, va: VirtAddr, page_count: u64, frames: &mut dyn FrameSource) -> KResult<()> {
        let mut inner = self.inner.lock();
        let idx = inner
            .ranges
            .iter()
            .position(|r| r.base == va && !matches!(r.kind, RangeKind::View { .. }))
            .ok_or(Status::NoSuchResource)?;

        let rec = &inner.ranges[idx];
        match &rec.kind {
            RangeKind::Anon { pages, .. } => {
                if page_count > *pages {
                    return Err(Status::InvalidArgument);
                }
                for i in 0..*pages {
                    let page = Page::containing_address(rec.base + i * PAGE_SIZE as u64);
                    // SAFETY: We own root_phys and the backing frames.
                    if let Ok((frame, _, flush)) =
                        unsafe { self.mapper.unmap(self.root_phys, page) }
                    {
                        flush.ignore();
                        // SAFETY: Anonymous frames are owned by this space.
                        unsafe { frames.deallocate_frame(frame) };
                    }
                }
            }
            RangeKind::Phys { pages } => {
                for i in 0..*pages {
                    let page = Page::containing_address(rec.base + i * PAGE_SIZE as u64);
                    // SAFETY: We own root_phys; external frames are not freed.
                    if let Ok((_, _, flush)) = unsafe { self.mapper.unmap(self.root_phys, page) } {
                        flush.ignore();
                    }
                }
            }
            RangeKind::View { .. } => unreachable!(),
        }
        flush_broadcast(None);

        let rec = inner.ranges.remove(idx);
        if rec.reserved > 0 {
            inner.user_alloc.free(rec.base, rec.reserved)?;
        }
        Ok(())
    }

    /// Transfers ownership of the frames backing an anonymous allocation
    /// into slots of `mapping` starting at `slot_offset`.
    ///
    /// The whole allocation moves: `va` must be the base returned by
    /// [`allocate`](Self::allocate) and `page_count` its size. After
    /// success the range is a view, so the frames live as long as the
    /// mapping and other spaces can install the same slots.
    pub fn move_into_mapping(
        &self,
        va: VirtAddr,
        page_count: u64,
        slot_offset: usize,
        mapping: &Arc<Mapping>,
    ) -> KResult<()> {
        if slot_offset + page_count as usize > mapping.len() {
            return Err(Status::InvalidArgument);
        }
        let mut inner = self.inner.lock();
        let idx = inner
            .ranges
            .iter()
            .position(|r| r.base == va)
            .ok_or(Status::NoSuchResource)?;
        let RangeKind::Anon { pages, flags } = inner.ranges[idx].kind else {
            return Err(Status::InvalidArgument);
        };
        if pages != page_count {
            return Err(Status::InvalidArgument);
        }

        // Adopt every materialised frame; untouched lazy pages stay
        // zero-on-demand in the mapping.
        for i in 0..pages {
            let page_va = va + i * PAGE_SIZE as u64;
            // SAFETY: We own root_phys.
            if let Some(t) = unsafe { self.mapper.translate(self.root_phys, page_va) } {
                let frame = PhysFrame::containing_address(t.phys);
                mapping.adopt_frame(slot_offset + i as usize, frame, true)?;
                mapping.retain_slot(slot_offset + i as usize)?;
            }
        }

        inner.ranges[idx].kind = RangeKind::View {
            mapping: mapping.clone(),
            offset: slot_offset,
            pages,
            flags,
        };
        Ok(())
    }

    /// Resolves a page fault at `va`.
    ///
    /// Returns `Ok(())` if the fault was serviced (the faulting access can
    /// be retried), [`Status::Forbidden`] for kernel-half addresses, and
    /// [`Status::NoSuchResource`] when nothing covers the address — the
    /// caller then forwards the fault to userspace or kills the thread.
    pub fn handle_fault(&self, va: VirtAddr, frames: &mut dyn FrameSource) -> KResult<()> {
        if va.is_kernel_half() {
            return Err(Status::Forbidden);
        }
        let page_va = va.align_down(PAGE_SIZE as u64);
        let inner = self.inner.lock();

        let rec = inner
            .ranges
            .iter()
            .find(|r| {
                let pages = match &r.kind {
                    RangeKind::Anon { pages, .. }
                    | RangeKind::Phys { pages }
                    | RangeKind::View { pages, .. } => *pages,
                };
                page_va >= r.base && page_va.as_u64() < r.base.as_u64() + pages * PAGE_SIZE as u64
            })
            .ok_or(Status::NoSuchResource)?;

        match &rec.kind {
            RangeKind::Anon { flags, .. } => {
                let flags = *flags;
                self.materialise_zeroed(page_va, flags, frames)
            }
            RangeKind::View {
                mapping,
                offset,
                flags,
                ..
            } => {
                let slot = *offset + ((page_va - rec.base) / PAGE_SIZE as u64) as usize;
                let (mapping, flags) = (mapping.clone(), *flags);
                let resolved = mapping.resolve(slot, frames)?;
                match resolved.init {
                    SlotInit::None => {}
                    // SAFETY: The frame was just handed out by the
                    // allocator; the HHDM maps it.
                    SlotInit::Zero => unsafe { self.zero_frame(resolved.frame) },
                    // SAFETY: Source and destination are distinct live
                    // frames mapped by the HHDM.
                    SlotInit::CopyFrom(src) => unsafe { self.copy_frame(resolved.frame, src) },
                }
                // SAFETY: We own root_phys.
                let flush = unsafe {
                    self.mapper.map(
                        self.root_phys,
                        Page::containing_address(page_va),
                        resolved.frame,
                        self.effective_flags(page_va, flags),
                        &mut || frames.allocate_frame(),
                    )?
                };
                flush.ignore();
                mapping.retain_slot(slot)?;
                Ok(())
            }
            // Physical windows are mapped eagerly; a fault inside one means
            // the access itself was bad (e.g. a write to a read-only page).
            RangeKind::Phys { .. } => Err(Status::Forbidden),
        }
    }

    /// Translates a virtual address under the space lock.
    pub fn virtual_to_physical(&self, va: VirtAddr) -> KResult<PhysAddr> {
        let _inner = self.inner.lock();
        // SAFETY: We own root_phys and hold the space lock.
        unsafe { self.mapper.translate(self.root_phys, va) }
            .map(|t| t.phys)
            .ok_or(Status::NoSuchResource)
    }

    /// Translates without taking the space lock.
    ///
    /// Sound only during single-CPU boot, which the [`EarlyBoot`] token
    /// attests.
    pub fn virtual_to_physical_early(&self, _boot: &EarlyBoot, va: VirtAddr) -> KResult<PhysAddr> {
        // SAFETY: The EarlyBoot token guarantees no concurrent mutation.
        unsafe { self.mapper.translate(self.root_phys, va) }
            .map(|t| t.phys)
            .ok_or(Status::NoSuchResource)
    }

    /// Releases every installed range: anonymous frames go back to the
    /// allocator, view slots are released, windows are unmapped.
    ///
    /// Called during process teardown, before the last reference drops.
    pub fn tear_down(&self, frames: &mut dyn FrameSource) {
        let bases: Vec<(VirtAddr, bool)> = {
            let inner = self.inner.lock();
            inner
                .ranges
                .iter()
                .map(|r| (r.base, matches!(r.kind, RangeKind::View { .. })))
                .collect()
        };
        for (base, is_view) in bases {
            let result = if is_view {
                self.remove_mapping(base)
            } else {
                self.free(base, 1, frames)
            };
            debug_assert!(result.is_ok(), "teardown failed for range at {base}");
        }
    }

    // -- internals ----------------------------------------------------------

    /// Materialises one zeroed page at `va`.
    fn materialise_zeroed(
        &self,
        va: VirtAddr,
        flags: MapFlags,
        frames: &mut dyn FrameSource,
    ) -> KResult<()> {
        let frame = frames.allocate_frame().ok_or(Status::TemporaryOutage)?;
        // SAFETY: The frame was just handed out; the HHDM maps it.
        unsafe { self.zero_frame(frame) };
        // SAFETY: We own root_phys.
        let flush = unsafe {
            self.mapper.map(
                self.root_phys,
                Page::containing_address(va),
                frame,
                self.effective_flags(va, flags),
                &mut || frames.allocate_frame(),
            )?
        };
        flush.ignore();
        Ok(())
    }

    /// Adds `USER` for user-half addresses.
    fn effective_flags(&self, va: VirtAddr, flags: MapFlags) -> MapFlags {
        if va.is_kernel_half() {
            flags
        } else {
            flags | MapFlags::USER
        }
    }

    /// Rejects ranges that leave the user half.
    fn check_user_range(&self, va: VirtAddr, page_count: u64) -> KResult<()> {
        let end = va.as_u64() + page_count * PAGE_SIZE as u64;
        if va.is_kernel_half() || end > KERNEL_BASE {
            return Err(Status::Forbidden);
        }
        Ok(())
    }

    unsafe fn zero_frame(&self, frame: PhysFrame<Size4KiB>) {
        let ptr = (self.hhdm_offset + frame.start_address().as_u64()) as *mut u8;
        // SAFETY: Caller guarantees the frame is live and HHDM-mapped.
        unsafe { core::ptr::write_bytes(ptr, 0, PAGE_SIZE) };
    }

    unsafe fn copy_frame(&self, dst: PhysFrame<Size4KiB>, src: PhysFrame<Size4KiB>) {
        let dst_ptr = (self.hhdm_offset + dst.start_address().as_u64()) as *mut u8;
        let src_ptr = (self.hhdm_offset + src.start_address().as_u64()) as *const u8;
        // SAFETY: Caller guarantees both frames are live, distinct, and
        // HHDM-mapped.
        unsafe { core::ptr::copy_nonoverlapping(src_ptr, dst_ptr, PAGE_SIZE) };
    }
}

impl<M: PageMapper + PageTranslator> Drop for AddressSpace<M> {
    fn drop(&mut self) {
        (self.release_root)(PhysFrame::containing_address(self.root_phys));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::FrameAllocator;
    use crate::mapper::{MapFlush, Translation};
    use core::alloc::Layout;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Simulated RAM backing the test frames, so zero/copy paths run for
    /// real: `phys = offset into buffer`, `hhdm = buffer base`.
    struct SimRam {
        base: *mut u8,
        bytes: usize,
    }

    impl SimRam {
        fn new(frames: usize) -> Self {
            let layout = Layout::from_size_align(frames * PAGE_SIZE, PAGE_SIZE).unwrap();
            // SAFETY: non-zero size. Deliberately NOT zeroed, so the
            // zero-fill path is actually observable.
            let base = unsafe { std::alloc::alloc(layout) };
            assert!(!base.is_null());
            // SAFETY: base..base+bytes is owned by us.
            unsafe { core::ptr::write_bytes(base, 0xAB, frames * PAGE_SIZE) };
            Self {
                base,
                bytes: frames * PAGE_SIZE,
            }
        }

        fn hhdm(&self) -> u64 {
            self.base as u64
        }

        fn byte_at(&self, phys: u64) -> u8 {
            assert!((phys as usize) < self.bytes);
            // SAFETY: bounds-checked above.
            unsafe { *self.base.add(phys as usize) }
        }

        fn write_byte(&self, phys: u64, value: u8) {
            assert!((phys as usize) < self.bytes);
            // SAFETY: bounds-checked above.
            unsafe { *self.base.add(phys as usize) = value };
        }
    }

    impl Drop for SimRam {
        fn drop(&mut self) {
            let layout = Layout::from_size_align(self.bytes, PAGE_SIZE).unwrap();
            // SAFETY: Same layout as the allocation.
            unsafe { std::alloc::dealloc(self.base, layout) };
        }
    }

    /// Frame source handing out consecutive frames of the simulated RAM.
    struct SimFrames {
        next: u64,
        limit: u64,
        freed: Vec<u64>,
        allocated: usize,
    }

    impl SimFrames {
        fn new(frames: usize) -> Self {
            Self {
                next: 0,
                limit: (frames * PAGE_SIZE) as u64,
                freed: Vec::new(),
                allocated: 0,
            }
        }
    }

    unsafe impl FrameAllocator<Size4KiB> for SimFrames {
        fn allocate_frame(&mut self) -> Option<PhysFrame<Size4KiB>> {
            self.allocated += 1;
            if let Some(addr) = self.freed.pop() {
                return Some(PhysFrame::containing_address(PhysAddr::new(addr)));
            }
            if self.next >= self.limit {
                self.allocated -= 1;
                return None;
            }
            let addr = self.next;
            self.next += PAGE_SIZE as u64;
            Some(PhysFrame::containing_address(PhysAddr::new(addr)))
        }
    }

    unsafe impl crate::FrameDeallocator<Size4KiB> for SimFrames {
        unsafe fn deallocate_frame(&mut self, frame: PhysFrame<Size4KiB>) {
            self.allocated -= 1;
            self.freed.push(frame.start_address().as_u64());
        }
    }

    /// In-memory page tables: (root, page) → (frame, flags).
    #[derive(Default)]
    struct SimMapper {
        entries: Mutex<HashMap<(u64, u64), (u64, MapFlags)>>,
    }

    impl PageMapper for SimMapper {
        unsafe fn map(
            &self,
            root: PhysAddr,
            page: Page<Size4KiB>,
            frame: PhysFrame<Size4KiB>,
            flags: MapFlags,
            _table_alloc: &mut dyn FnMut() -> Option<PhysFrame<Size4KiB>>,
        ) -> KResult<MapFlush> {
            self.entries.lock().unwrap().insert(
                (root.as_u64(), page.start_address().as_u64()),
                (frame.start_address().as_u64(), flags),
            );
            Ok(MapFlush::new(page.start_address()))
        }

        unsafe fn unmap(
            &self,
            root: PhysAddr,
            page: Page<Size4KiB>,
        ) -> KResult<(PhysFrame<Size4KiB>, MapFlags, MapFlush)> {
            let (frame, flags) = self
                .entries
                .lock()
                .unwrap()
                .remove(&(root.as_u64(), page.start_address().as_u64()))
                .ok_or(Status::NoSuchResource)?;
            Ok((
                PhysFrame::containing_address(PhysAddr::new(frame)),
                flags,
                MapFlush::new(page.start_address()),
            ))
        }

        unsafe fn update_flags(
            &self,
            root: PhysAddr,
            page: Page<Size4KiB>,
            flags: MapFlags,
        ) -> KResult<MapFlush> {
            let mut entries = self.entries.lock().unwrap();
            let entry = entries
                .get_mut(&(root.as_u64(), page.start_address().as_u64()))
                .ok_or(Status::NoSuchResource)?;
            entry.1 = flags;
            Ok(MapFlush::new(page.start_address()))
        }
    }

    impl PageTranslator for SimMapper {
        unsafe fn translate(&self, root: PhysAddr, virt: VirtAddr) -> Option<Translation> {
            let page = virt.align_down(PAGE_SIZE as u64);
            let entries = self.entries.lock().unwrap();
            let (frame, flags) = entries.get(&(root.as_u64(), page.as_u64()))?;
            Some(Translation {
                phys: PhysAddr::new(frame + virt.page_offset()),
                flags: *flags,
            })
        }
    }

    fn release_root(_frame: PhysFrame<Size4KiB>) {}

    fn release_mapping_frame(_frame: PhysFrame<Size4KiB>, _count: usize) {}

    fn make_space(ram: &SimRam) -> AddressSpace<SimMapper> {
        AddressSpace::new(
            PhysAddr::new(0xFFF000),
            SimMapper::default(),
            ram.hhdm(),
            release_root,
        )
    }

    #[test]
    fn prefaulted_allocation_maps_zeroed_pages() {
        let ram = SimRam::new(32);
        let space = make_space(&ram);
        let mut frames = SimFrames::new(32);

        let va = space
            .allocate(2, 0, MapFlags::WRITABLE, true, &mut frames)
            .unwrap();
        let phys = space.virtual_to_physical(va).unwrap();
        assert_eq!(ram.byte_at(phys.as_u64()), 0, "page must be zero-filled");
        assert_eq!(frames.allocated, 2);
    }

    #[test]
    fn lazy_allocation_faults_in_one_page_at_a_time() {
        let ram = SimRam::new(32);
        let space = make_space(&ram);
        let mut frames = SimFrames::new(32);

        let va = space
            .allocate(4, 0, MapFlags::WRITABLE, false, &mut frames)
            .unwrap();
        assert_eq!(frames.allocated, 0);
        assert_eq!(
            space.virtual_to_physical(va).unwrap_err(),
            Status::NoSuchResource
        );

        space.handle_fault(va, &mut frames).unwrap();
        assert_eq!(frames.allocated, 1);
        let phys = space.virtual_to_physical(va).unwrap();
        assert_eq!(ram.byte_at(phys.as_u64()), 0);

        // Faulting another page consumes exactly one more frame.
        space
            .handle_fault(va + PAGE_SIZE as u64, &mut frames)
            .unwrap();
        assert_eq!(frames.allocated, 2);
    }

    #[test]
    fn fault_in_from_mapping_consumes_one_frame_per_page() {
        // Literal scenario: 2-page zero-fill mapping, read first byte of
        // each page, check the frame accounting after each fault.
        let ram = SimRam::new(32);
        let space = make_space(&ram);
        let mut frames = SimFrames::new(32);

        let mapping = Mapping::new_zeroed(2, release_mapping_frame).unwrap();
        let va = space
            .insert_mapping(&mapping, 0, 2, 0, MapFlags::WRITABLE)
            .unwrap();

        space.handle_fault(va, &mut frames).unwrap();
        let phys = space.virtual_to_physical(va).unwrap();
        assert_eq!(ram.byte_at(phys.as_u64()), 0);
        assert_eq!(frames.allocated, 1);

        space
            .handle_fault(va + PAGE_SIZE as u64, &mut frames)
            .unwrap();
        let phys2 = space
            .virtual_to_physical(va + PAGE_SIZE as u64)
            .unwrap();
        assert_eq!(ram.byte_at(phys2.as_u64()), 0);
        assert_eq!(frames.allocated, 2);
    }

    #[test]
    fn shared_mapping_across_spaces() {
        // Literal scenario: two spaces install the same mapping; a byte
        // written through one view is read through the other.
        let ram = SimRam::new(32);
        let space1 = make_space(&ram);
        let space2 = make_space(&ram);
        let mut frames = SimFrames::new(32);

        let mapping = Mapping::new_zeroed(4, release_mapping_frame).unwrap();
        let va1 = space1
            .insert_mapping(&mapping, 0, 4, 0, MapFlags::WRITABLE)
            .unwrap();
        let va2 = space2
            .insert_mapping(&mapping, 0, 4, 0, MapFlags::WRITABLE)
            .unwrap();

        space1.handle_fault(va1, &mut frames).unwrap();
        space2.handle_fault(va2, &mut frames).unwrap();

        let phys1 = space1.virtual_to_physical(va1).unwrap();
        let phys2 = space2.virtual_to_physical(va2).unwrap();
        assert_eq!(phys1, phys2, "views must share the backing frame");

        ram.write_byte(phys1.as_u64(), 0x5A);
        assert_eq!(ram.byte_at(phys2.as_u64()), 0x5A);
        assert_eq!(mapping.slot_refs(0).unwrap(), 2);
    }

    #[test]
    fn fault_outside_any_range() {
        let ram = SimRam::new(8);
        let space = make_space(&ram);
        let mut frames = SimFrames::new(8);
        assert_eq!(
            space
                .handle_fault(VirtAddr::new(0x7000_0000), &mut frames)
                .unwrap_err(),
            Status::NoSuchResource
        );
    }

    #[test]
    fn kernel_half_fault_is_forbidden() {
        let ram = SimRam::new(8);
        let space = make_space(&ram);
        let mut frames = SimFrames::new(8);
        assert_eq!(
            space
                .handle_fault(VirtAddr::new(0xFFFF_8000_0000_1000), &mut frames)
                .unwrap_err(),
            Status::Forbidden
        );
    }

    #[test]
    fn map_physical_window() {
        let ram = SimRam::new(8);
        let space = make_space(&ram);
        let mut frames = SimFrames::new(8);

        let virt = VirtAddr::new(0x4000_0000);
        space
            .map_physical(PhysAddr::new(0x2000), virt, 2, MapFlags::WRITABLE, &mut frames)
            .unwrap();
        assert_eq!(
            space.virtual_to_physical(virt).unwrap(),
            PhysAddr::new(0x2000)
        );
        // Freeing the window unmaps but allocates/frees no frames.
        space.free(virt, 2, &mut frames).unwrap();
        assert_eq!(frames.allocated, 0);
        assert_eq!(
            space.virtual_to_physical(virt).unwrap_err(),
            Status::NoSuchResource
        );
    }

    #[test]
    fn map_physical_into_kernel_half_is_forbidden() {
        let ram = SimRam::new(8);
        let space = make_space(&ram);
        let mut frames = SimFrames::new(8);
        assert_eq!(
            space
                .map_physical(
                    PhysAddr::new(0x2000),
                    VirtAddr::new(0xFFFF_9000_0000_0000),
                    1,
                    MapFlags::empty(),
                    &mut frames,
                )
                .unwrap_err(),
            Status::Forbidden
        );
    }

    #[test]
    fn free_returns_frames() {
        let ram = SimRam::new(32);
        let space = make_space(&ram);
        let mut frames = SimFrames::new(32);

        let va = space
            .allocate(4, 0, MapFlags::WRITABLE, true, &mut frames)
            .unwrap();
        assert_eq!(frames.allocated, 4);
        space.free(va, 4, &mut frames).unwrap();
        assert_eq!(frames.allocated, 0);
    }

    #[test]
    fn remove_mapping_releases_slots() {
        let ram = SimRam::new(32);
        let space = make_space(&ram);
        let mut frames = SimFrames::new(32);

        let mapping = Mapping::new_zeroed(2, release_mapping_frame).unwrap();
        let va = space
            .insert_mapping(&mapping, 0, 2, 0, MapFlags::WRITABLE)
            .unwrap();
        space.handle_fault(va, &mut frames).unwrap();
        assert_eq!(mapping.slot_refs(0).unwrap(), 1);

        space.remove_mapping(va).unwrap();
        assert_eq!(mapping.slot_refs(0).unwrap(), 0);
        assert_eq!(
            space.remove_mapping(va).unwrap_err(),
            Status::NoSuchResource
        );
    }

    #[test]
    fn move_into_mapping_transfers_frames() {
        let ram = SimRam::new(32);
        let space = make_space(&ram);
        let mut frames = SimFrames::new(32);

        let va = space
            .allocate(2, 0, MapFlags::WRITABLE, true, &mut frames)
            .unwrap();
        let phys_before = space.virtual_to_physical(va).unwrap();
        ram.write_byte(phys_before.as_u64(), 0x77);

        let mapping = Mapping::new_zeroed(2, release_mapping_frame).unwrap();
        space.move_into_mapping(va, 2, 0, &mapping).unwrap();

        // The mapping now owns the original frame, content intact.
        let adopted = mapping.slot_frame(0).unwrap();
        assert_eq!(adopted.start_address(), phys_before.align_down(4096));
        assert_eq!(ram.byte_at(adopted.start_address().as_u64()), 0x77);

        // A second space installing the mapping sees the same byte.
        let other = make_space(&ram);
        let va2 = other
            .insert_mapping(&mapping, 0, 2, 0, MapFlags::WRITABLE)
            .unwrap();
        other.handle_fault(va2, &mut frames).unwrap();
        let phys2 = other.virtual_to_physical(va2).unwrap();
        assert_eq!(ram.byte_at(phys2.as_u64()), 0x77);
    }

    #[test]
    fn move_requires_whole_anonymous_range() {
        let ram = SimRam::new(32);
        let space = make_space(&ram);
        let mut frames = SimFrames::new(32);

        let va = space
            .allocate(4, 0, MapFlags::WRITABLE, false, &mut frames)
            .unwrap();
        let mapping = Mapping::new_zeroed(4, release_mapping_frame).unwrap();
        assert_eq!(
            space.move_into_mapping(va, 2, 0, &mapping).unwrap_err(),
            Status::InvalidArgument
        );
    }

    #[test]
    fn copy_on_fault_view() {
        let ram = SimRam::new(32);
        let space = make_space(&ram);
        let mut frames = SimFrames::new(32);

        // Parent mapping with a written byte.
        let parent = Mapping::new_zeroed(1, release_mapping_frame).unwrap();
        let parent_va = space
            .insert_mapping(&parent, 0, 1, 0, MapFlags::WRITABLE)
            .unwrap();
        space.handle_fault(parent_va, &mut frames).unwrap();
        let parent_phys = space.virtual_to_physical(parent_va).unwrap();
        ram.write_byte(parent_phys.as_u64(), 0x42);

        // Child copy-on-fault view.
        let child = Mapping::new_zeroed(1, release_mapping_frame).unwrap();
        child.bind_copy_of(0, &parent, 0, 1).unwrap();
        let child_va = space
            .insert_mapping(&child, 0, 1, 0, MapFlags::WRITABLE)
            .unwrap();
        space.handle_fault(child_va, &mut frames).unwrap();
        let child_phys = space.virtual_to_physical(child_va).unwrap();

        // Same content, different frame; writes stay private.
        assert_ne!(child_phys, parent_phys);
        assert_eq!(ram.byte_at(child_phys.as_u64()), 0x42);
        ram.write_byte(child_phys.as_u64(), 0x99);
        assert_eq!(ram.byte_at(parent_phys.as_u64()), 0x42);
    }

    #[test]
    fn allocation_failure_rolls_back() {
        let ram = SimRam::new(32);
        let space = make_space(&ram);
        // Only 2 frames available; a 4-page prefault must fail cleanly.
        let mut frames = SimFrames::new(2);
        assert_eq!(
            space
                .allocate(4, 0, MapFlags::WRITABLE, true, &mut frames)
                .unwrap_err(),
            Status::TemporaryOutage
        );
        assert_eq!(frames.allocated, 0);
        // The virtual range was released too: a new allocation succeeds.
        let mut enough = SimFrames::new(8);
        assert!(
            space
                .allocate(2, 0, MapFlags::WRITABLE, true, &mut enough)
                .is_ok()
        );
    }

    #[test]
    fn tear_down_releases_everything() {
        let ram = SimRam::new(32);
        let space = make_space(&ram);
        let mut frames = SimFrames::new(32);

        let anon = space
            .allocate(2, 0, MapFlags::WRITABLE, true, &mut frames)
            .unwrap();
        let mapping = Mapping::new_zeroed(2, release_mapping_frame).unwrap();
        let view = space
            .insert_mapping(&mapping, 0, 2, 0, MapFlags::WRITABLE)
            .unwrap();
        space.handle_fault(view, &mut frames).unwrap();

        space.tear_down(&mut frames);
        // The anonymous frames came back; the view's frame stays with the
        // mapping (it owns it), so exactly one frame is still out.
        assert_eq!(frames.allocated, 1);
        assert_eq!(mapping.slot_refs(0).unwrap(), 0);
        assert_eq!(
            space.virtual_to_physical(anon).unwrap_err(),
            Status::NoSuchResource
        );
    }

    #[test]
    fn early_translate_matches_locked_translate() {
        let ram = SimRam::new(8);
        let space = make_space(&ram);
        let mut frames = SimFrames::new(8);
        let va = space
            .allocate(1, 0, MapFlags::WRITABLE, true, &mut frames)
            .unwrap();

        // SAFETY: Single-threaded test, no concurrent mutation.
        let token = unsafe { EarlyBoot::new() };
        assert_eq!(
            space.virtual_to_physical_early(&token, va).unwrap(),
            space.virtual_to_physical(va).unwrap()
        );
        token.finish();
    }
}
