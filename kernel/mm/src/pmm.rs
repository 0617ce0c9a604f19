//! Buddy-based physical frame allocator.
//!
//! Free frames are organised per power-of-two block size (4 KiB up to
//! [`MAX_ORDER`] pages). Free blocks are threaded through their own memory:
//! the first three words of a free block hold the prev/next links and the
//! block order, accessed through the HHDM. A bitmap with one bit per frame
//! marks block starts, giving O(1) buddy membership checks so that
//! allocation and free are O(log max-order).
//!
//! A small reserve of single frames is kept aside so that page-fault
//! servicing can always make progress even when the buddy lists are empty.

use core::sync::atomic::{AtomicU64, Ordering};

use anillo_core::addr::PhysAddr;
use anillo_core::page::{PhysFrame, Size4KiB};
use anillo_core::status::{KResult, Status};
use anillo_core::sync::IrqSpinLock;
use planck_noalloc::vec::ArrayVec;

use crate::{FrameAllocator, FrameDeallocator, PhysMemoryRegion};

const FRAME_SIZE: u64 = 4096;
const BITS_PER_WORD: usize = 64;

/// Number of buddy orders: order `k` holds blocks of `2^k` frames.
pub const MAX_ORDER: usize = 11;

/// Frames kept aside for page-fault servicing.
const FAULT_RESERVE_FRAMES: usize = 16;

/// Sentinel for "no block" in the intrusive free lists.
const NIL: u64 = u64::MAX;

/// Frames currently handed out (telemetry; readable without the lock).
static IN_USE_FRAMES: AtomicU64 = AtomicU64::new(0);

/// Intrusive header at the start of every free block, accessed via HHDM.
#[repr(C)]
struct FreeHeader {
    prev: u64,
    next: u64,
    order: u64,
}

/// A snapshot of the allocator's frame accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameStats {
    /// Frames tracked by the allocator (usable RAM minus the bitmap).
    pub total_frames: usize,
    /// Frames currently on the buddy free lists.
    pub free_frames: usize,
    /// Frames currently parked in the fault reserve.
    pub reserved_frames: usize,
}

/// A buddy-based physical frame allocator.
///
/// All mutation goes through `&mut self`; the outer
/// `PMM: IrqSpinLock<Option<…>>` provides thread safety.
pub struct BuddyAllocator {
    /// Head (physical address) of the free list per order; `NIL` if empty.
    free_heads: [u64; MAX_ORDER],
    /// One bit per frame: set means the frame starts a free block.
    bitmap: &'static mut [u64],
    /// Total number of frames handed to the allocator.
    total_frames: usize,
    /// Frames currently free on the buddy lists.
    free_frames: usize,
    /// HHDM offset for physical-to-virtual translation.
    hhdm_offset: u64,
    /// Single frames set aside for fault servicing.
    reserve: ArrayVec<u64, FAULT_RESERVE_FRAMES>,
}

impl BuddyAllocator {
    /// Creates a new buddy allocator from a slice of physical memory
    /// regions.
    ///
    /// # Safety
    ///
    /// - `hhdm_offset` must map every usable physical address.
    /// - `regions` must accurately describe physical memory.
    /// - This must be called exactly once per memory map.
    pub unsafe fn new(regions: &[PhysMemoryRegion], hhdm_offset: u64) -> KResult<Self> {
        let max_phys = regions
            .iter()
            .filter(|r| r.usable)
            .map(|r| r.start.as_u64() + r.size)
            .max()
            .unwrap_or(0);
        if max_phys == 0 {
            return Err(Status::PermanentOutage);
        }

        let frame_count = (max_phys / FRAME_SIZE) as usize;
        let bitmap_words = frame_count.div_ceil(BITS_PER_WORD);
        let bitmap_bytes = (bitmap_words * 8) as u64;

        // Place the bitmap in the first usable region that can hold it.
        let bitmap_phys = regions
            .iter()
            .filter(|r| r.usable && r.size >= bitmap_bytes)
            .map(|r| r.start)
            .next()
            .ok_or(Status::PermanentOutage)?;
        let bitmap_end = (bitmap_phys.as_u64() + bitmap_bytes + FRAME_SIZE - 1) & !(FRAME_SIZE - 1);

        // SAFETY: The HHDM offset is valid and bitmap_phys points into a
        // usable region large enough for bitmap_words * 8 bytes. The region
        // is not aliased; nothing else runs this early.
        let bitmap = unsafe {
            let ptr = (hhdm_offset + bitmap_phys.as_u64()) as *mut u64;
            core::slice::from_raw_parts_mut(ptr, bitmap_words)
        };
        bitmap.fill(0);

        let mut this = Self {
            free_heads: [NIL; MAX_ORDER],
            bitmap,
            total_frames: 0,
            free_frames: 0,
            hhdm_offset,
            reserve: ArrayVec::new(),
        };

        // Free every usable frame, skipping the bitmap's own frames.
        for region in regions.iter().filter(|r| r.usable) {
            let start = region.start.as_u64();
            let end = start + region.size;
            if start < bitmap_end && end > bitmap_phys.as_u64() {
                // Region overlaps the bitmap; free the pieces around it.
                if start < bitmap_phys.as_u64() {
                    this.release_range(start, bitmap_phys.as_u64());
                }
                if end > bitmap_end {
                    this.release_range(bitmap_end, end);
                }
                this.total_frames += ((end - start) / FRAME_SIZE) as usize;
                this.total_frames -= ((bitmap_end - bitmap_phys.as_u64()) / FRAME_SIZE) as usize;
            } else {
                this.release_range(start, end);
                this.total_frames += ((end - start) / FRAME_SIZE) as usize;
            }
        }

        this.refill_reserve();
        Ok(this)
    }

    /// Allocates `page_count` contiguous frames aligned to
    /// `2^alignment_power` frames.
    ///
    /// Returns the first frame and the number of frames actually handed out
    /// (the enclosing power-of-two block). Fails with
    /// [`Status::PermanentOutage`] if no block is available and
    /// [`Status::TooBig`] if the request exceeds the largest block size.
    pub fn allocate(
        &mut self,
        page_count: usize,
        alignment_power: u32,
    ) -> KResult<(PhysFrame<Size4KiB>, usize)> {
        if page_count == 0 {
            return Err(Status::InvalidArgument);
        }
        let order = order_for(page_count).max(alignment_power as usize);
        if order >= MAX_ORDER {
            return Err(Status::TooBig);
        }

        let addr = self.take_block(order).ok_or(Status::PermanentOutage)?;
        let allocated = 1usize << order;
        IN_USE_FRAMES.fetch_add(allocated as u64, Ordering::Relaxed);
        Ok((
            PhysFrame::containing_address(PhysAddr::new(addr)),
            allocated,
        ))
    }

    /// Allocates a single frame from the fault reserve.
    ///
    /// Falls back to the buddy lists if the reserve is empty; fails only
    /// when both are exhausted. Callers refill via
    /// [`refill_reserve`](Self::refill_reserve) once out of the fault path.
    pub fn allocate_reserved(&mut self) -> KResult<PhysFrame<Size4KiB>> {
        if let Some(addr) = self.reserve.pop() {
            IN_USE_FRAMES.fetch_add(1, Ordering::Relaxed);
            return Ok(PhysFrame::containing_address(PhysAddr::new(addr)));
        }
        self.allocate(1, 0).map(|(frame, _)| frame)
    }

    /// Tops the fault reserve back up from the buddy lists.
    pub fn refill_reserve(&mut self) {
        while self.reserve.len() < FAULT_RESERVE_FRAMES {
            match self.take_block(0) {
                Some(addr) => self.reserve.push(addr),
                None => break,
            }
        }
    }

    /// Frees `page_count` frames starting at `frame`.
    ///
    /// `page_count` must be the count returned by
    /// [`allocate`](Self::allocate); the block is coalesced with free
    /// buddies.
    ///
    /// # Safety
    ///
    /// The block must have been allocated by this allocator and must not be
    /// in use.
    pub unsafe fn free(&mut self, frame: PhysFrame<Size4KiB>, page_count: usize) {
        let order = order_for(page_count);
        debug_assert_eq!(1usize << order, page_count, "free of a non-block count");
        let addr = frame.start_address().as_u64();
        debug_assert!(!self.test_bit(addr), "double free of block at {:#x}", addr);

        IN_USE_FRAMES.fetch_sub(page_count as u64, Ordering::Relaxed);
        self.release_block(addr, order);
    }

    /// Returns the number of free frames on the buddy lists.
    pub fn free_frames(&self) -> usize {
        self.free_frames
    }

    /// Returns a snapshot of the frame accounting.
    pub fn stats(&self) -> FrameStats {
        FrameStats {
            total_frames: self.total_frames,
            free_frames: self.free_frames,
            reserved_frames: self.reserve.len(),
        }
    }

    // -- internals ----------------------------------------------------------

    /// Pops a block of exactly `order`, splitting larger blocks as needed.
    fn take_block(&mut self, order: usize) -> Option<u64> {
        let mut found = None;
        for candidate in order..MAX_ORDER {
            if self.free_heads[candidate] != NIL {
                found = Some(candidate);
                break;
            }
        }
        let mut block_order = found?;
        let addr = self.free_heads[block_order];
        self.unlink(addr);

        // Split down to the requested order, returning the upper halves.
        while block_order > order {
            block_order -= 1;
            let upper = addr + (FRAME_SIZE << block_order);
            self.link(upper, block_order);
        }
        self.free_frames -= 1 << order;
        Some(addr)
    }

    /// Returns a block to the free lists, coalescing with its buddy while
    /// possible.
    fn release_block(&mut self, mut addr: u64, mut order: usize) {
        self.free_frames += 1 << order;
        while order + 1 < MAX_ORDER {
            let buddy = addr ^ (FRAME_SIZE << order);
            if (buddy / FRAME_SIZE) as usize >= self.bitmap.len() * BITS_PER_WORD {
                break;
            }
            if !self.test_bit(buddy) {
                break;
            }
            // The buddy starts a free block; it only merges if it has the
            // same order.
            // SAFETY: test_bit guarantees a FreeHeader is present at buddy.
            let buddy_order = unsafe { (*self.header(buddy)).order } as usize;
            if buddy_order != order {
                break;
            }
            self.unlink(buddy);
            addr = addr.min(buddy);
            order += 1;
        }
        self.link(addr, order);
    }

    /// Carves `[start, end)` into maximal naturally-aligned blocks and
    /// frees them.
    fn release_range(&mut self, start: u64, end: u64) {
        let mut addr = (start + FRAME_SIZE - 1) & !(FRAME_SIZE - 1);
        let end = end & !(FRAME_SIZE - 1);
        while addr < end {
            let mut order = MAX_ORDER - 1;
            while order > 0
                && (addr & ((FRAME_SIZE << order) - 1) != 0 || addr + (FRAME_SIZE << order) > end)
            {
                order -= 1;
            }
            self.link(addr, order);
            self.free_frames += 1 << order;
            addr += FRAME_SIZE << order;
        }
    }

    fn header(&self, phys: u64) -> *mut FreeHeader {
        (self.hhdm_offset + phys) as *mut FreeHeader
    }

    /// Pushes a block onto its order's free list and marks its start bit.
    fn link(&mut self, addr: u64, order: usize) {
        let head = self.free_heads[order];
        // SAFETY: `addr` is the start of an unused block owned by the
        // allocator; the HHDM maps it.
        unsafe {
            (*self.header(addr)).prev = NIL;
            (*self.header(addr)).next = head;
            (*self.header(addr)).order = order as u64;
            if head != NIL {
                (*self.header(head)).prev = addr;
            }
        }
        self.free_heads[order] = addr;
        self.set_bit(addr);
    }

    /// Unlinks a free block from its order's list and clears its start bit.
    fn unlink(&mut self, addr: u64) {
        // SAFETY: The block is on a free list, so its header is valid.
        unsafe {
            let header = self.header(addr);
            let (prev, next, order) = ((*header).prev, (*header).next, (*header).order);
            if prev != NIL {
                (*self.header(prev)).next = next;
            } else {
                self.free_heads[order as usize] = next;
            }
            if next != NIL {
                (*self.header(next)).prev = prev;
            }
        }
        self.clear_bit(addr);
    }

    fn set_bit(&mut self, phys: u64) {
        let frame = (phys / FRAME_SIZE) as usize;
        self.bitmap[frame / BITS_PER_WORD] |= 1u64 << (frame % BITS_PER_WORD);
    }

    fn clear_bit(&mut self, phys: u64) {
        let frame = (phys / FRAME_SIZE) as usize;
        self.bitmap[frame / BITS_PER_WORD] &= !(1u64 << (frame % BITS_PER_WORD));
    }

    fn test_bit(&self, phys: u64) -> bool {
        let frame = (phys / FRAME_SIZE) as usize;
        self.bitmap[frame / BITS_PER_WORD] & (1u64 << (frame % BITS_PER_WORD)) != 0
    }
}

/// Returns the smallest order whose block covers `page_count` frames.
fn order_for(page_count: usize) -> usize {
    page_count.next_power_of_two().trailing_zeros() as usize
}

// ---------------------------------------------------------------------------
// Global PMM
// ---------------------------------------------------------------------------

/// Global physical memory manager.
static PMM: IrqSpinLock<Option<BuddyAllocator>> = IrqSpinLock::new(None);

/// Initializes the PMM from a slice of physical memory regions.
///
/// The caller is responsible for converting the boot memory map into
/// [`PhysMemoryRegion`] descriptors before calling this function.
///
/// # Safety
///
/// Same contract as [`BuddyAllocator::new`].
pub unsafe fn init(regions: &[PhysMemoryRegion], hhdm_offset: u64) {
    // SAFETY: Forwarded caller contract.
    let allocator =
        unsafe { BuddyAllocator::new(regions, hhdm_offset).expect("failed to initialize PMM") };
    let mut pmm = PMM.lock();
    assert!(pmm.is_none(), "PMM already initialized");
    *pmm = Some(allocator);
}

/// Executes a closure with an exclusive reference to the global PMM.
///
/// # Panics
///
/// Panics if the PMM has not been initialized.
pub fn with<R>(f: impl FnOnce(&mut BuddyAllocator) -> R) -> R {
    let mut pmm = PMM.lock();
    f(pmm.as_mut().expect("PMM not initialized"))
}

/// Attempts to execute a closure with an exclusive reference to the global
/// PMM.
///
/// Returns `None` if the PMM lock is already held (avoiding deadlock in
/// fault handlers) or if the PMM has not been initialized yet.
pub fn try_with<R>(f: impl FnOnce(&mut BuddyAllocator) -> R) -> Option<R> {
    let mut pmm = PMM.try_lock()?;
    Some(f(pmm.as_mut()?))
}

/// Returns the number of frames currently handed out, without locking.
pub fn frames_in_use() -> u64 {
    IN_USE_FRAMES.load(Ordering::Relaxed)
}

/// A [`FrameAllocator`]/[`FrameDeallocator`] over the global PMM, for
/// passing into address-space and mapping operations.
pub struct GlobalFrames;

unsafe impl FrameAllocator<Size4KiB> for GlobalFrames {
    fn allocate_frame(&mut self) -> Option<PhysFrame<Size4KiB>> {
        with(|pmm| pmm.allocate(1, 0).ok().map(|(frame, _)| frame))
    }
}

unsafe impl FrameDeallocator<Size4KiB> for GlobalFrames {
    unsafe fn deallocate_frame(&mut self, frame: PhysFrame<Size4KiB>) {
        // SAFETY: Forwarded caller contract.
        with(|pmm| unsafe { pmm.free(frame, 1) });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::alloc::Layout;
    use std::collections::HashSet;

    const PAGE: usize = FRAME_SIZE as usize;

    /// Simulated RAM: `phys = offset into buffer`, `hhdm = buffer base`.
    struct SimRam {
        base: *mut u8,
        bytes: usize,
    }

    impl SimRam {
        fn new(frames: usize) -> Self {
            let layout = Layout::from_size_align(frames * PAGE, PAGE).unwrap();
            // SAFETY: layout has non-zero size.
            let base = unsafe { std::alloc::alloc_zeroed(layout) };
            assert!(!base.is_null());
            Self {
                base,
                bytes: frames * PAGE,
            }
        }

        fn regions(&self) -> [PhysMemoryRegion; 1] {
            [PhysMemoryRegion {
                start: PhysAddr::new(0),
                size: self.bytes as u64,
                usable: true,
            }]
        }

        fn hhdm(&self) -> u64 {
            self.base as u64
        }
    }

    impl Drop for SimRam {
        fn drop(&mut self) {
            let layout = Layout::from_size_align(self.bytes, PAGE).unwrap();
            // SAFETY: Same layout as the allocation.
            unsafe { std::alloc::dealloc(self.base, layout) };
        }
    }

    fn make_allocator(frames: usize) -> (SimRam, BuddyAllocator) {
        let ram = SimRam::new(frames);
        // SAFETY: The simulated regions and HHDM offset are consistent.
        let alloc = unsafe { BuddyAllocator::new(&ram.regions(), ram.hhdm()).unwrap() };
        (ram, alloc)
    }

    #[test]
    fn order_for_rounds_up() {
        assert_eq!(order_for(1), 0);
        assert_eq!(order_for(2), 1);
        assert_eq!(order_for(3), 2);
        assert_eq!(order_for(4), 2);
        assert_eq!(order_for(5), 3);
        assert_eq!(order_for(1024), 10);
    }

    #[test]
    fn init_accounting() {
        let (_ram, alloc) = make_allocator(256);
        let stats = alloc.stats();
        // One frame is consumed by the bitmap; the reserve is carved out of
        // the free lists.
        assert_eq!(stats.total_frames, 255);
        assert_eq!(stats.reserved_frames, FAULT_RESERVE_FRAMES);
        assert_eq!(stats.free_frames, stats.total_frames - FAULT_RESERVE_FRAMES);
    }

    #[test]
    fn allocate_single() {
        let (_ram, mut alloc) = make_allocator(256);
        let free_before = alloc.free_frames();
        let (frame, count) = alloc.allocate(1, 0).unwrap();
        assert_eq!(count, 1);
        assert!(frame.start_address().is_aligned(FRAME_SIZE));
        assert_eq!(alloc.free_frames(), free_before - 1);
    }

    #[test]
    fn allocate_rounds_to_block() {
        let (_ram, mut alloc) = make_allocator(256);
        let (_, count) = alloc.allocate(3, 0).unwrap();
        assert_eq!(count, 4);
        let (_, count) = alloc.allocate(5, 0).unwrap();
        assert_eq!(count, 8);
    }

    #[test]
    fn allocate_respects_alignment() {
        let (_ram, mut alloc) = make_allocator(256);
        // Force misalignment pressure by taking a single frame first.
        let _ = alloc.allocate(1, 0).unwrap();
        let (frame, count) = alloc.allocate(1, 3).unwrap();
        assert_eq!(count, 8);
        assert!(frame.start_address().is_aligned(8 * FRAME_SIZE));
    }

    #[test]
    fn allocate_zero_is_invalid() {
        let (_ram, mut alloc) = make_allocator(64);
        assert!(matches!(
            alloc.allocate(0, 0),
            Err(Status::InvalidArgument)
        ));
    }

    #[test]
    fn allocate_too_big() {
        let (_ram, mut alloc) = make_allocator(64);
        assert_eq!(
            alloc.allocate(1 << MAX_ORDER, 0).unwrap_err(),
            Status::TooBig
        );
    }

    #[test]
    fn exhaustion_is_permanent_outage() {
        let (_ram, mut alloc) = make_allocator(64);
        while alloc.allocate(1, 0).is_ok() {}
        assert_eq!(alloc.allocate(1, 0).unwrap_err(), Status::PermanentOutage);
    }

    #[test]
    fn no_duplicate_frames() {
        let (_ram, mut alloc) = make_allocator(256);
        let mut seen = HashSet::new();
        while let Ok((frame, _)) = alloc.allocate(1, 0) {
            assert!(
                seen.insert(frame.start_address().as_u64()),
                "duplicate frame {:#x}",
                frame.start_address().as_u64()
            );
        }
    }

    #[test]
    fn free_coalesces_back_to_initial() {
        let (_ram, mut alloc) = make_allocator(256);
        let free_before = alloc.free_frames();

        let mut blocks = Vec::new();
        for _ in 0..32 {
            blocks.push(alloc.allocate(1, 0).unwrap());
        }
        for (frame, count) in blocks {
            // SAFETY: Frames come from this allocator and are unused.
            unsafe { alloc.free(frame, count) };
        }
        assert_eq!(alloc.free_frames(), free_before);

        // Coalescing proof: a large block must be allocatable again.
        let (_, count) = alloc.allocate(64, 0).unwrap();
        assert_eq!(count, 64);
    }

    #[test]
    fn interleaved_alloc_free_conserves_totals() {
        let (_ram, mut alloc) = make_allocator(256);
        let total = alloc.stats().total_frames;

        let mut held: Vec<(PhysFrame<Size4KiB>, usize)> = Vec::new();
        for round in 0..50usize {
            if round % 3 == 2 {
                if let Some((frame, count)) = held.pop() {
                    // SAFETY: Frames come from this allocator and are unused.
                    unsafe { alloc.free(frame, count) };
                }
            } else if let Ok(block) = alloc.allocate(1 + round % 4, 0) {
                held.push(block);
            }
            let in_use: usize = held.iter().map(|(_, c)| c).sum();
            let stats = alloc.stats();
            assert_eq!(
                stats.free_frames + stats.reserved_frames + in_use,
                total,
                "frame accounting drifted at round {round}"
            );
        }
    }

    #[test]
    fn reserve_survives_exhaustion() {
        let (_ram, mut alloc) = make_allocator(64);
        while alloc.allocate(1, 0).is_ok() {}
        // The buddy lists are dry, but the fault reserve still delivers.
        for _ in 0..FAULT_RESERVE_FRAMES {
            assert!(alloc.allocate_reserved().is_ok());
        }
        assert_eq!(
            alloc.allocate_reserved().unwrap_err(),
            Status::PermanentOutage
        );
    }

    #[test]
    fn refill_reserve_after_drain() {
        let (_ram, mut alloc) = make_allocator(256);
        for _ in 0..FAULT_RESERVE_FRAMES {
            alloc.allocate_reserved().unwrap();
        }
        assert_eq!(alloc.stats().reserved_frames, 0);
        alloc.refill_reserve();
        assert_eq!(alloc.stats().reserved_frames, FAULT_RESERVE_FRAMES);
    }

    #[test]
    fn multiple_regions() {
        // Two usable regions with an unusable hole between them.
        let ram = SimRam::new(192);
        let regions = [
            PhysMemoryRegion {
                start: PhysAddr::new(0),
                size: 64 * FRAME_SIZE,
                usable: true,
            },
            PhysMemoryRegion {
                start: PhysAddr::new(64 * FRAME_SIZE),
                size: 64 * FRAME_SIZE,
                usable: false,
            },
            PhysMemoryRegion {
                start: PhysAddr::new(128 * FRAME_SIZE),
                size: 64 * FRAME_SIZE,
                usable: true,
            },
        ];
        // SAFETY: The simulated regions and HHDM offset are consistent.
        let mut alloc = unsafe { BuddyAllocator::new(&regions, ram.hhdm()).unwrap() };
        assert_eq!(alloc.stats().total_frames, 127);

        // Every allocated frame must land in a usable region.
        while let Ok((frame, count)) = alloc.allocate(1, 0) {
            let addr = frame.start_address().as_u64();
            let in_hole = addr >= 64 * FRAME_SIZE && addr < 128 * FRAME_SIZE;
            assert!(!in_hole, "allocated from unusable hole: {addr:#x}");
            assert_eq!(count, 1);
        }
    }
}
