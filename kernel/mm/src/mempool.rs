//! General-purpose kernel allocator.
//!
//! Small requests are served from per-size-class [`Slab`]s; anything larger
//! goes straight to the page provider. The provider hands out physically
//! contiguous pages, so the `PHYS_CONTIGUOUS` flag only changes routing:
//! such requests always bypass the slabs, whatever their size.
//!
//! `realloc` prefers in-place growth: requests that stay within the same
//! size class (or the same page count) keep their address.

use core::ptr::NonNull;

use anillo_core::status::{KResult, Status};
use anillo_core::sync::IrqSpinLock;

use crate::PAGE_SIZE;
use crate::slab::{PageProvider, Slab};

bitflags::bitflags! {
    /// Allocation flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AllocFlags: u32 {
        /// The allocation must be physically contiguous.
        const PHYS_CONTIGUOUS = 1 << 0;
    }
}

/// Size classes served by slabs; larger requests use whole pages.
const CLASS_SIZES: [usize; 8] = [16, 32, 64, 128, 256, 512, 1024, 2048];

/// A general allocator over a [`PageProvider`].
pub struct Mempool<P: PageProvider> {
    classes: [Slab; CLASS_SIZES.len()],
    provider: IrqSpinLock<P>,
}

impl<P: PageProvider> Mempool<P> {
    /// Creates a mempool drawing pages from `provider`.
    pub const fn new(provider: P) -> Self {
        Self {
            classes: [
                Slab::new(CLASS_SIZES[0]),
                Slab::new(CLASS_SIZES[1]),
                Slab::new(CLASS_SIZES[2]),
                Slab::new(CLASS_SIZES[3]),
                Slab::new(CLASS_SIZES[4]),
                Slab::new(CLASS_SIZES[5]),
                Slab::new(CLASS_SIZES[6]),
                Slab::new(CLASS_SIZES[7]),
            ],
            provider: IrqSpinLock::new(provider),
        }
    }

    /// Allocates `size` bytes aligned to `align`.
    pub fn allocate(&self, size: usize, align: usize, flags: AllocFlags) -> KResult<NonNull<u8>> {
        if size == 0 || !align.is_power_of_two() {
            return Err(Status::InvalidArgument);
        }
        if align > PAGE_SIZE {
            return Err(Status::Unsupported);
        }

        match self.route(size, align, flags) {
            Route::Class(idx) => {
                let mut provider = self.provider.lock();
                self.classes[idx].allocate(&mut *provider)
            }
            Route::Pages(count) => self.provider.lock().allocate_pages(count),
        }
    }

    /// Frees an allocation.
    ///
    /// `size`, `align`, and `flags` must match the original request.
    ///
    /// # Safety
    ///
    /// `ptr` must come from [`allocate`](Self::allocate) on this pool with
    /// the same parameters, and must not be referenced afterwards.
    pub unsafe fn free(&self, ptr: NonNull<u8>, size: usize, align: usize, flags: AllocFlags) {
        match self.route(size, align, flags) {
            // SAFETY: Forwarded caller contract.
            Route::Class(idx) => unsafe { self.classes[idx].free(ptr) },
            Route::Pages(count) => {
                let mut provider = self.provider.lock();
                // SAFETY: Forwarded caller contract.
                unsafe { provider.free_pages(ptr, count) };
            }
        }
    }

    /// Grows or shrinks an allocation, preferring in-place resizing.
    ///
    /// Returns the (possibly unchanged) new pointer.
    ///
    /// # Safety
    ///
    /// `ptr`, `old_size`, `align`, and `flags` must match the original
    /// request; on success the old pointer must no longer be used.
    pub unsafe fn realloc(
        &self,
        ptr: NonNull<u8>,
        old_size: usize,
        new_size: usize,
        align: usize,
        flags: AllocFlags,
    ) -> KResult<NonNull<u8>> {
        if new_size == 0 {
            return Err(Status::InvalidArgument);
        }
        // In place when the backing block already covers the new size.
        if self.route(old_size, align, flags) == self.route(new_size, align, flags) {
            return Ok(ptr);
        }

        let new_ptr = self.allocate(new_size, align, flags)?;
        // SAFETY: Both blocks are live and at least min(old,new) bytes.
        unsafe {
            core::ptr::copy_nonoverlapping(
                ptr.as_ptr(),
                new_ptr.as_ptr(),
                old_size.min(new_size),
            );
            self.free(ptr, old_size, align, flags);
        }
        Ok(new_ptr)
    }

    /// Decides whether a request is slab- or page-backed.
    fn route(&self, size: usize, align: usize, flags: AllocFlags) -> Route {
        if !flags.contains(AllocFlags::PHYS_CONTIGUOUS) {
            let needed = size.max(align);
            for (idx, class) in CLASS_SIZES.iter().enumerate() {
                if needed <= *class {
                    return Route::Class(idx);
                }
            }
        }
        Route::Pages(size.div_ceil(PAGE_SIZE))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Route {
    Class(usize),
    Pages(usize),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::slab::tests::HostPages;

    fn pool() -> Mempool<HostPages> {
        Mempool::new(HostPages::new(64))
    }

    #[test]
    fn small_allocations_use_classes() {
        let pool = pool();
        let a = pool.allocate(24, 8, AllocFlags::empty()).unwrap();
        let b = pool.allocate(24, 8, AllocFlags::empty()).unwrap();
        assert_ne!(a, b);
        // 24 bytes lands in the 32-byte class.
        assert_eq!(pool.classes[1].stats().allocated, 2);
        // SAFETY: Matching parameters.
        unsafe {
            pool.free(a, 24, 8, AllocFlags::empty());
            pool.free(b, 24, 8, AllocFlags::empty());
        }
        assert_eq!(pool.classes[1].stats().allocated, 0);
    }

    #[test]
    fn alignment_bumps_the_class() {
        let pool = pool();
        let ptr = pool.allocate(8, 256, AllocFlags::empty()).unwrap();
        assert_eq!(ptr.as_ptr() as usize % 256, 0);
        assert_eq!(pool.classes[4].stats().allocated, 1);
    }

    #[test]
    fn large_allocations_use_pages() {
        let pool = pool();
        let ptr = pool.allocate(3 * PAGE_SIZE + 1, 8, AllocFlags::empty()).unwrap();
        assert_eq!(ptr.as_ptr() as usize % PAGE_SIZE, 0);
        assert_eq!(pool.provider.lock().live_pages(), 4);
        // SAFETY: Matching parameters.
        unsafe { pool.free(ptr, 3 * PAGE_SIZE + 1, 8, AllocFlags::empty()) };
        assert_eq!(pool.provider.lock().live_pages(), 0);
    }

    #[test]
    fn contiguous_flag_bypasses_slabs() {
        let pool = pool();
        let ptr = pool.allocate(64, 8, AllocFlags::PHYS_CONTIGUOUS).unwrap();
        assert_eq!(pool.provider.lock().live_pages(), 1);
        for slab in &pool.classes {
            assert_eq!(slab.stats().allocated, 0);
        }
        // SAFETY: Matching parameters.
        unsafe { pool.free(ptr, 64, 8, AllocFlags::PHYS_CONTIGUOUS) };
    }

    #[test]
    fn zero_size_is_invalid() {
        let pool = pool();
        assert_eq!(
            pool.allocate(0, 8, AllocFlags::empty()).unwrap_err(),
            Status::InvalidArgument
        );
    }

    #[test]
    fn oversized_alignment_is_unsupported() {
        let pool = pool();
        assert_eq!(
            pool.allocate(16, 2 * PAGE_SIZE, AllocFlags::empty())
                .unwrap_err(),
            Status::Unsupported
        );
    }

    #[test]
    fn realloc_within_class_is_in_place() {
        let pool = pool();
        let ptr = pool.allocate(20, 8, AllocFlags::empty()).unwrap();
        // SAFETY: Matching parameters.
        let grown = unsafe { pool.realloc(ptr, 20, 30, 8, AllocFlags::empty()).unwrap() };
        assert_eq!(ptr, grown, "growth within the 32-byte class is in place");
    }

    #[test]
    fn realloc_across_classes_moves_and_copies() {
        let pool = pool();
        let ptr = pool.allocate(16, 8, AllocFlags::empty()).unwrap();
        // SAFETY: The allocation is 16 bytes.
        unsafe { core::ptr::write_bytes(ptr.as_ptr(), 0xCD, 16) };

        // SAFETY: Matching parameters.
        let grown = unsafe { pool.realloc(ptr, 16, 100, 8, AllocFlags::empty()).unwrap() };
        assert_ne!(ptr, grown);
        for i in 0..16 {
            // SAFETY: grown is at least 100 bytes.
            assert_eq!(unsafe { *grown.as_ptr().add(i) }, 0xCD);
        }
    }

    #[test]
    fn realloc_same_page_count_is_in_place() {
        let pool = pool();
        let ptr = pool
            .allocate(PAGE_SIZE + 10, 8, AllocFlags::empty())
            .unwrap();
        // SAFETY: Matching parameters.
        let grown = unsafe {
            pool.realloc(ptr, PAGE_SIZE + 10, 2 * PAGE_SIZE, 8, AllocFlags::empty())
                .unwrap()
        };
        assert_eq!(ptr, grown);
    }
}
