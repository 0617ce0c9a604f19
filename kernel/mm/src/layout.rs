//! Virtual address space layout.
//!
//! The low half belongs to userspace; the high half is shared between all
//! address spaces and belongs to the kernel. Region constants here are the
//! single source of truth for both the per-space virtual allocators and the
//! boundary checks in [`space`](crate::space).

use anillo_core::addr::VirtAddr;

/// Lowest user-mappable address (the first 64 KiB stay unmapped to catch
/// null and near-null dereferences).
pub const USER_BASE: u64 = 0x1_0000;

/// Exclusive end of the user half.
pub const USER_MAX: u64 = 0x0000_8000_0000_0000;

/// First address of the kernel half.
pub const KERNEL_BASE: u64 = 0xFFFF_8000_0000_0000;

/// Base of the kernel heap region.
pub const KERNEL_HEAP_BASE: u64 = 0xFFFF_C000_0000_0000;

/// Maximum kernel heap size: 2 TiB.
pub const KERNEL_HEAP_MAX_SIZE: u64 = 2 * 1024 * 1024 * 1024 * 1024;

/// A virtual address region with a base and maximum size.
#[derive(Debug, Clone, Copy)]
pub struct VirtRegion {
    base: VirtAddr,
    max_size: u64,
}

impl VirtRegion {
    /// Creates a new virtual region.
    pub const fn new(base: VirtAddr, max_size: u64) -> Self {
        Self { base, max_size }
    }

    /// The full user half, minus the guard area below [`USER_BASE`].
    pub fn user() -> Self {
        Self::new(VirtAddr::new(USER_BASE), USER_MAX - USER_BASE)
    }

    /// Returns the base address of this region.
    #[inline]
    pub const fn base(&self) -> VirtAddr {
        self.base
    }

    /// Returns the maximum size of this region.
    #[inline]
    pub const fn max_size(&self) -> u64 {
        self.max_size
    }

    /// Returns the end address (base + max_size).
    #[inline]
    pub fn end(&self) -> VirtAddr {
        self.base + self.max_size
    }

    /// Returns `true` if `addr` falls within this region.
    #[inline]
    pub fn contains(&self, addr: VirtAddr) -> bool {
        addr >= self.base && addr.as_u64() < self.base.as_u64() + self.max_size
    }

    /// Returns `true` if the whole `[addr, addr + bytes)` range falls within
    /// this region.
    #[inline]
    pub fn contains_range(&self, addr: VirtAddr, bytes: u64) -> bool {
        self.contains(addr) && addr.as_u64() + bytes <= self.base.as_u64() + self.max_size
    }
}
