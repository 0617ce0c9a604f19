//! Architecture-independent page mapping interface.
//!
//! Provides [`MapFlags`], [`MapFlush`], [`PageMapper`], and
//! [`PageTranslator`] so that the address-space layer can manipulate page
//! tables without knowing the underlying architecture.
//!
//! # TLB flush decoupling
//!
//! Architecture-specific TLB invalidation is registered at boot via
//! [`register_tlb_flush`]. Before registration, flushes are no-ops (safe for
//! early boot where no stale TLB entries exist); host tests also use the
//! no-op default. Invalidations that must be visible on every CPU go
//! through [`flush_broadcast`], whose backend — registered via
//! [`register_tlb_broadcast`] — raises IPIs and blocks until all online
//! CPUs have checkpointed past the request. The default backend degrades to
//! a local flush, which is correct while only one CPU is online.

use core::sync::atomic::{AtomicPtr, Ordering};

use anillo_core::addr::{PhysAddr, VirtAddr};
use anillo_core::page::{Page, PhysFrame, Size4KiB};
use anillo_core::status::KResult;

bitflags::bitflags! {
    /// Architecture-independent page mapping flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MapFlags: u64 {
        /// Page is writable.
        const WRITABLE      = 1 << 0;
        /// Page is executable (if unset, no-execute is implied).
        const EXECUTABLE    = 1 << 1;
        /// Page is accessible from user mode.
        const USER          = 1 << 2;
        /// Global page (not flushed on address-space switch).
        const GLOBAL        = 1 << 3;
        /// Caching disabled for this page.
        const CACHE_DISABLE = 1 << 4;
        /// Access must fault even though a frame is installed.
        ///
        /// The fault handler uses this for copy-on-fault and on-demand
        /// entries: the frame address is kept in the entry, but the
        /// hardware present bit stays clear.
        const INACTIVE      = 1 << 5;
    }
}

/// The result of translating a virtual address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Translation {
    /// The backing physical address (entry frame plus page offset).
    pub phys: PhysAddr,
    /// The entry's flags, including [`MapFlags::INACTIVE`] if set.
    pub flags: MapFlags,
}

/// Page-table manipulation, implemented per architecture.
///
/// Every operation takes the root table's physical address so that a single
/// mapper instance (which knows only the HHDM offset) can serve every
/// address space.
pub trait PageMapper {
    /// Installs a mapping from `page` to `frame`.
    ///
    /// `table_alloc` provides zeroed frames for intermediate tables.
    ///
    /// # Safety
    ///
    /// `root` must be a valid root table owned by the caller; changing
    /// mappings can break references into the affected range.
    unsafe fn map(
        &self,
        root: PhysAddr,
        page: Page<Size4KiB>,
        frame: PhysFrame<Size4KiB>,
        flags: MapFlags,
        table_alloc: &mut dyn FnMut() -> Option<PhysFrame<Size4KiB>>,
    ) -> KResult<MapFlush>;

    /// Removes the mapping for `page`, returning the frame and its flags.
    ///
    /// # Safety
    ///
    /// Same contract as [`map`](Self::map).
    unsafe fn unmap(
        &self,
        root: PhysAddr,
        page: Page<Size4KiB>,
    ) -> KResult<(PhysFrame<Size4KiB>, MapFlags, MapFlush)>;

    /// Replaces the flags of an existing mapping.
    ///
    /// # Safety
    ///
    /// Same contract as [`map`](Self::map).
    unsafe fn update_flags(
        &self,
        root: PhysAddr,
        page: Page<Size4KiB>,
        flags: MapFlags,
    ) -> KResult<MapFlush>;
}

/// Virtual-to-physical translation, separate from [`PageMapper`] because it
/// is page-size-agnostic.
pub trait PageTranslator {
    /// Translates `virt` within the given root table.
    ///
    /// Returns `None` when no entry covers the address. Inactive entries
    /// translate with [`MapFlags::INACTIVE`] set.
    ///
    /// # Safety
    ///
    /// `root` must be a valid root table.
    unsafe fn translate(&self, root: PhysAddr, virt: VirtAddr) -> Option<Translation>;
}

// ---------------------------------------------------------------------------
// Registered TLB flush callbacks
// ---------------------------------------------------------------------------

/// Registered single-address TLB flush function. No-op by default.
static TLB_FLUSH_FN: AtomicPtr<()> = AtomicPtr::new(nop_flush as fn(VirtAddr) as *mut ());

/// Registered broadcast flush function. Defaults to a local flush.
static TLB_BROADCAST_FN: AtomicPtr<()> =
    AtomicPtr::new(local_broadcast as fn(Option<VirtAddr>) as *mut ());

fn nop_flush(_virt: VirtAddr) {}

fn local_broadcast(virt: Option<VirtAddr>) {
    if let Some(virt) = virt {
        arch_flush_page(virt);
    }
}

/// Registers the architecture-specific single-address TLB flush.
///
/// Must be called during early boot before any page-table modification that
/// requires invalidation.
pub fn register_tlb_flush(f: fn(VirtAddr)) {
    TLB_FLUSH_FN.store(f as *mut (), Ordering::Release);
}

/// Registers the multi-CPU TLB shootdown backend.
///
/// The backend must enqueue a broadcast work item, raise IPIs, and return
/// only after every online CPU has checkpointed past the invalidation.
/// `None` means "flush everything".
pub fn register_tlb_broadcast(f: fn(Option<VirtAddr>)) {
    TLB_BROADCAST_FN.store(f as *mut (), Ordering::Release);
}

#[inline]
fn arch_flush_page(virt: VirtAddr) {
    let ptr = TLB_FLUSH_FN.load(Ordering::Acquire);
    // SAFETY: Only valid `fn(VirtAddr)` pointers (or the initial
    // `nop_flush`) are ever stored into TLB_FLUSH_FN.
    let f: fn(VirtAddr) = unsafe { core::mem::transmute(ptr) };
    f(virt);
}

/// Invalidates on every online CPU, blocking until all have checkpointed.
///
/// `None` invalidates all addresses.
pub fn flush_broadcast(virt: Option<VirtAddr>) {
    let ptr = TLB_BROADCAST_FN.load(Ordering::Acquire);
    // SAFETY: Only valid `fn(Option<VirtAddr>)` pointers (or the initial
    // `local_broadcast`) are ever stored into TLB_BROADCAST_FN.
    let f: fn(Option<VirtAddr>) = unsafe { core::mem::transmute(ptr) };
    f(virt);
}

// ---------------------------------------------------------------------------
// MapFlush
// ---------------------------------------------------------------------------

/// A pending TLB flush for a single page.
///
/// Created by page table modification operations. Flushes the TLB entry on
/// drop unless [`.flush()`](Self::flush), [`.flush_broadcast()`]
/// (Self::flush_broadcast) or [`.ignore()`](Self::ignore) is called first.
#[must_use = "TLB flush is pending; call .flush(), .flush_broadcast() or .ignore()"]
#[derive(Debug)]
pub struct MapFlush {
    virt: VirtAddr,
    needs_flush: bool,
}

impl MapFlush {
    /// Creates a new pending flush for the given virtual address.
    pub fn new(virt: VirtAddr) -> Self {
        Self {
            virt,
            needs_flush: true,
        }
    }

    /// Flushes the TLB entry on the current CPU.
    pub fn flush(mut self) {
        self.needs_flush = false;
        arch_flush_page(self.virt);
    }

    /// Flushes the TLB entry on every online CPU (shootdown).
    pub fn flush_broadcast(mut self) {
        self.needs_flush = false;
        flush_broadcast(Some(self.virt));
    }

    /// Explicitly opts out of flushing (e.g. fresh mappings not yet in the
    /// TLB, or batch flushes handled separately).
    pub fn ignore(mut self) {
        self.needs_flush = false;
    }
}

impl Drop for MapFlush {
    fn drop(&mut self) {
        if self.needs_flush {
            arch_flush_page(self.virt);
        }
    }
}
