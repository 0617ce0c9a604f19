//! aarch64 page tables: 4-level walk with a 4 KiB granule via the HHDM.
//!
//! Descriptor software bit 55 is the `inactive` flag: the frame address is
//! kept in the descriptor but the valid bit stays clear, so access faults
//! and the handler can finish materialisation. MAIR index 0 is assumed to
//! be normal write-back memory and index 1 device memory (set up by the
//! boot collaborator).

use anillo_core::addr::{PhysAddr, VirtAddr};
use anillo_core::page::{Page, PhysFrame, Size4KiB};
use anillo_core::status::{KResult, Status};
use anillo_mm::PAGE_SIZE;
use anillo_mm::mapper::{MapFlags, MapFlush, PageMapper, PageTranslator, Translation};

bitflags::bitflags! {
    /// Raw aarch64 descriptor flags (4 KiB granule).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EntryFlags: u64 {
        const VALID           = 1 << 0;
        /// Table descriptor at levels 1-3; page descriptor at the leaf.
        const TABLE_OR_PAGE   = 1 << 1;
        /// MAIR index 1 (device memory) instead of 0 (normal).
        const DEVICE_MEMORY   = 1 << 2;
        /// EL0 access allowed (AP[1]).
        const EL0_ACCESS      = 1 << 6;
        /// Read-only (AP[2]).
        const READ_ONLY       = 1 << 7;
        /// Inner shareable (SH = 0b11).
        const INNER_SHAREABLE = 3 << 8;
        /// Access flag; must be set to avoid access faults.
        const ACCESSED        = 1 << 10;
        /// Not global (per-ASID).
        const NOT_GLOBAL      = 1 << 11;
        /// Privileged execute-never.
        const PXN             = 1 << 53;
        /// Unprivileged execute-never.
        const UXN             = 1 << 54;
        /// Software: frame known, access must fault.
        const INACTIVE        = 1 << 55;
    }
}

/// Physical-address mask within a descriptor (bits 12..47).
const ENTRY_ADDR_MASK: u64 = 0x0000_FFFF_FFFF_F000;

/// A single 64-bit translation descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct PageTableEntry(u64);

impl PageTableEntry {
    /// The zero (unused) descriptor.
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Builds a descriptor from a frame address and flags.
    pub fn new(addr: PhysAddr, flags: EntryFlags) -> Self {
        Self((addr.as_u64() & ENTRY_ADDR_MASK) | flags.bits())
    }

    /// The referenced physical address.
    pub fn address(self) -> PhysAddr {
        PhysAddr::new(self.0 & ENTRY_ADDR_MASK)
    }

    /// The descriptor's flag bits.
    pub fn flags(self) -> EntryFlags {
        EntryFlags::from_bits_truncate(self.0)
    }

    /// Hardware-valid.
    pub fn is_valid(self) -> bool {
        self.flags().contains(EntryFlags::VALID)
    }

    /// Valid or inactive: the descriptor carries meaning either way.
    pub fn is_used(self) -> bool {
        self.flags()
            .intersects(EntryFlags::VALID | EntryFlags::INACTIVE)
    }

    /// A valid block descriptor (levels 1-2): bit 1 clear.
    fn is_block(self) -> bool {
        self.is_valid() && !self.flags().contains(EntryFlags::TABLE_OR_PAGE)
    }
}

/// One 4 KiB translation table (any level).
#[repr(C, align(4096))]
pub struct PageTable {
    /// The 512 descriptors.
    pub entries: [PageTableEntry; 512],
}

/// Walks and builds aarch64 translation tables through the HHDM.
pub struct PageTableMapper {
    hhdm_offset: u64,
}

impl PageTableMapper {
    /// Creates a mapper for the given HHDM offset.
    pub fn new(hhdm_offset: u64) -> Self {
        Self { hhdm_offset }
    }

    fn phys_to_virt(&self, phys: PhysAddr) -> *mut u8 {
        (self.hhdm_offset + phys.as_u64()) as *mut u8
    }

    /// # Safety
    ///
    /// `phys` must point at a live translation table reachable through the
    /// HHDM.
    unsafe fn table_at(&self, phys: PhysAddr) -> &mut PageTable {
        // SAFETY: Caller contract.
        unsafe { &mut *(self.phys_to_virt(phys) as *mut PageTable) }
    }

    unsafe fn ensure_table(
        &self,
        table_phys: PhysAddr,
        index: usize,
        table_alloc: &mut dyn FnMut() -> Option<PhysFrame<Size4KiB>>,
    ) -> KResult<PhysAddr> {
        // SAFETY: Caller contract (valid table).
        let table = unsafe { self.table_at(table_phys) };
        let entry = table.entries[index];
        if entry.is_valid() {
            return Ok(entry.address());
        }
        let frame = table_alloc().ok_or(Status::TemporaryOutage)?;
        let phys = frame.start_address();
        // SAFETY: The frame was just allocated; zeroing prevents stale
        // bits from reading as valid descriptors.
        unsafe { core::ptr::write_bytes(self.phys_to_virt(phys), 0, PAGE_SIZE) };
        table.entries[index] =
            PageTableEntry::new(phys, EntryFlags::VALID | EntryFlags::TABLE_OR_PAGE);
        Ok(phys)
    }

    fn to_entry_flags(flags: MapFlags) -> EntryFlags {
        let mut entry =
            EntryFlags::TABLE_OR_PAGE | EntryFlags::ACCESSED | EntryFlags::INNER_SHAREABLE;
        if flags.contains(MapFlags::INACTIVE) {
            entry |= EntryFlags::INACTIVE;
        } else {
            entry |= EntryFlags::VALID;
        }
        if !flags.contains(MapFlags::WRITABLE) {
            entry |= EntryFlags::READ_ONLY;
        }
        if flags.contains(MapFlags::USER) {
            entry |= EntryFlags::EL0_ACCESS;
            // User pages are never kernel-executable.
            entry |= EntryFlags::PXN;
        }
        if !flags.contains(MapFlags::GLOBAL) {
            entry |= EntryFlags::NOT_GLOBAL;
        }
        if flags.contains(MapFlags::CACHE_DISABLE) {
            entry |= EntryFlags::DEVICE_MEMORY;
        }
        if !flags.contains(MapFlags::EXECUTABLE) {
            entry |= EntryFlags::UXN | EntryFlags::PXN;
        }
        entry
    }

    fn from_entry_flags(entry: EntryFlags) -> MapFlags {
        let mut flags = MapFlags::empty();
        if !entry.contains(EntryFlags::READ_ONLY) {
            flags |= MapFlags::WRITABLE;
        }
        if entry.contains(EntryFlags::EL0_ACCESS) {
            flags |= MapFlags::USER;
        }
        if !entry.contains(EntryFlags::NOT_GLOBAL) {
            flags |= MapFlags::GLOBAL;
        }
        if entry.contains(EntryFlags::DEVICE_MEMORY) {
            flags |= MapFlags::CACHE_DISABLE;
        }
        if !entry.contains(EntryFlags::UXN) || !entry.contains(EntryFlags::PXN) {
            flags |= MapFlags::EXECUTABLE;
        }
        if entry.contains(EntryFlags::INACTIVE) && !entry.contains(EntryFlags::VALID) {
            flags |= MapFlags::INACTIVE;
        }
        flags
    }

    unsafe fn walk_to_leaf(&self, root: PhysAddr, virt: VirtAddr) -> Option<PhysAddr> {
        let mut table_phys = root;
        for level in (1..4).rev() {
            // SAFETY: Walk stays within tables reachable from a valid root.
            let table = unsafe { self.table_at(table_phys) };
            let entry = table.entries[virt.table_index(level)];
            if !entry.is_valid() || entry.is_block() {
                return None;
            }
            table_phys = entry.address();
        }
        Some(table_phys)
    }
}

impl PageMapper for PageTableMapper {
    unsafe fn map(
        &self,
        root: PhysAddr,
        page: Page<Size4KiB>,
        frame: PhysFrame<Size4KiB>,
        flags: MapFlags,
        table_alloc: &mut dyn FnMut() -> Option<PhysFrame<Size4KiB>>,
    ) -> KResult<MapFlush> {
        let virt = page.start_address();
        // SAFETY: Caller contract (valid root, ownership of the range).
        let leaf_phys = unsafe {
            let l2 = self.ensure_table(root, virt.table_index(3), table_alloc)?;
            let l1 = self.ensure_table(l2, virt.table_index(2), table_alloc)?;
            self.ensure_table(l1, virt.table_index(1), table_alloc)?
        };
        // SAFETY: leaf_phys was just ensured to be a valid table.
        let leaf = unsafe { self.table_at(leaf_phys) };
        leaf.entries[virt.table_index(0)] =
            PageTableEntry::new(frame.start_address(), Self::to_entry_flags(flags));
        Ok(MapFlush::new(virt))
    }

    unsafe fn unmap(
        &self,
        root: PhysAddr,
        page: Page<Size4KiB>,
    ) -> KResult<(PhysFrame<Size4KiB>, MapFlags, MapFlush)> {
        let virt = page.start_address();
        // SAFETY: Caller contract.
        let leaf_phys = unsafe { self.walk_to_leaf(root, virt) }.ok_or(Status::NoSuchResource)?;
        // SAFETY: walk_to_leaf returned a valid leaf table.
        let leaf = unsafe { self.table_at(leaf_phys) };
        let slot = &mut leaf.entries[virt.table_index(0)];
        if !slot.is_used() {
            return Err(Status::NoSuchResource);
        }
        let frame = PhysFrame::containing_address(slot.address());
        let flags = Self::from_entry_flags(slot.flags());
        *slot = PageTableEntry::empty();
        Ok((frame, flags, MapFlush::new(virt)))
    }

    unsafe fn update_flags(
        &self,
        root: PhysAddr,
        page: Page<Size4KiB>,
        flags: MapFlags,
    ) -> KResult<MapFlush> {
        let virt = page.start_address();
        // SAFETY: Caller contract.
        let leaf_phys = unsafe { self.walk_to_leaf(root, virt) }.ok_or(Status::NoSuchResource)?;
        // SAFETY: walk_to_leaf returned a valid leaf table.
        let leaf = unsafe { self.table_at(leaf_phys) };
        let slot = &mut leaf.entries[virt.table_index(0)];
        if !slot.is_used() {
            return Err(Status::NoSuchResource);
        }
        *slot = PageTableEntry::new(slot.address(), Self::to_entry_flags(flags));
        Ok(MapFlush::new(virt))
    }
}

impl PageTranslator for PageTableMapper {
    unsafe fn translate(&self, root: PhysAddr, virt: VirtAddr) -> Option<Translation> {
        let mut table_phys = root;
        for level in (0..4).rev() {
            // SAFETY: Walk stays within tables reachable from a valid root.
            let table = unsafe { self.table_at(table_phys) };
            let entry = table.entries[virt.table_index(level)];
            if !entry.is_used() {
                return None;
            }
            let is_leaf = level == 0 || entry.is_block();
            if is_leaf {
                let span_mask = (1u64 << (12 + 9 * level)) - 1;
                return Some(Translation {
                    phys: PhysAddr::new(entry.address().as_u64() + (virt.as_u64() & span_mask)),
                    flags: Self::from_entry_flags(entry.flags()),
                });
            }
            table_phys = entry.address();
        }
        None
    }
}

/// Creates a fresh user root table.
///
/// On aarch64 the user and kernel halves live in separate roots (TTBR0
/// and TTBR1), so the user root starts entirely empty; the shared kernel
/// tables never appear in it.
///
/// # Safety
///
/// `table_alloc` must hand out unused frames reachable through
/// `hhdm_offset`.
pub unsafe fn new_user_root(
    hhdm_offset: u64,
    table_alloc: &mut dyn FnMut() -> Option<PhysFrame<Size4KiB>>,
) -> KResult<PhysAddr> {
    let frame = table_alloc().ok_or(Status::TemporaryOutage)?;
    let phys = frame.start_address();
    // SAFETY: The frame was just allocated and is reachable via the HHDM.
    unsafe { core::ptr::write_bytes((hhdm_offset + phys.as_u64()) as *mut u8, 0, PAGE_SIZE) };
    Ok(phys)
}
