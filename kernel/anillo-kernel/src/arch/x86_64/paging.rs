//! x86_64 page tables: walks and builds 4-level tables via the HHDM.
//!
//! Entry bit 9 (OS-available) is the `inactive` flag: an entry that
//! carries a frame address but must still fault on access. Such entries
//! keep the hardware present bit clear; the walker recognises them and
//! reports them with [`MapFlags::INACTIVE`] so the fault handler can
//! finish the job.

use anillo_core::addr::{PhysAddr, VirtAddr};
use anillo_core::page::{Page, PhysFrame, Size2MiB, Size4KiB};
use anillo_core::status::{KResult, Status};
use anillo_mm::PAGE_SIZE;
use anillo_mm::mapper::{MapFlags, MapFlush, PageMapper, PageTranslator, Translation};

bitflags::bitflags! {
    /// Raw x86_64 page-table entry flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EntryFlags: u64 {
        const PRESENT         = 1 << 0;
        const WRITABLE        = 1 << 1;
        const USER_ACCESSIBLE = 1 << 2;
        const WRITE_THROUGH   = 1 << 3;
        const NO_CACHE        = 1 << 4;
        const ACCESSED        = 1 << 5;
        const DIRTY           = 1 << 6;
        const HUGE_PAGE       = 1 << 7;
        const GLOBAL          = 1 << 8;
        /// OS-available: frame known, access must fault.
        const INACTIVE        = 1 << 9;
        const NO_EXECUTE      = 1 << 63;
    }
}

/// Physical-address mask within an entry (bits 12..51).
const ENTRY_ADDR_MASK: u64 = 0x000F_FFFF_FFFF_F000;

/// A single 64-bit page-table entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct PageTableEntry(u64);

impl PageTableEntry {
    /// The zero (unused) entry.
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Builds an entry from a frame address and flags.
    pub fn new(addr: PhysAddr, flags: EntryFlags) -> Self {
        Self((addr.as_u64() & ENTRY_ADDR_MASK) | flags.bits())
    }

    /// The referenced physical address.
    pub fn address(self) -> PhysAddr {
        PhysAddr::new(self.0 & ENTRY_ADDR_MASK)
    }

    /// The entry's flag bits.
    pub fn flags(self) -> EntryFlags {
        EntryFlags::from_bits_truncate(self.0)
    }

    /// Hardware-present.
    pub fn is_present(self) -> bool {
        self.flags().contains(EntryFlags::PRESENT)
    }

    /// Present or inactive: the entry carries meaning either way.
    pub fn is_used(self) -> bool {
        self.flags()
            .intersects(EntryFlags::PRESENT | EntryFlags::INACTIVE)
    }
}

/// One 4 KiB page table (any level).
#[repr(C, align(4096))]
pub struct PageTable {
    /// The 512 entries.
    pub entries: [PageTableEntry; 512],
}

/// Walks and builds x86_64 page tables through the HHDM.
///
/// One instance (knowing only the HHDM offset) serves every address
/// space; each operation takes the root table explicitly.
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
    /// `phys` must point at a live page table reachable through the HHDM.
    unsafe fn table_at(&self, phys: PhysAddr) -> &mut PageTable {
        // SAFETY: Caller contract.
        unsafe { &mut *(self.phys_to_virt(phys) as *mut PageTable) }
    }

    /// Ensures `table[index]` points at a next-level table, allocating and
    /// zeroing one if needed. Returns the next table's physical address.
    unsafe fn ensure_table(
        &self,
        table_phys: PhysAddr,
        index: usize,
        intermediate: EntryFlags,
        table_alloc: &mut dyn FnMut() -> Option<PhysFrame<Size4KiB>>,
    ) -> KResult<PhysAddr> {
        // SAFETY: Caller contract (valid table).
        let table = unsafe { self.table_at(table_phys) };
        let entry = table.entries[index];
        if entry.is_present() {
            // OR in any new flags (e.g. USER for mixed subtrees).
            let combined = entry.flags() | intermediate;
            if combined != entry.flags() {
                table.entries[index] = PageTableEntry::new(entry.address(), combined);
            }
            return Ok(entry.address());
        }

        let frame = table_alloc().ok_or(Status::TemporaryOutage)?;
        let phys = frame.start_address();
        // SAFETY: The frame was just allocated; zeroing prevents stale
        // bits from reading as present entries.
        unsafe { core::ptr::write_bytes(self.phys_to_virt(phys), 0, PAGE_SIZE) };
        table.entries[index] = PageTableEntry::new(phys, intermediate);
        Ok(phys)
    }

    /// Intermediate-table flags derived from the leaf flags.
    fn intermediate_flags(leaf: EntryFlags) -> EntryFlags {
        let mut flags = EntryFlags::PRESENT | EntryFlags::WRITABLE;
        if leaf.contains(EntryFlags::USER_ACCESSIBLE) {
            flags |= EntryFlags::USER_ACCESSIBLE;
        }
        flags
    }

    fn to_entry_flags(flags: MapFlags) -> EntryFlags {
        let mut entry = EntryFlags::empty();
        if flags.contains(MapFlags::INACTIVE) {
            entry |= EntryFlags::INACTIVE;
        } else {
            entry |= EntryFlags::PRESENT;
        }
        if flags.contains(MapFlags::WRITABLE) {
            entry |= EntryFlags::WRITABLE;
        }
        if flags.contains(MapFlags::USER) {
            entry |= EntryFlags::USER_ACCESSIBLE;
        }
        if flags.contains(MapFlags::GLOBAL) {
            entry |= EntryFlags::GLOBAL;
        }
        if flags.contains(MapFlags::CACHE_DISABLE) {
            entry |= EntryFlags::NO_CACHE;
        }
        if !flags.contains(MapFlags::EXECUTABLE) {
            entry |= EntryFlags::NO_EXECUTE;
        }
        entry
    }

    fn from_entry_flags(entry: EntryFlags) -> MapFlags {
        let mut flags = MapFlags::empty();
        if entry.contains(EntryFlags::WRITABLE) {
            flags |= MapFlags::WRITABLE;
        }
        if entry.contains(EntryFlags::USER_ACCESSIBLE) {
            flags |= MapFlags::USER;
        }
        if entry.contains(EntryFlags::GLOBAL) {
            flags |= MapFlags::GLOBAL;
        }
        if entry.contains(EntryFlags::NO_CACHE) {
            flags |= MapFlags::CACHE_DISABLE;
        }
        if !entry.contains(EntryFlags::NO_EXECUTE) {
            flags |= MapFlags::EXECUTABLE;
        }
        if entry.contains(EntryFlags::INACTIVE) && !entry.contains(EntryFlags::PRESENT) {
            flags |= MapFlags::INACTIVE;
        }
        flags
    }

    /// Walks to the leaf page table of `virt`, without allocating.
    ///
    /// Returns the leaf table's physical address, or `None` if an
    /// intermediate entry is missing (or a huge page cuts the walk short).
    unsafe fn walk_to_leaf(&self, root: PhysAddr, virt: VirtAddr) -> Option<PhysAddr> {
        let mut table_phys = root;
        for level in (1..4).rev() {
            // SAFETY: Walk stays within tables reachable from a valid root.
            let table = unsafe { self.table_at(table_phys) };
            let entry = table.entries[virt.table_index(level)];
            if !entry.is_present() || entry.flags().contains(EntryFlags::HUGE_PAGE) {
                return None;
            }
            table_phys = entry.address();
        }
        Some(table_phys)
    }

    /// Maps a 2 MiB page, collapsing the lowest table level.
    ///
    /// # Safety
    ///
    /// `root` must be a valid root table; `phys` must be 2 MiB aligned;
    /// the range must not conflict with existing mappings.
    pub unsafe fn map_2mib(
        &self,
        root: PhysAddr,
        page: Page<Size2MiB>,
        phys: PhysAddr,
        flags: MapFlags,
        table_alloc: &mut dyn FnMut() -> Option<PhysFrame<Size4KiB>>,
    ) -> KResult<MapFlush> {
        let virt = page.start_address();
        let entry_flags = Self::to_entry_flags(flags);
        let intermediate = Self::intermediate_flags(entry_flags);
        // SAFETY: Caller contract.
        let l2_phys = unsafe {
            let l3 = self.ensure_table(root, virt.table_index(3), intermediate, table_alloc)?;
            self.ensure_table(l3, virt.table_index(2), intermediate, table_alloc)?
        };
        // SAFETY: l2_phys was just ensured to be a valid table.
        let l2 = unsafe { self.table_at(l2_phys) };
        let slot = &mut l2.entries[virt.table_index(1)];
        if slot.is_used() {
            return Err(Status::AlreadyInProgress);
        }
        *slot = PageTableEntry::new(phys, entry_flags | EntryFlags::HUGE_PAGE);
        Ok(MapFlush::new(virt))
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
        let entry_flags = Self::to_entry_flags(flags);
        let intermediate = Self::intermediate_flags(entry_flags);
        // SAFETY: Caller contract (valid root, ownership of the range).
        let leaf_phys = unsafe {
            let l3 = self.ensure_table(root, virt.table_index(3), intermediate, table_alloc)?;
            let l2 = self.ensure_table(l3, virt.table_index(2), intermediate, table_alloc)?;
            self.ensure_table(l2, virt.table_index(1), intermediate, table_alloc)?
        };
        // SAFETY: leaf_phys was just ensured to be a valid table.
        let leaf = unsafe { self.table_at(leaf_phys) };
        leaf.entries[virt.table_index(0)] =
            PageTableEntry::new(frame.start_address(), entry_flags);
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
            let is_leaf = level == 0 || entry.flags().contains(EntryFlags::HUGE_PAGE);
            if is_leaf {
                // Huge pages carry the low virtual bits of their span.
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

/// Number of root entries belonging to the shared kernel half.
const KERNEL_HALF_ENTRIES: usize = 256;

/// Creates a fresh user root table: lower half zeroed, upper half copied
/// from the kernel root so every address space shares the kernel tables.
///
/// # Safety
///
/// `kernel_root` must be the live kernel root table; `table_alloc` must
/// hand out unused frames reachable through `hhdm_offset`.
pub unsafe fn new_user_root(
    kernel_root: PhysAddr,
    hhdm_offset: u64,
    table_alloc: &mut dyn FnMut() -> Option<PhysFrame<Size4KiB>>,
) -> KResult<PhysAddr> {
    let frame = table_alloc().ok_or(Status::TemporaryOutage)?;
    let new_root = frame.start_address();
    // SAFETY: Both tables are reachable through the HHDM; the new frame is
    // exclusively ours.
    unsafe {
        let dst = (hhdm_offset + new_root.as_u64()) as *mut u64;
        let src = (hhdm_offset + kernel_root.as_u64()) as *const u64;
        core::ptr::write_bytes(dst, 0, KERNEL_HALF_ENTRIES);
        core::ptr::copy_nonoverlapping(
            src.add(KERNEL_HALF_ENTRIES),
            dst.add(KERNEL_HALF_ENTRIES),
            KERNEL_HALF_ENTRIES,
        );
    }
    Ok(new_root)
}
