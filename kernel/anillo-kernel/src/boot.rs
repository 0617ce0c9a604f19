//! Boot handoff and the bring-up pipeline.
//!
//! The bootstrap collaborator hands the kernel a tagged array of
//! [`BootEntry`]s. Only the memory map and the kernel image info are
//! mandatory; everything else is optional. [`BootData::validate`] checks
//! that invariant, and [`bring_up`] threads an explicit [`InitContext`]
//! through the initialisation stages (no hidden singleton beyond the
//! documented per-subsystem globals, which the stages populate in
//! dependency order).

use anillo_core::addr::{PhysAddr, VirtAddr};
use anillo_core::id::CpuId;
use anillo_core::status::{KResult, Status};
use anillo_core::{kinfo, kdebug};
use anillo_mm::PhysMemoryRegion;
use planck_noalloc::vec::ArrayVec;

/// Largest memory map the handoff can carry.
pub const MAX_MEMORY_REGIONS: usize = 64;

/// One tagged handoff entry.
#[derive(Debug, Clone, Copy)]
pub enum BootEntry<'a> {
    /// The physical memory map. Mandatory.
    MemoryMap(&'a [PhysMemoryRegion]),
    /// Where the kernel image sits. Mandatory.
    KernelImage {
        /// Physical load base.
        phys_base: PhysAddr,
        /// Virtual link base.
        virt_base: VirtAddr,
        /// Image size in bytes.
        size: u64,
    },
    /// Early allocation pool usable before the frame allocator is up.
    InitialPool {
        /// Pool base (already mapped).
        base: VirtAddr,
        /// Pool size in bytes.
        size: usize,
    },
    /// Framebuffer handed to the console collaborator.
    Framebuffer {
        /// Physical base of the pixel buffer.
        phys_base: PhysAddr,
        /// Width in pixels.
        width: u32,
        /// Height in pixels.
        height: u32,
        /// Bytes per scanline.
        pitch: u32,
    },
    /// ACPI RSDP pointer for the platform collaborator.
    AcpiRsdp(PhysAddr),
    /// Preloaded ramdisk.
    Ramdisk {
        /// Physical base.
        phys_base: PhysAddr,
        /// Size in bytes.
        size: u64,
    },
    /// Opaque configuration blob.
    Config {
        /// Physical base.
        phys_base: PhysAddr,
        /// Size in bytes.
        size: u64,
    },
}

/// The full tagged handoff.
pub struct BootData<'a> {
    entries: &'a [BootEntry<'a>],
}

impl<'a> BootData<'a> {
    /// Wraps a handoff array.
    pub fn new(entries: &'a [BootEntry<'a>]) -> Self {
        Self { entries }
    }

    /// Checks that the mandatory entries are present.
    pub fn validate(&self) -> KResult<()> {
        self.memory_map()?;
        self.kernel_image()?;
        Ok(())
    }

    /// The memory map entry.
    pub fn memory_map(&self) -> KResult<&'a [PhysMemoryRegion]> {
        self.entries
            .iter()
            .find_map(|entry| match entry {
                BootEntry::MemoryMap(map) => Some(*map),
                _ => None,
            })
            .ok_or(Status::InvalidArgument)
    }

    /// The kernel image entry as (phys base, virt base, size).
    pub fn kernel_image(&self) -> KResult<(PhysAddr, VirtAddr, u64)> {
        self.entries
            .iter()
            .find_map(|entry| match entry {
                BootEntry::KernelImage {
                    phys_base,
                    virt_base,
                    size,
                } => Some((*phys_base, *virt_base, *size)),
                _ => None,
            })
            .ok_or(Status::InvalidArgument)
    }

    /// The usable regions of the memory map, for the frame allocator.
    pub fn usable_regions(&self) -> KResult<ArrayVec<PhysMemoryRegion, MAX_MEMORY_REGIONS>> {
        let mut usable = ArrayVec::new();
        for region in self.memory_map()? {
            if region.usable {
                if usable.try_push(*region).is_err() {
                    return Err(Status::TooBig);
                }
            }
        }
        if usable.is_empty() {
            return Err(Status::PermanentOutage);
        }
        Ok(usable)
    }

    /// Total bytes of usable RAM.
    pub fn usable_bytes(&self) -> u64 {
        self.memory_map()
            .map(|map| map.iter().filter(|r| r.usable).map(|r| r.size).sum())
            .unwrap_or(0)
    }

    /// The optional ramdisk entry.
    pub fn ramdisk(&self) -> Option<(PhysAddr, u64)> {
        self.entries.iter().find_map(|entry| match entry {
            BootEntry::Ramdisk { phys_base, size } => Some((*phys_base, *size)),
            _ => None,
        })
    }
}

/// Explicit state carried through the bring-up stages.
pub struct InitContext {
    /// The HHDM offset established by the bootstrap.
    pub hhdm_offset: u64,
    /// The CPU performing bring-up.
    pub cpu: CpuId,
    /// The kernel root table (shared upper half).
    pub kernel_root: PhysAddr,
}

/// Brings the boot CPU up: architecture hooks, the per-CPU block, the
/// frame allocator, shootdown, the scheduler.
///
/// The subsystem collaborators (console sink, interrupt controller,
/// first user process) hang their pieces off the returned context.
///
/// # Safety
///
/// Must run exactly once, on the boot CPU, with the handoff data alive
/// and the HHDM fully mapped.
pub unsafe fn bring_up(boot: &BootData<'_>, context: InitContext) -> KResult<InitContext> {
    boot.validate()?;

    // Architecture hooks first; everything below may mask interrupts or
    // flush the TLB.
    // SAFETY: Boot CPU, once, per the caller contract.
    unsafe { crate::arch::init(context.cpu) };
    // SAFETY: Once per CPU, before anything queries the CPU id.
    unsafe { crate::percpu::install(context.cpu) };

    crate::log::install();
    let (kernel_phys, kernel_virt, kernel_size) = boot.kernel_image()?;
    kinfo!(
        "kernel image {:#x} bytes at {} (phys {})",
        kernel_size,
        kernel_virt,
        kernel_phys
    );
    kinfo!("usable RAM: {} MiB", boot.usable_bytes() >> 20);

    let regions = boot.usable_regions()?;
    // SAFETY: The regions come from the validated handoff and the HHDM is
    // mapped per the caller contract.
    unsafe { anillo_mm::pmm::init(regions.as_slice(), context.hhdm_offset) };
    kdebug!(
        "frame allocator up, {} frames free",
        anillo_mm::pmm::with(|p| p.free_frames())
    );

    crate::smp::install();
    anillo_sched::run::start();
    kinfo!("boot CPU {} up", context.cpu);
    Ok(context)
}
