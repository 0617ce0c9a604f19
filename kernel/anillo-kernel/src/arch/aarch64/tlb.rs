//! aarch64 TLB invalidation.

use anillo_core::addr::VirtAddr;

/// Invalidates the TLB entry for one page on the current CPU.
pub fn flush_page(virt: VirtAddr) {
    let page = virt.as_u64() >> 12;
    // SAFETY: tlbi only drops TLB entries; the barriers order the
    // invalidation against subsequent translations.
    unsafe {
        core::arch::asm!(
            "dsb ishst",
            "tlbi vaae1, {}",
            "dsb ish",
            "isb",
            in(reg) page,
            options(nostack, preserves_flags),
        );
    }
}

/// Invalidates all TLB entries for the current translation regime.
pub fn flush_all() {
    // SAFETY: Same as flush_page, for the whole EL1 regime.
    unsafe {
        core::arch::asm!(
            "dsb ishst",
            "tlbi vmalle1",
            "dsb ish",
            "isb",
            options(nostack, preserves_flags),
        );
    }
}
