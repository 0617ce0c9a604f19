//! x86_64 TLB invalidation.

use anillo_core::addr::VirtAddr;

/// Invalidates the TLB entry for one page on the current CPU.
pub fn flush_page(virt: VirtAddr) {
    // SAFETY: invlpg only drops a TLB entry; ring 0 only.
    unsafe {
        core::arch::asm!("invlpg [{}]", in(reg) virt.as_u64(), options(nostack, preserves_flags));
    }
}

/// Invalidates all non-global TLB entries by reloading CR3.
pub fn flush_all() {
    // SAFETY: Rewriting CR3 with its current value only flushes the TLB.
    unsafe {
        core::arch::asm!(
            "mov {tmp}, cr3",
            "mov cr3, {tmp}",
            tmp = out(reg) _,
            options(nostack, preserves_flags),
        );
    }
}
