//! User pointer validation and copying.
//!
//! Syscall handlers never dereference user addresses directly: every
//! access goes through these helpers, which check the user half, walk the
//! address space page by page, and copy through the HHDM. An unmapped
//! page yields `no-such-resource` (the caller may retry after faulting it
//! in — or just fail the syscall); kernel-half addresses are `forbidden`.

use alloc::vec::Vec;

use anillo_core::addr::VirtAddr;
use anillo_core::status::{KResult, Status};
use anillo_mm::PAGE_SIZE;
use anillo_mm::space::AddressSpace;

use crate::arch::KernelMapper;

/// Hard cap on single-copy sizes; anything larger is a malformed request.
pub const MAX_USER_COPY: usize = 1 << 20;

fn check_range(addr: VirtAddr, len: usize) -> KResult<()> {
    if len > MAX_USER_COPY {
        return Err(Status::TooBig);
    }
    let end = addr.as_u64().checked_add(len as u64).ok_or(Status::InvalidArgument)?;
    if addr.is_kernel_half() || end > anillo_mm::layout::KERNEL_BASE {
        return Err(Status::Forbidden);
    }
    Ok(())
}

/// Copies `len` bytes from userspace.
pub fn copy_from_user(
    space: &AddressSpace<KernelMapper>,
    addr: VirtAddr,
    len: usize,
) -> KResult<Vec<u8>> {
    check_range(addr, len)?;
    let mut out = Vec::new();
    if out.try_reserve_exact(len).is_err() {
        return Err(Status::TemporaryOutage);
    }

    let mut cursor = addr;
    let mut remaining = len;
    while remaining > 0 {
        let phys = space.virtual_to_physical(cursor)?;
        let in_page = PAGE_SIZE - (cursor.page_offset() as usize);
        let chunk = remaining.min(in_page);
        let src = (space.hhdm_offset() + phys.as_u64()) as *const u8;
        // SAFETY: The translation proves the page is mapped; the chunk
        // stays within it and the HHDM maps the frame.
        unsafe {
            out.extend_from_slice(core::slice::from_raw_parts(src, chunk));
        }
        cursor = cursor + chunk as u64;
        remaining -= chunk;
    }
    Ok(out)
}

/// Copies bytes into userspace.
pub fn copy_to_user(
    space: &AddressSpace<KernelMapper>,
    addr: VirtAddr,
    bytes: &[u8],
) -> KResult<()> {
    check_range(addr, bytes.len())?;

    let mut cursor = addr;
    let mut offset = 0;
    while offset < bytes.len() {
        let phys = space.virtual_to_physical(cursor)?;
        let in_page = PAGE_SIZE - (cursor.page_offset() as usize);
        let chunk = (bytes.len() - offset).min(in_page);
        let dst = (space.hhdm_offset() + phys.as_u64()) as *mut u8;
        // SAFETY: As in copy_from_user; the destination frame belongs to
        // the translated user page.
        unsafe {
            core::ptr::copy_nonoverlapping(bytes.as_ptr().add(offset), dst, chunk);
        }
        cursor = cursor + chunk as u64;
        offset += chunk;
    }
    Ok(())
}

/// Reads one `u64` from userspace (futex word accesses).
pub fn read_user_u64(space: &AddressSpace<KernelMapper>, addr: VirtAddr) -> KResult<u64> {
    if !addr.is_aligned(8) {
        return Err(Status::InvalidArgument);
    }
    check_range(addr, 8)?;
    let phys = space.virtual_to_physical(addr)?;
    let ptr = (space.hhdm_offset() + phys.as_u64()) as *const u64;
    // SAFETY: Translated, aligned, within one page.
    Ok(unsafe { core::ptr::read_volatile(ptr) })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proc::tests_support::make_test_process;
    use anillo_mm::mapper::MapFlags;

    #[test]
    fn round_trip_through_user_pages() {
        let (process, mut frames) = make_test_process();
        let va = process
            .space()
            .allocate(2, 0, MapFlags::WRITABLE, true, &mut frames)
            .unwrap();

        // Cross the page boundary on purpose.
        let addr = va + (PAGE_SIZE as u64 - 3);
        let payload = b"boundary-crossing";
        copy_to_user(process.space(), addr, payload).unwrap();
        let read = copy_from_user(process.space(), addr, payload.len()).unwrap();
        assert_eq!(read, payload);
    }

    #[test]
    fn unmapped_page_reports_missing() {
        let (process, mut frames) = make_test_process();
        let va = process
            .space()
            .allocate(1, 0, MapFlags::WRITABLE, false, &mut frames)
            .unwrap();
        // Lazy allocation: nothing is mapped until a fault.
        assert_eq!(
            copy_from_user(process.space(), va, 8).unwrap_err(),
            Status::NoSuchResource
        );
    }

    #[test]
    fn kernel_half_is_forbidden() {
        let (process, _frames) = make_test_process();
        assert_eq!(
            copy_from_user(process.space(), VirtAddr::new(0xFFFF_9000_0000_0000), 8)
                .unwrap_err(),
            Status::Forbidden
        );
        // A range that ends in the kernel half is rejected too.
        assert_eq!(
            copy_to_user(
                process.space(),
                VirtAddr::new(0x0000_7FFF_FFFF_F000),
                &[0; 8192],
            )
            .unwrap_err(),
            Status::Forbidden
        );
    }

    #[test]
    fn oversized_copy_is_too_big() {
        let (process, _frames) = make_test_process();
        assert_eq!(
            copy_from_user(process.space(), VirtAddr::new(0x1000), MAX_USER_COPY + 1)
                .unwrap_err(),
            Status::TooBig
        );
    }

    #[test]
    fn user_word_reads() {
        let (process, mut frames) = make_test_process();
        let va = process
            .space()
            .allocate(1, 0, MapFlags::WRITABLE, true, &mut frames)
            .unwrap();
        copy_to_user(process.space(), va, &42u64.to_ne_bytes()).unwrap();
        assert_eq!(read_user_u64(process.space(), va).unwrap(), 42);
        assert_eq!(
            read_user_u64(process.space(), va + 1).unwrap_err(),
            Status::InvalidArgument
        );
    }
}
