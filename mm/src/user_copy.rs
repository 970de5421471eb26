//! Copying across the user/kernel boundary.
//!
//! User pointers are untrusted inputs: every transfer validates the range
//! and walks the target address space page by page, requiring each page
//! to be genuinely ring-3 reachable (PTE *and* PDE user bits). Writes
//! additionally require the writable bit. The actual byte moves go
//! through the phys window, so a copy works regardless of which CR3 is
//! live — including into another task's address space.

use catos_abi::addr::{PhysAddr, VirtAddr, PAGE_SIZE};

use crate::paging::{self, PageFlags};
use crate::phys::{self, TRACKED_RAM_SIZE};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CopyError {
    /// Null user pointer.
    Null,
    /// Range leaves the tracked address range (or wraps).
    OutOfRange,
    /// A page in the range has no present mapping.
    NotMapped,
    /// A page in the range is not ring-3 accessible (or not writable for
    /// a copy-in direction that needs it).
    NotUserAccessible,
}

fn check_range(va: u32, len: usize) -> Result<(), CopyError> {
    if va == 0 {
        return Err(CopyError::Null);
    }
    let end = (va as u64) + len as u64;
    if end > TRACKED_RAM_SIZE as u64 {
        return Err(CopyError::OutOfRange);
    }
    Ok(())
}

/// Resolve one user page, enforcing accessibility.
fn resolve_user_page(
    dir: PhysAddr,
    va: VirtAddr,
    need_write: bool,
) -> Result<PhysAddr, CopyError> {
    let (frame, flags) = paging::translate(dir, va).ok_or(CopyError::NotMapped)?;
    if !paging::page_is_user_accessible(dir, va) {
        return Err(CopyError::NotUserAccessible);
    }
    if need_write && !flags.contains(PageFlags::WRITABLE) {
        return Err(CopyError::NotUserAccessible);
    }
    Ok(frame)
}

fn for_each_user_chunk(
    dir: PhysAddr,
    va: u32,
    len: usize,
    need_write: bool,
    mut chunk: impl FnMut(PhysAddr, usize, usize),
) -> Result<(), CopyError> {
    check_range(va, len)?;
    let mut done = 0usize;
    while done < len {
        let addr = VirtAddr::new(va + done as u32);
        let frame = resolve_user_page(dir, addr, need_write)?;
        let page_remaining = (PAGE_SIZE - addr.page_offset()) as usize;
        let take = page_remaining.min(len - done);
        chunk(frame.offset(addr.page_offset()), done, take);
        done += take;
    }
    Ok(())
}

/// Copy `dst.len()` bytes from `va` in `dir` into kernel memory.
pub fn copy_from_user(dir: PhysAddr, va: u32, dst: &mut [u8]) -> Result<(), CopyError> {
    if dst.is_empty() {
        return check_range(va, 0).and(Ok(()));
    }
    for_each_user_chunk(dir, va, dst.len(), false, |src, offset, take| {
        phys::copy_from_phys(src, &mut dst[offset..offset + take]);
    })
}

/// Copy `src` into `va` in `dir`.
pub fn copy_to_user(dir: PhysAddr, va: u32, src: &[u8]) -> Result<(), CopyError> {
    if src.is_empty() {
        return check_range(va, 0).and(Ok(()));
    }
    for_each_user_chunk(dir, va, src.len(), true, |dst, offset, take| {
        phys::copy_to_phys(dst, &src[offset..offset + take]);
    })
}

/// Copy a NUL-terminated string from `va`, bounded by `dst.len() - 1`
/// bytes. `dst` is always NUL-terminated; returns the string length.
pub fn copy_cstr_from_user(dir: PhysAddr, va: u32, dst: &mut [u8]) -> Result<usize, CopyError> {
    if dst.is_empty() {
        return Err(CopyError::OutOfRange);
    }
    let cap = dst.len() - 1;
    let mut len = 0usize;
    while len < cap {
        let addr = VirtAddr::new(va + len as u32);
        check_range(addr.as_u32(), 1)?;
        let frame = resolve_user_page(dir, addr, false)?;
        let mut byte = [0u8];
        phys::copy_from_phys(frame.offset(addr.page_offset()), &mut byte);
        if byte[0] == 0 {
            break;
        }
        dst[len] = byte[0];
        len += 1;
    }
    dst[len] = 0;
    Ok(len)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page_alloc::{alloc_page, frame_allocator_init};
    use crate::paging::{
        create_page_directory, destroy_page_directory, map_kernel_range, map_page, paging_init,
    };
    use crate::test_support;

    struct UserSpace {
        dir: PhysAddr,
        _guard: std::sync::MutexGuard<'static, ()>,
    }

    impl UserSpace {
        /// Fresh address space with one user page at `va`.
        fn with_page(va: u32) -> Self {
            let guard = test_support::lock();
            frame_allocator_init();
            paging_init().unwrap();
            let dir = create_page_directory().unwrap();
            map_kernel_range(dir).unwrap();
            let frame = alloc_page().unwrap();
            phys::zero_frame(frame);
            map_page(dir, VirtAddr::new(va), frame, PageFlags::USER_RW).unwrap();
            Self { dir, _guard: guard }
        }
    }

    impl Drop for UserSpace {
        fn drop(&mut self) {
            destroy_page_directory(self.dir);
        }
    }

    #[test]
    fn round_trip_through_user_page() {
        let space = UserSpace::with_page(0x0080_0000);
        copy_to_user(space.dir, 0x0080_0010, b"ping").unwrap();
        let mut back = [0u8; 4];
        copy_from_user(space.dir, 0x0080_0010, &mut back).unwrap();
        assert_eq!(&back, b"ping");
    }

    #[test]
    fn rejects_null_unmapped_and_supervisor() {
        let space = UserSpace::with_page(0x0080_0000);
        let mut buf = [0u8; 4];
        assert_eq!(copy_from_user(space.dir, 0, &mut buf), Err(CopyError::Null));
        // The identity-mapped kernel range is supervisor-only.
        assert_eq!(
            copy_from_user(space.dir, 0x0010_0000, &mut buf),
            Err(CopyError::NotUserAccessible)
        );
        // Past the end of tracked RAM.
        assert_eq!(
            copy_from_user(space.dir, 0x00FF_FFF0, &mut [0u8; 64]),
            Err(CopyError::OutOfRange)
        );
    }

    #[test]
    fn copy_spanning_two_pages_needs_both_mapped() {
        let space = UserSpace::with_page(0x0080_0000);
        // The page at 0x0080_1000 exists in the identity map but is
        // supervisor-only, so a straddling write is refused.
        let result = copy_to_user(space.dir, 0x0080_0FFC, &[0u8; 16]);
        assert_eq!(result, Err(CopyError::NotUserAccessible));
    }

    #[test]
    fn cstr_copy_is_bounded_and_terminated() {
        let space = UserSpace::with_page(0x0080_0000);
        copy_to_user(space.dir, 0x0080_0000, b"hello\0trailing").unwrap();

        let mut dst = [0xFFu8; 16];
        let len = copy_cstr_from_user(space.dir, 0x0080_0000, &mut dst).unwrap();
        assert_eq!(len, 5);
        assert_eq!(&dst[..6], b"hello\0");

        // Unterminated input is clipped at the buffer bound.
        let mut tiny = [0u8; 4];
        let len = copy_cstr_from_user(space.dir, 0x0080_0000, &mut tiny).unwrap();
        assert_eq!(len, 3);
        assert_eq!(&tiny, b"hel\0");
    }
}
