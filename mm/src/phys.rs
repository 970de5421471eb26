//! Physical frame access window.
//!
//! Every kernel access to a physical frame — page tables, queued message
//! frames, initial stack frames, VGA text memory — goes through this
//! module. On x86 the translation is the identity, because every address
//! space identity-maps the tracked RAM range supervisor-only. On hosted
//! builds the "RAM" is a static 16 MiB image, which lets the paging,
//! process, and IPC machinery run unmodified under `cargo test`.

use catos_abi::addr::{PhysAddr, PAGE_SIZE};

/// Tracked physical memory (frame bitmap coverage).
pub const TRACKED_RAM_SIZE: u32 = 16 * 1024 * 1024;

#[cfg(target_arch = "x86")]
#[inline]
pub fn phys_to_virt(pa: PhysAddr) -> *mut u8 {
    pa.as_u32() as usize as *mut u8
}

#[cfg(not(target_arch = "x86"))]
mod ram_image {
    use core::cell::UnsafeCell;

    use super::TRACKED_RAM_SIZE;

    #[repr(C, align(4096))]
    pub struct RamImage(pub UnsafeCell<[u8; TRACKED_RAM_SIZE as usize]>);

    // SAFETY: access discipline is identical to real physical memory —
    // callers own the frames they touch via the allocator.
    unsafe impl Sync for RamImage {}

    pub static RAM: RamImage = RamImage(UnsafeCell::new([0; TRACKED_RAM_SIZE as usize]));
}

#[cfg(not(target_arch = "x86"))]
#[inline]
pub fn phys_to_virt(pa: PhysAddr) -> *mut u8 {
    debug_assert!(pa.as_u32() < TRACKED_RAM_SIZE);
    // SAFETY: bounds-checked offset into the static RAM image.
    unsafe { (ram_image::RAM.0.get() as *mut u8).add(pa.as_u32() as usize) }
}

/// # Safety
/// `pa` must be a valid, owned location of a `T` within tracked RAM.
#[inline]
pub unsafe fn phys_as_mut<T>(pa: PhysAddr) -> *mut T {
    phys_to_virt(pa) as *mut T
}

#[inline]
pub fn read_u32(pa: PhysAddr) -> u32 {
    debug_assert!(pa.as_u32() & 3 == 0);
    // SAFETY: aligned in-bounds read of tracked RAM.
    unsafe { core::ptr::read(phys_to_virt(pa) as *const u32) }
}

#[inline]
pub fn write_u32(pa: PhysAddr, value: u32) {
    debug_assert!(pa.as_u32() & 3 == 0);
    // SAFETY: aligned in-bounds write of tracked RAM.
    unsafe { core::ptr::write(phys_to_virt(pa) as *mut u32, value) }
}

pub fn copy_to_phys(pa: PhysAddr, bytes: &[u8]) {
    debug_assert!(pa.as_u32() as usize + bytes.len() <= TRACKED_RAM_SIZE as usize);
    // SAFETY: in-bounds copy into tracked RAM the caller owns.
    unsafe { core::ptr::copy_nonoverlapping(bytes.as_ptr(), phys_to_virt(pa), bytes.len()) };
}

pub fn copy_from_phys(pa: PhysAddr, bytes: &mut [u8]) {
    debug_assert!(pa.as_u32() as usize + bytes.len() <= TRACKED_RAM_SIZE as usize);
    // SAFETY: in-bounds copy out of tracked RAM.
    unsafe { core::ptr::copy_nonoverlapping(phys_to_virt(pa), bytes.as_mut_ptr(), bytes.len()) };
}

/// Frame-to-frame copy of one page.
pub fn copy_frame(dst: PhysAddr, src: PhysAddr) {
    debug_assert!(dst.is_page_aligned() && src.is_page_aligned());
    // SAFETY: both frames are in tracked RAM and distinct.
    unsafe {
        core::ptr::copy_nonoverlapping(phys_to_virt(src), phys_to_virt(dst), PAGE_SIZE as usize)
    };
}

pub fn zero_frame(pa: PhysAddr) {
    debug_assert!(pa.is_page_aligned());
    // SAFETY: in-bounds page write.
    unsafe { core::ptr::write_bytes(phys_to_virt(pa), 0, PAGE_SIZE as usize) };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_round_trip() {
        let pa = PhysAddr::new(TRACKED_RAM_SIZE - PAGE_SIZE);
        zero_frame(pa);
        write_u32(pa, 0xCAFE_F00D);
        assert_eq!(read_u32(pa), 0xCAFE_F00D);

        let mut out = [0u8; 4];
        copy_from_phys(pa, &mut out);
        assert_eq!(out, 0xCAFE_F00Du32.to_le_bytes());

        zero_frame(pa);
        assert_eq!(read_u32(pa), 0);
    }

    #[test]
    fn frame_copy() {
        let src = PhysAddr::new(TRACKED_RAM_SIZE - 2 * PAGE_SIZE);
        let dst = PhysAddr::new(TRACKED_RAM_SIZE - 3 * PAGE_SIZE);
        zero_frame(src);
        zero_frame(dst);
        copy_to_phys(src, b"frame payload");
        copy_frame(dst, src);
        let mut out = [0u8; 13];
        copy_from_phys(dst, &mut out);
        assert_eq!(&out, b"frame payload");
    }
}
