//! Physical memory and paging for catos.
//!
//! Three layers, bottom up:
//!
//! - [`phys`] — the single window through which kernel code touches
//!   physical frames (page tables, message frames, initial stack frames,
//!   VGA text memory).
//! - [`page_alloc`] — the frame bitmap: first-fit contiguous allocation
//!   over the tracked 16 MiB of RAM, with the boot reservations.
//! - [`paging`] — page directories and tables, the kernel identity
//!   mapping, per-process address spaces, and the TLB discipline.
//!
//! [`user_copy`] sits on top of `paging` and is the only sanctioned way
//! to move bytes across the user/kernel boundary.

#![no_std]

#[cfg(test)]
extern crate std;

#[cfg(test)]
pub(crate) mod test_support {
    //! Serialises tests that touch the process-wide memory state.

    use std::sync::{Mutex, MutexGuard};

    static LOCK: Mutex<()> = Mutex::new(());

    pub fn lock() -> MutexGuard<'static, ()> {
        LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

pub mod error;
pub mod page_alloc;
pub mod paging;
pub mod phys;
pub mod user_copy;

pub use error::{MmError, MmResult};

/// Bring up physical memory management: the frame bitmap with its boot
/// reservations, then the kernel page directory with the identity mapping,
/// then paging itself. Re-entrant for test fixtures: each call rebuilds
/// the bitmap and a fresh kernel directory.
pub fn memory_init() -> MmResult<()> {
    page_alloc::frame_allocator_init();
    paging::paging_init()
}

/// Tracked-memory statistics: `(total_bytes, allocated_bytes)`.
pub fn memory_stats() -> (u32, u32) {
    (
        phys::TRACKED_RAM_SIZE,
        page_alloc::allocated_pages() * catos_abi::addr::PAGE_SIZE,
    )
}
