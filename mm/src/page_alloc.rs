//! Physical frame allocator.
//!
//! A bitmap with one bit per 4 KiB frame over the tracked RAM range,
//! searched first-fit for contiguous runs. Contiguity only matters for
//! callers that need it (DMA-style buffers, multi-frame stacks), but the
//! same allocator serves single-frame requests.
//!
//! Boot reservations: the low MiB (BIOS, EBDA, VGA), and the kernel image
//! MiB at 1–2 MiB. The bitmap itself is a static inside the kernel image,
//! so the image reservation covers its storage. Reserved frames are never
//! handed out and never freed.
//!
//! Double-free is a logic error the bitmap cannot detect; callers own
//! their frames.

use catos_abi::addr::{PhysAddr, PAGE_SIZE};
use catos_lib::{klog_info, IrqMutex};

use crate::phys::TRACKED_RAM_SIZE;

pub const FRAME_COUNT: usize = (TRACKED_RAM_SIZE / PAGE_SIZE) as usize;
const BITMAP_WORDS: usize = FRAME_COUNT / 32;

/// Low MiB: BIOS data, EBDA, VGA text memory.
const RESERVED_LOW_FRAMES: u32 = (1024 * 1024) / PAGE_SIZE;
/// Kernel image by convention: 1–2 MiB.
const KERNEL_IMAGE_FIRST_FRAME: u32 = RESERVED_LOW_FRAMES;
const KERNEL_IMAGE_END_FRAME: u32 = (2 * 1024 * 1024) / PAGE_SIZE;

struct FrameBitmap {
    words: [u32; BITMAP_WORDS],
    allocated: u32,
}

impl FrameBitmap {
    const fn new() -> Self {
        Self {
            words: [0; BITMAP_WORDS],
            allocated: 0,
        }
    }

    #[inline]
    fn set(&mut self, frame: u32) {
        self.words[(frame / 32) as usize] |= 1 << (frame % 32);
    }

    #[inline]
    fn clear(&mut self, frame: u32) {
        self.words[(frame / 32) as usize] &= !(1 << (frame % 32));
    }

    #[inline]
    fn test(&self, frame: u32) -> bool {
        self.words[(frame / 32) as usize] & (1 << (frame % 32)) != 0
    }

    /// First-fit scan for `count` contiguous free frames.
    fn find_run(&self, count: u32) -> Option<u32> {
        if count == 0 || count as usize > FRAME_COUNT {
            return None;
        }
        let mut base = 0u32;
        while base + count <= FRAME_COUNT as u32 {
            match (base..base + count).find(|&frame| self.test(frame)) {
                // Skip past the collision rather than sliding one by one.
                Some(used) => base = used + 1,
                None => return Some(base),
            }
        }
        None
    }
}

static BITMAP: IrqMutex<FrameBitmap> = IrqMutex::new(FrameBitmap::new());

/// Reset the bitmap and apply the boot reservations. Safe to call again
/// (test fixtures); all previous allocations are forgotten.
pub fn frame_allocator_init() {
    let mut bitmap = BITMAP.lock();
    *bitmap = FrameBitmap::new();
    for frame in 0..RESERVED_LOW_FRAMES {
        bitmap.set(frame);
    }
    for frame in KERNEL_IMAGE_FIRST_FRAME..KERNEL_IMAGE_END_FRAME {
        bitmap.set(frame);
    }
    klog_info!(
        "MM: frame allocator ready, {} frames tracked, {} reserved",
        FRAME_COUNT,
        KERNEL_IMAGE_END_FRAME
    );
}

/// Allocate `count` contiguous frames. Returns the base address, or
/// `None` when no run is free.
pub fn alloc_pages(count: u32) -> Option<PhysAddr> {
    let mut bitmap = BITMAP.lock();
    let base = bitmap.find_run(count)?;
    for frame in base..base + count {
        bitmap.set(frame);
    }
    bitmap.allocated += count;
    Some(PhysAddr::from_frame_index(base))
}

pub fn alloc_page() -> Option<PhysAddr> {
    alloc_pages(1)
}

/// Release `count` frames starting at `base`. Reserved frames are left
/// untouched so a stray free cannot hand out the kernel image.
pub fn free_pages(base: PhysAddr, count: u32) {
    let mut bitmap = BITMAP.lock();
    let first = base.frame_index();
    for frame in first..(first + count).min(FRAME_COUNT as u32) {
        if frame < KERNEL_IMAGE_END_FRAME {
            continue;
        }
        if bitmap.test(frame) {
            bitmap.clear(frame);
            bitmap.allocated = bitmap.allocated.saturating_sub(1);
        }
    }
}

pub fn free_page(base: PhysAddr) {
    free_pages(base, 1);
}

/// Frames handed out since init (reservations excluded).
pub fn allocated_pages() -> u32 {
    BITMAP.lock().allocated
}

pub fn frame_is_allocated(pa: PhysAddr) -> bool {
    let bitmap = BITMAP.lock();
    let frame = pa.frame_index();
    frame < FRAME_COUNT as u32 && bitmap.test(frame)
}
