//! Page directories and tables (two-level 32-bit layout).
//!
//! Every address space identity-maps the tracked RAM range supervisor-only
//! so trap handlers and kernel stacks stay reachable after a CR3 switch.
//! User regions are carved out of that identity map by overwriting
//! individual entries with user-flagged ones (stacks, service images,
//! `memory_alloc` pages).
//!
//! Tables are physical frames manipulated through [`crate::phys`]; this
//! module never holds virtual pointers to them across calls. After any
//! change visible to the live CR3 the TLB is flushed.

use bitflags::bitflags;
use core::sync::atomic::{AtomicU32, Ordering};

use catos_abi::addr::{PhysAddr, VirtAddr, PAGE_SIZE};
use catos_lib::{cpu, klog_info};

use crate::error::{MmError, MmResult};
use crate::page_alloc::{alloc_page, free_page};
use crate::phys::{self, TRACKED_RAM_SIZE};

pub const PD_ENTRIES: usize = 1024;
pub const PT_ENTRIES: usize = 1024;

bitflags! {
    /// Entry bits shared by PDEs and PTEs.
    #[repr(transparent)]
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
    pub struct PageFlags: u32 {
        const PRESENT = 0x001;
        const WRITABLE = 0x002;
        const USER = 0x004;

        const KERNEL_RW = 0x003;
        const USER_RW = 0x007;
    }
}

#[inline]
const fn entry_addr(entry: u32) -> PhysAddr {
    PhysAddr::new(entry & !0xFFF)
}

#[inline]
fn entry_flags(entry: u32) -> PageFlags {
    PageFlags::from_bits_truncate(entry & 0xFFF)
}

static KERNEL_DIR: AtomicU32 = AtomicU32::new(0);
static CURRENT_DIR: AtomicU32 = AtomicU32::new(0);

/// Build the kernel address space and switch to it. Re-entrant for test
/// fixtures: each call builds a fresh directory (the allocator was reset
/// just before, so nothing leaks).
pub fn paging_init() -> MmResult<()> {
    let dir = create_page_directory().ok_or(MmError::NoMemory)?;
    map_kernel_range(dir)?;
    KERNEL_DIR.store(dir.as_u32(), Ordering::Release);
    set_current_directory(dir);
    enable_paging();
    klog_info!("MM: paging enabled, kernel directory at {:#x}", dir.as_u32());
    Ok(())
}

/// Allocate and zero a page directory frame.
pub fn create_page_directory() -> Option<PhysAddr> {
    let dir = alloc_page()?;
    phys::zero_frame(dir);
    Some(dir)
}

/// Identity-map the tracked RAM range supervisor/RW into `dir`. Run
/// before any user mapping is added, in every new address space.
pub fn map_kernel_range(dir: PhysAddr) -> MmResult<()> {
    let mut addr = 0u32;
    while addr < TRACKED_RAM_SIZE {
        map_page(
            dir,
            VirtAddr::new(addr),
            PhysAddr::new(addr),
            PageFlags::KERNEL_RW,
        )?;
        addr += PAGE_SIZE;
    }
    Ok(())
}

/// Install `va → pa` in `dir`, allocating the page table on demand.
///
/// A user-accessible mapping propagates the user bit to the PDE so the
/// table itself is reachable from ring 3. An existing entry at `va` is
/// overwritten — that is how user regions are carved out of the kernel
/// identity map.
pub fn map_page(dir: PhysAddr, va: VirtAddr, pa: PhysAddr, flags: PageFlags) -> MmResult<()> {
    if dir.is_null() || !dir.is_page_aligned() {
        return Err(MmError::InvalidAddress);
    }

    let pde_slot = dir.offset((va.pd_index() * 4) as u32);
    let pde = phys::read_u32(pde_slot);

    let table = if entry_flags(pde).contains(PageFlags::PRESENT) {
        // Reaching a user page through a supervisor PDE faults, so the
        // user bit must bubble up.
        if flags.contains(PageFlags::USER) && !entry_flags(pde).contains(PageFlags::USER) {
            phys::write_u32(pde_slot, pde | PageFlags::USER.bits());
        }
        entry_addr(pde)
    } else {
        let table = alloc_page().ok_or(MmError::NoMemory)?;
        phys::zero_frame(table);
        let pde_flags = (flags & PageFlags::USER_RW) | PageFlags::PRESENT;
        phys::write_u32(pde_slot, table.as_u32() | pde_flags.bits());
        table
    };

    let pte_slot = table.offset((va.pt_index() * 4) as u32);
    let pte = pa.as_u32() & !0xFFF | (flags | PageFlags::PRESENT).bits();
    phys::write_u32(pte_slot, pte);

    flush_if_current(dir);
    Ok(())
}

/// Remove the mapping at `va`, returning the frame it pointed to.
/// The page table itself is kept; empty tables are reclaimed only at
/// directory teardown.
pub fn unmap_page(dir: PhysAddr, va: VirtAddr) -> MmResult<PhysAddr> {
    if dir.is_null() || !dir.is_page_aligned() {
        return Err(MmError::InvalidAddress);
    }

    let pde_slot = dir.offset((va.pd_index() * 4) as u32);
    let pde = phys::read_u32(pde_slot);
    if !entry_flags(pde).contains(PageFlags::PRESENT) {
        return Err(MmError::NotMapped);
    }

    let pte_slot = entry_addr(pde).offset((va.pt_index() * 4) as u32);
    let pte = phys::read_u32(pte_slot);
    if !entry_flags(pte).contains(PageFlags::PRESENT) {
        return Err(MmError::NotMapped);
    }

    phys::write_u32(pte_slot, 0);
    flush_if_current(dir);
    Ok(entry_addr(pte))
}

/// Walk `dir` for `va`. Returns the mapped frame base and the PTE flags.
pub fn translate(dir: PhysAddr, va: VirtAddr) -> Option<(PhysAddr, PageFlags)> {
    if dir.is_null() {
        return None;
    }
    let pde = phys::read_u32(dir.offset((va.pd_index() * 4) as u32));
    if !entry_flags(pde).contains(PageFlags::PRESENT) {
        return None;
    }
    let pte = phys::read_u32(entry_addr(pde).offset((va.pt_index() * 4) as u32));
    if !entry_flags(pte).contains(PageFlags::PRESENT) {
        return None;
    }
    Some((entry_addr(pte), entry_flags(pte)))
}

/// Ring-3 reachability: PTE user+present *and* PDE user+present.
pub fn page_is_user_accessible(dir: PhysAddr, va: VirtAddr) -> bool {
    if dir.is_null() {
        return false;
    }
    let pde = phys::read_u32(dir.offset((va.pd_index() * 4) as u32));
    if !entry_flags(pde).contains(PageFlags::PRESENT | PageFlags::USER) {
        return false;
    }
    let pte = phys::read_u32(entry_addr(pde).offset((va.pt_index() * 4) as u32));
    entry_flags(pte).contains(PageFlags::PRESENT | PageFlags::USER)
}

/// PDE flags covering `va`, for invariant checks.
pub fn pde_flags(dir: PhysAddr, va: VirtAddr) -> PageFlags {
    entry_flags(phys::read_u32(dir.offset((va.pd_index() * 4) as u32)))
}

/// Tear down an address space: free every user-mapped leaf frame, then
/// the page tables, then the directory. Kernel identity frames are
/// supervisor-mapped and therefore never freed here. Kernel stacks are
/// supervisor too — the process manager releases them explicitly.
pub fn destroy_page_directory(dir: PhysAddr) {
    if dir.is_null() || dir.as_u32() == KERNEL_DIR.load(Ordering::Acquire) {
        return;
    }

    for pd_index in 0..PD_ENTRIES {
        let pde = phys::read_u32(dir.offset((pd_index * 4) as u32));
        if !entry_flags(pde).contains(PageFlags::PRESENT) {
            continue;
        }
        let table = entry_addr(pde);
        for pt_index in 0..PT_ENTRIES {
            let pte = phys::read_u32(table.offset((pt_index * 4) as u32));
            if entry_flags(pte).contains(PageFlags::PRESENT | PageFlags::USER) {
                free_page(entry_addr(pte));
            }
        }
        free_page(table);
    }
    free_page(dir);
}

/// Eagerly duplicate every user-visible mapping of `src` into `dst` with
/// freshly allocated, copied frames. Used by process spawn.
pub fn clone_user_mappings(src: PhysAddr, dst: PhysAddr) -> MmResult<()> {
    if src.is_null() || dst.is_null() {
        return Err(MmError::InvalidAddress);
    }

    for pd_index in 0..PD_ENTRIES {
        let pde = phys::read_u32(src.offset((pd_index * 4) as u32));
        if !entry_flags(pde).contains(PageFlags::PRESENT | PageFlags::USER) {
            continue;
        }
        let table = entry_addr(pde);
        for pt_index in 0..PT_ENTRIES {
            let pte = phys::read_u32(table.offset((pt_index * 4) as u32));
            let flags = entry_flags(pte);
            if !flags.contains(PageFlags::PRESENT | PageFlags::USER) {
                continue;
            }
            let frame = alloc_page().ok_or(MmError::NoMemory)?;
            phys::copy_frame(frame, entry_addr(pte));
            let va = VirtAddr::new(((pd_index << 22) | (pt_index << 12)) as u32);
            map_page(dst, va, frame, flags & PageFlags::USER_RW)?;
        }
    }
    Ok(())
}

pub fn kernel_directory() -> PhysAddr {
    PhysAddr::new(KERNEL_DIR.load(Ordering::Acquire))
}

pub fn current_directory() -> PhysAddr {
    PhysAddr::new(CURRENT_DIR.load(Ordering::Acquire))
}

/// Load `dir` into CR3 and record it as current.
pub fn set_current_directory(dir: PhysAddr) {
    CURRENT_DIR.store(dir.as_u32(), Ordering::Release);
    cpu::write_cr3(dir.as_u32());
}

#[inline]
fn flush_if_current(dir: PhysAddr) {
    if dir.as_u32() == CURRENT_DIR.load(Ordering::Acquire) {
        cpu::flush_tlb();
    }
}

fn enable_paging() {
    #[cfg(target_arch = "x86")]
    cpu::write_cr0(cpu::read_cr0() | cpu::CR0_PG);
}
