//! Boot service bring-up.
//!
//! The boot loader stages the five service binaries (init, keyboard,
//! console, timer, shell) at fixed physical addresses. Each one becomes
//! a user task whose image is copied into fresh frames and mapped at the
//! common entry VA; creation order pins their well-known PIDs 1..5.
//!
//! The staging area is not reserved in the frame bitmap: bring-up runs
//! early enough that the allocator's first-fit cursor is still far below
//! it, and once the copies are made the staging bytes are dead.

use catos_abi::addr::{PhysAddr, VirtAddr, PAGE_SIZE};
use catos_abi::task::{
    KERNEL_PID, SERVICE_COUNT, SERVICE_ENTRY_VA, SERVICE_IMAGE_SIZE, SERVICE_IMAGE_STRIDE,
    SERVICE_STAGING_BASE,
};
use catos_lib::{klog_error, klog_info};
use catos_mm::{page_alloc, paging, phys};

use crate::process::{self, Pcb};
use crate::sched;

const SERVICE_NAMES: [&str; SERVICE_COUNT] = ["init", "keyboard", "console", "timer", "shell"];
const IMAGE_PAGES: u32 = SERVICE_IMAGE_SIZE / PAGE_SIZE;

/// Spawn one staged service. Returns its PID.
pub fn start_service(index: usize) -> Option<u32> {
    let staging = SERVICE_STAGING_BASE + (index as u32) * SERVICE_IMAGE_STRIDE;

    let pcb = process::process_create(KERNEL_PID, true);
    if pcb.is_null() {
        return None;
    }
    // SAFETY: freshly created, unscheduled PCB.
    let p: &mut Pcb = unsafe { &mut *pcb };

    for page in 0..IMAGE_PAGES {
        let Some(frame) = page_alloc::alloc_page() else {
            process::process_exit(pcb, 0);
            return None;
        };
        phys::copy_frame(frame, PhysAddr::new(staging + page * PAGE_SIZE));

        let va = VirtAddr::new(SERVICE_ENTRY_VA + page * PAGE_SIZE);
        if paging::map_page(p.page_directory, va, frame, paging::PageFlags::USER_RW).is_err() {
            page_alloc::free_page(frame);
            process::process_exit(pcb, 0);
            return None;
        }
    }

    process::process_setup_initial_frame(pcb, SERVICE_ENTRY_VA);
    sched::scheduler_add_process(pcb);
    Some(p.pid)
}

/// Spawn all staged services in PID order.
pub fn spawn_boot_services() {
    for (index, name) in SERVICE_NAMES.iter().enumerate() {
        match start_service(index) {
            Some(pid) => klog_info!("SVC: {} running as PID {}", name, pid),
            None => klog_error!("SVC: failed to start {}", name),
        }
    }
}
