//! Hardware abstraction layer for catos.
//!
//! Owns every device the kernel's security depends on: segmentation and
//! the TSS (`gdt`), the interrupt controller (`pic`), and the tick source
//! (`pit`). All port traffic to these devices goes through this crate —
//! inline I/O elsewhere in the kernel is a bug.

#![no_std]

pub mod gdt;
pub mod pic;
pub mod pit;

use core::sync::atomic::{AtomicU32, Ordering};

use catos_lib::{cpu, klog_info};

static CPU_FEATURES: AtomicU32 = AtomicU32::new(0);

/// Probe and record CPU features. Called once during kernel bring-up,
/// before interrupts are enabled.
pub fn hal_init() {
    let features = cpu::probe_features();
    CPU_FEATURES.store(features, Ordering::Relaxed);
    klog_info!("HAL: cpu features {:#x}", features);
}

pub fn cpu_features() -> u32 {
    CPU_FEATURES.load(Ordering::Relaxed)
}
