//! Driver registry.
//!
//! Drivers are ordinary ring-3 tasks; registering only records a name →
//! PID binding plus a requested capability mask, and mints the caller a
//! `Driver` capability so `driver_request` traffic can be gated. The
//! kernel never calls into a driver — it only routes messages at it.

use catos_abi::caps::{CapPerms, CapabilityKind};
use catos_abi::status::Status;
use catos_lib::{klog_info, IrqMutex};

use crate::capability;

pub const MAX_DRIVERS: usize = 16;
pub const DRIVER_NAME_MAX: usize = 32;

#[derive(Clone, Copy)]
pub struct DriverRecord {
    pub name: [u8; DRIVER_NAME_MAX],
    pub name_len: usize,
    pub pid: u32,
    pub capabilities: u32,
}

static REGISTRY: IrqMutex<[Option<DriverRecord>; MAX_DRIVERS]> = IrqMutex::new([None; MAX_DRIVERS]);

/// Reset the registry. Boot init and test fixtures.
pub fn drivers_init() {
    let mut registry = REGISTRY.lock();
    for slot in registry.iter_mut() {
        *slot = None;
    }
    drop(registry);
    klog_info!("DRV: driver registry ready ({} slots)", MAX_DRIVERS);
}

/// Record `pid` as the named service and mint its `Driver` capability.
pub fn driver_register(pid: u32, name: &[u8], capabilities: u32) -> Status {
    if name.is_empty() || name.len() > DRIVER_NAME_MAX {
        return Status::InvalidParam;
    }

    let mut registry = REGISTRY.lock();
    if registry
        .iter()
        .flatten()
        .any(|record| &record.name[..record.name_len] == name)
    {
        return Status::AlreadyExists;
    }
    let Some(free) = registry.iter().position(|slot| slot.is_none()) else {
        return Status::OutOfMemory;
    };

    let mut record = DriverRecord {
        name: [0; DRIVER_NAME_MAX],
        name_len: name.len(),
        pid,
        capabilities,
    };
    record.name[..name.len()].copy_from_slice(name);
    registry[free] = Some(record);
    drop(registry);

    if capability_grant_driver(pid, capabilities).is_err() {
        // Registration stands; the request gate will simply deny.
        klog_info!("DRV: no capability slot left for PID {}", pid);
    }
    klog_info!("DRV: registered driver PID {}", pid);
    Status::Ok
}

fn capability_grant_driver(pid: u32, capabilities: u32) -> Result<(), ()> {
    let perms = CapPerms::from_bits_truncate(capabilities);
    capability::capability_create(pid, CapabilityKind::Driver, perms, 0)
        .map(|_| ())
        .ok_or(())
}

/// Resolve a registered name to its PID.
pub fn driver_find(name: &[u8]) -> Option<u32> {
    let registry = REGISTRY.lock();
    registry
        .iter()
        .flatten()
        .find(|record| &record.name[..record.name_len] == name)
        .map(|record| record.pid)
}

/// Process teardown: drop every registration owned by `pid`.
pub fn driver_unregister_pid(pid: u32) {
    let mut registry = REGISTRY.lock();
    for slot in registry.iter_mut() {
        if matches!(slot, Some(record) if record.pid == pid) {
            *slot = None;
        }
    }
}

pub fn driver_count() -> usize {
    REGISTRY.lock().iter().flatten().count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::KernelFixture;

    #[test]
    fn register_find_and_duplicate_rejection() {
        let _fixture = KernelFixture::new();
        assert_eq!(driver_register(2, b"keyboard", 0x3), Status::Ok);
        assert_eq!(driver_find(b"keyboard"), Some(2));
        assert_eq!(driver_find(b"mouse"), None);
        assert_eq!(driver_register(3, b"keyboard", 0x1), Status::AlreadyExists);
        // The registrant now holds a Driver capability.
        assert!(capability::capability_check(
            2,
            CapabilityKind::Driver,
            CapPerms::from_bits_truncate(0x3)
        )
        .is_ok());
    }

    #[test]
    fn unregister_follows_process_teardown() {
        let _fixture = KernelFixture::new();
        assert_eq!(driver_register(4, b"console", 0x1), Status::Ok);
        assert_eq!(driver_register(4, b"console-alt", 0x1), Status::Ok);
        assert_eq!(driver_count(), 2);
        driver_unregister_pid(4);
        assert_eq!(driver_count(), 0);
        assert_eq!(driver_find(b"console"), None);
    }

    #[test]
    fn name_bounds() {
        let _fixture = KernelFixture::new();
        assert_eq!(driver_register(5, b"", 0), Status::InvalidParam);
        assert_eq!(
            driver_register(5, &[b'x'; DRIVER_NAME_MAX + 1], 0),
            Status::InvalidParam
        );
        assert_eq!(driver_register(5, &[b'x'; DRIVER_NAME_MAX], 0), Status::Ok);
    }
}
