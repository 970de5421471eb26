//! Capability-based access control.
//!
//! A flat arena of capability records, at most 16 per process. Checks
//! verify ownership, kind, permission subset, expiry against the tick
//! clock, and the record checksum. Creation, grant, and revocation are
//! privileged operations restricted to the kernel identity (PID 0);
//! user-reachable paths only ever *check*.
//!
//! The "signature" is the source lineage's XOR checksum over the record
//! fields. It detects accidental corruption of a record in place; it is
//! not a cryptographic boundary and cannot authenticate a capability
//! across an untrusted channel.

use core::sync::atomic::{AtomicU32, Ordering};

use catos_abi::caps::{CapPerms, CapabilityKind, CAPS_PER_PROCESS};
use catos_abi::status::Status;
use catos_abi::task::{KERNEL_PID, MAX_PROCESSES};
use catos_lib::{klog_info, IrqMutex};

const TABLE_SIZE: usize = MAX_PROCESSES * CAPS_PER_PROCESS;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Capability {
    pub id: u32,
    pub owner_pid: u32,
    pub kind: CapabilityKind,
    pub permissions: CapPerms,
    pub resource_id: u32,
    /// Tick deadline; 0 means no expiry.
    pub expires_at: u32,
    pub signature: u32,
}

impl Capability {
    fn checksum(&self) -> u32 {
        self.id
            ^ self.owner_pid
            ^ self.kind.as_u32()
            ^ self.permissions.bits()
            ^ self.resource_id
            ^ self.expires_at
    }

    fn sign(&mut self) {
        self.signature = self.checksum();
    }

    fn signature_valid(&self) -> bool {
        self.signature == self.checksum()
    }

    fn expired(&self, now: u32) -> bool {
        self.expires_at != 0 && self.expires_at <= now
    }
}

static TABLE: IrqMutex<[Option<Capability>; TABLE_SIZE]> = IrqMutex::new([None; TABLE_SIZE]);
static NEXT_CAP_ID: AtomicU32 = AtomicU32::new(1);

/// Reset the table. Boot init and test fixtures.
pub fn capability_init() {
    let mut table = TABLE.lock();
    for slot in table.iter_mut() {
        *slot = None;
    }
    drop(table);
    NEXT_CAP_ID.store(1, Ordering::Release);
    klog_info!("CAP: capability table ready ({} slots)", TABLE_SIZE);
}

/// Create a capability for `owner_pid`. Enforces the per-process bound.
/// Returns the capability id, or `None` when the table or the owner's
/// allowance is exhausted.
pub fn capability_create(
    owner_pid: u32,
    kind: CapabilityKind,
    permissions: CapPerms,
    resource_id: u32,
) -> Option<u32> {
    let mut table = TABLE.lock();

    let held = table
        .iter()
        .flatten()
        .filter(|cap| cap.owner_pid == owner_pid)
        .count();
    if held >= CAPS_PER_PROCESS {
        return None;
    }

    let free = table.iter().position(|slot| slot.is_none())?;
    let mut cap = Capability {
        id: NEXT_CAP_ID.fetch_add(1, Ordering::Relaxed),
        owner_pid,
        kind,
        permissions,
        resource_id,
        expires_at: 0,
        signature: 0,
    };
    cap.sign();
    let id = cap.id;
    table[free] = Some(cap);
    Some(id)
}

/// Does `pid` hold a valid capability of `kind` covering `permissions`?
pub fn capability_check(pid: u32, kind: CapabilityKind, permissions: CapPerms) -> Status {
    let now = catos_hal::pit::timer_get_ticks();
    let table = TABLE.lock();
    for cap in table.iter().flatten() {
        if cap.owner_pid == pid
            && cap.kind == kind
            && cap.permissions.contains(permissions)
            && !cap.expired(now)
            && cap.signature_valid()
        {
            return Status::Ok;
        }
    }
    Status::PermissionDenied
}

/// Privileged: mint a capability for `pid`. Only the kernel identity may
/// grant.
pub fn capability_grant(
    caller_pid: u32,
    pid: u32,
    kind: CapabilityKind,
    permissions: CapPerms,
    resource_id: u32,
) -> Status {
    if caller_pid != KERNEL_PID {
        return Status::PermissionDenied;
    }
    match capability_create(pid, kind, permissions, resource_id) {
        Some(_) => Status::Ok,
        None => Status::OutOfMemory,
    }
}

/// Privileged: destroy `pid`'s capabilities of `kind` (all resources, or
/// just `resource_id` when non-zero).
pub fn capability_revoke(caller_pid: u32, pid: u32, kind: CapabilityKind, resource_id: u32) -> Status {
    if caller_pid != KERNEL_PID {
        return Status::PermissionDenied;
    }
    let mut table = TABLE.lock();
    for slot in table.iter_mut() {
        let revoked = matches!(slot, Some(cap) if cap.owner_pid == pid
            && cap.kind == kind
            && (resource_id == 0 || cap.resource_id == resource_id));
        if revoked {
            *slot = None;
        }
    }
    Status::Ok
}

/// Hand `cap_id` to `new_owner_pid`. The caller must own it and it must
/// carry `TRANSFER`. The record is re-signed for the new owner.
pub fn capability_transfer(caller_pid: u32, cap_id: u32, new_owner_pid: u32) -> Status {
    let mut table = TABLE.lock();
    for slot in table.iter_mut() {
        if let Some(cap) = slot {
            if cap.id != cap_id {
                continue;
            }
            if cap.owner_pid != caller_pid {
                return Status::PermissionDenied;
            }
            if !cap.permissions.contains(CapPerms::TRANSFER) {
                return Status::PermissionDenied;
            }
            cap.owner_pid = new_owner_pid;
            cap.sign();
            return Status::Ok;
        }
    }
    Status::NotFound
}

/// Stamp an expiry tick on `cap_id` (owner only).
pub fn capability_set_expiration(caller_pid: u32, cap_id: u32, expires_at: u32) -> Status {
    let mut table = TABLE.lock();
    for slot in table.iter_mut() {
        if let Some(cap) = slot {
            if cap.id != cap_id {
                continue;
            }
            if cap.owner_pid != caller_pid {
                return Status::PermissionDenied;
            }
            cap.expires_at = expires_at;
            cap.sign();
            return Status::Ok;
        }
    }
    Status::NotFound
}

/// Drop expired records. Called opportunistically from the idle path.
pub fn capability_cleanup_expired() {
    let now = catos_hal::pit::timer_get_ticks();
    let mut table = TABLE.lock();
    for slot in table.iter_mut() {
        if matches!(slot, Some(cap) if cap.expired(now)) {
            *slot = None;
        }
    }
}

/// Process teardown: every capability owned by `pid` vanishes with it.
pub fn capability_remove_all(pid: u32) {
    let mut table = TABLE.lock();
    for slot in table.iter_mut() {
        if matches!(slot, Some(cap) if cap.owner_pid == pid) {
            *slot = None;
        }
    }
}

pub fn capability_count() -> usize {
    TABLE.lock().iter().flatten().count()
}

pub fn capability_count_for(pid: u32) -> usize {
    TABLE
        .lock()
        .iter()
        .flatten()
        .filter(|cap| cap.owner_pid == pid)
        .count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::KernelFixture;

    #[test]
    fn create_check_and_subset_permissions() {
        let _fixture = KernelFixture::new();
        let id = capability_create(
            7,
            CapabilityKind::Driver,
            CapPerms::READ | CapPerms::WRITE,
            0,
        );
        assert!(id.is_some());

        assert!(capability_check(7, CapabilityKind::Driver, CapPerms::READ).is_ok());
        assert!(capability_check(7, CapabilityKind::Driver, CapPerms::empty()).is_ok());
        // Superset, wrong kind, wrong owner: all denied.
        assert_eq!(
            capability_check(7, CapabilityKind::Driver, CapPerms::READ | CapPerms::DELETE),
            Status::PermissionDenied
        );
        assert_eq!(
            capability_check(7, CapabilityKind::System, CapPerms::READ),
            Status::PermissionDenied
        );
        assert_eq!(
            capability_check(8, CapabilityKind::Driver, CapPerms::READ),
            Status::PermissionDenied
        );
    }

    #[test]
    fn per_process_bound_is_enforced() {
        let _fixture = KernelFixture::new();
        for _ in 0..CAPS_PER_PROCESS {
            assert!(
                capability_create(3, CapabilityKind::Ipc, CapPerms::READ, 0).is_some()
            );
        }
        assert!(capability_create(3, CapabilityKind::Ipc, CapPerms::READ, 0).is_none());
        // Other processes are unaffected by 3's exhaustion.
        assert!(capability_create(4, CapabilityKind::Ipc, CapPerms::READ, 0).is_some());
    }

    #[test]
    fn grant_and_revoke_are_kernel_only() {
        let _fixture = KernelFixture::new();
        assert_eq!(
            capability_grant(5, 6, CapabilityKind::System, CapPerms::empty(), 0),
            Status::PermissionDenied
        );
        assert_eq!(
            capability_grant(KERNEL_PID, 6, CapabilityKind::System, CapPerms::empty(), 0),
            Status::Ok
        );
        assert!(capability_check(6, CapabilityKind::System, CapPerms::empty()).is_ok());

        assert_eq!(
            capability_revoke(6, 6, CapabilityKind::System, 0),
            Status::PermissionDenied
        );
        assert_eq!(
            capability_revoke(KERNEL_PID, 6, CapabilityKind::System, 0),
            Status::Ok
        );
        assert_eq!(
            capability_check(6, CapabilityKind::System, CapPerms::empty()),
            Status::PermissionDenied
        );
    }

    #[test]
    fn transfer_requires_ownership_and_permission() {
        let _fixture = KernelFixture::new();
        let fixed = capability_create(1, CapabilityKind::Memory, CapPerms::READ, 0).unwrap();
        let movable =
            capability_create(1, CapabilityKind::Memory, CapPerms::READ | CapPerms::TRANSFER, 0)
                .unwrap();

        assert_eq!(capability_transfer(1, fixed, 2), Status::PermissionDenied);
        assert_eq!(capability_transfer(2, movable, 2), Status::PermissionDenied);
        assert_eq!(capability_transfer(1, movable, 2), Status::Ok);
        assert!(capability_check(2, CapabilityKind::Memory, CapPerms::READ).is_ok());
        assert_eq!(
            capability_check(1, CapabilityKind::Memory, CapPerms::TRANSFER),
            Status::PermissionDenied
        );
        assert_eq!(capability_transfer(1, 9999, 2), Status::NotFound);
    }

    #[test]
    fn expiry_against_tick_clock() {
        let _fixture = KernelFixture::new();
        let id = capability_create(9, CapabilityKind::Hardware, CapPerms::READ, 0).unwrap();
        let now = catos_hal::pit::timer_get_ticks();
        assert_eq!(capability_set_expiration(9, id, now + 2), Status::Ok);
        assert!(capability_check(9, CapabilityKind::Hardware, CapPerms::READ).is_ok());

        catos_hal::pit::timer_tick_handler();
        catos_hal::pit::timer_tick_handler();
        assert_eq!(
            capability_check(9, CapabilityKind::Hardware, CapPerms::READ),
            Status::PermissionDenied
        );

        capability_cleanup_expired();
        assert_eq!(capability_count_for(9), 0);
    }

    #[test]
    fn remove_all_on_teardown() {
        let _fixture = KernelFixture::new();
        capability_create(11, CapabilityKind::Driver, CapPerms::READ, 0);
        capability_create(11, CapabilityKind::Ipc, CapPerms::READ, 0);
        capability_create(12, CapabilityKind::Driver, CapPerms::READ, 0);
        capability_remove_all(11);
        assert_eq!(capability_count_for(11), 0);
        assert_eq!(capability_count_for(12), 1);
    }
}
