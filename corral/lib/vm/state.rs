//! The VM record and its lifecycle state machine.

use std::{fmt, net::Ipv4Addr};

use chrono::{DateTime, Utc};
use getset::Getters;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    config::{OsKind, Priority, VmSpec},
    hypervisor::MachineConfig,
    network::NetworkAllocation,
    quota::ResourceAllocation,
    CorralError, CorralResult,
};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The lifecycle state of a VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VmStatus {
    /// Record exists; nothing allocated yet.
    Created,

    /// Allocations held, boot in flight.
    Starting,

    /// Boot confirmed; guest is live.
    Running,

    /// Guest vCPUs are paused.
    Paused,

    /// Graceful shutdown in flight.
    Stopping,

    /// Hypervisor process confirmed gone; address retained.
    Stopped,

    /// An unrecoverable fault; only destruction remains.
    Error,

    /// Terminal. The record is removed when this is reached.
    Deleted,
}

/// One managed VM.
#[derive(Debug, Clone, Serialize, Deserialize, Getters)]
#[getset(get = "pub with_prefix")]
pub struct VirtualMachine {
    /// The system-generated id. Immutable.
    pub(crate) id: String,

    /// The caller-chosen, fleet-unique name. Immutable.
    pub(crate) name: String,

    /// The guest operating system family.
    pub(crate) os_kind: OsKind,

    /// The number of vCPUs.
    pub(crate) vcpus: u8,

    /// The amount of memory in MiB.
    pub(crate) memory_mib: u32,

    /// The lifecycle state.
    pub(crate) status: VmStatus,

    /// The template or image the VM boots from.
    pub(crate) template_ref: Option<String>,

    /// The owner the VM's usage is accounted to.
    pub(crate) owner_id: String,

    /// The admission-ordering priority.
    pub(crate) priority: Priority,

    /// A specific address requested at creation, if any.
    pub(crate) requested_ip: Option<Ipv4Addr>,

    /// A bridge override requested at creation, if any.
    pub(crate) bridge_override: Option<String>,

    /// The root disk size in GiB, if specified.
    pub(crate) disk_size_gib: Option<u32>,

    /// When the record was created.
    pub(crate) created_at: DateTime<Utc>,

    /// How long the last successful boot took, in milliseconds.
    pub(crate) boot_duration_ms: Option<u64>,

    /// The network resources currently held, mirrored for observability.
    pub(crate) network: Option<NetworkAllocation>,

    /// The admitted resources currently held, mirrored for observability.
    pub(crate) resources: Option<ResourceAllocation>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl VmStatus {
    /// Whether this state ends the record's life.
    pub fn is_terminal(&self) -> bool {
        matches!(self, VmStatus::Deleted)
    }

    /// Whether the lifecycle machine permits moving to `to` from here.
    pub fn can_transition_to(&self, to: VmStatus) -> bool {
        // Any non-terminal state may fall to Error on an unrecoverable fault.
        if to == VmStatus::Error {
            return !self.is_terminal() && *self != VmStatus::Error;
        }

        matches!(
            (self, to),
            (VmStatus::Created, VmStatus::Starting)
                | (VmStatus::Created, VmStatus::Deleted)
                | (VmStatus::Starting, VmStatus::Running)
                | (VmStatus::Running, VmStatus::Paused)
                | (VmStatus::Running, VmStatus::Stopping)
                | (VmStatus::Paused, VmStatus::Running)
                | (VmStatus::Paused, VmStatus::Stopping)
                | (VmStatus::Stopping, VmStatus::Stopped)
                | (VmStatus::Stopped, VmStatus::Starting)
                | (VmStatus::Stopped, VmStatus::Deleted)
                | (VmStatus::Error, VmStatus::Deleted)
        )
    }
}

impl VirtualMachine {
    /// Builds a fresh record from a validated machine description.
    pub fn from_spec(spec: &VmSpec) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: spec.get_name().clone(),
            os_kind: *spec.get_os_kind(),
            vcpus: *spec.get_vcpus(),
            memory_mib: *spec.get_memory_mib(),
            status: VmStatus::Created,
            template_ref: spec.get_template_ref().clone(),
            owner_id: spec.get_owner_id().clone(),
            priority: *spec.get_priority(),
            requested_ip: *spec.get_network().get_static_ip(),
            bridge_override: spec.get_network().get_bridge().clone(),
            disk_size_gib: *spec.get_storage().get_disk_size_gib(),
            created_at: Utc::now(),
            boot_duration_ms: None,
            network: None,
            resources: None,
        }
    }

    /// Moves the record to a new state, enforcing the lifecycle machine.
    pub fn transition(&mut self, to: VmStatus, operation: &'static str) -> CorralResult<()> {
        if !self.status.can_transition_to(to) {
            return Err(CorralError::InvalidState {
                name: self.name.clone(),
                status: self.status.to_string(),
                operation,
            });
        }
        self.status = to;
        Ok(())
    }

    /// The machine configuration for launching this VM at its current size.
    pub fn machine_config(&self) -> MachineConfig {
        self.machine_config_sized(self.vcpus, self.memory_mib)
    }

    /// The machine configuration for launching this VM at an explicit size.
    pub fn machine_config_sized(&self, vcpus: u8, memory_mib: u32) -> MachineConfig {
        MachineConfig::builder()
            .vm_id(&self.id)
            .vcpus(vcpus)
            .memory_mib(memory_mib)
            .os_kind(self.os_kind)
            .template_ref(self.template_ref.clone())
            .disk_size_gib(self.disk_size_gib)
            .tap_device(
                self.network
                    .as_ref()
                    .map(|n| n.get_interface_name().clone()),
            )
            .mac_address(self.network.as_ref().map(|n| n.get_mac_address().clone()))
            .build()
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl fmt::Display for VmStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rendered = match self {
            VmStatus::Created => "created",
            VmStatus::Starting => "starting",
            VmStatus::Running => "running",
            VmStatus::Paused => "paused",
            VmStatus::Stopping => "stopping",
            VmStatus::Stopped => "stopped",
            VmStatus::Error => "error",
            VmStatus::Deleted => "deleted",
        };
        write!(f, "{}", rendered)
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OsKind;

    fn spec() -> VmSpec {
        VmSpec::builder()
            .name("web-1")
            .os_kind(OsKind::Linux)
            .vcpus(2)
            .memory_mib(512)
            .owner_id("alice")
            .build()
    }

    #[test]
    fn test_happy_path_transitions() {
        let mut vm = VirtualMachine::from_spec(&spec());
        assert_eq!(vm.status, VmStatus::Created);

        for (to, operation) in [
            (VmStatus::Starting, "start"),
            (VmStatus::Running, "start"),
            (VmStatus::Paused, "pause"),
            (VmStatus::Running, "resume"),
            (VmStatus::Stopping, "stop"),
            (VmStatus::Stopped, "stop"),
            (VmStatus::Starting, "start"),
            (VmStatus::Running, "start"),
        ] {
            vm.transition(to, operation).unwrap();
        }
    }

    #[test]
    fn test_forbidden_transitions_rejected() {
        let mut vm = VirtualMachine::from_spec(&spec());

        // A created VM cannot be paused or stopped.
        assert!(vm.transition(VmStatus::Paused, "pause").is_err());
        assert!(vm.transition(VmStatus::Stopping, "stop").is_err());

        // Running cannot be destroyed directly.
        vm.transition(VmStatus::Starting, "start").unwrap();
        vm.transition(VmStatus::Running, "start").unwrap();
        let err = vm.transition(VmStatus::Deleted, "destroy").unwrap_err();
        assert!(matches!(err, CorralError::InvalidState { .. }));
    }

    #[test]
    fn test_any_non_terminal_state_can_fault() {
        for status in [
            VmStatus::Created,
            VmStatus::Starting,
            VmStatus::Running,
            VmStatus::Paused,
            VmStatus::Stopping,
            VmStatus::Stopped,
        ] {
            assert!(status.can_transition_to(VmStatus::Error), "{}", status);
        }
        assert!(!VmStatus::Deleted.can_transition_to(VmStatus::Error));
    }

    #[test]
    fn test_destroy_allowed_from_created_stopped_error() {
        for status in [VmStatus::Created, VmStatus::Stopped, VmStatus::Error] {
            assert!(status.can_transition_to(VmStatus::Deleted), "{}", status);
        }
        for status in [VmStatus::Running, VmStatus::Paused, VmStatus::Starting] {
            assert!(!status.can_transition_to(VmStatus::Deleted), "{}", status);
        }
    }
}
