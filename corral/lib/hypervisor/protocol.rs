//! Control-protocol request and response documents.

use std::path::PathBuf;

use getset::Getters;
use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;

use crate::config::OsKind;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The machine configuration handed to a freshly spawned hypervisor process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TypedBuilder, Getters)]
#[getset(get = "pub with_prefix")]
pub struct MachineConfig {
    /// The id of the VM this process hosts.
    #[builder(setter(transform = |id: impl AsRef<str>| id.as_ref().to_string()))]
    pub(crate) vm_id: String,

    /// The number of vCPUs.
    pub(crate) vcpus: u8,

    /// The amount of memory in MiB.
    pub(crate) memory_mib: u32,

    /// The guest operating system family.
    pub(crate) os_kind: OsKind,

    /// The template or image the VM boots from.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    #[builder(default)]
    pub(crate) template_ref: Option<String>,

    /// The root disk size in GiB.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    #[builder(default)]
    pub(crate) disk_size_gib: Option<u32>,

    /// The host TAP device the guest NIC attaches to.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    #[builder(default)]
    pub(crate) tap_device: Option<String>,

    /// The guest NIC's MAC address.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    #[builder(default)]
    pub(crate) mac_address: Option<String>,
}

/// A request document sent over the control channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ControlRequest {
    /// Installs the machine configuration into the hypervisor.
    CreateConfig {
        /// The configuration to install.
        config: MachineConfig,
    },

    /// Boots the configured machine.
    Boot,

    /// Pauses all guest vCPUs.
    Pause,

    /// Resumes all guest vCPUs.
    Resume,

    /// Requests a graceful guest shutdown.
    Shutdown,

    /// Changes machine resources.
    Resize {
        /// The new number of vCPUs, if changing.
        vcpus: Option<u8>,
        /// The new amount of memory in MiB, if changing.
        memory_mib: Option<u32>,
    },

    /// Captures machine state into an artifact file.
    Snapshot {
        /// Where to write the artifact.
        path: PathBuf,
    },

    /// Loads machine state from an artifact file, leaving the guest paused.
    Restore {
        /// The artifact to load.
        path: PathBuf,
    },
}

/// A response document read from the control channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ControlResponse {
    /// The request succeeded.
    Ok,

    /// The request failed.
    Error {
        /// Whether the hypervisor considers the fault unrecoverable.
        fatal: bool,
        /// A human-readable description of the fault.
        message: String,
    },
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl ControlRequest {
    /// A short name for deadline and log reporting.
    pub fn operation(&self) -> &'static str {
        match self {
            ControlRequest::CreateConfig { .. } => "create_config",
            ControlRequest::Boot => "boot",
            ControlRequest::Pause => "pause",
            ControlRequest::Resume => "resume",
            ControlRequest::Shutdown => "shutdown",
            ControlRequest::Resize { .. } => "resize",
            ControlRequest::Snapshot { .. } => "snapshot",
            ControlRequest::Restore { .. } => "restore",
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_wire_shape() -> anyhow::Result<()> {
        let request = ControlRequest::Resize {
            vcpus: None,
            memory_mib: Some(2048),
        };
        let wire = serde_json::to_string(&request)?;
        assert!(wire.contains(r#""op":"resize""#));
        assert!(wire.contains(r#""memory_mib":2048"#));

        let roundtripped: ControlRequest = serde_json::from_str(&wire)?;
        assert_eq!(roundtripped, request);

        Ok(())
    }

    #[test]
    fn test_response_carries_fatal_marker() -> anyhow::Result<()> {
        let wire = r#"{"status":"error","fatal":false,"message":"balloon not ready"}"#;
        let response: ControlResponse = serde_json::from_str(wire)?;
        assert_eq!(
            response,
            ControlResponse::Error {
                fatal: false,
                message: "balloon not ready".to_string(),
            }
        );

        assert_eq!(
            serde_json::to_string(&ControlResponse::Ok)?,
            r#"{"status":"ok"}"#
        );

        Ok(())
    }
}
