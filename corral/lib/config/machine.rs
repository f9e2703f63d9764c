//! Caller-facing machine descriptions.

use std::{fmt, net::Ipv4Addr, time::Duration};

use getset::Getters;
use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;

use super::HypervisorConfig;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The guest operating system family of a VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OsKind {
    /// A Linux guest.
    Linux,

    /// A Windows guest.
    Windows,
}

/// Admission-ordering priority of a VM.
///
/// Priority never preempts running VMs; it only orders competing admission
/// requests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// Admitted after normal and high priority requests.
    Low,

    /// The default priority.
    #[default]
    Normal,

    /// Admitted ahead of normal and low priority requests.
    High,
}

/// The caller-supplied description of a VM to create.
#[derive(Debug, Clone, Serialize, Deserialize, TypedBuilder, Getters)]
#[getset(get = "pub with_prefix")]
pub struct VmSpec {
    /// The caller-chosen, fleet-unique name.
    #[builder(setter(transform = |name: impl AsRef<str>| name.as_ref().to_string()))]
    pub(crate) name: String,

    /// The guest operating system family.
    pub(crate) os_kind: OsKind,

    /// The number of vCPUs.
    pub(crate) vcpus: u8,

    /// The amount of memory in MiB.
    pub(crate) memory_mib: u32,

    /// The template or image the VM boots from.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    #[builder(default)]
    pub(crate) template_ref: Option<String>,

    /// The owner the VM's resource usage is accounted to.
    #[builder(setter(transform = |owner: impl AsRef<str>| owner.as_ref().to_string()))]
    pub(crate) owner_id: String,

    /// The admission-ordering priority.
    #[serde(default)]
    #[builder(default)]
    pub(crate) priority: Priority,

    /// The network settings.
    #[serde(default)]
    #[builder(default)]
    pub(crate) network: VmNetworkSpec,

    /// The storage settings.
    #[serde(default)]
    #[builder(default)]
    pub(crate) storage: VmStorageSpec,
}

/// Network settings of a machine description.
#[derive(Debug, Clone, Default, Serialize, Deserialize, TypedBuilder, Getters)]
#[getset(get = "pub with_prefix")]
pub struct VmNetworkSpec {
    /// An override for the shared bridge the VM attaches to.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    #[builder(default)]
    pub(crate) bridge: Option<String>,

    /// A specific address to reserve instead of the lowest free one.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    #[builder(default)]
    pub(crate) static_ip: Option<Ipv4Addr>,
}

/// Storage settings of a machine description.
#[derive(Debug, Clone, Default, Serialize, Deserialize, TypedBuilder, Getters)]
#[getset(get = "pub with_prefix")]
pub struct VmStorageSpec {
    /// The root disk size in GiB.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    #[builder(default)]
    pub(crate) disk_size_gib: Option<u32>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl OsKind {
    /// The smallest number of vCPUs this OS family boots with.
    pub fn min_vcpus(&self) -> u8 {
        match self {
            OsKind::Linux => 1,
            OsKind::Windows => 2,
        }
    }

    /// The smallest amount of memory in MiB this OS family boots with.
    pub fn min_memory_mib(&self) -> u32 {
        match self {
            OsKind::Linux => 128,
            OsKind::Windows => 1024,
        }
    }

    /// The boot deadline for this OS family.
    pub fn boot_timeout(&self, config: &HypervisorConfig) -> Duration {
        match self {
            OsKind::Linux => Duration::from_secs(*config.get_linux_boot_timeout_secs()),
            OsKind::Windows => Duration::from_secs(*config.get_windows_boot_timeout_secs()),
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl fmt::Display for OsKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OsKind::Linux => write!(f, "linux"),
            OsKind::Windows => write!(f, "windows"),
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
    fn test_priority_ordering() {
        assert!(Priority::High > Priority::Normal);
        assert!(Priority::Normal > Priority::Low);
        assert_eq!(Priority::default(), Priority::Normal);
    }

    #[test]
    fn test_os_kind_serde_lowercase() -> anyhow::Result<()> {
        assert_eq!(serde_json::to_string(&OsKind::Linux)?, r#""linux""#);
        assert_eq!(
            serde_json::from_str::<OsKind>(r#""windows""#)?,
            OsKind::Windows
        );
        Ok(())
    }

    #[test]
    fn test_windows_minimums_are_stricter() {
        assert!(OsKind::Windows.min_vcpus() > OsKind::Linux.min_vcpus());
        assert!(OsKind::Windows.min_memory_mib() > OsKind::Linux.min_memory_mib());
    }
}
