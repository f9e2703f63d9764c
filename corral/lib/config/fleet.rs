//! Fleet-wide configuration types.

use std::{collections::HashMap, path::PathBuf, time::Duration};

use getset::Getters;
use ipnetwork::Ipv4Network;
use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;

use crate::CorralResult;

use super::{
    defaults, DEFAULT_BRIDGE, DEFAULT_CONTROL_CALL_TIMEOUT_SECS, DEFAULT_FORWARD_PORT_END,
    DEFAULT_FORWARD_PORT_START, DEFAULT_HIGH_WATERMARK, DEFAULT_HISTORY_LEN,
    DEFAULT_LINUX_BOOT_TIMEOUT_SECS, DEFAULT_LOW_WATERMARK, DEFAULT_MAX_SNAPSHOTS_PER_VM,
    DEFAULT_MAX_SNAPSHOT_AGE_HOURS, DEFAULT_SAMPLE_INTERVAL_SECS, DEFAULT_SCALE_COOLDOWN_SECS,
    DEFAULT_SCALE_STEP_CPUS, DEFAULT_SCALE_STEP_MEMORY_MIB, DEFAULT_SHUTDOWN_GRACE_SECS,
    DEFAULT_STARTUP_WINDOW_MS, DEFAULT_SUSTAIN_SAMPLES, DEFAULT_WINDOWS_BOOT_TIMEOUT_SECS,
};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The top-level fleet configuration.
#[derive(Debug, Clone, Serialize, Deserialize, TypedBuilder, Getters)]
#[getset(get = "pub with_prefix")]
pub struct FleetConfig {
    /// The hypervisor process and control-channel settings.
    #[serde(default)]
    #[builder(default)]
    pub(crate) hypervisor: HypervisorConfig,

    /// The address pool and bridge settings.
    #[serde(default)]
    #[builder(default)]
    pub(crate) network: NetworkConfig,

    /// The system capacity and owner quota tiers.
    #[serde(default)]
    #[builder(default)]
    pub(crate) capacity: CapacityConfig,

    /// The snapshot storage and retention settings.
    #[serde(default)]
    #[builder(default)]
    pub(crate) snapshots: SnapshotConfig,

    /// The host-utilization monitor and autoscaler settings.
    #[serde(default)]
    #[builder(default)]
    pub(crate) monitor: MonitorConfig,
}

/// Settings for the hypervisor process and its per-VM control channel.
#[derive(Debug, Clone, Serialize, Deserialize, TypedBuilder, Getters)]
#[getset(get = "pub with_prefix")]
pub struct HypervisorConfig {
    /// The path to the hypervisor executable.
    #[serde(default = "HypervisorConfig::default_binary")]
    #[builder(default = HypervisorConfig::default_binary())]
    pub(crate) binary: PathBuf,

    /// The directory control sockets are created in.
    #[serde(default = "HypervisorConfig::default_runtime_dir")]
    #[builder(default = HypervisorConfig::default_runtime_dir())]
    pub(crate) runtime_dir: PathBuf,

    /// The directory per-VM process logs are written to.
    #[serde(default = "HypervisorConfig::default_log_dir")]
    #[builder(default = HypervisorConfig::default_log_dir())]
    pub(crate) log_dir: PathBuf,

    /// The boot deadline for Linux guests, in seconds.
    #[serde(default = "HypervisorConfig::default_linux_boot_timeout_secs")]
    #[builder(default = DEFAULT_LINUX_BOOT_TIMEOUT_SECS)]
    pub(crate) linux_boot_timeout_secs: u64,

    /// The boot deadline for Windows guests, in seconds.
    #[serde(default = "HypervisorConfig::default_windows_boot_timeout_secs")]
    #[builder(default = DEFAULT_WINDOWS_BOOT_TIMEOUT_SECS)]
    pub(crate) windows_boot_timeout_secs: u64,

    /// The graceful-shutdown grace period, in seconds.
    #[serde(default = "HypervisorConfig::default_shutdown_grace_secs")]
    #[builder(default = DEFAULT_SHUTDOWN_GRACE_SECS)]
    pub(crate) shutdown_grace_secs: u64,

    /// How long the control channel keeps retrying to connect after spawn, in milliseconds.
    #[serde(default = "HypervisorConfig::default_startup_window_ms")]
    #[builder(default = DEFAULT_STARTUP_WINDOW_MS)]
    pub(crate) startup_window_ms: u64,

    /// The per-call deadline for control-channel requests, in seconds.
    #[serde(default = "HypervisorConfig::default_call_timeout_secs")]
    #[builder(default = DEFAULT_CONTROL_CALL_TIMEOUT_SECS)]
    pub(crate) call_timeout_secs: u64,
}

/// Settings for the address pool and the shared bridge.
#[derive(Debug, Clone, Serialize, Deserialize, TypedBuilder, Getters)]
#[getset(get = "pub with_prefix")]
pub struct NetworkConfig {
    /// The subnet the address pool is carved from.
    #[serde(default = "defaults::default_subnet")]
    #[builder(default = defaults::default_subnet())]
    pub(crate) subnet: Ipv4Network,

    /// The shared bridge device VMs attach to.
    #[serde(default = "NetworkConfig::default_bridge")]
    #[builder(default = NetworkConfig::default_bridge())]
    pub(crate) bridge: String,

    /// The first host port usable for port forwards.
    #[serde(default = "NetworkConfig::default_forward_port_start")]
    #[builder(default = DEFAULT_FORWARD_PORT_START)]
    pub(crate) forward_port_start: u16,

    /// The last host port usable for port forwards.
    #[serde(default = "NetworkConfig::default_forward_port_end")]
    #[builder(default = DEFAULT_FORWARD_PORT_END)]
    pub(crate) forward_port_end: u16,
}

/// System capacity limits and named owner quota tiers.
#[derive(Debug, Clone, Serialize, Deserialize, TypedBuilder, Getters)]
#[getset(get = "pub with_prefix")]
pub struct CapacityConfig {
    /// The total number of CPU cores the system may hand out.
    #[serde(default = "CapacityConfig::default_total_cpus")]
    #[builder(default = CapacityConfig::default_total_cpus())]
    pub(crate) total_cpus: u32,

    /// The total amount of memory in MiB the system may hand out.
    #[serde(default = "CapacityConfig::default_total_memory_mib")]
    #[builder(default = CapacityConfig::default_total_memory_mib())]
    pub(crate) total_memory_mib: u64,

    /// The named quota tiers owners can be assigned to.
    #[serde(default = "CapacityConfig::default_tiers")]
    #[builder(default = CapacityConfig::default_tiers())]
    pub(crate) tiers: Vec<QuotaTier>,

    /// Owner-id to tier-name assignments. Unassigned owners use the `default` tier.
    #[serde(default)]
    #[builder(default)]
    pub(crate) owners: HashMap<String, String>,
}

/// A named bundle of per-owner resource limits.
#[derive(Debug, Clone, Serialize, Deserialize, TypedBuilder, Getters, PartialEq)]
#[getset(get = "pub with_prefix")]
pub struct QuotaTier {
    /// The tier name.
    #[builder(setter(transform = |name: impl AsRef<str>| name.as_ref().to_string()))]
    pub(crate) name: String,

    /// The maximum total CPU cores across the owner's VMs.
    pub(crate) max_cpus: u32,

    /// The maximum total memory in MiB across the owner's VMs.
    pub(crate) max_memory_mib: u64,
}

/// Snapshot storage and retention settings.
#[derive(Debug, Clone, Serialize, Deserialize, TypedBuilder, Getters)]
#[getset(get = "pub with_prefix")]
pub struct SnapshotConfig {
    /// The directory snapshot artifacts are stored in.
    #[serde(default = "SnapshotConfig::default_dir")]
    #[builder(default = SnapshotConfig::default_dir())]
    pub(crate) dir: PathBuf,

    /// The maximum number of retained snapshots per VM.
    #[serde(default = "SnapshotConfig::default_max_per_vm")]
    #[builder(default = DEFAULT_MAX_SNAPSHOTS_PER_VM)]
    pub(crate) max_per_vm: usize,

    /// The maximum snapshot age in hours before it becomes a pruning candidate.
    #[serde(default = "SnapshotConfig::default_max_age_hours")]
    #[builder(default = DEFAULT_MAX_SNAPSHOT_AGE_HOURS)]
    pub(crate) max_age_hours: u64,
}

/// Host-utilization monitor and autoscaler settings.
#[derive(Debug, Clone, Serialize, Deserialize, TypedBuilder, Getters)]
#[getset(get = "pub with_prefix")]
pub struct MonitorConfig {
    /// The sampling interval, in seconds.
    #[serde(default = "MonitorConfig::default_sample_interval_secs")]
    #[builder(default = DEFAULT_SAMPLE_INTERVAL_SECS)]
    pub(crate) sample_interval_secs: u64,

    /// How many samples the rolling history retains.
    #[serde(default = "MonitorConfig::default_history_len")]
    #[builder(default = DEFAULT_HISTORY_LEN)]
    pub(crate) history_len: usize,

    /// Utilization above this fraction, sustained, recommends scaling up.
    #[serde(default = "MonitorConfig::default_high_watermark")]
    #[builder(default = DEFAULT_HIGH_WATERMARK)]
    pub(crate) high_watermark: f32,

    /// Utilization below this fraction, sustained, recommends scaling down.
    #[serde(default = "MonitorConfig::default_low_watermark")]
    #[builder(default = DEFAULT_LOW_WATERMARK)]
    pub(crate) low_watermark: f32,

    /// How many consecutive breaching samples a recommendation requires.
    #[serde(default = "MonitorConfig::default_sustain_samples")]
    #[builder(default = DEFAULT_SUSTAIN_SAMPLES)]
    pub(crate) sustain_samples: usize,

    /// Whether recommendations are applied automatically.
    #[serde(default)]
    #[builder(default)]
    pub(crate) autoscale: bool,

    /// The capacity adjustment applied per autoscaler action, in cores.
    #[serde(default = "MonitorConfig::default_scale_step_cpus")]
    #[builder(default = DEFAULT_SCALE_STEP_CPUS)]
    pub(crate) scale_step_cpus: u32,

    /// The capacity adjustment applied per autoscaler action, in MiB.
    #[serde(default = "MonitorConfig::default_scale_step_memory_mib")]
    #[builder(default = DEFAULT_SCALE_STEP_MEMORY_MIB)]
    pub(crate) scale_step_memory_mib: u64,

    /// The pause between successive autoscaler actions, in seconds.
    #[serde(default = "MonitorConfig::default_cooldown_secs")]
    #[builder(default = DEFAULT_SCALE_COOLDOWN_SECS)]
    pub(crate) cooldown_secs: u64,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl FleetConfig {
    /// Parses a fleet configuration from a TOML document.
    pub fn from_toml(document: &str) -> CorralResult<Self> {
        let config: Self = toml::from_str(document)?;
        config.validate()?;
        Ok(config)
    }
}

impl HypervisorConfig {
    fn default_binary() -> PathBuf {
        PathBuf::from("/usr/bin/cloud-hypervisor")
    }

    fn default_runtime_dir() -> PathBuf {
        PathBuf::from("/run/corral")
    }

    fn default_log_dir() -> PathBuf {
        PathBuf::from("/var/log/corral")
    }

    fn default_linux_boot_timeout_secs() -> u64 {
        DEFAULT_LINUX_BOOT_TIMEOUT_SECS
    }

    fn default_windows_boot_timeout_secs() -> u64 {
        DEFAULT_WINDOWS_BOOT_TIMEOUT_SECS
    }

    fn default_shutdown_grace_secs() -> u64 {
        DEFAULT_SHUTDOWN_GRACE_SECS
    }

    fn default_startup_window_ms() -> u64 {
        DEFAULT_STARTUP_WINDOW_MS
    }

    fn default_call_timeout_secs() -> u64 {
        DEFAULT_CONTROL_CALL_TIMEOUT_SECS
    }

    /// Returns the graceful-shutdown grace period.
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    /// Returns the window the control channel keeps retrying to connect in.
    pub fn startup_window(&self) -> Duration {
        Duration::from_millis(self.startup_window_ms)
    }

    /// Returns the per-call deadline for control-channel requests.
    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }
}

impl NetworkConfig {
    fn default_bridge() -> String {
        DEFAULT_BRIDGE.to_string()
    }

    fn default_forward_port_start() -> u16 {
        DEFAULT_FORWARD_PORT_START
    }

    fn default_forward_port_end() -> u16 {
        DEFAULT_FORWARD_PORT_END
    }
}

impl CapacityConfig {
    fn default_total_cpus() -> u32 {
        32
    }

    fn default_total_memory_mib() -> u64 {
        65536
    }

    fn default_tiers() -> Vec<QuotaTier> {
        vec![
            QuotaTier {
                name: "default".to_string(),
                max_cpus: 8,
                max_memory_mib: 16384,
            },
            QuotaTier {
                name: "premium".to_string(),
                max_cpus: 32,
                max_memory_mib: 65536,
            },
        ]
    }

    /// Returns the tier the given owner is assigned to.
    ///
    /// Owners without an explicit assignment fall back to the `default` tier.
    pub fn tier_for(&self, owner_id: &str) -> Option<&QuotaTier> {
        let tier_name = self
            .owners
            .get(owner_id)
            .map(String::as_str)
            .unwrap_or("default");
        self.tiers.iter().find(|tier| tier.name == tier_name)
    }
}

impl SnapshotConfig {
    fn default_dir() -> PathBuf {
        PathBuf::from("/var/lib/corral/snapshots")
    }

    fn default_max_per_vm() -> usize {
        DEFAULT_MAX_SNAPSHOTS_PER_VM
    }

    fn default_max_age_hours() -> u64 {
        DEFAULT_MAX_SNAPSHOT_AGE_HOURS
    }

    /// Returns the maximum snapshot age as a duration.
    pub fn max_age(&self) -> chrono::Duration {
        chrono::Duration::hours(self.max_age_hours as i64)
    }
}

impl MonitorConfig {
    fn default_sample_interval_secs() -> u64 {
        DEFAULT_SAMPLE_INTERVAL_SECS
    }

    fn default_history_len() -> usize {
        DEFAULT_HISTORY_LEN
    }

    fn default_high_watermark() -> f32 {
        DEFAULT_HIGH_WATERMARK
    }

    fn default_low_watermark() -> f32 {
        DEFAULT_LOW_WATERMARK
    }

    fn default_sustain_samples() -> usize {
        DEFAULT_SUSTAIN_SAMPLES
    }

    fn default_scale_step_cpus() -> u32 {
        DEFAULT_SCALE_STEP_CPUS
    }

    fn default_scale_step_memory_mib() -> u64 {
        DEFAULT_SCALE_STEP_MEMORY_MIB
    }

    fn default_cooldown_secs() -> u64 {
        DEFAULT_SCALE_COOLDOWN_SECS
    }

    /// Returns the sampling interval as a duration.
    pub fn sample_interval(&self) -> Duration {
        Duration::from_secs(self.sample_interval_secs)
    }

    /// Returns the autoscaler cooldown as a duration.
    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl Default for FleetConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl Default for HypervisorConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl Default for CapacityConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fleet_config_from_toml_defaults() -> anyhow::Result<()> {
        let config = FleetConfig::from_toml("")?;

        assert_eq!(*config.get_network().get_bridge(), DEFAULT_BRIDGE);
        assert_eq!(config.get_network().get_subnet().prefix(), 24);
        assert_eq!(*config.get_capacity().get_total_cpus(), 32);
        assert_eq!(config.get_capacity().get_tiers().len(), 2);

        Ok(())
    }

    #[test]
    fn test_fleet_config_from_toml_overrides() -> anyhow::Result<()> {
        let document = r#"
            [network]
            subnet = "10.99.0.0/16"
            bridge = "br-fleet"

            [capacity]
            total_cpus = 8
            total_memory_mib = 8192

            [[capacity.tiers]]
            name = "default"
            max_cpus = 2
            max_memory_mib = 2048

            [capacity.owners]
            acme = "default"
        "#;

        let config = FleetConfig::from_toml(document)?;

        assert_eq!(*config.get_network().get_bridge(), "br-fleet");
        assert_eq!(*config.get_capacity().get_total_cpus(), 8);
        assert_eq!(
            config.get_capacity().tier_for("acme").unwrap().get_name(),
            "default"
        );

        Ok(())
    }

    #[test]
    fn test_tier_for_unassigned_owner_falls_back_to_default() {
        let capacity = CapacityConfig::default();
        let tier = capacity.tier_for("nobody-in-particular").unwrap();
        assert_eq!(tier.get_name(), "default");
    }
}
