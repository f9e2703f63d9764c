use std::net::Ipv4Addr;

use ipnetwork::Ipv4Network;

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The smallest admissible number of vCPUs for any VM.
pub const MIN_NUM_VCPUS: u8 = 1;

/// The largest admissible number of vCPUs for any VM.
pub const MAX_NUM_VCPUS: u8 = 64;

/// The smallest admissible amount of memory in MiB for any VM.
pub const MIN_MEMORY_MIB: u32 = 128;

/// The default subnet the address pool is carved from.
pub const DEFAULT_SUBNET: &str = "172.30.0.0/24";

/// The default shared bridge device name.
pub const DEFAULT_BRIDGE: &str = "corral0";

/// The first host port available for port forwards.
pub const DEFAULT_FORWARD_PORT_START: u16 = 20000;

/// The last host port available for port forwards.
pub const DEFAULT_FORWARD_PORT_END: u16 = 29999;

/// The default boot deadline for Linux guests, in seconds.
pub const DEFAULT_LINUX_BOOT_TIMEOUT_SECS: u64 = 10;

/// The default boot deadline for Windows guests, in seconds.
pub const DEFAULT_WINDOWS_BOOT_TIMEOUT_SECS: u64 = 90;

/// The default graceful-shutdown grace period, in seconds.
pub const DEFAULT_SHUTDOWN_GRACE_SECS: u64 = 30;

/// How long the control channel keeps retrying to connect after process spawn, in milliseconds.
pub const DEFAULT_STARTUP_WINDOW_MS: u64 = 3000;

/// The default per-call deadline for control-channel requests, in seconds.
pub const DEFAULT_CONTROL_CALL_TIMEOUT_SECS: u64 = 10;

/// The default maximum number of retained snapshots per VM.
pub const DEFAULT_MAX_SNAPSHOTS_PER_VM: usize = 16;

/// The default maximum snapshot age, in hours.
pub const DEFAULT_MAX_SNAPSHOT_AGE_HOURS: u64 = 720;

/// The default host-utilization sampling interval, in seconds.
pub const DEFAULT_SAMPLE_INTERVAL_SECS: u64 = 15;

/// The default number of utilization samples retained.
pub const DEFAULT_HISTORY_LEN: usize = 40;

/// Utilization above this fraction, sustained, recommends scaling up.
pub const DEFAULT_HIGH_WATERMARK: f32 = 0.85;

/// Utilization below this fraction, sustained, recommends scaling down.
pub const DEFAULT_LOW_WATERMARK: f32 = 0.30;

/// How many consecutive samples must breach a watermark before a recommendation fires.
pub const DEFAULT_SUSTAIN_SAMPLES: usize = 4;

/// The default capacity adjustment applied per autoscaler action, in cores.
pub const DEFAULT_SCALE_STEP_CPUS: u32 = 2;

/// The default capacity adjustment applied per autoscaler action, in MiB.
pub const DEFAULT_SCALE_STEP_MEMORY_MIB: u64 = 2048;

/// The default pause between successive autoscaler actions, in seconds.
pub const DEFAULT_SCALE_COOLDOWN_SECS: u64 = 300;

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Returns the default address-pool subnet.
pub fn default_subnet() -> Ipv4Network {
    // The constant is a valid literal, parse cannot fail.
    DEFAULT_SUBNET.parse().unwrap_or_else(|_| {
        Ipv4Network::new(Ipv4Addr::new(172, 30, 0, 0), 24).expect("valid default subnet")
    })
}
