//! Host-side link and NAT realization.

use std::{
    net::Ipv4Addr,
    sync::atomic::{AtomicUsize, Ordering},
};

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use crate::{CorralError, CorralResult};

use super::PortForward;

//--------------------------------------------------------------------------------------------------
// Traits
//--------------------------------------------------------------------------------------------------

/// Realizes bridge, TAP, and NAT state on the host.
///
/// The allocator does all bookkeeping itself and only calls through this
/// seam to make the host match, so tests and dry runs can substitute
/// [`NoopLinkDriver`].
#[async_trait]
pub trait LinkDriver: Send + Sync {
    /// Creates the shared bridge if it does not exist and brings it up.
    async fn ensure_bridge(&self, bridge: &str) -> CorralResult<()>;

    /// Creates a TAP device and attaches it to the bridge.
    async fn create_tap(&self, tap: &str, bridge: &str) -> CorralResult<()>;

    /// Detaches and deletes a TAP device.
    async fn destroy_tap(&self, tap: &str) -> CorralResult<()>;

    /// Installs a DNAT rule for one port forward.
    async fn add_forward(&self, forward: &PortForward, guest_ip: Ipv4Addr) -> CorralResult<()>;

    /// Removes the DNAT rule for one port forward.
    async fn remove_forward(&self, forward: &PortForward, guest_ip: Ipv4Addr) -> CorralResult<()>;
}

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A driver that shells out to `ip` and `iptables`.
#[derive(Debug, Default)]
pub struct IpCommandDriver;

/// A driver that records calls and touches nothing.
#[derive(Debug, Default)]
pub struct NoopLinkDriver {
    taps_created: AtomicUsize,
    taps_destroyed: AtomicUsize,
    forwards_added: AtomicUsize,
    forwards_removed: AtomicUsize,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl IpCommandDriver {
    /// Creates a new command-backed driver.
    pub fn new() -> Self {
        Self
    }

    /// Runs one host command, tolerating stderr fragments listed in `ignore`.
    async fn run(program: &str, args: &[&str], ignore: &[&str]) -> CorralResult<()> {
        let rendered = format!("{} {}", program, args.join(" "));
        debug!(command = %rendered, "running host network command");

        let output = Command::new(program).args(args).output().await?;
        if output.status.success() {
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        if ignore.iter().any(|fragment| stderr.contains(fragment)) {
            return Ok(());
        }

        Err(CorralError::HostNetworkCommand {
            command: rendered,
            stderr,
        })
    }
}

impl NoopLinkDriver {
    /// Creates a new no-op driver.
    pub fn new() -> Self {
        Self::default()
    }

    /// How many TAP devices are currently realized.
    pub fn live_taps(&self) -> usize {
        self.taps_created.load(Ordering::SeqCst) - self.taps_destroyed.load(Ordering::SeqCst)
    }

    /// How many DNAT rules are currently realized.
    pub fn live_forwards(&self) -> usize {
        self.forwards_added.load(Ordering::SeqCst) - self.forwards_removed.load(Ordering::SeqCst)
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

#[async_trait]
impl LinkDriver for IpCommandDriver {
    async fn ensure_bridge(&self, bridge: &str) -> CorralResult<()> {
        Self::run(
            "ip",
            &["link", "add", bridge, "type", "bridge"],
            &["File exists"],
        )
        .await?;
        Self::run("ip", &["link", "set", bridge, "up"], &[]).await
    }

    async fn create_tap(&self, tap: &str, bridge: &str) -> CorralResult<()> {
        Self::run("ip", &["tuntap", "add", "dev", tap, "mode", "tap"], &[]).await?;
        Self::run("ip", &["link", "set", tap, "master", bridge], &[]).await?;
        Self::run("ip", &["link", "set", tap, "up"], &[]).await
    }

    async fn destroy_tap(&self, tap: &str) -> CorralResult<()> {
        Self::run("ip", &["link", "del", tap], &["Cannot find device"]).await
    }

    async fn add_forward(&self, forward: &PortForward, guest_ip: Ipv4Addr) -> CorralResult<()> {
        let protocol = forward.get_protocol().to_string();
        let host_port = forward.get_host_port().to_string();
        let destination = format!("{}:{}", guest_ip, forward.get_guest_port());
        Self::run(
            "iptables",
            &[
                "-t",
                "nat",
                "-A",
                "PREROUTING",
                "-p",
                &protocol,
                "--dport",
                &host_port,
                "-j",
                "DNAT",
                "--to-destination",
                &destination,
            ],
            &[],
        )
        .await
    }

    async fn remove_forward(&self, forward: &PortForward, guest_ip: Ipv4Addr) -> CorralResult<()> {
        let protocol = forward.get_protocol().to_string();
        let host_port = forward.get_host_port().to_string();
        let destination = format!("{}:{}", guest_ip, forward.get_guest_port());
        Self::run(
            "iptables",
            &[
                "-t",
                "nat",
                "-D",
                "PREROUTING",
                "-p",
                &protocol,
                "--dport",
                &host_port,
                "-j",
                "DNAT",
                "--to-destination",
                &destination,
            ],
            &["does a matching rule exist"],
        )
        .await
    }
}

#[async_trait]
impl LinkDriver for NoopLinkDriver {
    async fn ensure_bridge(&self, _bridge: &str) -> CorralResult<()> {
        Ok(())
    }

    async fn create_tap(&self, _tap: &str, _bridge: &str) -> CorralResult<()> {
        self.taps_created.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn destroy_tap(&self, _tap: &str) -> CorralResult<()> {
        self.taps_destroyed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn add_forward(&self, _forward: &PortForward, _guest_ip: Ipv4Addr) -> CorralResult<()> {
        self.forwards_added.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn remove_forward(
        &self,
        _forward: &PortForward,
        _guest_ip: Ipv4Addr,
    ) -> CorralResult<()> {
        self.forwards_removed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
