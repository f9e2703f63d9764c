//! The address pool and per-VM interface allocator.

use std::{
    collections::{BTreeSet, HashMap},
    fmt,
    net::Ipv4Addr,
    sync::{Arc, Mutex, MutexGuard},
};

use getset::Getters;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::info;

use crate::{config::NetworkConfig, CorralError, CorralResult};

use super::LinkDriver;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The transport protocol of a port forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// TCP.
    Tcp,

    /// UDP.
    Udp,
}

/// One host-to-guest port mapping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Getters)]
#[getset(get = "pub with_prefix")]
pub struct PortForward {
    /// The host port traffic arrives on.
    pub(crate) host_port: u16,

    /// The guest port traffic is delivered to.
    pub(crate) guest_port: u16,

    /// The transport protocol.
    pub(crate) protocol: Protocol,
}

/// The network resources held by one VM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Getters)]
#[getset(get = "pub with_prefix")]
pub struct NetworkAllocation {
    /// The id of the owning VM.
    pub(crate) vm_id: String,

    /// The address drawn from the pool.
    pub(crate) ip_address: Ipv4Addr,

    /// The MAC address, derived deterministically from the VM id.
    ///
    /// Stable across restarts: some guest operating systems bind licensing
    /// and identity to it.
    pub(crate) mac_address: String,

    /// The per-VM TAP device name.
    pub(crate) interface_name: String,

    /// The bridge the TAP device attaches to.
    pub(crate) bridge_name: String,

    /// The port forwards registered for this VM.
    pub(crate) port_forwards: Vec<PortForward>,
}

/// Owns the address pool, the bridge, and per-VM TAP interfaces.
pub struct NetworkAllocator {
    config: NetworkConfig,
    driver: Arc<dyn LinkDriver>,
    pool: Mutex<PoolState>,
}

/// Bookkeeping behind the pool lock.
struct PoolState {
    free: BTreeSet<Ipv4Addr>,
    allocated: HashMap<String, NetworkAllocation>,
    host_ports: HashMap<u16, String>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl NetworkAllocator {
    /// Creates an allocator over the configured subnet.
    ///
    /// The network address, the gateway (first usable address), and the
    /// broadcast address never enter the pool.
    pub fn new(config: NetworkConfig, driver: Arc<dyn LinkDriver>) -> Self {
        let subnet = *config.get_subnet();
        let network = subnet.network();
        let broadcast = subnet.broadcast();
        let gateway = Ipv4Addr::from(u32::from(network) + 1);

        let free: BTreeSet<Ipv4Addr> = subnet
            .iter()
            .filter(|ip| *ip != network && *ip != broadcast && *ip != gateway)
            .collect();

        Self {
            config,
            driver,
            pool: Mutex::new(PoolState {
                free,
                allocated: HashMap::new(),
                host_ports: HashMap::new(),
            }),
        }
    }

    /// Allocates network resources for a VM and realizes them on the host.
    ///
    /// If the VM already holds an allocation (a restart after `deactivate`),
    /// the same address and MAC are re-realized. Otherwise the lowest free
    /// address is taken, or `requested_ip` if given and free.
    pub async fn allocate(
        &self,
        vm_id: &str,
        requested_ip: Option<Ipv4Addr>,
        bridge_override: Option<&str>,
    ) -> CorralResult<NetworkAllocation> {
        if let Some(existing) = self.allocation(vm_id) {
            self.realize(&existing).await?;
            return Ok(existing);
        }

        let allocation = {
            let mut pool = self.pool();
            let ip_address = match requested_ip {
                Some(ip) => {
                    if !pool.free.remove(&ip) {
                        return Err(CorralError::Conflict(format!(
                            "address {} is not available in subnet {}",
                            ip,
                            self.config.get_subnet()
                        )));
                    }
                    ip
                }
                None => {
                    pool.free
                        .pop_first()
                        .ok_or_else(|| CorralError::AddressPoolExhausted {
                            subnet: self.config.get_subnet().to_string(),
                        })?
                }
            };

            let allocation = NetworkAllocation {
                vm_id: vm_id.to_string(),
                ip_address,
                mac_address: derive_mac(vm_id),
                interface_name: interface_name(vm_id),
                bridge_name: bridge_override
                    .unwrap_or(self.config.get_bridge())
                    .to_string(),
                port_forwards: Vec::new(),
            };
            pool.allocated.insert(vm_id.to_string(), allocation.clone());
            allocation
        };

        if let Err(e) = self.realize(&allocation).await {
            // Undo the bookkeeping so the address is not held by a dead record.
            let mut pool = self.pool();
            pool.allocated.remove(vm_id);
            pool.free.insert(allocation.ip_address);
            return Err(e);
        }

        info!(
            vm_id = %vm_id,
            ip = %allocation.ip_address,
            mac = %allocation.mac_address,
            "allocated network resources"
        );
        Ok(allocation)
    }

    /// Tears down the VM's interface and NAT rules, keeping the allocation.
    ///
    /// The VM retains its address and MAC for a later restart; nothing
    /// returns to the pool. A VM without an allocation is a no-op.
    pub async fn deactivate(&self, vm_id: &str) -> CorralResult<()> {
        let Some(allocation) = self.allocation(vm_id) else {
            return Ok(());
        };

        for forward in &allocation.port_forwards {
            self.driver
                .remove_forward(forward, allocation.ip_address)
                .await?;
        }
        self.driver.destroy_tap(&allocation.interface_name).await?;

        Ok(())
    }

    /// Releases everything a VM holds and returns its address to the pool.
    ///
    /// The address only becomes free once the full host teardown has
    /// completed; a teardown failure keeps the allocation in place so stale
    /// rules can never point at a reusable address. A VM without an
    /// allocation is a no-op.
    pub async fn release(&self, vm_id: &str) -> CorralResult<()> {
        let Some(allocation) = self.allocation(vm_id) else {
            return Ok(());
        };

        for forward in &allocation.port_forwards {
            self.driver
                .remove_forward(forward, allocation.ip_address)
                .await?;
        }
        self.driver.destroy_tap(&allocation.interface_name).await?;

        let mut pool = self.pool();
        for forward in &allocation.port_forwards {
            pool.host_ports.remove(&forward.host_port);
        }
        pool.allocated.remove(vm_id);
        pool.free.insert(allocation.ip_address);

        info!(vm_id = %vm_id, ip = %allocation.ip_address, "released network resources");
        Ok(())
    }

    /// Registers a port forward and installs its NAT rule.
    ///
    /// The host port must lie in the configured range and be unique across
    /// all current allocations, stopped VMs included.
    pub async fn add_port_forward(
        &self,
        vm_id: &str,
        host_port: u16,
        guest_port: u16,
        protocol: Protocol,
    ) -> CorralResult<()> {
        let (forward, guest_ip) = {
            let mut pool = self.pool();

            let start = *self.config.get_forward_port_start();
            let end = *self.config.get_forward_port_end();
            if host_port < start || host_port > end {
                return Err(CorralError::Validation(format!(
                    "host port {} is outside the configured range {}..={}",
                    host_port, start, end
                )));
            }

            if let Some(holder) = pool.host_ports.get(&host_port) {
                return Err(CorralError::Conflict(format!(
                    "host port {} is already forwarded to vm '{}'",
                    host_port, holder
                )));
            }

            let allocation = pool.allocated.get_mut(vm_id).ok_or_else(|| {
                CorralError::Validation(format!("vm '{}' holds no network allocation", vm_id))
            })?;

            let forward = PortForward {
                host_port,
                guest_port,
                protocol,
            };
            let guest_ip = allocation.ip_address;
            allocation.port_forwards.push(forward.clone());
            pool.host_ports.insert(host_port, vm_id.to_string());
            (forward, guest_ip)
        };

        if let Err(e) = self.driver.add_forward(&forward, guest_ip).await {
            let mut pool = self.pool();
            pool.host_ports.remove(&host_port);
            if let Some(allocation) = pool.allocated.get_mut(vm_id) {
                allocation.port_forwards.retain(|f| f.host_port != host_port);
            }
            return Err(e);
        }

        Ok(())
    }

    /// Unregisters a port forward and removes its NAT rule.
    pub async fn remove_port_forward(&self, vm_id: &str, host_port: u16) -> CorralResult<()> {
        let (forward, guest_ip) = {
            let mut pool = self.pool();
            let allocation = pool.allocated.get_mut(vm_id).ok_or_else(|| {
                CorralError::Validation(format!("vm '{}' holds no network allocation", vm_id))
            })?;

            let position = allocation
                .port_forwards
                .iter()
                .position(|f| f.host_port == host_port)
                .ok_or_else(|| {
                    CorralError::Validation(format!(
                        "vm '{}' has no forward on host port {}",
                        vm_id, host_port
                    ))
                })?;

            let forward = allocation.port_forwards.remove(position);
            let guest_ip = allocation.ip_address;
            pool.host_ports.remove(&host_port);
            (forward, guest_ip)
        };

        self.driver.remove_forward(&forward, guest_ip).await
    }

    /// The allocation currently held by a VM, if any.
    pub fn allocation(&self, vm_id: &str) -> Option<NetworkAllocation> {
        self.pool().allocated.get(vm_id).cloned()
    }

    /// How many addresses remain free in the pool.
    pub fn free_count(&self) -> usize {
        self.pool().free.len()
    }

    /// How many VMs currently hold allocations.
    pub fn allocated_count(&self) -> usize {
        self.pool().allocated.len()
    }

    /// Creates the shared bridge if needed.
    pub async fn ensure_bridge(&self) -> CorralResult<()> {
        self.driver.ensure_bridge(self.config.get_bridge()).await
    }

    fn pool(&self) -> MutexGuard<'_, PoolState> {
        self.pool.lock().expect("address pool lock poisoned")
    }

    /// Realizes an allocation on the host: bridge, TAP, and NAT rules.
    async fn realize(&self, allocation: &NetworkAllocation) -> CorralResult<()> {
        self.driver.ensure_bridge(&allocation.bridge_name).await?;
        self.driver
            .create_tap(&allocation.interface_name, &allocation.bridge_name)
            .await?;
        for forward in &allocation.port_forwards {
            self.driver
                .add_forward(forward, allocation.ip_address)
                .await?;
        }
        Ok(())
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Derives a stable, locally-administered MAC address from a VM id.
pub fn derive_mac(vm_id: &str) -> String {
    let digest = Sha256::digest(vm_id.as_bytes());
    format!("52:54:00:{:02x}:{:02x}:{:02x}", digest[0], digest[1], digest[2])
}

/// Derives the TAP device name for a VM id, within the kernel's 15-char limit.
pub fn interface_name(vm_id: &str) -> String {
    let stem: String = vm_id
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .take(8)
        .collect();
    format!("tap-{}", stem)
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Tcp => write!(f, "tcp"),
            Protocol::Udp => write!(f, "udp"),
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
