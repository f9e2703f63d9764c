//! `corral` turns a general-purpose hypervisor process into a managed fleet
//! of isolated, ephemeral microVMs: named, addressable, resource-bounded
//! units with lifecycle, networking, and point-in-time recovery guarantees.
//!
//! # Overview
//!
//! Every caller drives the fleet through the [`vm::VmManager`], which
//! coordinates four collaborators on each transition:
//!
//! - **Network** ([`network`]): IP/MAC/TAP assignment from a configured
//!   subnet pool, plus port forwards.
//! - **Quota** ([`quota`]): system- and owner-level capacity accounting,
//!   host utilization monitoring, and bounded-step autoscaling.
//! - **Hypervisor** ([`hypervisor`]): one process and one private control
//!   socket per VM, driven through structured request documents.
//! - **Snapshots** ([`snapshot`]): checksummed point-in-time capture,
//!   restore chains, and retention.
//!
//! Allocation always happens in the order quota, network, hypervisor;
//! release happens in reverse. A failure partway through any transition
//! rolls back every completed step before the error surfaces, so a
//! timed-out boot can never leak an address or a quota reservation.
//!
//! # Usage Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use corral::{
//!     config::{FleetConfig, OsKind, VmSpec},
//!     hypervisor::ProcessHypervisor,
//!     network::IpCommandDriver,
//!     store::FileStore,
//!     vm::VmManager,
//! };
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = FleetConfig::default();
//!     let manager = VmManager::new(
//!         config.clone(),
//!         Arc::new(FileStore::new("/var/lib/corral")),
//!         Arc::new(ProcessHypervisor::new(config.get_hypervisor().clone())),
//!         Arc::new(IpCommandDriver::new()),
//!     )?;
//!
//!     let spec = VmSpec::builder()
//!         .name("web-1")
//!         .os_kind(OsKind::Linux)
//!         .vcpus(2)
//!         .memory_mib(512)
//!         .owner_id("alice")
//!         .build();
//!
//!     manager.create(spec).await?;
//!     let vm = manager.start("web-1").await?;
//!     println!("{} is {}", vm.get_name(), vm.get_status());
//!
//!     Ok(())
//! }
//! ```
//!
//! # Concurrency
//!
//! Operations on the same VM are strictly serialized through a per-VM lock;
//! operations on different VMs proceed fully in parallel. The shared
//! address and capacity pools sit behind short-lived locks that are never
//! held across hypervisor I/O.

#![warn(missing_docs)]

mod error;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub mod config;
pub mod hypervisor;
pub mod network;
pub mod quota;
pub mod snapshot;
pub mod store;
pub mod vm;

pub use error::*;
