//! The `Hypervisor`/`Machine` seam and its process-backed implementation.

use std::{path::Path, time::Duration};

use async_trait::async_trait;
use tokio::fs;
use tracing::{debug, warn};

use crate::{config::HypervisorConfig, CorralError, CorralResult};

use super::{ControlChannel, ControlRequest, MachineConfig, VmmProcess};

//--------------------------------------------------------------------------------------------------
// Traits
//--------------------------------------------------------------------------------------------------

/// Something that can launch machines.
///
/// The lifecycle manager only ever talks to this seam, so tests and dry runs
/// can substitute an in-process implementation.
#[async_trait]
pub trait Hypervisor: Send + Sync {
    /// Spawns a hypervisor instance for the given machine and installs its
    /// configuration. The machine is not booted yet.
    async fn launch(&self, config: MachineConfig) -> CorralResult<Box<dyn Machine>>;
}

/// One launched machine, driven over its private control channel.
#[async_trait]
pub trait Machine: Send {
    /// Boots the configured machine, bounded by the OS-family deadline.
    async fn boot(&mut self) -> CorralResult<()>;

    /// Pauses all guest vCPUs.
    async fn pause(&mut self) -> CorralResult<()>;

    /// Resumes all guest vCPUs.
    async fn resume(&mut self) -> CorralResult<()>;

    /// Requests a graceful shutdown and waits up to `grace` for the process
    /// to exit. Returns whether it did.
    async fn shutdown(&mut self, grace: Duration) -> CorralResult<bool>;

    /// Hard-terminates the hypervisor process. Always succeeds.
    async fn kill(&mut self) -> CorralResult<()>;

    /// Changes the machine's memory while it runs.
    async fn resize_memory(&mut self, memory_mib: u32) -> CorralResult<()>;

    /// Captures machine state into an artifact file.
    async fn snapshot(&mut self, path: &Path) -> CorralResult<()>;

    /// Loads machine state from an artifact file, leaving the guest paused.
    async fn restore(&mut self, path: &Path) -> CorralResult<()>;

    /// Whether the hypervisor process has exited, observed through the OS
    /// process handle.
    fn has_exited(&mut self) -> bool;
}

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The process-backed hypervisor: one OS process and one control socket per
/// launched machine.
#[derive(Debug)]
pub struct ProcessHypervisor {
    config: HypervisorConfig,
}

/// A machine hosted by a spawned hypervisor process.
pub struct ProcessMachine {
    process: VmmProcess,
    channel: ControlChannel,
    boot_timeout: Duration,
    call_timeout: Duration,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl ProcessHypervisor {
    /// Creates a hypervisor backed by the configured executable.
    pub fn new(config: HypervisorConfig) -> Self {
        Self { config }
    }
}

impl ProcessMachine {
    /// Issues one control request, first checking the process is still alive.
    async fn call(&mut self, request: &ControlRequest, deadline: Duration) -> CorralResult<()> {
        if self.process.has_exited() {
            return Err(CorralError::FatalInfra(format!(
                "hypervisor process for vm '{}' exited",
                self.process.vm_id()
            )));
        }
        self.channel.call(request, deadline).await
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

#[async_trait]
impl Hypervisor for ProcessHypervisor {
    async fn launch(&self, config: MachineConfig) -> CorralResult<Box<dyn Machine>> {
        let vm_id = config.get_vm_id().clone();
        let socket_path = self
            .config
            .get_runtime_dir()
            .join(format!("{}.sock", vm_id));

        // A stale socket from a previous run would shadow the new process.
        fs::create_dir_all(self.config.get_runtime_dir()).await?;
        match fs::remove_file(&socket_path).await {
            Ok(()) => warn!(vm_id = %vm_id, "removed stale control socket"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        let mut process = VmmProcess::spawn(
            self.config.get_binary(),
            &vm_id,
            &socket_path,
            self.config.get_log_dir(),
        )
        .await?;

        let channel = match ControlChannel::connect(&socket_path, self.config.startup_window())
            .await
        {
            Ok(channel) => channel,
            Err(e) => {
                // The spawn is undone before the error surfaces so a failed
                // launch never leaks a process.
                let crashed = process.has_exited();
                process.kill().await?;
                if crashed {
                    return Err(CorralError::FatalInfra(format!(
                        "hypervisor process for vm '{}' exited before its control socket appeared",
                        vm_id
                    )));
                }
                return Err(e);
            }
        };

        debug!(vm_id = %vm_id, pid = ?process.id(), "hypervisor process launched");

        let boot_timeout = config.get_os_kind().boot_timeout(&self.config);
        let mut machine = ProcessMachine {
            process,
            channel,
            boot_timeout,
            call_timeout: self.config.call_timeout(),
        };

        let install = ControlRequest::CreateConfig { config };
        if let Err(e) = machine.call(&install, machine.call_timeout).await {
            machine.kill().await?;
            return Err(e);
        }

        Ok(Box::new(machine))
    }
}

#[async_trait]
impl Machine for ProcessMachine {
    async fn boot(&mut self) -> CorralResult<()> {
        let deadline = self.boot_timeout;
        self.call(&ControlRequest::Boot, deadline).await
    }

    async fn pause(&mut self) -> CorralResult<()> {
        let deadline = self.call_timeout;
        self.call(&ControlRequest::Pause, deadline).await
    }

    async fn resume(&mut self) -> CorralResult<()> {
        let deadline = self.call_timeout;
        self.call(&ControlRequest::Resume, deadline).await
    }

    async fn shutdown(&mut self, grace: Duration) -> CorralResult<bool> {
        if self.process.has_exited() {
            return Ok(true);
        }

        // A failed shutdown request usually means the guest is already on its
        // way down; the process wait below is the authoritative signal.
        let deadline = self.call_timeout;
        if let Err(e) = self.call(&ControlRequest::Shutdown, deadline).await {
            warn!(vm_id = %self.process.vm_id(), error = %e, "graceful shutdown request failed");
        }

        self.process.wait_exit(grace).await
    }

    async fn kill(&mut self) -> CorralResult<()> {
        self.process.kill().await
    }

    async fn resize_memory(&mut self, memory_mib: u32) -> CorralResult<()> {
        let deadline = self.call_timeout;
        self.call(
            &ControlRequest::Resize {
                vcpus: None,
                memory_mib: Some(memory_mib),
            },
            deadline,
        )
        .await
    }

    async fn snapshot(&mut self, path: &Path) -> CorralResult<()> {
        let deadline = self.call_timeout;
        self.call(
            &ControlRequest::Snapshot {
                path: path.to_path_buf(),
            },
            deadline,
        )
        .await
    }

    async fn restore(&mut self, path: &Path) -> CorralResult<()> {
        let deadline = self.call_timeout;
        self.call(
            &ControlRequest::Restore {
                path: path.to_path_buf(),
            },
            deadline,
        )
        .await
    }

    fn has_exited(&mut self) -> bool {
        self.process.has_exited()
    }
}
