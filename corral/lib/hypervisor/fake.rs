//! An in-process hypervisor for tests and dry runs.

use std::{
    path::Path,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use tokio::fs;

use crate::{CorralError, CorralResult};

use super::{Hypervisor, Machine, MachineConfig};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// How a fake machine's boot should play out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FakeBootOutcome {
    /// Boot succeeds.
    Success,

    /// Boot exceeds its deadline.
    Timeout,

    /// The hypervisor process dies during boot.
    Crash,
}

/// A hypervisor that launches machines entirely in-process.
///
/// Snapshot artifacts are real files with deterministic contents, so
/// checksum round-trips behave like the real thing.
#[derive(Debug)]
pub struct FakeHypervisor {
    boot_outcome: Mutex<FakeBootOutcome>,
    boot_delay: Mutex<Duration>,
    refuse_shutdown: AtomicBool,
    launched: AtomicUsize,
    captures: Arc<AtomicUsize>,
}

/// A machine hosted by [`FakeHypervisor`].
pub struct FakeMachine {
    config: MachineConfig,
    boot_outcome: FakeBootOutcome,
    boot_delay: Duration,
    refuse_shutdown: bool,
    captures: Arc<AtomicUsize>,
    running: bool,
    paused: bool,
    exited: bool,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl FakeHypervisor {
    /// Creates a hypervisor whose machines boot successfully and instantly.
    pub fn new() -> Self {
        Self {
            boot_outcome: Mutex::new(FakeBootOutcome::Success),
            boot_delay: Mutex::new(Duration::ZERO),
            refuse_shutdown: AtomicBool::new(false),
            launched: AtomicUsize::new(0),
            captures: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Sets how subsequent boots play out.
    pub fn set_boot_outcome(&self, outcome: FakeBootOutcome) {
        *self.boot_outcome.lock().expect("fake hypervisor lock") = outcome;
    }

    /// Sets an artificial boot latency for subsequent boots.
    pub fn set_boot_delay(&self, delay: Duration) {
        *self.boot_delay.lock().expect("fake hypervisor lock") = delay;
    }

    /// Makes subsequent graceful shutdowns go unacknowledged.
    pub fn set_refuse_shutdown(&self, refuse: bool) {
        self.refuse_shutdown.store(refuse, Ordering::SeqCst);
    }

    /// How many machines have been launched so far.
    pub fn launch_count(&self) -> usize {
        self.launched.load(Ordering::SeqCst)
    }
}

impl FakeMachine {
    /// The configuration this machine was launched with.
    pub fn config(&self) -> &MachineConfig {
        &self.config
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl Default for FakeHypervisor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Hypervisor for FakeHypervisor {
    async fn launch(&self, config: MachineConfig) -> CorralResult<Box<dyn Machine>> {
        self.launched.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeMachine {
            config,
            boot_outcome: *self.boot_outcome.lock().expect("fake hypervisor lock"),
            boot_delay: *self.boot_delay.lock().expect("fake hypervisor lock"),
            refuse_shutdown: self.refuse_shutdown.load(Ordering::SeqCst),
            captures: Arc::clone(&self.captures),
            running: false,
            paused: false,
            exited: false,
        }))
    }
}

#[async_trait]
impl Machine for FakeMachine {
    async fn boot(&mut self) -> CorralResult<()> {
        if !self.boot_delay.is_zero() {
            tokio::time::sleep(self.boot_delay).await;
        }

        match self.boot_outcome {
            FakeBootOutcome::Success => {
                self.running = true;
                Ok(())
            }
            FakeBootOutcome::Timeout => Err(CorralError::Timeout {
                operation: "boot",
                timeout: self.boot_delay.max(Duration::from_millis(1)),
            }),
            FakeBootOutcome::Crash => {
                self.exited = true;
                Err(CorralError::FatalInfra(format!(
                    "hypervisor process for vm '{}' exited",
                    self.config.get_vm_id()
                )))
            }
        }
    }

    async fn pause(&mut self) -> CorralResult<()> {
        self.paused = true;
        Ok(())
    }

    async fn resume(&mut self) -> CorralResult<()> {
        self.paused = false;
        self.running = true;
        Ok(())
    }

    async fn shutdown(&mut self, _grace: Duration) -> CorralResult<bool> {
        if self.refuse_shutdown && !self.exited {
            return Ok(false);
        }
        self.running = false;
        self.exited = true;
        Ok(true)
    }

    async fn kill(&mut self) -> CorralResult<()> {
        self.running = false;
        self.exited = true;
        Ok(())
    }

    async fn resize_memory(&mut self, _memory_mib: u32) -> CorralResult<()> {
        Ok(())
    }

    async fn snapshot(&mut self, path: &Path) -> CorralResult<()> {
        let sequence = self.captures.fetch_add(1, Ordering::SeqCst);
        let artifact = format!(
            "fake-capture vm={} vcpus={} memory_mib={} sequence={}\n",
            self.config.get_vm_id(),
            self.config.get_vcpus(),
            self.config.get_memory_mib(),
            sequence
        );
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(path, artifact).await?;
        Ok(())
    }

    async fn restore(&mut self, path: &Path) -> CorralResult<()> {
        let contents = fs::read(path).await?;
        if !contents.starts_with(b"fake-capture ") {
            return Err(CorralError::FatalInfra(format!(
                "unrecognized artifact format in {}",
                path.display()
            )));
        }
        self.paused = true;
        Ok(())
    }

    fn has_exited(&mut self) -> bool {
        self.exited
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
