//! The top-level lifecycle coordinator.

use std::{collections::HashMap, sync::Arc, time::Duration};

use futures::future::join_all;
use tokio::{task::JoinHandle, time::Instant};
use tracing::{error, info, warn};

use crate::{
    config::{FleetConfig, VmSpec, MAX_NUM_VCPUS, MIN_MEMORY_MIB, MIN_NUM_VCPUS},
    hypervisor::{Hypervisor, Machine},
    network::{LinkDriver, NetworkAllocator, Protocol},
    quota::{Autoscaler, QuotaEngine, ResourceMonitor},
    snapshot::{Snapshot, SnapshotManager, SnapshotVmState},
    store::{self, RecordStore, VMS_BUCKET},
    CorralError, CorralResult, ErrorCode,
};

use super::{RuntimeHandle, VirtualMachine, VmRegistry, VmStatus};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Coordinates every lifecycle transition across the allocators, the
/// hypervisor, and the record store.
///
/// Allocation always happens in the order quota, network, hypervisor;
/// release happens in reverse, and only after the step it undoes has been
/// confirmed. Any failure partway through rolls back every completed step
/// before the error returns.
pub struct VmManager {
    config: FleetConfig,
    store: Arc<dyn RecordStore>,
    hypervisor: Arc<dyn Hypervisor>,
    network: Arc<NetworkAllocator>,
    quota: Arc<QuotaEngine>,
    snapshots: Arc<SnapshotManager>,
    monitor: Arc<ResourceMonitor>,
    registry: VmRegistry,
    runtimes: std::sync::Mutex<HashMap<String, RuntimeHandle>>,
    autoscaler_task: Option<JoinHandle<()>>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl VmManager {
    /// Creates a manager over the given collaborators.
    ///
    /// When autoscaling is enabled the background monitor loop starts
    /// immediately; it is aborted when the manager is dropped.
    pub fn new(
        config: FleetConfig,
        store: Arc<dyn RecordStore>,
        hypervisor: Arc<dyn Hypervisor>,
        link_driver: Arc<dyn LinkDriver>,
    ) -> CorralResult<Self> {
        config.validate()?;

        let network = Arc::new(NetworkAllocator::new(
            config.get_network().clone(),
            link_driver,
        ));
        let quota = Arc::new(QuotaEngine::new(config.get_capacity().clone()));
        let snapshots = Arc::new(SnapshotManager::new(
            Arc::clone(&store),
            config.get_snapshots().clone(),
        ));
        let monitor = Arc::new(ResourceMonitor::new(config.get_monitor().clone()));

        let autoscaler_task = if *config.get_monitor().get_autoscale() {
            let autoscaler = Arc::new(Autoscaler::new(
                Arc::clone(&quota),
                Arc::clone(&monitor),
                config.get_monitor().clone(),
            ));
            Some(autoscaler.spawn())
        } else {
            None
        };

        Ok(Self {
            config,
            store,
            hypervisor,
            network,
            quota,
            snapshots,
            monitor,
            registry: VmRegistry::new(),
            runtimes: std::sync::Mutex::new(HashMap::new()),
            autoscaler_task,
        })
    }

    /// Validates a machine description and persists a `Created` record.
    ///
    /// Nothing is allocated yet; that happens on the first `start`.
    pub async fn create(&self, spec: VmSpec) -> CorralResult<VirtualMachine> {
        spec.validate(&self.config)?;

        let lock = self.registry.lock_for(spec.get_name());
        let _guard = lock.lock().await;

        if self.load_by_name(spec.get_name()).await?.is_some() {
            return Err(CorralError::Conflict(format!(
                "vm '{}' already exists",
                spec.get_name()
            )));
        }

        let vm = VirtualMachine::from_spec(&spec);
        self.persist(&vm).await?;

        info!(vm = %vm.name, id = %vm.id, owner = %vm.owner_id, "created vm");
        Ok(vm)
    }

    /// Starts a VM: quota admission, then network, then hypervisor boot.
    ///
    /// Starting a VM that is already running is a no-op success. Any failure
    /// rolls back every completed allocation before returning; a failed boot
    /// additionally parks the VM in `Error`.
    pub async fn start(&self, name: &str) -> CorralResult<VirtualMachine> {
        let lock = self.registry.lock_for(name);
        let _guard = lock.lock().await;

        let mut vm = self.must_load(name).await?;
        match vm.status {
            VmStatus::Running => return Ok(vm),
            VmStatus::Created | VmStatus::Stopped => {}
            status => {
                return Err(CorralError::InvalidState {
                    name: name.to_string(),
                    status: status.to_string(),
                    operation: "start",
                })
            }
        }

        // Admission first: a rejection here has no side effects to undo.
        self.quota.allocate(
            &vm.id,
            &vm.owner_id,
            vm.vcpus as u32,
            vm.memory_mib as u64,
            vm.priority,
        )?;

        // A restart re-realizes the allocation retained at stop; only a
        // first start draws a fresh address that a rollback must return.
        let fresh_network = self.network.allocation(&vm.id).is_none();
        let allocation = match self
            .network
            .allocate(&vm.id, vm.requested_ip, vm.bridge_override.as_deref())
            .await
        {
            Ok(allocation) => allocation,
            Err(e) => {
                self.quota.deallocate(&vm.id);
                return Err(e);
            }
        };

        vm.network = Some(allocation);
        vm.resources = self.quota.allocation(&vm.id);
        if let Err(e) = vm.transition(VmStatus::Starting, "start") {
            self.abort_start(&vm.id, fresh_network).await;
            return Err(e);
        }
        if let Err(e) = self.persist(&vm).await {
            self.abort_start(&vm.id, fresh_network).await;
            return Err(e);
        }

        let boot_started = Instant::now();
        match self.boot_machine(&vm).await {
            Ok(machine) => {
                vm.boot_duration_ms = Some(boot_started.elapsed().as_millis() as u64);
                if let Err(e) = vm.transition(VmStatus::Running, "start") {
                    self.abort_start(&vm.id, fresh_network).await;
                    return Err(e);
                }
                if let Err(e) = self.persist(&vm).await {
                    self.abort_start(&vm.id, fresh_network).await;
                    return Err(e);
                }
                self.put_runtime(RuntimeHandle::new(&vm.id, machine));

                info!(
                    vm = %vm.name,
                    boot_ms = vm.boot_duration_ms,
                    ip = ?vm.network.as_ref().map(|n| *n.get_ip_address()),
                    "vm running"
                );
                Ok(vm)
            }
            Err(e) => {
                self.abort_start(&vm.id, fresh_network).await;
                if fresh_network {
                    vm.network = None;
                }
                vm.resources = None;
                let _ = vm.transition(VmStatus::Error, "start");
                if let Err(persist_err) = self.persist(&vm).await {
                    error!(vm = %name, error = %persist_err, "failed to persist error state");
                }

                Err(CorralError::BootFailed {
                    name: name.to_string(),
                    reason: e.to_string(),
                })
            }
        }
    }

    /// Stops a VM.
    ///
    /// Stopping a VM that is already stopped is a no-op success. Without
    /// `force`, an unacknowledged graceful shutdown leaves the VM in
    /// `Stopping` and returns a timeout so the caller can retry with
    /// `force = true`, which hard-terminates the process and always
    /// succeeds.
    ///
    /// On confirmed termination the quota allocation is released, while the
    /// network allocation is retained (deactivated) so the VM keeps its
    /// address across a stop/start cycle; it returns to the pool at destroy.
    pub async fn stop(
        &self,
        name: &str,
        force: bool,
        timeout: Option<Duration>,
    ) -> CorralResult<VirtualMachine> {
        let lock = self.registry.lock_for(name);
        let _guard = lock.lock().await;

        let mut vm = self.must_load(name).await?;
        match vm.status {
            VmStatus::Stopped => return Ok(vm),
            VmStatus::Running | VmStatus::Paused | VmStatus::Stopping => {}
            status => {
                return Err(CorralError::InvalidState {
                    name: name.to_string(),
                    status: status.to_string(),
                    operation: "stop",
                })
            }
        }

        if vm.status != VmStatus::Stopping {
            vm.transition(VmStatus::Stopping, "stop")?;
            self.persist(&vm).await?;
        }

        let grace = timeout.unwrap_or_else(|| self.config.get_hypervisor().shutdown_grace());
        if let Some(mut handle) = self.take_runtime(&vm.id) {
            if force {
                handle.machine_mut().kill().await?;
            } else {
                match handle.machine_mut().shutdown(grace).await {
                    Ok(true) => {}
                    Ok(false) => {
                        self.put_runtime(handle);
                        return Err(CorralError::Timeout {
                            operation: "stop",
                            timeout: grace,
                        });
                    }
                    Err(e) => {
                        warn!(vm = %name, error = %e, "graceful shutdown failed, killing process");
                        handle.machine_mut().kill().await?;
                    }
                }
            }
        }

        self.network.deactivate(&vm.id).await?;
        self.quota.deallocate(&vm.id);

        vm.transition(VmStatus::Stopped, "stop")?;
        vm.resources = None;
        self.persist(&vm).await?;

        info!(vm = %name, "vm stopped");
        Ok(vm)
    }

    /// Pauses a running VM's guest vCPUs. No allocations change.
    pub async fn pause(&self, name: &str) -> CorralResult<VirtualMachine> {
        let lock = self.registry.lock_for(name);
        let _guard = lock.lock().await;

        let mut vm = self.must_load(name).await?;
        if vm.status != VmStatus::Running {
            return Err(CorralError::InvalidState {
                name: name.to_string(),
                status: vm.status.to_string(),
                operation: "pause",
            });
        }

        let Some(mut handle) = self.take_runtime(&vm.id) else {
            let e = CorralError::FatalInfra(format!("vm '{}' has no live runtime", name));
            self.fault(&mut vm, None, "pause").await;
            return Err(e);
        };

        match handle.machine_mut().pause().await {
            Ok(()) => {
                self.put_runtime(handle);
                vm.transition(VmStatus::Paused, "pause")?;
                self.persist(&vm).await?;
                Ok(vm)
            }
            Err(e) => {
                self.fault(&mut vm, Some(handle), "pause").await;
                Err(e)
            }
        }
    }

    /// Resumes a paused VM. No allocations change.
    pub async fn resume(&self, name: &str) -> CorralResult<VirtualMachine> {
        let lock = self.registry.lock_for(name);
        let _guard = lock.lock().await;

        let mut vm = self.must_load(name).await?;
        if vm.status != VmStatus::Paused {
            return Err(CorralError::InvalidState {
                name: name.to_string(),
                status: vm.status.to_string(),
                operation: "resume",
            });
        }

        let Some(mut handle) = self.take_runtime(&vm.id) else {
            let e = CorralError::FatalInfra(format!("vm '{}' has no live runtime", name));
            self.fault(&mut vm, None, "resume").await;
            return Err(e);
        };

        match handle.machine_mut().resume().await {
            Ok(()) => {
                self.put_runtime(handle);
                vm.transition(VmStatus::Running, "resume")?;
                self.persist(&vm).await?;
                Ok(vm)
            }
            Err(e) => {
                self.fault(&mut vm, Some(handle), "resume").await;
                Err(e)
            }
        }
    }

    /// Changes a VM's size, re-validated against quota as a delta.
    ///
    /// Memory changes apply live to a running VM. vCPU changes require the
    /// VM to be stopped: a hot vcpu change is not guaranteed by the
    /// underlying hypervisor and is never assumed.
    pub async fn resize(
        &self,
        name: &str,
        vcpus: Option<u8>,
        memory_mib: Option<u32>,
    ) -> CorralResult<VirtualMachine> {
        let lock = self.registry.lock_for(name);
        let _guard = lock.lock().await;

        let mut vm = self.must_load(name).await?;
        let target_vcpus = vcpus.unwrap_or(vm.vcpus);
        let target_memory = memory_mib.unwrap_or(vm.memory_mib);
        if target_vcpus == vm.vcpus && target_memory == vm.memory_mib {
            return Ok(vm);
        }

        let mut errors = Vec::new();
        if target_vcpus < MIN_NUM_VCPUS || target_vcpus > MAX_NUM_VCPUS {
            errors.push(format!(
                "vcpus must be between {} and {}, got {}",
                MIN_NUM_VCPUS, MAX_NUM_VCPUS, target_vcpus
            ));
        }
        if target_memory < MIN_MEMORY_MIB.max(vm.os_kind.min_memory_mib()) {
            errors.push(format!(
                "memory_mib must be at least {} for a {} guest, got {}",
                MIN_MEMORY_MIB.max(vm.os_kind.min_memory_mib()),
                vm.os_kind,
                target_memory
            ));
        }
        if target_vcpus < vm.os_kind.min_vcpus() {
            errors.push(format!(
                "{} guests require at least {} vcpus, got {}",
                vm.os_kind,
                vm.os_kind.min_vcpus(),
                target_vcpus
            ));
        }
        if !errors.is_empty() {
            return Err(CorralError::SpecValidation(errors));
        }

        if target_vcpus != vm.vcpus
            && !matches!(vm.status, VmStatus::Created | VmStatus::Stopped)
        {
            return Err(CorralError::InvalidState {
                name: name.to_string(),
                status: vm.status.to_string(),
                operation: "resize vcpus",
            });
        }

        match vm.status {
            VmStatus::Running | VmStatus::Paused => {
                self.quota
                    .resize(&vm.id, target_vcpus as u32, target_memory as u64)?;

                if target_memory != vm.memory_mib {
                    let Some(mut handle) = self.take_runtime(&vm.id) else {
                        let e =
                            CorralError::FatalInfra(format!("vm '{}' has no live runtime", name));
                        self.fault(&mut vm, None, "resize").await;
                        return Err(e);
                    };
                    if let Err(e) = handle.machine_mut().resize_memory(target_memory).await {
                        self.fault(&mut vm, Some(handle), "resize").await;
                        return Err(e);
                    }
                    self.put_runtime(handle);
                }

                vm.resources = self.quota.allocation(&vm.id);
            }
            VmStatus::Created | VmStatus::Stopped => {
                // No live allocation to resize; the owner's tier still has
                // to be able to accommodate the new size at the next start.
                self.quota.precheck_owner(
                    &vm.owner_id,
                    target_vcpus as u32,
                    target_memory as u64,
                )?;
            }
            status => {
                return Err(CorralError::InvalidState {
                    name: name.to_string(),
                    status: status.to_string(),
                    operation: "resize",
                })
            }
        }

        vm.vcpus = target_vcpus;
        vm.memory_mib = target_memory;
        self.persist(&vm).await?;

        info!(vm = %name, vcpus = target_vcpus, memory_mib = target_memory, "vm resized");
        Ok(vm)
    }

    /// Destroys a VM, releasing its allocations and removing its record.
    ///
    /// Only valid from `Created`, `Stopped`, or `Error`. Snapshots are
    /// retained unless `cascade_snapshots` is set.
    pub async fn destroy(&self, name: &str, cascade_snapshots: bool) -> CorralResult<()> {
        let lock = self.registry.lock_for(name);
        let _guard = lock.lock().await;

        let mut vm = self.must_load(name).await?;
        vm.transition(VmStatus::Deleted, "destroy")?;

        // Nothing should still be running, but an Error-state VM may have
        // left a handle behind; it dies with its record.
        if let Some(mut handle) = self.take_runtime(&vm.id) {
            let _ = handle.machine_mut().kill().await;
        }

        self.network.release(&vm.id).await?;
        self.quota.deallocate(&vm.id);

        if cascade_snapshots {
            self.snapshots.delete_all_for(&vm.id).await?;
        }

        self.store.delete(VMS_BUCKET, &vm.id).await?;
        self.registry.reap(name);

        info!(vm = %name, cascade_snapshots, "vm destroyed");
        Ok(())
    }

    /// Captures a snapshot of a running VM.
    pub async fn snapshot(
        &self,
        name: &str,
        snapshot_name: &str,
        parent: Option<&str>,
    ) -> CorralResult<Snapshot> {
        let lock = self.registry.lock_for(name);
        let _guard = lock.lock().await;

        let mut vm = self.must_load(name).await?;
        if vm.status != VmStatus::Running {
            return Err(CorralError::InvalidState {
                name: name.to_string(),
                status: vm.status.to_string(),
                operation: "snapshot",
            });
        }

        let Some(mut handle) = self.take_runtime(&vm.id) else {
            let e = CorralError::FatalInfra(format!("vm '{}' has no live runtime", name));
            self.fault(&mut vm, None, "snapshot").await;
            return Err(e);
        };

        let vm_state = SnapshotVmState {
            vcpus: vm.vcpus,
            memory_mib: vm.memory_mib,
            os_kind: vm.os_kind,
        };

        match self
            .snapshots
            .create(&vm.id, vm_state, handle.machine_mut(), snapshot_name, parent)
            .await
        {
            Ok(snapshot) => {
                self.put_runtime(handle);
                Ok(snapshot)
            }
            Err(e) if matches!(e.code(), ErrorCode::FatalInfra | ErrorCode::BootFailure) => {
                self.fault(&mut vm, Some(handle), "snapshot").await;
                Err(e)
            }
            Err(e) => {
                // Conflicts and lookup failures leave the guest untouched.
                self.put_runtime(handle);
                Err(e)
            }
        }
    }

    /// Restores a stopped VM from a snapshot and leaves it running.
    ///
    /// The whole chain is integrity-checked before anything is allocated;
    /// a checksum mismatch blocks the restore with the VM still stopped.
    /// Post-restore size matches the snapshot's captured metadata unless
    /// `size_override` is given.
    pub async fn restore(
        &self,
        name: &str,
        snapshot_name: &str,
        size_override: Option<(u8, u32)>,
    ) -> CorralResult<VirtualMachine> {
        let lock = self.registry.lock_for(name);
        let _guard = lock.lock().await;

        let mut vm = self.must_load(name).await?;
        if vm.status != VmStatus::Stopped {
            return Err(CorralError::InvalidState {
                name: name.to_string(),
                status: vm.status.to_string(),
                operation: "restore",
            });
        }

        let snapshot = self.snapshots.find(&vm.id, snapshot_name).await?;
        let chain = self.snapshots.restore_chain(&snapshot).await?;
        for link in &chain {
            self.snapshots.verify(link).await?;
        }

        let (target_vcpus, target_memory) = size_override.unwrap_or((
            *snapshot.get_vm_state().get_vcpus(),
            *snapshot.get_vm_state().get_memory_mib(),
        ));

        self.quota.allocate(
            &vm.id,
            &vm.owner_id,
            target_vcpus as u32,
            target_memory as u64,
            vm.priority,
        )?;

        let fresh_network = self.network.allocation(&vm.id).is_none();
        let allocation = match self
            .network
            .allocate(&vm.id, vm.requested_ip, vm.bridge_override.as_deref())
            .await
        {
            Ok(allocation) => allocation,
            Err(e) => {
                self.quota.deallocate(&vm.id);
                return Err(e);
            }
        };

        vm.network = Some(allocation);
        vm.resources = self.quota.allocation(&vm.id);
        if let Err(e) = vm.transition(VmStatus::Starting, "restore") {
            self.abort_start(&vm.id, fresh_network).await;
            return Err(e);
        }
        if let Err(e) = self.persist(&vm).await {
            self.abort_start(&vm.id, fresh_network).await;
            return Err(e);
        }

        let restore_started = Instant::now();
        match self
            .restore_machine(&vm, target_vcpus, target_memory, &chain)
            .await
        {
            Ok(machine) => {
                vm.vcpus = target_vcpus;
                vm.memory_mib = target_memory;
                vm.boot_duration_ms = Some(restore_started.elapsed().as_millis() as u64);
                if let Err(e) = vm.transition(VmStatus::Running, "restore") {
                    self.abort_start(&vm.id, fresh_network).await;
                    return Err(e);
                }
                if let Err(e) = self.persist(&vm).await {
                    self.abort_start(&vm.id, fresh_network).await;
                    return Err(e);
                }
                self.put_runtime(RuntimeHandle::new(&vm.id, machine));

                info!(vm = %name, snapshot = %snapshot_name, "vm restored");
                Ok(vm)
            }
            Err(e) => {
                self.abort_start(&vm.id, fresh_network).await;
                if fresh_network {
                    vm.network = None;
                }
                vm.resources = None;
                let _ = vm.transition(VmStatus::Error, "restore");
                if let Err(persist_err) = self.persist(&vm).await {
                    error!(vm = %name, error = %persist_err, "failed to persist error state");
                }

                Err(CorralError::BootFailed {
                    name: name.to_string(),
                    reason: e.to_string(),
                })
            }
        }
    }

    /// Deletes one snapshot of a VM.
    pub async fn delete_snapshot(&self, name: &str, snapshot_name: &str) -> CorralResult<()> {
        let lock = self.registry.lock_for(name);
        let _guard = lock.lock().await;

        let vm = self.must_load(name).await?;
        self.snapshots.delete(&vm.id, snapshot_name).await
    }

    /// Re-verifies a snapshot's artifact against its recorded checksum.
    pub async fn verify_snapshot(&self, name: &str, snapshot_name: &str) -> CorralResult<Snapshot> {
        let vm = self.must_load(name).await?;
        let snapshot = self.snapshots.find(&vm.id, snapshot_name).await?;
        self.snapshots.verify(&snapshot).await
    }

    /// Lists a VM's snapshots, newest first.
    pub async fn list_snapshots(&self, name: &str) -> CorralResult<Vec<Snapshot>> {
        let vm = self.must_load(name).await?;
        self.snapshots.list(&vm.id).await
    }

    /// Registers a port forward for a VM.
    pub async fn add_port_forward(
        &self,
        name: &str,
        host_port: u16,
        guest_port: u16,
        protocol: Protocol,
    ) -> CorralResult<VirtualMachine> {
        let lock = self.registry.lock_for(name);
        let _guard = lock.lock().await;

        let mut vm = self.must_load(name).await?;
        self.network
            .add_port_forward(&vm.id, host_port, guest_port, protocol)
            .await?;
        vm.network = self.network.allocation(&vm.id);
        self.persist(&vm).await?;
        Ok(vm)
    }

    /// Removes a port forward from a VM.
    pub async fn remove_port_forward(
        &self,
        name: &str,
        host_port: u16,
    ) -> CorralResult<VirtualMachine> {
        let lock = self.registry.lock_for(name);
        let _guard = lock.lock().await;

        let mut vm = self.must_load(name).await?;
        self.network.remove_port_forward(&vm.id, host_port).await?;
        vm.network = self.network.allocation(&vm.id);
        self.persist(&vm).await?;
        Ok(vm)
    }

    /// Fetches one VM record by name.
    pub async fn get(&self, name: &str) -> CorralResult<VirtualMachine> {
        self.must_load(name).await
    }

    /// Lists every VM record, sorted by name.
    pub async fn list(&self) -> CorralResult<Vec<VirtualMachine>> {
        let mut vms: Vec<VirtualMachine> =
            store::list_records(self.store.as_ref(), VMS_BUCKET).await?;
        vms.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(vms)
    }

    /// Stops every VM that is currently up, in parallel.
    ///
    /// Individual failures are logged, not propagated, so one stuck VM
    /// cannot stop the sweep.
    pub async fn stop_all(&self, force: bool) -> CorralResult<()> {
        let names: Vec<String> = self
            .list()
            .await?
            .into_iter()
            .filter(|vm| {
                matches!(
                    vm.status,
                    VmStatus::Running | VmStatus::Paused | VmStatus::Stopping
                )
            })
            .map(|vm| vm.name)
            .collect();

        let results = join_all(names.iter().map(|name| self.stop(name, force, None))).await;
        for (name, result) in names.iter().zip(results) {
            if let Err(e) = result {
                error!(vm = %name, error = %e, "failed to stop vm");
            }
        }

        Ok(())
    }

    /// The network allocator, for pool inspection.
    pub fn network(&self) -> Arc<NetworkAllocator> {
        Arc::clone(&self.network)
    }

    /// The quota engine, for usage inspection.
    pub fn quota(&self) -> Arc<QuotaEngine> {
        Arc::clone(&self.quota)
    }

    /// The snapshot manager.
    pub fn snapshots(&self) -> Arc<SnapshotManager> {
        Arc::clone(&self.snapshots)
    }

    /// The host utilization monitor.
    pub fn monitor(&self) -> Arc<ResourceMonitor> {
        Arc::clone(&self.monitor)
    }

    /// How many VMs currently hold a live runtime.
    pub fn runtime_count(&self) -> usize {
        self.runtimes().len()
    }

    /// Launches and boots the hypervisor for a VM at its current size.
    async fn boot_machine(&self, vm: &VirtualMachine) -> CorralResult<Box<dyn Machine>> {
        let mut machine = self.hypervisor.launch(vm.machine_config()).await?;
        if let Err(e) = machine.boot().await {
            let _ = machine.kill().await;
            return Err(e);
        }
        Ok(machine)
    }

    /// Launches a machine, applies a verified restore chain, and resumes it.
    async fn restore_machine(
        &self,
        vm: &VirtualMachine,
        vcpus: u8,
        memory_mib: u32,
        chain: &[Snapshot],
    ) -> CorralResult<Box<dyn Machine>> {
        let mut machine = self
            .hypervisor
            .launch(vm.machine_config_sized(vcpus, memory_mib))
            .await?;
        if let Err(e) = self.snapshots.apply_chain(machine.as_mut(), chain).await {
            let _ = machine.kill().await;
            return Err(e);
        }
        if let Err(e) = machine.resume().await {
            let _ = machine.kill().await;
            return Err(e);
        }
        Ok(machine)
    }

    /// Reverses the quota and network steps of an aborted start, in reverse
    /// allocation order. A fresh address returns to the pool; a retained one
    /// is only deactivated.
    async fn abort_start(&self, vm_id: &str, fresh_network: bool) {
        let result = if fresh_network {
            self.network.release(vm_id).await
        } else {
            self.network.deactivate(vm_id).await
        };
        if let Err(e) = result {
            error!(vm_id = %vm_id, error = %e, "network rollback failed");
        }
        self.quota.deallocate(vm_id);
    }

    /// Parks a VM in `Error` after an unrecoverable fault, tearing down its
    /// runtime and releasing what a stopped VM would not hold.
    async fn fault(
        &self,
        vm: &mut VirtualMachine,
        handle: Option<RuntimeHandle>,
        operation: &'static str,
    ) {
        warn!(vm = %vm.name, operation, "unrecoverable fault, parking vm in error state");

        if let Some(mut handle) = handle {
            let _ = handle.machine_mut().kill().await;
        }
        if let Err(e) = self.network.deactivate(&vm.id).await {
            error!(vm = %vm.name, error = %e, "network teardown failed during fault handling");
        }
        self.quota.deallocate(&vm.id);

        let _ = vm.transition(VmStatus::Error, operation);
        vm.resources = None;
        if let Err(e) = self.persist(vm).await {
            error!(vm = %vm.name, error = %e, "failed to persist error state");
        }
    }

    async fn load_by_name(&self, name: &str) -> CorralResult<Option<VirtualMachine>> {
        let vms: Vec<VirtualMachine> =
            store::list_records(self.store.as_ref(), VMS_BUCKET).await?;
        Ok(vms.into_iter().find(|vm| vm.name == name))
    }

    async fn must_load(&self, name: &str) -> CorralResult<VirtualMachine> {
        self.load_by_name(name)
            .await?
            .ok_or_else(|| CorralError::VmNotFound(name.to_string()))
    }

    async fn persist(&self, vm: &VirtualMachine) -> CorralResult<()> {
        store::put_record(self.store.as_ref(), VMS_BUCKET, &vm.id, vm).await
    }

    fn take_runtime(&self, vm_id: &str) -> Option<RuntimeHandle> {
        self.runtimes().remove(vm_id)
    }

    fn put_runtime(&self, handle: RuntimeHandle) {
        self.runtimes().insert(handle.vm_id().to_string(), handle);
    }

    fn runtimes(&self) -> std::sync::MutexGuard<'_, HashMap<String, RuntimeHandle>> {
        self.runtimes.lock().expect("runtime map lock poisoned")
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl Drop for VmManager {
    fn drop(&mut self) {
        if let Some(task) = &self.autoscaler_task {
            task.abort();
        }
    }
}
