//! The admission and accounting engine.

use std::{
    collections::HashMap,
    sync::{Mutex, MutexGuard},
};

use getset::Getters;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{
    config::{CapacityConfig, Priority},
    CorralError, CorralResult, QuotaExceededError, QuotaScope,
};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The resources admitted for one VM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Getters)]
#[getset(get = "pub with_prefix")]
pub struct ResourceAllocation {
    /// The id of the owning VM.
    pub(crate) vm_id: String,

    /// The owner the usage is accounted to.
    pub(crate) owner_id: String,

    /// The admitted CPU cores.
    pub(crate) cpu_cores: u32,

    /// The admitted memory in MiB.
    pub(crate) memory_mib: u64,

    /// The admission-ordering priority. Recorded for schedulers; the engine
    /// itself never preempts.
    pub(crate) priority: Priority,
}

/// A point-in-time view of the engine's books.
#[derive(Debug, Clone, PartialEq, Eq, Getters)]
#[getset(get = "pub with_prefix")]
pub struct QuotaUsage {
    /// CPU cores currently admitted.
    pub(crate) used_cpus: u32,

    /// Memory in MiB currently admitted.
    pub(crate) used_memory_mib: u64,

    /// The effective CPU capacity admissions are checked against.
    pub(crate) effective_cpus: u32,

    /// The effective memory capacity admissions are checked against.
    pub(crate) effective_memory_mib: u64,

    /// The configured physical CPU ceiling.
    pub(crate) configured_cpus: u32,

    /// The configured physical memory ceiling.
    pub(crate) configured_memory_mib: u64,
}

/// Tracks system capacity and per-owner quota tiers.
#[derive(Debug)]
pub struct QuotaEngine {
    state: Mutex<EngineState>,
}

#[derive(Debug)]
struct EngineState {
    capacity: CapacityConfig,
    effective_cpus: u32,
    effective_memory_mib: u64,
    allocations: HashMap<String, ResourceAllocation>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl QuotaEngine {
    /// Creates an engine with the configured capacity as its effective
    /// capacity.
    pub fn new(capacity: CapacityConfig) -> Self {
        let effective_cpus = *capacity.get_total_cpus();
        let effective_memory_mib = *capacity.get_total_memory_mib();
        Self {
            state: Mutex::new(EngineState {
                capacity,
                effective_cpus,
                effective_memory_mib,
                allocations: HashMap::new(),
            }),
        }
    }

    /// Atomically admits a request against system headroom and the owner's
    /// tier, recording the allocation on success.
    ///
    /// Re-admitting a VM that already holds an allocation returns the
    /// existing record unchanged.
    pub fn allocate(
        &self,
        vm_id: &str,
        owner_id: &str,
        cpu_cores: u32,
        memory_mib: u64,
        priority: Priority,
    ) -> CorralResult<ResourceAllocation> {
        let mut state = self.state();

        if let Some(existing) = state.allocations.get(vm_id) {
            return Ok(existing.clone());
        }

        state.check_system(cpu_cores, memory_mib)?;
        state.check_owner(owner_id, cpu_cores, memory_mib)?;

        let allocation = ResourceAllocation {
            vm_id: vm_id.to_string(),
            owner_id: owner_id.to_string(),
            cpu_cores,
            memory_mib,
            priority,
        };
        state
            .allocations
            .insert(vm_id.to_string(), allocation.clone());

        info!(
            vm_id = %vm_id,
            owner_id = %owner_id,
            cpu_cores,
            memory_mib,
            "admitted resource allocation"
        );
        Ok(allocation)
    }

    /// Returns a VM's capacity to the system pool and its owner's tier.
    ///
    /// A VM without an allocation is a no-op.
    pub fn deallocate(&self, vm_id: &str) {
        if self.state().allocations.remove(vm_id).is_some() {
            info!(vm_id = %vm_id, "released resource allocation");
        }
    }

    /// Re-validates and applies a size change as a delta against both
    /// ceilings. A rejected resize leaves the allocation unchanged.
    pub fn resize(&self, vm_id: &str, new_cpu_cores: u32, new_memory_mib: u64) -> CorralResult<()> {
        let mut state = self.state();

        let current = state
            .allocations
            .get(vm_id)
            .cloned()
            .ok_or_else(|| CorralError::VmNotFound(vm_id.to_string()))?;

        let delta_cpus = new_cpu_cores.saturating_sub(current.cpu_cores);
        let delta_memory = new_memory_mib.saturating_sub(current.memory_mib);
        state.check_system(delta_cpus, delta_memory)?;
        state.check_owner(&current.owner_id, delta_cpus, delta_memory)?;

        let allocation = state
            .allocations
            .get_mut(vm_id)
            .expect("allocation vanished under the lock");
        allocation.cpu_cores = new_cpu_cores;
        allocation.memory_mib = new_memory_mib;

        Ok(())
    }

    /// Checks whether an owner's tier could accommodate an additional
    /// request, without reserving anything.
    ///
    /// Used to validate size changes of VMs that hold no live allocation.
    pub fn precheck_owner(
        &self,
        owner_id: &str,
        cpu_cores: u32,
        memory_mib: u64,
    ) -> CorralResult<()> {
        self.state().check_owner(owner_id, cpu_cores, memory_mib)
    }

    /// The allocation currently held by a VM, if any.
    pub fn allocation(&self, vm_id: &str) -> Option<ResourceAllocation> {
        self.state().allocations.get(vm_id).cloned()
    }

    /// A point-in-time view of the engine's books.
    pub fn usage(&self) -> QuotaUsage {
        let state = self.state();
        let (used_cpus, used_memory_mib) = state.used();
        QuotaUsage {
            used_cpus,
            used_memory_mib,
            effective_cpus: state.effective_cpus,
            effective_memory_mib: state.effective_memory_mib,
            configured_cpus: *state.capacity.get_total_cpus(),
            configured_memory_mib: *state.capacity.get_total_memory_mib(),
        }
    }

    /// Adjusts the effective capacity admissions are checked against.
    ///
    /// Clamped between what is currently admitted (the engine never
    /// preempts) and the configured physical ceiling. Returns the applied
    /// values.
    pub fn set_effective_capacity(&self, cpus: u32, memory_mib: u64) -> (u32, u64) {
        let mut state = self.state();
        let (used_cpus, used_memory_mib) = state.used();

        state.effective_cpus = cpus
            .max(used_cpus)
            .min(*state.capacity.get_total_cpus());
        state.effective_memory_mib = memory_mib
            .max(used_memory_mib)
            .min(*state.capacity.get_total_memory_mib());

        (state.effective_cpus, state.effective_memory_mib)
    }

    fn state(&self) -> MutexGuard<'_, EngineState> {
        self.state.lock().expect("quota engine lock poisoned")
    }
}

impl EngineState {
    fn used(&self) -> (u32, u64) {
        self.allocations.values().fold((0, 0), |(cpus, memory), a| {
            (cpus + a.cpu_cores, memory + a.memory_mib)
        })
    }

    fn owner_used(&self, owner_id: &str) -> (u32, u64) {
        self.allocations
            .values()
            .filter(|a| a.owner_id == owner_id)
            .fold((0, 0), |(cpus, memory), a| {
                (cpus + a.cpu_cores, memory + a.memory_mib)
            })
    }

    fn check_system(&self, cpu_cores: u32, memory_mib: u64) -> CorralResult<()> {
        let (used_cpus, used_memory_mib) = self.used();

        if used_cpus + cpu_cores > self.effective_cpus {
            return Err(CorralError::QuotaExceeded(QuotaExceededError {
                scope: QuotaScope::System,
                resource: "cpu_cores",
                requested: cpu_cores as u64,
                available: (self.effective_cpus - used_cpus) as u64,
            }));
        }

        if used_memory_mib + memory_mib > self.effective_memory_mib {
            return Err(CorralError::QuotaExceeded(QuotaExceededError {
                scope: QuotaScope::System,
                resource: "memory_mib",
                requested: memory_mib,
                available: self.effective_memory_mib - used_memory_mib,
            }));
        }

        Ok(())
    }

    fn check_owner(&self, owner_id: &str, cpu_cores: u32, memory_mib: u64) -> CorralResult<()> {
        let tier = self.capacity.tier_for(owner_id).ok_or_else(|| {
            CorralError::Validation(format!(
                "no quota tier resolvable for owner '{}'",
                owner_id
            ))
        })?;

        let (owner_cpus, owner_memory_mib) = self.owner_used(owner_id);

        if owner_cpus + cpu_cores > *tier.get_max_cpus() {
            return Err(CorralError::QuotaExceeded(QuotaExceededError {
                scope: QuotaScope::Owner(owner_id.to_string()),
                resource: "cpu_cores",
                requested: cpu_cores as u64,
                available: (tier.get_max_cpus() - owner_cpus) as u64,
            }));
        }

        if owner_memory_mib + memory_mib > *tier.get_max_memory_mib() {
            return Err(CorralError::QuotaExceeded(QuotaExceededError {
                scope: QuotaScope::Owner(owner_id.to_string()),
                resource: "memory_mib",
                requested: memory_mib,
                available: tier.get_max_memory_mib() - owner_memory_mib,
            }));
        }

        Ok(())
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QuotaTier;

    mod fixtures {
        use super::*;

        pub fn engine(total_cpus: u32, total_memory_mib: u64) -> QuotaEngine {
            let capacity = CapacityConfig::builder()
                .total_cpus(total_cpus)
                .total_memory_mib(total_memory_mib)
                .tiers(vec![QuotaTier::builder()
                    .name("default")
                    .max_cpus(4)
                    .max_memory_mib(4096)
                    .build()])
                .build();
            QuotaEngine::new(capacity)
        }
    }

    #[test]
    fn test_system_headroom_enforced() {
        let engine = fixtures::engine(4, 8192);

        engine
            .allocate("vm-a", "alice", 2, 1024, Priority::Normal)
            .unwrap();
        engine
            .allocate("vm-b", "bob", 2, 1024, Priority::Normal)
            .unwrap();

        let err = engine
            .allocate("vm-c", "carol", 1, 128, Priority::Normal)
            .unwrap_err();
        let CorralError::QuotaExceeded(details) = err else {
            panic!("expected quota rejection");
        };
        assert_eq!(details.scope, QuotaScope::System);
        assert_eq!(details.available, 0);
    }

    #[test]
    fn test_owner_tier_enforced() {
        let engine = fixtures::engine(64, 131072);

        engine
            .allocate("vm-a", "alice", 3, 1024, Priority::Normal)
            .unwrap();

        let err = engine
            .allocate("vm-b", "alice", 2, 1024, Priority::Normal)
            .unwrap_err();
        let CorralError::QuotaExceeded(details) = err else {
            panic!("expected quota rejection");
        };
        assert_eq!(details.scope, QuotaScope::Owner("alice".to_string()));

        // A different owner still has headroom.
        engine
            .allocate("vm-b", "bob", 2, 1024, Priority::Normal)
            .unwrap();
    }

    #[test]
    fn test_deallocate_returns_capacity() {
        let engine = fixtures::engine(4, 8192);

        engine
            .allocate("vm-a", "alice", 4, 4096, Priority::Normal)
            .unwrap();
        assert_eq!(*engine.usage().get_used_cpus(), 4);

        engine.deallocate("vm-a");
        assert_eq!(*engine.usage().get_used_cpus(), 0);

        // Idempotent.
        engine.deallocate("vm-a");

        engine
            .allocate("vm-b", "bob", 4, 4096, Priority::Normal)
            .unwrap();
    }

    #[test]
    fn test_allocate_is_idempotent_per_vm() {
        let engine = fixtures::engine(8, 8192);

        let first = engine
            .allocate("vm-a", "alice", 2, 1024, Priority::Normal)
            .unwrap();
        let second = engine
            .allocate("vm-a", "alice", 2, 1024, Priority::Normal)
            .unwrap();

        assert_eq!(first, second);
        assert_eq!(*engine.usage().get_used_cpus(), 2);
    }

    #[test]
    fn test_rejected_resize_leaves_allocation_unchanged() {
        let engine = fixtures::engine(64, 131072);

        engine
            .allocate("vm-a", "alice", 2, 1024, Priority::Normal)
            .unwrap();

        // The default tier caps at 4 cpus; 8 must be rejected.
        let err = engine.resize("vm-a", 8, 1024).unwrap_err();
        assert!(matches!(err, CorralError::QuotaExceeded(_)));

        let allocation = engine.allocation("vm-a").unwrap();
        assert_eq!(*allocation.get_cpu_cores(), 2);
        assert_eq!(*allocation.get_memory_mib(), 1024);

        engine.resize("vm-a", 4, 2048).unwrap();
        assert_eq!(*engine.allocation("vm-a").unwrap().get_cpu_cores(), 4);
    }

    #[test]
    fn test_effective_capacity_clamped() {
        let engine = fixtures::engine(8, 8192);

        engine
            .allocate("vm-a", "alice", 4, 4096, Priority::Normal)
            .unwrap();

        // Scale-down cannot cut below what is already admitted.
        let (cpus, memory) = engine.set_effective_capacity(2, 1024);
        assert_eq!((cpus, memory), (4, 4096));

        // Scale-up cannot exceed the configured ceiling.
        let (cpus, memory) = engine.set_effective_capacity(100, 1_000_000);
        assert_eq!((cpus, memory), (8, 8192));
    }
}
