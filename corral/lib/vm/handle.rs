//! The per-VM runtime handle.

use chrono::{DateTime, Utc};

use crate::hypervisor::Machine;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The live runtime a non-terminal VM owns: the hypervisor process and its
/// control channel, bound together for exactly as long as the VM runs.
///
/// Constructed only after a successful boot, and destroyed first on any
/// stop or error path: the process, the channel, and the record can never
/// be torn down separately. Dropping the handle kills the underlying
/// process, so an abandoned handle cannot orphan a hypervisor.
pub struct RuntimeHandle {
    vm_id: String,
    machine: Box<dyn Machine>,
    booted_at: DateTime<Utc>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl RuntimeHandle {
    /// Wraps a booted machine.
    pub fn new(vm_id: impl Into<String>, machine: Box<dyn Machine>) -> Self {
        Self {
            vm_id: vm_id.into(),
            machine,
            booted_at: Utc::now(),
        }
    }

    /// The id of the VM this runtime belongs to.
    pub fn vm_id(&self) -> &str {
        &self.vm_id
    }

    /// When the machine finished booting.
    pub fn booted_at(&self) -> DateTime<Utc> {
        self.booted_at
    }

    /// The machine, for issuing control-channel operations.
    pub fn machine_mut(&mut self) -> &mut dyn Machine {
        self.machine.as_mut()
    }
}
