//! Per-VM operation serialization.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use tokio::sync::Mutex as AsyncMutex;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Hands out one async lock per VM name.
///
/// Holding a VM's lock makes the holder the single writer for that VM:
/// concurrent start/stop/resize on one VM cannot interleave, while
/// operations on different VMs proceed fully in parallel. Locks are created
/// lazily on first use and reaped when the VM is destroyed.
#[derive(Debug, Default)]
pub struct VmRegistry {
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl VmRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the lock for a VM name, creating it on first use.
    pub fn lock_for(&self, name: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = self.locks.lock().expect("vm registry lock poisoned");
        Arc::clone(
            locks
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(AsyncMutex::new(()))),
        )
    }

    /// Drops the lock entry for a destroyed VM.
    ///
    /// Holders that already cloned the `Arc` finish undisturbed; the next
    /// user of the name gets a fresh lock.
    pub fn reap(&self, name: &str) {
        self.locks
            .lock()
            .expect("vm registry lock poisoned")
            .remove(name);
    }

    /// How many VM locks currently exist.
    pub fn len(&self) -> usize {
        self.locks.lock().expect("vm registry lock poisoned").len()
    }

    /// Whether the registry holds no locks.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_same_name_same_lock() {
        let registry = VmRegistry::new();

        let a = registry.lock_for("vm-1");
        let b = registry.lock_for("vm-1");
        assert!(Arc::ptr_eq(&a, &b));

        let c = registry.lock_for("vm-2");
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(registry.len(), 2);
    }

    #[tokio::test]
    async fn test_reap_hands_out_fresh_lock() {
        let registry = VmRegistry::new();

        let old = registry.lock_for("vm-1");
        registry.reap("vm-1");
        assert!(registry.is_empty());

        let fresh = registry.lock_for("vm-1");
        assert!(!Arc::ptr_eq(&old, &fresh));
    }

    #[tokio::test]
    async fn test_lock_serializes_holders() {
        let registry = Arc::new(VmRegistry::new());
        let lock = registry.lock_for("vm-1");

        let guard = lock.lock().await;
        let contender = {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move {
                let lock = registry.lock_for("vm-1");
                let _guard = lock.lock().await;
            })
        };

        // The contender cannot finish while the guard is held.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(!contender.is_finished());

        drop(guard);
        contender.await.unwrap();
    }
}
