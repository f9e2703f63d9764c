//! The snapshot manager.

use std::{
    collections::HashSet,
    path::{Path, PathBuf},
    sync::Arc,
};

use chrono::{DateTime, Utc};
use getset::Getters;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::{fs, io::AsyncReadExt};
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    config::{OsKind, SnapshotConfig},
    hypervisor::Machine,
    store::{self, RecordStore, SNAPSHOTS_BUCKET},
    CorralError, CorralResult,
};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The machine shape recorded at capture time.
///
/// A restore reinstates these values unless the caller explicitly overrides
/// them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Getters)]
#[getset(get = "pub with_prefix")]
pub struct SnapshotVmState {
    /// The number of vCPUs at capture time.
    pub(crate) vcpus: u8,

    /// The amount of memory in MiB at capture time.
    pub(crate) memory_mib: u32,

    /// The guest operating system family.
    pub(crate) os_kind: OsKind,
}

/// One captured snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Getters)]
#[getset(get = "pub with_prefix")]
pub struct Snapshot {
    /// The system-generated snapshot id.
    pub(crate) id: String,

    /// The id of the VM this snapshot belongs to.
    pub(crate) vm_id: String,

    /// The caller-chosen name, unique per VM.
    pub(crate) name: String,

    /// The parent snapshot id; `None` marks a full snapshot.
    pub(crate) parent_id: Option<String>,

    /// The hex SHA-256 digest of the artifact.
    pub(crate) checksum: String,

    /// The artifact size in bytes.
    pub(crate) size_bytes: u64,

    /// When the snapshot was captured.
    pub(crate) created_at: DateTime<Utc>,

    /// The machine shape at capture time.
    pub(crate) vm_state: SnapshotVmState,

    /// When the checksum was last verified, if ever.
    pub(crate) verified_at: Option<DateTime<Utc>>,
}

/// Orchestrates capture, verification, restore chains, and retention.
pub struct SnapshotManager {
    store: Arc<dyn RecordStore>,
    config: SnapshotConfig,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl SnapshotManager {
    /// Creates a manager storing artifacts under the configured directory.
    pub fn new(store: Arc<dyn RecordStore>, config: SnapshotConfig) -> Self {
        Self { store, config }
    }

    /// Captures a new snapshot of a running machine.
    ///
    /// The guest is paused around the capture and resumed afterwards. With a
    /// parent given, the parent must belong to the same VM and the resulting
    /// parent graph must stay acyclic. Retention is enforced after the
    /// capture lands.
    pub async fn create(
        &self,
        vm_id: &str,
        vm_state: SnapshotVmState,
        machine: &mut dyn Machine,
        name: &str,
        parent_name: Option<&str>,
    ) -> CorralResult<Snapshot> {
        let existing = self.list(vm_id).await?;

        if existing.iter().any(|snapshot| snapshot.name == name) {
            return Err(CorralError::Conflict(format!(
                "snapshot '{}' already exists for vm '{}'",
                name, vm_id
            )));
        }

        let parent_id = match parent_name {
            Some(parent_name) => {
                let parent = existing
                    .iter()
                    .find(|snapshot| snapshot.name == parent_name)
                    .ok_or_else(|| CorralError::SnapshotNotFound(parent_name.to_string()))?;
                self.check_acyclic(&existing, parent)?;
                Some(parent.id.clone())
            }
            None => None,
        };

        let id = Uuid::new_v4().to_string();
        let artifact = self.artifact_path(vm_id, &id);
        if let Some(parent) = artifact.parent() {
            fs::create_dir_all(parent).await?;
        }

        // Pause around the capture for a consistent image; the guest is
        // resumed even when the capture itself fails.
        machine.pause().await?;
        let captured = machine.snapshot(&artifact).await;
        let resumed = machine.resume().await;
        captured?;
        resumed?;

        let (checksum, size_bytes) = sha256_file(&artifact).await?;

        let snapshot = Snapshot {
            id: id.clone(),
            vm_id: vm_id.to_string(),
            name: name.to_string(),
            parent_id,
            checksum,
            size_bytes,
            created_at: Utc::now(),
            vm_state,
            verified_at: None,
        };
        store::put_record(self.store.as_ref(), SNAPSHOTS_BUCKET, &id, &snapshot).await?;

        info!(vm_id = %vm_id, snapshot = %name, size_bytes, "captured snapshot");

        let pruned = self.prune(vm_id).await?;
        if !pruned.is_empty() {
            info!(vm_id = %vm_id, count = pruned.len(), "retention pruned snapshots");
        }

        Ok(snapshot)
    }

    /// Recomputes the artifact checksum and compares it to the record.
    ///
    /// A mismatch is an integrity failure and is never repaired. On success
    /// the record's verification stamp is updated.
    pub async fn verify(&self, snapshot: &Snapshot) -> CorralResult<Snapshot> {
        let artifact = self.artifact_path(&snapshot.vm_id, &snapshot.id);
        let (actual, _) = sha256_file(&artifact).await?;

        if actual != snapshot.checksum {
            return Err(CorralError::Integrity {
                snapshot: snapshot.name.clone(),
                expected: snapshot.checksum.clone(),
                actual,
            });
        }

        let mut verified = snapshot.clone();
        verified.verified_at = Some(Utc::now());
        store::put_record(
            self.store.as_ref(),
            SNAPSHOTS_BUCKET,
            &verified.id,
            &verified,
        )
        .await?;

        Ok(verified)
    }

    /// Resolves the restore chain for a snapshot: nearest full ancestor
    /// first, the target last. Every link is verified before anything is
    /// applied to the machine.
    pub async fn restore_chain(&self, snapshot: &Snapshot) -> CorralResult<Vec<Snapshot>> {
        let all = self.list(&snapshot.vm_id).await?;

        let mut chain = vec![snapshot.clone()];
        let mut visited: HashSet<String> = HashSet::from([snapshot.id.clone()]);
        let mut cursor = snapshot.clone();

        while let Some(parent_id) = cursor.parent_id.clone() {
            let parent = all
                .iter()
                .find(|candidate| candidate.id == parent_id)
                .ok_or_else(|| CorralError::SnapshotNotFound(parent_id.clone()))?;
            if !visited.insert(parent.id.clone()) {
                return Err(CorralError::Conflict(format!(
                    "snapshot parent graph for vm '{}' contains a cycle",
                    snapshot.vm_id
                )));
            }
            chain.push(parent.clone());
            cursor = parent.clone();
        }

        chain.reverse();
        Ok(chain)
    }

    /// Verifies and applies a restore chain to a machine, base first.
    pub async fn apply_chain(
        &self,
        machine: &mut dyn Machine,
        chain: &[Snapshot],
    ) -> CorralResult<()> {
        for snapshot in chain {
            self.verify(snapshot).await?;
        }
        for snapshot in chain {
            let artifact = self.artifact_path(&snapshot.vm_id, &snapshot.id);
            machine.restore(&artifact).await?;
        }
        Ok(())
    }

    /// Deletes one snapshot by name.
    ///
    /// Refused while another retained snapshot names it as parent; the child
    /// must be deleted first to keep every retained chain restorable.
    pub async fn delete(&self, vm_id: &str, name: &str) -> CorralResult<()> {
        let all = self.list(vm_id).await?;
        let snapshot = all
            .iter()
            .find(|snapshot| snapshot.name == name)
            .ok_or_else(|| CorralError::SnapshotNotFound(name.to_string()))?;

        if let Some(child) = all
            .iter()
            .find(|candidate| candidate.parent_id.as_deref() == Some(snapshot.id.as_str()))
        {
            return Err(CorralError::Conflict(format!(
                "snapshot '{}' is the parent of '{}' and cannot be deleted first",
                name, child.name
            )));
        }

        self.remove(snapshot).await
    }

    /// Deletes every snapshot of a VM, children before parents.
    pub async fn delete_all_for(&self, vm_id: &str) -> CorralResult<()> {
        let mut remaining = self.list(vm_id).await?;

        while !remaining.is_empty() {
            let parent_ids: HashSet<String> = remaining
                .iter()
                .filter_map(|snapshot| snapshot.parent_id.clone())
                .collect();

            let (leaves, rest): (Vec<Snapshot>, Vec<Snapshot>) = remaining
                .into_iter()
                .partition(|snapshot| !parent_ids.contains(&snapshot.id));

            if leaves.is_empty() {
                // Only possible with a cyclic graph in the store; removing
                // the rest unconditionally still converges.
                for snapshot in &rest {
                    self.remove(snapshot).await?;
                }
                break;
            }

            for snapshot in &leaves {
                self.remove(snapshot).await?;
            }
            remaining = rest;
        }

        Ok(())
    }

    /// Returns a VM's snapshots, newest first.
    pub async fn list(&self, vm_id: &str) -> CorralResult<Vec<Snapshot>> {
        let mut snapshots: Vec<Snapshot> =
            store::list_records(self.store.as_ref(), SNAPSHOTS_BUCKET)
                .await?
                .into_iter()
                .filter(|snapshot: &Snapshot| snapshot.vm_id == vm_id)
                .collect();
        snapshots.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(snapshots)
    }

    /// Finds a VM's snapshot by name.
    pub async fn find(&self, vm_id: &str, name: &str) -> CorralResult<Snapshot> {
        self.list(vm_id)
            .await?
            .into_iter()
            .find(|snapshot| snapshot.name == name)
            .ok_or_else(|| CorralError::SnapshotNotFound(name.to_string()))
    }

    /// Applies the retention policy to a VM's snapshots.
    ///
    /// A snapshot is a pruning candidate once it falls outside the retained
    /// count or exceeds the maximum age, but a candidate that is the parent
    /// of any retained snapshot is kept so the retained chain stays
    /// restorable. Returns the names of the pruned snapshots.
    pub async fn prune(&self, vm_id: &str) -> CorralResult<Vec<String>> {
        let snapshots = self.list(vm_id).await?;
        let now = Utc::now();
        let max_age = self.config.max_age();
        let max_per_vm = *self.config.get_max_per_vm();

        let mut retained: HashSet<String> = snapshots
            .iter()
            .enumerate()
            .filter(|(index, snapshot)| {
                *index < max_per_vm && now - snapshot.created_at <= max_age
            })
            .map(|(_, snapshot)| snapshot.id.clone())
            .collect();

        // Parents of retained snapshots are promoted into the retained set
        // until it stops growing.
        loop {
            let promoted: Vec<String> = snapshots
                .iter()
                .filter(|snapshot| retained.contains(&snapshot.id))
                .filter_map(|snapshot| snapshot.parent_id.clone())
                .filter(|parent_id| !retained.contains(parent_id))
                .collect();
            if promoted.is_empty() {
                break;
            }
            retained.extend(promoted);
        }

        let mut pruned = Vec::new();
        for snapshot in snapshots
            .iter()
            .filter(|snapshot| !retained.contains(&snapshot.id))
        {
            self.remove(snapshot).await?;
            pruned.push(snapshot.name.clone());
        }

        Ok(pruned)
    }

    /// The artifact path for a snapshot id.
    pub fn artifact_path(&self, vm_id: &str, snapshot_id: &str) -> PathBuf {
        self.config
            .get_dir()
            .join(vm_id)
            .join(format!("{}.snap", snapshot_id))
    }

    /// Removes a snapshot record and its artifact.
    async fn remove(&self, snapshot: &Snapshot) -> CorralResult<()> {
        self.store
            .delete(SNAPSHOTS_BUCKET, &snapshot.id)
            .await?;

        let artifact = self.artifact_path(&snapshot.vm_id, &snapshot.id);
        if let Err(e) = fs::remove_file(&artifact).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(
                    snapshot = %snapshot.name,
                    error = %e,
                    "failed to remove snapshot artifact"
                );
            }
        }

        Ok(())
    }

    /// Rejects a parent whose ancestor chain revisits a node.
    fn check_acyclic(&self, all: &[Snapshot], parent: &Snapshot) -> CorralResult<()> {
        let mut visited: HashSet<&str> = HashSet::from([parent.id.as_str()]);
        let mut cursor = parent;

        while let Some(parent_id) = cursor.parent_id.as_deref() {
            let Some(next) = all.iter().find(|candidate| candidate.id == parent_id) else {
                break;
            };
            if !visited.insert(next.id.as_str()) {
                return Err(CorralError::Conflict(format!(
                    "snapshot '{}' sits on a cyclic parent chain",
                    parent.name
                )));
            }
            cursor = next;
        }

        Ok(())
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Computes the hex SHA-256 digest and size of a file.
pub async fn sha256_file(path: &Path) -> CorralResult<(String, u64)> {
    let mut file = fs::File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; 64 * 1024];
    let mut size = 0u64;

    loop {
        let n = file.read(&mut buffer).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
        size += n as u64;
    }

    Ok((hex::encode(hasher.finalize()), size))
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        hypervisor::{FakeHypervisor, Hypervisor, MachineConfig},
        store::MemoryStore,
    };

    mod fixtures {
        use super::*;

        pub fn vm_state() -> SnapshotVmState {
            SnapshotVmState {
                vcpus: 2,
                memory_mib: 512,
                os_kind: OsKind::Linux,
            }
        }

        pub fn manager(dir: &Path) -> SnapshotManager {
            let config = SnapshotConfig::builder().dir(dir.to_path_buf()).build();
            SnapshotManager::new(Arc::new(MemoryStore::new()), config)
        }

        pub fn manager_with(
            dir: &Path,
            max_per_vm: usize,
            max_age_hours: u64,
        ) -> SnapshotManager {
            let config = SnapshotConfig::builder()
                .dir(dir.to_path_buf())
                .max_per_vm(max_per_vm)
                .max_age_hours(max_age_hours)
                .build();
            SnapshotManager::new(Arc::new(MemoryStore::new()), config)
        }

        pub async fn machine(vm_id: &str) -> Box<dyn Machine> {
            let hypervisor = FakeHypervisor::new();
            let mut machine = hypervisor
                .launch(
                    MachineConfig::builder()
                        .vm_id(vm_id)
                        .vcpus(2)
                        .memory_mib(512)
                        .os_kind(OsKind::Linux)
                        .build(),
                )
                .await
                .unwrap();
            machine.boot().await.unwrap();
            machine
        }
    }

    #[tokio::test]
    async fn test_create_then_verify_roundtrip() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let manager = fixtures::manager(dir.path());
        let mut machine = fixtures::machine("vm-1").await;

        let snapshot = manager
            .create("vm-1", fixtures::vm_state(), machine.as_mut(), "base", None)
            .await?;

        let verified = manager.verify(&snapshot).await?;
        assert!(verified.verified_at.is_some());

        Ok(())
    }

    #[tokio::test]
    async fn test_flipped_byte_fails_verification() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let manager = fixtures::manager(dir.path());
        let mut machine = fixtures::machine("vm-1").await;

        let snapshot = manager
            .create("vm-1", fixtures::vm_state(), machine.as_mut(), "base", None)
            .await?;

        // Flip a single byte of the stored artifact.
        let artifact = manager.artifact_path("vm-1", &snapshot.id);
        let mut contents = fs::read(&artifact).await?;
        contents[0] ^= 0x01;
        fs::write(&artifact, contents).await?;

        let err = manager.verify(&snapshot).await.unwrap_err();
        assert!(matches!(err, CorralError::Integrity { .. }));

        Ok(())
    }

    #[tokio::test]
    async fn test_duplicate_name_rejected() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let manager = fixtures::manager(dir.path());
        let mut machine = fixtures::machine("vm-1").await;

        manager
            .create("vm-1", fixtures::vm_state(), machine.as_mut(), "base", None)
            .await?;
        let err = manager
            .create("vm-1", fixtures::vm_state(), machine.as_mut(), "base", None)
            .await
            .unwrap_err();
        assert!(matches!(err, CorralError::Conflict(_)));

        Ok(())
    }

    #[tokio::test]
    async fn test_restore_chain_resolves_base_first() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let manager = fixtures::manager(dir.path());
        let mut machine = fixtures::machine("vm-1").await;

        manager
            .create("vm-1", fixtures::vm_state(), machine.as_mut(), "base", None)
            .await?;
        manager
            .create(
                "vm-1",
                fixtures::vm_state(),
                machine.as_mut(),
                "mid",
                Some("base"),
            )
            .await?;
        let tip = manager
            .create(
                "vm-1",
                fixtures::vm_state(),
                machine.as_mut(),
                "tip",
                Some("mid"),
            )
            .await?;

        let chain = manager.restore_chain(&tip).await?;
        let names: Vec<&str> = chain.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, ["base", "mid", "tip"]);

        manager.apply_chain(machine.as_mut(), &chain).await?;

        Ok(())
    }

    #[tokio::test]
    async fn test_unknown_parent_rejected() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let manager = fixtures::manager(dir.path());
        let mut machine = fixtures::machine("vm-1").await;

        let err = manager
            .create(
                "vm-1",
                fixtures::vm_state(),
                machine.as_mut(),
                "orphan",
                Some("missing"),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, CorralError::SnapshotNotFound(_)));

        Ok(())
    }

    #[tokio::test]
    async fn test_parent_of_retained_child_cannot_be_deleted() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let manager = fixtures::manager(dir.path());
        let mut machine = fixtures::machine("vm-1").await;

        manager
            .create("vm-1", fixtures::vm_state(), machine.as_mut(), "base", None)
            .await?;
        manager
            .create(
                "vm-1",
                fixtures::vm_state(),
                machine.as_mut(),
                "child",
                Some("base"),
            )
            .await?;

        let err = manager.delete("vm-1", "base").await.unwrap_err();
        assert!(matches!(err, CorralError::Conflict(_)));

        // Child first, then the parent goes.
        manager.delete("vm-1", "child").await?;
        manager.delete("vm-1", "base").await?;
        assert!(manager.list("vm-1").await?.is_empty());

        Ok(())
    }

    #[tokio::test]
    async fn test_prune_keeps_newest_and_chain_parents() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;

        // Retain a single snapshot; its parent must still survive pruning.
        let manager = fixtures::manager_with(dir.path(), 1, 1000);
        let mut machine = fixtures::machine("vm-1").await;

        manager
            .create("vm-1", fixtures::vm_state(), machine.as_mut(), "base", None)
            .await?;
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        manager
            .create(
                "vm-1",
                fixtures::vm_state(),
                machine.as_mut(),
                "child",
                Some("base"),
            )
            .await?;

        let names: Vec<String> = manager
            .list("vm-1")
            .await?
            .into_iter()
            .map(|s| s.name)
            .collect();
        assert_eq!(names, ["child", "base"]);

        Ok(())
    }

    #[tokio::test]
    async fn test_prune_removes_unchained_old_snapshots() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let manager = fixtures::manager_with(dir.path(), 2, 1000);
        let mut machine = fixtures::machine("vm-1").await;

        for name in ["one", "two", "three", "four"] {
            manager
                .create("vm-1", fixtures::vm_state(), machine.as_mut(), name, None)
                .await?;
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }

        let names: Vec<String> = manager
            .list("vm-1")
            .await?
            .into_iter()
            .map(|s| s.name)
            .collect();
        assert_eq!(names, ["four", "three"]);

        Ok(())
    }

    #[tokio::test]
    async fn test_delete_all_handles_chains() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let manager = fixtures::manager(dir.path());
        let mut machine = fixtures::machine("vm-1").await;

        manager
            .create("vm-1", fixtures::vm_state(), machine.as_mut(), "base", None)
            .await?;
        manager
            .create(
                "vm-1",
                fixtures::vm_state(),
                machine.as_mut(),
                "child",
                Some("base"),
            )
            .await?;

        manager.delete_all_for("vm-1").await?;
        assert!(manager.list("vm-1").await?.is_empty());

        Ok(())
    }
}
