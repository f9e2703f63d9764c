use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde_json::Value;
use tokio::fs;

use crate::CorralResult;

use super::RecordStore;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A record store keeping one JSON document per record on disk.
///
/// Buckets map to subdirectories of the root, keys to `<key>.json` files.
#[derive(Debug)]
pub struct FileStore {
    root: PathBuf,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl FileStore {
    /// Creates a store rooted at the given directory.
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    fn record_path(&self, bucket: &str, key: &str) -> PathBuf {
        self.root.join(bucket).join(format!("{}.json", key))
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

#[async_trait]
impl RecordStore for FileStore {
    async fn get(&self, bucket: &str, key: &str) -> CorralResult<Option<Value>> {
        let path = self.record_path(bucket, key);
        match fs::read_to_string(&path).await {
            Ok(contents) => Ok(Some(serde_json::from_str(&contents)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn put(&self, bucket: &str, key: &str, value: Value) -> CorralResult<()> {
        let path = self.record_path(bucket, key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        // Write-then-rename so a crash mid-write never leaves a torn record.
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_string_pretty(&value)?).await?;
        fs::rename(&tmp, &path).await?;

        Ok(())
    }

    async fn delete(&self, bucket: &str, key: &str) -> CorralResult<()> {
        let path = self.record_path(bucket, key);
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self, bucket: &str) -> CorralResult<Vec<Value>> {
        let dir = self.root.join(bucket);
        if !fs::try_exists(&dir).await? {
            return Ok(Vec::new());
        }

        let mut values = Vec::new();
        let mut entries = fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().map_or(false, |ext| ext == "json") {
                let contents = fs::read_to_string(&path).await?;
                values.push(serde_json::from_str(&contents)?);
            }
        }

        Ok(values)
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_file_store_roundtrip() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let store = FileStore::new(dir.path());

        store.put("vms", "vm-1", json!({"vcpus": 2})).await?;
        assert_eq!(store.get("vms", "vm-1").await?, Some(json!({"vcpus": 2})));

        store.put("vms", "vm-1", json!({"vcpus": 4})).await?;
        assert_eq!(store.get("vms", "vm-1").await?, Some(json!({"vcpus": 4})));

        store.delete("vms", "vm-1").await?;
        assert_eq!(store.get("vms", "vm-1").await?, None);

        // Deleting a missing record is a no-op.
        store.delete("vms", "vm-1").await?;

        Ok(())
    }

    #[tokio::test]
    async fn test_file_store_list_skips_foreign_files() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let store = FileStore::new(dir.path());

        store.put("vms", "vm-1", json!(1)).await?;
        store.put("vms", "vm-2", json!(2)).await?;
        tokio::fs::write(dir.path().join("vms").join("notes.txt"), "ignored").await?;

        assert_eq!(store.list("vms").await?.len(), 2);
        assert_eq!(store.list("empty-bucket").await?.len(), 0);

        Ok(())
    }
}
