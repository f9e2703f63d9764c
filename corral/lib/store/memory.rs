use std::{
    collections::HashMap,
    sync::{Mutex, MutexGuard},
};

use async_trait::async_trait;
use serde_json::Value;

use crate::CorralResult;

use super::RecordStore;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// An in-memory record store.
///
/// Useful for tests and for embedding the engine without a durable backend.
#[derive(Debug, Default)]
pub struct MemoryStore {
    buckets: Mutex<HashMap<String, HashMap<String, Value>>>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl MemoryStore {
    /// Creates a new empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn buckets(&self) -> MutexGuard<'_, HashMap<String, HashMap<String, Value>>> {
        self.buckets.lock().expect("record store lock poisoned")
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

#[async_trait]
impl RecordStore for MemoryStore {
    async fn get(&self, bucket: &str, key: &str) -> CorralResult<Option<Value>> {
        Ok(
            self.buckets()
                .get(bucket)
                .and_then(|records| records.get(key))
                .cloned(),
        )
    }

    async fn put(&self, bucket: &str, key: &str, value: Value) -> CorralResult<()> {
        self.buckets()
            .entry(bucket.to_string())
            .or_default()
            .insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, bucket: &str, key: &str) -> CorralResult<()> {
        if let Some(records) = self.buckets().get_mut(bucket) {
            records.remove(key);
        }
        Ok(())
    }

    async fn list(&self, bucket: &str) -> CorralResult<Vec<Value>> {
        Ok(
            self.buckets()
                .get(bucket)
                .map(|records| records.values().cloned().collect())
                .unwrap_or_default(),
        )
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
    async fn test_memory_store_roundtrip() -> anyhow::Result<()> {
        let store = MemoryStore::new();

        store.put("vms", "a", json!({"name": "a"})).await?;
        store.put("vms", "b", json!({"name": "b"})).await?;

        assert_eq!(store.get("vms", "a").await?, Some(json!({"name": "a"})));
        assert_eq!(store.get("vms", "missing").await?, None);
        assert_eq!(store.list("vms").await?.len(), 2);

        store.delete("vms", "a").await?;
        assert_eq!(store.get("vms", "a").await?, None);
        assert_eq!(store.list("vms").await?.len(), 1);

        Ok(())
    }

    #[tokio::test]
    async fn test_buckets_are_disjoint() -> anyhow::Result<()> {
        let store = MemoryStore::new();

        store.put("vms", "key", json!(1)).await?;
        store.put("snapshots", "key", json!(2)).await?;

        assert_eq!(store.get("vms", "key").await?, Some(json!(1)));
        assert_eq!(store.get("snapshots", "key").await?, Some(json!(2)));

        Ok(())
    }
}
