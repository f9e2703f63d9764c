//! Pluggable persistence for VM and snapshot records.
//!
//! The orchestration engine only ever needs get/put/delete/list by key over
//! JSON-compatible documents; anything that can satisfy [`RecordStore`] can
//! back the fleet.

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;

use crate::CorralResult;

mod file;
mod memory;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use file::*;
pub use memory::*;

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The bucket VM records live in.
pub const VMS_BUCKET: &str = "vms";

/// The bucket snapshot records live in.
pub const SNAPSHOTS_BUCKET: &str = "snapshots";

//--------------------------------------------------------------------------------------------------
// Traits
//--------------------------------------------------------------------------------------------------

/// A keyed document store.
///
/// Buckets partition the key space; keys are unique within a bucket.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Returns the document stored under the given key, if any.
    async fn get(&self, bucket: &str, key: &str) -> CorralResult<Option<Value>>;

    /// Stores a document under the given key, replacing any previous value.
    async fn put(&self, bucket: &str, key: &str, value: Value) -> CorralResult<()>;

    /// Removes the document stored under the given key, if any.
    async fn delete(&self, bucket: &str, key: &str) -> CorralResult<()>;

    /// Returns every document in the given bucket.
    async fn list(&self, bucket: &str) -> CorralResult<Vec<Value>>;
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Fetches and deserializes a record.
pub async fn get_record<T: DeserializeOwned>(
    store: &dyn RecordStore,
    bucket: &str,
    key: &str,
) -> CorralResult<Option<T>> {
    match store.get(bucket, key).await? {
        Some(value) => Ok(Some(serde_json::from_value(value)?)),
        None => Ok(None),
    }
}

/// Serializes and stores a record.
pub async fn put_record<T: Serialize>(
    store: &dyn RecordStore,
    bucket: &str,
    key: &str,
    record: &T,
) -> CorralResult<()> {
    store.put(bucket, key, serde_json::to_value(record)?).await
}

/// Fetches and deserializes every record in a bucket.
pub async fn list_records<T: DeserializeOwned>(
    store: &dyn RecordStore,
    bucket: &str,
) -> CorralResult<Vec<T>> {
    let values = store.list(bucket).await?;
    let mut records = Vec::with_capacity(values.len());
    for value in values {
        records.push(serde_json::from_value(value)?);
    }
    Ok(records)
}
