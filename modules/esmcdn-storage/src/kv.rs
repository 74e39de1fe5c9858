use async_trait::async_trait;
use serde_json::Value;

use esmcdn_common::Result;

/// Metadata records colocated with artefacts. Keys mirror artefact paths so
/// a single prefix delete purges artefacts and their records together.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Value>>;

    async fn put(&self, key: &str, value: Value) -> Result<()>;

    async fn remove(&self, key: &str) -> Result<()>;

    /// Remove every record whose key starts with `prefix`; returns how many
    /// were deleted.
    async fn delete_prefix(&self, prefix: &str) -> Result<u64>;
}
