use std::time::SystemTime;

use async_trait::async_trait;
use bytes::Bytes;

use esmcdn_common::Result;

/// Stat result for a stored object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectMeta {
    pub size: u64,
    pub modified: Option<SystemTime>,
}

/// Abstract object storage keyed by identity-derived paths.
///
/// Implementations must make `write` atomic with respect to concurrent
/// readers: a reader sees either the prior absence or the full object, never
/// a partial one. Paths are never rewritten after creation; the queue's
/// per-identity exclusivity serializes writers under one path.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn stat(&self, path: &str) -> Result<Option<ObjectMeta>>;

    /// Read the full object. `NotFound` when absent.
    async fn open(&self, path: &str) -> Result<Bytes>;

    async fn write(&self, path: &str, data: Bytes) -> Result<()>;

    async fn remove(&self, path: &str) -> Result<()>;

    /// Remove every object whose path starts with `prefix`; returns how many
    /// were deleted.
    async fn delete_prefix(&self, prefix: &str) -> Result<u64>;
}
