//! In-memory drivers, used by tests and as the KV fallback when no
//! filesystem root is configured.

use std::time::SystemTime;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use serde_json::Value;

use esmcdn_common::{CdnError, Result};

use crate::kv::KvStore;
use crate::object::{ObjectMeta, ObjectStore};

#[derive(Debug, Default)]
pub struct MemoryObjectStore {
    objects: DashMap<String, Bytes>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn stat(&self, path: &str) -> Result<Option<ObjectMeta>> {
        Ok(self.objects.get(path).map(|data| ObjectMeta {
            size: data.len() as u64,
            modified: Some(SystemTime::now()),
        }))
    }

    async fn open(&self, path: &str) -> Result<Bytes> {
        self.objects
            .get(path)
            .map(|data| data.clone())
            .ok_or_else(|| CdnError::NotFound(path.to_string()))
    }

    async fn write(&self, path: &str, data: Bytes) -> Result<()> {
        self.objects.insert(path.to_string(), data);
        Ok(())
    }

    async fn remove(&self, path: &str) -> Result<()> {
        self.objects.remove(path);
        Ok(())
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<u64> {
        let keys: Vec<String> = self
            .objects
            .iter()
            .filter(|entry| entry.key().starts_with(prefix))
            .map(|entry| entry.key().clone())
            .collect();
        let mut removed = 0u64;
        for key in keys {
            if self.objects.remove(&key).is_some() {
                removed += 1;
            }
        }
        Ok(removed)
    }
}

#[derive(Debug, Default)]
pub struct MemoryKvStore {
    records: DashMap<String, Value>,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KvStore for MemoryKvStore {
    async fn get(&self, key: &str) -> Result<Option<Value>> {
        Ok(self.records.get(key).map(|v| v.clone()))
    }

    async fn put(&self, key: &str, value: Value) -> Result<()> {
        self.records.insert(key.to_string(), value);
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.records.remove(key);
        Ok(())
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<u64> {
        let keys: Vec<String> = self
            .records
            .iter()
            .filter(|entry| entry.key().starts_with(prefix))
            .map(|entry| entry.key().clone())
            .collect();
        let mut removed = 0u64;
        for key in keys {
            if self.records.remove(&key).is_some() {
                removed += 1;
            }
        }
        Ok(removed)
    }
}
