//! Local filesystem drivers. Writes go to a temp sibling and are renamed
//! into place, so concurrent readers never observe a partial object.

use std::path::{Path, PathBuf};

use anyhow::Context;
use async_trait::async_trait;
use bytes::Bytes;
use serde_json::Value;
use tracing::debug;

use esmcdn_common::{CdnError, Result};

use crate::kv::KvStore;
use crate::object::{ObjectMeta, ObjectStore};

#[derive(Debug, Clone)]
pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn full_path(&self, key: &str) -> Result<PathBuf> {
        Ok(self.root.join(sanitize_key(key)?))
    }
}

/// Storage keys are produced internally from identities, but a traversal
/// segment slipping through would escape the root; reject rather than trust.
fn sanitize_key(key: &str) -> Result<&str> {
    let key = key.trim_start_matches('/');
    if key.is_empty() || key.split('/').any(|seg| seg == "..") {
        return Err(CdnError::InvalidRequest(format!("bad storage key: {key}")));
    }
    Ok(key)
}

async fn atomic_write(path: &Path, data: &[u8]) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let tmp = path.with_extension(format!("tmp{:08x}", rand::random::<u32>()));
    tokio::fs::write(&tmp, data).await?;
    match tokio::fs::rename(&tmp, path).await {
        Ok(()) => Ok(()),
        Err(e) => {
            let _ = tokio::fs::remove_file(&tmp).await;
            Err(e.into())
        }
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn stat(&self, path: &str) -> Result<Option<ObjectMeta>> {
        let full = self.full_path(path)?;
        match tokio::fs::metadata(&full).await {
            Ok(meta) if meta.is_file() => Ok(Some(ObjectMeta {
                size: meta.len(),
                modified: meta.modified().ok(),
            })),
            Ok(_) => Ok(None),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(anyhow::Error::from(e)
                .context(format!("stat {path}"))
                .into()),
        }
    }

    async fn open(&self, path: &str) -> Result<Bytes> {
        let full = self.full_path(path)?;
        match tokio::fs::read(&full).await {
            Ok(data) => Ok(Bytes::from(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(CdnError::NotFound(path.to_string()))
            }
            Err(e) => Err(anyhow::Error::from(e)
                .context(format!("open {path}"))
                .into()),
        }
    }

    async fn write(&self, path: &str, data: Bytes) -> Result<()> {
        let full = self.full_path(path)?;
        atomic_write(&full, &data)
            .await
            .with_context(|| format!("write {path}"))?;
        debug!(path, bytes = data.len(), "Stored object");
        Ok(())
    }

    async fn remove(&self, path: &str) -> Result<()> {
        let full = self.full_path(path)?;
        match tokio::fs::remove_file(&full).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(anyhow::Error::from(e)
                .context(format!("remove {path}"))
                .into()),
        }
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<u64> {
        let prefix = sanitize_key(prefix)?.to_string();
        let root = self.root.clone();
        let removed =
            tokio::task::spawn_blocking(move || delete_prefix_blocking(&root, &prefix))
                .await
                .map_err(anyhow::Error::from)??;
        Ok(removed)
    }
}

/// Walk the tree under `root` and remove files whose relative path starts
/// with `prefix`. Directory trees matching the prefix exactly are removed
/// wholesale; empty parents are left in place.
fn delete_prefix_blocking(root: &Path, prefix: &str) -> Result<u64> {
    let direct = root.join(prefix);
    if direct.is_dir() {
        let count = count_files(&direct);
        std::fs::remove_dir_all(&direct)
            .with_context(|| format!("delete prefix {prefix}"))
            .map_err(CdnError::from)?;
        return Ok(count);
    }

    // Prefix may end mid-filename (`…/react.development`): scan the parent.
    let (dir, stem) = match prefix.rsplit_once('/') {
        Some((dir, stem)) => (root.join(dir), stem.to_string()),
        None => (root.to_path_buf(), prefix.to_string()),
    };
    let mut removed = 0u64;
    let entries = match std::fs::read_dir(&dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(anyhow::Error::from(e).into()),
    };
    for entry in entries.flatten() {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if !name.starts_with(&stem) {
            continue;
        }
        let path = entry.path();
        if path.is_dir() {
            removed += count_files(&path);
            let _ = std::fs::remove_dir_all(&path);
        } else if std::fs::remove_file(&path).is_ok() {
            removed += 1;
        }
    }
    Ok(removed)
}

fn count_files(dir: &Path) -> u64 {
    let mut count = 0u64;
    let Ok(entries) = std::fs::read_dir(dir) else {
        return 0;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            count += count_files(&path);
        } else {
            count += 1;
        }
    }
    count
}

/// JSON-file key-value store sharing the FS layout of the object store.
#[derive(Debug, Clone)]
pub struct FsKvStore {
    inner: FsObjectStore,
}

impl FsKvStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            inner: FsObjectStore::new(root),
        }
    }

    fn record_key(key: &str) -> String {
        format!("{key}.json")
    }
}

#[async_trait]
impl KvStore for FsKvStore {
    async fn get(&self, key: &str) -> Result<Option<Value>> {
        match self.inner.open(&Self::record_key(key)).await {
            Ok(data) => {
                let value = serde_json::from_slice(&data)
                    .map_err(|e| anyhow::anyhow!("corrupt kv record {key}: {e}"))?;
                Ok(Some(value))
            }
            Err(CdnError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn put(&self, key: &str, value: Value) -> Result<()> {
        let data = serde_json::to_vec(&value).map_err(anyhow::Error::from)?;
        self.inner.write(&Self::record_key(key), Bytes::from(data)).await
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.inner.remove(&Self::record_key(key)).await
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<u64> {
        self.inner.delete_prefix(prefix).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, FsObjectStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = FsObjectStore::new(dir.path());
        (dir, store)
    }

    #[tokio::test]
    async fn write_then_read_back() {
        let (_dir, store) = store();
        store
            .write("builds/v1/react@18.2.0/es2022/react.mjs", Bytes::from("export {}"))
            .await
            .unwrap();
        let data = store.open("builds/v1/react@18.2.0/es2022/react.mjs").await.unwrap();
        assert_eq!(&data[..], b"export {}");

        let meta = store
            .stat("builds/v1/react@18.2.0/es2022/react.mjs")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(meta.size, 9);
    }

    #[tokio::test]
    async fn open_missing_is_not_found() {
        let (_dir, store) = store();
        let err = store.open("builds/v1/nope.mjs").await.unwrap_err();
        assert!(matches!(err, CdnError::NotFound(_)));
        assert!(store.stat("builds/v1/nope.mjs").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn delete_prefix_removes_directory_trees() {
        let (_dir, store) = store();
        for path in [
            "builds/v1/react@18.2.0/es2022/react.mjs",
            "builds/v1/react@18.2.0/es2022/react.mjs.map",
            "builds/v1/react@18.2.0/es2020/react.mjs",
            "builds/v1/react@18.3.0/es2022/react.mjs",
        ] {
            store.write(path, Bytes::from("x")).await.unwrap();
        }
        let removed = store.delete_prefix("builds/v1/react@18.2.0").await.unwrap();
        assert_eq!(removed, 3);
        assert!(store.stat("builds/v1/react@18.2.0/es2022/react.mjs").await.unwrap().is_none());
        assert!(store.stat("builds/v1/react@18.3.0/es2022/react.mjs").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn delete_prefix_matches_file_stems() {
        let (_dir, store) = store();
        store.write("modules/abc.es2022.mjs", Bytes::from("x")).await.unwrap();
        store.write("modules/abd.es2022.mjs", Bytes::from("x")).await.unwrap();
        let removed = store.delete_prefix("modules/abc").await.unwrap();
        assert_eq!(removed, 1);
        assert!(store.stat("modules/abd.es2022.mjs").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn traversal_keys_rejected() {
        let (_dir, store) = store();
        assert!(store.open("../outside").await.is_err());
        assert!(store.write("a/../../b", Bytes::from("x")).await.is_err());
    }

    #[tokio::test]
    async fn kv_roundtrip_and_prefix_delete() {
        let dir = tempfile::tempdir().unwrap();
        let kv = FsKvStore::new(dir.path());
        kv.put(
            "builds/v1/react@18.2.0/es2022/react",
            serde_json::json!({"fromCJS": false}),
        )
        .await
        .unwrap();
        let value = kv.get("builds/v1/react@18.2.0/es2022/react").await.unwrap().unwrap();
        assert_eq!(value["fromCJS"], false);

        kv.delete_prefix("builds/v1/react@18.2.0").await.unwrap();
        assert!(kv.get("builds/v1/react@18.2.0/es2022/react").await.unwrap().is_none());
    }
}
