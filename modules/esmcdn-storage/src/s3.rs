//! S3-compatible object storage driver. Writes to S3 are atomic per object
//! by the service's own semantics, so no rename dance is needed here.

use async_trait::async_trait;
use bytes::Bytes;
use s3::creds::Credentials;
use s3::error::S3Error;
use s3::{Bucket, Region};
use serde_json::Value;
use tracing::debug;

use esmcdn_common::{CdnError, Result};

use crate::kv::KvStore;
use crate::object::{ObjectMeta, ObjectStore};

#[derive(Debug, Clone)]
pub struct S3Options {
    pub bucket: String,
    pub region: String,
    /// Custom endpoint for S3-compatible services; empty for AWS.
    pub endpoint: String,
    pub access_key: String,
    pub secret_key: String,
}

pub struct S3ObjectStore {
    bucket: Box<Bucket>,
}

impl S3ObjectStore {
    pub fn new(options: &S3Options) -> Result<Self> {
        let region = if options.endpoint.is_empty() {
            options
                .region
                .parse()
                .map_err(|e| CdnError::Other(anyhow::anyhow!("bad s3 region: {e}")))?
        } else {
            Region::Custom {
                region: options.region.clone(),
                endpoint: options.endpoint.clone(),
            }
        };
        let credentials = Credentials::new(
            Some(&options.access_key),
            Some(&options.secret_key),
            None,
            None,
            None,
        )
        .map_err(|e| CdnError::Other(anyhow::anyhow!("s3 credentials: {e}")))?;
        let bucket = Bucket::new(&options.bucket, region, credentials)
            .map_err(|e| CdnError::Other(anyhow::anyhow!("s3 bucket: {e}")))?
            .with_path_style();
        Ok(Self { bucket })
    }
}

fn is_missing(err: &S3Error) -> bool {
    matches!(err, S3Error::HttpFailWithBody(404, _))
}

fn upstream(what: &str, err: S3Error) -> CdnError {
    CdnError::Other(anyhow::anyhow!("s3 {what}: {err}"))
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn stat(&self, path: &str) -> Result<Option<ObjectMeta>> {
        match self.bucket.head_object(path).await {
            Ok((head, _)) => Ok(Some(ObjectMeta {
                size: head.content_length.unwrap_or_default().max(0) as u64,
                modified: None,
            })),
            Err(e) if is_missing(&e) => Ok(None),
            Err(e) => Err(upstream("head", e)),
        }
    }

    async fn open(&self, path: &str) -> Result<Bytes> {
        match self.bucket.get_object(path).await {
            Ok(data) => Ok(data.bytes().clone()),
            Err(e) if is_missing(&e) => Err(CdnError::NotFound(path.to_string())),
            Err(e) => Err(upstream("get", e)),
        }
    }

    async fn write(&self, path: &str, data: Bytes) -> Result<()> {
        self.bucket
            .put_object(path, &data)
            .await
            .map_err(|e| upstream("put", e))?;
        debug!(path, bytes = data.len(), "Stored object");
        Ok(())
    }

    async fn remove(&self, path: &str) -> Result<()> {
        match self.bucket.delete_object(path).await {
            Ok(_) => Ok(()),
            Err(e) if is_missing(&e) => Ok(()),
            Err(e) => Err(upstream("delete", e)),
        }
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<u64> {
        let pages = self
            .bucket
            .list(prefix.to_string(), None)
            .await
            .map_err(|e| upstream("list", e))?;
        let mut removed = 0u64;
        for page in pages {
            for object in page.contents {
                match self.bucket.delete_object(&object.key).await {
                    Ok(_) => removed += 1,
                    Err(e) if is_missing(&e) => {}
                    Err(e) => return Err(upstream("delete", e)),
                }
            }
        }
        Ok(removed)
    }
}

/// Key-value records stored as JSON objects next to the artefacts.
pub struct S3KvStore {
    inner: S3ObjectStore,
}

impl S3KvStore {
    pub fn new(options: &S3Options) -> Result<Self> {
        Ok(Self {
            inner: S3ObjectStore::new(options)?,
        })
    }

    fn record_key(key: &str) -> String {
        format!("{key}.json")
    }
}

#[async_trait]
impl KvStore for S3KvStore {
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
