//! Artefact and metadata persistence. Object storage is content-addressed by
//! identity path and write-once; the key-value store mirrors artefact paths
//! so one prefix delete purges both.

pub mod fs;
pub mod kv;
pub mod memory;
pub mod object;
pub mod s3;

pub use fs::{FsKvStore, FsObjectStore};
pub use kv::KvStore;
pub use memory::{MemoryKvStore, MemoryObjectStore};
pub use object::{ObjectMeta, ObjectStore};
pub use s3::{S3KvStore, S3ObjectStore, S3Options};
