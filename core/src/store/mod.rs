pub mod filesystem;
pub mod s3;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::Path;
use std::sync::Arc;

use crate::config::SnapshotStoreConfig;
use crate::errors::StoreError;

pub use filesystem::FileSystemSnapshotStore;
pub use s3::S3SnapshotStore;

/// An object in a snapshot bucket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotObject {
    pub name: String,
    pub last_modified: DateTime<Utc>,
    pub size: u64,
}

/// Where snapshots are published.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    async fn list(&self, bucket: &str) -> Result<Vec<SnapshotObject>, StoreError>;

    /// Uploads `file` under its file name.
    async fn upload(&self, bucket: &str, file: &Path) -> Result<(), StoreError>;

    async fn download(&self, bucket: &str, name: &str, destination: &Path)
    -> Result<(), StoreError>;

    async fn delete(&self, bucket: &str, name: &str) -> Result<(), StoreError>;
}

/// Creates the snapshot store described by `config`.
pub async fn connect(config: &SnapshotStoreConfig) -> Arc<dyn SnapshotStore> {
    match config {
        SnapshotStoreConfig::S3(options) => Arc::new(S3SnapshotStore::new(options).await),
        SnapshotStoreConfig::FileSystem { root } => Arc::new(FileSystemSnapshotStore::new(root)),
    }
}

pub(crate) fn object_name(bucket: &str, file: &Path) -> Result<String, StoreError> {
    file.file_name()
        .and_then(|n| n.to_str())
        .map(str::to_string)
        .ok_or_else(|| StoreError::Upload {
            bucket: bucket.to_string(),
            key: file.display().to_string(),
            reason: "path has no valid file name".to_string(),
        })
}
