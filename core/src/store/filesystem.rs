use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::errors::StoreError;
use crate::store::{object_name, SnapshotObject, SnapshotStore};

/// A [`SnapshotStore`] on a local or mounted file system. Each bucket is a
/// directory below `root`.
#[derive(Debug, Clone)]
pub struct FileSystemSnapshotStore {
    root: PathBuf,
}

impl FileSystemSnapshotStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn bucket_dir(&self, bucket: &str) -> PathBuf {
        self.root.join(bucket)
    }
}

#[async_trait]
impl SnapshotStore for FileSystemSnapshotStore {
    async fn list(&self, bucket: &str) -> Result<Vec<SnapshotObject>, StoreError> {
        let list_error = |e: std::io::Error| StoreError::List {
            bucket: bucket.to_string(),
            reason: e.to_string(),
        };

        let dir = self.bucket_dir(bucket);
        let mut entries = tokio::fs::read_dir(&dir).await.map_err(list_error)?;
        let mut objects = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(list_error)? {
            let metadata = entry.metadata().await.map_err(list_error)?;
            if !metadata.is_file() {
                continue;
            }
            let last_modified: DateTime<Utc> = metadata.modified().map_err(list_error)?.into();
            objects.push(SnapshotObject {
                name: entry.file_name().to_string_lossy().into_owned(),
                last_modified,
                size: metadata.len(),
            });
        }
        debug!(bucket, objects = objects.len(), "listed bucket directory");
        Ok(objects)
    }

    async fn upload(&self, bucket: &str, file: &Path) -> Result<(), StoreError> {
        let name = object_name(bucket, file)?;
        let upload_error = |e: std::io::Error| StoreError::Upload {
            bucket: bucket.to_string(),
            key: name.clone(),
            reason: e.to_string(),
        };

        let dir = self.bucket_dir(bucket);
        tokio::fs::create_dir_all(&dir).await.map_err(upload_error)?;
        // copy under a hidden name first, so readers never see a partial object
        let partial = dir.join(format!(".{}.partial", name));
        tokio::fs::copy(file, &partial).await.map_err(upload_error)?;
        tokio::fs::rename(&partial, dir.join(&name))
            .await
            .map_err(upload_error)?;
        Ok(())
    }

    async fn download(
        &self,
        bucket: &str,
        name: &str,
        destination: &Path,
    ) -> Result<(), StoreError> {
        tokio::fs::copy(self.bucket_dir(bucket).join(name), destination)
            .await
            .map(|_| ())
            .map_err(|e| StoreError::Download {
                bucket: bucket.to_string(),
                key: name.to_string(),
                reason: e.to_string(),
            })
    }

    async fn delete(&self, bucket: &str, name: &str) -> Result<(), StoreError> {
        tokio::fs::remove_file(self.bucket_dir(bucket).join(name))
            .await
            .map_err(|e| StoreError::Delete {
                bucket: bucket.to_string(),
                key: name.to_string(),
                reason: e.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_upload_list_download_delete() {
        let root = tempfile::tempdir().unwrap();
        let scratch = tempfile::tempdir().unwrap();
        let store = FileSystemSnapshotStore::new(root.path());

        let file = scratch.path().join("snapshot.json.zip");
        tokio::fs::write(&file, b"12345").await.unwrap();
        store.upload("bucket", &file).await.unwrap();

        let objects = store.list("bucket").await.unwrap();
        assert_eq!(objects.len(), 1);
        assert_eq!(objects[0].name, "snapshot.json.zip");
        assert_eq!(objects[0].size, 5);

        let downloaded = scratch.path().join("downloaded.json.zip");
        store
            .download("bucket", "snapshot.json.zip", &downloaded)
            .await
            .unwrap();
        assert_eq!(tokio::fs::read(&downloaded).await.unwrap(), b"12345");

        store.delete("bucket", "snapshot.json.zip").await.unwrap();
        assert!(store.list("bucket").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_missing_bucket_fails_listing() {
        let root = tempfile::tempdir().unwrap();
        let store = FileSystemSnapshotStore::new(root.path());
        assert!(matches!(
            store.list("missing").await,
            Err(StoreError::List { .. })
        ));
    }

    #[tokio::test]
    async fn test_download_missing_object() {
        let root = tempfile::tempdir().unwrap();
        let store = FileSystemSnapshotStore::new(root.path());
        let target = root.path().join("out");
        assert!(matches!(
            store.download("bucket", "nope", &target).await,
            Err(StoreError::Download { .. })
        ));
    }
}
