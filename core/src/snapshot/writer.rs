use chrono::Utc;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::channel::ChannelPosition;
use crate::errors::{SnapshotError, StoreError};
use crate::snapshot::codec::write_snapshot_file;
use crate::snapshot::{is_snapshot_of, new_snapshot_file_name, remove_local_snapshots};
use crate::state::WorkingSet;
use crate::store::SnapshotStore;

/// A snapshot file written to the local snapshot directory.
#[derive(Debug, Clone)]
pub struct WrittenSnapshot {
    pub name: String,
    pub path: PathBuf,
    pub entries: usize,
    pub bytes: u64,
}

/// Writes, publishes and prunes snapshots of a channel.
pub struct SnapshotWriter {
    store: Arc<dyn SnapshotStore>,
    bucket: String,
    local_dir: PathBuf,
}

impl SnapshotWriter {
    pub fn new(
        store: Arc<dyn SnapshotStore>,
        bucket: impl Into<String>,
        local_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            store,
            bucket: bucket.into(),
            local_dir: local_dir.into(),
        }
    }

    pub async fn create_snapshot(
        &self,
        channel: &str,
        position: &ChannelPosition,
        working_set: Arc<dyn WorkingSet>,
    ) -> Result<WrittenSnapshot, SnapshotError> {
        let name = new_snapshot_file_name(channel, Utc::now());
        let write_error = |reason: String| SnapshotError::Write {
            name: name.clone(),
            reason,
        };

        tokio::fs::create_dir_all(&self.local_dir)
            .await
            .map_err(|e| write_error(e.to_string()))?;
        let path = self.local_dir.join(&name);
        info!(channel, file = %path.display(), "start creating snapshot");

        let entries = {
            let path = path.clone();
            let position = position.clone();
            tokio::task::spawn_blocking(move || {
                write_snapshot_file(&path, &position, &*working_set)
            })
            .await
            .map_err(|e| write_error(e.to_string()))??
        };
        let bytes = tokio::fs::metadata(&path)
            .await
            .map_err(|e| write_error(e.to_string()))?
            .len();

        info!(channel, file = %path.display(), entries, bytes, "finished creating snapshot");
        Ok(WrittenSnapshot {
            name,
            path,
            entries,
            bytes,
        })
    }

    /// Uploads a written snapshot. The local file is removed if the upload
    /// fails, so it can never be taken for a published snapshot.
    pub async fn publish(&self, snapshot: &WrittenSnapshot) -> Result<(), StoreError> {
        info!(
            snapshot = %snapshot.name,
            bucket = %self.bucket,
            "start uploading snapshot"
        );
        if let Err(e) = self.store.upload(&self.bucket, &snapshot.path).await {
            error!(snapshot = %snapshot.name, "upload failed, deleting local file: {}", e);
            if let Err(remove_error) = tokio::fs::remove_file(&snapshot.path).await {
                error!(
                    file = %snapshot.path.display(),
                    "failed to delete snapshot file: {}",
                    remove_error
                );
            }
            return Err(e);
        }
        info!(snapshot = %snapshot.name, bucket = %self.bucket, "finished uploading snapshot");
        Ok(())
    }

    /// Deletes every snapshot of `channel` except `keep`, in the store and in
    /// the local directory. Failures are logged and skipped. Returns the
    /// number of deleted store objects.
    pub async fn prune(&self, channel: &str, keep: &str) -> usize {
        remove_local_snapshots(&self.local_dir, channel, Some(keep)).await;

        let objects = match self.store.list(&self.bucket).await {
            Ok(objects) => objects,
            Err(e) => {
                warn!(channel, "failed to list snapshots for pruning: {}", e);
                return 0;
            }
        };

        let mut deleted = 0;
        for object in objects
            .iter()
            .filter(|o| is_snapshot_of(channel, &o.name) && o.name != keep)
        {
            match self.store.delete(&self.bucket, &object.name).await {
                Ok(()) => {
                    info!(channel, snapshot = %object.name, "deleted old snapshot");
                    deleted += 1;
                }
                Err(e) => warn!(channel, snapshot = %object.name, "failed to delete old snapshot: {}", e),
            }
        }
        deleted
    }
}
