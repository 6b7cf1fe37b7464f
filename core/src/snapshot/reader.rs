use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

use crate::errors::{CompactionError, SnapshotError, StoreError};
use crate::snapshot::codec::{read_snapshot_file, LoadedSnapshot};
use crate::snapshot::{is_snapshot_of, remove_local_snapshots};
use crate::state::WorkingSet;
use crate::store::{SnapshotObject, SnapshotStore};

/// A snapshot decoded into a working set.
#[derive(Debug, Clone)]
pub struct RestoredSnapshot {
    pub name: String,
    pub loaded: LoadedSnapshot,
}

/// Finds, fetches and decodes the latest snapshot of a channel.
pub struct SnapshotReader {
    store: Arc<dyn SnapshotStore>,
    bucket: String,
    local_dir: PathBuf,
    forced_snapshot_file: Option<PathBuf>,
}

impl SnapshotReader {
    pub fn new(
        store: Arc<dyn SnapshotStore>,
        bucket: impl Into<String>,
        local_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            store,
            bucket: bucket.into(),
            local_dir: local_dir.into(),
            forced_snapshot_file: None,
        }
    }

    /// Reads `file` instead of looking up the store.
    pub fn set_snapshot_file(&mut self, file: impl Into<PathBuf>) -> Result<(), SnapshotError> {
        let file = file.into();
        if !file.is_file() {
            return Err(SnapshotError::Load {
                name: file.display().to_string(),
                reason: "snapshot file does not exist or is not a file".to_string(),
            });
        }
        self.forced_snapshot_file = Some(file);
        Ok(())
    }

    /// The most recently modified snapshot object of `channel`, by the
    /// store's modification time.
    pub async fn latest_snapshot_object(
        &self,
        channel: &str,
    ) -> Result<Option<SnapshotObject>, StoreError> {
        let objects = self.store.list(&self.bucket).await?;
        Ok(objects
            .into_iter()
            .filter(|o| is_snapshot_of(channel, &o.name))
            .max_by(|a, b| {
                a.last_modified
                    .cmp(&b.last_modified)
                    .then_with(|| a.name.cmp(&b.name))
            }))
    }

    /// Returns a local file holding the latest snapshot of `channel`, or
    /// `None` if the channel has none yet.
    ///
    /// A local copy with the same size as the stored object is reused.
    /// Otherwise stale local copies are removed and the object is downloaded.
    pub async fn retrieve_latest_snapshot(
        &self,
        channel: &str,
    ) -> Result<Option<PathBuf>, StoreError> {
        if let Some(file) = &self.forced_snapshot_file {
            info!(channel, file = %file.display(), "using local snapshot file");
            return Ok(Some(file.clone()));
        }

        let Some(object) = self.latest_snapshot_object(channel).await? else {
            warn!(channel, bucket = %self.bucket, "no snapshot found");
            return Ok(None);
        };

        let local_file = self.local_dir.join(&object.name);
        if let Ok(metadata) = tokio::fs::metadata(&local_file).await {
            if metadata.is_file() && metadata.len() == object.size {
                info!(
                    channel,
                    file = %local_file.display(),
                    "local snapshot matches the stored one, skipping download"
                );
                return Ok(Some(local_file));
            }
        }

        remove_local_snapshots(&self.local_dir, channel, None).await;
        tokio::fs::create_dir_all(&self.local_dir)
            .await
            .map_err(|e| StoreError::Download {
                bucket: self.bucket.clone(),
                key: object.name.clone(),
                reason: e.to_string(),
            })?;
        info!(
            channel,
            snapshot = %object.name,
            bytes = object.size,
            "downloading snapshot"
        );
        self.store
            .download(&self.bucket, &object.name, &local_file)
            .await?;
        info!(channel, snapshot = %object.name, "finished downloading snapshot");
        Ok(Some(local_file))
    }

    /// Loads the latest snapshot of `channel` into `working_set`. Useful on
    /// its own to warm up a consumer without replaying the channel.
    pub async fn read_latest(
        &self,
        channel: &str,
        working_set: Arc<dyn WorkingSet>,
    ) -> Result<Option<RestoredSnapshot>, CompactionError> {
        let Some(file) = self.retrieve_latest_snapshot(channel).await? else {
            return Ok(None);
        };

        let name = file
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| file.display().to_string());
        let loaded = tokio::task::spawn_blocking(move || read_snapshot_file(&file, &*working_set))
            .await
            .map_err(|e| SnapshotError::Load {
                name: name.clone(),
                reason: e.to_string(),
            })??;

        info!(
            channel,
            snapshot = %name,
            entries = loaded.entries,
            shards = loaded.position.len(),
            "loaded snapshot"
        );
        Ok(Some(RestoredSnapshot { name, loaded }))
    }
}
