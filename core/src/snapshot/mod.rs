pub mod codec;
pub mod reader;
pub mod writer;

use chrono::{DateTime, NaiveDateTime, Utc};
use std::path::Path;
use tracing::{info, warn};
use uuid::Uuid;

pub use reader::SnapshotReader;
pub use writer::SnapshotWriter;

pub const SNAPSHOT_FILE_EXTENSION: &str = ".json.zip";

const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H-%MZ";
/// Length of a timestamp written with [`TIMESTAMP_FORMAT`].
const TIMESTAMP_LEN: usize = "2024-01-01T00-00Z".len();

pub fn snapshot_file_name_prefix(channel: &str) -> String {
    format!("compaction-{}-snapshot-", channel)
}

/// Whether `name` is a snapshot object of `channel`. The prefix must be
/// followed by a timestamp and an alphanumeric suffix, so channels whose
/// names extend each other never claim each other's snapshots.
pub fn is_snapshot_of(channel: &str, name: &str) -> bool {
    let Some(rest) = name
        .strip_prefix(&snapshot_file_name_prefix(channel))
        .and_then(|rest| rest.strip_suffix(SNAPSHOT_FILE_EXTENSION))
    else {
        return false;
    };
    let (Some(timestamp), Some(suffix)) = (rest.get(..TIMESTAMP_LEN), rest.get(TIMESTAMP_LEN..))
    else {
        return false;
    };
    let Some(random) = suffix.strip_prefix('-') else {
        return false;
    };
    NaiveDateTime::parse_from_str(timestamp, TIMESTAMP_FORMAT).is_ok()
        && !random.is_empty()
        && random.chars().all(|c| c.is_ascii_alphanumeric())
}

/// `compaction-<channel>-snapshot-<yyyy-MM-ddTHH-mmZ>-<random>.json.zip`
pub fn new_snapshot_file_name(channel: &str, now: DateTime<Utc>) -> String {
    let random = Uuid::new_v4().simple().to_string();
    format!(
        "{}{}-{}{}",
        snapshot_file_name_prefix(channel),
        now.format(TIMESTAMP_FORMAT),
        &random[..12],
        SNAPSHOT_FILE_EXTENSION
    )
}

/// Removes local snapshot files of `channel` from `dir`, except `keep`.
/// Returns the number of removed files.
pub async fn remove_local_snapshots(dir: &Path, channel: &str, keep: Option<&str>) -> usize {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) => {
            warn!(dir = %dir.display(), "cannot list local snapshot directory: {}", e);
            return 0;
        }
    };

    let mut removed = 0;
    loop {
        let entry = match entries.next_entry().await {
            Ok(Some(entry)) => entry,
            Ok(None) => break,
            Err(e) => {
                warn!(dir = %dir.display(), "cannot list local snapshot directory: {}", e);
                break;
            }
        };
        let name = entry.file_name().to_string_lossy().into_owned();
        if !is_snapshot_of(channel, &name) || keep == Some(name.as_str()) {
            continue;
        }
        match tokio::fs::remove_file(entry.path()).await {
            Ok(()) => {
                info!(file = %name, "removed local snapshot");
                removed += 1;
            }
            Err(e) => warn!(file = %name, "failed to remove local snapshot: {}", e),
        }
    }
    removed
}
