use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use compaction_core::compaction::{CompactionService, CompactionState};
use compaction_core::config::{CompactionConfig, ConsumptionConfig, SnapshotConfig, SnapshotStoreConfig};
use compaction_core::errors::{CompactionError, StoreError};
use compaction_core::snapshot::SnapshotReader;
use compaction_core::source::memory::InMemoryChannel;
use compaction_core::state::{InMemoryWorkingSet, WorkingSet};
use compaction_core::store::{FileSystemSnapshotStore, SnapshotObject, SnapshotStore};
use serde_json::Value;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

const BUCKET: &str = "snapshots";

/// Delegates to a filesystem store, failing uploads on demand.
struct FlakyStore {
    inner: FileSystemSnapshotStore,
    fail_uploads: AtomicBool,
}

#[async_trait]
impl SnapshotStore for FlakyStore {
    async fn list(&self, bucket: &str) -> Result<Vec<SnapshotObject>, StoreError> {
        self.inner.list(bucket).await
    }

    async fn upload(&self, bucket: &str, file: &Path) -> Result<(), StoreError> {
        if self.fail_uploads.load(Ordering::SeqCst) {
            return Err(StoreError::Upload {
                bucket: bucket.to_string(),
                key: file.display().to_string(),
                reason: "connection reset".to_string(),
            });
        }
        self.inner.upload(bucket, file).await
    }

    async fn download(&self, bucket: &str, name: &str, destination: &Path) -> Result<(), StoreError> {
        self.inner.download(bucket, name, destination).await
    }

    async fn delete(&self, bucket: &str, name: &str) -> Result<(), StoreError> {
        self.inner.delete(bucket, name).await
    }
}

struct Harness {
    root: TempDir,
    channel: Arc<InMemoryChannel>,
    store: Arc<FlakyStore>,
    service: CompactionService,
}

impl Harness {
    fn new(shards: usize) -> Self {
        let root = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(root.path().join(BUCKET)).unwrap();
        let channel = Arc::new(InMemoryChannel::new("products", shards));
        let store = Arc::new(FlakyStore {
            inner: FileSystemSnapshotStore::new(root.path()),
            fail_uploads: AtomicBool::new(false),
        });
        let service = CompactionService::new(
            channel.clone(),
            store.clone(),
            &snapshot_config(root.path()),
            ConsumptionConfig {
                idle_poll_interval_ms: 10,
                ..Default::default()
            },
            Arc::new(InMemoryWorkingSet::new()),
        );
        Self {
            root,
            channel,
            store,
            service,
        }
    }

    fn write(&self, shard: &str, key: &str, payload: Option<&str>) {
        let past = Utc::now() - ChronoDuration::minutes(10);
        self.channel.append(shard, key, payload, past).unwrap();
    }

    fn published(&self) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(self.root.path().join(BUCKET))
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    fn local_dir(&self) -> PathBuf {
        self.root.path().join("local")
    }

    /// The JSON document inside a published snapshot.
    fn document(&self, name: &str) -> Value {
        let file = std::fs::File::open(self.root.path().join(BUCKET).join(name)).unwrap();
        let mut archive = zip::ZipArchive::new(file).unwrap();
        assert_eq!(archive.len(), 1);
        let mut content = String::new();
        archive
            .by_name("data")
            .unwrap()
            .read_to_string(&mut content)
            .unwrap();
        serde_json::from_str(&content).unwrap()
    }
}

fn snapshot_config(root: &Path) -> SnapshotConfig {
    SnapshotConfig {
        bucket: BUCKET.to_string(),
        store: SnapshotStoreConfig::FileSystem {
            root: root.to_path_buf(),
        },
        local_dir: Some(root.join("local")),
    }
}

fn data_keys(document: &Value) -> Vec<String> {
    let mut keys: Vec<String> = document["data"]
        .as_array()
        .unwrap()
        .iter()
        .flat_map(|entry| entry.as_object().unwrap().keys().cloned())
        .collect();
    keys.sort();
    keys
}

#[tokio::test]
async fn test_compaction_of_two_shards() {
    let harness = Harness::new(2);
    for i in 1..=10 {
        let shard = if i % 2 == 0 { "shard-0" } else { "shard-1" };
        harness.write(shard, &i.to_string(), Some(&format!("{{\"id\":{}}}", i)));
    }

    let name = harness.service.compact("products").await.unwrap();
    assert_eq!(harness.published(), vec![name.clone()]);
    assert!(name.starts_with("compaction-products-snapshot-"));

    let document = harness.document(&name);
    assert_eq!(document["data"].as_array().unwrap().len(), 10);
    let positions = document["startSequenceNumbers"].as_array().unwrap();
    assert_eq!(positions.len(), 2);
    assert_eq!(positions[0]["shard"], "shard-0");
    assert_eq!(positions[0]["sequenceNumber"], "4");
    assert_eq!(positions[1]["shard"], "shard-1");
    assert_eq!(positions[1]["sequenceNumber"], "4");
    assert_eq!(harness.service.state(), CompactionState::Idle);
}

#[tokio::test]
async fn test_tombstone_removes_entry_from_next_snapshot() {
    let harness = Harness::new(1);
    harness.write("shard-0", "100000", Some("{\"name\":\"lamp\"}"));
    harness.write("shard-0", "100001", Some("{\"name\":\"desk\"}"));

    let first = harness.service.compact("products").await.unwrap();
    assert_eq!(data_keys(&harness.document(&first)), vec!["100000", "100001"]);

    harness.write("shard-0", "100000", None);
    let second = harness.service.compact("products").await.unwrap();

    assert_ne!(first, second);
    assert_eq!(data_keys(&harness.document(&second)), vec!["100001"]);
    // the older snapshot was pruned
    assert_eq!(harness.published(), vec![second]);
}

#[tokio::test]
async fn test_failed_upload_keeps_previous_snapshot() {
    let harness = Harness::new(1);
    harness.write("shard-0", "1", Some("a"));
    let first = harness.service.compact("products").await.unwrap();

    harness.write("shard-0", "2", Some("b"));
    harness.store.fail_uploads.store(true, Ordering::SeqCst);
    let error = harness.service.compact("products").await.unwrap_err();

    assert_eq!(harness.service.state(), CompactionState::Failed);
    match &error {
        CompactionError::Failed { channel, source } => {
            assert_eq!(channel, "products");
            assert!(matches!(**source, CompactionError::Store(StoreError::Upload { .. })));
        }
        other => panic!("unexpected error {:?}", other),
    }
    assert!(error.is_retryable());
    assert_eq!(harness.published(), vec![first.clone()]);

    // the unpublished snapshot does not linger in the local directory
    let local: Vec<String> = std::fs::read_dir(harness.local_dir())
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    assert_eq!(local, vec![first.clone()]);

    // the next run starts from the previous snapshot and succeeds
    harness.store.fail_uploads.store(false, Ordering::SeqCst);
    let third = harness.service.compact("products").await.unwrap();
    assert_eq!(data_keys(&harness.document(&third)), vec!["1", "2"]);
    assert_eq!(harness.service.state(), CompactionState::Idle);
}

#[tokio::test]
async fn test_records_newer_than_the_run_do_not_hide_older_ones() {
    let harness = Harness::new(1);
    for key in ["a", "b", "c"] {
        harness.write("shard-0", key, Some("v"));
    }
    harness
        .channel
        .append("shard-0", "live", Some("v"), Utc::now() + ChronoDuration::seconds(30))
        .unwrap();

    let name = harness.service.compact("products").await.unwrap();
    let document = harness.document(&name);
    assert_eq!(data_keys(&document), vec!["a", "b", "c", "live"]);
    assert_eq!(document["startSequenceNumbers"][0]["sequenceNumber"], "3");

    let working_set = Arc::new(InMemoryWorkingSet::new());
    let reader = SnapshotReader::new(harness.store.clone(), BUCKET, harness.root.path().join("cache"));
    reader
        .read_latest("products", working_set.clone())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(working_set.get("a"), Some("v".to_string()));
}

#[tokio::test]
async fn test_compaction_finishes_while_channel_is_written() {
    let harness = Harness::new(1);
    for key in ["a", "b", "c"] {
        harness.write("shard-0", key, Some("v"));
    }
    let writer = tokio::spawn({
        let channel = harness.channel.clone();
        async move {
            for i in 0u64.. {
                channel
                    .append("shard-0", &format!("live-{}", i), Some("v"), Utc::now())
                    .unwrap();
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        }
    });

    let compaction = tokio::time::timeout(
        Duration::from_secs(10),
        harness.service.compact("products"),
    )
    .await;
    writer.abort();

    let name = compaction.unwrap().unwrap();
    let keys = data_keys(&harness.document(&name));
    for key in ["a", "b", "c"] {
        assert!(keys.contains(&key.to_string()), "missing {} in {:?}", key, keys);
    }
}

#[tokio::test]
async fn test_resumes_from_snapshot_position() {
    let harness = Harness::new(1);
    harness.write("shard-0", "1", Some("a"));
    harness.write("shard-0", "2", Some("b"));
    harness.service.compact("products").await.unwrap();

    // the snapshot position itself is trimmed, replay falls back to what is left
    harness.write("shard-0", "3", Some("c"));
    harness.channel.trim("shard-0", 2).unwrap();

    let name = harness.service.compact("products").await.unwrap();
    let document = harness.document(&name);
    assert_eq!(data_keys(&document), vec!["1", "2", "3"]);
    assert_eq!(document["startSequenceNumbers"][0]["sequenceNumber"], "2");
}

#[tokio::test]
async fn test_cold_start_reader_loads_latest_snapshot() {
    let harness = Harness::new(2);
    harness.write("shard-0", "1", Some("a"));
    harness.write("shard-1", "2", Some("b"));
    let name = harness.service.compact("products").await.unwrap();

    let reader = SnapshotReader::new(
        harness.store.clone(),
        BUCKET,
        harness.root.path().join("consumer-cache"),
    );
    let working_set = Arc::new(InMemoryWorkingSet::new());
    let restored = reader
        .read_latest("products", working_set.clone())
        .await
        .unwrap()
        .unwrap();

    assert_eq!(restored.name, name);
    assert_eq!(restored.loaded.entries, 2);
    assert_eq!(working_set.get("1"), Some("a".to_string()));
    assert_eq!(working_set.get("2"), Some("b".to_string()));
    assert_eq!(restored.loaded.position.len(), 2);
}

#[tokio::test]
async fn test_service_from_config() {
    let root = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(root.path().join(BUCKET)).unwrap();
    let yaml = format!(
        r#"
version: 1
channels:
  - products
transport:
  type: in_memory
  options:
    shards: 2
snapshot:
  bucket: {}
  store:
    type: file_system
    options:
      root: {}
  local_dir: {}
consumption:
  idle_poll_interval_ms: 10
"#,
        BUCKET,
        root.path().display(),
        root.path().join("local").display()
    );
    let config = CompactionConfig::from_yaml(&yaml).unwrap();
    config.validate().unwrap();

    let service = CompactionService::from_config(&config, "products").await.unwrap();
    let metrics = service.run("products").await.unwrap();
    assert_eq!(metrics.channel, "products");
    assert_eq!(metrics.written_entries, 0);
    assert_eq!(metrics.replayed_messages, 0);
    let name = metrics.snapshot_name.unwrap();
    assert!(root.path().join(BUCKET).join(&name).exists());
}
