use chrono::Utc;
use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::channel::{ChannelPosition, StopCondition};
use crate::config::{CompactionConfig, ConsumptionConfig, SnapshotConfig};
use crate::consume::{ChannelConsumer, ConsumeContext};
use crate::consumer::{MessageInterceptor, MessagePipeline};
use crate::errors::{Result, SnapshotError};
use crate::snapshot::{SnapshotReader, SnapshotWriter};
use crate::source::{self, ChannelTransport};
use crate::state::{InMemoryWorkingSet, WorkingSet, WorkingSetConsumer};
use crate::store::{self, SnapshotStore};
use crate::telemetry::CompactionMetrics;

/// Step a [`CompactionService`] is currently in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CompactionState {
    Idle,
    LoadingSnapshot,
    Replaying,
    WritingSnapshot,
    Publishing,
    Pruning,
    /// The last run failed. Kept until the next run starts.
    Failed,
}

impl fmt::Display for CompactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CompactionState::Idle => "IDLE",
            CompactionState::LoadingSnapshot => "LOADING_SNAPSHOT",
            CompactionState::Replaying => "REPLAYING",
            CompactionState::WritingSnapshot => "WRITING_SNAPSHOT",
            CompactionState::Publishing => "PUBLISHING",
            CompactionState::Pruning => "PRUNING",
            CompactionState::Failed => "FAILED",
        };
        f.write_str(name)
    }
}

/// Folds the history of a channel into a snapshot.
///
/// A run loads the latest snapshot into the working set, replays the channel
/// from the snapshot's positions until every shard is caught up, writes and
/// uploads a new snapshot and finally deletes the older ones. Runs on the
/// same service are serialized, since they share the working set.
pub struct CompactionService {
    consumer: ChannelConsumer,
    reader: SnapshotReader,
    writer: SnapshotWriter,
    working_set: Arc<dyn WorkingSet>,
    interceptors: Vec<Arc<dyn MessageInterceptor>>,
    shutdown: CancellationToken,
    state: Mutex<CompactionState>,
    run_lock: tokio::sync::Mutex<()>,
}

impl CompactionService {
    pub fn new(
        transport: Arc<dyn ChannelTransport>,
        store: Arc<dyn SnapshotStore>,
        snapshot: &SnapshotConfig,
        consumption: ConsumptionConfig,
        working_set: Arc<dyn WorkingSet>,
    ) -> Self {
        let local_dir = snapshot.local_dir();
        Self {
            consumer: ChannelConsumer::new(transport, consumption),
            reader: SnapshotReader::new(store.clone(), &snapshot.bucket, local_dir.clone()),
            writer: SnapshotWriter::new(store, &snapshot.bucket, local_dir),
            working_set,
            interceptors: Vec::new(),
            shutdown: CancellationToken::new(),
            state: Mutex::new(CompactionState::Idle),
            run_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Connects the configured transport and snapshot store for `channel`,
    /// with an in-memory working set.
    pub async fn from_config(config: &CompactionConfig, channel: &str) -> Result<Self> {
        let transport = source::connect(&config.transport, channel).await?;
        let store = store::connect(&config.snapshot.store).await;
        Ok(Self::new(
            transport,
            store,
            &config.snapshot,
            config.consumption.clone(),
            Arc::new(InMemoryWorkingSet::new()),
        ))
    }

    /// Replay stops at the reached positions once `shutdown` is cancelled.
    pub fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }

    /// Adds an interceptor that sees every replayed message before the
    /// working set does.
    pub fn with_interceptor(mut self, interceptor: Arc<dyn MessageInterceptor>) -> Self {
        self.interceptors.push(interceptor);
        self
    }

    /// Loads `file` instead of the latest snapshot of the store.
    pub fn with_snapshot_file(
        mut self,
        file: impl Into<PathBuf>,
    ) -> std::result::Result<Self, SnapshotError> {
        self.reader.set_snapshot_file(file)?;
        Ok(self)
    }

    pub fn state(&self) -> CompactionState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, channel: &str, state: CompactionState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
        info!(channel, %state, "compaction state changed");
    }

    /// Compacts `channel` and returns the name of the published snapshot.
    pub async fn compact(&self, channel: &str) -> Result<String> {
        let metrics = self.run(channel).await?;
        Ok(metrics.snapshot_name.unwrap_or_default())
    }

    /// Compacts `channel` and reports what the run did.
    pub async fn run(&self, channel: &str) -> Result<CompactionMetrics> {
        let _guard = self.run_lock.lock().await;
        let started = Instant::now();
        self.working_set.clear();

        let result = self.run_steps(channel, started).await;
        self.working_set.clear();

        match result {
            Ok(metrics) => {
                self.set_state(channel, CompactionState::Idle);
                info!(
                    channel,
                    snapshot = metrics.snapshot_name.as_deref().unwrap_or_default(),
                    entries = metrics.written_entries,
                    messages = metrics.replayed_messages,
                    total_ms = metrics.total_ms,
                    "finished compaction"
                );
                Ok(metrics)
            }
            Err(e) => {
                self.set_state(channel, CompactionState::Failed);
                error!(channel, "compaction failed: {}", e);
                Err(e.for_channel(channel))
            }
        }
    }

    async fn run_steps(&self, channel: &str, started: Instant) -> Result<CompactionMetrics> {
        let mut metrics = CompactionMetrics {
            channel: channel.to_string(),
            ..Default::default()
        };

        self.set_state(channel, CompactionState::LoadingSnapshot);
        let step = Instant::now();
        let start_from = match self.reader.read_latest(channel, self.working_set.clone()).await? {
            Some(restored) => {
                metrics.loaded_entries = restored.loaded.entries;
                restored.loaded.position
            }
            None => {
                info!(channel, "no previous snapshot, replaying from horizon");
                ChannelPosition::from_horizon()
            }
        };
        metrics.load_ms = elapsed_ms(step);

        self.set_state(channel, CompactionState::Replaying);
        let step = Instant::now();
        let applier = Arc::new(WorkingSetConsumer::new(self.working_set.clone()));
        let pipeline = self
            .interceptors
            .iter()
            .fold(MessagePipeline::new(), |pipeline, interceptor| {
                pipeline.with_interceptor(interceptor.clone())
            })
            .with_consumer(applier.clone());
        let context = ConsumeContext {
            pipeline,
            shutdown: self.shutdown.child_token(),
        };
        let stop_condition = StopCondition::caught_up_since(Utc::now());
        let reached = self
            .consumer
            .consume(&context, channel, &start_from, &stop_condition)
            .await?;
        // shards missing from the replay (closed since) keep their snapshot position
        let position = ChannelPosition::merge([&start_from, &reached]);
        metrics.replayed_messages = applier.applied();
        metrics.replayed_tombstones = applier.tombstones();
        metrics.replay_ms = elapsed_ms(step);

        self.set_state(channel, CompactionState::WritingSnapshot);
        let step = Instant::now();
        let written = self
            .writer
            .create_snapshot(channel, &position, self.working_set.clone())
            .await?;
        metrics.written_entries = written.entries;
        metrics.snapshot_bytes = written.bytes;
        metrics.write_ms = elapsed_ms(step);

        self.set_state(channel, CompactionState::Publishing);
        let step = Instant::now();
        self.writer.publish(&written).await?;
        metrics.upload_ms = elapsed_ms(step);

        self.set_state(channel, CompactionState::Pruning);
        metrics.pruned_snapshots = self.writer.prune(channel, &written.name).await;

        metrics.snapshot_name = Some(written.name);
        metrics.total_ms = elapsed_ms(started);
        Ok(metrics)
    }
}

fn elapsed_ms(since: Instant) -> u64 {
    since.elapsed().as_millis() as u64
}
