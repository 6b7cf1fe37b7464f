use serde::Serialize;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

pub fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "compaction_core=info,runner_container=info,bootstrap=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Outcome of one compaction run, reported by the runners.
#[derive(Debug, Default, Clone, Serialize)]
pub struct CompactionMetrics {
    pub channel: String,
    pub snapshot_name: Option<String>,
    pub loaded_entries: usize,
    pub replayed_messages: u64,
    pub replayed_tombstones: u64,
    pub written_entries: usize,
    pub snapshot_bytes: u64,
    pub pruned_snapshots: usize,
    pub load_ms: u64,
    pub replay_ms: u64,
    pub write_ms: u64,
    pub upload_ms: u64,
    pub total_ms: u64,
}
