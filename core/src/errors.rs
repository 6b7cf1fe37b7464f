use thiserror::Error;

#[derive(Error, Debug)]
pub enum CompactionError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Consumption error: {0}")]
    Consume(#[from] ConsumeError),

    #[error("Publish error: {0}")]
    Publish(#[from] PublishError),

    #[error("Snapshot error: {0}")]
    Snapshot(#[from] SnapshotError),

    #[error("Snapshot store error: {0}")]
    Store(#[from] StoreError),

    #[error("Compaction of channel {channel} failed: {source}")]
    Failed {
        channel: String,
        #[source]
        source: Box<CompactionError>,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Generic error: {0}")]
    Generic(#[from] anyhow::Error),
}

/// Errors raised by a [`ChannelTransport`](crate::source::ChannelTransport).
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("A transient error occurred on channel {channel}, the operation can be retried: {reason}")]
    Transient { channel: String, reason: String },

    #[error("Position {position} of shard {shard} is no longer valid: {reason}")]
    StalePosition {
        shard: String,
        position: String,
        reason: String,
    },

    #[error("Shard {shard} not found in channel {channel}")]
    ShardNotFound { channel: String, shard: String },

    #[error("Unrecoverable error from channel {channel}")]
    Unrecoverable {
        channel: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

#[derive(Error, Debug)]
pub enum ConsumeError {
    #[error("Failed to discover shards of channel {channel}: {source}")]
    Discovery {
        channel: String,
        #[source]
        source: TransportError,
    },

    #[error(
        "Worker for shard {shard} of channel {channel} failed ({cancelled} other workers stopped, {leaked} leaked): {source}"
    )]
    ShardWorkerFailure {
        channel: String,
        shard: String,
        cancelled: usize,
        leaked: usize,
        #[source]
        source: TransportError,
    },

    #[error("Worker for shard {shard} of channel {channel} panicked: {reason}")]
    WorkerPanicked {
        channel: String,
        shard: String,
        reason: String,
    },
}

#[derive(Error, Debug)]
pub enum PublishError {
    #[error("Failed to publish batch of {batch_size} records to {channel} after {retries} retries")]
    PublishExhausted {
        channel: String,
        batch_size: usize,
        retries: u32,
    },

    #[error("{count} records were rejected by {channel}: {reason}")]
    Rejected {
        channel: String,
        count: usize,
        reason: String,
    },

    #[error("{channel} answered {acknowledged} results for {sent} published records")]
    IncompleteResponse {
        channel: String,
        sent: usize,
        acknowledged: usize,
    },

    #[error("Publishing to {channel} failed: {source}")]
    Transport {
        channel: String,
        #[source]
        source: TransportError,
    },
}

#[derive(Error, Debug)]
pub enum SnapshotError {
    #[error("Failed to load snapshot {name}: {reason}")]
    Load { name: String, reason: String },

    #[error("Snapshot {name} is corrupt: {reason}")]
    Corrupt { name: String, reason: String },

    #[error("Failed to write snapshot {name}: {reason}")]
    Write { name: String, reason: String },
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Snapshot store client creation failed: {reason}")]
    ClientCreation { reason: String },

    #[error("Failed to list objects in bucket {bucket}: {reason}")]
    List { bucket: String, reason: String },

    #[error("Failed to upload object to {bucket}/{key}: {reason}")]
    Upload {
        bucket: String,
        key: String,
        reason: String,
    },

    #[error("Failed to download object from {bucket}/{key}: {reason}")]
    Download {
        bucket: String,
        key: String,
        reason: String,
    },

    #[error("Failed to delete object {bucket}/{key}: {reason}")]
    Delete {
        bucket: String,
        key: String,
        reason: String,
    },
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid configuration: {message}")]
    Invalid { message: String },

    #[error("Missing required field: {field}")]
    MissingField { field: String },

    #[error("Configuration validation failed: {reason}")]
    ValidationFailed { reason: String },

    #[error("Failed to load configuration from {origin}: {error}")]
    LoadFailed {
        origin: String,
        #[source]
        error: Box<dyn std::error::Error + Send + Sync>,
    },
}

pub type Result<T> = std::result::Result<T, CompactionError>;

impl From<serde_json::Error> for SnapshotError {
    fn from(err: serde_json::Error) -> Self {
        SnapshotError::Corrupt {
            name: String::from("<stream>"),
            reason: err.to_string(),
        }
    }
}

impl From<serde_yaml::Error> for ConfigError {
    fn from(err: serde_yaml::Error) -> Self {
        ConfigError::Invalid {
            message: err.to_string(),
        }
    }
}

impl TransportError {
    pub fn is_transient(&self) -> bool {
        matches!(self, TransportError::Transient { .. })
    }

    pub fn is_stale_position(&self) -> bool {
        matches!(self, TransportError::StalePosition { .. })
    }
}

impl CompactionError {
    /// Wraps `self` with the channel it failed on, unless it already is.
    pub fn for_channel(self, channel: &str) -> Self {
        match self {
            CompactionError::Failed { .. } => self,
            other => CompactionError::Failed {
                channel: channel.to_string(),
                source: Box::new(other),
            },
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            CompactionError::Failed { source, .. } => source.is_retryable(),
            CompactionError::Transport(e) => e.is_transient(),
            CompactionError::Consume(ConsumeError::ShardWorkerFailure { source, .. }) => {
                source.is_transient()
            }
            CompactionError::Consume(ConsumeError::Discovery { source, .. }) => {
                source.is_transient()
            }
            CompactionError::Publish(PublishError::PublishExhausted { .. }) => true,
            CompactionError::Store(StoreError::ClientCreation { .. }) => false,
            CompactionError::Store(_) => true,
            CompactionError::Config(_) => false,
            CompactionError::Snapshot(SnapshotError::Corrupt { .. }) => false,
            _ => true,
        }
    }

    pub fn get_retry_delay_ms(&self) -> u64 {
        match self {
            CompactionError::Failed { source, .. } => source.get_retry_delay_ms(),
            CompactionError::Transport(_) => 1000,
            CompactionError::Consume(_) => 2000,
            CompactionError::Store(_) => 3000,
            _ => 5000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transient() -> TransportError {
        TransportError::Transient {
            channel: "orders".to_string(),
            reason: "throttled".to_string(),
        }
    }

    #[test]
    fn test_transport_error_classification() {
        assert!(transient().is_transient());
        assert!(!transient().is_stale_position());

        let stale = TransportError::StalePosition {
            shard: "shard-0".to_string(),
            position: "42".to_string(),
            reason: "trimmed".to_string(),
        };
        assert!(stale.is_stale_position());
        assert!(!stale.is_transient());
    }

    #[test]
    fn test_is_retryable() {
        let retryable = vec![
            CompactionError::Transport(transient()),
            CompactionError::Publish(PublishError::PublishExhausted {
                channel: "orders".to_string(),
                batch_size: 5,
                retries: 3,
            }),
            CompactionError::Store(StoreError::Upload {
                bucket: "b".to_string(),
                key: "k".to_string(),
                reason: "timeout".to_string(),
            }),
        ];
        for error in retryable {
            assert!(error.is_retryable(), "Error should be retryable: {:?}", error);
        }

        let fatal = vec![
            CompactionError::Config(ConfigError::MissingField {
                field: "bucket".to_string(),
            }),
            CompactionError::Snapshot(SnapshotError::Corrupt {
                name: "s".to_string(),
                reason: "bad zip".to_string(),
            }),
            CompactionError::Store(StoreError::ClientCreation {
                reason: "no region".to_string(),
            }),
        ];
        for error in fatal {
            assert!(!error.is_retryable(), "Error should not be retryable: {:?}", error);
        }
    }

    #[test]
    fn test_for_channel_wraps_once() {
        let error = CompactionError::Transport(transient())
            .for_channel("orders")
            .for_channel("other");

        match &error {
            CompactionError::Failed { channel, .. } => assert_eq!(channel, "orders"),
            other => panic!("unexpected error {:?}", other),
        }
        assert!(error.is_retryable());
        assert_eq!(error.get_retry_delay_ms(), 1000);
        assert!(error.to_string().contains("Compaction of channel orders failed"));
    }

    #[test]
    fn test_shard_worker_failure_display() {
        let error = ConsumeError::ShardWorkerFailure {
            channel: "orders".to_string(),
            shard: "shard-2".to_string(),
            cancelled: 2,
            leaked: 0,
            source: TransportError::Unrecoverable {
                channel: "orders".to_string(),
                source: "boom".into(),
            },
        };
        let message = error.to_string();
        assert!(message.contains("shard-2"));
        assert!(message.contains("2 other workers stopped"));
    }

    #[test]
    fn test_publish_exhausted_names_batch_and_retries() {
        let error = PublishError::PublishExhausted {
            channel: "orders".to_string(),
            batch_size: 7,
            retries: 3,
        };
        assert_eq!(
            error.to_string(),
            "Failed to publish batch of 7 records to orders after 3 retries"
        );
    }
}
