pub mod kafka;
pub mod kinesis_stream;
pub mod memory;

use async_trait::async_trait;
use std::sync::Arc;

use crate::channel::ShardPosition;
use crate::config::TransportConfig;
use crate::errors::TransportError;
use crate::message::Message;

pub use kafka::KafkaSource;
pub use kinesis_stream::KinesisStreamSource;
pub use memory::InMemoryChannel;

/// Per-record error code reported when a record was rejected due to rate limiting.
pub const THROTTLED_ERROR_CODE: &str = "ProvisionedThroughputExceededException";

/// Per-record error code reported for transient failures inside the transport.
pub const INTERNAL_FAILURE_ERROR_CODE: &str = "InternalFailure";

/// A shard of a channel, as returned by shard discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardDescriptor {
    pub name: String,
    /// Closed shards no longer receive records and are not consumed.
    pub open: bool,
}

/// One page of shard discovery.
#[derive(Debug, Clone, Default)]
pub struct ShardPage {
    pub shards: Vec<ShardDescriptor>,
    /// Continuation marker for the next page, `None` once exhausted.
    pub next_token: Option<String>,
}

/// An opaque handle used to read the next page of a shard.
/// For example: a Kinesis shard iterator, or partition and offset for Kafka.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardIterator(pub String);

/// One page of records read from a shard.
#[derive(Debug, Clone)]
pub struct FetchResponse {
    /// Records in shard order. Each record carries its transport token in
    /// `header.sequence_number`.
    pub records: Vec<Message>,
    /// `None` once the shard is closed and fully read.
    pub next_iterator: Option<ShardIterator>,
    pub millis_behind: u64,
}

/// Outcome of one record of a published batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordResult {
    pub error_code: Option<String>,
    pub error_message: Option<String>,
}

impl RecordResult {
    pub fn success() -> Self {
        Self::default()
    }

    pub fn failure(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error_code: Some(code.into()),
            error_message: Some(message.into()),
        }
    }

    pub fn is_failure(&self) -> bool {
        self.error_code.is_some()
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self.error_code.as_deref(),
            Some(THROTTLED_ERROR_CODE) | Some(INTERNAL_FAILURE_ERROR_CODE)
        )
    }
}

/// Per-record results of a published batch, in batch order.
#[derive(Debug, Clone, Default)]
pub struct PublishBatchResponse {
    pub results: Vec<RecordResult>,
}

impl PublishBatchResponse {
    pub fn failed_record_count(&self) -> usize {
        self.results.iter().filter(|r| r.is_failure()).count()
    }
}

/// The capabilities a log technology has to provide, regardless of whether
/// it's Kinesis, Kafka or an in-memory channel.
#[async_trait]
pub trait ChannelTransport: Send + Sync {
    /// Lists one page of the shards of a channel.
    async fn list_shards(
        &self,
        channel: &str,
        next_token: Option<String>,
    ) -> Result<ShardPage, TransportError>;

    /// Creates an iterator reading from `position`.
    ///
    /// Rejects positions the shard no longer retains with
    /// [`TransportError::StalePosition`].
    async fn get_iterator(
        &self,
        channel: &str,
        position: &ShardPosition,
    ) -> Result<ShardIterator, TransportError>;

    /// Reads the next page of at most `limit` records.
    async fn fetch_next(
        &self,
        iterator: &ShardIterator,
        limit: usize,
    ) -> Result<FetchResponse, TransportError>;

    /// Writes a batch of records and reports the outcome of every record.
    async fn publish_batch(
        &self,
        channel: &str,
        records: &[Message],
    ) -> Result<PublishBatchResponse, TransportError>;
}

/// Creates the transport configured for `channel`.
pub async fn connect(
    config: &TransportConfig,
    channel: &str,
) -> Result<Arc<dyn ChannelTransport>, TransportError> {
    Ok(match config {
        TransportConfig::Kinesis(options) => Arc::new(KinesisStreamSource::new(&options.aws).await),
        TransportConfig::Kafka(options) => Arc::new(KafkaSource::new(options)?),
        TransportConfig::InMemory { shards } => Arc::new(InMemoryChannel::new(channel, *shards)),
    })
}
