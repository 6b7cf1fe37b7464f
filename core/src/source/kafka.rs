use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{BaseConsumer, Consumer, StreamConsumer};
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::message::{BorrowedMessage, Message as _};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::{Offset, TopicPartitionList};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::channel::{ShardPosition, StartFrom};
use crate::config::KafkaOptions;
use crate::errors::TransportError;
use crate::message::{Header, Key, Message};
use crate::source::{
    ChannelTransport, FetchResponse, PublishBatchResponse, RecordResult, ShardDescriptor,
    ShardIterator, ShardPage, INTERNAL_FAILURE_ERROR_CODE, THROTTLED_ERROR_CODE,
};

const DEFAULT_FETCH_TIMEOUT_MS: u64 = 1000;
const METADATA_TIMEOUT: Duration = Duration::from_secs(10);
/// Once a page has its first record, further records are only awaited this long.
const LINGER: Duration = Duration::from_millis(50);

/// Where a partition is read next: `<topic>:<partition>:<offset>`.
#[derive(Debug, Clone, PartialEq, Eq)]
struct PartitionOffset {
    topic: String,
    partition: i32,
    offset: i64,
}

impl PartitionOffset {
    fn to_iterator(&self) -> ShardIterator {
        ShardIterator(format!("{}:{}:{}", self.topic, self.partition, self.offset))
    }

    fn parse(iterator: &ShardIterator) -> Option<Self> {
        let mut parts = iterator.0.rsplitn(3, ':');
        let offset = parts.next()?.parse().ok()?;
        let partition = parts.next()?.parse().ok()?;
        let topic = parts.next()?.to_string();
        Some(Self {
            topic,
            partition,
            offset,
        })
    }
}

/// A consumer assigned to a single partition, and the offset it will
/// deliver next.
struct PartitionReader {
    consumer: StreamConsumer,
    next_offset: Option<i64>,
}

enum Received {
    Record(Message, i64),
    EndOfPartition,
    Idle,
    Failed(KafkaError),
}

/// Kafka topics as channels: partitions are shards and offsets are
/// sequence numbers. Partitions never close.
pub struct KafkaSource {
    consumer_config: ClientConfig,
    metadata: Arc<BaseConsumer>,
    producer: FutureProducer,
    readers: Mutex<HashMap<(String, i32), Arc<Mutex<PartitionReader>>>>,
    fetch_timeout: Duration,
}

fn consumer_config(options: &KafkaOptions) -> ClientConfig {
    let mut client_config = ClientConfig::new();
    client_config
        .set("bootstrap.servers", &options.bootstrap_servers)
        .set("group.id", &options.consumer_group)
        .set("enable.partition.eof", "true")
        .set("enable.auto.commit", "false")
        // positions are tracked by the caller; a missing offset must surface
        .set("auto.offset.reset", "error")
        .set("session.timeout.ms", "6000");

    if let Some(timeout) = options.session_timeout_ms {
        client_config.set("session.timeout.ms", timeout.to_string());
    }
    apply_security(&mut client_config, options);
    client_config
}

fn producer_config(options: &KafkaOptions) -> ClientConfig {
    let mut client_config = ClientConfig::new();
    client_config
        .set("bootstrap.servers", &options.bootstrap_servers)
        .set("message.timeout.ms", "5000");
    if let Some(timeout) = options.message_timeout_ms {
        client_config.set("message.timeout.ms", timeout.to_string());
    }
    apply_security(&mut client_config, options);
    client_config
}

fn apply_security(client_config: &mut ClientConfig, options: &KafkaOptions) {
    if let Some(security_protocol) = &options.security_protocol {
        client_config.set("security.protocol", security_protocol);
    }
    if let Some(sasl_mechanisms) = &options.sasl_mechanisms {
        client_config.set("sasl.mechanisms", sasl_mechanisms);
    }
    if let Some(sasl_username) = &options.sasl_username {
        client_config.set("sasl.username", sasl_username);
    }
    if let Some(sasl_password) = &options.sasl_password {
        client_config.set("sasl.password", sasl_password);
    }
    if let Some(ssl_ca_location) = &options.ssl_ca_location {
        client_config.set("ssl.ca.location", ssl_ca_location);
    }
}

fn unrecoverable(channel: &str, error: impl std::error::Error + Send + Sync + 'static) -> TransportError {
    TransportError::Unrecoverable {
        channel: channel.to_string(),
        source: Box::new(error),
    }
}

/// Broker-side and connectivity failures are worth retrying.
fn classify(channel: &str, error: KafkaError) -> TransportError {
    let transient = matches!(
        error.rdkafka_error_code(),
        Some(
            RDKafkaErrorCode::BrokerTransportFailure
                | RDKafkaErrorCode::AllBrokersDown
                | RDKafkaErrorCode::OperationTimedOut
                | RDKafkaErrorCode::RequestTimedOut
                | RDKafkaErrorCode::LeaderNotAvailable
                | RDKafkaErrorCode::NotLeaderForPartition
                | RDKafkaErrorCode::NetworkException
                | RDKafkaErrorCode::QueueFull
        )
    );
    if transient {
        TransportError::Transient {
            channel: channel.to_string(),
            reason: error.to_string(),
        }
    } else {
        unrecoverable(channel, error)
    }
}

fn is_offset_out_of_range(error: &KafkaError) -> bool {
    matches!(
        error.rdkafka_error_code(),
        Some(RDKafkaErrorCode::OffsetOutOfRange | RDKafkaErrorCode::AutoOffsetReset)
    )
}

fn to_message(message: &BorrowedMessage<'_>) -> Message {
    let arrival = message
        .timestamp()
        .to_millis()
        .and_then(DateTime::<Utc>::from_timestamp_millis)
        .unwrap_or_else(Utc::now);
    let key = message
        .key()
        .map(|k| String::from_utf8_lossy(k).into_owned())
        .unwrap_or_default();
    let payload = message
        .payload()
        .filter(|p| !p.is_empty())
        .map(|p| String::from_utf8_lossy(p).into_owned());
    Message::new(
        Key::of(key),
        Header::new(message.offset().to_string(), arrival),
        payload,
    )
}

impl KafkaSource {
    pub fn new(options: &KafkaOptions) -> Result<Self, TransportError> {
        let consumer_config = consumer_config(options);
        let metadata: BaseConsumer = consumer_config
            .create()
            .map_err(|e| unrecoverable(&options.bootstrap_servers, e))?;
        let producer: FutureProducer = producer_config(options)
            .create()
            .map_err(|e| unrecoverable(&options.bootstrap_servers, e))?;
        info!(bootstrap_servers = %options.bootstrap_servers, "created Kafka clients");

        Ok(Self {
            consumer_config,
            metadata: Arc::new(metadata),
            producer,
            readers: Mutex::new(HashMap::new()),
            fetch_timeout: Duration::from_millis(
                options.fetch_timeout_ms.unwrap_or(DEFAULT_FETCH_TIMEOUT_MS),
            ),
        })
    }

    /// Runs a blocking metadata call off the async workers.
    async fn blocking<T, F>(&self, channel: &str, call: F) -> Result<T, TransportError>
    where
        T: Send + 'static,
        F: FnOnce(&BaseConsumer) -> Result<T, KafkaError> + Send + 'static,
    {
        let metadata = self.metadata.clone();
        tokio::task::spawn_blocking(move || call(&metadata))
            .await
            .map_err(|e| unrecoverable(channel, e))?
            .map_err(|e| classify(channel, e))
    }

    async fn watermarks(&self, topic: &str, partition: i32) -> Result<(i64, i64), TransportError> {
        let owned_topic = topic.to_string();
        self.blocking(topic, move |consumer| {
            consumer.fetch_watermarks(&owned_topic, partition, METADATA_TIMEOUT)
        })
        .await
    }

    async fn reader(&self, topic: &str, partition: i32) -> Result<Arc<Mutex<PartitionReader>>, TransportError> {
        let mut readers = self.readers.lock().await;
        if let Some(reader) = readers.get(&(topic.to_string(), partition)) {
            return Ok(reader.clone());
        }
        let consumer: StreamConsumer = self
            .consumer_config
            .create()
            .map_err(|e| unrecoverable(topic, e))?;
        let reader = Arc::new(Mutex::new(PartitionReader {
            consumer,
            next_offset: None,
        }));
        readers.insert((topic.to_string(), partition), reader.clone());
        Ok(reader)
    }

    fn partition_of(channel: &str, position: &ShardPosition) -> Result<i32, TransportError> {
        position
            .shard_name()
            .parse()
            .map_err(|_| TransportError::ShardNotFound {
                channel: channel.to_string(),
                shard: position.shard_name().to_string(),
            })
    }
}

#[async_trait]
impl ChannelTransport for KafkaSource {
    async fn list_shards(
        &self,
        channel: &str,
        _next_token: Option<String>,
    ) -> Result<ShardPage, TransportError> {
        let topic = channel.to_string();
        let partitions = self
            .blocking(channel, move |consumer| {
                let metadata = consumer.fetch_metadata(Some(&topic), METADATA_TIMEOUT)?;
                Ok(metadata
                    .topics()
                    .iter()
                    .filter(|t| t.name() == topic)
                    .flat_map(|t| t.partitions().iter().map(|p| p.id()))
                    .collect::<Vec<_>>())
            })
            .await?;

        if partitions.is_empty() {
            return Err(TransportError::Unrecoverable {
                channel: channel.to_string(),
                source: format!("topic {} has no partitions", channel).into(),
            });
        }
        Ok(ShardPage {
            shards: partitions
                .into_iter()
                .map(|id| ShardDescriptor {
                    name: id.to_string(),
                    open: true,
                })
                .collect(),
            next_token: None,
        })
    }

    async fn get_iterator(
        &self,
        channel: &str,
        position: &ShardPosition,
    ) -> Result<ShardIterator, TransportError> {
        let partition = Self::partition_of(channel, position)?;
        let (low, high) = self.watermarks(channel, partition).await?;

        let offset = match position.start_from() {
            StartFrom::Horizon => low,
            StartFrom::Head => high,
            StartFrom::AtPosition => {
                let next = position
                    .position()
                    .parse::<i64>()
                    .map(|offset| offset + 1)
                    .map_err(|_| TransportError::StalePosition {
                        shard: position.shard_name().to_string(),
                        position: position.position().to_string(),
                        reason: "not an offset".to_string(),
                    })?;
                if next < low || next > high {
                    return Err(TransportError::StalePosition {
                        shard: position.shard_name().to_string(),
                        position: position.position().to_string(),
                        reason: format!("offset outside of retained range {}..{}", low, high),
                    });
                }
                next
            }
            StartFrom::AtTimestamp => {
                let millis = position.timestamp().unwrap_or_else(Utc::now).timestamp_millis();
                let topic = channel.to_string();
                let found = self
                    .blocking(channel, move |consumer| {
                        let mut request = TopicPartitionList::new();
                        request.add_partition_offset(&topic, partition, Offset::Offset(millis))?;
                        let offsets = consumer.offsets_for_times(request, METADATA_TIMEOUT)?;
                        Ok(offsets
                            .find_partition(&topic, partition)
                            .and_then(|e| e.offset().to_raw()))
                    })
                    .await?;
                found.filter(|offset| *offset >= 0).unwrap_or(high)
            }
        };

        Ok(PartitionOffset {
            topic: channel.to_string(),
            partition,
            offset,
        }
        .to_iterator())
    }

    async fn fetch_next(
        &self,
        iterator: &ShardIterator,
        limit: usize,
    ) -> Result<FetchResponse, TransportError> {
        let start = PartitionOffset::parse(iterator).ok_or_else(|| TransportError::Unrecoverable {
            channel: "kafka".to_string(),
            source: format!("malformed iterator {}", iterator.0).into(),
        })?;
        let topic = start.topic.as_str();
        let handle = self.reader(topic, start.partition).await?;
        let mut reader = handle.lock().await;

        if reader.next_offset != Some(start.offset) {
            let mut assignment = TopicPartitionList::new();
            assignment
                .add_partition_offset(topic, start.partition, Offset::Offset(start.offset))
                .map_err(|e| classify(topic, e))?;
            reader
                .consumer
                .assign(&assignment)
                .map_err(|e| classify(topic, e))?;
            debug!(topic, partition = start.partition, offset = start.offset, "assigned partition");
        }

        let mut records = Vec::new();
        let mut next_offset = start.offset;
        let mut caught_up = false;
        let deadline = Instant::now() + self.fetch_timeout;
        while records.len() < limit {
            let wait = if records.is_empty() {
                deadline.saturating_duration_since(Instant::now())
            } else {
                LINGER
            };
            let received = match timeout(wait, reader.consumer.recv()).await {
                Ok(Ok(message)) => Received::Record(to_message(&message), message.offset()),
                Ok(Err(KafkaError::PartitionEOF(_))) => Received::EndOfPartition,
                Ok(Err(e)) => Received::Failed(e),
                Err(_) => Received::Idle,
            };
            match received {
                Received::Record(message, offset) => {
                    next_offset = offset + 1;
                    records.push(message);
                }
                Received::EndOfPartition => {
                    caught_up = true;
                    break;
                }
                Received::Idle => {
                    // nothing arrived before the deadline, the partition is idle
                    caught_up = records.is_empty();
                    break;
                }
                Received::Failed(e) => {
                    reader.next_offset = None;
                    if is_offset_out_of_range(&e) {
                        return Err(TransportError::StalePosition {
                            shard: start.partition.to_string(),
                            position: start.offset.to_string(),
                            reason: e.to_string(),
                        });
                    }
                    warn!(topic, partition = start.partition, "error receiving message: {}", e);
                    return Err(classify(topic, e));
                }
            }
        }
        reader.next_offset = Some(next_offset);

        let millis_behind = if caught_up {
            0
        } else {
            records
                .last()
                .map(|m| (Utc::now() - m.header().arrival_timestamp).num_milliseconds().max(1) as u64)
                .unwrap_or(1)
        };
        Ok(FetchResponse {
            records,
            next_iterator: Some(
                PartitionOffset {
                    offset: next_offset,
                    ..start
                }
                .to_iterator(),
            ),
            millis_behind,
        })
    }

    async fn publish_batch(
        &self,
        channel: &str,
        records: &[Message],
    ) -> Result<PublishBatchResponse, TransportError> {
        let mut results = vec![RecordResult::success(); records.len()];
        let mut deliveries = Vec::with_capacity(records.len());
        for (index, message) in records.iter().enumerate() {
            let mut record = FutureRecord::<str, str>::to(channel).key(message.key().partition_key());
            if let Some(payload) = message.payload() {
                record = record.payload(payload);
            }
            match self.producer.send_result(record) {
                Ok(delivery) => deliveries.push((index, delivery)),
                Err((KafkaError::MessageProduction(RDKafkaErrorCode::QueueFull), _)) => {
                    results[index] = RecordResult::failure(THROTTLED_ERROR_CODE, "producer queue is full");
                }
                Err((e, _)) => {
                    results[index] = RecordResult::failure(INTERNAL_FAILURE_ERROR_CODE, e.to_string());
                }
            }
        }

        let (indices, futures): (Vec<usize>, Vec<_>) = deliveries.into_iter().unzip();
        for (index, outcome) in indices.into_iter().zip(join_all(futures).await) {
            results[index] = match outcome {
                Ok(Ok(_)) => RecordResult::success(),
                Ok(Err((e, _))) => {
                    let code = match e.rdkafka_error_code() {
                        Some(RDKafkaErrorCode::QueueFull) => THROTTLED_ERROR_CODE.to_string(),
                        Some(RDKafkaErrorCode::MessageTimedOut)
                        | Some(RDKafkaErrorCode::RequestTimedOut)
                        | Some(RDKafkaErrorCode::NotEnoughReplicas) => {
                            INTERNAL_FAILURE_ERROR_CODE.to_string()
                        }
                        Some(code) => format!("{:?}", code),
                        None => "Unknown".to_string(),
                    };
                    RecordResult::failure(code, e.to_string())
                }
                Err(_) => RecordResult::failure(INTERNAL_FAILURE_ERROR_CODE, "delivery cancelled"),
            };
        }
        Ok(PublishBatchResponse { results })
    }
}
