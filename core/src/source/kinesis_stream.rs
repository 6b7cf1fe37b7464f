use async_trait::async_trait;
use aws_sdk_kinesis::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_kinesis::primitives::{Blob, DateTime as AwsDateTime};
use aws_sdk_kinesis::types::{PutRecordsRequestEntry, Record, ShardIteratorType};
use aws_sdk_kinesis::{Client, Config};
use chrono::{DateTime, Utc};
use tracing::debug;

use crate::aws::load_sdk_config;
use crate::channel::{ShardPosition, StartFrom};
use crate::config::AwsOptions;
use crate::errors::TransportError;
use crate::message::{Header, Key, Message};
use crate::source::{
    ChannelTransport, FetchResponse, PublishBatchResponse, RecordResult, ShardDescriptor,
    ShardIterator, ShardPage,
};

/// GetRecords accepts at most this many records per call.
const MAX_RECORDS_PER_FETCH: usize = 10_000;

/// Kinesis data streams as channels.
///
/// Record data is the payload and the partition key is the message key.
/// Empty data marks a tombstone.
pub struct KinesisStreamSource {
    client: Client,
}

impl KinesisStreamSource {
    pub async fn new(options: &AwsOptions) -> Self {
        let sdk_config = load_sdk_config(options).await;
        Self {
            client: Client::new(&sdk_config),
        }
    }

    pub fn from_conf(config: Config) -> Self {
        Self {
            client: Client::from_conf(config),
        }
    }
}

/// Maps an SDK failure to a transport error. Throttling and connectivity
/// problems are transient, the rest is unrecoverable.
fn classify<E, R>(channel: &str, error: SdkError<E, R>) -> TransportError
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
    R: std::fmt::Debug + Send + Sync + 'static,
{
    let code = error.code().unwrap_or_default().to_string();
    let transient = matches!(
        error,
        SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) | SdkError::ResponseError(_)
    ) || matches!(
        code.as_str(),
        "ProvisionedThroughputExceededException"
            | "LimitExceededException"
            | "KMSThrottlingException"
            | "InternalFailure"
    );

    if transient {
        TransportError::Transient {
            channel: channel.to_string(),
            reason: DisplayErrorContext(&error).to_string(),
        }
    } else {
        TransportError::Unrecoverable {
            channel: channel.to_string(),
            source: DisplayErrorContext(&error).to_string().into(),
        }
    }
}

fn to_aws_timestamp(timestamp: DateTime<Utc>) -> AwsDateTime {
    AwsDateTime::from_millis(timestamp.timestamp_millis())
}

fn to_message(record: &Record) -> Message {
    let arrival = record
        .approximate_arrival_timestamp()
        .and_then(|t| DateTime::<Utc>::from_timestamp(t.secs(), t.subsec_nanos()))
        .unwrap_or_else(Utc::now);
    let data = record.data().as_ref();
    let payload = (!data.is_empty()).then(|| String::from_utf8_lossy(data).into_owned());
    Message::new(
        Key::of(record.partition_key()),
        Header::new(record.sequence_number(), arrival),
        payload,
    )
}

#[async_trait]
impl ChannelTransport for KinesisStreamSource {
    async fn list_shards(
        &self,
        channel: &str,
        next_token: Option<String>,
    ) -> Result<ShardPage, TransportError> {
        // the stream name must not be set together with a continuation token
        let request = match next_token {
            Some(token) => self.client.list_shards().next_token(token),
            None => self.client.list_shards().stream_name(channel),
        };
        let response = request.send().await.map_err(|e| classify(channel, e))?;

        let shards = response
            .shards()
            .iter()
            .map(|shard| ShardDescriptor {
                name: shard.shard_id().to_string(),
                open: shard
                    .sequence_number_range()
                    .and_then(|range| range.ending_sequence_number())
                    .is_none(),
            })
            .collect();
        Ok(ShardPage {
            shards,
            next_token: response.next_token().map(str::to_string),
        })
    }

    async fn get_iterator(
        &self,
        channel: &str,
        position: &ShardPosition,
    ) -> Result<ShardIterator, TransportError> {
        let request = self
            .client
            .get_shard_iterator()
            .stream_name(channel)
            .shard_id(position.shard_name());
        let request = match position.start_from() {
            StartFrom::Horizon => request.shard_iterator_type(ShardIteratorType::TrimHorizon),
            StartFrom::Head => request.shard_iterator_type(ShardIteratorType::Latest),
            StartFrom::AtPosition => request
                .shard_iterator_type(ShardIteratorType::AfterSequenceNumber)
                .starting_sequence_number(position.position()),
            StartFrom::AtTimestamp => request
                .shard_iterator_type(ShardIteratorType::AtTimestamp)
                .timestamp(to_aws_timestamp(position.timestamp().unwrap_or_else(Utc::now))),
        };

        let response = request.send().await.map_err(|e| {
            let invalid_position = position.start_from() == StartFrom::AtPosition
                && e.as_service_error()
                    .is_some_and(|se| se.is_invalid_argument_exception());
            if invalid_position {
                TransportError::StalePosition {
                    shard: position.shard_name().to_string(),
                    position: position.position().to_string(),
                    reason: DisplayErrorContext(&e).to_string(),
                }
            } else {
                classify(channel, e)
            }
        })?;

        response
            .shard_iterator()
            .map(|it| ShardIterator(it.to_string()))
            .ok_or_else(|| TransportError::Unrecoverable {
                channel: channel.to_string(),
                source: format!("no iterator returned for {}", position).into(),
            })
    }

    async fn fetch_next(
        &self,
        iterator: &ShardIterator,
        limit: usize,
    ) -> Result<FetchResponse, TransportError> {
        let limit = limit.clamp(1, MAX_RECORDS_PER_FETCH) as i32;
        let response = self
            .client
            .get_records()
            .shard_iterator(&iterator.0)
            .limit(limit)
            .send()
            .await
            .map_err(|e| {
                if e.as_service_error()
                    .is_some_and(|se| se.is_expired_iterator_exception())
                {
                    TransportError::StalePosition {
                        shard: "unknown".to_string(),
                        position: iterator.0.clone(),
                        reason: "shard iterator expired".to_string(),
                    }
                } else {
                    classify("kinesis", e)
                }
            })?;

        let records: Vec<Message> = response.records().iter().map(to_message).collect();
        let millis_behind = response.millis_behind_latest().unwrap_or_default().max(0) as u64;
        debug!(records = records.len(), millis_behind, "fetched kinesis records");
        Ok(FetchResponse {
            records,
            next_iterator: response
                .next_shard_iterator()
                .map(|it| ShardIterator(it.to_string())),
            millis_behind,
        })
    }

    async fn publish_batch(
        &self,
        channel: &str,
        records: &[Message],
    ) -> Result<PublishBatchResponse, TransportError> {
        let entries = records
            .iter()
            .map(|message| {
                PutRecordsRequestEntry::builder()
                    .partition_key(message.key().partition_key())
                    .data(Blob::new(message.payload().unwrap_or_default().as_bytes()))
                    .build()
                    .map_err(|e| TransportError::Unrecoverable {
                        channel: channel.to_string(),
                        source: Box::new(e),
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let response = self
            .client
            .put_records()
            .stream_name(channel)
            .set_records(Some(entries))
            .send()
            .await
            .map_err(|e| classify(channel, e))?;

        let results = response
            .records()
            .iter()
            .map(|entry| match entry.error_code() {
                Some(code) => RecordResult::failure(code, entry.error_message().unwrap_or_default()),
                None => RecordResult::success(),
            })
            .collect();
        Ok(PublishBatchResponse { results })
    }
}
