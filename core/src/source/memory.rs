use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, VecDeque};
use std::hash::{Hash, Hasher};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::debug;

use crate::channel::{ShardPosition, StartFrom};
use crate::errors::TransportError;
use crate::message::{Header, Key, Message};
use crate::source::{
    ChannelTransport, FetchResponse, PublishBatchResponse, RecordResult, ShardDescriptor,
    ShardIterator, ShardPage,
};

/// How an injected fetch failure behaves.
#[derive(Debug, Clone)]
pub enum FetchFault {
    /// The next `n` fetches fail with a transient error.
    Transient(u32),
    /// Every fetch fails with an unrecoverable error.
    Unrecoverable(String),
    /// Every fetch hangs for the given duration before answering.
    Stall(Duration),
}

/// Scripted outcome of the next `publish_batch` call.
#[derive(Debug, Clone)]
pub enum PublishFault {
    /// The records at these batch indices fail with `code`.
    FailRecords { indices: Vec<usize>, code: String },
    /// The whole call fails with a transient error.
    Transient,
    /// All records are stored, but only the first `keep` results are returned.
    TruncateResults { keep: usize },
}

#[derive(Debug, Clone)]
struct StoredRecord {
    key: Key,
    payload: Option<String>,
    arrival: DateTime<Utc>,
}

#[derive(Debug)]
struct MemoryShard {
    name: String,
    open: bool,
    records: Vec<StoredRecord>,
    /// Records below this sequence number are gone.
    trimmed_before: usize,
}

#[derive(Debug, Default)]
struct ChannelState {
    shards: Vec<MemoryShard>,
    fetch_faults: HashMap<String, FetchFault>,
    publish_faults: VecDeque<PublishFault>,
    published_batches: Vec<Vec<Message>>,
    fetch_count: usize,
}

/// A channel held in memory. Supports every transport capability and a few
/// hooks to inject failures, which makes it the transport of choice for
/// tests and local runs.
///
/// Sequence numbers are record indices within their shard; iterators
/// encode the shard and the next index to read.
#[derive(Debug)]
pub struct InMemoryChannel {
    name: String,
    page_size: usize,
    shard_page_size: usize,
    state: Mutex<ChannelState>,
}

impl InMemoryChannel {
    pub fn new(name: impl Into<String>, shard_count: usize) -> Self {
        let shards = (0..shard_count)
            .map(|i| MemoryShard {
                name: format!("shard-{}", i),
                open: true,
                records: Vec::new(),
                trimmed_before: 0,
            })
            .collect();
        Self {
            name: name.into(),
            page_size: usize::MAX,
            shard_page_size: usize::MAX,
            state: Mutex::new(ChannelState {
                shards,
                ..Default::default()
            }),
        }
    }

    /// Limits the number of records returned per fetch.
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Limits the number of shards returned per discovery page.
    pub fn with_shard_page_size(mut self, shard_page_size: usize) -> Self {
        self.shard_page_size = shard_page_size.max(1);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn shard_names(&self) -> Vec<String> {
        self.state().shards.iter().map(|s| s.name.clone()).collect()
    }

    /// Appends a record to a shard and returns its sequence number.
    pub fn append(
        &self,
        shard: &str,
        key: &str,
        payload: Option<&str>,
        arrival: DateTime<Utc>,
    ) -> Result<String, TransportError> {
        let mut state = self.state();
        let shard = Self::shard_mut(&mut state, &self.name, shard)?;
        shard.records.push(StoredRecord {
            key: Key::of(key),
            payload: payload.map(str::to_string),
            arrival,
        });
        Ok((shard.records.len() - 1).to_string())
    }

    /// Marks a shard as closed: it is skipped by discovery and its iterator
    /// ends once all records are read.
    pub fn close_shard(&self, shard: &str) -> Result<(), TransportError> {
        let mut state = self.state();
        Self::shard_mut(&mut state, &self.name, shard)?.open = false;
        Ok(())
    }

    /// Drops all records of a shard below `sequence_number`, as retention would.
    pub fn trim(&self, shard: &str, sequence_number: usize) -> Result<(), TransportError> {
        let mut state = self.state();
        let shard = Self::shard_mut(&mut state, &self.name, shard)?;
        shard.trimmed_before = sequence_number.min(shard.records.len());
        Ok(())
    }

    pub fn inject_fetch_fault(&self, shard: &str, fault: FetchFault) {
        self.state().fetch_faults.insert(shard.to_string(), fault);
    }

    pub fn inject_publish_fault(&self, fault: PublishFault) {
        self.state().publish_faults.push_back(fault);
    }

    /// Every batch passed to `publish_batch`, in call order.
    pub fn published_batches(&self) -> Vec<Vec<Message>> {
        self.state().published_batches.clone()
    }

    pub fn fetch_count(&self) -> usize {
        self.state().fetch_count
    }

    /// All retained records of a shard.
    pub fn records(&self, shard: &str) -> Vec<Message> {
        let state = self.state();
        state
            .shards
            .iter()
            .find(|s| s.name == shard)
            .map(|s| {
                (s.trimmed_before..s.records.len())
                    .map(|i| to_message(i, &s.records[i]))
                    .collect()
            })
            .unwrap_or_default()
    }

    fn state(&self) -> MutexGuard<'_, ChannelState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn shard_mut<'a>(
        state: &'a mut ChannelState,
        channel: &str,
        shard: &str,
    ) -> Result<&'a mut MemoryShard, TransportError> {
        state
            .shards
            .iter_mut()
            .find(|s| s.name == shard)
            .ok_or_else(|| TransportError::ShardNotFound {
                channel: channel.to_string(),
                shard: shard.to_string(),
            })
    }

    fn check_channel(&self, channel: &str) -> Result<(), TransportError> {
        if channel == self.name {
            Ok(())
        } else {
            Err(TransportError::Unrecoverable {
                channel: channel.to_string(),
                source: format!("unknown channel, this is {}", self.name).into(),
            })
        }
    }

    fn parse_iterator(&self, iterator: &ShardIterator) -> Result<(String, usize), TransportError> {
        let malformed = || TransportError::Unrecoverable {
            channel: self.name.clone(),
            source: format!("malformed iterator {}", iterator.0).into(),
        };
        let (shard, next) = iterator.0.rsplit_once('/').ok_or_else(malformed)?;
        let next = next.parse::<usize>().map_err(|_| malformed())?;
        Ok((shard.to_string(), next))
    }

    /// Resolves the fault injected for a shard, consuming transient ones.
    fn take_fetch_fault(&self, shard: &str) -> Option<FetchFault> {
        let mut state = self.state();
        match state.fetch_faults.get_mut(shard) {
            Some(FetchFault::Transient(remaining)) => {
                if *remaining == 0 {
                    state.fetch_faults.remove(shard);
                    return None;
                }
                *remaining -= 1;
                Some(FetchFault::Transient(*remaining + 1))
            }
            Some(fault) => Some(fault.clone()),
            None => None,
        }
    }

    fn partition_for(&self, state: &ChannelState, key: &Key) -> Option<usize> {
        let open: Vec<usize> = state
            .shards
            .iter()
            .enumerate()
            .filter(|(_, s)| s.open)
            .map(|(i, _)| i)
            .collect();
        if open.is_empty() {
            return None;
        }
        let mut hasher = DefaultHasher::new();
        key.partition_key().hash(&mut hasher);
        Some(open[(hasher.finish() % open.len() as u64) as usize])
    }
}

fn to_message(index: usize, record: &StoredRecord) -> Message {
    Message::new(
        record.key.clone(),
        Header::new(index.to_string(), record.arrival),
        record.payload.clone(),
    )
}

#[async_trait]
impl ChannelTransport for InMemoryChannel {
    async fn list_shards(
        &self,
        channel: &str,
        next_token: Option<String>,
    ) -> Result<ShardPage, TransportError> {
        self.check_channel(channel)?;
        let offset = match next_token {
            Some(token) => token.parse::<usize>().map_err(|_| TransportError::Unrecoverable {
                channel: channel.to_string(),
                source: format!("invalid shard page token {}", token).into(),
            })?,
            None => 0,
        };

        let state = self.state();
        let shards: Vec<ShardDescriptor> = state
            .shards
            .iter()
            .skip(offset)
            .take(self.shard_page_size)
            .map(|s| ShardDescriptor {
                name: s.name.clone(),
                open: s.open,
            })
            .collect();
        let consumed = offset + shards.len();
        let next_token = (consumed < state.shards.len()).then(|| consumed.to_string());
        Ok(ShardPage { shards, next_token })
    }

    async fn get_iterator(
        &self,
        channel: &str,
        position: &ShardPosition,
    ) -> Result<ShardIterator, TransportError> {
        self.check_channel(channel)?;
        let mut state = self.state();
        let shard = Self::shard_mut(&mut state, channel, position.shard_name())?;

        let next = match position.start_from() {
            StartFrom::Horizon => shard.trimmed_before,
            StartFrom::Head => shard.records.len(),
            StartFrom::AtPosition => {
                let stale = |reason: &str| TransportError::StalePosition {
                    shard: shard.name.clone(),
                    position: position.position().to_string(),
                    reason: reason.to_string(),
                };
                let sequence = position
                    .position()
                    .parse::<usize>()
                    .map_err(|_| stale("not a sequence number of this channel"))?;
                if sequence < shard.trimmed_before {
                    return Err(stale("record has been trimmed"));
                }
                if sequence >= shard.records.len() {
                    return Err(stale("sequence number does not exist"));
                }
                sequence + 1
            }
            StartFrom::AtTimestamp => {
                let timestamp = position.timestamp().unwrap_or_else(Utc::now);
                (shard.trimmed_before..shard.records.len())
                    .find(|&i| shard.records[i].arrival >= timestamp)
                    .unwrap_or(shard.records.len())
            }
        };
        Ok(ShardIterator(format!("{}/{}", shard.name, next)))
    }

    async fn fetch_next(
        &self,
        iterator: &ShardIterator,
        limit: usize,
    ) -> Result<FetchResponse, TransportError> {
        let (shard_name, next) = self.parse_iterator(iterator)?;
        self.state().fetch_count += 1;

        match self.take_fetch_fault(&shard_name) {
            Some(FetchFault::Transient(_)) => {
                return Err(TransportError::Transient {
                    channel: self.name.clone(),
                    reason: format!("injected fault on {}", shard_name),
                });
            }
            Some(FetchFault::Unrecoverable(reason)) => {
                return Err(TransportError::Unrecoverable {
                    channel: self.name.clone(),
                    source: reason.into(),
                });
            }
            Some(FetchFault::Stall(duration)) => tokio::time::sleep(duration).await,
            None => {}
        }

        let mut state = self.state();
        let shard = Self::shard_mut(&mut state, &self.name, &shard_name)?;
        if next < shard.trimmed_before {
            return Err(TransportError::StalePosition {
                shard: shard_name,
                position: next.to_string(),
                reason: "iterator points at trimmed records".to_string(),
            });
        }

        let end = shard
            .records
            .len()
            .min(next.saturating_add(limit.min(self.page_size)));
        let records: Vec<Message> = (next..end)
            .map(|i| to_message(i, &shard.records[i]))
            .collect();

        let millis_behind = match (records.last(), shard.records.last()) {
            (Some(last), Some(newest)) if end < shard.records.len() => {
                (newest.arrival - last.header().arrival_timestamp)
                    .num_milliseconds()
                    .max(1) as u64
            }
            (None, Some(newest)) if end < shard.records.len() => {
                (Utc::now() - newest.arrival).num_milliseconds().max(1) as u64
            }
            _ => 0,
        };

        let next_iterator = if !shard.open && end >= shard.records.len() {
            None
        } else {
            Some(ShardIterator(format!("{}/{}", shard_name, end)))
        };

        debug!(
            shard = %shard_name,
            records = records.len(),
            millis_behind,
            "fetched page from in-memory channel"
        );
        Ok(FetchResponse {
            records,
            next_iterator,
            millis_behind,
        })
    }

    async fn publish_batch(
        &self,
        channel: &str,
        records: &[Message],
    ) -> Result<PublishBatchResponse, TransportError> {
        self.check_channel(channel)?;
        let mut state = self.state();
        state.published_batches.push(records.to_vec());
        let mut truncate_to = None;

        let failing = match state.publish_faults.pop_front() {
            Some(PublishFault::Transient) => {
                return Err(TransportError::Transient {
                    channel: channel.to_string(),
                    reason: "injected publish fault".to_string(),
                });
            }
            Some(PublishFault::FailRecords { indices, code }) => Some((indices, code)),
            Some(PublishFault::TruncateResults { keep }) => {
                truncate_to = Some(keep);
                None
            }
            None => None,
        };

        let now = Utc::now();
        let mut results = Vec::with_capacity(records.len());
        for (i, record) in records.iter().enumerate() {
            if let Some((indices, code)) = &failing {
                if indices.contains(&i) {
                    results.push(RecordResult::failure(code.clone(), "injected record failure"));
                    continue;
                }
            }
            let Some(target) = self.partition_for(&state, record.key()) else {
                results.push(RecordResult::failure(
                    "ResourceNotFoundException",
                    "channel has no open shard",
                ));
                continue;
            };
            state.shards[target].records.push(StoredRecord {
                key: record.key().clone(),
                payload: record.payload().map(str::to_string),
                arrival: now,
            });
            results.push(RecordResult::success());
        }
        if let Some(keep) = truncate_to {
            results.truncate(keep);
        }
        Ok(PublishBatchResponse { results })
    }
}
