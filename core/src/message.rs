use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::time::Duration;

/// The key of a message.
///
/// The partition key selects the shard a message is written to; the
/// compaction key identifies the entity a message updates. Both are the same
/// unless set explicitly.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Key {
    partition_key: String,
    compaction_key: String,
}

impl Key {
    pub fn of(key: impl Into<String>) -> Self {
        let key = key.into();
        Self {
            partition_key: key.clone(),
            compaction_key: key,
        }
    }

    pub fn with_compaction_key(
        partition_key: impl Into<String>,
        compaction_key: impl Into<String>,
    ) -> Self {
        Self {
            partition_key: partition_key.into(),
            compaction_key: compaction_key.into(),
        }
    }

    pub fn partition_key(&self) -> &str {
        &self.partition_key
    }

    pub fn compaction_key(&self) -> &str {
        &self.compaction_key
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Header {
    /// Transport token of the record, used to resume after it.
    pub sequence_number: Option<String>,
    pub arrival_timestamp: DateTime<Utc>,
    pub duration_behind: Option<Duration>,
    pub attributes: BTreeMap<String, String>,
}

impl Header {
    pub fn new(sequence_number: impl Into<String>, arrival_timestamp: DateTime<Utc>) -> Self {
        Self {
            sequence_number: Some(sequence_number.into()),
            arrival_timestamp,
            duration_behind: None,
            attributes: BTreeMap::new(),
        }
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }
}

impl Default for Header {
    fn default() -> Self {
        Self {
            sequence_number: None,
            arrival_timestamp: Utc::now(),
            duration_behind: None,
            attributes: BTreeMap::new(),
        }
    }
}

/// A message read from or written to a channel. A message without payload
/// is a tombstone for its compaction key.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    key: Key,
    header: Header,
    payload: Option<String>,
}

impl Message {
    pub fn new(key: Key, header: Header, payload: Option<String>) -> Self {
        Self {
            key,
            header,
            payload,
        }
    }

    /// A message to be published; the header is filled in by the transport.
    pub fn outgoing(key: impl Into<String>, payload: Option<String>) -> Self {
        Self::new(Key::of(key), Header::default(), payload)
    }

    pub fn tombstone(key: Key, header: Header) -> Self {
        Self::new(key, header, None)
    }

    pub fn key(&self) -> &Key {
        &self.key
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    pub fn header_mut(&mut self) -> &mut Header {
        &mut self.header
    }

    pub fn payload(&self) -> Option<&str> {
        self.payload.as_deref()
    }

    pub fn into_payload(self) -> Option<String> {
        self.payload
    }

    pub fn is_tombstone(&self) -> bool {
        self.payload.is_none()
    }
}
