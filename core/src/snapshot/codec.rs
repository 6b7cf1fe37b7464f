//! Snapshot file format.
//!
//! A snapshot is a ZIP container with a single deflated entry named `data`,
//! holding one JSON document:
//!
//! ```json
//! {
//!   "startSequenceNumbers": [{"shard": "shard-0", "sequenceNumber": "49590..."}],
//!   "data": [{"key-1": "payload"}, {"key-2": "payload"}]
//! }
//! ```
//!
//! Both directions stream: entries are written one at a time while iterating
//! the working set, and read one at a time straight into it, so a snapshot
//! never has to fit into memory as a whole.

use serde::de::{DeserializeSeed, IgnoredAny, MapAccess, SeqAccess, Visitor};
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Seek, Write};
use std::path::Path;
use tracing::warn;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use crate::channel::{ChannelPosition, ShardPosition, StartFrom};
use crate::errors::SnapshotError;
use crate::state::WorkingSet;

pub const ZIP_ENTRY: &str = "data";
const START_SEQUENCE_NUMBERS_FIELD: &str = "startSequenceNumbers";
const DATA_FIELD: &str = "data";
const HORIZON_SEQUENCE_NUMBER: &str = "0";

#[derive(Debug, Serialize, Deserialize)]
struct SequenceNumber {
    shard: String,
    #[serde(rename = "sequenceNumber", default)]
    sequence_number: String,
}

impl SequenceNumber {
    fn of(position: &ShardPosition) -> Self {
        let sequence_number = match position.start_from() {
            StartFrom::AtPosition => position.position().to_string(),
            _ => HORIZON_SEQUENCE_NUMBER.to_string(),
        };
        Self {
            shard: position.shard_name().to_string(),
            sequence_number,
        }
    }

    fn into_shard_position(self) -> ShardPosition {
        if self.sequence_number.is_empty() || self.sequence_number == HORIZON_SEQUENCE_NUMBER {
            ShardPosition::from_horizon(self.shard)
        } else {
            ShardPosition::from_position(self.shard, self.sequence_number)
        }
    }
}

/// What a decoded snapshot contributed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadedSnapshot {
    pub position: ChannelPosition,
    pub entries: usize,
}

/// Encodes `position` and all non-empty entries of `working_set`.
/// Returns the number of entries written.
pub fn write_snapshot<W: Write + Seek>(
    writer: W,
    position: &ChannelPosition,
    working_set: &dyn WorkingSet,
) -> io::Result<usize> {
    let mut zip = ZipWriter::new(writer);
    zip.start_file(
        ZIP_ENTRY,
        SimpleFileOptions::default().compression_method(CompressionMethod::Deflated),
    )?;

    let mut written = 0usize;
    {
        let mut out = BufWriter::new(&mut zip);
        write!(out, "{{\"{}\":[", START_SEQUENCE_NUMBERS_FIELD)?;
        for (i, shard_position) in position.shard_positions().iter().enumerate() {
            if i > 0 {
                out.write_all(b",")?;
            }
            serde_json::to_writer(&mut out, &SequenceNumber::of(shard_position))?;
        }
        write!(out, "],\"{}\":[", DATA_FIELD)?;

        working_set.for_each(&mut |key, value| {
            if value.is_empty() {
                return Ok(());
            }
            if written > 0 {
                out.write_all(b",")?;
            }
            out.write_all(b"{")?;
            serde_json::to_writer(&mut out, key)?;
            out.write_all(b":")?;
            serde_json::to_writer(&mut out, value)?;
            out.write_all(b"}")?;
            written += 1;
            Ok(())
        })?;

        out.write_all(b"]}")?;
        out.flush()?;
    }
    zip.finish()?;
    Ok(written)
}

/// Decodes a snapshot into `working_set` and returns its channel position.
/// Field order inside the document does not matter.
pub fn read_snapshot<R: Read + Seek>(
    name: &str,
    reader: R,
    working_set: &dyn WorkingSet,
) -> Result<LoadedSnapshot, SnapshotError> {
    let corrupt = |reason: String| SnapshotError::Corrupt {
        name: name.to_string(),
        reason,
    };

    let mut archive = ZipArchive::new(reader).map_err(|e| corrupt(e.to_string()))?;
    if archive.is_empty() {
        return Err(corrupt("archive has no entries".to_string()));
    }
    if archive.len() > 1 {
        warn!(snapshot = name, entries = archive.len(), "snapshot has more than one entry, reading the first");
    }
    let entry = archive.by_index(0).map_err(|e| corrupt(e.to_string()))?;

    let mut deserializer = serde_json::Deserializer::from_reader(BufReader::new(entry));
    let loaded = SnapshotSeed { working_set }
        .deserialize(&mut deserializer)
        .map_err(|e| corrupt(e.to_string()))?;
    deserializer.end().map_err(|e| corrupt(e.to_string()))?;
    Ok(loaded)
}

/// Writes a snapshot file at `path`. A partially written file is removed.
pub fn write_snapshot_file(
    path: &Path,
    position: &ChannelPosition,
    working_set: &dyn WorkingSet,
) -> Result<usize, SnapshotError> {
    let result = File::create(path)
        .and_then(|file| write_snapshot(BufWriter::new(file), position, working_set));
    result.map_err(|e| {
        if path.exists() {
            if let Err(remove_error) = std::fs::remove_file(path) {
                warn!(path = %path.display(), "failed to remove partial snapshot: {}", remove_error);
            }
        }
        SnapshotError::Write {
            name: file_name(path),
            reason: e.to_string(),
        }
    })
}

pub fn read_snapshot_file(
    path: &Path,
    working_set: &dyn WorkingSet,
) -> Result<LoadedSnapshot, SnapshotError> {
    let name = file_name(path);
    let file = File::open(path).map_err(|e| SnapshotError::Load {
        name: name.clone(),
        reason: e.to_string(),
    })?;
    read_snapshot(&name, BufReader::new(file), working_set)
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

struct SnapshotSeed<'a> {
    working_set: &'a dyn WorkingSet,
}

impl<'de> DeserializeSeed<'de> for SnapshotSeed<'_> {
    type Value = LoadedSnapshot;

    fn deserialize<D: Deserializer<'de>>(self, deserializer: D) -> Result<Self::Value, D::Error> {
        deserializer.deserialize_map(self)
    }
}

impl<'de> Visitor<'de> for SnapshotSeed<'_> {
    type Value = LoadedSnapshot;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a snapshot document")
    }

    fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Self::Value, A::Error> {
        let mut position = ChannelPosition::default();
        let mut entries = 0;
        while let Some(field) = map.next_key::<String>()? {
            match field.as_str() {
                START_SEQUENCE_NUMBERS_FIELD => {
                    let sequence_numbers: Vec<SequenceNumber> = map.next_value()?;
                    position = sequence_numbers.into_iter().map(SequenceNumber::into_shard_position).collect();
                }
                DATA_FIELD => {
                    entries += map.next_value_seed(DataSeed {
                        working_set: self.working_set,
                    })?;
                }
                _ => {
                    map.next_value::<IgnoredAny>()?;
                }
            }
        }
        Ok(LoadedSnapshot { position, entries })
    }
}

/// The `data` array.
struct DataSeed<'a> {
    working_set: &'a dyn WorkingSet,
}

impl<'de> DeserializeSeed<'de> for DataSeed<'_> {
    type Value = usize;

    fn deserialize<D: Deserializer<'de>>(self, deserializer: D) -> Result<Self::Value, D::Error> {
        deserializer.deserialize_seq(self)
    }
}

impl<'de> Visitor<'de> for DataSeed<'_> {
    type Value = usize;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("an array of single-entry objects")
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Self::Value, A::Error> {
        let mut entries = 0;
        while let Some(count) = seq.next_element_seed(EntrySeed {
            working_set: self.working_set,
        })? {
            entries += count;
        }
        Ok(entries)
    }
}

/// One `{"key": value}` object of the `data` array.
struct EntrySeed<'a> {
    working_set: &'a dyn WorkingSet,
}

impl<'de> DeserializeSeed<'de> for EntrySeed<'_> {
    type Value = usize;

    fn deserialize<D: Deserializer<'de>>(self, deserializer: D) -> Result<Self::Value, D::Error> {
        deserializer.deserialize_map(self)
    }
}

impl<'de> Visitor<'de> for EntrySeed<'_> {
    type Value = usize;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a key/value object")
    }

    fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Self::Value, A::Error> {
        let mut entries = 0;
        while let Some(key) = map.next_key::<String>()? {
            let value = match map.next_value::<serde_json::Value>()? {
                serde_json::Value::Null => continue,
                serde_json::Value::String(s) if s.is_empty() => continue,
                serde_json::Value::String(s) => s,
                other => other.to_string(),
            };
            self.working_set.put(&key, value);
            entries += 1;
        }
        Ok(entries)
    }
}
