use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Where a shard reader starts reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StartFrom {
    /// Before the first record still retained by the shard.
    Horizon,
    /// Only records arriving after the iterator was created.
    Head,
    /// Directly after the record identified by the position token.
    AtPosition,
    /// The first record that arrived at or after the timestamp.
    AtTimestamp,
}

/// The read cursor of a single shard.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct ShardPosition {
    shard_name: String,
    start_from: StartFrom,
    position: String,
    timestamp: Option<DateTime<Utc>>,
}

impl ShardPosition {
    pub fn from_horizon(shard_name: impl Into<String>) -> Self {
        Self {
            shard_name: shard_name.into(),
            start_from: StartFrom::Horizon,
            position: String::new(),
            timestamp: None,
        }
    }

    pub fn from_head(shard_name: impl Into<String>) -> Self {
        Self {
            shard_name: shard_name.into(),
            start_from: StartFrom::Head,
            position: String::new(),
            timestamp: None,
        }
    }

    /// An empty position is the same as the horizon.
    pub fn from_position(shard_name: impl Into<String>, position: impl Into<String>) -> Self {
        let position = position.into();
        if position.is_empty() {
            return Self::from_horizon(shard_name);
        }
        Self {
            shard_name: shard_name.into(),
            start_from: StartFrom::AtPosition,
            position,
            timestamp: None,
        }
    }

    pub fn from_timestamp(shard_name: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            shard_name: shard_name.into(),
            start_from: StartFrom::AtTimestamp,
            position: String::new(),
            timestamp: Some(timestamp),
        }
    }

    /// A position that also remembers the arrival time of the record it points at.
    pub fn from_position_and_timestamp(
        shard_name: impl Into<String>,
        position: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        let mut shard_position = Self::from_position(shard_name, position);
        shard_position.timestamp = Some(timestamp);
        shard_position
    }

    pub fn shard_name(&self) -> &str {
        &self.shard_name
    }

    pub fn start_from(&self) -> StartFrom {
        self.start_from
    }

    pub fn position(&self) -> &str {
        &self.position
    }

    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        self.timestamp
    }

    pub fn is_horizon(&self) -> bool {
        self.start_from == StartFrom::Horizon
    }
}

impl fmt::Display for ShardPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.start_from {
            StartFrom::Horizon => write!(f, "{}@horizon", self.shard_name),
            StartFrom::Head => write!(f, "{}@head", self.shard_name),
            StartFrom::AtPosition => write!(f, "{}@{}", self.shard_name, self.position),
            StartFrom::AtTimestamp => match self.timestamp {
                Some(ts) => write!(f, "{}@{}", self.shard_name, ts.to_rfc3339()),
                None => write!(f, "{}@timestamp", self.shard_name),
            },
        }
    }
}

/// The read cursors of all shards of a channel.
///
/// Shards keep the order in which they were first added. A shard without an
/// entry is read from the horizon.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ChannelPosition {
    shard_positions: Vec<ShardPosition>,
}

impl ChannelPosition {
    pub fn from_horizon() -> Self {
        Self::default()
    }

    /// Builds a position from shard positions. A later entry for the same
    /// shard replaces an earlier one.
    pub fn channel_position(shard_positions: impl IntoIterator<Item = ShardPosition>) -> Self {
        let mut channel_position = Self::default();
        for shard_position in shard_positions {
            channel_position.upsert(shard_position);
        }
        channel_position
    }

    /// Merges positions, last writer wins per shard in sequence order.
    pub fn merge<'a>(positions: impl IntoIterator<Item = &'a ChannelPosition>) -> Self {
        let mut merged = Self::default();
        for position in positions {
            for shard_position in &position.shard_positions {
                merged.upsert(shard_position.clone());
            }
        }
        merged
    }

    pub fn merge_shard(&self, shard_position: ShardPosition) -> Self {
        let mut merged = self.clone();
        merged.upsert(shard_position);
        merged
    }

    pub fn shards(&self) -> impl Iterator<Item = &str> {
        self.shard_positions.iter().map(|p| p.shard_name())
    }

    pub fn shard_positions(&self) -> &[ShardPosition] {
        &self.shard_positions
    }

    pub fn position_of(&self, shard_name: &str) -> ShardPosition {
        self.shard_positions
            .iter()
            .find(|p| p.shard_name() == shard_name)
            .cloned()
            .unwrap_or_else(|| ShardPosition::from_horizon(shard_name))
    }

    pub fn len(&self) -> usize {
        self.shard_positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shard_positions.is_empty()
    }

    fn upsert(&mut self, shard_position: ShardPosition) {
        match self
            .shard_positions
            .iter_mut()
            .find(|p| p.shard_name() == shard_position.shard_name())
        {
            Some(existing) => *existing = shard_position,
            None => self.shard_positions.push(shard_position),
        }
    }
}

// Order only matters for iteration, not for equality.
impl PartialEq for ChannelPosition {
    fn eq(&self, other: &Self) -> bool {
        self.len() == other.len()
            && self
                .shard_positions
                .iter()
                .all(|p| other.shard_positions.contains(p))
    }
}

impl Eq for ChannelPosition {}

impl FromIterator<ShardPosition> for ChannelPosition {
    fn from_iter<T: IntoIterator<Item = ShardPosition>>(iter: T) -> Self {
        Self::channel_position(iter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn position(shard: &str, token: &str) -> ChannelPosition {
        ChannelPosition::channel_position([ShardPosition::from_position(shard, token)])
    }

    #[test]
    fn test_position_of_unknown_shard_is_horizon() {
        let channel_position = position("shard-a", "10");

        let unknown = channel_position.position_of("shard-x");
        assert_eq!(unknown, ShardPosition::from_horizon("shard-x"));
        assert!(unknown.is_horizon());
        assert!(ChannelPosition::from_horizon().position_of("any").is_horizon());
    }

    #[test]
    fn test_empty_position_is_horizon() {
        let shard_position = ShardPosition::from_position("shard-a", "");
        assert_eq!(shard_position.start_from(), StartFrom::Horizon);
    }

    #[test]
    fn test_merge_last_writer_wins() {
        let first = ChannelPosition::channel_position([
            ShardPosition::from_position("a", "1"),
            ShardPosition::from_position("b", "1"),
        ]);
        let second = position("a", "2");
        let third = position("c", "3");

        let merged = ChannelPosition::merge([&first, &second, &third]);

        assert_eq!(merged.position_of("a").position(), "2");
        assert_eq!(merged.position_of("b").position(), "1");
        assert_eq!(merged.position_of("c").position(), "3");
        assert_eq!(merged.shards().collect::<Vec<_>>(), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_merge_is_associative() {
        let p1 = position("a", "1");
        let p2 = ChannelPosition::channel_position([
            ShardPosition::from_position("a", "2"),
            ShardPosition::from_position("b", "2"),
        ]);
        let p3 = position("b", "3");
        let p4 = position("a", "4");

        let flat = ChannelPosition::merge([&p1, &p2, &p3, &p4]);
        let left = ChannelPosition::merge([&ChannelPosition::merge([&p1, &p2]), &p3, &p4]);
        let right = ChannelPosition::merge([
            &p1,
            &ChannelPosition::merge([&p2, &ChannelPosition::merge([&p3, &p4])]),
        ]);

        assert_eq!(flat, left);
        assert_eq!(flat, right);
        assert_eq!(flat.position_of("a").position(), "4");
        assert_eq!(flat.position_of("b").position(), "3");
    }

    #[test]
    fn test_merge_nothing_is_horizon() {
        let merged = ChannelPosition::merge(std::iter::empty());
        assert!(merged.is_empty());
        assert_eq!(merged, ChannelPosition::from_horizon());
    }

    #[test]
    fn test_merge_shard_does_not_mutate_original() {
        let original = position("a", "1");
        let merged = original.merge_shard(ShardPosition::from_position("a", "2"));

        assert_eq!(original.position_of("a").position(), "1");
        assert_eq!(merged.position_of("a").position(), "2");
    }

    #[test]
    fn test_equality_ignores_order() {
        let ab = ChannelPosition::channel_position([
            ShardPosition::from_position("a", "1"),
            ShardPosition::from_position("b", "2"),
        ]);
        let ba = ChannelPosition::channel_position([
            ShardPosition::from_position("b", "2"),
            ShardPosition::from_position("a", "1"),
        ]);
        assert_eq!(ab, ba);
        assert_ne!(ab, position("a", "1"));
    }

    #[test]
    fn test_display() {
        let ts = Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap();
        assert_eq!(ShardPosition::from_horizon("a").to_string(), "a@horizon");
        assert_eq!(ShardPosition::from_position("a", "42").to_string(), "a@42");
        assert_eq!(
            ShardPosition::from_timestamp("a", ts).to_string(),
            "a@2024-01-02T03:04:05+00:00"
        );
    }
}
