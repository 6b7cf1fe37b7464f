use std::time::Duration;

use crate::channel::position::ShardPosition;
use crate::message::Message;

/// The result of one poll of one shard.
#[derive(Debug, Clone)]
pub struct ShardResponse {
    pub shard_name: String,
    pub messages: Vec<Message>,
    pub shard_position: ShardPosition,
    pub runtime: Duration,
    /// Approximate lag behind the newest record of the shard. Zero means
    /// the shard reader is caught up.
    pub duration_behind: Duration,
}

impl ShardResponse {
    pub fn is_caught_up(&self) -> bool {
        self.duration_behind.is_zero()
    }
}
