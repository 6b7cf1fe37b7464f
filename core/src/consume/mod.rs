pub mod orchestrator;
pub mod shard_poller;

pub use orchestrator::{ChannelConsumer, ConsumeContext};
pub use shard_poller::ShardPoller;
