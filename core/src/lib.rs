pub mod aws;
pub mod channel;
pub mod compaction;
pub mod config;
pub mod consume;
pub mod consumer;
pub mod errors;
pub mod message;
pub mod publish;
pub mod snapshot;
pub mod source;
pub mod state;
pub mod store;
pub mod telemetry;

pub use channel::{ChannelPosition, ShardPosition, ShardResponse, StartFrom, StopCondition};
pub use compaction::{CompactionService, CompactionState};
pub use consume::{ChannelConsumer, ConsumeContext};
pub use errors::{CompactionError, Result};
pub use message::{Header, Key, Message};
pub use state::{InMemoryWorkingSet, WorkingSet};
