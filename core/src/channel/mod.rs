pub mod position;
pub mod response;
pub mod stop_condition;

pub use position::{ChannelPosition, ShardPosition, StartFrom};
pub use response::ShardResponse;
pub use stop_condition::StopCondition;
