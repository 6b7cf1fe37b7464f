use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::Arc;

use crate::channel::response::ShardResponse;

/// Decides when a shard reader stops consuming.
///
/// The shard poller evaluates the condition once per fetched page, before
/// any record is delivered, and again after each single delivered record. In
/// the per-record case the response holds only that record, and its lag is
/// zero only for the last record of a caught-up page.
#[derive(Clone)]
pub struct StopCondition {
    predicate: Arc<dyn Fn(&ShardResponse) -> bool + Send + Sync>,
}

impl StopCondition {
    pub fn new(predicate: impl Fn(&ShardResponse) -> bool + Send + Sync + 'static) -> Self {
        Self {
            predicate: Arc::new(predicate),
        }
    }

    /// Never stops; consumption ends only on cancellation.
    pub fn shutdown() -> Self {
        Self::new(|_| false)
    }

    /// True once the shard reports no lag.
    ///
    /// The pre-delivery check sees the whole page, so on its own this stops
    /// before delivering a caught-up page. Combine with
    /// [`empty_response`](Self::empty_response) to consume up to the head.
    pub fn end_of_channel() -> Self {
        Self::new(ShardResponse::is_caught_up)
    }

    pub fn empty_response() -> Self {
        Self::new(|response| response.messages.is_empty())
    }

    /// True when the first message of the response arrived after `instant`.
    ///
    /// Only the first message counts: on a page mixing older and newer
    /// records the older ones are still delivered, and the per-record check
    /// stops at the first newer one.
    pub fn arrival_time_after(instant: DateTime<Utc>) -> Self {
        Self::new(move |response| {
            response
                .messages
                .first()
                .is_some_and(|m| m.header().arrival_timestamp > instant)
        })
    }

    pub fn arrival_time_after_now() -> Self {
        Self::arrival_time_after(Utc::now())
    }

    /// True once the wall clock has passed `instant`.
    pub fn timestamp(instant: DateTime<Utc>) -> Self {
        Self::new(move |_| Utc::now() > instant)
    }

    /// Used by compaction: stop at an empty page at the head of the shard,
    /// or at the first record written after the run started.
    pub fn caught_up_since(start: DateTime<Utc>) -> Self {
        Self::end_of_channel()
            .and(Self::empty_response())
            .or(Self::arrival_time_after(start))
    }

    pub fn and(self, other: StopCondition) -> Self {
        Self::new(move |response| self.test(response) && other.test(response))
    }

    pub fn or(self, other: StopCondition) -> Self {
        Self::new(move |response| self.test(response) || other.test(response))
    }

    pub fn test(&self, response: &ShardResponse) -> bool {
        (self.predicate)(response)
    }
}

impl fmt::Debug for StopCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StopCondition").finish_non_exhaustive()
    }
}
