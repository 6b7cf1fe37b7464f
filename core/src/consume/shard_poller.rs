use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::channel::{ShardPosition, ShardResponse, StopCondition};
use crate::config::ConsumptionConfig;
use crate::consumer::MessagePipeline;
use crate::errors::TransportError;
use crate::message::Message;
use crate::source::{ChannelTransport, ShardIterator};

/// Longest backoff after repeated transient fetch errors, as a multiple of
/// the idle poll interval.
const MAX_BACKOFF_FACTOR: u32 = 64;

/// Reads one shard page by page, delivering every record to the pipeline
/// until the stop condition holds, the shard ends, or the run is cancelled.
pub struct ShardPoller {
    channel: String,
    shard: String,
    transport: Arc<dyn ChannelTransport>,
    pipeline: MessagePipeline,
    config: ConsumptionConfig,
    cancel: CancellationToken,
    permits: Option<Arc<Semaphore>>,
}

/// Permission to call the transport for one page.
struct Turn {
    _permit: Option<OwnedSemaphorePermit>,
}

impl ShardPoller {
    pub fn new(
        channel: impl Into<String>,
        shard: impl Into<String>,
        transport: Arc<dyn ChannelTransport>,
        pipeline: MessagePipeline,
        config: ConsumptionConfig,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            channel: channel.into(),
            shard: shard.into(),
            transport,
            pipeline,
            config,
            cancel,
            permits: None,
        }
    }

    /// Shares a worker pool with other pollers. A permit is held for one
    /// page at a time and released before idling, so every shard gets its
    /// turn even when there are more shards than permits.
    pub fn with_permits(mut self, permits: Arc<Semaphore>) -> Self {
        self.permits = Some(permits);
        self
    }

    pub fn shard(&self) -> &str {
        &self.shard
    }

    /// Consumes the shard from `start` and returns the position of the last
    /// delivered record, or `start` if nothing was delivered.
    ///
    /// Consumer errors are logged by the pipeline and never end the poll.
    /// Transient fetch errors are retried with backoff up to the configured
    /// limit; any other transport error is returned.
    pub async fn poll(
        &self,
        start: ShardPosition,
        stop_condition: &StopCondition,
    ) -> Result<ShardPosition, TransportError> {
        info!(
            channel = %self.channel,
            shard = %self.shard,
            start = %start,
            "start consuming shard"
        );

        let mut position = start;
        let Some(turn) = self.take_turn().await else {
            info!(shard = %self.shard, "shard consumption cancelled before start");
            return Ok(position);
        };
        let mut iterator = self.acquire_iterator(&position).await?;
        drop(turn);
        let mut consecutive_failures = 0u32;
        let mut delivered = 0u64;

        loop {
            if self.cancel.is_cancelled() {
                info!(shard = %self.shard, "shard consumption cancelled");
                break;
            }
            let Some(turn) = self.take_turn().await else {
                info!(shard = %self.shard, "shard consumption cancelled while waiting for a worker");
                break;
            };

            let started = Instant::now();
            let page = match self
                .transport
                .fetch_next(&iterator, self.config.fetch_record_limit)
                .await
            {
                Ok(page) => {
                    consecutive_failures = 0;
                    page
                }
                Err(e) if e.is_stale_position() => {
                    warn!(shard = %self.shard, "iterator expired, re-acquiring: {}", e);
                    iterator = self.acquire_iterator(&position).await?;
                    continue;
                }
                Err(e) if e.is_transient() && consecutive_failures < self.config.fetch_retry_limit => {
                    consecutive_failures += 1;
                    let backoff = self.backoff(consecutive_failures);
                    warn!(
                        shard = %self.shard,
                        attempt = consecutive_failures,
                        backoff_ms = backoff.as_millis() as u64,
                        "transient fetch error: {}",
                        e
                    );
                    drop(turn);
                    if !self.idle(backoff).await {
                        break;
                    }
                    continue;
                }
                Err(e) => return Err(e),
            };

            let duration_behind = Duration::from_millis(page.millis_behind);
            let response = ShardResponse {
                shard_name: self.shard.clone(),
                messages: page.records,
                shard_position: position.clone(),
                runtime: started.elapsed(),
                duration_behind,
            };
            debug!(
                shard = %self.shard,
                records = response.messages.len(),
                millis_behind = page.millis_behind,
                runtime_ms = response.runtime.as_millis() as u64,
                "fetched page"
            );

            if stop_condition.test(&response) {
                info!(shard = %self.shard, delivered, "stop condition met before delivery");
                break;
            }

            let page_was_empty = response.messages.is_empty();
            let (stopped, last_position) =
                self.deliver(response, stop_condition, &mut delivered);
            if let Some(last_position) = last_position {
                position = last_position;
            }
            if stopped {
                info!(shard = %self.shard, delivered, "stop condition met");
                break;
            }

            iterator = match page.next_iterator {
                Some(next) => next,
                None => {
                    info!(shard = %self.shard, delivered, "shard is closed and fully consumed");
                    break;
                }
            };

            drop(turn);
            if page_was_empty && !self.idle(self.config.idle_poll_interval()).await {
                info!(shard = %self.shard, "shard consumption cancelled while idle");
                break;
            }
        }

        info!(
            channel = %self.channel,
            shard = %self.shard,
            position = %position,
            delivered,
            "finished consuming shard"
        );
        Ok(position)
    }

    /// Delivers the records of a page one by one, re-testing the stop
    /// condition after each. Returns whether the condition held, and the
    /// position of the last delivered record.
    fn deliver(
        &self,
        response: ShardResponse,
        stop_condition: &StopCondition,
        delivered: &mut u64,
    ) -> (bool, Option<ShardPosition>) {
        let ShardResponse {
            shard_name,
            messages,
            shard_position,
            runtime,
            duration_behind,
        } = response;

        let newest_arrival = messages.last().map(|m| m.header().arrival_timestamp);
        let count = messages.len();
        let mut last_position = None;

        for (index, mut message) in messages.into_iter().enumerate() {
            let lag = if index + 1 == count {
                duration_behind
            } else {
                let behind_newest = newest_arrival
                    .and_then(|newest| (newest - message.header().arrival_timestamp).to_std().ok())
                    .unwrap_or_default();
                (duration_behind + behind_newest).max(Duration::from_millis(1))
            };
            message.header_mut().duration_behind = Some(lag);

            let record_position = self.position_after(&message);
            self.pipeline.dispatch(&shard_name, message.clone());
            *delivered += 1;
            if let Some(record_position) = record_position {
                last_position = Some(record_position);
            }

            let single = ShardResponse {
                shard_name: shard_name.clone(),
                messages: vec![message],
                shard_position: last_position.clone().unwrap_or_else(|| shard_position.clone()),
                runtime,
                duration_behind: lag,
            };
            if stop_condition.test(&single) {
                return (true, last_position);
            }
        }
        (false, last_position)
    }

    fn position_after(&self, message: &Message) -> Option<ShardPosition> {
        message
            .header()
            .sequence_number
            .as_ref()
            .map(|sequence_number| ShardPosition::from_position(&self.shard, sequence_number))
    }

    /// Gets an iterator for `position`, falling back to the shard horizon if
    /// the transport no longer retains it.
    async fn acquire_iterator(
        &self,
        position: &ShardPosition,
    ) -> Result<ShardIterator, TransportError> {
        match self.transport.get_iterator(&self.channel, position).await {
            Ok(iterator) => Ok(iterator),
            Err(e) if e.is_stale_position() && !position.is_horizon() => {
                warn!(
                    channel = %self.channel,
                    shard = %self.shard,
                    position = %position,
                    "stored position is no longer available, falling back to horizon: {}",
                    e
                );
                self.transport
                    .get_iterator(&self.channel, &ShardPosition::from_horizon(&self.shard))
                    .await
            }
            Err(e) => Err(e),
        }
    }

    /// Waits for a worker permit. `None` if the run was cancelled meanwhile.
    async fn take_turn(&self) -> Option<Turn> {
        let Some(permits) = &self.permits else {
            return Some(Turn { _permit: None });
        };
        tokio::select! {
            permit = permits.clone().acquire_owned() => permit.ok().map(|p| Turn { _permit: Some(p) }),
            _ = self.cancel.cancelled() => None,
        }
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1)).min(MAX_BACKOFF_FACTOR);
        self.config.idle_poll_interval() * factor
    }

    /// Sleeps for `duration`. Returns `false` if cancelled meanwhile.
    async fn idle(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            _ = tokio::time::sleep(duration) => true,
        }
    }
}
