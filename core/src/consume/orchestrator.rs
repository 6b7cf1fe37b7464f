use futures::stream::{FuturesUnordered, StreamExt};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::{AbortHandle, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::channel::{ChannelPosition, ShardPosition, StopCondition};
use crate::config::ConsumptionConfig;
use crate::consume::shard_poller::ShardPoller;
use crate::consumer::MessagePipeline;
use crate::errors::{ConsumeError, TransportError};
use crate::source::{ChannelTransport, ShardDescriptor};

/// Everything one consumption run needs besides its start and stop points.
/// Built per invocation, never shared between runs.
#[derive(Clone, Default)]
pub struct ConsumeContext {
    pub pipeline: MessagePipeline,
    /// Cancelling this token makes every shard worker stop at its next
    /// cancellation point and report the position it reached.
    pub shutdown: CancellationToken,
}

impl ConsumeContext {
    pub fn new(pipeline: MessagePipeline) -> Self {
        Self {
            pipeline,
            shutdown: CancellationToken::new(),
        }
    }
}

/// Consumes all open shards of a channel concurrently, one worker per shard,
/// and merges the positions they reach into a [`ChannelPosition`].
pub struct ChannelConsumer {
    transport: Arc<dyn ChannelTransport>,
    config: ConsumptionConfig,
}

enum FailedShard {
    Errored {
        shard: String,
        source: TransportError,
    },
    Panicked {
        shard: String,
        reason: String,
    },
}

struct ShardTask {
    index: usize,
    shard: String,
    handle: JoinHandle<Result<ShardPosition, TransportError>>,
}

impl ChannelConsumer {
    pub fn new(transport: Arc<dyn ChannelTransport>, config: ConsumptionConfig) -> Self {
        Self { transport, config }
    }

    /// Lists all shards of a channel, following continuation markers.
    /// Closed shards are skipped.
    pub async fn discover_shards(&self, channel: &str) -> Result<Vec<String>, ConsumeError> {
        let mut open_shards = Vec::new();
        let mut next_token = None;
        loop {
            let page = self
                .transport
                .list_shards(channel, next_token)
                .await
                .map_err(|source| ConsumeError::Discovery {
                    channel: channel.to_string(),
                    source,
                })?;

            for ShardDescriptor { name, open } in page.shards {
                if open {
                    open_shards.push(name);
                } else {
                    warn!(channel, shard = %name, "skipping closed shard");
                }
            }

            next_token = page.next_token;
            if next_token.is_none() {
                break;
            }
        }
        Ok(open_shards)
    }

    /// Consumes `channel` from `start_from` until every shard worker has
    /// finished, and returns the merged positions.
    ///
    /// If a worker fails, the others are cancelled and given the configured
    /// grace period to stop; workers still running after that are aborted.
    /// Positions of the surviving workers are discarded in that case.
    pub async fn consume(
        &self,
        context: &ConsumeContext,
        channel: &str,
        start_from: &ChannelPosition,
        stop_condition: &StopCondition,
    ) -> Result<ChannelPosition, ConsumeError> {
        let shards = self.discover_shards(channel).await?;
        if shards.is_empty() {
            warn!(channel, "channel has no open shards");
            return Ok(ChannelPosition::default());
        }

        let max_workers = self.config.max_workers.max(1);
        let workers = shards.len().min(max_workers);
        if shards.len() > max_workers {
            warn!(
                channel,
                shards = shards.len(),
                max_workers,
                "more shards than workers: shards take turns fetching pages"
            );
        }
        info!(channel, shards = shards.len(), workers, "start consuming channel");

        let permits = Arc::new(Semaphore::new(workers));
        let cancel = context.shutdown.child_token();
        let tasks: Vec<ShardTask> = shards
            .into_iter()
            .enumerate()
            .map(|(index, shard)| {
                let start = start_from.position_of(&shard);
                let handle = self.spawn_worker(
                    channel,
                    &shard,
                    start,
                    context.pipeline.clone(),
                    stop_condition.clone(),
                    permits.clone(),
                    cancel.clone(),
                );
                ShardTask {
                    index,
                    shard,
                    handle,
                }
            })
            .collect();

        let abort_handles: Vec<AbortHandle> =
            tasks.iter().map(|t| t.handle.abort_handle()).collect();
        let mut pending: FuturesUnordered<_> = tasks
            .into_iter()
            .map(|task| async move { (task.index, task.shard, task.handle.await) })
            .collect();

        let mut positions: Vec<(usize, ShardPosition)> = Vec::with_capacity(abort_handles.len());
        let mut failure = None;
        while let Some((index, shard, joined)) = pending.next().await {
            match joined {
                Ok(Ok(position)) => positions.push((index, position)),
                Ok(Err(source)) => {
                    error!(channel, shard = %shard, "shard worker failed: {}", source);
                    failure = Some(FailedShard::Errored { shard, source });
                    break;
                }
                Err(join_error) => {
                    error!(channel, shard = %shard, "shard worker panicked: {}", join_error);
                    failure = Some(FailedShard::Panicked {
                        shard,
                        reason: join_error.to_string(),
                    });
                    break;
                }
            }
        }

        let Some(failure) = failure else {
            positions.sort_by_key(|(index, _)| *index);
            let merged: ChannelPosition = positions.into_iter().map(|(_, p)| p).collect();
            info!(channel, position = ?merged, "finished consuming channel");
            return Ok(merged);
        };

        cancel.cancel();
        let outstanding = pending.len();
        let mut stopped = 0usize;
        let drained = tokio::time::timeout(self.config.shutdown_grace_period(), async {
            while pending.next().await.is_some() {
                stopped += 1;
            }
        })
        .await;
        let leaked = outstanding - stopped;
        if drained.is_err() {
            for handle in &abort_handles {
                handle.abort();
            }
            error!(
                channel,
                leaked,
                grace_period_ms = self.config.shutdown_grace_period_ms,
                "shard workers did not stop within the grace period and were aborted"
            );
        }

        Err(match failure {
            FailedShard::Errored { shard, source } => ConsumeError::ShardWorkerFailure {
                channel: channel.to_string(),
                shard,
                cancelled: stopped,
                leaked,
                source,
            },
            FailedShard::Panicked { shard, reason } => ConsumeError::WorkerPanicked {
                channel: channel.to_string(),
                shard,
                reason,
            },
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn spawn_worker(
        &self,
        channel: &str,
        shard: &str,
        start: ShardPosition,
        pipeline: MessagePipeline,
        stop_condition: StopCondition,
        permits: Arc<Semaphore>,
        cancel: CancellationToken,
    ) -> JoinHandle<Result<ShardPosition, TransportError>> {
        let poller = ShardPoller::new(
            channel,
            shard,
            self.transport.clone(),
            pipeline,
            self.config.clone(),
            cancel,
        )
        .with_permits(permits);
        tokio::spawn(async move { poller.poll(start, &stop_condition).await })
    }
}
