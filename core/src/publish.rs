use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

use crate::config::PublishConfig;
use crate::errors::PublishError;
use crate::message::Message;
use crate::source::ChannelTransport;

/// Publishes batches with per-record retries.
///
/// After a partial failure only the failed records are sent again, in their
/// original form. A transport error retries the whole original batch.
/// Throttling and internal failures are retried; any other per-record error
/// code fails the batch at once.
pub struct RetryingPublisher {
    transport: Arc<dyn ChannelTransport>,
    config: PublishConfig,
}

impl RetryingPublisher {
    pub fn new(transport: Arc<dyn ChannelTransport>, config: PublishConfig) -> Self {
        Self { transport, config }
    }

    /// Publishes `records`, split into batches of the configured size.
    pub async fn publish_all(&self, channel: &str, records: &[Message]) -> Result<(), PublishError> {
        for batch in records.chunks(self.config.batch_size.max(1)) {
            self.publish(channel, batch).await?;
        }
        Ok(())
    }

    pub async fn publish(&self, channel: &str, batch: &[Message]) -> Result<(), PublishError> {
        if batch.is_empty() {
            return Ok(());
        }

        let max_attempts = self.config.max_attempts.max(1);
        let mut pending: Vec<Message> = batch.to_vec();
        for attempt in 1..=max_attempts {
            let started = Instant::now();
            match self.transport.publish_batch(channel, &pending).await {
                Ok(response) => {
                    if response.results.len() != pending.len() {
                        error!(
                            channel,
                            sent = pending.len(),
                            acknowledged = response.results.len(),
                            "publish response does not match the batch"
                        );
                        return Err(PublishError::IncompleteResponse {
                            channel: channel.to_string(),
                            sent: pending.len(),
                            acknowledged: response.results.len(),
                        });
                    }
                    let failed = response.failed_record_count();
                    if failed == 0 {
                        info!(
                            channel,
                            records = pending.len(),
                            attempt,
                            runtime_ms = started.elapsed().as_millis() as u64,
                            "published batch"
                        );
                        return Ok(());
                    }

                    let mut retry = Vec::with_capacity(failed);
                    let mut rejected = Vec::new();
                    for (record, result) in pending.into_iter().zip(response.results) {
                        if !result.is_failure() {
                            continue;
                        }
                        if result.is_retryable() {
                            retry.push(record);
                        } else {
                            rejected.push(result);
                        }
                    }
                    if let Some(first) = rejected.first() {
                        error!(channel, rejected = rejected.len(), "records rejected by channel");
                        return Err(PublishError::Rejected {
                            channel: channel.to_string(),
                            count: rejected.len(),
                            reason: format!(
                                "{}: {}",
                                first.error_code.as_deref().unwrap_or_default(),
                                first.error_message.as_deref().unwrap_or_default()
                            ),
                        });
                    }
                    warn!(
                        channel,
                        failed = retry.len(),
                        attempt,
                        max_attempts,
                        "records of batch failed, retrying them"
                    );
                    pending = retry;
                }
                Err(e) if e.is_transient() => {
                    warn!(
                        channel,
                        attempt, max_attempts, "publishing batch failed, retrying: {}", e
                    );
                    pending = batch.to_vec();
                }
                Err(e) => {
                    return Err(PublishError::Transport {
                        channel: channel.to_string(),
                        source: e,
                    });
                }
            }

            if attempt < max_attempts && self.config.wait_before_retry {
                tokio::time::sleep(self.backoff(attempt)).await;
            }
        }

        error!(
            channel,
            batch_size = batch.len(),
            max_attempts,
            "giving up on batch"
        );
        Err(PublishError::PublishExhausted {
            channel: channel.to_string(),
            batch_size: batch.len(),
            retries: max_attempts,
        })
    }

    fn backoff(&self, attempt: u32) -> Duration {
        self.config.backoff_base() * 2u32.saturating_pow(attempt)
    }
}
