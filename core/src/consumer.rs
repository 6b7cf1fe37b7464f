use std::sync::Arc;
use tracing::{debug, error};

use crate::message::Message;

/// Receives messages delivered by a shard reader.
///
/// Consumers of a multi-shard channel are called concurrently from one
/// worker per shard, and must tolerate re-delivery of the same message.
pub trait MessageConsumer: Send + Sync {
    fn accept(&self, message: &Message) -> anyhow::Result<()>;
}

impl<F> MessageConsumer for F
where
    F: Fn(&Message) -> anyhow::Result<()> + Send + Sync,
{
    fn accept(&self, message: &Message) -> anyhow::Result<()> {
        self(message)
    }
}

/// Transforms or drops messages before they are dispatched.
pub trait MessageInterceptor: Send + Sync {
    /// Returns `None` to drop the message.
    fn intercept(&self, message: Message) -> Option<Message>;
}

impl<F> MessageInterceptor for F
where
    F: Fn(Message) -> Option<Message> + Send + Sync,
{
    fn intercept(&self, message: Message) -> Option<Message> {
        self(message)
    }
}

/// The intercept and dispatch stages every fetched record goes through.
/// Built once per consumption run and shared by all shard workers.
#[derive(Clone, Default)]
pub struct MessagePipeline {
    interceptors: Vec<Arc<dyn MessageInterceptor>>,
    consumers: Vec<Arc<dyn MessageConsumer>>,
}

impl MessagePipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_interceptor(mut self, interceptor: Arc<dyn MessageInterceptor>) -> Self {
        self.interceptors.push(interceptor);
        self
    }

    pub fn with_consumer(mut self, consumer: Arc<dyn MessageConsumer>) -> Self {
        self.consumers.push(consumer);
        self
    }

    /// Runs the message through all interceptors and hands it to every
    /// consumer. Consumer failures are logged and do not stop the pipeline.
    ///
    /// Returns `false` if an interceptor dropped the message.
    pub fn dispatch(&self, shard_name: &str, message: Message) -> bool {
        let mut message = message;
        for interceptor in &self.interceptors {
            match interceptor.intercept(message) {
                Some(intercepted) => message = intercepted,
                None => {
                    debug!(shard = shard_name, "message dropped by interceptor");
                    return false;
                }
            }
        }

        for consumer in &self.consumers {
            if let Err(e) = consumer.accept(&message) {
                error!(
                    shard = shard_name,
                    key = message.key().compaction_key(),
                    sequence_number = ?message.header().sequence_number,
                    "consumer failed while processing message: {:#}",
                    e
                );
            }
        }
        true
    }
}
