use chrono::{Duration as ChronoDuration, Utc};
use compaction_core::channel::{ChannelPosition, ShardPosition, StopCondition};
use compaction_core::config::{ConsumptionConfig, PublishConfig};
use compaction_core::consume::{ChannelConsumer, ConsumeContext};
use compaction_core::consumer::MessagePipeline;
use compaction_core::errors::{ConsumeError, PublishError};
use compaction_core::message::Message;
use compaction_core::publish::RetryingPublisher;
use compaction_core::source::memory::{FetchFault, InMemoryChannel, PublishFault};
use compaction_core::source::THROTTLED_ERROR_CODE;
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn fast_config() -> ConsumptionConfig {
    ConsumptionConfig {
        idle_poll_interval_ms: 10,
        shutdown_grace_period_ms: 2_000,
        ..Default::default()
    }
}

/// A pipeline recording the key of every delivered message.
fn collecting_pipeline() -> (MessagePipeline, Arc<Mutex<Vec<String>>>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let pipeline = MessagePipeline::new().with_consumer(Arc::new(move |m: &Message| -> anyhow::Result<()> {
        sink.lock().unwrap().push(m.key().compaction_key().to_string());
        Ok(())
    }));
    (pipeline, seen)
}

fn fill(channel: &InMemoryChannel, shard: &str, keys: &[&str]) {
    let past = Utc::now() - ChronoDuration::minutes(10);
    for key in keys {
        channel
            .append(shard, key, Some(&format!("value-{}", key)), past)
            .unwrap();
    }
}

#[tokio::test]
async fn test_consume_all_shards_and_merge_positions() {
    let channel = Arc::new(InMemoryChannel::new("orders", 3).with_page_size(2));
    fill(&channel, "shard-0", &["1", "2", "3"]);
    fill(&channel, "shard-1", &["4"]);

    let (pipeline, seen) = collecting_pipeline();
    let consumer = ChannelConsumer::new(channel.clone(), fast_config());
    let position = consumer
        .consume(
            &ConsumeContext::new(pipeline),
            "orders",
            &ChannelPosition::from_horizon(),
            &StopCondition::caught_up_since(Utc::now()),
        )
        .await
        .unwrap();

    let mut keys = seen.lock().unwrap().clone();
    keys.sort();
    assert_eq!(keys, vec!["1", "2", "3", "4"]);

    let shards: Vec<&str> = position.shards().collect();
    assert_eq!(shards, vec!["shard-0", "shard-1", "shard-2"]);
    assert_eq!(position.position_of("shard-0").position(), "2");
    assert_eq!(position.position_of("shard-1").position(), "0");
    // nothing was read from shard-2, it stays at the horizon
    assert!(position.position_of("shard-2").is_horizon());
}

#[tokio::test]
async fn test_resume_from_channel_position() {
    let channel = Arc::new(InMemoryChannel::new("orders", 1));
    fill(&channel, "shard-0", &["1", "2", "3", "4"]);

    let (pipeline, seen) = collecting_pipeline();
    let consumer = ChannelConsumer::new(channel.clone(), fast_config());
    let start = ChannelPosition::channel_position([ShardPosition::from_position("shard-0", "1")]);
    let position = consumer
        .consume(
            &ConsumeContext::new(pipeline),
            "orders",
            &start,
            &StopCondition::caught_up_since(Utc::now()),
        )
        .await
        .unwrap();

    assert_eq!(*seen.lock().unwrap(), vec!["3", "4"]);
    assert_eq!(position.position_of("shard-0").position(), "3");
}

#[tokio::test]
async fn test_discovery_follows_pages_and_skips_closed_shards() {
    let channel = Arc::new(InMemoryChannel::new("orders", 5).with_shard_page_size(2));
    channel.close_shard("shard-3").unwrap();

    let consumer = ChannelConsumer::new(channel.clone(), fast_config());
    let shards = consumer.discover_shards("orders").await.unwrap();
    assert_eq!(shards, vec!["shard-0", "shard-1", "shard-2", "shard-4"]);
}

#[tokio::test]
async fn test_discovery_failure() {
    let channel = Arc::new(InMemoryChannel::new("orders", 1));
    let consumer = ChannelConsumer::new(channel, fast_config());
    let error = consumer
        .consume(
            &ConsumeContext::default(),
            "unknown",
            &ChannelPosition::from_horizon(),
            &StopCondition::end_of_channel(),
        )
        .await
        .unwrap_err();
    assert!(matches!(error, ConsumeError::Discovery { .. }));
}

#[tokio::test]
async fn test_more_shards_than_workers() {
    let channel = Arc::new(InMemoryChannel::new("orders", 4));
    for shard in channel.shard_names() {
        fill(&channel, &shard, &[shard.as_str()]);
    }

    let config = ConsumptionConfig {
        max_workers: 2,
        ..fast_config()
    };
    let (pipeline, seen) = collecting_pipeline();
    let consumer = ChannelConsumer::new(channel.clone(), config);
    let position = consumer
        .consume(
            &ConsumeContext::new(pipeline),
            "orders",
            &ChannelPosition::from_horizon(),
            &StopCondition::caught_up_since(Utc::now()),
        )
        .await
        .unwrap();

    assert_eq!(seen.lock().unwrap().len(), 4);
    assert_eq!(position.len(), 4);
    for shard in channel.shard_names() {
        assert_eq!(position.position_of(&shard).position(), "0");
    }
}

#[tokio::test]
async fn test_failing_worker_cancels_the_others() {
    let channel = Arc::new(InMemoryChannel::new("orders", 3));
    fill(&channel, "shard-0", &["1"]);
    fill(&channel, "shard-2", &["2"]);
    channel.inject_fetch_fault("shard-1", FetchFault::Unrecoverable("disk on fire".to_string()));

    let consumer = ChannelConsumer::new(channel.clone(), fast_config());
    // without the failure, the workers would never stop
    let error = consumer
        .consume(
            &ConsumeContext::default(),
            "orders",
            &ChannelPosition::from_horizon(),
            &StopCondition::shutdown(),
        )
        .await
        .unwrap_err();

    match error {
        ConsumeError::ShardWorkerFailure {
            shard,
            cancelled,
            leaked,
            ..
        } => {
            assert_eq!(shard, "shard-1");
            assert_eq!(cancelled, 2);
            assert_eq!(leaked, 0);
        }
        other => panic!("unexpected error {:?}", other),
    }
}

#[tokio::test]
async fn test_workers_ignoring_cancellation_are_aborted() {
    let channel = Arc::new(InMemoryChannel::new("orders", 3));
    channel.inject_fetch_fault("shard-1", FetchFault::Unrecoverable("gone".to_string()));
    channel.inject_fetch_fault("shard-2", FetchFault::Stall(Duration::from_secs(60)));

    let config = ConsumptionConfig {
        shutdown_grace_period_ms: 100,
        ..fast_config()
    };
    let consumer = ChannelConsumer::new(channel.clone(), config);
    let started = std::time::Instant::now();
    let error = consumer
        .consume(
            &ConsumeContext::default(),
            "orders",
            &ChannelPosition::from_horizon(),
            &StopCondition::shutdown(),
        )
        .await
        .unwrap_err();

    assert!(started.elapsed() < Duration::from_secs(10));
    match error {
        ConsumeError::ShardWorkerFailure {
            cancelled, leaked, ..
        } => {
            assert_eq!(cancelled, 1);
            assert_eq!(leaked, 1);
        }
        other => panic!("unexpected error {:?}", other),
    }
}

#[tokio::test]
async fn test_fast_failure_is_harvested_while_first_shard_stalls() {
    let channel = Arc::new(InMemoryChannel::new("orders", 2));
    channel.inject_fetch_fault("shard-0", FetchFault::Stall(Duration::from_secs(5)));
    channel.inject_fetch_fault("shard-1", FetchFault::Unrecoverable("gone".to_string()));

    let config = ConsumptionConfig {
        shutdown_grace_period_ms: 200,
        ..fast_config()
    };
    let consumer = ChannelConsumer::new(channel.clone(), config);
    let started = std::time::Instant::now();
    let error = consumer
        .consume(
            &ConsumeContext::default(),
            "orders",
            &ChannelPosition::from_horizon(),
            &StopCondition::shutdown(),
        )
        .await
        .unwrap_err();

    // waiting on shard-0 first would take the whole stall
    assert!(started.elapsed() < Duration::from_secs(2), "took {:?}", started.elapsed());
    match error {
        ConsumeError::ShardWorkerFailure { shard, leaked, .. } => {
            assert_eq!(shard, "shard-1");
            assert_eq!(leaked, 1);
        }
        other => panic!("unexpected error {:?}", other),
    }
}

#[tokio::test]
async fn test_single_worker_serves_every_shard() {
    let channel = Arc::new(InMemoryChannel::new("orders", 3));
    for shard in channel.shard_names() {
        fill(&channel, &shard, &[shard.as_str()]);
    }

    let config = ConsumptionConfig {
        max_workers: 1,
        ..fast_config()
    };
    let (pipeline, seen) = collecting_pipeline();
    let context = ConsumeContext::new(pipeline);
    let shutdown = context.shutdown.clone();
    let consumer = ChannelConsumer::new(channel.clone(), config);

    // never stops on its own, so no shard may wait for another to finish
    let consumption = tokio::spawn(async move {
        consumer
            .consume(
                &context,
                "orders",
                &ChannelPosition::from_horizon(),
                &StopCondition::shutdown(),
            )
            .await
    });
    tokio::time::sleep(Duration::from_millis(500)).await;
    shutdown.cancel();

    let position = consumption.await.unwrap().unwrap();
    let mut keys = seen.lock().unwrap().clone();
    keys.sort();
    assert_eq!(keys, vec!["shard-0", "shard-1", "shard-2"]);
    for shard in channel.shard_names() {
        assert_eq!(position.position_of(&shard).position(), "0");
    }
}

#[tokio::test]
async fn test_shutdown_returns_reached_positions() {
    let channel = Arc::new(InMemoryChannel::new("orders", 2));
    fill(&channel, "shard-0", &["1", "2"]);

    let (pipeline, seen) = collecting_pipeline();
    let context = ConsumeContext::new(pipeline);
    let shutdown = context.shutdown.clone();
    let consumer = ChannelConsumer::new(channel.clone(), fast_config());

    let consumption = tokio::spawn(async move {
        consumer
            .consume(
                &context,
                "orders",
                &ChannelPosition::from_horizon(),
                &StopCondition::shutdown(),
            )
            .await
    });
    tokio::time::sleep(Duration::from_millis(200)).await;
    shutdown.cancel();

    let position = consumption.await.unwrap().unwrap();
    assert_eq!(seen.lock().unwrap().len(), 2);
    assert_eq!(position.position_of("shard-0").position(), "1");
    assert!(position.position_of("shard-1").is_horizon());
}

#[tokio::test]
async fn test_stale_position_falls_back_to_horizon() {
    let channel = Arc::new(InMemoryChannel::new("orders", 1));
    fill(&channel, "shard-0", &["1", "2", "3", "4", "5"]);
    channel.trim("shard-0", 2).unwrap();

    let (pipeline, seen) = collecting_pipeline();
    let consumer = ChannelConsumer::new(channel.clone(), fast_config());
    let start = ChannelPosition::channel_position([ShardPosition::from_position("shard-0", "0")]);
    let position = consumer
        .consume(
            &ConsumeContext::new(pipeline),
            "orders",
            &start,
            &StopCondition::caught_up_since(Utc::now()),
        )
        .await
        .unwrap();

    assert_eq!(*seen.lock().unwrap(), vec!["3", "4", "5"]);
    assert_eq!(position.position_of("shard-0").position(), "4");
}

#[tokio::test]
async fn test_retry_only_throttled_records() {
    let channel = Arc::new(InMemoryChannel::new("orders", 2));
    channel.inject_publish_fault(PublishFault::FailRecords {
        indices: vec![1, 3],
        code: THROTTLED_ERROR_CODE.to_string(),
    });
    let publisher = RetryingPublisher::new(
        channel.clone(),
        PublishConfig {
            wait_before_retry: false,
            ..Default::default()
        },
    );

    let batch: Vec<Message> = (0..5)
        .map(|i| Message::outgoing(i.to_string(), Some(format!("payload-{}", i))))
        .collect();
    publisher.publish("orders", &batch).await.unwrap();

    let batches = channel.published_batches();
    assert_eq!(batches.len(), 2);
    assert_eq!(batches[1], vec![batch[1].clone(), batch[3].clone()]);

    // every record ended up in the channel exactly once
    let stored: usize = channel
        .shard_names()
        .iter()
        .map(|shard| channel.records(shard).len())
        .sum();
    assert_eq!(stored, 5);
}

#[tokio::test]
async fn test_publish_gives_up_after_max_attempts() {
    let channel = Arc::new(InMemoryChannel::new("orders", 1));
    for _ in 0..3 {
        channel.inject_publish_fault(PublishFault::Transient);
    }
    let publisher = RetryingPublisher::new(
        channel.clone(),
        PublishConfig {
            wait_before_retry: false,
            ..Default::default()
        },
    );

    let batch = vec![Message::outgoing("1", Some("a".to_string()))];
    let error = publisher.publish("orders", &batch).await.unwrap_err();
    assert!(matches!(
        error,
        PublishError::PublishExhausted {
            batch_size: 1,
            retries: 3,
            ..
        }
    ));
    assert_eq!(channel.published_batches().len(), 3);
}
