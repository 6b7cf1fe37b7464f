use anyhow::{Context, Result};
use compaction_core::compaction::CompactionService;
use compaction_core::config::load_config;
use compaction_core::telemetry::init_tracing;
use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Retryable failures of one channel are retried this often before the
/// channel waits for the next scheduled run.
const MAX_RUN_ATTEMPTS: u32 = 3;

/// This is the entry point for running compaction as a long-running job on
/// container hosting services like AWS EKS, ECS, etc.
///
/// What it does at a high-level:
///     Load config (path from the first argument, or `COMPACTION_CONFIG`).
///     Main loop runs until a shutdown signal is received:
///         - compact every configured channel
///         - wait for the configured interval
#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let config_path = std::env::args().nth(1);
    let config = load_config(config_path.as_deref())
        .await
        .context("Failed to load configuration")?;

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            shutdown_signal().await;
            shutdown.cancel();
        }
    });

    let mut services = Vec::with_capacity(config.channels.len());
    for channel in &config.channels {
        let service = CompactionService::from_config(&config, channel)
            .await
            .with_context(|| format!("Failed to set up compaction of {}", channel))?
            .with_shutdown(shutdown.child_token());
        services.push((channel.as_str(), service));
    }
    info!(
        channels = services.len(),
        interval_secs = config.schedule.interval_secs,
        "compaction runner started"
    );

    loop {
        for (channel, service) in &services {
            if shutdown.is_cancelled() {
                break;
            }
            compact_channel(channel, service, &shutdown).await?;
        }

        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(config.schedule.interval()) => {}
        }
    }

    info!("compaction runner stopped");
    Ok(())
}

/// Runs one compaction of `channel`. Retryable failures are retried and then
/// logged, anything else stops the runner.
async fn compact_channel(
    channel: &str,
    service: &CompactionService,
    shutdown: &CancellationToken,
) -> Result<()> {
    for attempt in 1..=MAX_RUN_ATTEMPTS {
        match service.run(channel).await {
            Ok(metrics) => {
                info!(
                    channel,
                    snapshot = metrics.snapshot_name.as_deref().unwrap_or_default(),
                    entries = metrics.written_entries,
                    messages = metrics.replayed_messages,
                    tombstones = metrics.replayed_tombstones,
                    bytes = metrics.snapshot_bytes,
                    total_ms = metrics.total_ms,
                    "compaction succeeded"
                );
                return Ok(());
            }
            Err(e) if e.is_retryable() => {
                let delay = Duration::from_millis(e.get_retry_delay_ms());
                warn!(
                    channel,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "A transient error occurred, will retry: {}",
                    e
                );
                tokio::select! {
                    _ = shutdown.cancelled() => return Ok(()),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            Err(e) => {
                error!(channel, "A fatal error occurred: {}", e);
                return Err(e.into());
            }
        }
    }
    warn!(channel, "giving up until the next scheduled run");
    Ok(())
}

/// Resolves on SIGINT (Ctrl+C) or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT, starting graceful shutdown"),
        _ = terminate => info!("Received SIGTERM, starting graceful shutdown"),
    }
}
