use compaction_core::compaction::CompactionService;
use compaction_core::config::{load_config, CompactionConfig};
use compaction_core::telemetry::{init_tracing, CompactionMetrics};
use lambda_runtime::{service_fn, Error, LambdaEvent};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

/// One compaction service per configured channel, created once per
/// Lambda container and reused across invocations.
struct Services {
    by_channel: HashMap<String, CompactionService>,
}

impl Services {
    async fn from_config(config: &CompactionConfig) -> Result<Self, Error> {
        let mut by_channel = HashMap::new();
        for channel in &config.channels {
            let service = CompactionService::from_config(config, channel).await?;
            by_channel.insert(channel.clone(), service);
        }
        Ok(Self { by_channel })
    }
}

async fn lambda_handler(
    event: LambdaEvent<CompactionRequest>,
    services: Arc<Services>,
) -> Result<CompactionResponse, Error> {
    let channel = event.payload.channel;
    let service = services
        .by_channel
        .get(&channel)
        .ok_or_else(|| format!("channel {} is not configured", channel))?;

    info!(channel = %channel, request_id = %event.context.request_id, "compaction requested");
    let metrics = service.run(&channel).await?;
    Ok(CompactionResponse {
        status: "SUCCEEDED".to_string(),
        snapshot: metrics.snapshot_name.clone(),
        metrics,
    })
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    init_tracing();
    let config = load_config(None).await?;
    let services = Arc::new(Services::from_config(&config).await?);

    lambda_runtime::run(service_fn(move |event| {
        lambda_handler(event, services.clone())
    }))
    .await
}

#[derive(Debug, Deserialize)]
struct CompactionRequest {
    channel: String,
}

#[derive(Debug, Serialize)]
struct CompactionResponse {
    status: String,
    snapshot: Option<String>,
    metrics: CompactionMetrics,
}
