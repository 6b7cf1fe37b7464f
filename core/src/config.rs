use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::errors::ConfigError;

pub const CONFIG_ENV_VAR: &str = "COMPACTION_CONFIG";

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CompactionConfig {
    pub version: u32,
    pub channels: Vec<String>,
    pub transport: TransportConfig,
    pub snapshot: SnapshotConfig,
    #[serde(default)]
    pub consumption: ConsumptionConfig,
    #[serde(default)]
    pub publish: PublishConfig,
    #[serde(default)]
    pub schedule: ScheduleConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", content = "options", rename_all = "snake_case")]
pub enum TransportConfig {
    Kinesis(KinesisOptions),
    Kafka(KafkaOptions),
    InMemory { shards: usize },
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct AwsOptions {
    pub region: String,
    pub endpoint_url: Option<String>,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    pub session_token: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct KinesisOptions {
    #[serde(flatten)]
    pub aws: AwsOptions,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct KafkaOptions {
    pub bootstrap_servers: String,
    pub consumer_group: String,
    pub security_protocol: Option<String>,
    pub sasl_mechanisms: Option<String>,
    pub sasl_username: Option<String>,
    pub sasl_password: Option<String>,
    pub ssl_ca_location: Option<String>,
    pub session_timeout_ms: Option<u32>,
    /// How long a fetch waits for the first record of a page.
    pub fetch_timeout_ms: Option<u64>,
    pub message_timeout_ms: Option<u32>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SnapshotConfig {
    pub bucket: String,
    pub store: SnapshotStoreConfig,
    /// Where snapshot files are written and cached between runs.
    /// Defaults to the system temp directory.
    pub local_dir: Option<PathBuf>,
}

impl SnapshotConfig {
    pub fn local_dir(&self) -> PathBuf {
        self.local_dir.clone().unwrap_or_else(std::env::temp_dir)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", content = "options", rename_all = "snake_case")]
pub enum SnapshotStoreConfig {
    S3(AwsOptions),
    FileSystem { root: PathBuf },
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ConsumptionConfig {
    /// Upper bound on shard workers of one consumption run.
    pub max_workers: usize,
    pub idle_poll_interval_ms: u64,
    /// How long surviving workers get to stop after another worker failed.
    pub shutdown_grace_period_ms: u64,
    pub fetch_record_limit: usize,
    /// Consecutive transient fetch errors tolerated per shard.
    pub fetch_retry_limit: u32,
}

impl Default for ConsumptionConfig {
    fn default() -> Self {
        Self {
            max_workers: 10,
            idle_poll_interval_ms: 1000,
            shutdown_grace_period_ms: 30_000,
            fetch_record_limit: 10_000,
            fetch_retry_limit: 16,
        }
    }
}

impl ConsumptionConfig {
    pub fn idle_poll_interval(&self) -> Duration {
        Duration::from_millis(self.idle_poll_interval_ms)
    }

    pub fn shutdown_grace_period(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_period_ms)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PublishConfig {
    /// Total sends per batch, including the first one.
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub wait_before_retry: bool,
    /// Maximum number of records per publish call.
    pub batch_size: usize,
}

impl Default for PublishConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base_ms: 1000,
            wait_before_retry: true,
            batch_size: 500,
        }
    }
}

impl PublishConfig {
    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ScheduleConfig {
    pub interval_secs: u64,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            interval_secs: 3600,
        }
    }
}

impl ScheduleConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

pub async fn load_config(config_path: Option<&str>) -> Result<CompactionConfig, ConfigError> {
    let config = match config_path {
        Some(path) => CompactionConfig::from_file(path)?,
        None => CompactionConfig::from_env()?,
    };
    config.validate()?;
    Ok(config)
}

impl CompactionConfig {
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::LoadFailed {
            origin: path.to_string(),
            error: Box::new(e),
        })?;
        Self::from_yaml(&content)
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        let config_str = std::env::var(CONFIG_ENV_VAR).map_err(|_| ConfigError::MissingField {
            field: CONFIG_ENV_VAR.to_string(),
        })?;
        Self::from_yaml(&config_str)
    }

    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(content)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.channels.is_empty() {
            return Err(ConfigError::ValidationFailed {
                reason: "At least one channel must be configured".to_string(),
            });
        }
        if self.channels.iter().any(|c| c.trim().is_empty()) {
            return Err(ConfigError::ValidationFailed {
                reason: "Channel names cannot be empty".to_string(),
            });
        }
        if self.snapshot.bucket.is_empty() {
            return Err(ConfigError::MissingField {
                field: "snapshot.bucket".to_string(),
            });
        }
        match &self.transport {
            TransportConfig::Kafka(options) if options.bootstrap_servers.is_empty() => {
                return Err(ConfigError::ValidationFailed {
                    reason: "Kafka bootstrap servers cannot be empty".to_string(),
                });
            }
            TransportConfig::Kinesis(options) if options.aws.region.is_empty() => {
                return Err(ConfigError::MissingField {
                    field: "transport.options.region".to_string(),
                });
            }
            TransportConfig::InMemory { shards: 0 } => {
                return Err(ConfigError::ValidationFailed {
                    reason: "An in-memory channel needs at least one shard".to_string(),
                });
            }
            _ => {}
        }
        if self.consumption.max_workers == 0 {
            return Err(ConfigError::ValidationFailed {
                reason: "consumption.max_workers must be at least 1".to_string(),
            });
        }
        if self.consumption.fetch_record_limit == 0 {
            return Err(ConfigError::ValidationFailed {
                reason: "consumption.fetch_record_limit must be at least 1".to_string(),
            });
        }
        if self.publish.max_attempts == 0 {
            return Err(ConfigError::ValidationFailed {
                reason: "publish.max_attempts must be at least 1".to_string(),
            });
        }
        if self.publish.batch_size == 0 {
            return Err(ConfigError::ValidationFailed {
                reason: "publish.batch_size must be at least 1".to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KINESIS_CONFIG: &str = r#"
version: 1
channels:
  - orders
  - products
transport:
  type: kinesis
  options:
    region: eu-central-1
    endpoint_url: http://localhost:4566
snapshot:
  bucket: compaction-snapshots
  store:
    type: s3
    options:
      region: eu-central-1
consumption:
  max_workers: 4
"#;

    #[test]
    fn test_parse_kinesis_config() {
        let config = CompactionConfig::from_yaml(KINESIS_CONFIG).unwrap();
        config.validate().unwrap();

        assert_eq!(config.channels, vec!["orders", "products"]);
        match &config.transport {
            TransportConfig::Kinesis(options) => {
                assert_eq!(options.aws.region, "eu-central-1");
                assert_eq!(options.aws.endpoint_url.as_deref(), Some("http://localhost:4566"));
            }
            other => panic!("unexpected transport {:?}", other),
        }
        assert_eq!(config.consumption.max_workers, 4);
        // unset fields keep their defaults
        assert_eq!(config.consumption.idle_poll_interval_ms, 1000);
        assert_eq!(config.consumption.shutdown_grace_period(), Duration::from_secs(30));
        assert_eq!(config.publish.max_attempts, 3);
        assert!(config.publish.wait_before_retry);
        assert_eq!(config.schedule.interval(), Duration::from_secs(3600));
    }

    #[test]
    fn test_parse_kafka_and_filesystem_config() {
        let yaml = r#"
version: 1
channels: [orders]
transport:
  type: kafka
  options:
    bootstrap_servers: localhost:9092
    consumer_group: compaction
snapshot:
  bucket: snapshots
  local_dir: /var/tmp/compaction
  store:
    type: file_system
    options:
      root: /data/buckets
publish:
  wait_before_retry: false
"#;
        let config = CompactionConfig::from_yaml(yaml).unwrap();
        config.validate().unwrap();
        assert!(matches!(config.transport, TransportConfig::Kafka(_)));
        assert!(matches!(config.snapshot.store, SnapshotStoreConfig::FileSystem { .. }));
        assert_eq!(config.snapshot.local_dir(), PathBuf::from("/var/tmp/compaction"));
        assert!(!config.publish.wait_before_retry);
    }

    #[test]
    fn test_validation_rejects_missing_channels() {
        let mut config = CompactionConfig::from_yaml(KINESIS_CONFIG).unwrap();
        config.channels.clear();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ValidationFailed { .. })
        ));
    }

    #[test]
    fn test_validation_rejects_zero_workers() {
        let mut config = CompactionConfig::from_yaml(KINESIS_CONFIG).unwrap();
        config.consumption.max_workers = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_yaml() {
        let error = CompactionConfig::from_yaml("channels: [").unwrap_err();
        assert!(matches!(error, ConfigError::Invalid { .. }));
    }

    #[test]
    fn test_missing_file() {
        let error = CompactionConfig::from_file("/nonexistent/compaction.yaml").unwrap_err();
        assert!(matches!(error, ConfigError::LoadFailed { .. }));
    }
}
