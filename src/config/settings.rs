use std::time::Duration;

use config::ConfigError;
use serde::Deserialize;

use crate::broker::{RetryPolicy, Topic};

/// Top-level configuration, built once at startup and passed to each role.
#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    pub broker: BrokerSettings,
    pub topics: TopicsSettings,
    pub storage: Option<StorageSettings>,
    pub server: ServerSettings,
    pub logging: LoggingSettings,
}

impl Settings {
    /// Storage settings, required by the report worker.
    pub fn storage(&self) -> Result<&StorageSettings, ConfigError> {
        self.storage
            .as_ref()
            .ok_or_else(|| missing("storage.endpoint"))
    }
}

/// Broker connection and consumption parameters.
#[derive(Debug, Deserialize, Clone)]
pub struct BrokerSettings {
    pub url: String,
    pub prefetch: u16,
    pub connect_max_attempts: u32,
    pub confirm_timeout_secs: u64,
    pub retry_base_secs: u64,
    pub recovery_interval_secs: u64,
}

impl BrokerSettings {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.connect_max_attempts,
            Duration::from_secs(self.retry_base_secs),
        )
    }

    pub fn confirm_timeout(&self) -> Duration {
        Duration::from_secs(self.confirm_timeout_secs)
    }

    pub fn recovery_interval(&self) -> Duration {
        Duration::from_secs(self.recovery_interval_secs)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct TopicsSettings {
    pub report: TopicNames,
    pub notification: TopicNames,
}

impl TopicsSettings {
    pub fn report_topic(&self) -> Topic {
        self.report.topic("report")
    }

    pub fn notification_topic(&self) -> Topic {
        self.notification.topic("notification")
    }
}

/// Exchange and queue names backing one topic.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct TopicNames {
    pub exchange: String,
    pub queue: String,
}

impl TopicNames {
    pub fn topic(&self, name: &str) -> Topic {
        Topic::new(name, &self.exchange, &self.queue)
    }
}

/// S3-compatible object storage the worker uploads reports to.
#[derive(Debug, Deserialize, Clone)]
pub struct StorageSettings {
    pub endpoint: String,
    pub access_key: String,
    pub secret_key: String,
    pub bucket: String,
    pub region: String,
    pub presign_ttl_secs: u64,
}

impl StorageSettings {
    pub fn presign_ttl(&self) -> Duration {
        Duration::from_secs(self.presign_ttl_secs)
    }
}

/// Where the notification push server listens.
#[derive(Debug, Deserialize, Clone)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingSettings {
    pub level: String,
    pub json: bool,
}

/// Configuration as found in files and the environment, before required keys
/// are checked and defaults applied.
#[derive(Debug, Deserialize, Default)]
pub struct PartialSettings {
    pub broker: Option<PartialBrokerSettings>,
    pub topics: Option<PartialTopicsSettings>,
    pub storage: Option<PartialStorageSettings>,
    pub server: Option<PartialServerSettings>,
    pub logging: Option<PartialLoggingSettings>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialBrokerSettings {
    pub url: Option<String>,
    pub prefetch: Option<u16>,
    pub connect_max_attempts: Option<u32>,
    pub confirm_timeout_secs: Option<u64>,
    pub retry_base_secs: Option<u64>,
    pub recovery_interval_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialTopicsSettings {
    pub report: Option<PartialTopicNames>,
    pub notification: Option<PartialTopicNames>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialTopicNames {
    pub exchange: Option<String>,
    pub queue: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialStorageSettings {
    pub endpoint: Option<String>,
    pub access_key: Option<String>,
    pub secret_key: Option<String>,
    pub bucket: Option<String>,
    pub region: Option<String>,
    pub presign_ttl_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialServerSettings {
    pub host: Option<String>,
    pub port: Option<u16>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialLoggingSettings {
    pub level: Option<String>,
    pub json: Option<bool>,
}

pub const DEFAULT_CONFIRM_TIMEOUT_SECS: u64 = 5;
pub const DEFAULT_RETRY_BASE_SECS: u64 = 1;
pub const DEFAULT_RECOVERY_INTERVAL_SECS: u64 = 10;
pub const DEFAULT_REGION: &str = "us-east-1";
pub const DEFAULT_PRESIGN_TTL_SECS: u64 = 600;

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
        }
    }
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

impl PartialSettings {
    /// Check required keys and fill in the stated defaults.
    pub fn resolve(self) -> Result<Settings, ConfigError> {
        let broker = self.broker.unwrap_or_default();
        let topics = self.topics.unwrap_or_default();
        let server = self.server.unwrap_or_default();
        let logging = self.logging.unwrap_or_default();
        let default_server = ServerSettings::default();
        let default_logging = LoggingSettings::default();

        Ok(Settings {
            broker: BrokerSettings {
                url: required(broker.url, "broker.url")?,
                prefetch: nonzero(
                    required(broker.prefetch, "broker.prefetch")?,
                    "broker.prefetch",
                )?,
                connect_max_attempts: required(
                    broker.connect_max_attempts,
                    "broker.connect_max_attempts",
                )?,
                confirm_timeout_secs: broker
                    .confirm_timeout_secs
                    .unwrap_or(DEFAULT_CONFIRM_TIMEOUT_SECS),
                retry_base_secs: broker.retry_base_secs.unwrap_or(DEFAULT_RETRY_BASE_SECS),
                recovery_interval_secs: broker
                    .recovery_interval_secs
                    .unwrap_or(DEFAULT_RECOVERY_INTERVAL_SECS),
            },
            topics: TopicsSettings {
                report: resolve_topic(topics.report, "report")?,
                notification: resolve_topic(topics.notification, "notification")?,
            },
            storage: self.storage.map(resolve_storage).transpose()?,
            server: ServerSettings {
                host: server.host.unwrap_or(default_server.host),
                port: server.port.unwrap_or(default_server.port),
            },
            logging: LoggingSettings {
                level: logging.level.unwrap_or(default_logging.level),
                json: logging.json.unwrap_or(default_logging.json),
            },
        })
    }
}

fn resolve_topic(names: Option<PartialTopicNames>, topic: &str) -> Result<TopicNames, ConfigError> {
    let names = names.unwrap_or_default();
    Ok(TopicNames {
        exchange: required(names.exchange, &format!("topics.{topic}.exchange"))?,
        queue: required(names.queue, &format!("topics.{topic}.queue"))?,
    })
}

fn resolve_storage(storage: PartialStorageSettings) -> Result<StorageSettings, ConfigError> {
    Ok(StorageSettings {
        endpoint: required(storage.endpoint, "storage.endpoint")?,
        access_key: required(storage.access_key, "storage.access_key")?,
        secret_key: required(storage.secret_key, "storage.secret_key")?,
        bucket: required(storage.bucket, "storage.bucket")?,
        region: storage.region.unwrap_or_else(|| DEFAULT_REGION.to_string()),
        presign_ttl_secs: storage.presign_ttl_secs.unwrap_or(DEFAULT_PRESIGN_TTL_SECS),
    })
}

fn required<T>(value: Option<T>, key: &str) -> Result<T, ConfigError> {
    value.ok_or_else(|| missing(key))
}

/// A prefetch of 0 would let the broker push the whole queue unacknowledged.
fn nonzero(value: u16, key: &str) -> Result<u16, ConfigError> {
    if value == 0 {
        return Err(ConfigError::Message(format!("{key} must be at least 1")));
    }
    Ok(value)
}

fn missing(key: &str) -> ConfigError {
    ConfigError::Message(format!("missing required configuration: {key}"))
}
