//! Application configuration.
//!
//! Aggregates broker, consumer and publisher settings into a single Config
//! struct that can be loaded from YAML files or environment variables.

mod messaging;

pub use messaging::{AmqpConfig, ConsumerSettings, PublisherSettings};

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "config.yaml";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "FILEFLOW_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "FILEFLOW";
/// Environment variable for logging configuration.
pub const LOG_ENV_VAR: &str = "FILEFLOW_LOG";
/// Environment variable selecting the log format (`json` or plain text).
pub const LOG_FORMAT_ENV_VAR: &str = "FILEFLOW_LOG_FORMAT";

use serde::Deserialize;

use crate::bus::ConsumerConfig;

/// Main application configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub amqp: AmqpConfig,
    pub consumer: ConsumerSettings,
    pub publisher: PublisherSettings,
}

impl Config {
    /// Load configuration from file and environment.
    ///
    /// Configuration sources (in order of priority, later overrides earlier):
    /// 1. `config.yaml` in current directory (if exists)
    /// 2. File specified by `path` argument (if provided)
    /// 3. File specified by `CONFIG_ENV_VAR` environment variable (if set)
    /// 4. Environment variables with `CONFIG_ENV_PREFIX` prefix
    pub fn load(path: Option<&str>) -> Result<Self, ::config::ConfigError> {
        use ::config::{Config as ConfigLib, Environment, File, FileFormat};

        let mut builder = ConfigLib::builder()
            .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false));

        if let Some(config_path) = path {
            builder = builder.add_source(File::new(config_path, FileFormat::Yaml).required(true));
        }

        if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::new(&config_path, FileFormat::Yaml).required(true));
        }

        builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
    }

    /// Consumer configuration bound on the configured primary exchange.
    pub fn consumer_config(&self) -> ConsumerConfig {
        let mut config = ConsumerConfig::new(self.amqp.exchange_spec(), &self.consumer.routing_key)
            .with_queue(&self.consumer.queue, &self.consumer.dead_letter_exchange)
            .with_retry(self.consumer.retry_policy());
        config.prefetch_count = self.consumer.prefetch_count;
        config
    }
}

/// Parse `--config <path>` from the command line.
pub fn parse_config_path() -> Option<String> {
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--config" {
            return args.next();
        }
        if let Some(path) = arg.strip_prefix("--config=") {
            return Some(path.to_string());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::ExchangeKind;
    use std::io::Write;
    use std::time::Duration;

    fn write_config(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new()
            .suffix(".yaml")
            .tempfile()
            .unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_config_default() {
        let config = Config::default();
        assert_eq!(config.amqp.url, "amqp://localhost:5672");
        assert_eq!(config.amqp.exchange, "datacloud.v2");
        assert_eq!(config.publisher.routing_key, "tsv.created");
        assert_eq!(config.consumer.routing_key, "csv.partition.created");
    }

    #[test]
    fn test_load_from_file() {
        let file = write_config(
            r#"
amqp:
  url: amqp://rabbit:5672
  exchange: pipeline
  delayed: false
  reconnect_delay_ms: 250
consumer:
  queue: csv-cleaner
  routing_key: csv.created
  requeue_delay_ms: 1000
publisher:
  routing_key: csv.partition.created
"#,
        );

        let config = Config::load(file.path().to_str()).unwrap();

        assert_eq!(config.amqp.url, "amqp://rabbit:5672");
        assert_eq!(config.amqp.exchange, "pipeline");
        assert!(!config.amqp.delayed);
        assert_eq!(
            config.amqp.connection_options().reconnect_delay,
            Duration::from_millis(250)
        );
        assert_eq!(config.amqp.notify_timeout_ms, 10_000);
        assert_eq!(config.consumer.queue, "csv-cleaner");
        assert_eq!(config.consumer.dead_letter_exchange, "datacloud.dlx");
        assert_eq!(config.publisher.routing_key, "csv.partition.created");
    }

    #[test]
    fn test_load_missing_explicit_file_fails() {
        assert!(Config::load(Some("/nonexistent/fileflow.yaml")).is_err());
    }

    #[test]
    fn test_environment_overrides() {
        std::env::set_var("FILEFLOW__CONSUMER__REQUEUE_LIMIT", "7");
        let config = Config::load(None);
        std::env::remove_var("FILEFLOW__CONSUMER__REQUEUE_LIMIT");

        assert_eq!(config.unwrap().consumer.requeue_limit, 7);
    }

    #[test]
    fn test_consumer_config_from_settings() {
        let mut config = Config::default();
        config.amqp.exchange = "pipeline".to_string();
        config.consumer.queue = "csv-cleaner".to_string();
        config.consumer.routing_key = "csv.created".to_string();
        config.consumer.prefetch_count = 4;
        config.consumer.requeue_limit = 5;

        let consumer = config.consumer_config();

        assert_eq!(consumer.topology.exchange.name, "pipeline");
        assert_eq!(consumer.topology.exchange.kind, ExchangeKind::DelayedTopic);
        assert_eq!(consumer.topology.queue.name, "csv-cleaner");
        assert_eq!(consumer.topology.routing_key, "csv.created");
        assert_eq!(consumer.topology.dead_letter.name, "datacloud.dlx");
        assert_eq!(consumer.prefetch_count, 4);
        assert_eq!(consumer.retry.requeue_limit, 5);
    }
}
