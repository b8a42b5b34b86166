//! Broker, consumer and publisher configuration types.

use std::time::Duration;

use serde::Deserialize;

use crate::bus::connection::{DEFAULT_NOTIFY_TIMEOUT, DEFAULT_RECONNECT_DELAY};
use crate::bus::consumer::{DEFAULT_PREFETCH_COUNT, DEFAULT_REQUEUE_DELAY, DEFAULT_REQUEUE_LIMIT};
use crate::bus::topology::{
    CSV_PARTITION_CREATED, DEAD_LETTER_EXCHANGE, DEFAULT_EXCHANGE, DEFAULT_QUEUE, TSV_CREATED,
};
use crate::bus::{ConnectionOptions, ExchangeSpec, RetryPolicy};

/// AMQP connection and primary exchange configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AmqpConfig {
    /// AMQP connection URL.
    pub url: String,
    /// Primary exchange shared by all stages.
    pub exchange: String,
    /// Declare the primary exchange as `x-delayed-message`. Requires the
    /// delayed message plugin on the broker.
    pub delayed: bool,
    pub reconnect_delay_ms: u64,
    pub notify_timeout_ms: u64,
}

impl Default for AmqpConfig {
    fn default() -> Self {
        Self {
            url: "amqp://localhost:5672".to_string(),
            exchange: DEFAULT_EXCHANGE.to_string(),
            delayed: true,
            reconnect_delay_ms: DEFAULT_RECONNECT_DELAY.as_millis() as u64,
            notify_timeout_ms: DEFAULT_NOTIFY_TIMEOUT.as_millis() as u64,
        }
    }
}

impl AmqpConfig {
    pub fn connection_options(&self) -> ConnectionOptions {
        ConnectionOptions {
            reconnect_delay: Duration::from_millis(self.reconnect_delay_ms),
            notify_timeout: Duration::from_millis(self.notify_timeout_ms),
        }
    }

    pub fn exchange_spec(&self) -> ExchangeSpec {
        ExchangeSpec::primary(self.exchange.clone(), self.delayed)
    }
}

/// Consumer queue, binding and retry configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConsumerSettings {
    pub queue: String,
    /// Binding key on the primary exchange.
    pub routing_key: String,
    pub dead_letter_exchange: String,
    pub prefetch_count: u16,
    pub requeue_delay_ms: u64,
    pub requeue_limit: u32,
}

impl Default for ConsumerSettings {
    fn default() -> Self {
        Self {
            queue: DEFAULT_QUEUE.to_string(),
            routing_key: CSV_PARTITION_CREATED.to_string(),
            dead_letter_exchange: DEAD_LETTER_EXCHANGE.to_string(),
            prefetch_count: DEFAULT_PREFETCH_COUNT,
            requeue_delay_ms: DEFAULT_REQUEUE_DELAY.as_millis() as u64,
            requeue_limit: DEFAULT_REQUEUE_LIMIT,
        }
    }
}

impl ConsumerSettings {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            requeue_delay: Duration::from_millis(self.requeue_delay_ms),
            requeue_limit: self.requeue_limit,
        }
    }
}

/// Publisher configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PublisherSettings {
    /// Routing key announced files are published under.
    pub routing_key: String,
}

impl Default for PublisherSettings {
    fn default() -> Self {
        Self {
            routing_key: TSV_CREATED.to_string(),
        }
    }
}
