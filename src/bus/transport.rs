//! Broker seams.
//!
//! The connection manager, consumer and publisher only talk to the broker
//! through these traits. `amqp` implements them on top of lapin, `memory`
//! implements them in-process.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;

use super::topology::{ExchangeSpec, QueueSpec};
use super::Result;

/// Value stored in message headers and declaration arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldValue {
    Str(String),
    Int(i64),
    Bool(bool),
}

impl FieldValue {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            FieldValue::Int(v) => Some(*v),
            FieldValue::Str(s) => s.parse().ok(),
            FieldValue::Bool(_) => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            FieldValue::Str(s) => Some(s),
            _ => None,
        }
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        FieldValue::Str(value.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        FieldValue::Str(value)
    }
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        FieldValue::Int(value)
    }
}

impl From<bool> for FieldValue {
    fn from(value: bool) -> Self {
        FieldValue::Bool(value)
    }
}

/// Header and argument table.
pub type FieldTable = BTreeMap<String, FieldValue>;

/// Stream of inbound deliveries. Ends when the channel or connection goes away.
pub type DeliveryStream = BoxStream<'static, Result<Delivery>>;

/// Dials the broker.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn dial(&self) -> Result<Arc<dyn Connection>>;
}

/// A live broker connection.
#[async_trait]
pub trait Connection: Send + Sync + 'static {
    async fn open_channel(&self) -> Result<Arc<dyn Channel>>;

    /// Resolves once the connection is closed, whether by the broker, the
    /// network or a local `close()`.
    async fn closed(&self);

    async fn close(&self);

    fn is_closed(&self) -> bool;
}

/// A logical sub-connection. Replaced, never repaired.
#[async_trait]
pub trait Channel: Send + Sync + 'static {
    async fn qos(&self, prefetch_count: u16) -> Result<()>;

    async fn exchange_declare(&self, exchange: &ExchangeSpec) -> Result<()>;

    async fn queue_declare(&self, queue: &QueueSpec) -> Result<()>;

    async fn queue_bind(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()>;

    /// Start consuming with manual acknowledgement.
    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream>;

    async fn publish(&self, publishing: &Publishing) -> Result<()>;

    async fn close(&self);
}

/// Settles a single delivery with the broker.
#[async_trait]
pub trait Acknowledger: Send + Sync + 'static {
    async fn ack(&self) -> Result<()>;

    async fn nack(&self, requeue: bool) -> Result<()>;
}

/// Outbound message.
#[derive(Debug, Clone, Default)]
pub struct Publishing {
    pub exchange: String,
    pub routing_key: String,
    pub body: Vec<u8>,
    pub content_type: Option<String>,
    pub headers: FieldTable,
    pub mandatory: bool,
    pub immediate: bool,
    pub persistent: bool,
}

/// Inbound message plus the handle used to settle it.
///
/// `ack` and `nack` take `self`, so a delivery is settled at most once.
pub struct Delivery {
    pub routing_key: String,
    pub body: Vec<u8>,
    pub headers: FieldTable,
    pub redelivered: bool,
    acker: Box<dyn Acknowledger>,
}

impl Delivery {
    pub fn new(
        routing_key: impl Into<String>,
        body: Vec<u8>,
        headers: FieldTable,
        redelivered: bool,
        acker: Box<dyn Acknowledger>,
    ) -> Self {
        Self {
            routing_key: routing_key.into(),
            body,
            headers,
            redelivered,
            acker,
        }
    }

    /// Integer header lookup, tolerant of string-encoded numbers.
    pub fn header_int(&self, key: &str) -> Option<i64> {
        self.headers.get(key).and_then(FieldValue::as_int)
    }

    /// Positive acknowledgement of this delivery only (multiple = false).
    pub async fn ack(self) -> Result<()> {
        self.acker.ack().await
    }

    /// Negative acknowledgement of this delivery only.
    pub async fn nack(self, requeue: bool) -> Result<()> {
        self.acker.nack(requeue).await
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("routing_key", &self.routing_key)
            .field("body_len", &self.body.len())
            .field("headers", &self.headers)
            .field("redelivered", &self.redelivered)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_field_value_as_int() {
        assert_eq!(FieldValue::Int(3).as_int(), Some(3));
        assert_eq!(FieldValue::from("7").as_int(), Some(7));
        assert_eq!(FieldValue::from("seven").as_int(), None);
        assert_eq!(FieldValue::Bool(true).as_int(), None);
    }

    #[test]
    fn test_field_value_as_str() {
        assert_eq!(FieldValue::from("quorum").as_str(), Some("quorum"));
        assert_eq!(FieldValue::Int(1).as_str(), None);
    }
}
