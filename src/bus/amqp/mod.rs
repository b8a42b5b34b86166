//! AMQP (RabbitMQ) transport.
//!
//! Adapts lapin connections, channels and deliveries to the broker seams
//! used by the connection manager, consumer and publisher.

use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use lapin::{
    acker::Acker,
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
        BasicQosOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
    },
    types::{AMQPValue, FieldTable as AmqpFieldTable},
    BasicProperties, ConnectionProperties, ExchangeKind as AmqpExchangeKind,
};
use tokio::sync::watch;
use tracing::{debug, warn};

use super::topology::{ExchangeKind, ExchangeSpec, QueueSpec};
use super::transport::{
    Acknowledger, Channel, Connection, Delivery, DeliveryStream, FieldTable, FieldValue,
    Publishing, Transport,
};
use super::{BusError, Result};

/// Reply code sent when closing connections and channels ourselves.
const REPLY_SUCCESS: u16 = 200;
/// AMQP delivery mode for messages that survive a broker restart.
const DELIVERY_MODE_PERSISTENT: u8 = 2;

/// Dials RabbitMQ at a fixed URL.
#[derive(Clone, Debug)]
pub struct AmqpTransport {
    url: String,
}

impl AmqpTransport {
    /// AMQP connection URL (e.g., amqp://localhost:5672).
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[async_trait]
impl Transport for AmqpTransport {
    async fn dial(&self) -> Result<Arc<dyn Connection>> {
        let conn = lapin::Connection::connect(&self.url, ConnectionProperties::default())
            .await
            .map_err(|e| BusError::Connection(format!("Failed to connect: {}", e)))?;

        let closed = Arc::new(watch::channel(false).0);
        let on_error = closed.clone();
        conn.on_error(move |err| {
            warn!(error = %err, "amqp: connection error");
            on_error.send_replace(true);
        });

        Ok(Arc::new(AmqpConnection { conn, closed }))
    }
}

struct AmqpConnection {
    conn: lapin::Connection,
    /// Set by the error callback or a local close.
    closed: Arc<watch::Sender<bool>>,
}

#[async_trait]
impl Connection for AmqpConnection {
    async fn open_channel(&self) -> Result<Arc<dyn Channel>> {
        let channel = self
            .conn
            .create_channel()
            .await
            .map_err(|e| BusError::Channel(format!("Failed to create channel: {}", e)))?;
        Ok(Arc::new(AmqpChannel { channel }))
    }

    async fn closed(&self) {
        let mut rx = self.closed.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }

    async fn close(&self) {
        if self.closed.send_replace(true) {
            return;
        }
        if self.conn.status().connected() {
            if let Err(e) = self.conn.close(REPLY_SUCCESS, "closing").await {
                debug!(error = %e, "amqp: error while closing connection");
            }
        }
    }

    fn is_closed(&self) -> bool {
        *self.closed.borrow() || !self.conn.status().connected()
    }
}

struct AmqpChannel {
    channel: lapin::Channel,
}

#[async_trait]
impl Channel for AmqpChannel {
    async fn qos(&self, prefetch_count: u16) -> Result<()> {
        self.channel
            .basic_qos(prefetch_count, BasicQosOptions { global: false })
            .await
            .map_err(|e| BusError::Channel(format!("Failed to set qos: {}", e)))
    }

    async fn exchange_declare(&self, exchange: &ExchangeSpec) -> Result<()> {
        self.channel
            .exchange_declare(
                &exchange.name,
                exchange_kind(exchange.kind),
                ExchangeDeclareOptions {
                    durable: exchange.durable,
                    auto_delete: exchange.auto_delete,
                    ..Default::default()
                },
                to_amqp_table(&exchange.arguments()),
            )
            .await
            .map_err(|e| {
                BusError::Topology(format!("Failed to declare exchange {}: {}", exchange.name, e))
            })
    }

    async fn queue_declare(&self, queue: &QueueSpec) -> Result<()> {
        self.channel
            .queue_declare(
                &queue.name,
                QueueDeclareOptions {
                    durable: queue.durable,
                    ..Default::default()
                },
                to_amqp_table(&queue.arguments()),
            )
            .await
            .map(|_| ())
            .map_err(|e| BusError::Topology(format!("Failed to declare queue {}: {}", queue.name, e)))
    }

    async fn queue_bind(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        self.channel
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                AmqpFieldTable::default(),
            )
            .await
            .map_err(|e| BusError::Topology(format!("Failed to bind queue {}: {}", queue, e)))
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_ack: false,
                    ..Default::default()
                },
                AmqpFieldTable::default(),
            )
            .await
            .map_err(|e| BusError::Topology(format!("Failed to start consumer: {}", e)))?;

        let deliveries = consumer.map(|delivery| {
            delivery
                .map(|d| {
                    let headers = d
                        .properties
                        .headers()
                        .as_ref()
                        .map(from_amqp_table)
                        .unwrap_or_default();
                    Delivery::new(
                        d.routing_key.as_str(),
                        d.data,
                        headers,
                        d.redelivered,
                        Box::new(AmqpAcker { acker: d.acker }),
                    )
                })
                .map_err(|e| BusError::Channel(format!("Delivery failed: {}", e)))
        });

        Ok(Box::pin(deliveries))
    }

    async fn publish(&self, publishing: &Publishing) -> Result<()> {
        let mut properties = BasicProperties::default();
        if let Some(content_type) = &publishing.content_type {
            properties = properties.with_content_type(content_type.as_str().into());
        }
        if publishing.persistent {
            properties = properties.with_delivery_mode(DELIVERY_MODE_PERSISTENT);
        }
        if !publishing.headers.is_empty() {
            properties = properties.with_headers(to_amqp_table(&publishing.headers));
        }

        let confirm = self
            .channel
            .basic_publish(
                &publishing.exchange,
                &publishing.routing_key,
                BasicPublishOptions {
                    mandatory: publishing.mandatory,
                    immediate: publishing.immediate,
                },
                &publishing.body,
                properties,
            )
            .await
            .map_err(|e| BusError::Publish(format!("Failed to publish: {}", e)))?;

        confirm
            .await
            .map(|_| ())
            .map_err(|e| BusError::Publish(format!("Publish confirmation failed: {}", e)))
    }

    async fn close(&self) {
        if self.channel.status().connected() {
            if let Err(e) = self.channel.close(REPLY_SUCCESS, "closing").await {
                debug!(error = %e, "amqp: error while closing channel");
            }
        }
    }
}

struct AmqpAcker {
    acker: Acker,
}

#[async_trait]
impl Acknowledger for AmqpAcker {
    async fn ack(&self) -> Result<()> {
        self.acker
            .ack(BasicAckOptions { multiple: false })
            .await
            .map_err(|e| BusError::Ack(format!("Failed to ack message: {}", e)))
    }

    async fn nack(&self, requeue: bool) -> Result<()> {
        self.acker
            .nack(BasicNackOptions {
                multiple: false,
                requeue,
            })
            .await
            .map_err(|e| BusError::Ack(format!("Failed to nack message: {}", e)))
    }
}

fn exchange_kind(kind: ExchangeKind) -> AmqpExchangeKind {
    match kind {
        ExchangeKind::Topic => AmqpExchangeKind::Topic,
        ExchangeKind::Fanout => AmqpExchangeKind::Fanout,
        ExchangeKind::DelayedTopic => AmqpExchangeKind::Custom(kind.as_str().to_string()),
    }
}

fn to_amqp_table(fields: &FieldTable) -> AmqpFieldTable {
    let mut table = AmqpFieldTable::default();
    for (key, value) in fields {
        let value = match value {
            FieldValue::Str(s) => AMQPValue::LongString(s.as_str().into()),
            FieldValue::Int(i) => AMQPValue::LongLongInt(*i),
            FieldValue::Bool(b) => AMQPValue::Boolean(*b),
        };
        table.insert(key.as_str().into(), value);
    }
    table
}

fn from_amqp_table(table: &AmqpFieldTable) -> FieldTable {
    table
        .inner()
        .iter()
        .filter_map(|(key, value)| {
            let value = match value {
                AMQPValue::LongString(s) => {
                    FieldValue::Str(String::from_utf8_lossy(s.as_bytes()).into_owned())
                }
                AMQPValue::ShortString(s) => FieldValue::Str(s.as_str().to_string()),
                AMQPValue::Boolean(b) => FieldValue::Bool(*b),
                AMQPValue::ShortShortInt(i) => FieldValue::Int(i64::from(*i)),
                AMQPValue::ShortShortUInt(i) => FieldValue::Int(i64::from(*i)),
                AMQPValue::ShortInt(i) => FieldValue::Int(i64::from(*i)),
                AMQPValue::ShortUInt(i) => FieldValue::Int(i64::from(*i)),
                AMQPValue::LongInt(i) => FieldValue::Int(i64::from(*i)),
                AMQPValue::LongUInt(i) => FieldValue::Int(i64::from(*i)),
                AMQPValue::LongLongInt(i) => FieldValue::Int(*i),
                _ => return None,
            };
            Some((key.as_str().to_string(), value))
        })
        .collect()
}
