//! Consumer: declares topology on every new connection and dispatches
//! deliveries to an [`EventService`].
//!
//! Delivery outcomes:
//! - body does not decode: nack without requeue (dead-lettered)
//! - service succeeds: ack
//! - service fails: delayed retry through the primary exchange, dead-lettered
//!   once the retry limit is reached

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn, Instrument};

use super::connection::{ConnectionEvent, ConnectionManager};
use super::envelope::{FileEvent, CONTENT_TYPE_JSON};
use super::topology::{
    topic_matches, ExchangeSpec, Topology, CSV_PARTITION_CREATED, DEAD_LETTER_EXCHANGE,
    DEFAULT_QUEUE, HEADER_DELAY,
};
use super::transport::{Channel, Connection, Delivery, DeliveryStream, FieldValue, Publishing};
use super::{BusError, EventService, Result};

/// Unacknowledged deliveries the broker hands out per channel.
pub const DEFAULT_PREFETCH_COUNT: u16 = 1;
/// Delay before a failed delivery is retried.
pub const DEFAULT_REQUEUE_DELAY: Duration = Duration::from_secs(60);
/// Retries before a failing delivery is dead-lettered.
pub const DEFAULT_REQUEUE_LIMIT: u32 = 3;
/// Header counting how often a delivery has been retried.
pub const HEADER_RETRY_COUNT: &str = "x-retry-count";
/// Consumer tag announced to the broker.
pub const DEFAULT_CONSUMER_TAG: &str = "fileflow-consumer";

/// What happens to a delivery whose handler failed.
///
/// Retries are republished to the primary exchange under the delivery's own
/// routing key, so every queue bound to that key receives the retry, not
/// only this consumer's queue. Give each stage its own routing key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Delay applied through the delayed-message exchange. Ignored by plain
    /// topic exchanges, which retry immediately.
    pub requeue_delay: Duration,
    /// Retries before the delivery goes to the dead-letter exchange.
    pub requeue_limit: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            requeue_delay: DEFAULT_REQUEUE_DELAY,
            requeue_limit: DEFAULT_REQUEUE_LIMIT,
        }
    }
}

/// Consumer configuration.
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    pub topology: Topology,
    pub prefetch_count: u16,
    pub consumer_tag: String,
    pub retry: RetryPolicy,
}

impl ConsumerConfig {
    /// Default queue and dead-letter exchange bound to `routing_key` on `exchange`.
    pub fn new(exchange: ExchangeSpec, routing_key: impl Into<String>) -> Self {
        Self {
            topology: Topology::new(exchange, DEFAULT_QUEUE, DEAD_LETTER_EXCHANGE, routing_key),
            prefetch_count: DEFAULT_PREFETCH_COUNT,
            consumer_tag: DEFAULT_CONSUMER_TAG.to_string(),
            retry: RetryPolicy::default(),
        }
    }

    /// Default configuration for the partition stage.
    pub fn partitions(exchange: ExchangeSpec) -> Self {
        Self::new(exchange, CSV_PARTITION_CREATED)
    }

    pub fn with_queue(
        mut self,
        queue: impl Into<String>,
        dead_letter_exchange: impl Into<String>,
    ) -> Self {
        self.topology = Topology::new(
            self.topology.exchange,
            queue,
            dead_letter_exchange,
            self.topology.routing_key,
        );
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

struct ConsumerInner {
    manager: ConnectionManager,
    config: ConsumerConfig,
    service: Arc<dyn EventService>,
    /// Channel of the current connection; `None` between connections.
    channel: Mutex<Option<Arc<dyn Channel>>>,
}

/// Streams deliveries from the configured queue into an [`EventService`].
#[derive(Clone)]
pub struct Consumer {
    inner: Arc<ConsumerInner>,
}

impl Consumer {
    pub fn new(
        manager: ConnectionManager,
        config: ConsumerConfig,
        service: Arc<dyn EventService>,
    ) -> Self {
        Self {
            inner: Arc::new(ConsumerInner {
                manager,
                config,
                service,
                channel: Mutex::new(None),
            }),
        }
    }

    pub fn config(&self) -> &ConsumerConfig {
        &self.inner.config
    }

    /// Follow connection notifications until the manager shuts down.
    ///
    /// Only returns once the notifier is closed, which callers should treat
    /// as fatal.
    pub async fn start(&self) -> Result<()> {
        let mut listener = self.inner.manager.notify_connection().await;

        while let Some(event) = listener.recv().await {
            match event {
                ConnectionEvent::Connected(conn) => self.inner.clone().connected(conn).await,
                ConnectionEvent::Lost => {
                    self.inner.channel.lock().await.take();
                    debug!("Consumer channel released after connection loss");
                }
            }
        }

        Err(BusError::NotifierClosed)
    }
}

impl ConsumerInner {
    async fn connected(self: Arc<Self>, conn: Arc<dyn Connection>) {
        if let Err(e) = self.clone().setup(conn.clone()).await {
            // Partial topology is discarded by starting over on a new connection.
            // A stale connection is left alone; its replacement gets its own setup.
            self.manager.invalidate(&conn).await;
            error!(error = %e, "Consumer setup failed, forcing reconnect");
        }
    }

    async fn setup(self: Arc<Self>, conn: Arc<dyn Connection>) -> Result<()> {
        let channel = conn.open_channel().await?;

        if let Err(e) = self.declare(channel.as_ref()).await {
            channel.close().await;
            return Err(e);
        }

        let topology = &self.config.topology;
        let deliveries = match channel
            .consume(&topology.queue.name, &self.config.consumer_tag)
            .await
        {
            Ok(deliveries) => deliveries,
            Err(e) => {
                channel.close().await;
                return Err(e);
            }
        };

        *self.channel.lock().await = Some(channel.clone());

        info!(
            queue = %topology.queue.name,
            exchange = %topology.exchange.name,
            routing_key = %topology.routing_key,
            prefetch = self.config.prefetch_count,
            "Consumer connected, processing messages"
        );

        tokio::spawn(self.clone().listen(deliveries, channel, conn));

        Ok(())
    }

    async fn declare(&self, channel: &dyn Channel) -> Result<()> {
        let topology = &self.config.topology;

        channel.qos(self.config.prefetch_count).await?;

        // Sink for nacked messages that are not requeued.
        channel.exchange_declare(&topology.dead_letter).await?;
        channel.exchange_declare(&topology.exchange).await?;
        channel.queue_declare(&topology.queue).await?;
        channel
            .queue_bind(
                &topology.queue.name,
                &topology.exchange.name,
                &topology.routing_key,
            )
            .await
    }

    /// Runs until the delivery stream ends with its channel or connection.
    async fn listen(
        self: Arc<Self>,
        mut deliveries: DeliveryStream,
        channel: Arc<dyn Channel>,
        conn: Arc<dyn Connection>,
    ) {
        while let Some(delivery) = deliveries.next().await {
            match delivery {
                Ok(delivery) => {
                    // Each task owns its delivery; nothing is shared across dispatches.
                    if topic_matches(&self.config.topology.routing_key, &delivery.routing_key) {
                        tokio::spawn(self.clone().dispatch(delivery, channel.clone()));
                    } else {
                        warn!(routing_key = %delivery.routing_key, "Unexpected routing key, rejecting");
                        tokio::spawn(settle(delivery.nack(false), "nack"));
                    }
                }
                Err(e) => {
                    error!(error = %e, "Consumer delivery error");
                    break;
                }
            }
        }

        info!(queue = %self.config.topology.queue.name, "Consumer stream ended");

        // The stream can end while the connection still looks healthy (e.g. a
        // channel-level error). Only the connection we consumed from is retired.
        if !self.manager.is_closed() {
            self.manager.invalidate(&conn).await;
        }
    }

    /// `origin` is the channel the delivery arrived on.
    async fn dispatch(self: Arc<Self>, delivery: Delivery, origin: Arc<dyn Channel>) {
        let event = match FileEvent::decode(&delivery.body) {
            Ok(event) => event,
            Err(e) => {
                warn!(
                    error = %e,
                    routing_key = %delivery.routing_key,
                    "Failed to decode message, dead-lettering"
                );
                settle(delivery.nack(false), "nack").await;
                return;
            }
        };

        let span = tracing::info_span!(
            "bus.consume",
            routing_key = %delivery.routing_key,
            event_id = %event.event_id
        );

        async {
            match self.service.handle(&event.event_id, &event.file_path).await {
                Ok(()) => settle(delivery.ack(), "ack").await,
                Err(e) => {
                    error!(error = %e, file_path = %event.file_path, "Handler failed");
                    self.retry(delivery, origin).await;
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn retry(&self, delivery: Delivery, origin: Arc<dyn Channel>) {
        let policy = &self.config.retry;
        let attempts = delivery
            .header_int(HEADER_RETRY_COUNT)
            .unwrap_or(0)
            .clamp(0, i64::from(u32::MAX)) as u32;

        if attempts >= policy.requeue_limit {
            warn!(attempts, "Retry limit reached, dead-lettering");
            settle(delivery.nack(false), "nack").await;
            return;
        }

        let current = self.channel.lock().await.clone();
        if !current.is_some_and(|c| same_channel(&c, &origin)) {
            // The delivery died with its channel; the broker redelivers it.
            warn!("Delivery channel is gone, leaving delivery to broker redelivery");
            return;
        }

        let mut headers = delivery.headers.clone();
        headers.insert(
            HEADER_DELAY.to_string(),
            FieldValue::Int(policy.requeue_delay.as_millis() as i64),
        );
        headers.insert(
            HEADER_RETRY_COUNT.to_string(),
            FieldValue::Int(i64::from(attempts) + 1),
        );

        let publishing = Publishing {
            exchange: self.config.topology.exchange.name.clone(),
            routing_key: delivery.routing_key.clone(),
            body: delivery.body.clone(),
            content_type: Some(CONTENT_TYPE_JSON.to_string()),
            headers,
            persistent: true,
            ..Default::default()
        };

        match origin.publish(&publishing).await {
            Ok(()) => {
                debug!(
                    attempt = attempts + 1,
                    delay_ms = policy.requeue_delay.as_millis() as u64,
                    "Scheduled retry"
                );
                settle(delivery.ack(), "ack").await;
            }
            Err(e) => {
                error!(error = %e, "Failed to schedule retry, requeueing");
                settle(delivery.nack(true), "nack").await;
            }
        }
    }
}

fn same_channel(a: &Arc<dyn Channel>, b: &Arc<dyn Channel>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

async fn settle(outcome: impl std::future::Future<Output = Result<()>>, action: &'static str) {
    if let Err(e) = outcome.await {
        error!(error = %e, action, "Failed to settle delivery");
    }
}
