//! Publisher: keeps a channel on the current connection and publishes
//! `FileEvent`s on the primary exchange.
//!
//! Publishing is synchronous and never retried here; with no channel
//! available it fails fast with [`BusError::NotConnected`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info};

use super::connection::{shutdown_signalled, ConnectionEvent, ConnectionManager};
use super::envelope::{FileEvent, CONTENT_TYPE_JSON};
use super::topology::ExchangeSpec;
use super::transport::{Channel, Connection, FieldTable, Publishing};
use super::{BusError, Result};

/// Produces headers for each outgoing message, e.g. trace context.
pub type HeaderInjector = Arc<dyn Fn() -> FieldTable + Send + Sync>;

struct PublisherInner {
    manager: ConnectionManager,
    exchange: ExchangeSpec,
    routing_key: String,
    channel: Mutex<Option<Arc<dyn Channel>>>,
    header_injector: OnceLock<HeaderInjector>,
    closed: AtomicBool,
    shutdown: watch::Sender<bool>,
}

/// Publishes file events under a fixed routing key.
///
/// Cloning yields another handle to the same publisher.
#[derive(Clone)]
pub struct Publisher {
    inner: Arc<PublisherInner>,
}

impl Publisher {
    /// Create the publisher and spawn its connection tracking loop.
    pub fn new(
        manager: ConnectionManager,
        exchange: ExchangeSpec,
        routing_key: impl Into<String>,
    ) -> Self {
        let (shutdown, shutdown_rx) = watch::channel(false);
        let inner = Arc::new(PublisherInner {
            manager,
            exchange,
            routing_key: routing_key.into(),
            channel: Mutex::new(None),
            header_injector: OnceLock::new(),
            closed: AtomicBool::new(false),
            shutdown,
        });

        tokio::spawn(track_connection(inner.clone(), shutdown_rx));

        Self { inner }
    }

    /// Install a header injector. Only the first one installed is kept.
    pub fn with_header_injector(self, injector: HeaderInjector) -> Self {
        let _ = self.inner.header_injector.set(injector);
        self
    }

    pub fn routing_key(&self) -> &str {
        &self.inner.routing_key
    }

    /// Whether a channel is currently available.
    pub async fn is_ready(&self) -> bool {
        self.inner.channel.lock().await.is_some()
    }

    /// Announce a new file to the next stage.
    pub async fn file_created(&self, event_id: &str, file_path: &str) -> Result<()> {
        self.publish_event(&FileEvent::new(event_id, file_path)).await
    }

    pub async fn publish_event(&self, event: &FileEvent) -> Result<()> {
        let body = event.encode()?;
        self.publish(body).await?;

        debug!(
            exchange = %self.inner.exchange.name,
            routing_key = %self.inner.routing_key,
            event_id = %event.event_id,
            "Published file event"
        );
        Ok(())
    }

    async fn publish(&self, body: Vec<u8>) -> Result<()> {
        let channel = self
            .inner
            .channel
            .lock()
            .await
            .clone()
            .ok_or(BusError::NotConnected)?;

        let headers = self
            .inner
            .header_injector
            .get()
            .map(|inject| inject())
            .unwrap_or_default();

        channel
            .publish(&Publishing {
                exchange: self.inner.exchange.name.clone(),
                routing_key: self.inner.routing_key.clone(),
                body,
                content_type: Some(CONTENT_TYPE_JSON.to_string()),
                headers,
                mandatory: false,
                immediate: false,
                persistent: true,
            })
            .await
    }

    /// Stop tracking connections. Only the first call has any effect.
    pub fn close(&self) {
        self.inner.close();
    }
}

impl PublisherInner {
    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            let _ = self.shutdown.send(true);
        }
    }

    async fn connected(&self, conn: Arc<dyn Connection>) {
        let channel = match conn.open_channel().await {
            Ok(channel) => channel,
            Err(e) => {
                self.channel.lock().await.take();
                self.manager.invalidate(&conn).await;
                error!(error = %e, "Publisher could not open channel, forcing reconnect");
                return;
            }
        };

        // Safe to repeat on every connection.
        if let Err(e) = channel.exchange_declare(&self.exchange).await {
            channel.close().await;
            // Only forces a redial when `conn` is still the current connection.
            self.manager.invalidate(&conn).await;
            error!(error = %e, exchange = %self.exchange.name, "Publisher topology failed, forcing reconnect");
            return;
        }

        *self.channel.lock().await = Some(channel);

        info!(
            exchange = %self.exchange.name,
            routing_key = %self.routing_key,
            "Publisher ready"
        );
    }
}

async fn track_connection(inner: Arc<PublisherInner>, mut shutdown: watch::Receiver<bool>) {
    let mut listener = inner.manager.notify_connection().await;

    loop {
        let event = tokio::select! {
            _ = shutdown_signalled(&mut shutdown) => break,
            event = listener.recv() => event,
        };

        match event {
            Some(ConnectionEvent::Connected(conn)) => inner.connected(conn).await,
            Some(ConnectionEvent::Lost) => {
                inner.channel.lock().await.take();
                debug!("Publisher channel released after connection loss");
            }
            None => {
                // Manager shut down; nothing more will arrive.
                inner.close();
                break;
            }
        }
    }

    inner.channel.lock().await.take();
    debug!("Publisher connection tracking stopped");
}
