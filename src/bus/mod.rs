//! Message bus plumbing for pipeline stages.
//!
//! This module contains:
//! - `ConnectionManager`: owns the single broker connection and fans out
//!   connection availability to subscribers
//! - `Consumer`: declares topology on every connection and dispatches
//!   deliveries to an `EventService`
//! - `Publisher`: keeps a ready channel and publishes `FileEvent`s
//! - Broker seams (`Transport`, `Connection`, `Channel`) with two
//!   implementations: AMQP (RabbitMQ via lapin) and an in-process broker

use async_trait::async_trait;

// Implementation modules
#[cfg(feature = "amqp")]
pub mod amqp;
pub mod connection;
pub mod consumer;
pub mod envelope;
pub mod memory;
pub mod publisher;
pub mod topology;
pub mod transport;

// Re-exports
#[cfg(feature = "amqp")]
pub use amqp::AmqpTransport;
pub use connection::{ConnectionEvent, ConnectionManager, ConnectionOptions, Listener};
pub use consumer::{Consumer, ConsumerConfig, RetryPolicy};
pub use envelope::FileEvent;
pub use memory::MemoryBroker;
pub use publisher::{HeaderInjector, Publisher};
pub use topology::{ExchangeKind, ExchangeSpec, QueueSpec, Topology};
pub use transport::{
    Acknowledger, Channel, Connection, Delivery, DeliveryStream, FieldTable, FieldValue,
    Publishing, Transport,
};

// ============================================================================
// Errors
// ============================================================================

/// Result type for bus operations.
pub type Result<T> = std::result::Result<T, BusError>;

/// Errors that can occur during bus operations.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Channel failed: {0}")]
    Channel(String),

    #[error("Topology declaration failed: {0}")]
    Topology(String),

    #[error("Publish failed: {0}")]
    Publish(String),

    #[error("No available amqp channel in publisher")]
    NotConnected,

    #[error("Failed to marshal payload for event ID = {event_id}: {source}")]
    Encode {
        event_id: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Failed to decode message body: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("Acknowledgement failed: {0}")]
    Ack(String),

    #[error("Handler failed: {0}")]
    Handler(String),

    #[error("Connection notifier exited")]
    NotifierClosed,
}

// ============================================================================
// Collaborators
// ============================================================================

/// Business logic invoked for every successfully decoded delivery.
///
/// Returning an error hands the delivery to the consumer's `RetryPolicy`.
#[async_trait]
pub trait EventService: Send + Sync {
    async fn handle(&self, event_id: &str, file_path: &str) -> Result<()>;
}
