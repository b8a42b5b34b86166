//! fileflow-stage: Pipeline stage worker
//!
//! Consumes file events bound on the configured routing key and announces
//! each file downstream on the publisher routing key.
//!
//! ## Architecture
//! ```text
//! [exchange: consumer.routing_key] -> [fileflow-stage] -> [exchange: publisher.routing_key]
//!                                            |
//!                                            v
//!                                  [dead-letter exchange]
//! ```
//!
//! ## Configuration
//! - `--config <path>` or FILEFLOW_CONFIG: YAML configuration file
//! - FILEFLOW__AMQP__URL: RabbitMQ connection string
//! - FILEFLOW__CONSUMER__ROUTING_KEY: Input routing key
//! - FILEFLOW__PUBLISHER__ROUTING_KEY: Output routing key
//! - FILEFLOW_LOG / FILEFLOW_LOG_FORMAT: Log filter and format

use std::sync::Arc;

use tracing::{error, info};

use fileflow::bus::{AmqpTransport, ConnectionManager, Consumer, Publisher};
use fileflow::config::{parse_config_path, Config};
use fileflow::stage::ForwardingStage;
use fileflow::utils::bootstrap::{init_tracing, shutdown_signal};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let config_path = parse_config_path();
    let config = Config::load(config_path.as_deref()).map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;

    info!(
        exchange = %config.amqp.exchange,
        input = %config.consumer.routing_key,
        output = %config.publisher.routing_key,
        queue = %config.consumer.queue,
        "Starting fileflow-stage"
    );

    let manager = ConnectionManager::new(
        AmqpTransport::new(config.amqp.url.clone()),
        config.amqp.connection_options(),
    );
    let publisher = Publisher::new(
        manager.clone(),
        config.amqp.exchange_spec(),
        config.publisher.routing_key.clone(),
    );
    let consumer = Consumer::new(
        manager.clone(),
        config.consumer_config(),
        Arc::new(ForwardingStage::new(publisher.clone())),
    );

    let outcome = tokio::select! {
        result = consumer.start() => Some(result),
        _ = shutdown_signal() => None,
    };

    publisher.close();
    manager.close().await;

    match outcome {
        None => {
            info!("fileflow-stage stopped");
            Ok(())
        }
        Some(Err(e)) => {
            error!(error = %e, "Consumer stopped");
            Err(e.into())
        }
        Some(Ok(())) => {
            error!("Consumer stopped unexpectedly");
            Err("consumer stopped unexpectedly".into())
        }
    }
}
