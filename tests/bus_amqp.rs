//! AMQP/RabbitMQ integration tests using testcontainers.
//!
//! Run with: cargo test --test bus_amqp --features amqp,test-utils -- --ignored --nocapture
//!
//! These tests spin up RabbitMQ in a container using testcontainers-rs.
//! No manual RabbitMQ setup required. The stock image ships without the
//! delayed message plugin, so the primary exchange is declared as a plain
//! topic exchange.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use testcontainers::{
    core::{IntoContainerPort, WaitFor},
    runners::AsyncRunner,
    GenericImage, ImageExt,
};

use fileflow::bus::{
    AmqpTransport, BusError, Connection, ConnectionManager, Consumer, ConsumerConfig,
    DeliveryStream, ExchangeSpec, FileEvent, Publisher, QueueSpec, RetryPolicy, Transport,
};
use fileflow::test_utils::{eventually_async, fast_connection_options, RecordingService};

const WAIT: Duration = Duration::from_secs(10);

/// Start RabbitMQ container.
///
/// Returns (container, amqp_url) where amqp_url is suitable for AMQP connection.
async fn start_rabbitmq() -> (testcontainers::ContainerAsync<GenericImage>, String) {
    let image = GenericImage::new("rabbitmq", "3-management")
        .with_exposed_port(5672.tcp())
        .with_wait_for(WaitFor::message_on_stdout("Server startup complete"));

    let container = image
        .with_startup_timeout(Duration::from_secs(60))
        .start()
        .await
        .expect("Failed to start rabbitmq container");

    // Brief delay to ensure RabbitMQ is fully ready
    tokio::time::sleep(Duration::from_secs(2)).await;

    let host_port = container
        .get_host_port_ipv4(5672)
        .await
        .expect("Failed to get mapped port");

    let host = container
        .get_host()
        .await
        .expect("Failed to get container host");

    let amqp_url = format!("amqp://guest:guest@{}:{}", host, host_port);

    println!("RabbitMQ available at: {}", amqp_url);

    (container, amqp_url)
}

/// Names unique to one test so tests can share a broker.
struct Names {
    exchange: String,
    dead_letter: String,
    queue: String,
}

impl Names {
    fn new() -> Self {
        let id = uuid::Uuid::new_v4();
        Self {
            exchange: format!("test-exchange-{}", id),
            dead_letter: format!("test-dlx-{}", id),
            queue: format!("test-queue-{}", id),
        }
    }

    fn exchange_spec(&self) -> ExchangeSpec {
        ExchangeSpec::primary(self.exchange.clone(), false)
    }

    fn consumer_config(&self, routing_key: &str) -> ConsumerConfig {
        ConsumerConfig::new(self.exchange_spec(), routing_key)
            .with_queue(self.queue.clone(), self.dead_letter.clone())
    }
}

/// Observe everything routed to the dead-letter exchange.
///
/// The returned connection must stay alive for the stream to keep flowing.
async fn observe_dead_letters(url: &str, names: &Names) -> (Arc<dyn Connection>, DeliveryStream) {
    let conn = AmqpTransport::new(url).dial().await.expect("dial");
    let channel = conn.open_channel().await.expect("channel");
    let queue = format!("{}-observer", names.dead_letter);

    channel
        .exchange_declare(&ExchangeSpec::dead_letter(names.dead_letter.clone()))
        .await
        .expect("declare dlx");
    channel
        .queue_declare(&QueueSpec::classic(queue.clone()))
        .await
        .expect("declare observer");
    channel
        .queue_bind(&queue, &names.dead_letter, "")
        .await
        .expect("bind observer");
    let stream = channel
        .consume(&queue, "dead-letter-observer")
        .await
        .expect("consume observer");

    (conn, stream)
}

async fn start_consumer(
    manager: &ConnectionManager,
    config: ConsumerConfig,
    service: &RecordingService,
) -> tokio::task::JoinHandle<fileflow::bus::Result<()>> {
    let consumer = Consumer::new(manager.clone(), config, Arc::new(service.clone()));
    let task = tokio::spawn(async move { consumer.start().await });
    // Give the consumer time to declare its topology
    tokio::time::sleep(Duration::from_secs(1)).await;
    task
}

#[tokio::test]
#[ignore = "Requires Docker"]
async fn test_publish_and_consume() {
    println!("=== AMQP Publish and Consume Test ===");
    let (_container, url) = start_rabbitmq().await;
    let names = Names::new();

    let manager = ConnectionManager::new(AmqpTransport::new(&url), fast_connection_options());
    let service = RecordingService::new();
    let task = start_consumer(&manager, names.consumer_config("tsv.created"), &service).await;

    let publisher = Publisher::new(manager.clone(), names.exchange_spec(), "tsv.created");
    assert!(eventually_async(WAIT, || publisher.is_ready()).await);

    publisher.file_created("1", "/a").await.expect("publish");

    let call = service.next_call(WAIT).await.expect("handler not invoked");
    assert_eq!(call, FileEvent::new("1", "/a"));

    manager.close().await;
    let result = tokio::time::timeout(WAIT, task).await.unwrap().unwrap();
    assert!(matches!(result, Err(BusError::NotifierClosed)));
}

#[tokio::test]
#[ignore = "Requires Docker"]
async fn test_undecodable_body_is_dead_lettered() {
    println!("=== AMQP Poison Message Test ===");
    let (_container, url) = start_rabbitmq().await;
    let names = Names::new();
    let (_observer, mut dead_letters) = observe_dead_letters(&url, &names).await;

    let manager = ConnectionManager::new(AmqpTransport::new(&url), fast_connection_options());
    let service = RecordingService::new();
    let _task = start_consumer(&manager, names.consumer_config("tsv.created"), &service).await;

    let conn = AmqpTransport::new(&url).dial().await.expect("dial");
    let channel = conn.open_channel().await.expect("channel");
    channel
        .publish(&fileflow::bus::Publishing {
            exchange: names.exchange.clone(),
            routing_key: "tsv.created".to_string(),
            body: b"not json".to_vec(),
            ..Default::default()
        })
        .await
        .expect("publish raw");

    let delivery = tokio::time::timeout(WAIT, dead_letters.next())
        .await
        .expect("no dead letter")
        .expect("stream ended")
        .expect("delivery error");
    assert_eq!(delivery.body, b"not json");
    delivery.ack().await.expect("ack");
    assert_eq!(service.calls(), 0);

    conn.close().await;
    manager.close().await;
}

#[tokio::test]
#[ignore = "Requires Docker"]
async fn test_failing_handler_dead_letters_after_retries() {
    println!("=== AMQP Retry Limit Test ===");
    let (_container, url) = start_rabbitmq().await;
    let names = Names::new();
    let (_observer, mut dead_letters) = observe_dead_letters(&url, &names).await;

    let manager = ConnectionManager::new(AmqpTransport::new(&url), fast_connection_options());
    let service = RecordingService::failing();
    let config = names.consumer_config("tsv.created").with_retry(RetryPolicy {
        requeue_delay: Duration::from_millis(10),
        requeue_limit: 2,
    });
    let _task = start_consumer(&manager, config, &service).await;

    let publisher = Publisher::new(manager.clone(), names.exchange_spec(), "tsv.created");
    assert!(eventually_async(WAIT, || publisher.is_ready()).await);
    publisher.file_created("2", "/b").await.expect("publish");

    let delivery = tokio::time::timeout(WAIT, dead_letters.next())
        .await
        .expect("no dead letter")
        .expect("stream ended")
        .expect("delivery error");
    assert_eq!(FileEvent::decode(&delivery.body).unwrap(), FileEvent::new("2", "/b"));
    assert_eq!(delivery.header_int("x-retry-count"), Some(2));
    delivery.ack().await.expect("ack");
    assert_eq!(service.calls(), 3);

    manager.close().await;
}

#[tokio::test]
#[ignore = "Requires Docker"]
async fn test_forced_reconnect_resumes_consuming() {
    println!("=== AMQP Reconnect Test ===");
    let (_container, url) = start_rabbitmq().await;
    let names = Names::new();

    let manager = ConnectionManager::new(AmqpTransport::new(&url), fast_connection_options());
    let service = RecordingService::new();
    let _task = start_consumer(&manager, names.consumer_config("tsv.created"), &service).await;
    let publisher = Publisher::new(manager.clone(), names.exchange_spec(), "tsv.created");
    assert!(eventually_async(WAIT, || publisher.is_ready()).await);

    manager.reconnect().await;
    assert!(eventually_async(WAIT, || manager.is_connected()).await);
    assert!(eventually_async(WAIT, || publisher.is_ready()).await);
    // Let the consumer re-declare on the new connection
    tokio::time::sleep(Duration::from_secs(1)).await;

    publisher.file_created("3", "/c").await.expect("publish");

    let call = service.next_call(WAIT).await.expect("handler not invoked");
    assert_eq!(call, FileEvent::new("3", "/c"));

    manager.close().await;
}
