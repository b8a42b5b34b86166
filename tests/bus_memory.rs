//! Pipeline scenarios against the in-process broker.
//!
//! Run with: cargo test --test bus_memory --features test-utils
//!
//! Exercises the connection manager, consumer and publisher together the way
//! a stage process wires them, without a running RabbitMQ.

use std::sync::Arc;
use std::time::Duration;

use fileflow::bus::topology::{DEAD_LETTER_EXCHANGE, DEFAULT_EXCHANGE, DEFAULT_QUEUE, TSV_CREATED};
use fileflow::bus::{
    BusError, ConnectionEvent, ConnectionManager, Consumer, ConsumerConfig, ExchangeSpec,
    FileEvent, MemoryBroker, Publisher,
};
use fileflow::test_utils::{eventually, eventually_async, fast_connection_options, RecordingService};

const WAIT: Duration = Duration::from_secs(3);

fn exchange() -> ExchangeSpec {
    ExchangeSpec::primary(DEFAULT_EXCHANGE, true)
}

/// A running stage: manager, consumer bound on `tsv.created`, and a publisher
/// on the same key.
struct Stage {
    broker: MemoryBroker,
    manager: ConnectionManager,
    publisher: Publisher,
    service: RecordingService,
    consumer_task: tokio::task::JoinHandle<fileflow::bus::Result<()>>,
}

impl Stage {
    async fn start(broker: MemoryBroker) -> Self {
        let manager = ConnectionManager::new(broker.clone(), fast_connection_options());
        let service = RecordingService::new();
        let consumer = Consumer::new(
            manager.clone(),
            ConsumerConfig::new(exchange(), TSV_CREATED),
            Arc::new(service.clone()),
        );
        let consumer_task = tokio::spawn(async move { consumer.start().await });
        let publisher = Publisher::new(manager.clone(), exchange(), TSV_CREATED);

        assert!(eventually(WAIT, || broker.consumer_count(DEFAULT_QUEUE) == 1).await);
        assert!(eventually_async(WAIT, || publisher.is_ready()).await);

        Self {
            broker,
            manager,
            publisher,
            service,
            consumer_task,
        }
    }

    async fn stop(self) {
        self.manager.close().await;
        let result = tokio::time::timeout(WAIT, self.consumer_task)
            .await
            .expect("consumer did not stop")
            .expect("consumer task panicked");
        assert!(matches!(result, Err(BusError::NotifierClosed)));
    }
}

// ============================================================================
// End-to-end scenarios
// ============================================================================

#[tokio::test]
async fn test_published_event_is_handled_and_acked() {
    let stage = Stage::start(MemoryBroker::new()).await;

    stage.publisher.file_created("1", "/a").await.unwrap();

    let call = stage.service.next_call(WAIT).await.expect("handler not invoked");
    assert_eq!(call, FileEvent::new("1", "/a"));
    assert!(eventually(WAIT, || stage.broker.ack_count() == 1).await);
    assert_eq!(stage.broker.nack_count(), 0);
    assert_eq!(stage.broker.unacked_count(DEFAULT_QUEUE), 0);
    assert_eq!(stage.broker.queue_depth(DEFAULT_QUEUE), 0);

    stage.stop().await;
}

#[tokio::test]
async fn test_undecodable_body_is_dead_lettered() {
    let broker = MemoryBroker::new();
    broker.bind_queue("dead-letters", &ExchangeSpec::dead_letter(DEAD_LETTER_EXCHANGE), "");
    let stage = Stage::start(broker.clone()).await;

    broker
        .publish(DEFAULT_EXCHANGE, TSV_CREATED, b"this is not json")
        .unwrap();

    assert!(eventually(WAIT, || broker.queue_depth("dead-letters") == 1).await);
    assert_eq!(broker.nack_count(), 1);
    assert_eq!(broker.requeue_count(), 0);
    assert_eq!(broker.queue_depth(DEFAULT_QUEUE), 0);
    assert_eq!(broker.unacked_count(DEFAULT_QUEUE), 0);
    assert_eq!(stage.service.calls(), 0);

    let dead = broker.take_ready("dead-letters");
    assert_eq!(dead[0].body, b"this is not json");

    stage.stop().await;
}

#[tokio::test]
async fn test_forced_reconnect_resumes_consuming() {
    let stage = Stage::start(MemoryBroker::new()).await;
    let dials = stage.broker.dial_count();

    stage.manager.reconnect().await;

    assert!(eventually(WAIT, || stage.broker.dial_count() > dials).await);
    assert!(eventually(WAIT, || stage.broker.consumer_count(DEFAULT_QUEUE) == 1).await);
    assert!(eventually_async(WAIT, || stage.publisher.is_ready()).await);
    assert_eq!(stage.broker.open_connections(), 1);

    stage.publisher.file_created("2", "/b").await.unwrap();

    let call = stage.service.next_call(WAIT).await.expect("handler not invoked");
    assert_eq!(call, FileEvent::new("2", "/b"));
    assert!(eventually(WAIT, || stage.broker.ack_count() == 1).await);

    stage.stop().await;
}

#[tokio::test]
async fn test_broker_outage_recovers() {
    let stage = Stage::start(MemoryBroker::new()).await;

    stage.broker.set_reachable(false);
    stage.broker.drop_connections();
    assert!(
        eventually_async(WAIT, || {
            let publisher = stage.publisher.clone();
            async move { !publisher.is_ready().await }
        })
        .await
    );

    stage.broker.set_reachable(true);
    assert!(eventually(WAIT, || stage.broker.consumer_count(DEFAULT_QUEUE) == 1).await);
    assert!(eventually_async(WAIT, || stage.publisher.is_ready()).await);

    stage.publisher.file_created("3", "/c").await.unwrap();
    let call = stage.service.next_call(WAIT).await.expect("handler not invoked");
    assert_eq!(call, FileEvent::new("3", "/c"));

    stage.stop().await;
}

// ============================================================================
// Properties
// ============================================================================

#[tokio::test]
async fn test_close_is_idempotent_under_concurrency() {
    let broker = MemoryBroker::new();
    let manager = ConnectionManager::new(broker.clone(), fast_connection_options());
    let mut listener = manager.notify_connection().await;
    assert!(matches!(
        tokio::time::timeout(WAIT, listener.recv()).await.unwrap(),
        Some(ConnectionEvent::Connected(_))
    ));

    let closers: Vec<_> = (0..8)
        .map(|_| {
            let manager = manager.clone();
            tokio::spawn(async move { manager.close().await })
        })
        .collect();
    for closer in closers {
        closer.await.unwrap();
    }
    manager.close().await;

    assert!(manager.is_closed());
    assert!(tokio::time::timeout(WAIT, listener.recv())
        .await
        .unwrap()
        .is_none());
    assert_eq!(broker.open_connections(), 0);
    assert_eq!(manager.listener_count().await, 0);
}

#[tokio::test]
async fn test_listener_observes_connections_in_order() {
    let broker = MemoryBroker::new();
    let manager = ConnectionManager::new(broker.clone(), fast_connection_options());
    let mut listener = manager.notify_connection().await;

    let first = match tokio::time::timeout(WAIT, listener.recv()).await.unwrap() {
        Some(ConnectionEvent::Connected(conn)) => conn,
        other => panic!("expected connection, got {:?}", other),
    };

    manager.reconnect().await;

    assert!(matches!(
        tokio::time::timeout(WAIT, listener.recv()).await.unwrap(),
        Some(ConnectionEvent::Lost)
    ));
    let second = match tokio::time::timeout(WAIT, listener.recv()).await.unwrap() {
        Some(ConnectionEvent::Connected(conn)) => conn,
        other => panic!("expected connection, got {:?}", other),
    };

    assert!(first.is_closed());
    assert!(!second.is_closed());
    assert!(!std::ptr::addr_eq(Arc::as_ptr(&first), Arc::as_ptr(&second)));

    manager.close().await;
}

#[tokio::test]
async fn test_late_listener_receives_current_connection() {
    let broker = MemoryBroker::new();
    let manager = ConnectionManager::new(broker.clone(), fast_connection_options());
    assert!(eventually_async(WAIT, || manager.is_connected()).await);
    let dials = broker.dial_count();

    let mut listener = manager.notify_connection().await;

    match tokio::time::timeout(WAIT, listener.recv()).await.unwrap() {
        Some(ConnectionEvent::Connected(conn)) => assert!(!conn.is_closed()),
        other => panic!("expected connection, got {:?}", other),
    }
    assert_eq!(broker.dial_count(), dials);

    manager.close().await;
}

#[tokio::test]
async fn test_successful_deliveries_acked_exactly_once() {
    let stage = Stage::start(MemoryBroker::new()).await;

    for i in 0..5 {
        stage
            .publisher
            .file_created(&i.to_string(), &format!("/data/{}.tsv", i))
            .await
            .unwrap();
    }

    assert!(eventually(WAIT, || stage.broker.ack_count() == 5).await);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(stage.broker.ack_count(), 5);
    assert_eq!(stage.broker.nack_count(), 0);
    assert_eq!(stage.service.calls(), 5);

    stage.stop().await;
}

#[tokio::test]
async fn test_poison_message_does_not_block_channel() {
    let stage = Stage::start(MemoryBroker::new()).await;

    stage
        .broker
        .publish(DEFAULT_EXCHANGE, TSV_CREATED, b"{broken")
        .unwrap();
    stage.publisher.file_created("4", "/d").await.unwrap();

    let call = stage.service.next_call(WAIT).await.expect("handler not invoked");
    assert_eq!(call, FileEvent::new("4", "/d"));
    assert!(eventually(WAIT, || stage.broker.ack_count() == 1).await);
    assert_eq!(stage.broker.nack_count(), 1);
    assert_eq!(stage.broker.requeue_count(), 0);

    stage.stop().await;
}

#[tokio::test]
async fn test_publish_without_channel_is_rejected() {
    let broker = MemoryBroker::new();
    broker.set_reachable(false);
    broker.bind_queue("observed", &exchange(), "#");
    let manager = ConnectionManager::new(broker.clone(), fast_connection_options());
    let publisher = Publisher::new(manager.clone(), exchange(), TSV_CREATED);

    let result = publisher.file_created("5", "/e").await;

    assert!(matches!(result, Err(BusError::NotConnected)));
    assert_eq!(broker.queue_depth("observed"), 0);
    assert_eq!(broker.open_connections(), 0);

    manager.close().await;
}
