//! In-process broker for tests and local development.
//!
//! Implements the broker seams with enough AMQP semantics to exercise the
//! connection manager, consumer and publisher without RabbitMQ:
//! - topic, fanout and delayed-topic exchanges
//! - queues with a dead-letter exchange argument
//! - per-channel prefetch, manual ack/nack, requeue on channel loss
//! - connection drops, unreachable broker, failing declarations

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tracing::debug;

use super::topology::{topic_matches, ExchangeKind, ExchangeSpec, QueueSpec, HEADER_DELAY};
use super::transport::{
    Acknowledger, Channel, Connection, Delivery, DeliveryStream, FieldTable, Publishing, Transport,
};
use super::{BusError, Result};

/// A message sitting in a queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredMessage {
    pub routing_key: String,
    pub body: Vec<u8>,
    pub headers: FieldTable,
    pub redelivered: bool,
}

struct Binding {
    queue: String,
    exchange: String,
    routing_key: String,
}

struct ConsumerEntry {
    channel_id: u64,
    tx: mpsc::UnboundedSender<Result<Delivery>>,
}

struct Unacked {
    message: StoredMessage,
    channel_id: u64,
}

struct QueueState {
    spec: QueueSpec,
    ready: VecDeque<StoredMessage>,
    consumers: Vec<ConsumerEntry>,
    next_consumer: usize,
    unacked: HashMap<u64, Unacked>,
}

struct ChannelState {
    connection_id: u64,
    prefetch: u16,
    in_flight: usize,
}

#[derive(Default)]
struct BrokerState {
    exchanges: HashMap<String, ExchangeSpec>,
    queues: HashMap<String, QueueState>,
    bindings: Vec<Binding>,
    connections: HashMap<u64, Arc<watch::Sender<bool>>>,
    channels: HashMap<u64, ChannelState>,
    failing_declarations: usize,
    acks: usize,
    nacks: usize,
    requeues: usize,
}

struct BrokerInner {
    state: Mutex<BrokerState>,
    reachable: AtomicBool,
    dials: AtomicUsize,
    next_id: AtomicU64,
}

impl BrokerInner {
    fn state(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }
}

/// In-memory broker. Cloning yields another handle to the same broker.
#[derive(Clone)]
pub struct MemoryBroker {
    inner: Arc<BrokerInner>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                state: Mutex::new(BrokerState::default()),
                reachable: AtomicBool::new(true),
                dials: AtomicUsize::new(0),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// While unreachable every dial fails.
    pub fn set_reachable(&self, reachable: bool) {
        self.inner.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Dial attempts so far, failed ones included.
    pub fn dial_count(&self) -> usize {
        self.inner.dials.load(Ordering::SeqCst)
    }

    pub fn open_connections(&self) -> usize {
        self.inner.state().connections.len()
    }

    /// Make the next `count` exchange/queue declarations or bindings fail.
    pub fn fail_declarations(&self, count: usize) {
        self.inner.state().failing_declarations = count;
    }

    /// Simulate a network failure: every open connection is closed by the broker.
    pub fn drop_connections(&self) {
        let mut state = self.inner.state();
        let ids: Vec<u64> = state.connections.keys().copied().collect();
        for id in ids {
            if let Some(closed) = state.connections.remove(&id) {
                closed.send_replace(true);
            }
            close_connection_channels(&self.inner, &mut state, id);
        }
    }

    /// Declare a plain queue bound to `exchange`, e.g. to collect dead letters.
    pub fn bind_queue(&self, queue: &str, exchange: &ExchangeSpec, routing_key: &str) {
        let mut state = self.inner.state();
        state
            .exchanges
            .entry(exchange.name.clone())
            .or_insert_with(|| exchange.clone());
        state
            .queues
            .entry(queue.to_string())
            .or_insert_with(|| QueueState::new(QueueSpec::classic(queue)));
        state.bindings.push(Binding {
            queue: queue.to_string(),
            exchange: exchange.name.clone(),
            routing_key: routing_key.to_string(),
        });
    }

    /// Publish straight into an exchange, bypassing any client.
    pub fn publish(&self, exchange: &str, routing_key: &str, body: &[u8]) -> Result<()> {
        let message = StoredMessage {
            routing_key: routing_key.to_string(),
            body: body.to_vec(),
            headers: FieldTable::new(),
            redelivered: false,
        };
        let mut state = self.inner.state();
        let queues = route(&mut state, exchange, message)?;
        dispatch_queues(&self.inner, &mut state, queues);
        Ok(())
    }

    pub fn exchange(&self, name: &str) -> Option<ExchangeSpec> {
        self.inner.state().exchanges.get(name).cloned()
    }

    pub fn queue(&self, name: &str) -> Option<QueueSpec> {
        self.inner.state().queues.get(name).map(|q| q.spec.clone())
    }

    /// Messages waiting for a consumer.
    pub fn queue_depth(&self, name: &str) -> usize {
        self.inner
            .state()
            .queues
            .get(name)
            .map_or(0, |q| q.ready.len())
    }

    /// Messages delivered but not yet settled.
    pub fn unacked_count(&self, name: &str) -> usize {
        self.inner
            .state()
            .queues
            .get(name)
            .map_or(0, |q| q.unacked.len())
    }

    pub fn consumer_count(&self, name: &str) -> usize {
        self.inner
            .state()
            .queues
            .get(name)
            .map_or(0, |q| q.consumers.iter().filter(|c| !c.tx.is_closed()).count())
    }

    /// Remove and return the waiting messages of a queue.
    pub fn take_ready(&self, name: &str) -> Vec<StoredMessage> {
        self.inner
            .state()
            .queues
            .get_mut(name)
            .map(|q| q.ready.drain(..).collect())
            .unwrap_or_default()
    }

    pub fn ack_count(&self) -> usize {
        self.inner.state().acks
    }

    pub fn nack_count(&self) -> usize {
        self.inner.state().nacks
    }

    /// Nacks that asked for requeue.
    pub fn requeue_count(&self) -> usize {
        self.inner.state().requeues
    }
}

#[async_trait]
impl Transport for MemoryBroker {
    async fn dial(&self) -> Result<Arc<dyn Connection>> {
        self.inner.dials.fetch_add(1, Ordering::SeqCst);
        if !self.inner.reachable.load(Ordering::SeqCst) {
            return Err(BusError::Connection("broker unreachable".to_string()));
        }

        let id = self.inner.next_id();
        let closed = Arc::new(watch::channel(false).0);
        self.inner.state().connections.insert(id, closed.clone());

        debug!(connection_id = id, "memory: connection opened");

        Ok(Arc::new(MemoryConnection {
            id,
            broker: self.inner.clone(),
            closed,
        }))
    }
}

struct MemoryConnection {
    id: u64,
    broker: Arc<BrokerInner>,
    closed: Arc<watch::Sender<bool>>,
}

#[async_trait]
impl Connection for MemoryConnection {
    async fn open_channel(&self) -> Result<Arc<dyn Channel>> {
        if self.is_closed() {
            return Err(BusError::Channel("connection is closed".to_string()));
        }

        let id = self.broker.next_id();
        self.broker.state().channels.insert(
            id,
            ChannelState {
                connection_id: self.id,
                prefetch: 0,
                in_flight: 0,
            },
        );

        Ok(Arc::new(MemoryChannel {
            id,
            broker: self.broker.clone(),
        }))
    }

    async fn closed(&self) {
        let mut rx = self.closed.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }

    async fn close(&self) {
        self.closed.send_replace(true);
        let mut state = self.broker.state();
        state.connections.remove(&self.id);
        close_connection_channels(&self.broker, &mut state, self.id);
    }

    fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }
}

struct MemoryChannel {
    id: u64,
    broker: Arc<BrokerInner>,
}

impl MemoryChannel {
    fn open_state(&self) -> Result<MutexGuard<'_, BrokerState>> {
        let state = self.broker.state();
        if !state.channels.contains_key(&self.id) {
            return Err(BusError::Channel("channel is closed".to_string()));
        }
        Ok(state)
    }

    fn declaration_state(&self) -> Result<MutexGuard<'_, BrokerState>> {
        let mut state = self.open_state()?;
        if state.failing_declarations > 0 {
            state.failing_declarations -= 1;
            return Err(BusError::Topology("declaration refused".to_string()));
        }
        Ok(state)
    }
}

#[async_trait]
impl Channel for MemoryChannel {
    async fn qos(&self, prefetch_count: u16) -> Result<()> {
        let mut state = self.open_state()?;
        if let Some(channel) = state.channels.get_mut(&self.id) {
            channel.prefetch = prefetch_count;
        }
        Ok(())
    }

    async fn exchange_declare(&self, exchange: &ExchangeSpec) -> Result<()> {
        let mut state = self.declaration_state()?;
        match state.exchanges.get(&exchange.name) {
            Some(existing) if existing.kind != exchange.kind => Err(BusError::Topology(format!(
                "inequivalent arg 'type' for exchange '{}'",
                exchange.name
            ))),
            Some(_) => Ok(()),
            None => {
                state.exchanges.insert(exchange.name.clone(), exchange.clone());
                Ok(())
            }
        }
    }

    async fn queue_declare(&self, queue: &QueueSpec) -> Result<()> {
        let mut state = self.declaration_state()?;
        match state.queues.get(&queue.name) {
            Some(existing) if existing.spec != *queue => Err(BusError::Topology(format!(
                "inequivalent arguments for queue '{}'",
                queue.name
            ))),
            Some(_) => Ok(()),
            None => {
                state
                    .queues
                    .insert(queue.name.clone(), QueueState::new(queue.clone()));
                Ok(())
            }
        }
    }

    async fn queue_bind(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        let mut state = self.declaration_state()?;
        if !state.queues.contains_key(queue) {
            return Err(BusError::Topology(format!("no queue '{}'", queue)));
        }
        if !state.exchanges.contains_key(exchange) {
            return Err(BusError::Topology(format!("no exchange '{}'", exchange)));
        }
        let exists = state
            .bindings
            .iter()
            .any(|b| b.queue == queue && b.exchange == exchange && b.routing_key == routing_key);
        if !exists {
            state.bindings.push(Binding {
                queue: queue.to_string(),
                exchange: exchange.to_string(),
                routing_key: routing_key.to_string(),
            });
        }
        Ok(())
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream> {
        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut state = self.open_state()?;
            let Some(q) = state.queues.get_mut(queue) else {
                return Err(BusError::Topology(format!("no queue '{}'", queue)));
            };
            q.consumers.push(ConsumerEntry {
                channel_id: self.id,
                tx,
            });
            dispatch(&self.broker, &mut state, queue);
        }

        debug!(queue = %queue, consumer_tag = %consumer_tag, "memory: consumer registered");

        let stream = futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|delivery| (delivery, rx))
        });
        Ok(Box::pin(stream))
    }

    async fn publish(&self, publishing: &Publishing) -> Result<()> {
        let message = StoredMessage {
            routing_key: publishing.routing_key.clone(),
            body: publishing.body.clone(),
            headers: publishing.headers.clone(),
            redelivered: false,
        };

        let mut state = self
            .open_state()
            .map_err(|e| BusError::Publish(e.to_string()))?;
        let Some(exchange) = state.exchanges.get(&publishing.exchange).cloned() else {
            return Err(BusError::Publish(format!(
                "no exchange '{}'",
                publishing.exchange
            )));
        };

        let delay = message
            .headers
            .get(HEADER_DELAY)
            .and_then(|v| v.as_int())
            .filter(|ms| *ms > 0 && exchange.kind == ExchangeKind::DelayedTopic);

        match delay {
            Some(ms) => {
                drop(state);
                let broker = self.broker.clone();
                let exchange = exchange.name;
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(ms as u64)).await;
                    let mut state = broker.state();
                    if let Ok(queues) = route(&mut state, &exchange, message) {
                        dispatch_queues(&broker, &mut state, queues);
                    }
                });
            }
            None => {
                let queues = route(&mut state, &exchange.name, message)?;
                dispatch_queues(&self.broker, &mut state, queues);
            }
        }
        Ok(())
    }

    async fn close(&self) {
        let mut state = self.broker.state();
        close_channel(&self.broker, &mut state, self.id);
    }
}

struct MemoryAcker {
    broker: Arc<BrokerInner>,
    queue: String,
    tag: u64,
}

impl MemoryAcker {
    fn settle(&self, state: &mut BrokerState) -> Result<StoredMessage> {
        let unacked = state
            .queues
            .get_mut(&self.queue)
            .and_then(|q| q.unacked.remove(&self.tag))
            .ok_or_else(|| BusError::Ack(format!("unknown delivery tag {}", self.tag)))?;
        if let Some(channel) = state.channels.get_mut(&unacked.channel_id) {
            channel.in_flight = channel.in_flight.saturating_sub(1);
        }
        Ok(unacked.message)
    }
}

#[async_trait]
impl Acknowledger for MemoryAcker {
    async fn ack(&self) -> Result<()> {
        let mut state = self.broker.state();
        self.settle(&mut state)?;
        state.acks += 1;
        dispatch(&self.broker, &mut state, &self.queue);
        Ok(())
    }

    async fn nack(&self, requeue: bool) -> Result<()> {
        let mut state = self.broker.state();
        let mut message = self.settle(&mut state)?;
        state.nacks += 1;

        let mut touched = vec![self.queue.clone()];
        if requeue {
            state.requeues += 1;
            message.redelivered = true;
            if let Some(q) = state.queues.get_mut(&self.queue) {
                q.ready.push_front(message);
            }
        } else {
            let dlx = state
                .queues
                .get(&self.queue)
                .and_then(|q| q.spec.dead_letter_exchange.clone());
            if let Some(dlx) = dlx {
                message.redelivered = false;
                if let Ok(queues) = route(&mut state, &dlx, message) {
                    touched.extend(queues);
                }
            }
        }

        dispatch_queues(&self.broker, &mut state, touched);
        Ok(())
    }
}

impl QueueState {
    fn new(spec: QueueSpec) -> Self {
        Self {
            spec,
            ready: VecDeque::new(),
            consumers: Vec::new(),
            next_consumer: 0,
            unacked: HashMap::new(),
        }
    }
}

/// Enqueue `message` on every queue bound to `exchange`; returns the queues touched.
fn route(state: &mut BrokerState, exchange: &str, message: StoredMessage) -> Result<Vec<String>> {
    let kind = state
        .exchanges
        .get(exchange)
        .map(|e| e.kind)
        .ok_or_else(|| BusError::Publish(format!("no exchange '{}'", exchange)))?;

    let mut targets: Vec<String> = state
        .bindings
        .iter()
        .filter(|b| b.exchange == exchange)
        .filter(|b| !kind.routes_as_topic() || topic_matches(&b.routing_key, &message.routing_key))
        .map(|b| b.queue.clone())
        .collect();
    targets.sort();
    targets.dedup();

    for name in &targets {
        if let Some(q) = state.queues.get_mut(name) {
            q.ready.push_back(message.clone());
        }
    }
    Ok(targets)
}

fn dispatch_queues(broker: &Arc<BrokerInner>, state: &mut BrokerState, queues: Vec<String>) {
    for queue in queues {
        dispatch(broker, state, &queue);
    }
}

/// Hand ready messages to consumers with spare prefetch capacity.
fn dispatch(broker: &Arc<BrokerInner>, state: &mut BrokerState, queue: &str) {
    loop {
        let BrokerState {
            queues, channels, ..
        } = &mut *state;
        let Some(q) = queues.get_mut(queue) else {
            return;
        };
        q.consumers.retain(|c| !c.tx.is_closed());
        if q.ready.is_empty() || q.consumers.is_empty() {
            return;
        }

        let count = q.consumers.len();
        let chosen = (0..count)
            .map(|offset| (q.next_consumer + offset) % count)
            .find(|&i| {
                channels.get(&q.consumers[i].channel_id).is_some_and(|ch| {
                    ch.prefetch == 0 || ch.in_flight < usize::from(ch.prefetch)
                })
            });
        let Some(index) = chosen else {
            return;
        };
        q.next_consumer = (index + 1) % count;

        let Some(message) = q.ready.pop_front() else {
            return;
        };
        let channel_id = q.consumers[index].channel_id;
        let tag = broker.next_id();

        let delivery = Delivery::new(
            message.routing_key.clone(),
            message.body.clone(),
            message.headers.clone(),
            message.redelivered,
            Box::new(MemoryAcker {
                broker: broker.clone(),
                queue: queue.to_string(),
                tag,
            }),
        );

        if q.consumers[index].tx.send(Ok(delivery)).is_err() {
            q.ready.push_front(message);
            continue;
        }

        q.unacked.insert(tag, Unacked { message, channel_id });
        if let Some(channel) = channels.get_mut(&channel_id) {
            channel.in_flight += 1;
        }
    }
}

/// Close a channel: its consumers end and its unsettled messages are requeued.
fn close_channel(broker: &Arc<BrokerInner>, state: &mut BrokerState, channel_id: u64) {
    if state.channels.remove(&channel_id).is_none() {
        return;
    }

    let mut touched = Vec::new();
    for (name, q) in state.queues.iter_mut() {
        q.consumers.retain(|c| c.channel_id != channel_id);

        let mut tags: Vec<u64> = q
            .unacked
            .iter()
            .filter(|(_, u)| u.channel_id == channel_id)
            .map(|(tag, _)| *tag)
            .collect();
        if tags.is_empty() {
            continue;
        }
        // Oldest first once pushed to the front.
        tags.sort_unstable_by(|a, b| b.cmp(a));
        for tag in tags {
            if let Some(mut unacked) = q.unacked.remove(&tag) {
                unacked.message.redelivered = true;
                q.ready.push_front(unacked.message);
            }
        }
        touched.push(name.clone());
    }

    dispatch_queues(broker, state, touched);
}

fn close_connection_channels(broker: &Arc<BrokerInner>, state: &mut BrokerState, connection_id: u64) {
    let channels: Vec<u64> = state
        .channels
        .iter()
        .filter(|(_, ch)| ch.connection_id == connection_id)
        .map(|(id, _)| *id)
        .collect();
    for channel_id in channels {
        close_channel(broker, state, channel_id);
    }
}
