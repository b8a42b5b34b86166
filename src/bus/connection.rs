//! Broker connection manager.
//!
//! Keeps at most one live connection, redials forever on a fixed delay and
//! tells every registered listener when a connection becomes available or is
//! lost.
//!
//! ## Fan-out
//!
//! Each listener owns a bounded channel. Broadcasts snapshot the listener set
//! and send to all of them concurrently, each send bounded by the notify
//! timeout. A listener that stops draining drops events instead of stalling
//! the dial loop for everyone else.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use backon::{BackoffBuilder, ConstantBuilder};
use futures::future::join_all;
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, error, info, warn};

use super::transport::{Connection, Transport};

/// Buffered events per listener.
pub const LISTENER_CAPACITY: usize = 16;
/// Delay between dial attempts after the first one.
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(5);
/// Upper bound on a single listener send.
pub const DEFAULT_NOTIFY_TIMEOUT: Duration = Duration::from_secs(10);

/// Connection lifecycle transition delivered to listeners.
#[derive(Clone)]
pub enum ConnectionEvent {
    /// A new connection is ready. Channels from earlier connections are dead.
    Connected(Arc<dyn Connection>),
    /// The current connection went away; stop using its channels.
    Lost,
}

impl fmt::Debug for ConnectionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionEvent::Connected(_) => f.write_str("Connected"),
            ConnectionEvent::Lost => f.write_str("Lost"),
        }
    }
}

/// Receiving half of a listener registration.
///
/// `recv` returns `None` once the manager has been closed.
#[derive(Debug)]
pub struct Listener {
    rx: mpsc::Receiver<ConnectionEvent>,
}

impl Listener {
    pub async fn recv(&mut self) -> Option<ConnectionEvent> {
        self.rx.recv().await
    }
}

/// Connection manager tuning.
#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    pub reconnect_delay: Duration,
    pub notify_timeout: Duration,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            notify_timeout: DEFAULT_NOTIFY_TIMEOUT,
        }
    }
}

struct Inner {
    options: ConnectionOptions,
    /// Lock order: `listeners` before `conn`.
    listeners: Mutex<Vec<mpsc::Sender<ConnectionEvent>>>,
    conn: Mutex<Option<Arc<dyn Connection>>>,
    closed: AtomicBool,
    shutdown: watch::Sender<bool>,
}

/// Owns the process-wide broker connection.
///
/// Cloning yields another handle to the same manager.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl ConnectionManager {
    /// Create the manager and spawn its dial loop on the current runtime.
    pub fn new(transport: impl Transport, options: ConnectionOptions) -> Self {
        let (shutdown, shutdown_rx) = watch::channel(false);
        let inner = Arc::new(Inner {
            options,
            listeners: Mutex::new(Vec::new()),
            conn: Mutex::new(None),
            closed: AtomicBool::new(false),
            shutdown,
        });

        tokio::spawn(dial_loop(inner.clone(), Box::new(transport), shutdown_rx));

        Self { inner }
    }

    /// Register a listener.
    ///
    /// If a connection is already up it is queued on the new listener right
    /// away. Once the manager is closed the returned listener is already
    /// finished.
    pub async fn notify_connection(&self) -> Listener {
        let (tx, rx) = mpsc::channel(LISTENER_CAPACITY);

        let mut listeners = self.inner.listeners.lock().await;
        if self.inner.closed.load(Ordering::SeqCst) {
            return Listener { rx };
        }

        if let Some(conn) = self.inner.conn.lock().await.clone() {
            // Fresh channel with free capacity: cannot block.
            let _ = tx.try_send(ConnectionEvent::Connected(conn));
        }
        listeners.push(tx);

        debug!(listeners = listeners.len(), "amqp: listener registered");

        Listener { rx }
    }

    /// Close the current connection so the dial loop establishes a new one.
    pub async fn reconnect(&self) {
        let conn = self.inner.conn.lock().await.take();
        if let Some(conn) = conn {
            info!("amqp: forcing reconnect");
            conn.close().await;
        }
    }

    /// Close `conn` only if it is still the current connection.
    pub async fn invalidate(&self, conn: &Arc<dyn Connection>) {
        let stale = {
            let mut current = self.inner.conn.lock().await;
            match current.as_ref() {
                Some(c) if same_connection(c, conn) => current.take(),
                _ => None,
            }
        };
        if let Some(conn) = stale {
            info!("amqp: invalidating connection");
            conn.close().await;
        }
    }

    /// Shut the manager down. Only the first call has any effect.
    ///
    /// Stops the dial loop, finishes every listener and closes the connection.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        let _ = self.inner.shutdown.send(true);

        // Dropping the senders finishes every listener.
        self.inner.listeners.lock().await.clear();

        let conn = self.inner.conn.lock().await.take();
        if let Some(conn) = conn {
            conn.close().await;
        }

        info!("amqp: connection manager closed");
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    pub async fn is_connected(&self) -> bool {
        self.inner
            .conn
            .lock()
            .await
            .as_ref()
            .is_some_and(|c| !c.is_closed())
    }

    pub async fn listener_count(&self) -> usize {
        self.inner.listeners.lock().await.len()
    }
}

impl Inner {
    /// Publish `conn` as current and return the listeners to notify.
    ///
    /// Both locks are held so a concurrent registration either sees `conn`
    /// or is part of the returned snapshot, never both.
    async fn install(&self, conn: Arc<dyn Connection>) -> Option<Vec<mpsc::Sender<ConnectionEvent>>> {
        let mut listeners = self.listeners.lock().await;
        let mut current = self.conn.lock().await;
        if self.closed.load(Ordering::SeqCst) {
            return None;
        }
        *current = Some(conn);
        listeners.retain(|l| !l.is_closed());
        Some(listeners.clone())
    }

    /// Forget `conn` if still current and return the listeners to notify.
    async fn uninstall(&self, conn: &Arc<dyn Connection>) -> Vec<mpsc::Sender<ConnectionEvent>> {
        let mut listeners = self.listeners.lock().await;
        let mut current = self.conn.lock().await;
        if current.as_ref().is_some_and(|c| same_connection(c, conn)) {
            *current = None;
        }
        listeners.retain(|l| !l.is_closed());
        listeners.clone()
    }

    async fn broadcast(&self, listeners: Vec<mpsc::Sender<ConnectionEvent>>, event: ConnectionEvent) {
        let timeout = self.options.notify_timeout;
        let sends = listeners.into_iter().map(|listener| {
            let event = event.clone();
            let mut shutdown = self.shutdown.subscribe();
            async move {
                // A send still parked on a full buffer must not land after close.
                tokio::select! {
                    biased;
                    _ = shutdown_signalled(&mut shutdown) => {
                        debug!("amqp: manager closed, dropped pending connection event");
                    }
                    sent = listener.send_timeout(event, timeout) => match sent {
                        Ok(()) => {}
                        Err(SendTimeoutError::Timeout(event)) => {
                            warn!(
                                event = ?event,
                                timeout_ms = timeout.as_millis() as u64,
                                "amqp: listener not draining, dropped connection event"
                            );
                        }
                        // Listener went away; pruned on the next broadcast.
                        Err(SendTimeoutError::Closed(_)) => {}
                    },
                }
            }
        });
        join_all(sends).await;
    }
}

async fn dial_loop(
    inner: Arc<Inner>,
    transport: Box<dyn Transport>,
    mut shutdown: watch::Receiver<bool>,
) {
    // No sleep before the first attempt, a fixed delay after that.
    let mut delays = std::iter::once(Duration::ZERO).chain(
        ConstantBuilder::default()
            .with_delay(inner.options.reconnect_delay)
            .with_max_times(usize::MAX)
            .build(),
    );

    loop {
        let delay = delays.next().unwrap_or(inner.options.reconnect_delay);
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown_signalled(&mut shutdown) => break,
        }

        debug!("amqp: dialing...");

        let dialed = tokio::select! {
            dialed = transport.dial() => dialed,
            _ = shutdown_signalled(&mut shutdown) => break,
        };

        let conn = match dialed {
            Ok(conn) => conn,
            Err(e) => {
                error!(error = %e, retry_ms = inner.options.reconnect_delay.as_millis() as u64, "amqp: could not dial");
                continue;
            }
        };

        info!("amqp: successfully connected");

        let Some(listeners) = inner.install(conn.clone()).await else {
            conn.close().await;
            break;
        };
        inner
            .broadcast(listeners, ConnectionEvent::Connected(conn.clone()))
            .await;

        tokio::select! {
            _ = conn.closed() => {
                info!("amqp: connection was closed");
                let listeners = inner.uninstall(&conn).await;
                inner.broadcast(listeners, ConnectionEvent::Lost).await;
            }
            _ = shutdown_signalled(&mut shutdown) => break,
        }
    }

    debug!("amqp: dial loop exited");
}

pub(super) async fn shutdown_signalled(shutdown: &mut watch::Receiver<bool>) {
    // A dropped sender also means shutdown.
    let _ = shutdown.wait_for(|closed| *closed).await;
}

fn same_connection(a: &Arc<dyn Connection>, b: &Arc<dyn Connection>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}
