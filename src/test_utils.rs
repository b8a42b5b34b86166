//! Test utilities shared by unit and integration tests.
//!
//! Provides a recording `EventService` and polling helpers for asserting on
//! asynchronous broker state.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};

use crate::bus::{BusError, ConnectionOptions, EventService, FileEvent, Result};

/// Connection options with millisecond delays for tests.
pub fn fast_connection_options() -> ConnectionOptions {
    ConnectionOptions {
        reconnect_delay: Duration::from_millis(10),
        notify_timeout: Duration::from_millis(200),
    }
}

/// Poll `check` until it returns true or `timeout` elapses.
pub async fn eventually<F>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Async variant of [`eventually`].
pub async fn eventually_async<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Event service that records every call and can be told to fail.
#[derive(Clone)]
pub struct RecordingService {
    calls: Arc<AtomicUsize>,
    fail: Arc<AtomicBool>,
    tx: mpsc::UnboundedSender<FileEvent>,
    rx: Arc<Mutex<mpsc::UnboundedReceiver<FileEvent>>>,
}

impl Default for RecordingService {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordingService {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            calls: Arc::new(AtomicUsize::new(0)),
            fail: Arc::new(AtomicBool::new(false)),
            tx,
            rx: Arc::new(Mutex::new(rx)),
        }
    }

    /// Service whose every call fails.
    pub fn failing() -> Self {
        let service = Self::new();
        service.set_failing(true);
        service
    }

    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Next recorded call, or `None` after `timeout`.
    pub async fn next_call(&self, timeout: Duration) -> Option<FileEvent> {
        let mut rx = self.rx.lock().await;
        tokio::time::timeout(timeout, rx.recv()).await.ok().flatten()
    }
}

#[async_trait]
impl EventService for RecordingService {
    async fn handle(&self, event_id: &str, file_path: &str) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let _ = self.tx.send(FileEvent::new(event_id, file_path));
        if self.fail.load(Ordering::SeqCst) {
            return Err(BusError::Handler(format!(
                "recording service failure for {}",
                event_id
            )));
        }
        Ok(())
    }
}
