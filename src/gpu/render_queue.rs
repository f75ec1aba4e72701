//! Serialized render command stream
//!
//! GPU copies, readbacks, readback completions and hardware encode
//! submissions all execute on one dedicated thread in enqueue order. The
//! frame slot map is only mutated from here.

use parking_lot::Mutex;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, warn};

use crate::error::{PublisherError, Result};

type RenderCommand = Box<dyn FnOnce() + Send + 'static>;

/// Handle to the render thread
pub struct RenderQueue {
    tx: Mutex<Option<mpsc::UnboundedSender<RenderCommand>>>,
    thread: Mutex<Option<JoinHandle<()>>>,
    thread_id: ThreadId,
    executed: Arc<AtomicU64>,
}

impl RenderQueue {
    /// Spawn the render thread
    pub fn new(name: &str) -> Result<Arc<Self>> {
        let (tx, mut rx) = mpsc::unbounded_channel::<RenderCommand>();
        let executed = Arc::new(AtomicU64::new(0));
        let executed_clone = executed.clone();

        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                while let Some(command) = rx.blocking_recv() {
                    if catch_unwind(AssertUnwindSafe(command)).is_err() {
                        error!("Render command panicked");
                    }
                    executed_clone.fetch_add(1, Ordering::Relaxed);
                }
                debug!("Render queue drained, thread exiting");
            })
            .map_err(|e| PublisherError::Gpu(format!("Failed to spawn render thread: {}", e)))?;

        Ok(Arc::new(Self {
            tx: Mutex::new(Some(tx)),
            thread_id: handle.thread().id(),
            thread: Mutex::new(Some(handle)),
            executed,
        }))
    }

    /// Append a command; returns false after shutdown
    pub fn enqueue<F>(&self, command: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        match self.tx.lock().as_ref() {
            Some(tx) => tx.send(Box::new(command)).is_ok(),
            None => {
                warn!("Render queue is shut down, dropping command");
                false
            }
        }
    }

    /// Wait until every command enqueued so far has executed
    pub async fn flush(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.enqueue(move || {
            let _ = done_tx.send(());
        }) {
            let _ = done_rx.await;
        }
    }

    /// Blocking variant of [`flush`](Self::flush) for non-async callers
    pub fn flush_blocking(&self) {
        if self.is_render_thread() {
            return;
        }
        let (done_tx, done_rx) = std::sync::mpsc::channel();
        if self.enqueue(move || {
            let _ = done_tx.send(());
        }) {
            let _ = done_rx.recv();
        }
    }

    pub fn is_render_thread(&self) -> bool {
        thread::current().id() == self.thread_id
    }

    pub fn commands_executed(&self) -> u64 {
        self.executed.load(Ordering::Relaxed)
    }

    /// Close the queue and join the thread after pending commands run
    pub fn shutdown(&self) {
        self.tx.lock().take();
        if self.is_render_thread() {
            return;
        }
        if let Some(handle) = self.thread.lock().take() {
            if handle.join().is_err() {
                error!("Render thread terminated abnormally");
            }
        }
    }
}

impl Drop for RenderQueue {
    fn drop(&mut self) {
        self.shutdown();
    }
}
