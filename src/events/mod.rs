//! Event bus for session and capture notifications
//!
//! Hosts subscribe to learn about asynchronous outcomes: authentication
//! failures, connection errors, remote signaling messages.

pub mod types;

pub use types::PublisherEvent;

use tokio::sync::broadcast;

/// Events buffered per subscriber before it lags
const DEFAULT_EVENT_BACKLOG: usize = 256;

/// Broadcasts [`PublisherEvent`]s to every subscriber
///
/// ```no_run
/// use render_publisher::events::{EventBus, PublisherEvent};
///
/// # async fn host(bus: &EventBus) {
/// let mut events = bus.subscribe();
/// while let Ok(event) = events.recv().await {
///     if let PublisherEvent::AuthenticationFailed { status, message } = event {
///         eprintln!("director refused ({status}): {message}");
///     }
/// }
/// # }
/// ```
pub struct EventBus {
    sender: broadcast::Sender<PublisherEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_backlog(DEFAULT_EVENT_BACKLOG)
    }

    pub fn with_backlog(backlog: usize) -> Self {
        let (sender, _) = broadcast::channel(backlog.max(1));
        Self { sender }
    }

    /// Deliver `event` to current subscribers; a bus nobody listens to drops it
    pub fn publish(&self, event: PublisherEvent) {
        tracing::trace!("event {}", event.event_name());
        let _ = self.sender.send(event);
    }

    /// Receive events published from now on
    ///
    /// A slow subscriber sees `RecvError::Lagged` and loses the oldest events.
    pub fn subscribe(&self) -> broadcast::Receiver<PublisherEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
