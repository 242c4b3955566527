//! In-process event bus.
//!
//! Every state change the bridge observes is published here so the host
//! can react without polling the device store. The bus is generic over the
//! event type; the device crate instantiates it with its own event enum.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::warn;

/// Default channel capacity for the event bus.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1000;

/// Metadata attached to every published event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventMetadata {
    /// Unique event ID
    pub event_id: String,
    /// Optional correlation ID, e.g. the command that caused the change
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    /// Component that published the event
    pub source: String,
    /// Unix timestamp, milliseconds
    pub timestamp: i64,
}

impl EventMetadata {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            event_id: uuid::Uuid::new_v4().to_string(),
            correlation_id: None,
            source: source.into(),
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }

    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }
}

/// Broadcast event bus.
///
/// Slow subscribers lose the oldest events once `capacity` is exceeded; the
/// loss is logged and the receiver keeps going.
pub struct EventBus<E> {
    tx: broadcast::Sender<(E, EventMetadata)>,
    name: String,
}

impl<E> Clone for EventBus<E> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            name: self.name.clone(),
        }
    }
}

impl<E: Clone + Send + 'static> EventBus<E> {
    /// Create a new event bus with default capacity.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            tx,
            name: "default".to_string(),
        }
    }

    pub fn with_name(name: impl Into<String>) -> Self {
        let mut bus = Self::new();
        bus.name = name.into();
        bus
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Publish an event with default metadata.
    ///
    /// Returns `true` if there was at least one subscriber.
    pub fn publish(&self, event: E) -> bool {
        self.publish_with_source(event, "system")
    }

    pub fn publish_with_source(&self, event: E, source: impl Into<String>) -> bool {
        self.publish_with_metadata(event, EventMetadata::new(source))
    }

    pub fn publish_with_metadata(&self, event: E, metadata: EventMetadata) -> bool {
        self.tx.send((event, metadata)).is_ok()
    }

    /// Subscribe to all events published after this call.
    pub fn subscribe(&self) -> EventBusReceiver<E> {
        EventBusReceiver {
            rx: self.tx.subscribe(),
            bus: self.name.clone(),
        }
    }

    /// Subscribe to events matching a filter.
    pub fn subscribe_filtered<F>(&self, filter: F) -> FilteredReceiver<E, F>
    where
        F: Fn(&E) -> bool + Send + 'static,
    {
        FilteredReceiver {
            inner: self.subscribe(),
            filter,
        }
    }
}

impl<E: Clone + Send + 'static> Default for EventBus<E> {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared event bus handle.
pub type SharedEventBus<E> = Arc<EventBus<E>>;

/// Receiver for all events from the event bus.
pub struct EventBusReceiver<E> {
    rx: broadcast::Receiver<(E, EventMetadata)>,
    bus: String,
}

impl<E: Clone> EventBusReceiver<E> {
    /// Receive the next event. Returns `None` once every sender is gone.
    pub async fn recv(&mut self) -> Option<(E, EventMetadata)> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(category = "eventbus", bus = %self.bus, skipped, "Subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Try to receive an event without blocking.
    pub fn try_recv(&mut self) -> Option<(E, EventMetadata)> {
        loop {
            match self.rx.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                    warn!(category = "eventbus", bus = %self.bus, skipped, "Subscriber lagged");
                }
                Err(_) => return None,
            }
        }
    }

    /// Drain everything currently buffered.
    pub fn drain(&mut self) -> Vec<(E, EventMetadata)> {
        std::iter::from_fn(|| self.try_recv()).collect()
    }
}

/// Receiver for filtered events from the event bus.
pub struct FilteredReceiver<E, F> {
    inner: EventBusReceiver<E>,
    filter: F,
}

impl<E, F> FilteredReceiver<E, F>
where
    E: Clone,
    F: Fn(&E) -> bool + Send,
{
    /// Receive the next event matching the filter.
    pub async fn recv(&mut self) -> Option<(E, EventMetadata)> {
        loop {
            let (event, meta) = self.inner.recv().await?;
            if (self.filter)(&event) {
                return Some((event, meta));
            }
        }
    }

    /// Try to receive a matching event without blocking.
    pub fn try_recv(&mut self) -> Option<(E, EventMetadata)> {
        while let Some((event, meta)) = self.inner.try_recv() {
            if (self.filter)(&event) {
                return Some((event, meta));
            }
        }
        None
    }
}
