//! Event bus for tracker state changes
//!
//! Tokio broadcast channel. Publishing never fails the operation that
//! produced the event: a bus without subscribers simply drops it, and slow
//! subscribers observe `Lagged` on their own receiver.

use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::debug;

use super::types::StateEvent;

/// Default channel capacity for broadcast
pub const CHANNEL_CAPACITY: usize = 256;

/// Shared reference to EventBus
pub type SharedEventBus = Arc<EventBus>;

/// Event bus with broadcast channels
pub struct EventBus {
    sender: broadcast::Sender<StateEvent>,
}

impl EventBus {
    /// Create a new event bus with the default capacity
    pub fn new() -> Self {
        Self::with_capacity(CHANNEL_CAPACITY)
    }

    /// Create a new event bus holding up to `capacity` undelivered events
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Create a shared reference to this event bus
    pub fn shared(self) -> SharedEventBus {
        Arc::new(self)
    }

    /// Publish an event to all subscribers
    pub fn publish(&self, event: StateEvent) {
        let event_type = event.event_type();
        match self.sender.send(event) {
            Ok(count) => debug!(event_type, receivers = count, "Event published"),
            Err(_) => debug!(event_type, "Event published (no receivers)"),
        }
    }

    /// Subscribe to receive events
    pub fn subscribe(&self) -> broadcast::Receiver<StateEvent> {
        self.sender.subscribe()
    }

    /// Get the number of current subscribers
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Check if the bus has any subscribers
    pub fn has_subscribers(&self) -> bool {
        self.sender.receiver_count() > 0
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Event filter for selective subscription
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    /// Filter by agent ID
    pub agent_id: Option<String>,
    /// Filter by event types
    pub event_types: Option<Vec<String>>,
}

impl EventFilter {
    /// Create a new empty filter (matches all events)
    pub fn new() -> Self {
        Self::default()
    }

    /// Filter by agent ID
    pub fn agent(mut self, agent_id: &str) -> Self {
        self.agent_id = Some(agent_id.to_string());
        self
    }

    /// Filter by event types
    pub fn types(mut self, event_types: Vec<&str>) -> Self {
        self.event_types = Some(event_types.into_iter().map(String::from).collect());
        self
    }

    /// Check if an event matches this filter
    pub fn matches(&self, event: &StateEvent) -> bool {
        if let Some(ref id) = self.agent_id {
            if event.agent_id() != id {
                return false;
            }
        }
        if let Some(ref types) = self.event_types {
            if !types.iter().any(|t| t == event.event_type()) {
                return false;
            }
        }
        true
    }
}

/// Filtered event receiver that only yields matching events
pub struct FilteredReceiver {
    receiver: broadcast::Receiver<StateEvent>,
    filter: EventFilter,
}

impl FilteredReceiver {
    /// Create a new filtered receiver
    pub fn new(receiver: broadcast::Receiver<StateEvent>, filter: EventFilter) -> Self {
        Self { receiver, filter }
    }

    /// Receive the next matching event
    pub async fn recv(&mut self) -> Result<StateEvent, broadcast::error::RecvError> {
        loop {
            let event = self.receiver.recv().await?;
            if self.filter.matches(&event) {
                return Ok(event);
            }
        }
    }
}

impl EventBus {
    /// Subscribe with a filter
    pub fn subscribe_filtered(&self, filter: EventFilter) -> FilteredReceiver {
        FilteredReceiver::new(self.subscribe(), filter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn evicted(agent_id: &str) -> StateEvent {
        StateEvent::Evicted {
            agent_id: agent_id.to_string(),
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_publish_subscribe() {
        let bus = EventBus::new();
        let mut receiver = bus.subscribe();

        bus.publish(evicted("a1"));

        let received = receiver.recv().await.unwrap();
        assert_eq!(received.event_type(), "evicted");
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_fine() {
        let bus = EventBus::with_capacity(4).shared();
        assert!(!bus.has_subscribers());
        bus.publish(evicted("a1"));

        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 2);
        bus.publish(evicted("a2"));
        assert_eq!(rx1.recv().await.unwrap().agent_id(), "a2");
        assert_eq!(rx2.recv().await.unwrap().agent_id(), "a2");
    }

    #[tokio::test]
    async fn test_filtered_receiver() {
        let bus = EventBus::new();
        let mut filtered = bus.subscribe_filtered(EventFilter::new().agent("target"));

        bus.publish(evicted("other"));
        bus.publish(evicted("target"));

        let event = filtered.recv().await.unwrap();
        assert_eq!(event.agent_id(), "target");
    }

    #[test]
    fn test_event_filter_types() {
        let filter = EventFilter::new().types(vec!["persisted"]);
        assert!(!filter.matches(&evicted("a1")));
        assert!(EventFilter::new().matches(&evicted("a1")));
    }
}
