//! Broadcast event bus for distributing `EngineEvent` to multiple subscribers.
//!
//! Built on `tokio::sync::broadcast`. Publishing with no active subscribers
//! is a no-op, so an engine nobody listens to pays almost nothing.

use cadence_types::event::EngineEvent;
use tokio::sync::broadcast;

/// Multi-consumer bus for run, wave and unit events.
///
/// Cloning the bus clones the sender; every clone publishes into the same
/// channel.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    /// Create a new event bus with the given channel capacity (min 1).
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Create a new subscriber that will receive all future events.
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.sender.subscribe()
    }

    /// Publish an event to all current subscribers.
    pub fn publish(&self, event: EngineEvent) {
        let _ = self.sender.send(event);
    }

    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("receiver_count", &self.sender.receiver_count())
            .finish()
    }
}
