use tokio::sync::broadcast;

use crate::dto::sse::ServerEvent;

/// Broadcast hub carrying presence lifecycle events to SSE subscribers.
pub struct PresenceEvents {
    sender: broadcast::Sender<ServerEvent>,
}

impl PresenceEvents {
    /// Construct a new hub backed by a Tokio broadcast channel with the given capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _receiver) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Register a new subscriber that will receive subsequent events.
    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.sender.subscribe()
    }

    /// Send an event to all current subscribers, ignoring delivery errors.
    pub fn broadcast(&self, event: ServerEvent) {
        let _ = self.sender.send(event);
    }
}
