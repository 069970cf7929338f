use tokio::sync::broadcast;

use crate::types::ServerEvent;

/// Receiver side of the event bus.
pub type BusStream = broadcast::Receiver<BusEvent>;

/// Event republished on the bus together with the endpoint it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusEvent {
    /// Endpoint URL of the session that received the event.
    pub origin: String,
    pub event: ServerEvent,
}

/// Process-wide fan-out of inbound server events.
///
/// The bus is an injected dependency: sessions that should share one bus are
/// handed clones of the same instance, independent sessions get their own.
#[derive(Clone, Debug)]
pub struct EventBus {
    tx: broadcast::Sender<BusEvent>,
}

impl EventBus {
    pub const DEFAULT_CAPACITY: usize = 256;

    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Subscribe to events published after this call.
    pub fn subscribe(&self) -> BusStream {
        self.tx.subscribe()
    }

    /// Publish one event.
    ///
    /// Emission is best-effort; lagged subscribers are handled by `broadcast`.
    pub fn publish(&self, event: BusEvent) {
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(Self::DEFAULT_CAPACITY)
    }
}
