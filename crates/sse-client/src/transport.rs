use sse_core::ServerEvent;
use tokio::sync::mpsc;
use url::Url;

use crate::runtime::RuntimeMessage;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyState {
    Connecting,
    Open,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Open,
    /// The stream failed or ended. The handle does not reconnect by itself.
    Error(String),
    Message(ServerEvent),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectRequest {
    /// Fully encoded connect URL including the handshake query.
    pub url: Url,
    pub with_credentials: bool,
}

/// Live event stream opened by an [`EventSourceConnector`].
pub trait EventSourceHandle: Send {
    fn ready_state(&self) -> ReadyState;

    /// Stop delivering events. Idempotent.
    fn close(&mut self);
}

/// Opens event streams. Implementations push everything they observe into
/// the provided [`AttemptSink`].
pub trait EventSourceConnector: Send + Sync {
    fn open(&self, request: ConnectRequest, sink: AttemptSink) -> Box<dyn EventSourceHandle>;
}

/// Delivery channel from one transport attempt into the session loop.
///
/// The sink holds only a weak reference to the loop: once every session
/// handle is gone, emitting fails and the transport should stop.
#[derive(Clone, Debug)]
pub struct AttemptSink {
    attempt: u64,
    tx: mpsc::WeakUnboundedSender<RuntimeMessage>,
}

impl AttemptSink {
    pub(crate) fn new(attempt: u64, tx: mpsc::WeakUnboundedSender<RuntimeMessage>) -> Self {
        Self { attempt, tx }
    }

    pub fn attempt(&self) -> u64 {
        self.attempt
    }

    pub fn emit(&self, event: TransportEvent) -> bool {
        let Some(tx) = self.tx.upgrade() else {
            return false;
        };
        tx.send(RuntimeMessage::Transport {
            attempt: self.attempt,
            event,
        })
        .is_ok()
    }
}
