//! Session model of a reconnecting server-sent-events client.
//!
//! This crate is free of IO: it defines the connection state machine, the
//! retry queue, listener registry and bus dispatch, duration accounting,
//! identity resolution and the wire encoding of connect/disconnect requests.
//! The runtime that drives them lives in `sse-client`.

/// Process-wide event bus.
pub mod channel;
/// Foreground/idle time accounting.
pub mod duration;
/// Stable session error types and HTTP classification helpers.
pub mod error;
/// Protocol names, connect query and disconnect notice encoding.
pub mod handshake;
/// Client and instance identifiers.
pub mod identity;
/// Listener registry, handler invocation and intercept chain.
pub mod listener;
/// Session construction options.
pub mod options;
/// FIFO buffer for operations deferred while inactive.
pub mod queue;
/// Reconnect delay negotiation.
pub mod retry;
/// Connection state machine.
pub mod state_machine;
/// Shared payload and event types.
pub mod types;

pub use channel::{BusEvent, BusStream, EventBus};
pub use duration::{ActivitySignal, DurationTracker, default_duration_key};
pub use error::{SessionError, SessionErrorCategory, classify_http_status};
pub use handshake::{
    ACTIVITY_CHANGE_EVENT, CLIENT_VERSION, CONNECT_CLOSE_EVENT, CONNECT_FINISH_EVENT,
    ClientEnvironment, DURATION_SYNC_EVENT, DisconnectNotice, HandshakeRequest,
    MemoryDiagnostics,
};
pub use identity::{CLIENT_ID_KEY, Identity};
pub use listener::{
    BusDispatcher, EventHandler, Intercept, InterceptError, ListenerRegistry, ListenerSet,
};
pub use options::SessionOptions;
pub use queue::RetryQueue;
pub use retry::{DEFAULT_RECONNECT_TIME_MS, ReconnectPolicy};
pub use state_machine::{ClientClose, CloseOutcome, ConnectionStateMachine, Negotiated};
pub use types::{
    ActivityChange, CloseInfo, CloseInitiator, ConnectionState, DurationSnapshot,
    DurationSync, FormData, FormPart, HandshakeFinish, Params, RpcResponse, ServerClose,
    ServerEvent, Visibility,
};
