//! Reconnecting server-sent-events session runtime.
//!
//! [`SessionBuilder::spawn`] starts one tokio task that owns every piece of
//! session state. [`SessionHandle`] talks to it over a channel; transports
//! feed the same channel, so commands and server events are handled strictly
//! in arrival order.

/// `reqwest` implementations of the transport and RPC capabilities.
pub mod http;
/// Outbound request/response capability.
pub mod rpc;
mod runtime;
mod session;
/// `text/event-stream` decoder.
pub mod sse;
/// Event-stream transport capability.
pub mod transport;

pub use http::{HttpEventSource, HttpRpc};
pub use rpc::{RpcBody, RpcFuture, RpcRequest, SessionRpc};
pub use runtime::SessionStatus;
pub use session::{Pending, SessionBuilder, SessionHandle};
pub use sse::SseDecoder;
pub use transport::{
    AttemptSink, ConnectRequest, EventSourceConnector, EventSourceHandle, ReadyState,
    TransportEvent,
};
