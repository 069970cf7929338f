use futures_util::future::BoxFuture;
use serde_json::Value;
use sse_core::{FormData, Params, RpcResponse, SessionError};
use url::Url;

/// Pending outcome of an outbound call.
pub type RpcFuture = BoxFuture<'static, Result<RpcResponse, SessionError>>;

#[derive(Debug, Clone, PartialEq)]
pub enum RpcBody {
    Json(Value),
    Multipart(FormData),
}

#[derive(Debug, Clone, PartialEq)]
pub struct RpcRequest {
    pub url: Url,
    pub body: RpcBody,
    pub headers: Params,
    pub with_credentials: bool,
}

/// Request/response primitive used for listener registration, messages
/// and uploads, plus the fire-and-forget disconnect beacon.
pub trait SessionRpc: Send + Sync {
    /// Start a call.
    ///
    /// `Err` means the call could not even be issued. Retryable errors put
    /// the operation back into the retry queue; anything else settles it.
    fn call(&self, request: RpcRequest) -> Result<RpcFuture, SessionError>;

    /// Queue a form-encoded POST without waiting for it. Returns whether the
    /// notice was accepted for delivery.
    fn beacon(&self, url: Url, form: Params) -> bool;
}
