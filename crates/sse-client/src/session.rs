use std::{
    fmt,
    future::Future,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use serde_json::Value;
use sse_core::{
    ActivitySignal, ConnectionState, DurationSnapshot, EventBus, FormData, ListenerSet, Params,
    RpcResponse, SessionError, SessionErrorCategory, SessionOptions, Visibility,
};
use sse_platform::{Clock, InMemoryStore, KeyValueStore, SystemClock};
use tokio::{
    runtime::Handle,
    sync::{mpsc, oneshot, watch},
};
use url::Url;

use crate::{
    http::{HttpEventSource, HttpRpc},
    rpc::SessionRpc,
    runtime::{Operation, RuntimeMessage, RuntimeParts, SessionCommand, SessionRuntime, SessionStatus},
    transport::EventSourceConnector,
};

/// Assembles a session from options and host capabilities.
///
/// Capabilities that are not supplied default to in-memory storage, the
/// system clock and the `reqwest` transport.
pub struct SessionBuilder {
    options: SessionOptions,
    store: Option<Arc<dyn KeyValueStore>>,
    clock: Option<Arc<dyn Clock>>,
    connector: Option<Arc<dyn EventSourceConnector>>,
    rpc: Option<Arc<dyn SessionRpc>>,
}

impl SessionBuilder {
    pub fn new(options: SessionOptions) -> Self {
        Self {
            options,
            store: None,
            clock: None,
            connector: None,
            rpc: None,
        }
    }

    pub fn store(mut self, store: Arc<dyn KeyValueStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn connector(mut self, connector: Arc<dyn EventSourceConnector>) -> Self {
        self.connector = Some(connector);
        self
    }

    pub fn rpc(mut self, rpc: Arc<dyn SessionRpc>) -> Self {
        self.rpc = Some(rpc);
        self
    }

    /// Resolve identity, open the first attempt and start the session loop.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(self) -> Result<SessionHandle, SessionError> {
        let runtime = Handle::try_current().map_err(|err| {
            SessionError::new(
                SessionErrorCategory::Config,
                "no_runtime",
                format!("session must be spawned inside a tokio runtime: {err}"),
            )
        })?;

        let Self {
            options,
            store,
            clock,
            connector,
            rpc,
        } = self;
        let clock = clock.unwrap_or_else(|| Arc::new(SystemClock::new()));
        let store = store.unwrap_or_else(|| Arc::new(InMemoryStore::default()));
        let (connector, rpc) = match (connector, rpc) {
            (Some(connector), Some(rpc)) => (connector, rpc),
            (connector, rpc) => {
                let client = reqwest::Client::new();
                (
                    connector.unwrap_or_else(|| Arc::new(HttpEventSource::new(client.clone()))),
                    rpc.unwrap_or_else(|| Arc::new(HttpRpc::new(client))),
                )
            }
        };
        let bus = options.bus_dispatcher().map(|dispatcher| dispatcher.bus().clone());
        let mut options = options;
        if let Some(bus) = &bus {
            options.event_bus = Some(bus.clone());
        }
        let activity = ActivitySignal::new(clock.now_ms());

        let (tx, rx) = mpsc::unbounded_channel();
        let (session, status) = SessionRuntime::start(
            RuntimeParts {
                options,
                store,
                clock: Arc::clone(&clock),
                connector,
                rpc,
                activity: activity.clone(),
            },
            tx.downgrade(),
        );
        runtime.spawn(session.run(rx));

        Ok(SessionHandle {
            tx,
            status,
            activity,
            clock,
            bus,
        })
    }
}

/// Cloneable front of one session.
///
/// The session stays alive while at least one handle exists; dropping the
/// last one tears it down as if [`SessionHandle::destroy`] had been called.
#[derive(Clone)]
pub struct SessionHandle {
    tx: mpsc::UnboundedSender<RuntimeMessage>,
    status: watch::Receiver<SessionStatus>,
    activity: ActivitySignal,
    clock: Arc<dyn Clock>,
    bus: Option<EventBus>,
}

impl SessionHandle {
    pub fn builder(options: SessionOptions) -> SessionBuilder {
        SessionBuilder::new(options)
    }

    /// Open a new attempt unless one is connecting or open.
    pub async fn connect(&self) -> Result<ConnectionState, SessionError> {
        self.request("connect", |reply| SessionCommand::Connect { reply })
            .await
    }

    /// Close the current attempt. Returns whether a disconnect notice was
    /// accepted for delivery.
    pub async fn close(&self, reason: impl Into<String>) -> Result<bool, SessionError> {
        let reason = reason.into();
        self.request("close", |reply| SessionCommand::Close {
            reason,
            reply: Some(reply),
        })
        .await
    }

    /// Close with reason `destroy`, settle queued operations and stop the
    /// session loop.
    pub async fn destroy(&self) -> Result<(), SessionError> {
        self.request("destroy", |reply| SessionCommand::Destroy { reply })
            .await
    }

    pub async fn switch_url(&self, url: Url) -> Result<(), SessionError> {
        self.request("switch_url", |reply| SessionCommand::SwitchUrl { url, reply })
            .await
    }

    /// Transport open and a connection id assigned.
    pub fn is_active(&self) -> bool {
        self.status.borrow().is_active()
    }

    pub fn add_listener(&self, listeners: impl Into<ListenerSet>) -> Pending<RpcResponse> {
        self.operation(Operation::AddListener(listeners.into()))
    }

    pub fn remove_listener(&self, listeners: impl Into<ListenerSet>) -> Pending<RpcResponse> {
        self.operation(Operation::RemoveListener(listeners.into()))
    }

    pub fn send(&self, path: impl Into<String>, body: Value) -> Pending<RpcResponse> {
        self.send_with(path, body, Params::new(), Params::new())
    }

    pub fn send_with(
        &self,
        path: impl Into<String>,
        body: Value,
        query: Params,
        headers: Params,
    ) -> Pending<RpcResponse> {
        self.operation(Operation::Send {
            path: path.into(),
            body,
            query,
            headers,
        })
    }

    pub fn upload(&self, path: impl Into<String>, form: FormData) -> Pending<RpcResponse> {
        self.upload_with(path, form, Params::new(), Params::new())
    }

    /// Invalid forms are rejected here and never reach the retry queue.
    pub fn upload_with(
        &self,
        path: impl Into<String>,
        form: FormData,
        query: Params,
        headers: Params,
    ) -> Pending<RpcResponse> {
        if let Err(err) = form.validate() {
            return Pending::ready("upload", Err(err));
        }
        self.operation(Operation::Upload {
            path: path.into(),
            form,
            query,
            headers,
        })
    }

    /// Persisted session duration plus the open segment.
    pub async fn duration(&self) -> Result<DurationSnapshot, SessionError> {
        self.request("duration", |reply| SessionCommand::Duration { reply })
            .await
    }

    /// Note user activity (pointer, keyboard); feeds the idle check.
    pub fn record_activity(&self) {
        self.activity.record(self.clock.now_ms());
    }

    /// Hidden closes with reason `visibilitychange`, visible reconnects.
    pub fn set_visibility(&self, visibility: Visibility) -> Result<(), SessionError> {
        self.command("set_visibility", SessionCommand::SetVisibility(visibility))
    }

    /// The host is going away: close with reason `unload`.
    pub fn unload(&self) -> Result<(), SessionError> {
        self.command(
            "unload",
            SessionCommand::Close {
                reason: "unload".to_owned(),
                reply: None,
            },
        )
    }

    /// Current status as seen by the session loop, after every message sent
    /// before this call has been handled.
    pub async fn status(&self) -> Result<SessionStatus, SessionError> {
        self.request("status", |reply| SessionCommand::Status { reply })
            .await
    }

    /// Last published status, without a round trip.
    pub fn snapshot(&self) -> SessionStatus {
        self.status.borrow().clone()
    }

    /// Subscribe to status changes.
    pub fn watch(&self) -> watch::Receiver<SessionStatus> {
        self.status.clone()
    }

    pub fn event_bus(&self) -> Option<&EventBus> {
        self.bus.as_ref()
    }

    fn operation(&self, op: Operation) -> Pending<RpcResponse> {
        let action = op.action();
        let (reply, rx) = oneshot::channel();
        match self.command(action, SessionCommand::Dispatch { op, reply }) {
            Ok(()) => Pending::waiting(action, rx),
            Err(err) => Pending::ready(action, Err(err)),
        }
    }

    fn command(&self, action: &'static str, command: SessionCommand) -> Result<(), SessionError> {
        self.tx
            .send(RuntimeMessage::Command(command))
            .map_err(|_| SessionError::closed(action))
    }

    async fn request<T>(
        &self,
        action: &'static str,
        build: impl FnOnce(oneshot::Sender<T>) -> SessionCommand,
    ) -> Result<T, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.command(action, build(reply))?;
        rx.await.map_err(|_| SessionError::closed(action))
    }
}

impl fmt::Display for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let status = self.status.borrow();
        write!(
            f,
            "{}:{}",
            status.connection_name.as_deref().unwrap_or_default(),
            status.state
        )
    }
}

impl fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionHandle")
            .field("status", &*self.status.borrow())
            .field("event_bus", &self.bus.is_some())
            .finish_non_exhaustive()
    }
}

/// Deferred result of an outbound operation.
///
/// Settles once the operation has been dispatched and answered, which may be
/// after one or more reconnects. Dropping it does not cancel the operation.
#[derive(Debug)]
#[must_use = "dropping a Pending does not cancel the operation but discards its result"]
pub struct Pending<T> {
    action: &'static str,
    state: PendingState<T>,
}

#[derive(Debug)]
enum PendingState<T> {
    Ready(Option<Result<T, SessionError>>),
    Waiting(oneshot::Receiver<Result<T, SessionError>>),
}

impl<T> Pending<T> {
    fn ready(action: &'static str, result: Result<T, SessionError>) -> Self {
        Self {
            action,
            state: PendingState::Ready(Some(result)),
        }
    }

    fn waiting(action: &'static str, rx: oneshot::Receiver<Result<T, SessionError>>) -> Self {
        Self {
            action,
            state: PendingState::Waiting(rx),
        }
    }
}

impl<T> Unpin for Pending<T> {}

impl<T> Future for Pending<T> {
    type Output = Result<T, SessionError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let action = this.action;
        match &mut this.state {
            PendingState::Ready(result) => Poll::Ready(
                result
                    .take()
                    .unwrap_or_else(|| Err(SessionError::closed(action))),
            ),
            PendingState::Waiting(rx) => Pin::new(rx)
                .poll(cx)
                .map(|settled| settled.unwrap_or_else(|_| Err(SessionError::closed(action)))),
        }
    }
}
