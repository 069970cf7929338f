use std::{
    collections::{BTreeSet, VecDeque},
    ops::ControlFlow,
    sync::Arc,
    time::Duration,
};

use serde_json::{Value, json};
use sse_core::{
    ACTIVITY_CHANGE_EVENT, ActivityChange, ActivitySignal, BusDispatcher, CONNECT_CLOSE_EVENT,
    CONNECT_FINISH_EVENT, ClientClose, CloseInfo, CloseOutcome, ConnectionState, ConnectionStateMachine,
    DURATION_SYNC_EVENT, DisconnectNotice, DurationSnapshot, DurationSync, DurationTracker,
    FormData, HandshakeFinish, HandshakeRequest, Identity, ListenerRegistry, ListenerSet, Params,
    RetryQueue, RpcResponse, ServerClose, ServerEvent, SessionError, SessionOptions, Visibility,
    handshake, identity::resolve_access_timestamp, listener::invoke_handler,
};
use sse_platform::{Clock, KeyValueStore};
use tokio::{
    sync::{mpsc, oneshot, watch},
    time::{Instant, MissedTickBehavior},
};
use tracing::{debug, error, info, trace, warn};
use url::Url;

use crate::{
    rpc::{RpcBody, RpcRequest, SessionRpc},
    transport::{
        AttemptSink, ConnectRequest, EventSourceConnector, EventSourceHandle, ReadyState,
        TransportEvent,
    },
};

#[cfg(test)]
mod tests;

pub(crate) type Reply = oneshot::Sender<Result<RpcResponse, SessionError>>;

#[derive(Debug)]
pub(crate) enum RuntimeMessage {
    Command(SessionCommand),
    Transport { attempt: u64, event: TransportEvent },
}

#[derive(Debug)]
pub(crate) enum SessionCommand {
    Connect {
        reply: oneshot::Sender<ConnectionState>,
    },
    Close {
        reason: String,
        reply: Option<oneshot::Sender<bool>>,
    },
    Destroy {
        reply: oneshot::Sender<()>,
    },
    SwitchUrl {
        url: Url,
        reply: oneshot::Sender<()>,
    },
    Dispatch {
        op: Operation,
        reply: Reply,
    },
    SetVisibility(Visibility),
    Duration {
        reply: oneshot::Sender<DurationSnapshot>,
    },
    Status {
        reply: oneshot::Sender<SessionStatus>,
    },
}

#[derive(Debug, Clone)]
pub(crate) enum Operation {
    Send {
        path: String,
        body: Value,
        query: Params,
        headers: Params,
    },
    Upload {
        path: String,
        form: FormData,
        query: Params,
        headers: Params,
    },
    AddListener(ListenerSet),
    RemoveListener(ListenerSet),
}

impl Operation {
    pub(crate) fn action(&self) -> &'static str {
        match self {
            Self::Send { .. } => "send",
            Self::Upload { .. } => "upload",
            Self::AddListener(_) => "add_listener",
            Self::RemoveListener(_) => "remove_listener",
        }
    }
}

#[derive(Debug)]
struct QueuedTask {
    op: Operation,
    reply: Reply,
}

/// Observable session state, published after every step of the loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionStatus {
    pub url: Url,
    pub state: ConnectionState,
    pub connection_id: Option<String>,
    pub connection_name: Option<String>,
    pub server_time: Option<u64>,
    pub server_version: Option<String>,
    pub client_id: String,
    pub instance_id: String,
    pub access_timestamp: u64,
    /// Readiness reported by the attached transport, if any.
    pub transport: Option<ReadyState>,
    /// Attribution of the last `connect-close` event.
    pub last_close: Option<CloseInfo>,
    /// Payload of the last `connect-close` event.
    pub server_close: Option<ServerClose>,
    /// Close initiated from this side, kept until the next open.
    pub client_close: Option<ClientClose>,
    /// Operations waiting for the session to become active.
    pub queued: usize,
    pub destroyed: bool,
}

impl SessionStatus {
    pub fn is_active(&self) -> bool {
        self.state == ConnectionState::Open && self.connection_id.is_some()
    }
}

#[derive(Debug)]
enum Deferred {
    DetachAttempt(u64),
    EmitActivity(ActivityChange),
}

struct Attempt {
    id: u64,
    handle: Box<dyn EventSourceHandle>,
    subscribed: BTreeSet<String>,
}

pub(crate) struct RuntimeParts {
    pub options: SessionOptions,
    pub store: Arc<dyn KeyValueStore>,
    pub clock: Arc<dyn Clock>,
    pub connector: Arc<dyn EventSourceConnector>,
    pub rpc: Arc<dyn SessionRpc>,
    pub activity: ActivitySignal,
}

pub(crate) struct SessionRuntime {
    options: SessionOptions,
    identity: Identity,
    machine: ConnectionStateMachine,
    registry: ListenerRegistry,
    queue: RetryQueue<QueuedTask>,
    tracker: DurationTracker,
    activity: ActivitySignal,
    dispatcher: Option<BusDispatcher>,
    store: Arc<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
    connector: Arc<dyn EventSourceConnector>,
    rpc: Arc<dyn SessionRpc>,
    attempt: Option<Attempt>,
    attempt_seq: u64,
    reconnect_at: Option<Instant>,
    deferred: VecDeque<Deferred>,
    sink_tx: mpsc::WeakUnboundedSender<RuntimeMessage>,
    status_tx: watch::Sender<SessionStatus>,
    destroyed: bool,
}

impl SessionRuntime {
    pub(crate) fn start(
        parts: RuntimeParts,
        sink_tx: mpsc::WeakUnboundedSender<RuntimeMessage>,
    ) -> (Self, watch::Receiver<SessionStatus>) {
        let RuntimeParts {
            options,
            store,
            clock,
            connector,
            rpc,
            activity,
        } = parts;

        let identity = Identity::resolve(
            store.as_ref(),
            clock.as_ref(),
            options.url.as_str(),
            options.client_id.as_deref(),
            options.access_timestamp,
        );
        let tracker = DurationTracker::new(
            Arc::clone(&store),
            Arc::clone(&clock),
            options.duration_key_for(&options.url),
        );
        let machine = ConnectionStateMachine::new(options.reconnect_override_ms());
        let registry = ListenerRegistry::new(options.listeners.clone());
        let dispatcher = options.bus_dispatcher();
        let (status_tx, status_rx) = watch::channel(initial_status(&options, &identity));

        let mut runtime = Self {
            options,
            identity,
            machine,
            registry,
            queue: RetryQueue::new(),
            tracker,
            activity,
            dispatcher,
            store,
            clock,
            connector,
            rpc,
            attempt: None,
            attempt_seq: 0,
            reconnect_at: None,
            deferred: VecDeque::new(),
            sink_tx,
            status_tx,
            destroyed: false,
        };
        info!(
            url = %runtime.options.url,
            client_id = %runtime.identity.client_id,
            instance_id = %runtime.identity.instance_id,
            "session created"
        );
        runtime.connect();
        runtime.publish_status();
        (runtime, status_rx)
    }

    pub(crate) async fn run(mut self, mut rx: mpsc::UnboundedReceiver<RuntimeMessage>) {
        let period = self.options.idle_check_interval.max(Duration::from_millis(1));
        let mut idle_check = tokio::time::interval(period);
        idle_check.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let flow = tokio::select! {
                biased;
                _ = sleep_until_opt(self.reconnect_at) => {
                    self.on_reconnect_timer();
                    ControlFlow::Continue(())
                }
                _ = idle_check.tick() => {
                    self.check_idle();
                    ControlFlow::Continue(())
                }
                message = rx.recv() => match message {
                    Some(RuntimeMessage::Command(command)) => self.handle_command(command),
                    Some(RuntimeMessage::Transport { attempt, event }) => {
                        self.on_transport(attempt, event);
                        ControlFlow::Continue(())
                    }
                    None => {
                        debug!("all session handles dropped");
                        self.destroy();
                        ControlFlow::Break(())
                    }
                },
            };
            self.run_deferred();
            self.publish_status();
            if flow.is_break() {
                break;
            }
        }
        debug!(url = %self.options.url, "session loop stopped");
    }

    fn handle_command(&mut self, command: SessionCommand) -> ControlFlow<()> {
        match command {
            SessionCommand::Connect { reply } => {
                let state = self.connect();
                self.reply(reply, state);
            }
            SessionCommand::Close { reason, reply } => {
                let accepted = self.close(&reason);
                if let Some(reply) = reply {
                    self.reply(reply, accepted);
                }
            }
            SessionCommand::Destroy { reply } => {
                self.destroy();
                self.reply(reply, ());
                return ControlFlow::Break(());
            }
            SessionCommand::SwitchUrl { url, reply } => {
                self.switch_url(url);
                self.reply(reply, ());
            }
            SessionCommand::Dispatch { op, reply } => self.dispatch(QueuedTask { op, reply }),
            SessionCommand::SetVisibility(Visibility::Hidden) => {
                self.close("visibilitychange");
            }
            SessionCommand::SetVisibility(Visibility::Visible) => {
                self.connect();
            }
            SessionCommand::Duration { reply } => {
                let _ = reply.send(self.tracker.snapshot());
            }
            SessionCommand::Status { reply } => {
                let status = self.status();
                self.reply(reply, status);
            }
        }
        ControlFlow::Continue(())
    }

    // Status is published before the reply is sent.
    fn reply<T>(&self, reply: oneshot::Sender<T>, value: T) {
        self.publish_status();
        let _ = reply.send(value);
    }

    fn connect(&mut self) -> ConnectionState {
        if !self.machine.begin_connect() {
            trace!(state = %self.machine.state(), "connect ignored, attempt still live");
            return self.machine.state();
        }
        self.reconnect_at = None;
        self.detach_attempt();

        self.attempt_seq += 1;
        let id = self.attempt_seq;
        let listeners = self.registry.names();
        let request = HandshakeRequest {
            keepalive_time: self.options.keepalive_time,
            client_id: &self.identity.client_id,
            access_timestamp: self.identity.access_timestamp,
            listeners: &listeners,
            use_event_bus: self.dispatcher.is_some(),
            environment: &self.options.environment,
            instance_time: self.identity.create_timestamp,
            instance_id: &self.identity.instance_id,
            query: &self.options.query,
        };
        match request.url(&self.options.url) {
            Ok(url) => {
                info!(attempt = id, url = %self.options.url, "opening event stream");
                let sink = AttemptSink::new(id, self.sink_tx.clone());
                let handle = self.connector.open(
                    ConnectRequest {
                        url,
                        with_credentials: self.options.with_credentials,
                    },
                    sink,
                );
                self.attempt = Some(Attempt {
                    id,
                    handle,
                    subscribed: listeners.into_iter().collect(),
                });
            }
            Err(err) => {
                error!(attempt = id, error = %err, "cannot build connect request");
                let delay = self.machine.on_error();
                self.reconnect_at = Some(Instant::now() + delay);
            }
        }
        self.machine.state()
    }

    fn on_reconnect_timer(&mut self) {
        self.reconnect_at = None;
        debug!("reconnect timer fired");
        self.detach_attempt();
        self.connect();
    }

    fn on_transport(&mut self, attempt: u64, event: TransportEvent) {
        if self.attempt.as_ref().map(|current| current.id) != Some(attempt) {
            trace!(attempt, "ignoring event from detached attempt");
            return;
        }
        match event {
            TransportEvent::Open => {
                debug!(attempt, "event stream open");
                self.machine.on_open();
            }
            TransportEvent::Error(reason) => self.on_transport_error(attempt, &reason),
            TransportEvent::Message(event) => self.on_message(event),
        }
    }

    fn on_transport_error(&mut self, attempt: u64, reason: &str) {
        let delay = self.machine.on_error();
        self.reconnect_at = Some(Instant::now() + delay);
        warn!(
            attempt,
            reason,
            delay_ms = delay.as_millis() as u64,
            "event stream error, reconnect scheduled"
        );
        if let Some(change) = self.tracker.deactivate() {
            self.emit_activity(change);
        }
    }

    fn on_message(&mut self, mut event: ServerEvent) {
        match event.name.as_str() {
            CONNECT_FINISH_EVENT => match event.json::<HandshakeFinish>() {
                Ok(finish) => self.on_handshake(&finish),
                Err(err) => warn!(error = %err, data = %event.data, "dropping malformed handshake"),
            },
            CONNECT_CLOSE_EVENT => match parse_server_close(&event) {
                Ok(payload) => {
                    let info = self.machine.on_server_close(payload);
                    info!(
                        triggered_by = ?info.triggered_by,
                        reason = info.reason.as_deref().unwrap_or_default(),
                        "server closed the session"
                    );
                    self.reconnect_at = None;
                    if let Some(attempt) = &self.attempt {
                        self.deferred.push_back(Deferred::DetachAttempt(attempt.id));
                    }
                    if let Some(change) = self.tracker.deactivate() {
                        self.emit_activity(change);
                    }
                    event.close = Some(info);
                }
                Err(err) => warn!(error = %err, data = %event.data, "dropping malformed close event"),
            },
            DURATION_SYNC_EVENT => match event.json::<DurationSync>() {
                Ok(sync) => self.tracker.sync(sync.duration),
                Err(err) => warn!(error = %err, data = %event.data, "dropping malformed duration sync"),
            },
            _ => {}
        }

        let subscribed = self
            .attempt
            .as_ref()
            .is_some_and(|attempt| attempt.subscribed.contains(&event.name));
        if subscribed {
            self.deliver(&event);
        }
    }

    fn on_handshake(&mut self, finish: &HandshakeFinish) {
        self.reconnect_at = None;
        self.machine.on_handshake(finish);
        info!(
            connection_id = %finish.connection_id,
            name = finish.name.as_deref().unwrap_or_default(),
            reconnect_ms = self.machine.reconnect_delay().as_millis() as u64,
            "session established"
        );
        self.flush();
        if let Some(change) = self.tracker.activate() {
            self.deferred.push_back(Deferred::EmitActivity(change));
        }
    }

    /// Local handler first, then the bus.
    fn deliver(&self, event: &ServerEvent) {
        trace!(event = %event.name, "dispatching event");
        if let Some(handler) = self.registry.handler(&event.name) {
            invoke_handler(&handler, event);
        }
        if let Some(dispatcher) = &self.dispatcher {
            dispatcher.dispatch(self.options.url.as_str(), event);
        }
    }

    fn emit_activity(&self, change: ActivityChange) {
        let data = match serde_json::to_string(&change) {
            Ok(data) => data,
            Err(err) => {
                warn!(error = %err, "cannot encode activity change");
                return;
            }
        };
        self.deliver(&ServerEvent::new(ACTIVITY_CHANGE_EVENT, data));
    }

    fn check_idle(&mut self) {
        let last_activity = self.activity.last_ms();
        let session_active = self.machine.is_active();
        let idle_timeout = self.options.idle_timeout;
        if let Some(change) = self
            .tracker
            .check(last_activity, idle_timeout, session_active)
        {
            debug!(active = change.current, "page activity changed");
            self.emit_activity(change);
        }
    }

    fn dispatch(&mut self, task: QueuedTask) {
        let Some(connection_id) = self
            .machine
            .is_active()
            .then(|| self.machine.connection_id().map(str::to_owned))
            .flatten()
        else {
            trace!(action = task.op.action(), "session inactive, queueing");
            self.queue.push(task);
            return;
        };

        let request = match self.build_request(&task.op, &connection_id) {
            Ok(request) => request,
            Err(err) => {
                let _ = task.reply.send(Err(err));
                return;
            }
        };
        match self.rpc.call(request) {
            Ok(pending) => {
                let QueuedTask { op, reply } = task;
                let action = op.action();
                tokio::spawn(async move {
                    let result = pending.await;
                    if let Err(err) = &result {
                        debug!(action, error = %err, "call failed");
                    }
                    let _ = reply.send(result);
                });
            }
            Err(err) if err.is_retryable() => {
                warn!(
                    action = task.op.action(),
                    error = %err,
                    "call could not be issued, queueing retry"
                );
                self.queue.push(task);
            }
            Err(err) => {
                let _ = task.reply.send(Err(err));
            }
        }
    }

    fn build_request(
        &mut self,
        op: &Operation,
        connection_id: &str,
    ) -> Result<RpcRequest, SessionError> {
        let base = &self.options.url;
        let (url, body, headers) = match op {
            Operation::Send {
                path,
                body,
                query,
                headers,
            } => (
                handshake::message_url(base, path, connection_id, query)?,
                RpcBody::Json(body.clone()),
                headers.clone(),
            ),
            Operation::Upload {
                path,
                form,
                query,
                headers,
            } => (
                handshake::upload_url(base, path, connection_id, query)?,
                RpcBody::Multipart(form.clone()),
                headers.clone(),
            ),
            Operation::AddListener(set) => {
                let url = handshake::endpoint(base, "addListener")?;
                self.registry.add(set);
                if let Some(attempt) = &mut self.attempt {
                    attempt.subscribed.extend(set.names());
                }
                (url, listener_body(connection_id, set), Params::new())
            }
            Operation::RemoveListener(set) => {
                let url = handshake::endpoint(base, "removeListener")?;
                self.registry.remove(set);
                if let Some(attempt) = &mut self.attempt {
                    for name in set.names() {
                        attempt.subscribed.remove(&name);
                    }
                }
                (url, listener_body(connection_id, set), Params::new())
            }
        };
        Ok(RpcRequest {
            url,
            body,
            headers,
            with_credentials: self.options.with_credentials,
        })
    }

    /// Dispatch exactly the tasks queued right now, oldest first.
    fn flush(&mut self) {
        let batch = self.queue.take_batch();
        if batch.is_empty() {
            return;
        }
        debug!(tasks = batch.len(), "flushing retry queue");
        for task in batch {
            self.dispatch(task);
        }
    }

    fn close(&mut self, reason: &str) -> bool {
        if self.machine.is_active() {
            self.flush();
        }
        self.reconnect_at = None;
        let snapshot = self.tracker.snapshot();
        let outcome = self.machine.on_manual_close(reason);
        self.detach_attempt();

        let CloseOutcome::Closed { connection_id } = outcome else {
            trace!(reason, "close ignored, already closed");
            return false;
        };
        info!(reason, "session closed by client");
        if let Some(change) = self.tracker.deactivate() {
            self.emit_activity(change);
        }
        let Some(connection_id) = connection_id else {
            return false;
        };

        let notice = DisconnectNotice {
            client_id: self.identity.client_id.clone(),
            connection_id,
            reason: reason.to_owned(),
            duration: snapshot,
        };
        match handshake::endpoint(&self.options.url, "disconnect") {
            Ok(url) => self.rpc.beacon(url, notice.form()),
            Err(err) => {
                warn!(error = %err, "cannot build disconnect url");
                false
            }
        }
    }

    fn switch_url(&mut self, url: Url) {
        if url == self.options.url {
            return;
        }
        info!(from = %self.options.url, to = %url, "switching endpoint");
        self.close("switchURL");
        if let Some(change) = self.tracker.rebind(self.options.duration_key_for(&url)) {
            self.emit_activity(change);
        }
        self.identity.access_timestamp = resolve_access_timestamp(
            self.store.as_ref(),
            url.as_str(),
            self.options.access_timestamp,
            self.clock.now_ms(),
        );
        self.options.url = url;
        self.connect();
    }

    fn destroy(&mut self) {
        if self.destroyed {
            return;
        }
        self.close("destroy");
        for task in self.queue.take_batch() {
            let _ = task.reply.send(Err(SessionError::closed(task.op.action())));
        }
        self.destroyed = true;
        info!(url = %self.options.url, "session destroyed");
    }

    fn detach_attempt(&mut self) {
        if let Some(mut attempt) = self.attempt.take() {
            trace!(attempt = attempt.id, "detaching event stream");
            attempt.handle.close();
        }
    }

    fn run_deferred(&mut self) {
        while let Some(task) = self.deferred.pop_front() {
            match task {
                Deferred::DetachAttempt(id) => {
                    if self.attempt.as_ref().is_some_and(|attempt| attempt.id == id) {
                        self.detach_attempt();
                    }
                }
                Deferred::EmitActivity(change) => self.emit_activity(change),
            }
        }
    }

    fn status(&self) -> SessionStatus {
        let negotiated = self.machine.negotiated();
        SessionStatus {
            url: self.options.url.clone(),
            state: self.machine.state(),
            connection_id: self.machine.connection_id().map(str::to_owned),
            connection_name: negotiated.name.clone(),
            server_time: negotiated.server_time,
            server_version: negotiated.version.clone(),
            client_id: self.identity.client_id.clone(),
            instance_id: self.identity.instance_id.clone(),
            access_timestamp: self.identity.access_timestamp,
            transport: self
                .attempt
                .as_ref()
                .map(|attempt| attempt.handle.ready_state()),
            last_close: self.machine.last_close().cloned(),
            server_close: self.machine.last_server_close().cloned(),
            client_close: self.machine.client_close().cloned(),
            queued: self.queue.len(),
            destroyed: self.destroyed,
        }
    }

    fn publish_status(&self) {
        let status = self.status();
        self.status_tx.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        });
    }
}

fn initial_status(options: &SessionOptions, identity: &Identity) -> SessionStatus {
    SessionStatus {
        url: options.url.clone(),
        state: ConnectionState::Closed,
        connection_id: None,
        connection_name: None,
        server_time: None,
        server_version: None,
        client_id: identity.client_id.clone(),
        instance_id: identity.instance_id.clone(),
        access_timestamp: identity.access_timestamp,
        transport: None,
        last_close: None,
        server_close: None,
        client_close: None,
        queued: 0,
        destroyed: false,
    }
}

fn listener_body(connection_id: &str, set: &ListenerSet) -> RpcBody {
    RpcBody::Json(json!({
        "connectionId": connection_id,
        "listener": set.names(),
    }))
}

fn parse_server_close(event: &ServerEvent) -> Result<ServerClose, serde_json::Error> {
    if event.data.trim().is_empty() {
        return Ok(ServerClose::default());
    }
    event.json()
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
