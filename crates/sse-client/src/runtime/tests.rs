use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use serde_json::json;
use sse_core::{
    ACTIVITY_CHANGE_EVENT, ActivityChange, CloseInfo, CloseInitiator, ConnectionState, EventBus,
    FormData, Intercept, ListenerSet, Params, RpcResponse, ServerEvent, SessionError,
    SessionErrorCategory, SessionOptions, Visibility,
};
use sse_platform::{InMemoryStore, KeyValueStore, SystemClock};
use url::Url;

use crate::{
    rpc::{RpcBody, RpcFuture, RpcRequest, SessionRpc},
    session::{SessionBuilder, SessionHandle},
    transport::{
        AttemptSink, ConnectRequest, EventSourceConnector, EventSourceHandle, ReadyState,
        TransportEvent,
    },
};

const URL: &str = "https://example.org/common/sse";

#[derive(Clone)]
struct OpenedAttempt {
    request: ConnectRequest,
    sink: AttemptSink,
    state: Arc<Mutex<ReadyState>>,
}

impl OpenedAttempt {
    fn query(&self, name: &str) -> Option<String> {
        self.request
            .url
            .query_pairs()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.into_owned())
    }

    fn ready_state(&self) -> ReadyState {
        *self.state.lock().expect("state lock")
    }

    fn emit(&self, event: TransportEvent) {
        assert!(self.sink.emit(event), "session loop should be alive");
    }

    fn message(&self, name: &str, data: &str) {
        self.emit(TransportEvent::Message(ServerEvent::new(name, data)));
    }
}

#[derive(Clone, Default)]
struct FakeConnector {
    opened: Arc<Mutex<Vec<OpenedAttempt>>>,
}

struct FakeHandle {
    state: Arc<Mutex<ReadyState>>,
}

impl EventSourceHandle for FakeHandle {
    fn ready_state(&self) -> ReadyState {
        *self.state.lock().expect("state lock")
    }

    fn close(&mut self) {
        *self.state.lock().expect("state lock") = ReadyState::Closed;
    }
}

impl EventSourceConnector for FakeConnector {
    fn open(&self, request: ConnectRequest, sink: AttemptSink) -> Box<dyn EventSourceHandle> {
        let state = Arc::new(Mutex::new(ReadyState::Connecting));
        self.opened.lock().expect("opened lock").push(OpenedAttempt {
            request,
            sink,
            state: Arc::clone(&state),
        });
        Box::new(FakeHandle { state })
    }
}

#[derive(Clone, Default)]
struct FakeRpc {
    calls: Arc<Mutex<Vec<RpcRequest>>>,
    beacons: Arc<Mutex<Vec<(Url, Params)>>>,
    sent: Arc<Mutex<Vec<String>>>,
    unavailable: Arc<AtomicUsize>,
}

impl FakeRpc {
    fn calls(&self) -> Vec<RpcRequest> {
        self.calls.lock().expect("calls lock").clone()
    }

    fn paths(&self) -> Vec<String> {
        self.calls()
            .iter()
            .map(|call| call.url.path().to_owned())
            .collect()
    }

    fn beacons(&self) -> Vec<(Url, Params)> {
        self.beacons.lock().expect("beacons lock").clone()
    }

    /// Calls and beacons in the order they reached the transport.
    fn sent(&self) -> Vec<String> {
        self.sent.lock().expect("sent lock").clone()
    }

    fn fail_next(&self, count: usize) {
        self.unavailable.store(count, Ordering::SeqCst);
    }
}

impl SessionRpc for FakeRpc {
    fn call(&self, request: RpcRequest) -> Result<RpcFuture, SessionError> {
        if self
            .unavailable
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok()
        {
            return Err(SessionError::new(
                SessionErrorCategory::Network,
                "offline",
                "rpc transport unavailable",
            ));
        }
        let url = request.url.to_string();
        self.sent
            .lock()
            .expect("sent lock")
            .push(format!("call {}", request.url.path()));
        self.calls.lock().expect("calls lock").push(request);
        Ok(Box::pin(async move {
            Ok(RpcResponse {
                status: 200,
                body: json!({ "url": url }),
            })
        }))
    }

    fn beacon(&self, url: Url, form: Params) -> bool {
        self.sent
            .lock()
            .expect("sent lock")
            .push(format!("beacon {}", url.path()));
        self.beacons.lock().expect("beacons lock").push((url, form));
        true
    }
}

struct Harness {
    handle: SessionHandle,
    connector: FakeConnector,
    rpc: FakeRpc,
    store: InMemoryStore,
}

impl Harness {
    fn attempts(&self) -> usize {
        self.connector.opened.lock().expect("opened lock").len()
    }

    fn attempt(&self, index: usize) -> OpenedAttempt {
        self.connector.opened.lock().expect("opened lock")[index].clone()
    }

    fn latest(&self) -> OpenedAttempt {
        self.attempt(self.attempts() - 1)
    }

    /// Open the latest attempt and complete its handshake.
    async fn establish(&self, connection_id: &str, reconnect_time: Option<u64>) {
        let attempt = self.latest();
        attempt.emit(TransportEvent::Open);
        let mut finish = json!({
            "connectionId": connection_id,
            "serverTime": 1_000,
            "name": "n1",
        });
        if let Some(ms) = reconnect_time {
            finish["reconnectTime"] = json!(ms);
        }
        attempt.message("connect-finish", &finish.to_string());
        self.settle().await;
    }

    /// Wait until everything sent so far has been handled.
    async fn settle(&self) {
        self.handle.status().await.expect("session alive");
    }
}

fn options() -> SessionOptions {
    SessionOptions::new(Url::parse(URL).expect("valid url"))
}

fn harness(options: SessionOptions) -> Harness {
    harness_with_store(options, InMemoryStore::default())
}

fn harness_with_store(options: SessionOptions, store: InMemoryStore) -> Harness {
    let connector = FakeConnector::default();
    let rpc = FakeRpc::default();
    let handle = SessionBuilder::new(options)
        .store(Arc::new(store.clone()))
        .clock(Arc::new(SystemClock::new()))
        .connector(Arc::new(connector.clone()))
        .rpc(Arc::new(rpc.clone()))
        .spawn()
        .expect("session should spawn");
    Harness {
        handle,
        connector,
        rpc,
        store,
    }
}

fn body(call: &RpcRequest) -> serde_json::Value {
    match &call.body {
        RpcBody::Json(value) => value.clone(),
        RpcBody::Multipart(_) => panic!("expected json body"),
    }
}

fn query(call: &RpcRequest, name: &str) -> Option<String> {
    call.url
        .query_pairs()
        .find(|(key, _)| key == name)
        .map(|(_, value)| value.into_owned())
}

#[tokio::test(start_paused = true)]
async fn queued_tasks_replay_fifo_exactly_once_per_cycle() {
    let h = harness(options());

    let first = h.handle.send("chat", json!({"n": 1}));
    let second = h.handle.send("chat", json!({"n": 2}));
    let third = h.handle.upload("files", FormData::new().text("title", "t"));
    h.settle().await;
    assert!(h.rpc.calls().is_empty());
    assert_eq!(h.handle.snapshot().queued, 3);

    h.establish("abc123", None).await;
    let calls = h.rpc.calls();
    assert_eq!(
        h.rpc.paths(),
        [
            "/common/sse/message/chat",
            "/common/sse/message/chat",
            "/common/sse/upload/files"
        ]
    );
    assert_eq!(body(&calls[0]), json!({"n": 1}));
    assert_eq!(body(&calls[1]), json!({"n": 2}));
    for pending in [first, second, third] {
        let response = pending.await.expect("replayed task settles");
        assert_eq!(response.status, 200);
    }

    h.latest().emit(TransportEvent::Error("network down".to_owned()));
    let fourth = h.handle.send("chat", json!({"n": 4}));
    h.settle().await;
    assert_eq!(h.rpc.calls().len(), 3);

    tokio::time::advance(Duration::from_millis(5_000)).await;
    h.settle().await;
    assert_eq!(h.attempts(), 2);
    h.establish("def456", None).await;

    let calls = h.rpc.calls();
    assert_eq!(calls.len(), 4);
    assert_eq!(body(&calls[3]), json!({"n": 4}));
    assert_eq!(query(&calls[3], "connectionId").as_deref(), Some("def456"));
    fourth.await.expect("fourth settles");

    h.latest().emit(TransportEvent::Error("again".to_owned()));
    tokio::time::advance(Duration::from_millis(5_000)).await;
    h.settle().await;
    h.establish("ghi789", None).await;
    assert_eq!(h.rpc.calls().len(), 4);
}

#[tokio::test(start_paused = true)]
async fn is_active_requires_open_transport_and_connection_id() {
    let h = harness(options());
    h.settle().await;
    assert_eq!(h.handle.snapshot().state, ConnectionState::Connecting);
    assert!(!h.handle.is_active());

    h.latest().emit(TransportEvent::Open);
    h.settle().await;
    assert_eq!(h.handle.snapshot().state, ConnectionState::Open);
    assert!(!h.handle.is_active());

    h.establish("abc123", None).await;
    assert!(h.handle.is_active());
    assert_eq!(h.handle.to_string(), "n1:OPEN");

    h.handle.close("close").await.expect("close");
    assert!(!h.handle.is_active());
    assert_eq!(h.handle.to_string(), "n1:CLOSED");
}

#[tokio::test(start_paused = true)]
async fn connect_while_attempt_is_live_is_a_noop() {
    let h = harness(options());
    assert_eq!(
        h.handle.connect().await.expect("connect"),
        ConnectionState::Connecting
    );
    h.establish("abc123", None).await;
    assert_eq!(h.handle.connect().await.expect("connect"), ConnectionState::Open);
    h.handle
        .set_visibility(Visibility::Visible)
        .expect("visibility");
    h.settle().await;

    assert_eq!(h.attempts(), 1);
    assert!(h.handle.is_active());
}

#[tokio::test(start_paused = true)]
async fn second_close_sends_no_duplicate_notice() {
    let h = harness(options());
    h.establish("abc123", None).await;

    assert!(h.handle.close("close").await.expect("first close"));
    assert!(!h.handle.close("close").await.expect("second close"));

    let beacons = h.rpc.beacons();
    assert_eq!(beacons.len(), 1);
    let (url, form) = &beacons[0];
    assert_eq!(url.path(), "/common/sse/disconnect");
    let fields: Vec<&str> = form.iter().map(|(name, _)| name.as_str()).collect();
    assert_eq!(
        fields,
        ["clientId", "connectionId", "reason", "sseVersion", "duration", "sessionDuration"]
    );
    assert_eq!(form[1].1, "abc123");
    assert_eq!(form[2].1, "close");
    assert_eq!(h.latest().ready_state(), ReadyState::Closed);

    let status = h.handle.snapshot();
    let record = status.client_close.expect("client close recorded");
    assert_eq!(record.connection_id, "abc123");
    assert_eq!(record.reason, "close");
    assert_eq!(status.transport, None);
    assert_eq!(status.last_close, None);
}

#[tokio::test(start_paused = true)]
async fn close_flushes_queued_work_before_the_disconnect_notice() {
    let h = harness(options());
    h.establish("abc123", None).await;

    h.rpc.fail_next(1);
    let pending = h.handle.send("chat", json!({"n": 1}));
    h.settle().await;
    assert!(h.rpc.calls().is_empty());
    assert_eq!(h.handle.snapshot().queued, 1);

    assert!(h.handle.close("close").await.expect("close"));
    assert_eq!(
        h.rpc.sent(),
        ["call /common/sse/message/chat", "beacon /common/sse/disconnect"]
    );
    let call = &h.rpc.calls()[0];
    assert_eq!(query(call, "connectionId").as_deref(), Some("abc123"));
    assert_eq!(body(call), json!({"n": 1}));
    assert_eq!(h.handle.snapshot().queued, 0);
    pending.await.expect("flushed send settles");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn status_is_current_as_soon_as_commands_return() {
    for _ in 0..100 {
        let h = harness(options());
        assert_eq!(
            h.handle.connect().await.expect("connect"),
            ConnectionState::Connecting
        );
        assert_eq!(h.handle.snapshot().state, ConnectionState::Connecting);
        assert_eq!(h.handle.snapshot().transport, Some(ReadyState::Connecting));

        h.establish("abc123", None).await;
        assert!(h.handle.is_active());

        assert!(h.handle.close("close").await.expect("close"));
        assert!(!h.handle.is_active());
        assert_eq!(h.handle.snapshot().state, ConnectionState::Closed);

        let next = Url::parse("https://other.example.org/sse").expect("valid url");
        h.handle.switch_url(next.clone()).await.expect("switch");
        assert_eq!(h.handle.snapshot().url, next);

        h.handle.destroy().await.expect("destroy");
        assert!(h.handle.snapshot().destroyed);
    }
}

#[tokio::test(start_paused = true)]
async fn handshake_drives_connection_id_and_reconnect_delay() {
    let h = harness(options());
    h.establish("abc123", Some(8_000)).await;

    let response = h
        .handle
        .send_with(
            "chat/post",
            json!({"text": "hi"}),
            vec![("room".to_owned(), "7".to_owned())],
            Params::new(),
        )
        .await
        .expect("send");
    assert_eq!(response.status, 200);
    let call = &h.rpc.calls()[0];
    assert_eq!(query(call, "connectionId").as_deref(), Some("abc123"));
    assert_eq!(query(call, "room").as_deref(), Some("7"));

    h.latest().emit(TransportEvent::Error("reset".to_owned()));
    h.settle().await;
    assert!(!h.handle.is_active());
    assert_eq!(
        h.attempt(0).ready_state(),
        ReadyState::Connecting,
        "errored transport is only detached by the reconnect timer"
    );

    tokio::time::advance(Duration::from_millis(5_000)).await;
    h.settle().await;
    assert_eq!(h.attempts(), 1, "default delay must not apply");

    tokio::time::advance(Duration::from_millis(3_000)).await;
    h.settle().await;
    assert_eq!(h.attempts(), 2);
    assert_eq!(h.attempt(0).ready_state(), ReadyState::Closed);
    assert_eq!(h.handle.snapshot().connection_id, None);
}

#[tokio::test(start_paused = true)]
async fn manual_close_cancels_pending_reconnect() {
    let h = harness(options());
    h.establish("abc123", None).await;
    h.latest().emit(TransportEvent::Error("reset".to_owned()));
    h.settle().await;

    assert!(!h.handle.close("close").await.expect("close"));
    tokio::time::advance(Duration::from_secs(60)).await;
    h.settle().await;
    assert_eq!(h.attempts(), 1);
    assert!(h.rpc.beacons().is_empty());
}

#[tokio::test(start_paused = true)]
async fn invalid_upload_rejects_without_queueing() {
    let h = harness(options());
    let err = h
        .handle
        .upload("files", FormData::new())
        .await
        .expect_err("empty form must be rejected");
    assert_eq!(err.category, SessionErrorCategory::Validation);

    h.settle().await;
    assert_eq!(h.handle.snapshot().queued, 0);
    h.establish("abc123", None).await;
    assert!(h.rpc.calls().is_empty());
}

#[tokio::test(start_paused = true)]
async fn visibility_hidden_closes_and_visible_reconnects() {
    let h = harness(options());
    h.establish("abc123", None).await;

    h.handle
        .set_visibility(Visibility::Hidden)
        .expect("visibility");
    h.settle().await;
    let beacons = h.rpc.beacons();
    assert_eq!(beacons.len(), 1);
    assert_eq!(beacons[0].1[2].1, "visibilitychange");
    assert_eq!(h.handle.snapshot().state, ConnectionState::Closed);

    h.handle
        .set_visibility(Visibility::Visible)
        .expect("visibility");
    h.settle().await;
    assert_eq!(h.attempts(), 2);
    let status = h.handle.snapshot();
    assert_eq!(status.state, ConnectionState::Connecting);
    assert_eq!(status.connection_id, None);

    h.establish("def456", None).await;
    assert_eq!(h.handle.snapshot().connection_id.as_deref(), Some("def456"));
}

#[tokio::test(start_paused = true)]
async fn unload_sends_notice_with_unload_reason() {
    let h = harness(options());
    h.establish("abc123", None).await;
    h.handle.unload().expect("unload");
    h.settle().await;

    let beacons = h.rpc.beacons();
    assert_eq!(beacons.len(), 1);
    assert_eq!(beacons[0].1[2].1, "unload");
}

#[tokio::test(start_paused = true)]
async fn synchronous_rpc_failure_is_retried_after_next_handshake() {
    let h = harness(options());
    h.establish("abc123", None).await;

    h.rpc.fail_next(1);
    let pending = h.handle.send("chat", json!({"n": 1}));
    h.settle().await;
    assert!(h.rpc.calls().is_empty());
    assert_eq!(h.handle.snapshot().queued, 1);

    h.latest().emit(TransportEvent::Error("reset".to_owned()));
    tokio::time::advance(Duration::from_millis(5_000)).await;
    h.settle().await;
    h.establish("def456", None).await;

    pending.await.expect("retried send settles");
    assert_eq!(h.rpc.calls().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn listener_changes_apply_locally_and_remotely() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let h = harness(options().with_listeners("news"));
    assert_eq!(h.latest().query("listeners").as_deref(), Some("news"));
    h.establish("abc123", None).await;

    let seen_alerts = Arc::clone(&seen);
    h.handle
        .add_listener(ListenerSet::new().handler("alerts", move |event| {
            seen_alerts
                .lock()
                .expect("seen lock")
                .push(event.data.clone());
        }))
        .await
        .expect("add listener");
    let call = &h.rpc.calls()[0];
    assert_eq!(call.url.path(), "/common/sse/addListener");
    assert_eq!(
        body(call),
        json!({"connectionId": "abc123", "listener": ["alerts"]})
    );

    h.latest().message("alerts", "first");
    h.settle().await;
    h.handle
        .remove_listener("alerts")
        .await
        .expect("remove listener");
    h.latest().message("alerts", "second");
    h.settle().await;
    assert_eq!(seen.lock().expect("seen lock").as_slice(), ["first"]);

    h.latest().emit(TransportEvent::Error("reset".to_owned()));
    tokio::time::advance(Duration::from_millis(5_000)).await;
    h.settle().await;
    assert_eq!(h.latest().query("listeners").as_deref(), Some("news"));
}

#[tokio::test(start_paused = true)]
async fn listener_change_while_inactive_is_queued() {
    let h = harness(options());
    let pending = h.handle.add_listener(["a", "b"]);
    h.settle().await;
    assert_eq!(h.handle.snapshot().queued, 1);

    h.establish("abc123", None).await;
    pending.await.expect("queued add settles");
    assert_eq!(
        body(&h.rpc.calls()[0]),
        json!({"connectionId": "abc123", "listener": ["a", "b"]})
    );

    h.latest().emit(TransportEvent::Error("reset".to_owned()));
    tokio::time::advance(Duration::from_millis(5_000)).await;
    h.settle().await;
    assert_eq!(h.latest().query("listeners").as_deref(), Some("a,b"));
}

#[tokio::test(start_paused = true)]
async fn server_close_is_attributed_and_detached_after_dispatch() {
    let closes = Arc::new(Mutex::new(Vec::new()));
    let closes_seen = Arc::clone(&closes);
    let h = harness(options().with_listeners(ListenerSet::new().handler(
        "connect-close",
        move |event| {
            closes_seen
                .lock()
                .expect("closes lock")
                .push(event.close.clone());
        },
    )));
    h.establish("abc123", None).await;

    assert_eq!(h.handle.snapshot().transport, Some(ReadyState::Connecting));
    h.latest()
        .message("connect-close", r#"{"reason":"kicked"}"#);
    h.settle().await;

    let closes = closes.lock().expect("closes lock").clone();
    assert_eq!(closes.len(), 1);
    let info = closes[0].clone().expect("close info attached");
    assert_eq!(info.triggered_by, CloseInitiator::Server);
    assert_eq!(info.reason.as_deref(), Some("kicked"));

    let status = h.handle.snapshot();
    assert_eq!(status.state, ConnectionState::Closed);
    assert_eq!(
        status.last_close,
        Some(CloseInfo {
            triggered_by: CloseInitiator::Server,
            reason: Some("kicked".to_owned()),
        })
    );
    assert_eq!(
        status.server_close.and_then(|close| close.reason).as_deref(),
        Some("kicked")
    );
    assert_eq!(status.client_close, None);
    assert_eq!(status.transport, None);
    assert_eq!(h.latest().ready_state(), ReadyState::Closed);
    tokio::time::advance(Duration::from_secs(60)).await;
    h.settle().await;
    assert_eq!(h.attempts(), 1, "server close does not reconnect");
}

#[tokio::test(start_paused = true)]
async fn events_from_detached_attempts_are_ignored() {
    let received = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&received);
    let h = harness(options().with_listeners(ListenerSet::new().handler("news", move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    })));
    h.establish("abc123", None).await;
    let stale = h.latest();

    stale.emit(TransportEvent::Error("reset".to_owned()));
    tokio::time::advance(Duration::from_millis(5_000)).await;
    h.settle().await;
    assert_eq!(h.attempts(), 2);

    stale.message("connect-finish", r#"{"connectionId":"ghost"}"#);
    stale.message("news", "late");
    h.settle().await;
    assert_eq!(received.load(Ordering::SeqCst), 0);
    assert_eq!(h.handle.snapshot().connection_id, None);
}

#[tokio::test(start_paused = true)]
async fn malformed_handshake_is_dropped() {
    let h = harness(options());
    h.latest().emit(TransportEvent::Open);
    h.latest().message("connect-finish", "not json");
    h.settle().await;
    assert!(!h.handle.is_active());

    h.establish("abc123", None).await;
    assert!(h.handle.is_active());
}

#[tokio::test(start_paused = true)]
async fn bus_receives_intercepted_events_with_origin() {
    let bus = EventBus::new(16);
    let mut rx = bus.subscribe();
    let tag: Intercept = Arc::new(|event: &mut ServerEvent| {
        event.data = format!("tagged:{}", event.data);
        Ok(())
    });
    let failing: Intercept =
        Arc::new(|_: &mut ServerEvent| Err("intercept failure".into()));
    let h = harness(
        options()
            .with_listeners("news")
            .with_intercept(failing)
            .with_intercept(tag)
            .with_event_bus(bus.clone()),
    );
    assert_eq!(
        h.latest().query("useWindowEventBus").as_deref(),
        Some("true")
    );
    assert!(h.handle.event_bus().is_some());
    h.establish("abc123", None).await;

    h.latest().message("news", "hello");
    h.settle().await;

    loop {
        let published = rx.recv().await.expect("bus event");
        if published.event.name == "news" {
            assert_eq!(published.event.data, "tagged:hello");
            assert_eq!(published.origin, URL);
            break;
        }
    }
}

#[tokio::test(start_paused = true)]
async fn activity_changes_track_idle_and_active_time() {
    let changes = Arc::new(Mutex::new(Vec::<ActivityChange>::new()));
    let recorded = Arc::clone(&changes);
    let mut opts = options().with_listeners(ListenerSet::new().handler(
        ACTIVITY_CHANGE_EVENT,
        move |event| {
            if let Ok(change) = event.json() {
                recorded.lock().expect("changes lock").push(change);
            }
        },
    ));
    opts.idle_timeout = Duration::from_secs(10);
    opts.idle_check_interval = Duration::from_secs(1);
    let h = harness(opts);
    h.establish("abc123", None).await;

    tokio::time::advance(Duration::from_secs(4)).await;
    let open = h.handle.duration().await.expect("duration");
    assert!(open.duration >= 4_000, "{open:?}");

    tokio::time::advance(Duration::from_secs(8)).await;
    h.settle().await;
    let idle = h.handle.duration().await.expect("duration");
    assert_eq!(idle.duration, 0);
    assert!(idle.session_duration >= 4_000, "{idle:?}");

    h.handle.record_activity();
    tokio::time::advance(Duration::from_secs(1)).await;
    h.settle().await;

    let currents: Vec<bool> = changes
        .lock()
        .expect("changes lock")
        .iter()
        .map(|change| change.current)
        .collect();
    assert_eq!(currents, [true, false, true]);
}

#[tokio::test(start_paused = true)]
async fn duration_sync_replaces_persisted_total() {
    let h = harness(options());
    h.establish("abc123", None).await;
    h.latest().message("duration-sync", r#"{"duration":120000}"#);
    h.settle().await;

    let snapshot = h.handle.duration().await.expect("duration");
    assert_eq!(snapshot.session_duration, 120_000);
    assert_eq!(
        h.store
            .get(&format!("sseSessionDuration:{URL}"))
            .expect("read")
            .as_deref(),
        Some("120000")
    );
}

#[tokio::test(start_paused = true)]
async fn client_id_is_generated_once_per_store() {
    let store = InMemoryStore::default();
    let first = harness_with_store(options(), store.clone());
    let second = harness_with_store(options(), store.clone());

    let a = first.handle.snapshot();
    let b = second.handle.snapshot();
    assert_eq!(a.client_id, b.client_id);
    assert_ne!(a.instance_id, b.instance_id);
    assert_eq!(
        store.get("sseClientId").expect("read").as_deref(),
        Some(a.client_id.as_str())
    );
    assert_eq!(first.latest().query("clientId"), Some(a.client_id.clone()));
    assert_eq!(
        first.latest().query("clientVersion").as_deref(),
        Some("1.2.19")
    );
}

#[tokio::test(start_paused = true)]
async fn switch_url_closes_and_reconnects_to_new_endpoint() {
    let h = harness(options());
    h.establish("abc123", None).await;

    let next = Url::parse("https://other.example.org/sse").expect("valid url");
    h.handle.switch_url(next.clone()).await.expect("switch");
    assert_eq!(h.attempts(), 2);
    assert_eq!(h.rpc.beacons()[0].1[2].1, "switchURL");
    assert_eq!(h.latest().request.url.host_str(), Some("other.example.org"));
    assert_eq!(h.latest().request.url.path(), "/sse/connect");
    assert_eq!(h.handle.snapshot().url, next);

    h.handle.switch_url(next).await.expect("same url");
    assert_eq!(h.attempts(), 2);
}

#[tokio::test(start_paused = true)]
async fn destroy_settles_queued_operations() {
    let h = harness(options());
    let pending = h.handle.send("chat", json!({}));
    h.handle.destroy().await.expect("destroy");

    let err = pending.await.expect_err("queued op must fail");
    assert_eq!(err.category, SessionErrorCategory::Closed);
    let err = h.handle.status().await.expect_err("loop stopped");
    assert_eq!(err.code, "session_closed");
}

#[tokio::test(start_paused = true)]
async fn dropping_every_handle_tears_down_the_transport() {
    let h = harness(options());
    h.establish("abc123", None).await;
    let attempt = h.latest();
    let rpc = h.rpc.clone();
    drop(h);

    tokio::task::yield_now().await;
    for _ in 0..10 {
        if attempt.ready_state() == ReadyState::Closed {
            break;
        }
        tokio::task::yield_now().await;
    }
    assert_eq!(attempt.ready_state(), ReadyState::Closed);
    assert_eq!(rpc.beacons().len(), 1);
    assert!(!attempt.sink.emit(TransportEvent::Open));
}
