//! Wire-level names and request encoding of the session protocol.

use std::{
    sync::LazyLock,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use url::Url;

use crate::{
    error::{SessionError, SessionErrorCategory},
    types::{DurationSnapshot, Params},
};

/// Protocol/client version announced on connect and disconnect.
pub const CLIENT_VERSION: &str = "1.2.19";

pub const CONNECT_FINISH_EVENT: &str = "connect-finish";
pub const CONNECT_CLOSE_EVENT: &str = "connect-close";
pub const DURATION_SYNC_EVENT: &str = "duration-sync";
/// Synthesized locally on every foreground/idle transition.
pub const ACTIVITY_CHANGE_EVENT: &str = "sse-change-active";

pub const DEFAULT_KEEPALIVE_TIME: Duration = Duration::from_millis(900_000);

static MODULE_LOAD_TIME: LazyLock<u64> = LazyLock::new(|| {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or(0)
});

/// Time this library was first used in the process, in epoch milliseconds.
pub fn module_load_time() -> u64 {
    *MODULE_LOAD_TIME
}

/// Host memory figures reported on connect when available.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryDiagnostics {
    pub total_heap_size: u64,
    pub used_heap_size: u64,
    pub heap_size_limit: u64,
}

/// Host description sent with every handshake.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientEnvironment {
    pub screen: String,
    pub location_href: String,
    pub memory: Option<MemoryDiagnostics>,
}

/// Everything encoded into the connect request of one attempt.
#[derive(Debug, Clone)]
pub struct HandshakeRequest<'a> {
    pub keepalive_time: Duration,
    pub client_id: &'a str,
    pub access_timestamp: u64,
    pub listeners: &'a [String],
    pub use_event_bus: bool,
    pub environment: &'a ClientEnvironment,
    pub instance_time: u64,
    pub instance_id: &'a str,
    pub query: &'a Params,
}

impl HandshakeRequest<'_> {
    pub fn params(&self) -> Params {
        let mut params: Params = vec![
            pair("keepaliveTime", self.keepalive_time.as_millis()),
            pair("clientId", self.client_id),
            pair("clientVersion", CLIENT_VERSION),
            pair("screen", &self.environment.screen),
            pair("accessTime", self.access_timestamp),
            pair("listeners", self.listeners.join(",")),
            pair("useWindowEventBus", self.use_event_bus),
            pair("locationHref", &self.environment.location_href),
            pair("clientImportModuleTime", module_load_time()),
            pair("clientInstanceTime", self.instance_time),
            pair("clientInstanceId", self.instance_id),
        ];
        if let Some(memory) = self.environment.memory {
            params.push(pair("totalJSHeapSize", memory.total_heap_size));
            params.push(pair("usedJSHeapSize", memory.used_heap_size));
            params.push(pair("jsHeapSizeLimit", memory.heap_size_limit));
        }
        params.extend(self.query.iter().cloned());
        params
    }

    pub fn url(&self, base: &Url) -> Result<Url, SessionError> {
        Ok(with_query(endpoint(base, "connect")?, &self.params()))
    }
}

/// Best-effort notice sent when the client closes a session it owned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisconnectNotice {
    pub client_id: String,
    pub connection_id: String,
    pub reason: String,
    pub duration: DurationSnapshot,
}

impl DisconnectNotice {
    pub fn form(&self) -> Params {
        vec![
            pair("clientId", &self.client_id),
            pair("connectionId", &self.connection_id),
            pair("reason", &self.reason),
            pair("sseVersion", CLIENT_VERSION),
            pair("duration", self.duration.duration),
            pair("sessionDuration", self.duration.session_duration),
        ]
    }
}

/// `<base>/<path>`, keeping any path prefix of `base`.
pub fn endpoint(base: &Url, path: &str) -> Result<Url, SessionError> {
    let joined = format!(
        "{}/{}",
        base.as_str().trim_end_matches('/'),
        path.trim_start_matches('/')
    );
    Url::parse(&joined).map_err(|err| {
        SessionError::new(
            SessionErrorCategory::Config,
            "invalid_url",
            format!("cannot build endpoint '{joined}': {err}"),
        )
    })
}

pub fn message_url(
    base: &Url,
    path: &str,
    connection_id: &str,
    query: &Params,
) -> Result<Url, SessionError> {
    rpc_url(base, "message", path, connection_id, query)
}

pub fn upload_url(
    base: &Url,
    path: &str,
    connection_id: &str,
    query: &Params,
) -> Result<Url, SessionError> {
    rpc_url(base, "upload", path, connection_id, query)
}

fn rpc_url(
    base: &Url,
    kind: &str,
    path: &str,
    connection_id: &str,
    query: &Params,
) -> Result<Url, SessionError> {
    let url = endpoint(base, &format!("{kind}/{}", path.trim_start_matches('/')))?;
    let mut params = vec![pair("connectionId", connection_id)];
    params.extend(query.iter().cloned());
    Ok(with_query(url, &params))
}

fn with_query(mut url: Url, params: &Params) -> Url {
    if !params.is_empty() {
        url.query_pairs_mut().extend_pairs(params);
    }
    url
}

fn pair(name: &str, value: impl ToString) -> (String, String) {
    (name.to_owned(), value.to_string())
}
