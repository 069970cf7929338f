use std::{fmt, time::Duration};

use url::Url;

use crate::{
    channel::EventBus,
    duration::default_duration_key,
    handshake::{ClientEnvironment, DEFAULT_KEEPALIVE_TIME},
    listener::{BusDispatcher, Intercept, ListenerSet},
    types::Params,
};

pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(30 * 60);
pub const DEFAULT_IDLE_CHECK_INTERVAL: Duration = Duration::from_millis(1_000);

/// Construction options of a session. Everything but the endpoint defaults.
#[derive(Clone)]
pub struct SessionOptions {
    /// Endpoint base URL; `/connect`, `/message/..` etc. are appended.
    pub url: Url,
    pub keepalive_time: Duration,
    pub listeners: ListenerSet,
    /// Run in order on every event before it is republished on the bus.
    pub intercepts: Vec<Intercept>,
    /// Extra query parameters appended to the connect request.
    pub query: Params,
    pub with_credentials: bool,
    pub client_id: Option<String>,
    pub access_timestamp: Option<u64>,
    /// Overrides the server's reconnect hint when set.
    pub reconnect_time: Option<Duration>,
    pub use_event_bus: bool,
    /// Shared bus; sessions given clones of one bus publish into it.
    pub event_bus: Option<EventBus>,
    pub idle_timeout: Duration,
    pub idle_check_interval: Duration,
    pub duration_storage_key: Option<String>,
    pub environment: ClientEnvironment,
}

impl SessionOptions {
    pub fn new(url: Url) -> Self {
        Self {
            url,
            keepalive_time: DEFAULT_KEEPALIVE_TIME,
            listeners: ListenerSet::default(),
            intercepts: Vec::new(),
            query: Params::new(),
            with_credentials: false,
            client_id: None,
            access_timestamp: None,
            reconnect_time: None,
            use_event_bus: false,
            event_bus: None,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            idle_check_interval: DEFAULT_IDLE_CHECK_INTERVAL,
            duration_storage_key: None,
            environment: ClientEnvironment::default(),
        }
    }

    pub fn with_listeners(mut self, listeners: impl Into<ListenerSet>) -> Self {
        self.listeners = listeners.into();
        self
    }

    pub fn with_intercept(mut self, intercept: Intercept) -> Self {
        self.intercepts.push(intercept);
        self
    }

    pub fn with_event_bus(mut self, bus: EventBus) -> Self {
        self.use_event_bus = true;
        self.event_bus = Some(bus);
        self
    }

    pub fn with_query(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((name.into(), value.into()));
        self
    }

    pub fn reconnect_override_ms(&self) -> Option<u64> {
        self.reconnect_time
            .map(|delay| delay.as_millis() as u64)
            .filter(|ms| *ms > 0)
    }

    /// Storage key of the persisted duration for `url`.
    pub fn duration_key_for(&self, url: &Url) -> String {
        self.duration_storage_key
            .clone()
            .unwrap_or_else(|| default_duration_key(url.as_str()))
    }

    /// Bus dispatch for this session, if the bus is enabled.
    pub fn bus_dispatcher(&self) -> Option<BusDispatcher> {
        if !self.use_event_bus {
            return None;
        }
        let bus = self.event_bus.clone().unwrap_or_default();
        Some(BusDispatcher::new(bus, self.intercepts.clone()))
    }
}

impl fmt::Debug for SessionOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionOptions")
            .field("url", &self.url.as_str())
            .field("keepalive_time", &self.keepalive_time)
            .field("listeners", &self.listeners)
            .field("intercepts", &self.intercepts.len())
            .field("query", &self.query)
            .field("with_credentials", &self.with_credentials)
            .field("client_id", &self.client_id)
            .field("access_timestamp", &self.access_timestamp)
            .field("reconnect_time", &self.reconnect_time)
            .field("use_event_bus", &self.use_event_bus)
            .field("idle_timeout", &self.idle_timeout)
            .field("idle_check_interval", &self.idle_check_interval)
            .field("duration_storage_key", &self.duration_storage_key)
            .finish_non_exhaustive()
    }
}
