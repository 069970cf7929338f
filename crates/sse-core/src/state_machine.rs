use std::time::Duration;

use crate::{
    retry::ReconnectPolicy,
    types::{CloseInfo, CloseInitiator, ConnectionState, HandshakeFinish, ServerClose},
};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Negotiated {
    pub server_time: Option<u64>,
    pub name: Option<String>,
    pub version: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientClose {
    pub connection_id: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseOutcome {
    AlreadyClosed,
    Closed { connection_id: Option<String> },
}

#[derive(Debug, Clone)]
pub struct ConnectionStateMachine {
    state: ConnectionState,
    connection_id: Option<String>,
    negotiated: Negotiated,
    reconnect: ReconnectPolicy,
    client_close: Option<ClientClose>,
    last_server_close: Option<ServerClose>,
    last_close: Option<CloseInfo>,
}

impl ConnectionStateMachine {
    pub fn new(reconnect_override_ms: Option<u64>) -> Self {
        Self {
            state: ConnectionState::Closed,
            connection_id: None,
            negotiated: Negotiated::default(),
            reconnect: ReconnectPolicy::new(reconnect_override_ms),
            client_close: None,
            last_server_close: None,
            last_close: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn connection_id(&self) -> Option<&str> {
        self.connection_id.as_deref()
    }

    pub fn negotiated(&self) -> &Negotiated {
        &self.negotiated
    }

    pub fn reconnect_delay(&self) -> Duration {
        self.reconnect.delay()
    }

    pub fn client_close(&self) -> Option<&ClientClose> {
        self.client_close.as_ref()
    }

    pub fn last_server_close(&self) -> Option<&ServerClose> {
        self.last_server_close.as_ref()
    }

    pub fn last_close(&self) -> Option<&CloseInfo> {
        self.last_close.as_ref()
    }

    pub fn is_active(&self) -> bool {
        self.state == ConnectionState::Open && self.connection_id.is_some()
    }

    /// Start a new attempt. Returns `false` and leaves everything untouched
    /// while an attempt is still connecting or open.
    pub fn begin_connect(&mut self) -> bool {
        if self.state != ConnectionState::Closed {
            return false;
        }
        self.state = ConnectionState::Connecting;
        self.connection_id = None;
        true
    }

    pub fn on_open(&mut self) {
        self.client_close = None;
        self.state = ConnectionState::Open;
    }

    pub fn on_handshake(&mut self, finish: &HandshakeFinish) {
        self.connection_id = Some(finish.connection_id.clone());
        self.reconnect.set_server_hint(finish.reconnect_time);
        self.negotiated = Negotiated {
            server_time: finish.server_time,
            name: finish.name.clone(),
            version: finish.version.clone(),
        };
    }

    pub fn on_error(&mut self) -> Duration {
        self.state = ConnectionState::Closed;
        self.connection_id = None;
        self.reconnect.delay()
    }

    pub fn on_server_close(&mut self, payload: ServerClose) -> CloseInfo {
        self.state = ConnectionState::Closed;
        self.connection_id = None;
        let info = match &self.client_close {
            Some(record) => CloseInfo {
                triggered_by: CloseInitiator::Client,
                reason: Some(record.reason.clone()),
            },
            None => CloseInfo {
                triggered_by: CloseInitiator::Server,
                reason: payload.reason.clone(),
            },
        };
        self.last_server_close = Some(payload);
        self.last_close = Some(info.clone());
        info
    }

    pub fn on_manual_close(&mut self, reason: &str) -> CloseOutcome {
        if self.state == ConnectionState::Closed {
            return CloseOutcome::AlreadyClosed;
        }
        self.state = ConnectionState::Closed;
        let connection_id = self.connection_id.take();
        if let Some(id) = &connection_id {
            self.client_close = Some(ClientClose {
                connection_id: id.clone(),
                reason: reason.to_owned(),
            });
        }
        CloseOutcome::Closed { connection_id }
    }
}
