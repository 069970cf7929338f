use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, de::DeserializeOwned};
use serde_json::Value;

use crate::error::SessionError;

/// Ordered query-string or header pairs.
pub type Params = Vec<(String, String)>;

/// Transport-level state of the current connection attempt.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionState {
    Connecting,
    Open,
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Connecting => "CONNECTING",
            Self::Open => "OPEN",
            Self::Closed => "CLOSED",
        })
    }
}

/// Page visibility as reported by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visibility {
    Visible,
    Hidden,
}

/// Which side initiated a closed connection.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CloseInitiator {
    Client,
    Server,
}

/// Attribution attached to a server-initiated close event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CloseInfo {
    pub triggered_by: CloseInitiator,
    pub reason: Option<String>,
}

/// One named event pushed by the server (or synthesized by the session).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerEvent {
    pub name: String,
    pub data: String,
    pub id: Option<String>,
    /// Close attribution; only set on server-initiated close events.
    pub close: Option<CloseInfo>,
}

impl ServerEvent {
    pub fn new(name: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data: data.into(),
            id: None,
            close: None,
        }
    }

    /// Parse the event data as JSON.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_str(&self.data)
    }
}

/// Payload of the handshake-finish event.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct HandshakeFinish {
    #[serde(deserialize_with = "string_or_number")]
    pub connection_id: String,
    #[serde(default)]
    pub reconnect_time: Option<u64>,
    #[serde(default)]
    pub server_time: Option<u64>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
}

/// Payload of the server-initiated close event.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq, Default)]
pub struct ServerClose {
    #[serde(default)]
    pub reason: Option<String>,
}

/// Payload of the duration-sync event.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
pub struct DurationSync {
    pub duration: u64,
}

/// Accumulated active time, in milliseconds.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct DurationSnapshot {
    /// Persisted total across reloads and reconnects.
    pub session_duration: u64,
    /// Elapsed time of the open segment, `0` while idle.
    pub duration: u64,
}

/// Foreground/idle transition reported by the duration tracker.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ActivityChange {
    pub previous: bool,
    pub current: bool,
    #[serde(flatten)]
    pub duration: DurationSnapshot,
}

/// Multipart payload for uploads.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FormData {
    parts: Vec<FormPart>,
}

/// One field of a [`FormData`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FormPart {
    Text {
        name: String,
        value: String,
    },
    File {
        name: String,
        file_name: String,
        content_type: Option<String>,
        bytes: Vec<u8>,
    },
}

impl FormData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn text(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.parts.push(FormPart::Text {
            name: name.into(),
            value: value.into(),
        });
        self
    }

    pub fn file(
        mut self,
        name: impl Into<String>,
        file_name: impl Into<String>,
        content_type: Option<String>,
        bytes: Vec<u8>,
    ) -> Self {
        self.parts.push(FormPart::File {
            name: name.into(),
            file_name: file_name.into(),
            content_type,
            bytes,
        });
        self
    }

    pub fn parts(&self) -> &[FormPart] {
        &self.parts
    }

    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }

    /// Reject payloads that cannot be sent as an upload.
    pub fn validate(&self) -> Result<(), SessionError> {
        if self.parts.is_empty() {
            return Err(SessionError::validation(
                "upload requires a form with at least one part",
            ));
        }
        for part in &self.parts {
            if let FormPart::File {
                name,
                content_type: Some(content_type),
                ..
            } = part
                && !is_mime_shaped(content_type)
            {
                return Err(SessionError::validation(format!(
                    "part '{name}' has invalid content type '{content_type}'"
                )));
            }
        }
        Ok(())
    }
}

fn is_mime_shaped(value: &str) -> bool {
    let essence = value.split(';').next().unwrap_or_default().trim();
    match essence.split_once('/') {
        Some((kind, subtype)) => {
            !kind.is_empty()
                && !subtype.is_empty()
                && !essence.contains(char::is_whitespace)
                && !subtype.contains('/')
        }
        None => false,
    }
}

/// Response of an outbound RPC.
#[derive(Debug, Clone, PartialEq)]
pub struct RpcResponse {
    pub status: u16,
    pub body: Value,
}

fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(value) => Ok(value),
        Value::Number(value) => Ok(value.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "expected string or number, got {other}"
        ))),
    }
}
