//! Environment-backed runtime configuration for `sse-tail`.

use std::{env, error::Error, fmt, path::PathBuf, time::Duration};

use sse_core::{Params, SessionOptions};
use url::Url;

const DEFAULT_URL: &str = "http://127.0.0.1:8080/sse";

/// Runtime configuration used by the tail client.
#[derive(Debug, Clone, PartialEq)]
pub struct TailConfig {
    /// Endpoint base URL; `/connect` and friends are appended.
    pub url: Url,
    /// Event names to subscribe to and print.
    pub listeners: Vec<String>,
    pub keepalive: Option<Duration>,
    /// Overrides the server's reconnect hint.
    pub reconnect: Option<Duration>,
    pub idle_timeout: Option<Duration>,
    pub idle_check: Option<Duration>,
    /// When set, identity and duration survive restarts in this JSON file.
    pub store_path: Option<PathBuf>,
    pub use_event_bus: bool,
    pub client_id: Option<String>,
    /// Extra connect query pairs, parsed from `a=1&b=2`.
    pub query: Params,
}

impl TailConfig {
    /// Parse configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup<F>(mut lookup: F) -> Result<Self, ConfigError>
    where
        F: FnMut(&str) -> Option<String>,
    {
        let raw_url =
            optional_trimmed_env("SSE_URL", &mut lookup).unwrap_or_else(|| DEFAULT_URL.to_owned());
        let url = Url::parse(&raw_url).map_err(|err| ConfigError::InvalidValue {
            key: "SSE_URL",
            value: raw_url.clone(),
            reason: err.to_string(),
        })?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(ConfigError::InvalidValue {
                key: "SSE_URL",
                value: raw_url,
                reason: "scheme must be http or https".to_owned(),
            });
        }

        let listeners = optional_trimmed_env("SSE_LISTENERS", &mut lookup)
            .map(|value| {
                value
                    .split(',')
                    .map(str::trim)
                    .filter(|name| !name.is_empty())
                    .map(str::to_owned)
                    .collect()
            })
            .unwrap_or_default();

        let keepalive = parse_optional_millis("SSE_KEEPALIVE_MS", &mut lookup)?;
        let reconnect = parse_optional_millis("SSE_RECONNECT_MS", &mut lookup)?;
        let idle_timeout = parse_optional_millis("SSE_IDLE_TIMEOUT_MS", &mut lookup)?;
        let idle_check = parse_optional_millis("SSE_IDLE_CHECK_MS", &mut lookup)?;
        if idle_check == Some(Duration::ZERO) {
            return Err(ConfigError::InvalidValue {
                key: "SSE_IDLE_CHECK_MS",
                value: "0".to_owned(),
                reason: "must be at least 1".to_owned(),
            });
        }

        let store_path = optional_trimmed_env("SSE_STORE_PATH", &mut lookup).map(PathBuf::from);
        let use_event_bus = parse_optional_bool("SSE_USE_EVENT_BUS", &mut lookup)?.unwrap_or(false);
        let client_id = optional_trimmed_env("SSE_CLIENT_ID", &mut lookup);
        let query = optional_trimmed_env("SSE_QUERY", &mut lookup)
            .map(|value| parse_query(&value))
            .unwrap_or_default();

        Ok(Self {
            url,
            listeners,
            keepalive,
            reconnect,
            idle_timeout,
            idle_check,
            store_path,
            use_event_bus,
            client_id,
            query,
        })
    }

    /// Session options for this configuration. Unset values keep the
    /// library defaults.
    pub fn session_options(&self) -> SessionOptions {
        let mut options = SessionOptions::new(self.url.clone())
            .with_listeners(self.listeners.clone());
        if let Some(keepalive) = self.keepalive {
            options.keepalive_time = keepalive;
        }
        options.reconnect_time = self.reconnect;
        if let Some(idle_timeout) = self.idle_timeout {
            options.idle_timeout = idle_timeout;
        }
        if let Some(idle_check) = self.idle_check {
            options.idle_check_interval = idle_check;
        }
        options.use_event_bus = self.use_event_bus;
        options.client_id = self.client_id.clone();
        options.query = self.query.clone();
        options
    }
}

/// Errors produced while parsing runtime configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// An environment variable could not be parsed.
    InvalidValue {
        key: &'static str,
        value: String,
        reason: String,
    },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidValue { key, value, reason } => {
                write!(f, "invalid {key}='{value}': {reason}")
            }
        }
    }
}

impl Error for ConfigError {}

fn optional_trimmed_env<F>(key: &'static str, lookup: &mut F) -> Option<String>
where
    F: FnMut(&str) -> Option<String>,
{
    lookup(key)
        .map(|value| value.trim().to_owned())
        .filter(|value| !value.is_empty())
}

fn parse_optional_millis<F>(
    key: &'static str,
    lookup: &mut F,
) -> Result<Option<Duration>, ConfigError>
where
    F: FnMut(&str) -> Option<String>,
{
    let Some(value) = optional_trimmed_env(key, lookup) else {
        return Ok(None);
    };
    value
        .parse::<u64>()
        .map(|ms| Some(Duration::from_millis(ms)))
        .map_err(|err| ConfigError::InvalidValue {
            key,
            value,
            reason: err.to_string(),
        })
}

fn parse_optional_bool<F>(key: &'static str, lookup: &mut F) -> Result<Option<bool>, ConfigError>
where
    F: FnMut(&str) -> Option<String>,
{
    let Some(value) = optional_trimmed_env(key, lookup) else {
        return Ok(None);
    };
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(Some(true)),
        "0" | "false" | "no" | "off" => Ok(Some(false)),
        _ => Err(ConfigError::InvalidValue {
            key,
            value,
            reason: "expected a boolean".to_owned(),
        }),
    }
}

fn parse_query(raw: &str) -> Params {
    url::form_urlencoded::parse(raw.trim_start_matches('?').as_bytes())
        .map(|(name, value)| (name.into_owned(), value.into_owned()))
        .collect()
}
