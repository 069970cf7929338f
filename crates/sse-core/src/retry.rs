use std::time::Duration;

pub const DEFAULT_RECONNECT_TIME_MS: u64 = 5_000;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconnectPolicy {
    override_ms: Option<u64>,
    server_ms: Option<u64>,
}

impl ReconnectPolicy {
    pub fn new(override_ms: Option<u64>) -> Self {
        Self {
            override_ms,
            server_ms: None,
        }
    }

    pub fn override_ms(&self) -> Option<u64> {
        self.override_ms
    }

    pub fn set_server_hint(&mut self, server_ms: Option<u64>) {
        self.server_ms = server_ms.filter(|ms| *ms > 0);
    }

    pub fn delay_ms(&self) -> u64 {
        self.override_ms
            .filter(|ms| *ms > 0)
            .or(self.server_ms)
            .unwrap_or(DEFAULT_RECONNECT_TIME_MS)
    }

    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms())
    }
}
