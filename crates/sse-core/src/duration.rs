use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use sse_platform::{Clock, KeyValueStore, get_u64};
use tracing::{debug, warn};

use crate::types::{ActivityChange, DurationSnapshot};

/// Storage key prefix for the persisted session duration.
pub const DURATION_KEY_PREFIX: &str = "sseSessionDuration";

pub fn default_duration_key(url: &str) -> String {
    format!("{DURATION_KEY_PREFIX}:{url}")
}

/// Timestamp of the most recent user activity, shared between the façade
/// and the event loop.
///
/// Bursts of pointer signals collapse into one store; the loop only reads the
/// value on its idle check.
#[derive(Debug, Clone, Default)]
pub struct ActivitySignal {
    last_ms: Arc<AtomicU64>,
}

impl ActivitySignal {
    pub fn new(now_ms: u64) -> Self {
        Self {
            last_ms: Arc::new(AtomicU64::new(now_ms)),
        }
    }

    pub fn record(&self, now_ms: u64) {
        self.last_ms.fetch_max(now_ms, Ordering::Relaxed);
    }

    pub fn last_ms(&self) -> u64 {
        self.last_ms.load(Ordering::Relaxed)
    }
}

/// Foreground time accounting for one endpoint.
///
/// The persisted `sessionDuration` only ever grows when a segment closes;
/// the open segment lives in memory as its start instant.
pub struct DurationTracker {
    store: Arc<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
    key: String,
    segment_start: Option<u64>,
}

impl DurationTracker {
    pub fn new(store: Arc<dyn KeyValueStore>, clock: Arc<dyn Clock>, key: String) -> Self {
        Self {
            store,
            clock,
            key,
            segment_start: None,
        }
    }

    /// Point the tracker at another storage key. An open segment is
    /// persisted under the old key first.
    pub fn rebind(&mut self, key: String) -> Option<ActivityChange> {
        let change = self.deactivate();
        self.key = key;
        change
    }

    pub fn is_active(&self) -> bool {
        self.segment_start.is_some()
    }

    pub fn session_duration(&self) -> u64 {
        match get_u64(self.store.as_ref(), &self.key) {
            Ok(value) => value.unwrap_or(0),
            Err(err) => {
                warn!(key = %self.key, error = %err, "failed to read session duration");
                0
            }
        }
    }

    pub fn snapshot(&self) -> DurationSnapshot {
        let duration = self
            .segment_start
            .map(|start| self.clock.now_ms().saturating_sub(start))
            .unwrap_or(0);
        DurationSnapshot {
            session_duration: self.session_duration(),
            duration,
        }
    }

    pub fn activate(&mut self) -> Option<ActivityChange> {
        if self.segment_start.is_some() {
            return None;
        }
        self.segment_start = Some(self.clock.now_ms());
        debug!(key = %self.key, "activity segment opened");
        Some(ActivityChange {
            previous: false,
            current: true,
            duration: self.snapshot(),
        })
    }

    pub fn deactivate(&mut self) -> Option<ActivityChange> {
        let start = self.segment_start.take()?;
        let elapsed = self.clock.now_ms().saturating_sub(start);
        let total = self.session_duration().saturating_add(elapsed);
        self.persist(total);
        debug!(key = %self.key, elapsed, total, "activity segment closed");
        Some(ActivityChange {
            previous: true,
            current: false,
            duration: self.snapshot(),
        })
    }

    /// Idle check: derive the page-active flag from the last activity and
    /// apply the resulting transition, if any.
    pub fn check(
        &mut self,
        last_activity_ms: u64,
        idle_timeout: Duration,
        session_active: bool,
    ) -> Option<ActivityChange> {
        let idle_for = self.clock.now_ms().saturating_sub(last_activity_ms);
        let page_active = u128::from(idle_for) < idle_timeout.as_millis();
        match (page_active && session_active, self.is_active()) {
            (true, false) => self.activate(),
            (false, true) if !page_active => self.deactivate(),
            _ => None,
        }
    }

    pub fn sync(&mut self, session_duration: u64) {
        self.persist(session_duration);
    }

    fn persist(&self, total: u64) {
        if let Err(err) = self.store.set(&self.key, &total.to_string()) {
            warn!(key = %self.key, error = %err, "failed to persist session duration");
        }
    }
}

impl std::fmt::Debug for DurationTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DurationTracker")
            .field("key", &self.key)
            .field("segment_start", &self.segment_start)
            .finish()
    }
}
