use sse_platform::{Clock, KeyValueStore, get_u64};
use tracing::warn;
use uuid::Uuid;

/// Storage key of the long-lived client id.
pub const CLIENT_ID_KEY: &str = "sseClientId";
/// Storage key prefix of the per-endpoint first access time.
pub const ACCESS_TIMESTAMP_KEY_PREFIX: &str = "sseAccessTimestamp";

pub fn access_timestamp_key(url: &str) -> String {
    format!("{ACCESS_TIMESTAMP_KEY_PREFIX}:{url}")
}

/// Identity of one session instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub client_id: String,
    pub instance_id: String,
    pub create_timestamp: u64,
    pub access_timestamp: u64,
}

impl Identity {
    /// Resolve identifiers before the first transport attempt.
    ///
    /// Storage failures degrade to freshly generated values; they never block
    /// the session.
    pub fn resolve(
        store: &dyn KeyValueStore,
        clock: &dyn Clock,
        url: &str,
        client_id: Option<&str>,
        access_timestamp: Option<u64>,
    ) -> Self {
        let create_timestamp = clock.now_ms();
        Self {
            client_id: resolve_client_id(store, client_id),
            instance_id: Uuid::new_v4().to_string(),
            create_timestamp,
            access_timestamp: resolve_access_timestamp(
                store,
                url,
                access_timestamp,
                create_timestamp,
            ),
        }
    }
}

fn resolve_client_id(store: &dyn KeyValueStore, explicit: Option<&str>) -> String {
    let stored = match store.get(CLIENT_ID_KEY) {
        Ok(value) => value.filter(|id| !id.is_empty()),
        Err(err) => {
            warn!(error = %err, "failed to read client id");
            None
        }
    };
    let client_id = explicit
        .filter(|id| !id.is_empty())
        .map(str::to_owned)
        .or(stored)
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    if let Err(err) = store.set(CLIENT_ID_KEY, &client_id) {
        warn!(error = %err, "failed to persist client id");
    }
    client_id
}

/// Explicit value, else the stored one, else `now`; the result is persisted.
pub fn resolve_access_timestamp(
    store: &dyn KeyValueStore,
    url: &str,
    explicit: Option<u64>,
    now_ms: u64,
) -> u64 {
    let key = access_timestamp_key(url);
    let stored = get_u64(store, &key).unwrap_or_else(|err| {
        warn!(key = %key, error = %err, "failed to read access timestamp");
        None
    });
    let access = explicit.or(stored).unwrap_or(now_ms);
    if stored != Some(access)
        && let Err(err) = store.set(&key, &access.to_string())
    {
        warn!(key = %key, error = %err, "failed to persist access timestamp");
    }
    access
}
