mod config;
mod logging;

use std::sync::Arc;

use serde_json::json;
use sse_client::SessionBuilder;
use sse_core::{EventHandler, ListenerSet, ServerEvent};
use sse_platform::{JsonFileStore, KeyValueStore};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

use crate::config::TailConfig;

#[tokio::main]
async fn main() {
    logging::init();

    let config = match TailConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("Invalid configuration: {err}");
            std::process::exit(2);
        }
    };

    let mut options = config.session_options();
    let printer: EventHandler = Arc::new(print_event);
    options.listeners = ListenerSet::shared(config.listeners.iter().cloned(), printer);

    let mut builder = SessionBuilder::new(options);
    if let Some(path) = &config.store_path {
        match JsonFileStore::open(path) {
            Ok(store) => {
                let store: Arc<dyn KeyValueStore> = Arc::new(store);
                builder = builder.store(store);
            }
            Err(err) => {
                eprintln!("Failed to open store {}: {err}", path.display());
                std::process::exit(1);
            }
        }
    }

    let session = match builder.spawn() {
        Ok(session) => session,
        Err(err) => {
            eprintln!("Failed to start session: {err}");
            std::process::exit(1);
        }
    };
    info!(url = %config.url, listeners = ?config.listeners, "tailing session");

    if let Some(bus) = session.event_bus() {
        let mut events = bus.subscribe();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(published) => {
                        println!(
                            "{}",
                            json!({
                                "origin": published.origin,
                                "event": published.event.name,
                                "data": published.event.data,
                            })
                        );
                    }
                    Err(RecvError::Lagged(skipped)) => warn!(skipped, "bus subscriber lagged"),
                    Err(RecvError::Closed) => break,
                }
            }
        });
    }

    let mut status = session.watch();
    tokio::spawn(async move {
        while status.changed().await.is_ok() {
            let current = status.borrow_and_update().clone();
            info!(
                state = %current.state,
                connection_id = current.connection_id.as_deref().unwrap_or_default(),
                queued = current.queued,
                transport = ?current.transport,
                last_close = ?current.last_close,
                "session status"
            );
        }
    });

    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "cannot listen for ctrl-c, shutting down");
    }
    match session.duration().await {
        Ok(duration) => info!(
            session_duration_ms = duration.session_duration,
            segment_ms = duration.duration,
            "shutting down"
        ),
        Err(err) => warn!(error = %err, "cannot read session duration"),
    }
    if let Err(err) = session.destroy().await {
        warn!(error = %err, "session already stopped");
    }
}

fn print_event(event: &ServerEvent) {
    let mut line = json!({ "event": event.name, "data": event.data });
    if let Some(id) = &event.id {
        line["id"] = json!(id);
    }
    if let Some(close) = &event.close {
        line["close"] = json!({
            "triggeredBy": close.triggered_by,
            "reason": close.reason,
        });
    }
    println!("{line}");
}
