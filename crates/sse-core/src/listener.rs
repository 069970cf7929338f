use std::{
    collections::BTreeMap,
    fmt,
    panic::{AssertUnwindSafe, catch_unwind},
    sync::Arc,
};

use tracing::{trace, warn};

use crate::{
    channel::{BusEvent, EventBus},
    types::ServerEvent,
};

pub type EventHandler = Arc<dyn Fn(&ServerEvent) + Send + Sync>;

/// Error returned by an intercept; logged and otherwise ignored.
pub type InterceptError = Box<dyn std::error::Error + Send + Sync>;

/// Hook run on every bus-bound event before it is republished.
pub type Intercept = Arc<dyn Fn(&mut ServerEvent) -> Result<(), InterceptError> + Send + Sync>;

/// Normalised listener request: event name to optional handler.
///
/// Built from a single name, a list of names (optionally sharing one
/// handler) or explicit name/handler pairs.
#[derive(Clone, Default)]
pub struct ListenerSet {
    entries: BTreeMap<String, Option<EventHandler>>,
}

impl ListenerSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.entries.insert(name.into(), None);
        self
    }

    pub fn handler<F>(mut self, name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(&ServerEvent) + Send + Sync + 'static,
    {
        self.entries.insert(name.into(), Some(Arc::new(handler)));
        self
    }

    pub fn shared<I, S>(names: I, handler: EventHandler) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            entries: names
                .into_iter()
                .map(|name| (name.into(), Some(Arc::clone(&handler))))
                .collect(),
        }
    }

    pub fn names(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Option<EventHandler>)> {
        self.entries.iter()
    }
}

impl fmt::Debug for ListenerSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(
                self.entries
                    .iter()
                    .map(|(name, handler)| (name, handler.is_some())),
            )
            .finish()
    }
}

impl From<&str> for ListenerSet {
    fn from(name: &str) -> Self {
        Self::new().name(name)
    }
}

impl From<String> for ListenerSet {
    fn from(name: String) -> Self {
        Self::new().name(name)
    }
}

impl From<Vec<String>> for ListenerSet {
    fn from(names: Vec<String>) -> Self {
        names.into_iter().fold(Self::new(), Self::name)
    }
}

impl From<Vec<&str>> for ListenerSet {
    fn from(names: Vec<&str>) -> Self {
        names.into_iter().fold(Self::new(), Self::name)
    }
}

impl<const N: usize> From<[&str; N]> for ListenerSet {
    fn from(names: [&str; N]) -> Self {
        names.into_iter().fold(Self::new(), Self::name)
    }
}

impl From<BTreeMap<String, EventHandler>> for ListenerSet {
    fn from(map: BTreeMap<String, EventHandler>) -> Self {
        Self {
            entries: map
                .into_iter()
                .map(|(name, handler)| (name, Some(handler)))
                .collect(),
        }
    }
}

/// Source of truth for the session's subscriptions.
#[derive(Clone, Default, Debug)]
pub struct ListenerRegistry {
    listeners: ListenerSet,
}

impl ListenerRegistry {
    pub fn new(initial: ListenerSet) -> Self {
        Self { listeners: initial }
    }

    /// Merge `set`; a name added without a handler keeps any existing one.
    pub fn add(&mut self, set: &ListenerSet) {
        for (name, handler) in set.iter() {
            match handler {
                Some(handler) => {
                    self.listeners
                        .entries
                        .insert(name.clone(), Some(Arc::clone(handler)));
                }
                None => {
                    self.listeners.entries.entry(name.clone()).or_insert(None);
                }
            }
        }
    }

    pub fn remove(&mut self, set: &ListenerSet) {
        for name in set.entries.keys() {
            self.listeners.entries.remove(name);
        }
    }

    pub fn handler(&self, name: &str) -> Option<EventHandler> {
        self.listeners.entries.get(name).cloned().flatten()
    }

    pub fn names(&self) -> Vec<String> {
        self.listeners.names()
    }
}

pub fn invoke_handler(handler: &EventHandler, event: &ServerEvent) {
    if catch_unwind(AssertUnwindSafe(|| handler(event))).is_err() {
        warn!(event = %event.name, "listener handler panicked");
    }
}

/// Intercept chain plus bus republication for one session.
#[derive(Clone)]
pub struct BusDispatcher {
    bus: EventBus,
    intercepts: Vec<Intercept>,
}

impl BusDispatcher {
    pub fn new(bus: EventBus, intercepts: Vec<Intercept>) -> Self {
        Self { bus, intercepts }
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// Run every intercept in order, then republish with `origin`.
    pub fn dispatch(&self, origin: &str, event: &ServerEvent) {
        let mut event = event.clone();
        for (index, intercept) in self.intercepts.iter().enumerate() {
            match catch_unwind(AssertUnwindSafe(|| intercept(&mut event))) {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    warn!(event = %event.name, index, error = %err, "event intercept failed");
                }
                Err(_) => warn!(event = %event.name, index, "event intercept panicked"),
            }
        }
        trace!(event = %event.name, origin, "republishing event on bus");
        self.bus.publish(BusEvent {
            origin: origin.to_owned(),
            event,
        });
    }
}

impl fmt::Debug for BusDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BusDispatcher")
            .field("bus", &self.bus)
            .field("intercepts", &self.intercepts.len())
            .finish()
    }
}
