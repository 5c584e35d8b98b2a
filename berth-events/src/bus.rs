//! Topic-based publish/subscribe for lifecycle events.
//!
//! Callbacks run on the publisher's task and must not block. The lock
//! guards only the subscriber map; callbacks are invoked after it is
//! released. Subscriptions can be suspended, which buffers events until
//! resume replays them in order. Cache sync uses this to avoid losing
//! events that arrive while the cache is being rebuilt.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use berth_core::{ContainerId, VmRef};
use chrono::{DateTime, Utc};
use serde::Serialize;

/// Event channels on the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    /// Raw VM lifecycle events from the hypervisor collector.
    VmEvents,
    /// Container-level events emitted by the cache and network context.
    ContainerEvents,
}

impl std::fmt::Display for Topic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Topic::VmEvents => "vm",
            Topic::ContainerEvents => "container",
        })
    }
}

/// A container-level event.
#[derive(Debug, Clone, Serialize)]
pub struct ContainerEvent {
    pub id: ContainerId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vm: Option<VmRef>,
    /// What happened, e.g. `die`, `start`, `destroy`.
    pub event: String,
    pub created: DateTime<Utc>,
}

/// Any event carried by the bus.
#[derive(Debug, Clone)]
pub enum BusEvent {
    Vm(berth_driver::VmEvent),
    Container(ContainerEvent),
}

/// Flattened, serializable projection of a [`BusEvent`] for streaming.
#[derive(Debug, Clone, Serialize)]
pub struct EventRecord {
    pub topic: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vm: Option<String>,
    pub event: String,
    pub created: DateTime<Utc>,
}

impl BusEvent {
    #[must_use]
    pub fn record(&self) -> EventRecord {
        match self {
            BusEvent::Vm(e) => EventRecord {
                topic: Topic::VmEvents.to_string(),
                id: None,
                vm: Some(e.vm.to_string()),
                event: e.kind.to_string(),
                created: e.created,
            },
            BusEvent::Container(e) => EventRecord {
                topic: Topic::ContainerEvents.to_string(),
                id: Some(e.id.to_string()),
                vm: e.vm.as_ref().map(ToString::to_string),
                event: e.event.clone(),
                created: e.created,
            },
        }
    }
}

type Callback = Arc<dyn Fn(BusEvent) + Send + Sync>;

struct Subscriber {
    callback: Callback,
    suspended: bool,
    buffered: Vec<BusEvent>,
}

/// The process-wide event bus.
#[derive(Default)]
pub struct EventBus {
    topics: Mutex<HashMap<Topic, HashMap<String, Subscriber>>>,
}

impl EventBus {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<Topic, HashMap<String, Subscriber>>> {
        match self.topics.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Registers `callback` under `(topic, id)`, replacing any previous
    /// subscription with the same id.
    pub fn subscribe<F>(&self, topic: Topic, id: impl Into<String>, callback: F)
    where
        F: Fn(BusEvent) + Send + Sync + 'static,
    {
        let id = id.into();
        tracing::debug!(%topic, subscriber = %id, "subscribe");
        self.lock().entry(topic).or_default().insert(
            id,
            Subscriber {
                callback: Arc::new(callback),
                suspended: false,
                buffered: Vec::new(),
            },
        );
    }

    pub fn unsubscribe(&self, topic: Topic, id: &str) {
        if let Some(subs) = self.lock().get_mut(&topic) {
            subs.remove(id);
        }
    }

    /// Stops delivery to `(topic, id)`; events are buffered instead.
    pub fn suspend(&self, topic: Topic, id: &str) {
        if let Some(sub) = self.lock().get_mut(&topic).and_then(|s| s.get_mut(id)) {
            sub.suspended = true;
        }
    }

    /// Resumes delivery, first replaying everything buffered while
    /// suspended, in arrival order.
    pub fn resume(&self, topic: Topic, id: &str) {
        let replays = {
            let mut topics = self.lock();
            let Some(sub) = topics.get_mut(&topic).and_then(|s| s.get_mut(id)) else {
                return;
            };
            sub.suspended = false;
            let buffered = std::mem::take(&mut sub.buffered);
            buffered
                .into_iter()
                .map(|e| (Arc::clone(&sub.callback), e))
                .collect::<Vec<_>>()
        };
        for (callback, event) in replays {
            callback(event);
        }
    }

    /// Delivers `event` to every live subscriber of `topic`.
    pub fn publish(&self, topic: Topic, event: &BusEvent) {
        let callbacks = {
            let mut topics = self.lock();
            let Some(subs) = topics.get_mut(&topic) else {
                return;
            };
            let mut live = Vec::with_capacity(subs.len());
            for sub in subs.values_mut() {
                if sub.suspended {
                    sub.buffered.push(event.clone());
                } else {
                    live.push(Arc::clone(&sub.callback));
                }
            }
            live
        };
        for callback in callbacks {
            callback(event.clone());
        }
    }
}
