use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use serde_json::Value;
use tokio::sync::broadcast;

use undoable_types::{EventEnvelope, EventType};

pub type EventHandler = Arc<dyn Fn(&EventEnvelope) + Send + Sync>;

const ALL_RUNS: &str = "*";

struct BusInner {
    next_subscription: u64,
    /// runId -> subscription id -> handler. The wildcard channel lives under
    /// `ALL_RUNS`.
    handlers: HashMap<String, HashMap<u64, EventHandler>>,
    /// Monotonic event counter per run.
    next_event: HashMap<String, u64>,
}

/// Process-wide fan-out keyed by run id. Handlers run synchronously in the
/// publisher's context; a panicking handler must not starve the rest.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<Mutex<BusInner>>,
    feed: broadcast::Sender<EventEnvelope>,
}

/// Handle for a registered handler. Dropping it (or calling `unsubscribe`)
/// removes the handler from the registry.
pub struct Subscription {
    bus: EventBus,
    channel: String,
    key: u64,
}

impl Subscription {
    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Ok(mut inner) = self.bus.inner.lock() {
            if let Some(handlers) = inner.handlers.get_mut(&self.channel) {
                handlers.remove(&self.key);
                if handlers.is_empty() {
                    inner.handlers.remove(&self.channel);
                }
            }
        }
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (feed, _) = broadcast::channel(2048);
        Self {
            inner: Arc::new(Mutex::new(BusInner {
                next_subscription: 1,
                handlers: HashMap::new(),
                next_event: HashMap::new(),
            })),
            feed,
        }
    }

    pub fn emit(
        &self,
        run_id: &str,
        event_type: EventType,
        payload: Value,
        actor: Option<String>,
    ) -> EventEnvelope {
        let (envelope, handlers) = {
            let mut inner = match self.inner.lock() {
                Ok(inner) => inner,
                Err(poisoned) => poisoned.into_inner(),
            };
            let counter = inner.next_event.entry(run_id.to_string()).or_insert(0);
            *counter += 1;
            let envelope = EventEnvelope {
                event_id: *counter,
                run_id: run_id.to_string(),
                timestamp: Utc::now(),
                event_type,
                payload,
                actor,
            };
            let mut targets: Vec<EventHandler> = Vec::new();
            if let Some(run_handlers) = inner.handlers.get(run_id) {
                targets.extend(run_handlers.values().cloned());
            }
            if let Some(all_handlers) = inner.handlers.get(ALL_RUNS) {
                targets.extend(all_handlers.values().cloned());
            }
            (envelope, targets)
        };
        for handler in handlers {
            let result =
                std::panic::catch_unwind(AssertUnwindSafe(|| handler(&envelope)));
            if result.is_err() {
                tracing::warn!(run_id, "event handler panicked; remaining handlers still run");
            }
        }
        let _ = self.feed.send(envelope.clone());
        envelope
    }

    pub fn on_run(
        &self,
        run_id: &str,
        handler: impl Fn(&EventEnvelope) + Send + Sync + 'static,
    ) -> Subscription {
        self.subscribe_channel(run_id.to_string(), Arc::new(handler))
    }

    pub fn on_all(&self, handler: impl Fn(&EventEnvelope) + Send + Sync + 'static) -> Subscription {
        self.subscribe_channel(ALL_RUNS.to_string(), Arc::new(handler))
    }

    fn subscribe_channel(&self, channel: String, handler: EventHandler) -> Subscription {
        let key = {
            let mut inner = match self.inner.lock() {
                Ok(inner) => inner,
                Err(poisoned) => poisoned.into_inner(),
            };
            let key = inner.next_subscription;
            inner.next_subscription += 1;
            inner
                .handlers
                .entry(channel.clone())
                .or_default()
                .insert(key, handler);
            key
        };
        Subscription {
            bus: self.clone(),
            channel,
            key,
        }
    }

    /// Drop every handler and the event counter for a deleted run.
    pub fn clear_run(&self, run_id: &str) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.handlers.remove(run_id);
            inner.next_event.remove(run_id);
        }
    }

    /// Live feed for SSE subscribers.
    pub fn subscribe_feed(&self) -> broadcast::Receiver<EventEnvelope> {
        self.feed.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn event_ids_are_monotonic_per_run() {
        let bus = EventBus::new();
        let first = bus.emit("r1", EventType::RunCreated, json!({}), None);
        let second = bus.emit("r1", EventType::StatusChanged, json!({}), None);
        let other = bus.emit("r2", EventType::RunCreated, json!({}), None);
        assert_eq!(first.event_id, 1);
        assert_eq!(second.event_id, 2);
        assert_eq!(other.event_id, 1);
    }

    #[test]
    fn wildcard_and_run_handlers_both_fire() {
        let bus = EventBus::new();
        let run_hits = Arc::new(AtomicUsize::new(0));
        let all_hits = Arc::new(AtomicUsize::new(0));
        let run_counter = run_hits.clone();
        let all_counter = all_hits.clone();
        let _run_sub = bus.on_run("r1", move |_| {
            run_counter.fetch_add(1, Ordering::SeqCst);
        });
        let _all_sub = bus.on_all(move |_| {
            all_counter.fetch_add(1, Ordering::SeqCst);
        });
        bus.emit("r1", EventType::ToolCall, json!({}), None);
        bus.emit("r2", EventType::ToolCall, json!({}), None);
        assert_eq!(run_hits.load(Ordering::SeqCst), 1);
        assert_eq!(all_hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn panicking_handler_does_not_block_delivery() {
        let bus = EventBus::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let _bad = bus.on_run("r1", |_| panic!("boom"));
        let _good = bus.on_run("r1", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        bus.emit("r1", EventType::Warning, json!({}), None);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unsubscribe_stops_delivery() {
        let bus = EventBus::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let sub = bus.on_run("r1", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        bus.emit("r1", EventType::ToolCall, json!({}), None);
        sub.unsubscribe();
        bus.emit("r1", EventType::ToolCall, json!({}), None);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
