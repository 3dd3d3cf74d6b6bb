//! Synchronous publish/subscribe event bus with bounded history.
//!
//! Delivery happens on the publisher's thread, in subscription order.
//! Handler panics are isolated: every remaining handler still runs.
//! TTS/ASR callbacks publish here from their own threads, so all state
//! sits behind one mutex.

use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

const DEFAULT_MAX_HISTORY: usize = 200;

/// A single published event.
#[derive(Debug, Clone, Serialize)]
pub struct BusEvent {
    pub event_type: String,
    pub data: Value,
    pub source: String,
    pub timestamp: DateTime<Utc>,
}

type Handler = Box<dyn Fn(&BusEvent) + Send + Sync>;

struct Subscription {
    /// `None` subscribes to every event type.
    event_type: Option<String>,
    handler: Handler,
}

struct Inner {
    subscriptions: Vec<Subscription>,
    history: VecDeque<BusEvent>,
    max_history: usize,
}

/// Process-local event bus. Clone-free; share via `Arc`.
pub struct EventBus {
    inner: Mutex<Inner>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_HISTORY)
    }
}

impl EventBus {
    pub fn new(max_history: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                subscriptions: Vec::new(),
                history: VecDeque::new(),
                max_history,
            }),
        }
    }

    /// Subscribe to one event type. Handlers run synchronously on the
    /// publisher's thread, in subscription order.
    pub fn subscribe<F>(&self, event_type: &str, handler: F)
    where
        F: Fn(&BusEvent) + Send + Sync + 'static,
    {
        let mut inner = self.inner.lock().expect("event bus lock poisoned");
        inner.subscriptions.push(Subscription {
            event_type: Some(event_type.to_string()),
            handler: Box::new(handler),
        });
    }

    /// Subscribe to every event type.
    pub fn subscribe_all<F>(&self, handler: F)
    where
        F: Fn(&BusEvent) + Send + Sync + 'static,
    {
        let mut inner = self.inner.lock().expect("event bus lock poisoned");
        inner.subscriptions.push(Subscription {
            event_type: None,
            handler: Box::new(handler),
        });
    }

    /// Publish an event. Appends to history, then calls each matching
    /// handler; a panicking handler is logged and skipped.
    pub fn publish(&self, event_type: &str, data: Value, source: &str) {
        let event = BusEvent {
            event_type: event_type.to_string(),
            data,
            source: source.to_string(),
            timestamp: Utc::now(),
        };

        let mut inner = self.inner.lock().expect("event bus lock poisoned");
        inner.history.push_back(event.clone());
        while inner.history.len() > inner.max_history {
            inner.history.pop_front();
        }

        // Dispatch under the lock: FIFO per publisher requires that two
        // concurrent publishes do not interleave their handler runs.
        for sub in &inner.subscriptions {
            let matches = match &sub.event_type {
                Some(t) => t == &event.event_type,
                None => true,
            };
            if !matches {
                continue;
            }
            if catch_unwind(AssertUnwindSafe(|| (sub.handler)(&event))).is_err() {
                tracing::warn!(event_type = %event.event_type, "event handler panicked; continuing");
            }
        }
    }

    /// Copy of the retained event history, oldest first.
    pub fn history(&self) -> Vec<BusEvent> {
        let inner = self.inner.lock().expect("event bus lock poisoned");
        inner.history.iter().cloned().collect()
    }

    pub fn clear_history(&self) {
        let mut inner = self.inner.lock().expect("event bus lock poisoned");
        inner.history.clear();
    }
}
