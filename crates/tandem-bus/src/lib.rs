// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! In-process publish/subscribe.
//!
//! Topics are plain strings (each domain crate exports its topic
//! constants); payloads are JSON values built by typed constructors at
//! the publishing site. Subscribers registered under the wildcard topic
//! `"*"` receive every event after the topic's own subscribers.
//!
//! Subscriber panics are isolated and logged; they never propagate into
//! the publisher. Handlers run in registration order. The subscription
//! table lock is released before handlers run, so a handler may
//! subscribe or publish without deadlocking.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, Weak};

use serde_json::Value;
use tracing::warn;

/// Wildcard topic that matches every published event.
pub const WILDCARD: &str = "*";

/// One delivered event: topic plus JSON payload.
#[derive(Debug, Clone)]
pub struct BusEvent {
    pub topic: String,
    pub payload: Value,
}

impl BusEvent {
    pub fn new(topic: impl Into<String>, payload: Value) -> Self {
        Self {
            topic: topic.into(),
            payload,
        }
    }
}

/// Returned by handlers. Only meaningful for [`Bus::once`]
/// subscriptions: returning [`HandlerFlow::Done`] removes the handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerFlow {
    Continue,
    Done,
}

type Handler = Arc<dyn Fn(&BusEvent) -> HandlerFlow + Send + Sync>;

struct Entry {
    token: u64,
    once: bool,
    handler: Handler,
}

#[derive(Default)]
struct Inner {
    next_token: u64,
    subs: HashMap<String, Vec<Entry>>,
}

/// The process-wide event bus. Clones share the subscription table.
#[derive(Default, Clone)]
pub struct Bus {
    inner: Arc<Mutex<Inner>>,
}

/// Handle returned by [`Bus::subscribe`]; call
/// [`Subscription::unsubscribe`] to remove the handler. Dropping the
/// handle leaves the subscription in place.
pub struct Subscription {
    inner: Weak<Mutex<Inner>>,
    topic: String,
    token: u64,
}

impl Subscription {
    pub fn unsubscribe(self) {
        if let Some(inner) = self.inner.upgrade() {
            let mut inner = inner.lock().expect("bus lock poisoned");
            if let Some(entries) = inner.subs.get_mut(&self.topic) {
                entries.retain(|e| e.token != self.token);
            }
        }
    }
}

impl Bus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for `topic`. The handler's return value is
    /// ignored for plain subscriptions.
    pub fn subscribe<F>(&self, topic: &str, handler: F) -> Subscription
    where
        F: Fn(&BusEvent) -> HandlerFlow + Send + Sync + 'static,
    {
        self.register(topic, false, Arc::new(handler))
    }

    /// Register a handler for every event, invoked after the topic's
    /// own subscribers.
    pub fn subscribe_all<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&BusEvent) -> HandlerFlow + Send + Sync + 'static,
    {
        self.register(WILDCARD, false, Arc::new(handler))
    }

    /// Register a handler that removes itself the first time it returns
    /// [`HandlerFlow::Done`].
    pub fn once<F>(&self, topic: &str, handler: F) -> Subscription
    where
        F: Fn(&BusEvent) -> HandlerFlow + Send + Sync + 'static,
    {
        self.register(topic, true, Arc::new(handler))
    }

    fn register(&self, topic: &str, once: bool, handler: Handler) -> Subscription {
        let mut inner = self.inner.lock().expect("bus lock poisoned");
        inner.next_token += 1;
        let token = inner.next_token;
        inner.subs.entry(topic.to_string()).or_default().push(Entry {
            token,
            once,
            handler,
        });
        Subscription {
            inner: Arc::downgrade(&self.inner),
            topic: topic.to_string(),
            token,
        }
    }

    /// Deliver `event` to the topic's subscribers, then to wildcard
    /// subscribers, synchronously and in registration order.
    pub fn publish(&self, event: &BusEvent) {
        // Snapshot handlers so subscribers can mutate the table freely.
        let batch: Vec<(String, u64, bool, Handler)> = {
            let inner = self.inner.lock().expect("bus lock poisoned");
            let mut batch = Vec::new();
            for topic in [event.topic.as_str(), WILDCARD] {
                if let Some(entries) = inner.subs.get(topic) {
                    for e in entries {
                        batch.push((topic.to_string(), e.token, e.once, Arc::clone(&e.handler)));
                    }
                }
            }
            batch
        };

        let mut done: Vec<(String, u64)> = Vec::new();
        for (topic, token, once, handler) in batch {
            match catch_unwind(AssertUnwindSafe(|| handler(event))) {
                Ok(HandlerFlow::Done) if once => done.push((topic, token)),
                Ok(_) => {}
                Err(_) => {
                    warn!(topic = %event.topic, "event subscriber panicked; continuing");
                }
            }
        }

        if !done.is_empty() {
            let mut inner = self.inner.lock().expect("bus lock poisoned");
            for (topic, token) in done {
                if let Some(entries) = inner.subs.get_mut(&topic) {
                    entries.retain(|e| e.token != token);
                }
            }
        }
    }

    /// Convenience: build and publish an event in one call.
    pub fn emit(&self, topic: &str, payload: Value) {
        self.publish(&BusEvent::new(topic, payload));
    }

    /// Remove every subscription. Test helper.
    pub fn clear(&self) {
        self.inner.lock().expect("bus lock poisoned").subs.clear();
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
