//! In-process, synchronous bus.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use serde_json::Value;
use tracing::{debug, trace};

use crate::{Baton, BusError, Delivery, EventBus, Handler, Subscription};

type Registry = Mutex<HashMap<String, Vec<(u64, Handler)>>>;

/// Default [`EventBus`]: a topic → handlers map behind a mutex.
///
/// The lock is released before handlers run, so handlers may subscribe,
/// unsubscribe or emit re-entrantly.
#[derive(Default)]
pub struct InMemoryBus {
    topics: Arc<Registry>,
    next_id: AtomicU64,
}

impl InMemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Shorthand for `Arc::new(InMemoryBus::new())`, the shape the engine wants.
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Topics with at least one live subscriber, sorted.
    pub fn topics(&self) -> Vec<String> {
        let topics = self.topics.lock().unwrap_or_else(PoisonError::into_inner);
        let mut names: Vec<String> = topics
            .iter()
            .filter(|(_, handlers)| !handlers.is_empty())
            .map(|(topic, _)| topic.clone())
            .collect();
        names.sort();
        names
    }
}

impl EventBus for InMemoryBus {
    fn subscribe(&self, topic: &str, handler: Handler) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.topics
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(topic.to_owned())
            .or_default()
            .push((id, handler));
        trace!(topic, id, "subscribed");

        let registry = Arc::downgrade(&self.topics);
        let owned_topic = topic.to_owned();
        Subscription::new(topic, move || {
            let Some(registry) = registry.upgrade() else {
                return;
            };
            let mut topics = registry.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(handlers) = topics.get_mut(&owned_topic) {
                handlers.retain(|(existing, _)| *existing != id);
                if handlers.is_empty() {
                    topics.remove(&owned_topic);
                }
            }
            trace!(topic = %owned_topic, id, "unsubscribed");
        })
    }

    fn emit(&self, topic: &str, payload: &Value, baton: Option<&mut Baton>) -> Result<(), BusError> {
        // Snapshot so late subscribers never see an emit already in flight.
        let handlers: Vec<Handler> = {
            let topics = self.topics.lock().unwrap_or_else(PoisonError::into_inner);
            match topics.get(topic) {
                Some(handlers) => handlers.iter().map(|(_, h)| Arc::clone(h)).collect(),
                None => Vec::new(),
            }
        };

        if handlers.is_empty() {
            debug!(topic, "emit with no subscribers");
            return Ok(());
        }

        let mut delivery = Delivery::new(topic, payload, baton);
        for handler in handlers {
            handler(&mut delivery).map_err(|err| BusError::handler(topic, &err))?;
        }
        Ok(())
    }

    fn subscriber_count(&self, topic: &str) -> usize {
        self.topics
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(topic)
            .map_or(0, Vec::len)
    }
}
