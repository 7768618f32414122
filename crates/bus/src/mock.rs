//! Test doubles for bus subscribers.
//!
//! Useful in unit and integration tests where a real plugin is either
//! unavailable or irrelevant.

use std::sync::{Arc, Mutex, PoisonError};

use serde_json::Value;

use crate::{handler, Delivery, EventBus, Handler, Subscription};

/// Behaviour injected into [`MockHandler`] at construction time.
#[derive(Debug, Clone)]
pub enum MockBehaviour {
    /// Accept the delivery and do nothing else.
    Succeed,
    /// Write `key = value` into the baton, if one was supplied.
    WriteBaton(String, Value),
    /// Fail every call with the given message.
    Fail(String),
    /// Fail the first `n` calls, then succeed.
    FailTimes(usize, String),
}

/// A handler that records every payload it receives and behaves as told.
#[derive(Clone)]
pub struct MockHandler {
    pub behaviour: MockBehaviour,
    /// All payloads seen by this handler (in call order).
    pub calls: Arc<Mutex<Vec<Value>>>,
}

impl MockHandler {
    pub fn succeeding() -> Self {
        Self::with(MockBehaviour::Succeed)
    }

    pub fn failing(msg: impl Into<String>) -> Self {
        Self::with(MockBehaviour::Fail(msg.into()))
    }

    pub fn failing_times(times: usize, msg: impl Into<String>) -> Self {
        Self::with(MockBehaviour::FailTimes(times, msg.into()))
    }

    pub fn writing(key: impl Into<String>, value: Value) -> Self {
        Self::with(MockBehaviour::WriteBaton(key.into(), value))
    }

    fn with(behaviour: MockBehaviour) -> Self {
        Self {
            behaviour,
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Number of times this handler has been invoked.
    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Payloads received so far.
    pub fn payloads(&self) -> Vec<Value> {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Convert into a bus [`Handler`] sharing this mock's call log.
    pub fn handler(&self) -> Handler {
        let mock = self.clone();
        handler(move |delivery| mock.invoke(delivery))
    }

    /// Subscribe to `topic` on `bus`.
    pub fn attach(&self, bus: &dyn EventBus, topic: &str) -> Subscription {
        bus.subscribe(topic, self.handler())
    }

    fn invoke(&self, delivery: &mut Delivery<'_>) -> anyhow::Result<()> {
        let seen = {
            let mut calls = self.calls.lock().unwrap_or_else(PoisonError::into_inner);
            calls.push(delivery.payload().clone());
            calls.len()
        };

        match &self.behaviour {
            MockBehaviour::Succeed => Ok(()),
            MockBehaviour::WriteBaton(key, value) => {
                if let Some(baton) = delivery.baton_mut() {
                    baton.insert(key.clone(), value.clone());
                }
                Ok(())
            }
            MockBehaviour::Fail(msg) => Err(anyhow::anyhow!(msg.clone())),
            MockBehaviour::FailTimes(times, msg) if seen <= *times => {
                Err(anyhow::anyhow!(msg.clone()))
            }
            MockBehaviour::FailTimes(..) => Ok(()),
        }
    }
}

/// Records `(topic, payload)` pairs across many topics in global arrival
/// order, for asserting interleaving.
#[derive(Clone, Default)]
pub struct EventLog {
    entries: Arc<Mutex<Vec<(String, Value)>>>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe the log to each of `topics`.
    pub fn attach(&self, bus: &dyn EventBus, topics: &[&str]) -> Vec<Subscription> {
        topics
            .iter()
            .map(|topic| {
                let entries = Arc::clone(&self.entries);
                bus.subscribe(
                    topic,
                    handler(move |delivery| {
                        entries
                            .lock()
                            .unwrap_or_else(PoisonError::into_inner)
                            .push((delivery.topic().to_owned(), delivery.payload().clone()));
                        Ok(())
                    }),
                )
            })
            .collect()
    }

    pub fn entries(&self) -> Vec<(String, Value)> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Topics in arrival order.
    pub fn topics(&self) -> Vec<String> {
        self.entries().into_iter().map(|(topic, _)| topic).collect()
    }

    /// Payloads delivered on `topic`, in arrival order.
    pub fn payloads_for(&self, topic: &str) -> Vec<Value> {
        self.entries()
            .into_iter()
            .filter(|(t, _)| t == topic)
            .map(|(_, payload)| payload)
            .collect()
    }

    pub fn clear(&self) {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }
}
