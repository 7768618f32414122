//! The `EventBus` trait — the contract every bus transport must fulfil.

use std::fmt;
use std::sync::Arc;

use serde_json::{Map, Value};

use crate::BusError;

/// Mutable run state threaded through every beat of one run.
///
/// Merging is shallow and later values win on key conflict.
pub type Baton = Map<String, Value>;

/// A subscriber callback.
///
/// Handlers run synchronously on the emitting task.  Returning `Err` stops
/// the fan-out and surfaces as [`BusError::Handler`] to the emitter.
pub type Handler = Arc<dyn Fn(&mut Delivery<'_>) -> anyhow::Result<()> + Send + Sync>;

/// Wrap a closure as a [`Handler`].
pub fn handler<F>(f: F) -> Handler
where
    F: Fn(&mut Delivery<'_>) -> anyhow::Result<()> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// What a handler receives for a single emit.
///
/// `payload` is read-only and shared by every subscriber of the emit.  When
/// the emitter supplies a baton, handlers may read and augment it; changes are
/// visible to later subscribers and to the emitter once `emit` returns.
pub struct Delivery<'a> {
    topic: &'a str,
    payload: &'a Value,
    baton: Option<&'a mut Baton>,
}

impl<'a> Delivery<'a> {
    pub fn new(topic: &'a str, payload: &'a Value, baton: Option<&'a mut Baton>) -> Self {
        Self { topic, payload, baton }
    }

    pub fn topic(&self) -> &str {
        self.topic
    }

    pub fn payload(&self) -> &Value {
        self.payload
    }

    pub fn baton(&self) -> Option<&Baton> {
        self.baton.as_deref()
    }

    pub fn baton_mut(&mut self) -> Option<&mut Baton> {
        self.baton.as_deref_mut()
    }
}

/// Handle returned by [`EventBus::subscribe`].
///
/// Dropping it keeps the subscription alive; call
/// [`Subscription::unsubscribe`] to detach the handler.
pub struct Subscription {
    topic: String,
    detach: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    pub fn new(topic: impl Into<String>, detach: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            topic: topic.into(),
            detach: Some(Box::new(detach)),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Remove the handler from the bus.  Calling this after the bus itself
    /// has been dropped is a no-op.
    pub fn unsubscribe(mut self) {
        if let Some(detach) = self.detach.take() {
            detach();
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("topic", &self.topic)
            .finish_non_exhaustive()
    }
}

/// A synchronous publish/subscribe transport.
///
/// Implementations must deliver an emit to the subscribers registered at the
/// moment the emit starts, in subscription order, before returning.
pub trait EventBus: Send + Sync {
    /// Register `handler` for `topic`.
    fn subscribe(&self, topic: &str, handler: Handler) -> Subscription;

    /// Deliver `payload` (and optionally a mutable baton) to every current
    /// subscriber of `topic`.
    ///
    /// # Errors
    /// Returns the first [`BusError::Handler`] raised by a subscriber.
    fn emit(&self, topic: &str, payload: &Value, baton: Option<&mut Baton>) -> Result<(), BusError>;

    /// Number of handlers currently registered for `topic`.
    fn subscriber_count(&self, topic: &str) -> usize;
}
