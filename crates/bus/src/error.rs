//! Bus-level error type.

use thiserror::Error;

/// Errors returned by [`crate::EventBus::emit`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BusError {
    /// A subscriber's handler returned an error.  Fan-out stops at the first
    /// failing handler; later subscribers for the same emit are not called.
    #[error("handler for '{topic}' failed: {message}")]
    Handler {
        topic: String,
        message: String,
    },
}

impl BusError {
    /// Build a handler failure from whatever the handler returned.
    pub fn handler(topic: impl Into<String>, err: &anyhow::Error) -> Self {
        Self::Handler {
            topic: topic.into(),
            message: format!("{err:#}"),
        }
    }

    /// The human-readable failure message, without the topic prefix.
    pub fn message(&self) -> &str {
        match self {
            Self::Handler { message, .. } => message,
        }
    }
}
