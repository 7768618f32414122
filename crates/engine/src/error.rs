//! Engine-level error types.

use thiserror::Error;

use crate::models::RunId;

/// Errors produced by the conductor (registration + execution).
#[derive(Debug, Error)]
pub enum EngineError {
    // ------ Registration errors ------

    /// The definition (or its handler set) failed structural validation.
    #[error("sequence '{name}' failed validation: {}", errors.join("; "))]
    Registration {
        name: String,
        errors: Vec<String>,
    },

    // ------ Lookup errors ------

    /// `start_sequence` was called with a name nobody registered.
    #[error("sequence '{0}' not found")]
    SequenceNotFound(String),

    // ------ Execution errors ------

    /// A beat with the `abort-sequence` policy failed; the run stops here.
    #[error("sequence '{sequence}' aborted at beat {beat} ('{event}'): {message}")]
    BeatAborted {
        sequence: String,
        run_id: RunId,
        beat: u32,
        event: String,
        message: String,
    },

    /// A beat with the `retry` policy kept failing.
    #[error("beat {beat} of sequence '{sequence}' exceeded retry limit after {attempts} attempts: {message}")]
    RetryExhausted {
        sequence: String,
        run_id: RunId,
        beat: u32,
        attempts: u32,
        message: String,
    },

    /// The beat was waiting in the serializer queue when it was cleared.
    #[error("beat {beat} of run {run_id} was discarded from the execution queue")]
    BeatDiscarded {
        run_id: RunId,
        beat: u32,
    },

    /// A submitted run's task ended without reporting a result.
    #[error("run {0} ended without reporting a result")]
    RunDropped(RunId),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl EngineError {
    /// Run the error belongs to, when it is run-scoped.
    pub fn run_id(&self) -> Option<RunId> {
        match self {
            Self::BeatAborted { run_id, .. }
            | Self::RetryExhausted { run_id, .. }
            | Self::BeatDiscarded { run_id, .. } => Some(*run_id),
            Self::RunDropped(run_id) => Some(*run_id),
            _ => None,
        }
    }
}
