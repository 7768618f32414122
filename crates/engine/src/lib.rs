//! `engine` crate — sequence models, structural validation, beat execution,
//! performance tracking and the conductor that ties them together.

pub mod models;
pub mod error;
pub mod config;
pub mod topics;
pub mod validator;
pub mod performance;
pub mod gate;
pub mod executor;
pub mod conductor;

pub use models::{
    Beat, BeatErrorRecord, Dynamics, ErrorHandling, ExecutionContext, Movement, Priority, RunId,
    SequenceDefinition, Timing,
};
pub use error::EngineError;
pub use config::{ConductorConfig, ExecutorConfig, PerformanceConfig};
pub use validator::{validate_beat, validate_sequence, HandlerBinding, HandlerSet, ValidationReport};
pub use performance::PerformanceTracker;
pub use executor::{estimate_beat_execution_time, estimate_sequence_execution_time, BeatExecutor, BeatReport, BeatStatus};
pub use conductor::{get_instance, reset_instance, Conductor, DebugInfo, QueueStatus, RunHandle, Statistics};

#[cfg(test)]
mod conductor_tests;
