//! Lifecycle topics published by the conductor and executor.
//!
//! These strings are an integration contract with subscribers such as
//! telemetry collectors; change them only together with their consumers.

pub const BEAT_STARTED: &str = "beat-started";
pub const BEAT_COMPLETED: &str = "beat-completed";
pub const BEAT_FAILED: &str = "beat-failed";

pub const SEQUENCE_QUEUED: &str = "sequence-queued";
pub const SEQUENCE_STARTED: &str = "sequence-started";
pub const SEQUENCE_COMPLETED: &str = "sequence-completed";
pub const SEQUENCE_ERROR: &str = "sequence-error";

/// Every lifecycle topic, in roughly the order a run emits them.
pub const ALL: [&str; 7] = [
    SEQUENCE_QUEUED,
    SEQUENCE_STARTED,
    BEAT_STARTED,
    BEAT_COMPLETED,
    BEAT_FAILED,
    SEQUENCE_COMPLETED,
    SEQUENCE_ERROR,
];
