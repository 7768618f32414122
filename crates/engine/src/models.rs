//! Core domain models for the conductor.
//!
//! These types are the source of truth for what a sequence looks like in
//! memory.  They serialise to/from the camelCase JSON that plugins register.

use std::sync::Arc;

use bus::Baton;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Identifier issued for every run, assigned before the run is queued.
pub type RunId = Uuid;

// ---------------------------------------------------------------------------
// Beat vocabulary
// ---------------------------------------------------------------------------

/// Six-level intensity tag.  Only used for advisory time estimation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Dynamics {
    #[serde(rename = "pianissimo", alias = "pp")]
    Pianissimo,
    #[serde(rename = "piano", alias = "p")]
    Piano,
    #[serde(rename = "mezzo-piano", alias = "mp")]
    MezzoPiano,
    #[serde(rename = "mezzo-forte", alias = "mf")]
    MezzoForte,
    #[serde(rename = "forte", alias = "f")]
    Forte,
    #[serde(rename = "fortissimo", alias = "ff")]
    Fortissimo,
}

impl Dynamics {
    /// Estimation multiplier: softer is quicker.
    pub fn multiplier(self) -> f64 {
        match self {
            Self::Pianissimo => 0.5,
            Self::Piano => 0.75,
            Self::MezzoPiano => 0.9,
            Self::MezzoForte => 1.0,
            Self::Forte => 1.25,
            Self::Fortissimo => 1.5,
        }
    }
}

/// Scheduling hint for a beat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Timing {
    Immediate,
    AfterBeat,
    Synchronized,
    Delayed,
}

impl Timing {
    pub fn multiplier(self) -> f64 {
        match self {
            Self::Immediate => 0.0,
            Self::Synchronized => 0.5,
            Self::AfterBeat => 1.0,
            Self::Delayed => 1.5,
        }
    }
}

/// What to do when a beat's handler fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorHandling {
    /// Record the failure and carry on with the next beat.
    Continue,
    /// Terminate the run.
    AbortSequence,
    /// Re-emit the beat with back-off, then abort once retries run out.
    Retry,
    /// Any value outside the vocabulary.  Accepted leniently; acts as `Continue`.
    #[serde(other)]
    Unrecognized,
}

/// Run priority tag.  Recorded on the context; the run queue stays FIFO.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    #[default]
    Normal,
    Chained,
}

// ---------------------------------------------------------------------------
// Definition
// ---------------------------------------------------------------------------

/// The atomic unit of execution: publishes one topic on the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Beat {
    pub number: u32,
    /// Topic published for this beat.
    pub event: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dynamics: Option<Dynamics>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timing: Option<Timing>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_handling: Option<ErrorHandling>,
    /// Merged over the baton when the beat's event is published.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl Beat {
    /// Convenience constructor for tests and programmatic definitions.
    pub fn new(number: u32, event: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            number,
            event: event.into(),
            title: title.into(),
            dynamics: None,
            timing: None,
            error_handling: None,
            data: None,
        }
    }

    pub fn with_dynamics(mut self, dynamics: Dynamics) -> Self {
        self.dynamics = Some(dynamics);
        self
    }

    pub fn with_timing(mut self, timing: Timing) -> Self {
        self.timing = Some(timing);
        self
    }

    pub fn with_error_handling(mut self, policy: ErrorHandling) -> Self {
        self.error_handling = Some(policy);
        self
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    /// Effective failure policy; missing means `Continue`.
    pub fn policy(&self) -> ErrorHandling {
        self.error_handling.unwrap_or(ErrorHandling::Continue)
    }
}

/// An ordered phase of a sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Movement {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub beats: Vec<Beat>,
}

impl Movement {
    pub fn new(name: impl Into<String>, beats: Vec<Beat>) -> Self {
        Self {
            name: name.into(),
            description: None,
            beats,
        }
    }
}

/// A complete, registrable sequence definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SequenceDefinition {
    pub name: String,
    pub movements: Vec<Movement>,
    /// Beats per minute, only used for estimation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tempo: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_signature: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

impl SequenceDefinition {
    pub fn new(name: impl Into<String>, movements: Vec<Movement>) -> Self {
        Self {
            name: name.into(),
            movements,
            tempo: None,
            key: None,
            time_signature: None,
            description: None,
            version: None,
        }
    }

    pub fn total_beats(&self) -> usize {
        self.movements.iter().map(|m| m.beats.len()).sum()
    }
}

// ---------------------------------------------------------------------------
// Run state
// ---------------------------------------------------------------------------

/// One failed beat, as recorded on the run's context.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BeatErrorRecord {
    pub beat: u32,
    pub error: String,
    pub timestamp: DateTime<Utc>,
}

/// State owned by a single run and mutated by every beat it executes.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub run_id: RunId,
    pub sequence: Arc<SequenceDefinition>,
    /// The baton.  Beats read and augment it through the bus delivery.
    pub payload: Baton,
    /// Index of the movement being executed.
    pub current_movement: usize,
    /// Index of the beat within the current movement.
    pub current_beat: usize,
    pub completed_beats: Vec<u32>,
    pub errors: Vec<BeatErrorRecord>,
    pub priority: Priority,
    pub started_at: DateTime<Utc>,
}

impl ExecutionContext {
    pub fn new(run_id: RunId, sequence: Arc<SequenceDefinition>, payload: Baton, priority: Priority) -> Self {
        Self {
            run_id,
            sequence,
            payload,
            current_movement: 0,
            current_beat: 0,
            completed_beats: Vec::new(),
            errors: Vec::new(),
            priority,
            started_at: Utc::now(),
        }
    }

    /// Position of the current beat across the whole sequence (0-based).
    pub fn beat_index(&self) -> usize {
        let before: usize = self
            .sequence
            .movements
            .iter()
            .take(self.current_movement)
            .map(|m| m.beats.len())
            .sum();
        before + self.current_beat
    }
}
