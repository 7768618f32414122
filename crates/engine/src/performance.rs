//! Timing registry for beats, movements and whole runs.
//!
//! Timers are keyed by composite strings and paired `start_*` / `end_*`
//! calls.  Completed records land in bounded histories: once a list exceeds
//! the configured cap its oldest half is dropped.  Instrumentation problems
//! (an `end_*` with no matching `start_*`) are logged, never raised.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::PerformanceConfig;
use crate::models::RunId;

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BeatTiming {
    pub sequence: String,
    pub beat: u32,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub duration: Duration,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MovementTiming {
    pub sequence: String,
    pub movement: String,
    pub run_id: RunId,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub duration: Duration,
    pub beat_count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SequenceTiming {
    pub sequence: String,
    pub run_id: RunId,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub duration: Duration,
}

/// Aggregate beat durations for one sequence over the retained history.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BeatStatistics {
    pub count: usize,
    pub average: Duration,
    pub min: Duration,
    pub max: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TimerKind {
    Beat,
    Movement,
    Sequence,
}

impl fmt::Display for TimerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Beat => "beat",
            Self::Movement => "movement",
            Self::Sequence => "sequence",
        })
    }
}

/// An unfinished timer and how long it has been running.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActiveTimer {
    pub kind: TimerKind,
    pub key: String,
    pub sequence: String,
    pub started_at: DateTime<Utc>,
    pub elapsed: Duration,
}

/// An active timer that has outlived its advisory threshold.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PerformanceWarning {
    pub kind: TimerKind,
    pub key: String,
    pub elapsed: Duration,
    pub threshold: Duration,
}

impl fmt::Display for PerformanceWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} '{}' active for {:?} (threshold {:?})",
            self.kind, self.key, self.elapsed, self.threshold
        )
    }
}

// ---------------------------------------------------------------------------
// Tracker
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct ActiveEntry {
    sequence: String,
    started: Instant,
    started_at: DateTime<Utc>,
}

impl ActiveEntry {
    fn now(sequence: &str) -> Self {
        Self {
            sequence: sequence.to_owned(),
            started: Instant::now(),
            started_at: Utc::now(),
        }
    }
}

/// Stateful timer registry.  Not internally synchronised; the conductor
/// keeps it behind a mutex.
#[derive(Debug)]
pub struct PerformanceTracker {
    config: PerformanceConfig,
    beats: HashMap<String, ActiveEntry>,
    movements: HashMap<String, ActiveEntry>,
    sequences: HashMap<String, ActiveEntry>,
    beat_history: Vec<BeatTiming>,
    movement_history: Vec<MovementTiming>,
    sequence_history: Vec<SequenceTiming>,
}

impl Default for PerformanceTracker {
    fn default() -> Self {
        Self::new(PerformanceConfig::default())
    }
}

pub fn beat_key(sequence: &str, beat: u32) -> String {
    format!("{sequence}:{beat}")
}

pub fn movement_key(sequence: &str, movement: &str, run_id: RunId) -> String {
    format!("{sequence}:{movement}:{run_id}")
}

pub fn sequence_key(sequence: &str, run_id: RunId) -> String {
    format!("{sequence}:{run_id}")
}

impl PerformanceTracker {
    pub fn new(config: PerformanceConfig) -> Self {
        Self {
            config,
            beats: HashMap::new(),
            movements: HashMap::new(),
            sequences: HashMap::new(),
            beat_history: Vec::new(),
            movement_history: Vec::new(),
            sequence_history: Vec::new(),
        }
    }

    pub fn config(&self) -> &PerformanceConfig {
        &self.config
    }

    // ------ beats ------

    pub fn start_beat_timing(&mut self, sequence: &str, beat: u32) {
        let key = beat_key(sequence, beat);
        debug!(%key, "beat timer started");
        self.beats.insert(key, ActiveEntry::now(sequence));
    }

    pub fn end_beat_timing(&mut self, sequence: &str, beat: u32) -> Option<BeatTiming> {
        let key = beat_key(sequence, beat);
        let Some(entry) = self.beats.remove(&key) else {
            warn!(%key, "end_beat_timing without a matching start");
            return None;
        };

        let timing = BeatTiming {
            sequence: sequence.to_owned(),
            beat,
            started_at: entry.started_at,
            ended_at: Utc::now(),
            duration: entry.started.elapsed(),
        };
        push_bounded(&mut self.beat_history, timing.clone(), self.config.history_cap);
        Some(timing)
    }

    /// Drop an in-flight beat timer without recording it.
    pub fn cleanup_failed_beat(&mut self, sequence: &str, beat: u32) -> bool {
        self.beats.remove(&beat_key(sequence, beat)).is_some()
    }

    // ------ movements ------

    pub fn start_movement_timing(&mut self, sequence: &str, movement: &str, run_id: RunId) {
        let key = movement_key(sequence, movement, run_id);
        debug!(%key, "movement timer started");
        self.movements.insert(key, ActiveEntry::now(sequence));
    }

    pub fn end_movement_timing(
        &mut self,
        sequence: &str,
        movement: &str,
        run_id: RunId,
        beat_count: usize,
    ) -> Option<MovementTiming> {
        let key = movement_key(sequence, movement, run_id);
        let Some(entry) = self.movements.remove(&key) else {
            warn!(%key, "end_movement_timing without a matching start");
            return None;
        };

        let timing = MovementTiming {
            sequence: sequence.to_owned(),
            movement: movement.to_owned(),
            run_id,
            started_at: entry.started_at,
            ended_at: Utc::now(),
            duration: entry.started.elapsed(),
            beat_count,
        };
        push_bounded(&mut self.movement_history, timing.clone(), self.config.history_cap);
        Some(timing)
    }

    pub fn cleanup_failed_movement(&mut self, sequence: &str, movement: &str, run_id: RunId) -> bool {
        self.movements
            .remove(&movement_key(sequence, movement, run_id))
            .is_some()
    }

    // ------ whole runs ------

    pub fn start_sequence_timing(&mut self, sequence: &str, run_id: RunId) {
        let key = sequence_key(sequence, run_id);
        debug!(%key, "sequence timer started");
        self.sequences.insert(key, ActiveEntry::now(sequence));
    }

    pub fn end_sequence_timing(&mut self, sequence: &str, run_id: RunId) -> Option<SequenceTiming> {
        let key = sequence_key(sequence, run_id);
        let Some(entry) = self.sequences.remove(&key) else {
            warn!(%key, "end_sequence_timing without a matching start");
            return None;
        };

        let timing = SequenceTiming {
            sequence: sequence.to_owned(),
            run_id,
            started_at: entry.started_at,
            ended_at: Utc::now(),
            duration: entry.started.elapsed(),
        };
        push_bounded(&mut self.sequence_history, timing.clone(), self.config.history_cap);
        Some(timing)
    }

    pub fn cleanup_failed_sequence(&mut self, sequence: &str, run_id: RunId) -> bool {
        self.sequences.remove(&sequence_key(sequence, run_id)).is_some()
    }

    // ------ queries ------

    pub fn beat_statistics(&self, sequence: &str) -> Option<BeatStatistics> {
        let durations: Vec<Duration> = self
            .beat_history
            .iter()
            .filter(|t| t.sequence == sequence)
            .map(|t| t.duration)
            .collect();
        summarize(&durations)
    }

    /// Beat statistics for every sequence present in the history.
    pub fn all_beat_statistics(&self) -> BTreeMap<String, BeatStatistics> {
        let mut grouped: BTreeMap<&str, Vec<Duration>> = BTreeMap::new();
        for timing in &self.beat_history {
            grouped.entry(timing.sequence.as_str()).or_default().push(timing.duration);
        }
        grouped
            .into_iter()
            .filter_map(|(sequence, durations)| summarize(&durations).map(|s| (sequence.to_owned(), s)))
            .collect()
    }

    pub fn beat_timings(&self) -> &[BeatTiming] {
        &self.beat_history
    }

    pub fn movement_timings(&self, sequence: Option<&str>) -> Vec<MovementTiming> {
        self.movement_history
            .iter()
            .filter(|t| sequence.map_or(true, |s| t.sequence == s))
            .cloned()
            .collect()
    }

    pub fn sequence_timings(&self, sequence: Option<&str>) -> Vec<SequenceTiming> {
        self.sequence_history
            .iter()
            .filter(|t| sequence.map_or(true, |s| t.sequence == s))
            .cloned()
            .collect()
    }

    pub fn completed_beat_count(&self) -> usize {
        self.beat_history.len()
    }

    pub fn active_timer_count(&self) -> usize {
        self.beats.len() + self.movements.len() + self.sequences.len()
    }

    /// Snapshot of every unfinished timer, longest-running first.
    pub fn active_timers(&self) -> Vec<ActiveTimer> {
        let groups = [
            (TimerKind::Beat, &self.beats),
            (TimerKind::Movement, &self.movements),
            (TimerKind::Sequence, &self.sequences),
        ];

        let mut timers: Vec<ActiveTimer> = groups
            .into_iter()
            .flat_map(|(kind, entries)| {
                entries.iter().map(move |(key, entry)| ActiveTimer {
                    kind,
                    key: key.clone(),
                    sequence: entry.sequence.clone(),
                    started_at: entry.started_at,
                    elapsed: entry.started.elapsed(),
                })
            })
            .collect();
        timers.sort_by(|a, b| b.elapsed.cmp(&a.elapsed).then_with(|| a.key.cmp(&b.key)));
        timers
    }

    /// Beats and runs that have been active longer than their thresholds.
    pub fn performance_warnings(&self) -> Vec<PerformanceWarning> {
        self.active_timers()
            .into_iter()
            .filter_map(|timer| {
                let threshold = match timer.kind {
                    TimerKind::Beat => self.config.beat_warning_threshold,
                    TimerKind::Sequence => self.config.sequence_warning_threshold,
                    TimerKind::Movement => return None,
                };
                (timer.elapsed > threshold).then(|| PerformanceWarning {
                    kind: timer.kind,
                    key: timer.key,
                    elapsed: timer.elapsed,
                    threshold,
                })
            })
            .collect()
    }

    /// Forget everything, active and completed.
    pub fn clear(&mut self) {
        self.beats.clear();
        self.movements.clear();
        self.sequences.clear();
        self.beat_history.clear();
        self.movement_history.clear();
        self.sequence_history.clear();
    }
}

fn push_bounded<T>(history: &mut Vec<T>, item: T, cap: usize) {
    history.push(item);
    if history.len() > cap {
        let overflow = history.len() / 2;
        history.drain(..overflow);
    }
}

fn summarize(durations: &[Duration]) -> Option<BeatStatistics> {
    let min = durations.iter().min().copied()?;
    let max = durations.iter().max().copied()?;
    let total: Duration = durations.iter().sum();
    let count = durations.len();
    Some(BeatStatistics {
        count,
        average: total / u32::try_from(count).unwrap_or(u32::MAX),
        min,
        max,
    })
}
