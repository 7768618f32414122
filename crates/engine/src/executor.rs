//! Beat execution.
//!
//! `BeatExecutor` runs one beat at a time across the whole process:
//! 1. Joins the FIFO beat gate and waits for its turn.
//! 2. Publishes `beat-started`, then the beat's own topic with the baton
//!    merged over the beat's `data` plus a read-only `_context` object.
//! 3. Diffs the baton around the publish for audit logging.
//! 4. Publishes `beat-completed` or `beat-failed`, applying the beat's
//!    error policy: `continue`, `abort-sequence`, or `retry` with
//!    exponential back-off (falls back to abort once retries run out).

use std::sync::Arc;
use std::time::Duration;

use bus::{Baton, BusError, EventBus};
use chrono::Utc;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

use crate::config::ExecutorConfig;
use crate::gate::{FifoGate, GateDiscarded};
use crate::models::{Beat, BeatErrorRecord, ErrorHandling, ExecutionContext, Movement, RunId, SequenceDefinition};
use crate::topics;
use crate::validator::validate_beat;
use crate::EngineError;

/// Key under which beat events carry their read-only metadata.
pub const CONTEXT_KEY: &str = "_context";

/// Tempo assumed when a sequence has none (or a nonsensical one).
pub const DEFAULT_TEMPO: f64 = 120.0;

// ---------------------------------------------------------------------------
// Reports
// ---------------------------------------------------------------------------

/// A beat waiting in (or holding) the serializer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedBeat {
    pub run_id: RunId,
    pub sequence: String,
    pub beat: u32,
    pub event: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum BeatStatus {
    Completed,
    /// The handler failed and the beat's policy let the run carry on.
    FailedContinued,
}

/// Keys of the baton that changed while a beat's event was being handled.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PayloadDiff {
    pub added: Vec<String>,
    pub modified: Vec<String>,
    pub removed: Vec<String>,
}

impl PayloadDiff {
    pub fn between(before: &Baton, after: &Baton) -> Self {
        let mut diff = Self::default();
        for (key, value) in after {
            match before.get(key) {
                None => diff.added.push(key.clone()),
                Some(previous) if previous != value => diff.modified.push(key.clone()),
                Some(_) => {}
            }
        }
        diff.removed = before
            .keys()
            .filter(|key| !after.contains_key(*key))
            .cloned()
            .collect();
        diff
    }

    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.modified.is_empty() && self.removed.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BeatReport {
    pub beat: u32,
    pub status: BeatStatus,
    /// Times the beat's topic was published.
    pub attempts: u32,
    pub elapsed: Duration,
    pub changes: PayloadDiff,
}

// ---------------------------------------------------------------------------
// BeatExecutor
// ---------------------------------------------------------------------------

pub struct BeatExecutor {
    bus: Arc<dyn EventBus>,
    gate: Arc<FifoGate<QueuedBeat>>,
    config: ExecutorConfig,
}

impl BeatExecutor {
    pub fn new(bus: Arc<dyn EventBus>, config: ExecutorConfig) -> Self {
        Self {
            bus,
            gate: FifoGate::new(),
            config,
        }
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Execute `beat` for the run owning `ctx`.
    ///
    /// Suspends while another beat anywhere in the process is executing.
    ///
    /// # Errors
    /// - [`EngineError::BeatAborted`] when an `abort-sequence` beat fails.
    /// - [`EngineError::RetryExhausted`] when a `retry` beat keeps failing.
    /// - [`EngineError::BeatDiscarded`] when the queue was cleared first.
    #[instrument(skip_all, fields(sequence = %ctx.sequence.name, run_id = %ctx.run_id, beat = beat.number))]
    pub async fn execute_beat(
        &self,
        beat: &Beat,
        ctx: &mut ExecutionContext,
        movement: &Movement,
    ) -> Result<BeatReport, EngineError> {
        let entry = self.gate.enter(QueuedBeat {
            run_id: ctx.run_id,
            sequence: ctx.sequence.name.clone(),
            beat: beat.number,
            event: beat.event.clone(),
        });
        if !entry.is_immediate() {
            debug!(waiting = self.gate.pending_len(), "beat queued behind another beat");
        }
        let _permit = entry.acquired().await.map_err(|GateDiscarded| EngineError::BeatDiscarded {
            run_id: ctx.run_id,
            beat: beat.number,
        })?;

        let started = Instant::now();
        self.publish_lifecycle(
            topics::BEAT_STARTED,
            json!({
                "sequence": ctx.sequence.name,
                "movement": movement.name,
                "beat": beat.number,
                "event": beat.event,
                "title": beat.title,
                "runId": ctx.run_id,
            }),
        );

        if !validate_beat(beat) {
            return self.fail(beat, ctx, movement, started, 0, "beat failed runtime validation".into());
        }

        let mut attempts = 0u32;
        loop {
            attempts += 1;
            match self.perform(beat, ctx, movement) {
                Ok(changes) => {
                    let elapsed = started.elapsed();
                    ctx.completed_beats.push(beat.number);
                    self.publish_lifecycle(
                        topics::BEAT_COMPLETED,
                        json!({
                            "sequence": ctx.sequence.name,
                            "movement": movement.name,
                            "beat": beat.number,
                            "event": beat.event,
                            "runId": ctx.run_id,
                            "elapsedMs": elapsed.as_secs_f64() * 1000.0,
                            "attempts": attempts,
                        }),
                    );
                    info!(event = %beat.event, ?elapsed, "beat completed");
                    return Ok(BeatReport {
                        beat: beat.number,
                        status: BeatStatus::Completed,
                        attempts,
                        elapsed,
                        changes,
                    });
                }

                Err(err) if beat.policy() == ErrorHandling::Retry && attempts <= self.config.max_retries => {
                    let delay = self.config.backoff(attempts);
                    warn!(
                        "beat {} failed (attempt {}/{}), retrying in {:?}: {}",
                        beat.number,
                        attempts,
                        self.config.max_retries + 1,
                        delay,
                        err
                    );
                    tokio::time::sleep(delay).await;
                }

                Err(err) => {
                    return self.fail(beat, ctx, movement, started, attempts, err.message().to_owned());
                }
            }
        }
    }

    /// Discard every beat waiting for its turn.  The beat currently
    /// executing is unaffected.  Returns how many were discarded.
    pub fn clear_queue(&self) -> usize {
        let discarded = self.gate.clear();
        if !discarded.is_empty() {
            warn!(count = discarded.len(), "cleared beat queue");
        }
        discarded.len()
    }

    pub fn is_busy(&self) -> bool {
        self.gate.is_busy()
    }

    pub fn current_beat(&self) -> Option<QueuedBeat> {
        self.gate.holder()
    }

    pub fn queued_beats(&self) -> Vec<QueuedBeat> {
        self.gate.pending()
    }

    // -----------------------------------------------------------------------
    // Internal
    // -----------------------------------------------------------------------

    /// Publish the beat's topic once and diff the baton around it.
    fn perform(&self, beat: &Beat, ctx: &mut ExecutionContext, movement: &Movement) -> Result<PayloadDiff, BusError> {
        let payload = event_payload(beat, ctx, movement);
        let before = ctx.payload.clone();
        let outcome = self.bus.emit(&beat.event, &payload, Some(&mut ctx.payload));
        let changes = PayloadDiff::between(&before, &ctx.payload);
        log_changes(beat.number, &changes);
        outcome.map(|()| changes)
    }

    fn fail(
        &self,
        beat: &Beat,
        ctx: &mut ExecutionContext,
        movement: &Movement,
        started: Instant,
        attempts: u32,
        message: String,
    ) -> Result<BeatReport, EngineError> {
        let elapsed = started.elapsed();
        ctx.errors.push(BeatErrorRecord {
            beat: beat.number,
            error: message.clone(),
            timestamp: Utc::now(),
        });

        let policy = beat.policy();
        error!(event = %beat.event, ?policy, "beat failed: {message}");
        self.publish_lifecycle(
            topics::BEAT_FAILED,
            json!({
                "sequence": ctx.sequence.name,
                "movement": movement.name,
                "beat": beat.number,
                "event": beat.event,
                "runId": ctx.run_id,
                "error": message,
                "errorHandling": policy,
                "attempts": attempts,
            }),
        );

        match policy {
            ErrorHandling::AbortSequence => Err(EngineError::BeatAborted {
                sequence: ctx.sequence.name.clone(),
                run_id: ctx.run_id,
                beat: beat.number,
                event: beat.event.clone(),
                message,
            }),
            ErrorHandling::Retry => Err(EngineError::RetryExhausted {
                sequence: ctx.sequence.name.clone(),
                run_id: ctx.run_id,
                beat: beat.number,
                attempts,
                message,
            }),
            ErrorHandling::Continue | ErrorHandling::Unrecognized => Ok(BeatReport {
                beat: beat.number,
                status: BeatStatus::FailedContinued,
                attempts,
                elapsed,
                changes: PayloadDiff::default(),
            }),
        }
    }

    fn publish_lifecycle(&self, topic: &str, payload: Value) {
        if let Err(err) = self.bus.emit(topic, &payload, None) {
            warn!(topic, %err, "lifecycle subscriber failed; ignoring");
        }
    }
}

/// Baton shallow-merged with the beat's data (beat data wins), plus `_context`.
fn event_payload(beat: &Beat, ctx: &ExecutionContext, movement: &Movement) -> Value {
    let mut merged = ctx.payload.clone();
    match &beat.data {
        Some(Value::Object(data)) => {
            for (key, value) in data {
                merged.insert(key.clone(), value.clone());
            }
        }
        Some(Value::Null) | None => {}
        Some(other) => {
            merged.insert("data".into(), other.clone());
        }
    }

    let sequence = &ctx.sequence;
    merged.insert(
        CONTEXT_KEY.into(),
        json!({
            "sequence": {
                "name": sequence.name,
                "tempo": sequence.tempo,
                "key": sequence.key,
                "timeSignature": sequence.time_signature,
            },
            "movement": {
                "name": movement.name,
                "description": movement.description,
            },
            "beat": {
                "number": beat.number,
                "title": beat.title,
                "dynamics": beat.dynamics,
                "timing": beat.timing,
            },
            "execution": {
                "runId": ctx.run_id,
                "priority": ctx.priority,
                "beatIndex": ctx.beat_index(),
                "totalBeats": sequence.total_beats(),
                "completedBeats": ctx.completed_beats.len(),
            },
        }),
    );
    Value::Object(merged)
}

/// Best-effort audit trail; never affects the beat.
fn log_changes(beat: u32, changes: &PayloadDiff) {
    if changes.is_empty() {
        return;
    }
    match serde_json::to_string(changes) {
        Ok(diff) => debug!(beat, %diff, "baton changed"),
        Err(err) => debug!(beat, %err, "could not render baton diff"),
    }
}

// ---------------------------------------------------------------------------
// Estimation
// ---------------------------------------------------------------------------

/// Advisory duration for one beat: one beat at `base_tempo` BPM, scaled by
/// its dynamics and timing.  Not an enforced deadline.  Saturates at
/// `Duration::MAX` for tempos too slow to represent.
pub fn estimate_beat_execution_time(beat: &Beat, base_tempo: f64) -> Duration {
    let tempo = if base_tempo.is_finite() && base_tempo > 0.0 {
        base_tempo
    } else {
        DEFAULT_TEMPO
    };
    let base_ms = 60_000.0 / tempo;
    let dynamics = beat.dynamics.map_or(1.0, |d| d.multiplier());
    let timing = beat.timing.map_or(1.0, |t| t.multiplier());
    Duration::try_from_secs_f64(base_ms * dynamics * timing / 1000.0).unwrap_or(Duration::MAX)
}

/// Sum of the per-beat estimates at the sequence's own tempo.
pub fn estimate_sequence_execution_time(sequence: &SequenceDefinition) -> Duration {
    let tempo = sequence.tempo.unwrap_or(DEFAULT_TEMPO);
    sequence
        .movements
        .iter()
        .flat_map(|m| &m.beats)
        .map(|beat| estimate_beat_execution_time(beat, tempo))
        .fold(Duration::ZERO, Duration::saturating_add)
}

// ============================================================
// Unit tests
// ============================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Dynamics, Priority, Timing};
    use bus::mock::{EventLog, MockHandler};
    use bus::InMemoryBus;
    use uuid::Uuid;

    fn context_for(sequence: SequenceDefinition, payload: Value) -> ExecutionContext {
        let baton = payload.as_object().cloned().unwrap_or_default();
        ExecutionContext::new(Uuid::new_v4(), Arc::new(sequence), baton, Priority::Normal)
    }

    fn single_beat_sequence(beat: Beat) -> (SequenceDefinition, Movement) {
        let movement = Movement::new("main", vec![beat]);
        (SequenceDefinition::new("exec", vec![movement.clone()]), movement)
    }

    #[tokio::test]
    async fn beat_event_carries_merged_payload_and_context() {
        let bus = InMemoryBus::shared();
        let mock = MockHandler::writing("rendered", json!(true));
        let _sub = mock.attach(bus.as_ref(), "canvas.render");

        let beat = Beat::new(1, "canvas.render", "Render")
            .with_dynamics(Dynamics::Forte)
            .with_data(json!({ "color": "red", "size": 3 }));
        let (sequence, movement) = single_beat_sequence(beat.clone());
        let mut ctx = context_for(sequence, json!({ "color": "blue", "id": "c1" }));

        let executor = BeatExecutor::new(bus.clone(), ExecutorConfig::default());
        let report = executor.execute_beat(&beat, &mut ctx, &movement).await.unwrap();

        assert_eq!(report.status, BeatStatus::Completed);
        assert_eq!(report.changes.added, vec!["rendered"]);
        assert_eq!(ctx.completed_beats, vec![1]);
        assert_eq!(ctx.payload["rendered"], json!(true));
        // Beat data is merged into the event, not into the baton.
        assert_eq!(ctx.payload["color"], json!("blue"));

        let payload = &mock.payloads()[0];
        assert_eq!(payload["color"], json!("red"));
        assert_eq!(payload["id"], json!("c1"));
        assert_eq!(payload[CONTEXT_KEY]["beat"]["dynamics"], json!("forte"));
        assert_eq!(payload[CONTEXT_KEY]["execution"]["totalBeats"], json!(1));
    }

    #[tokio::test]
    async fn lifecycle_events_bracket_the_beat_topic() {
        let bus = InMemoryBus::shared();
        let log = EventLog::new();
        let _subs = log.attach(bus.as_ref(), &[topics::BEAT_STARTED, "a.b", topics::BEAT_COMPLETED]);

        let beat = Beat::new(1, "a.b", "t");
        let (sequence, movement) = single_beat_sequence(beat.clone());
        let mut ctx = context_for(sequence, json!({}));

        BeatExecutor::new(bus.clone(), ExecutorConfig::default())
            .execute_beat(&beat, &mut ctx, &movement)
            .await
            .unwrap();

        assert_eq!(log.topics(), vec![topics::BEAT_STARTED, "a.b", topics::BEAT_COMPLETED]);
    }

    #[tokio::test]
    async fn continue_policy_records_error_and_returns_ok() {
        let bus = InMemoryBus::shared();
        let _sub = MockHandler::failing("nope").attach(bus.as_ref(), "a.b");
        let failed = MockHandler::succeeding();
        let _failed_sub = failed.attach(bus.as_ref(), topics::BEAT_FAILED);

        let beat = Beat::new(4, "a.b", "t").with_error_handling(ErrorHandling::Continue);
        let (sequence, movement) = single_beat_sequence(beat.clone());
        let mut ctx = context_for(sequence, json!({}));

        let report = BeatExecutor::new(bus.clone(), ExecutorConfig::default())
            .execute_beat(&beat, &mut ctx, &movement)
            .await
            .unwrap();

        assert_eq!(report.status, BeatStatus::FailedContinued);
        assert_eq!(ctx.errors.len(), 1);
        assert_eq!(ctx.errors[0].beat, 4);
        assert_eq!(ctx.errors[0].error, "nope");
        assert!(ctx.completed_beats.is_empty());
        assert_eq!(failed.call_count(), 1);
    }

    #[tokio::test]
    async fn abort_policy_propagates() {
        let bus = InMemoryBus::shared();
        let _sub = MockHandler::failing("fatal").attach(bus.as_ref(), "a.b");

        let beat = Beat::new(2, "a.b", "t").with_error_handling(ErrorHandling::AbortSequence);
        let (sequence, movement) = single_beat_sequence(beat.clone());
        let mut ctx = context_for(sequence, json!({}));

        let err = BeatExecutor::new(bus.clone(), ExecutorConfig::default())
            .execute_beat(&beat, &mut ctx, &movement)
            .await
            .unwrap_err();

        assert!(matches!(err, EngineError::BeatAborted { beat: 2, .. }));
        assert_eq!(ctx.errors.len(), 1);
    }

    // The retry policy is bounded: `max_retries` extra publishes, then abort.
    #[tokio::test(start_paused = true)]
    async fn retry_policy_recovers_within_budget() {
        let bus = InMemoryBus::shared();
        let flaky = MockHandler::failing_times(2, "transient");
        let _sub = flaky.attach(bus.as_ref(), "a.b");

        let beat = Beat::new(1, "a.b", "t").with_error_handling(ErrorHandling::Retry);
        let (sequence, movement) = single_beat_sequence(beat.clone());
        let mut ctx = context_for(sequence, json!({}));

        let report = BeatExecutor::new(bus.clone(), ExecutorConfig::default())
            .execute_beat(&beat, &mut ctx, &movement)
            .await
            .unwrap();

        assert_eq!(report.status, BeatStatus::Completed);
        assert_eq!(report.attempts, 3);
        assert_eq!(flaky.call_count(), 3);
        assert!(ctx.errors.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn retry_policy_aborts_when_exhausted() {
        let bus = InMemoryBus::shared();
        let broken = MockHandler::failing("still broken");
        let _sub = broken.attach(bus.as_ref(), "a.b");

        let beat = Beat::new(1, "a.b", "t").with_error_handling(ErrorHandling::Retry);
        let (sequence, movement) = single_beat_sequence(beat.clone());
        let mut ctx = context_for(sequence, json!({}));

        let config = ExecutorConfig {
            max_retries: 2,
            ..ExecutorConfig::default()
        };
        let err = BeatExecutor::new(bus.clone(), config)
            .execute_beat(&beat, &mut ctx, &movement)
            .await
            .unwrap_err();

        assert!(matches!(err, EngineError::RetryExhausted { attempts: 3, .. }));
        assert_eq!(broken.call_count(), 3);
        assert_eq!(ctx.errors.len(), 1);
    }

    #[tokio::test]
    async fn invalid_beat_never_publishes_its_topic() {
        let bus = InMemoryBus::shared();
        let handler = MockHandler::succeeding();
        let _sub = handler.attach(bus.as_ref(), "a.b");

        let beat = Beat::new(1, "a.b", "  ");
        let (sequence, movement) = single_beat_sequence(beat.clone());
        let mut ctx = context_for(sequence, json!({}));

        let report = BeatExecutor::new(bus.clone(), ExecutorConfig::default())
            .execute_beat(&beat, &mut ctx, &movement)
            .await
            .unwrap();

        assert_eq!(report.status, BeatStatus::FailedContinued);
        assert_eq!(handler.call_count(), 0);
    }

    #[tokio::test]
    async fn failing_lifecycle_subscriber_does_not_fail_the_beat() {
        let bus = InMemoryBus::shared();
        let _sub = MockHandler::failing("telemetry down").attach(bus.as_ref(), topics::BEAT_STARTED);

        let beat = Beat::new(1, "a.b", "t").with_error_handling(ErrorHandling::AbortSequence);
        let (sequence, movement) = single_beat_sequence(beat.clone());
        let mut ctx = context_for(sequence, json!({}));

        let report = BeatExecutor::new(bus.clone(), ExecutorConfig::default())
            .execute_beat(&beat, &mut ctx, &movement)
            .await
            .unwrap();
        assert_eq!(report.status, BeatStatus::Completed);
    }

    #[test]
    fn payload_diff_classifies_keys() {
        let before: Baton = json!({ "keep": 1, "change": 1, "drop": 1 }).as_object().cloned().unwrap();
        let after: Baton = json!({ "keep": 1, "change": 2, "new": 1 }).as_object().cloned().unwrap();
        let diff = PayloadDiff::between(&before, &after);
        assert_eq!(diff.added, vec!["new"]);
        assert_eq!(diff.modified, vec!["change"]);
        assert_eq!(diff.removed, vec!["drop"]);
    }

    #[test]
    fn estimates_scale_with_dynamics_and_timing() {
        let at = |beat: Beat| estimate_beat_execution_time(&beat, 120.0);

        // 120 BPM → 500 ms per beat.
        assert_eq!(at(Beat::new(1, "a.b", "t")), Duration::from_millis(500));
        assert_eq!(
            at(Beat::new(1, "a.b", "t").with_dynamics(Dynamics::Fortissimo).with_timing(Timing::AfterBeat)),
            Duration::from_millis(750)
        );
        assert_eq!(
            at(Beat::new(1, "a.b", "t").with_dynamics(Dynamics::Pianissimo).with_timing(Timing::Synchronized)),
            Duration::from_millis(125)
        );
        assert_eq!(at(Beat::new(1, "a.b", "t").with_timing(Timing::Immediate)), Duration::ZERO);

        let soft = at(Beat::new(1, "a.b", "t").with_dynamics(Dynamics::Piano));
        let loud = at(Beat::new(1, "a.b", "t").with_dynamics(Dynamics::Forte));
        assert!(soft < loud);

        // Nonsense tempo falls back to the default.
        assert_eq!(
            estimate_beat_execution_time(&Beat::new(1, "a.b", "t"), -3.0),
            Duration::from_millis(500)
        );
    }

    #[test]
    fn sequence_estimate_sums_beats() {
        let mut sequence = SequenceDefinition::new(
            "s",
            vec![Movement::new(
                "m",
                vec![
                    Beat::new(1, "a.b", "t").with_timing(Timing::Delayed),
                    Beat::new(2, "a.b", "t"),
                ],
            )],
        );
        sequence.tempo = Some(60.0);
        assert_eq!(estimate_sequence_execution_time(&sequence), Duration::from_millis(2500));
    }

    #[test]
    fn glacial_tempo_saturates_instead_of_panicking() {
        let beat = Beat::new(1, "a.b", "t").with_dynamics(Dynamics::Fortissimo);
        assert_eq!(estimate_beat_execution_time(&beat, 1e-300), Duration::MAX);

        let mut sequence = SequenceDefinition::new(
            "slow",
            vec![Movement::new("m", vec![beat.clone(), Beat::new(2, "a.b", "t")])],
        );
        sequence.tempo = Some(1e-300);
        assert_eq!(estimate_sequence_execution_time(&sequence), Duration::MAX);

        // Immediate beats stay at zero even at an extreme tempo.
        let immediate = Beat::new(3, "a.b", "t").with_timing(Timing::Immediate);
        assert_eq!(estimate_beat_execution_time(&immediate, 1e-300), Duration::ZERO);
    }
}
