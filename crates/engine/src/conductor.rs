//! The conductor — registry, run queue and aggregate statistics.
//!
//! `Conductor` is the entry point plugins talk to:
//! 1. Validates and registers sequence definitions (name-keyed, last wins).
//! 2. Issues a run id per request and admits runs one at a time through a
//!    FIFO run queue.
//! 3. Walks each run's movements and beats in declared order, delegating
//!    every beat to the [`BeatExecutor`].
//! 4. Times beats, movements and runs, and keeps success/failure counters.
//!
//! Construct one with [`Conductor::new`] and share the `Arc`.  For hosts that
//! want a process-wide instance, [`get_instance`] / [`reset_instance`] keep
//! one in an explicit, resettable slot.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use bus::{Baton, EventBus, Subscription};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::config::ConductorConfig;
use crate::executor::{BeatExecutor, BeatStatus};
use crate::gate::{FifoGate, GateDiscarded, GateEntry};
use crate::models::{ExecutionContext, Priority, RunId, SequenceDefinition};
use crate::performance::{BeatStatistics, PerformanceTracker, PerformanceWarning};
use crate::topics;
use crate::validator::{validate_sequence, HandlerBinding, HandlerSet, ValidationReport};
use crate::EngineError;

// ---------------------------------------------------------------------------
// Snapshots
// ---------------------------------------------------------------------------

/// A run holding or waiting for the run queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedRun {
    pub run_id: RunId,
    pub sequence: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStatus {
    pub pending: usize,
    pub executing: usize,
    pub completed: u64,
    pub executing_run: Option<QueuedRun>,
    pub pending_runs: Vec<QueuedRun>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Statistics {
    pub total_sequences_executed: u64,
    pub successful: u64,
    pub failed: u64,
    pub average_execution_time_ms: f64,
    /// Fraction of finished runs that succeeded, `1.0` before any run.
    pub success_rate: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DebugInfo {
    pub active_timers: usize,
    pub completed_beats: usize,
    pub beat_statistics: BTreeMap<String, BeatStatistics>,
    pub warnings: Vec<PerformanceWarning>,
    pub queue: QueueStatus,
    pub registered_sequences: usize,
}

/// A run accepted by [`Conductor::submit`].
pub struct RunHandle {
    run_id: RunId,
    done: oneshot::Receiver<Result<RunId, EngineError>>,
}

impl RunHandle {
    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    /// Wait for the run to finish.
    pub async fn wait(self) -> Result<RunId, EngineError> {
        let run_id = self.run_id;
        self.done
            .await
            .unwrap_or(Err(EngineError::RunDropped(run_id)))
    }
}

// ---------------------------------------------------------------------------
// Internal state
// ---------------------------------------------------------------------------

struct RegisteredSequence {
    definition: Arc<SequenceDefinition>,
    /// Handlers subscribed on behalf of the registering plugin.
    subscriptions: Vec<Subscription>,
}

impl RegisteredSequence {
    fn retire(self) {
        for subscription in self.subscriptions {
            subscription.unsubscribe();
        }
    }
}

#[derive(Debug, Default)]
struct RunCounters {
    successful: u64,
    failed: u64,
    total_time: Duration,
}

impl RunCounters {
    fn record(&mut self, succeeded: bool, elapsed: Duration) {
        if succeeded {
            self.successful += 1;
        } else {
            self.failed += 1;
        }
        self.total_time += elapsed;
    }

    fn finished(&self) -> u64 {
        self.successful + self.failed
    }
}

// ---------------------------------------------------------------------------
// Conductor
// ---------------------------------------------------------------------------

pub struct Conductor {
    bus: Arc<dyn EventBus>,
    executor: BeatExecutor,
    registry: RwLock<BTreeMap<String, RegisteredSequence>>,
    runs: Arc<FifoGate<QueuedRun>>,
    tracker: Mutex<PerformanceTracker>,
    counters: Mutex<RunCounters>,
}

impl Conductor {
    pub fn new(bus: Arc<dyn EventBus>, config: ConductorConfig) -> Arc<Self> {
        Arc::new(Self {
            executor: BeatExecutor::new(Arc::clone(&bus), config.executor),
            bus,
            registry: RwLock::new(BTreeMap::new()),
            runs: FifoGate::new(),
            tracker: Mutex::new(PerformanceTracker::new(config.performance)),
            counters: Mutex::new(RunCounters::default()),
        })
    }

    pub fn with_defaults(bus: Arc<dyn EventBus>) -> Arc<Self> {
        Self::new(bus, ConductorConfig::default())
    }

    pub fn bus(&self) -> &Arc<dyn EventBus> {
        &self.bus
    }

    pub fn executor(&self) -> &BeatExecutor {
        &self.executor
    }

    // -----------------------------------------------------------------------
    // Registration
    // -----------------------------------------------------------------------

    /// Validate and register a raw definition.  Re-registering a name
    /// replaces the previous definition.
    ///
    /// # Errors
    /// [`EngineError::Registration`] if validation reports any error; nothing
    /// is registered in that case.
    pub fn register_sequence(&self, definition: Value) -> Result<ValidationReport, EngineError> {
        self.register(definition, None)
    }

    /// Typed variant of [`Conductor::register_sequence`].
    pub fn register_definition(&self, definition: &SequenceDefinition) -> Result<ValidationReport, EngineError> {
        self.register(serde_json::to_value(definition)?, None)
    }

    /// Register a definition together with the plugin's handlers.  Every
    /// callable handler is subscribed to the bus topic named by its key and
    /// stays subscribed until the sequence is replaced or unregistered.
    pub fn register_with_handlers(
        &self,
        definition: Value,
        handlers: HandlerSet,
    ) -> Result<ValidationReport, EngineError> {
        self.register(definition, Some(handlers))
    }

    fn register(&self, raw: Value, handlers: Option<HandlerSet>) -> Result<ValidationReport, EngineError> {
        let name = raw
            .get("name")
            .and_then(Value::as_str)
            .unwrap_or("<unnamed>")
            .to_owned();

        let report = validate_sequence(&raw, handlers.as_ref());
        if !report.is_valid {
            warn!(sequence = %name, errors = ?report.errors, "sequence rejected");
            return Err(EngineError::Registration {
                name,
                errors: report.errors,
            });
        }
        for warning in &report.warnings {
            debug!(sequence = %name, "validation warning: {warning}");
        }

        let definition: SequenceDefinition =
            serde_json::from_value(raw).map_err(|err| EngineError::Registration {
                name: name.clone(),
                errors: vec![err.to_string()],
            })?;

        let subscriptions = handlers
            .into_iter()
            .flatten()
            .filter_map(|(topic, binding)| match binding {
                HandlerBinding::Callable(handler) => Some(self.bus.subscribe(&topic, handler)),
                HandlerBinding::Unbound(_) => None,
            })
            .collect();

        let entry = RegisteredSequence {
            definition: Arc::new(definition),
            subscriptions,
        };
        let replaced = self.registry_mut().insert(name.clone(), entry);
        match replaced {
            Some(previous) => {
                info!(sequence = %name, "sequence re-registered; previous definition replaced");
                previous.retire();
            }
            None => info!(sequence = %name, "sequence registered"),
        }
        Ok(report)
    }

    pub fn unregister_sequence(&self, name: &str) -> bool {
        let removed = self.registry_mut().remove(name);
        match removed {
            Some(entry) => {
                entry.retire();
                info!(sequence = %name, "sequence unregistered");
                true
            }
            None => false,
        }
    }

    /// Registered names, sorted.
    pub fn sequence_names(&self) -> Vec<String> {
        self.registry().keys().cloned().collect()
    }

    pub fn definition(&self, name: &str) -> Option<Arc<SequenceDefinition>> {
        self.registry().get(name).map(|entry| Arc::clone(&entry.definition))
    }

    // -----------------------------------------------------------------------
    // Execution
    // -----------------------------------------------------------------------

    /// Run `name` with the given baton and wait for it to finish.
    ///
    /// Queues behind any run already in flight.  Beats that fail under the
    /// `continue` policy do not fail the run.
    ///
    /// # Errors
    /// - [`EngineError::SequenceNotFound`] before anything is queued.
    /// - [`EngineError::BeatAborted`] / [`EngineError::RetryExhausted`] /
    ///   [`EngineError::BeatDiscarded`] when the run terminates early.
    pub async fn start_sequence(&self, name: &str, payload: Baton) -> Result<RunId, EngineError> {
        self.start_sequence_with_priority(name, payload, Priority::Normal).await
    }

    pub async fn start_sequence_with_priority(
        &self,
        name: &str,
        payload: Baton,
        priority: Priority,
    ) -> Result<RunId, EngineError> {
        let definition = self.lookup(name)?;
        let run_id = Uuid::new_v4();
        let entry = self.enqueue(run_id, &definition);
        self.run(entry, run_id, definition, payload, priority).await
    }

    /// Take a place in the run queue now and drive the run on a background
    /// task.  The returned handle carries the run id immediately.
    pub fn submit(self: &Arc<Self>, name: &str, payload: Baton, priority: Priority) -> Result<RunHandle, EngineError> {
        let definition = self.lookup(name)?;
        let run_id = Uuid::new_v4();
        let entry = self.enqueue(run_id, &definition);

        let (tx, done) = oneshot::channel();
        let conductor = Arc::clone(self);
        tokio::spawn(async move {
            let outcome = conductor.run(entry, run_id, definition, payload, priority).await;
            // The caller may have dropped its handle; that is fine.
            let _ = tx.send(outcome);
        });

        Ok(RunHandle { run_id, done })
    }

    pub fn queue_status(&self) -> QueueStatus {
        let executing_run = self.runs.holder();
        let pending_runs = self.runs.pending();
        QueueStatus {
            pending: pending_runs.len(),
            executing: usize::from(executing_run.is_some()),
            completed: self.counters().finished(),
            executing_run,
            pending_runs,
        }
    }

    pub fn statistics(&self) -> Statistics {
        let counters = self.counters();
        let total = counters.finished();
        let (average_execution_time_ms, success_rate) = if total == 0 {
            (0.0, 1.0)
        } else {
            (
                counters.total_time.as_secs_f64() * 1000.0 / total as f64,
                counters.successful as f64 / total as f64,
            )
        };
        Statistics {
            total_sequences_executed: total,
            successful: counters.successful,
            failed: counters.failed,
            average_execution_time_ms,
            success_rate,
        }
    }

    /// Discard beats waiting on the executor.  In-flight beats are untouched.
    pub fn clear_beat_queue(&self) -> usize {
        self.executor.clear_queue()
    }

    pub fn debug_info(&self) -> DebugInfo {
        let (active_timers, completed_beats, beat_statistics, warnings) = {
            let tracker = self.tracker();
            (
                tracker.active_timer_count(),
                tracker.completed_beat_count(),
                tracker.all_beat_statistics(),
                tracker.performance_warnings(),
            )
        };
        DebugInfo {
            active_timers,
            completed_beats,
            beat_statistics,
            warnings,
            queue: self.queue_status(),
            registered_sequences: self.registry().len(),
        }
    }

    /// Read access to the timing registry.
    pub fn with_performance<R>(&self, f: impl FnOnce(&PerformanceTracker) -> R) -> R {
        f(&self.tracker())
    }

    // -----------------------------------------------------------------------
    // Internal: run lifecycle
    // -----------------------------------------------------------------------

    fn lookup(&self, name: &str) -> Result<Arc<SequenceDefinition>, EngineError> {
        self.definition(name)
            .ok_or_else(|| EngineError::SequenceNotFound(name.to_owned()))
    }

    fn enqueue(&self, run_id: RunId, definition: &SequenceDefinition) -> GateEntry<QueuedRun> {
        let entry = self.runs.enter(QueuedRun {
            run_id,
            sequence: definition.name.clone(),
        });
        if !entry.is_immediate() {
            let position = self.runs.pending_len();
            info!(sequence = %definition.name, %run_id, position, "run queued");
            self.publish(
                topics::SEQUENCE_QUEUED,
                json!({ "sequence": definition.name, "runId": run_id, "position": position }),
            );
        }
        entry
    }

    #[instrument(skip_all, fields(sequence = %definition.name, %run_id))]
    async fn run(
        &self,
        entry: GateEntry<QueuedRun>,
        run_id: RunId,
        definition: Arc<SequenceDefinition>,
        payload: Baton,
        priority: Priority,
    ) -> Result<RunId, EngineError> {
        let _slot = entry
            .acquired()
            .await
            .map_err(|GateDiscarded| EngineError::RunDropped(run_id))?;

        let mut ctx = ExecutionContext::new(run_id, Arc::clone(&definition), payload, priority);
        let started = Instant::now();
        self.tracker().start_sequence_timing(&definition.name, run_id);
        self.publish(
            topics::SEQUENCE_STARTED,
            json!({
                "sequence": definition.name,
                "runId": run_id,
                "priority": priority,
                "movements": definition.movements.len(),
                "beats": definition.total_beats(),
            }),
        );
        info!("sequence started");

        let outcome = self.perform(&mut ctx).await;
        let elapsed = started.elapsed();

        match &outcome {
            Ok(()) => {
                self.tracker().end_sequence_timing(&definition.name, run_id);
                self.counters().record(true, elapsed);
                self.publish(
                    topics::SEQUENCE_COMPLETED,
                    json!({
                        "sequence": definition.name,
                        "runId": run_id,
                        "elapsedMs": elapsed.as_secs_f64() * 1000.0,
                        "completedBeats": ctx.completed_beats,
                        "errors": ctx.errors,
                        "payload": ctx.payload,
                    }),
                );
                info!(?elapsed, failed_beats = ctx.errors.len(), "sequence completed");
            }
            Err(err) => {
                self.tracker().cleanup_failed_sequence(&definition.name, run_id);
                self.counters().record(false, elapsed);
                self.publish(
                    topics::SEQUENCE_ERROR,
                    json!({
                        "sequence": definition.name,
                        "runId": run_id,
                        "error": err.to_string(),
                        "completedBeats": ctx.completed_beats,
                        "errors": ctx.errors,
                    }),
                );
                error!(?elapsed, "sequence failed: {err}");
            }
        }

        outcome.map(|()| run_id)
    }

    /// Walk movements and beats strictly in declared order.
    async fn perform(&self, ctx: &mut ExecutionContext) -> Result<(), EngineError> {
        let definition = Arc::clone(&ctx.sequence);
        let name = definition.name.as_str();

        for (movement_index, movement) in definition.movements.iter().enumerate() {
            ctx.current_movement = movement_index;
            ctx.current_beat = 0;
            self.tracker().start_movement_timing(name, &movement.name, ctx.run_id);

            for (beat_index, beat) in movement.beats.iter().enumerate() {
                ctx.current_beat = beat_index;
                self.tracker().start_beat_timing(name, beat.number);

                match self.executor.execute_beat(beat, ctx, movement).await {
                    Ok(report) => {
                        self.tracker().end_beat_timing(name, beat.number);
                        if report.status == BeatStatus::FailedContinued {
                            debug!(beat = beat.number, "continuing past failed beat");
                        }
                    }
                    Err(err) => {
                        let mut tracker = self.tracker();
                        tracker.cleanup_failed_beat(name, beat.number);
                        tracker.cleanup_failed_movement(name, &movement.name, ctx.run_id);
                        return Err(err);
                    }
                }
            }

            self.tracker()
                .end_movement_timing(name, &movement.name, ctx.run_id, movement.beats.len());
        }
        Ok(())
    }

    fn publish(&self, topic: &str, payload: Value) {
        if let Err(err) = self.bus.emit(topic, &payload, None) {
            warn!(topic, %err, "lifecycle subscriber failed; ignoring");
        }
    }

    // -----------------------------------------------------------------------
    // Internal: locks
    // -----------------------------------------------------------------------

    fn registry(&self) -> std::sync::RwLockReadGuard<'_, BTreeMap<String, RegisteredSequence>> {
        self.registry.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn registry_mut(&self) -> std::sync::RwLockWriteGuard<'_, BTreeMap<String, RegisteredSequence>> {
        self.registry.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn tracker(&self) -> MutexGuard<'_, PerformanceTracker> {
        self.tracker.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn counters(&self) -> MutexGuard<'_, RunCounters> {
        self.counters.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

// ---------------------------------------------------------------------------
// Process-wide slot
// ---------------------------------------------------------------------------

static INSTANCE: Mutex<Option<Arc<Conductor>>> = Mutex::new(None);

/// The process-wide conductor, built with `bus` and default configuration on
/// first use.  Later calls return the same instance and ignore `bus`.
pub fn get_instance(bus: Arc<dyn EventBus>) -> Arc<Conductor> {
    let mut slot = INSTANCE.lock().unwrap_or_else(PoisonError::into_inner);
    Arc::clone(slot.get_or_insert_with(|| Conductor::with_defaults(bus)))
}

/// Forget the process-wide conductor so the next [`get_instance`] builds a
/// fresh one.  Existing `Arc`s stay valid.
pub fn reset_instance() {
    INSTANCE.lock().unwrap_or_else(PoisonError::into_inner).take();
}
