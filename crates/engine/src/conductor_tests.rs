//! End-to-end tests for the conductor: registration, run ordering, mutual
//! exclusion between runs, error policies and bookkeeping.
//!
//! Everything runs against an `InMemoryBus` with mock subscribers, so no
//! plugin code is involved.

use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bus::mock::{EventLog, MockHandler};
use bus::{handler, Baton, EventBus, Handler, InMemoryBus};
use serde_json::{json, Value};

use crate::conductor::{get_instance, reset_instance, Conductor};
use crate::executor::BeatStatus;
use crate::models::{Beat, Dynamics, ErrorHandling, ExecutionContext, Movement, Priority, SequenceDefinition, Timing};
use crate::validator::{HandlerBinding, HandlerSet};
use crate::{topics, EngineError};

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

fn beat(number: u32, event: &str, policy: ErrorHandling) -> Beat {
    Beat::new(number, event, format!("beat {number}"))
        .with_dynamics(Dynamics::MezzoForte)
        .with_timing(Timing::Immediate)
        .with_error_handling(policy)
}

fn sequence(name: &str, movements: Vec<Movement>) -> SequenceDefinition {
    let mut definition = SequenceDefinition::new(name, movements);
    definition.description = Some(format!("{name} test sequence"));
    definition.version = Some("1.0.0".into());
    definition
}

fn setup() -> (Arc<InMemoryBus>, Arc<Conductor>) {
    let bus = InMemoryBus::shared();
    let conductor = Conductor::with_defaults(bus.clone());
    (bus, conductor)
}

fn started_sequences(log: &EventLog) -> Vec<String> {
    log.payloads_for(topics::BEAT_STARTED)
        .iter()
        .map(|p| p["sequence"].as_str().unwrap_or_default().to_owned())
        .collect()
}

fn started_beats(log: &EventLog) -> Vec<u64> {
    log.payloads_for(topics::BEAT_STARTED)
        .iter()
        .map(|p| p["beat"].as_u64().unwrap_or_default())
        .collect()
}

/// A handler that blocks its beat until released, so tests can observe the
/// conductor while a run is in flight.  Needs a multi-thread runtime.
struct Hold {
    handler: Handler,
    entered: mpsc::Receiver<()>,
    release: mpsc::Sender<()>,
}

impl Hold {
    fn new() -> Self {
        let (entered_tx, entered) = mpsc::channel();
        let (release, release_rx) = mpsc::channel::<()>();
        let entered_tx = Mutex::new(entered_tx);
        let release_rx = Mutex::new(release_rx);

        let handler = handler(move |_| {
            entered_tx.lock().unwrap().send(()).ok();
            release_rx
                .lock()
                .unwrap()
                .recv_timeout(Duration::from_secs(5))
                .map_err(|_| anyhow::anyhow!("hold was never released"))
        });
        Self { handler, entered, release }
    }

    fn wait_entered(&self) {
        self.entered
            .recv_timeout(Duration::from_secs(5))
            .expect("held beat never started");
    }

    fn release(&self) {
        self.release.send(()).unwrap();
    }
}

// ============================================================
// Registration
// ============================================================

#[test]
fn registering_same_name_twice_keeps_one_entry() {
    let (_bus, conductor) = setup();
    let first = sequence("dup", vec![Movement::new("m", vec![beat(1, "a.one", ErrorHandling::Continue)])]);
    let mut second = first.clone();
    second.movements[0].beats.push(beat(2, "a.two", ErrorHandling::Continue));

    conductor.register_definition(&first).unwrap();
    conductor.register_definition(&second).unwrap();

    assert_eq!(conductor.sequence_names(), vec!["dup"]);
    assert_eq!(conductor.definition("dup").unwrap().total_beats(), 2);
}

#[test]
fn definition_without_movements_is_rejected() {
    let (_bus, conductor) = setup();
    let err = conductor.register_sequence(json!({ "name": "broken" })).unwrap_err();

    match err {
        EngineError::Registration { name, errors } => {
            assert_eq!(name, "broken");
            assert!(!errors.is_empty());
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(conductor.sequence_names().is_empty());
}

#[test]
fn empty_movement_registers_with_warning() {
    let (_bus, conductor) = setup();
    let report = conductor
        .register_sequence(json!({ "name": "hollow", "movements": [{ "name": "m", "beats": [] }] }))
        .unwrap();

    assert!(report.is_valid);
    assert!(report.warnings.iter().any(|w| w.contains("has no beats")));
    assert_eq!(conductor.sequence_names(), vec!["hollow"]);
}

#[test]
fn handlers_follow_the_registration_lifecycle() {
    let (bus, conductor) = setup();
    let definition = json!({
        "name": "plugin",
        "movements": [{ "name": "m", "beats": [{ "number": 1, "event": "plugin.go", "title": "go" }] }]
    });

    let mut handlers = HandlerSet::new();
    handlers.insert("plugin.go".into(), HandlerBinding::Callable(handler(|_| Ok(()))));
    conductor.register_with_handlers(definition.clone(), handlers).unwrap();
    assert_eq!(bus.subscriber_count("plugin.go"), 1);

    // Re-registration replaces the old subscription instead of stacking.
    let mut handlers = HandlerSet::new();
    handlers.insert("plugin.go".into(), HandlerBinding::Callable(handler(|_| Ok(()))));
    conductor.register_with_handlers(definition.clone(), handlers).unwrap();
    assert_eq!(bus.subscriber_count("plugin.go"), 1);

    // A non-callable binding blocks registration entirely.
    let mut bad = HandlerSet::new();
    bad.insert("plugin.go".into(), HandlerBinding::Unbound(json!("not a function")));
    assert!(conductor.register_with_handlers(definition, bad).is_err());
    assert_eq!(bus.subscriber_count("plugin.go"), 1);

    assert!(conductor.unregister_sequence("plugin"));
    assert_eq!(bus.subscriber_count("plugin.go"), 0);
    assert!(!conductor.unregister_sequence("plugin"));
}

// ============================================================
// Execution
// ============================================================

#[tokio::test]
async fn two_beat_scenario_fires_each_topic_once_in_order() {
    let (bus, conductor) = setup();
    conductor
        .register_sequence(json!({
            "name": "W",
            "movements": [{
                "name": "M",
                "beats": [
                    { "number": 1, "event": "e1", "title": "t1", "dynamics": "mf", "timing": "immediate", "errorHandling": "continue" },
                    { "number": 2, "event": "e2", "title": "t2", "dynamics": "mf", "timing": "immediate", "errorHandling": "continue" }
                ]
            }]
        }))
        .unwrap();

    let log = EventLog::new();
    let _subs = log.attach(bus.as_ref(), &["e1", "e2"]);
    let before = conductor.statistics().total_sequences_executed;

    conductor.start_sequence("W", Baton::new()).await.unwrap();

    assert_eq!(log.topics(), vec!["e1", "e2"]);
    assert_eq!(conductor.statistics().total_sequences_executed, before + 1);
}

#[tokio::test]
async fn beats_start_in_declared_movement_order() {
    let (bus, conductor) = setup();
    let definition = sequence(
        "ordered",
        vec![
            Movement::new(
                "first",
                vec![beat(10, "o.a", ErrorHandling::Continue), beat(3, "o.b", ErrorHandling::Continue)],
            ),
            Movement::new("empty", vec![]),
            Movement::new(
                "second",
                vec![beat(7, "o.c", ErrorHandling::Continue), beat(1, "o.d", ErrorHandling::Continue)],
            ),
        ],
    );
    conductor.register_definition(&definition).unwrap();

    let log = EventLog::new();
    let _subs = log.attach(bus.as_ref(), &[topics::BEAT_STARTED]);
    conductor.start_sequence("ordered", Baton::new()).await.unwrap();

    assert_eq!(started_beats(&log), vec![10, 3, 7, 1]);
}

#[tokio::test]
async fn baton_threads_through_beats() {
    let (bus, conductor) = setup();
    conductor
        .register_definition(&sequence(
            "baton",
            vec![Movement::new(
                "m",
                vec![beat(1, "b.write", ErrorHandling::AbortSequence), beat(2, "b.read", ErrorHandling::AbortSequence)],
            )],
        ))
        .unwrap();

    let _writer = MockHandler::writing("token", json!("abc")).attach(bus.as_ref(), "b.write");
    let reader = MockHandler::succeeding();
    let _reader_sub = reader.attach(bus.as_ref(), "b.read");

    let completed = EventLog::new();
    let _subs = completed.attach(bus.as_ref(), &[topics::SEQUENCE_COMPLETED]);

    let mut payload = Baton::new();
    payload.insert("origin".into(), json!("test"));
    conductor.start_sequence("baton", payload).await.unwrap();

    let seen = &reader.payloads()[0];
    assert_eq!(seen["token"], json!("abc"));
    assert_eq!(seen["origin"], json!("test"));

    let summary = &completed.payloads_for(topics::SEQUENCE_COMPLETED)[0];
    assert_eq!(summary["payload"]["token"], json!("abc"));
    assert_eq!(summary["completedBeats"], json!([1, 2]));
}

#[tokio::test]
async fn unknown_sequence_is_rejected_without_side_effects() {
    let (_bus, conductor) = setup();
    let err = conductor.start_sequence("nope", Baton::new()).await.unwrap_err();

    assert!(matches!(err, EngineError::SequenceNotFound(name) if name == "nope"));
    assert_eq!(conductor.statistics().total_sequences_executed, 0);
    assert_eq!(conductor.queue_status().executing, 0);
}

#[tokio::test]
async fn abort_policy_stops_the_run() {
    let (bus, conductor) = setup();
    conductor
        .register_definition(&sequence(
            "abort",
            vec![
                Movement::new(
                    "m1",
                    vec![beat(1, "x.ok", ErrorHandling::Continue), beat(2, "x.boom", ErrorHandling::AbortSequence)],
                ),
                Movement::new("m2", vec![beat(3, "x.never", ErrorHandling::Continue)]),
            ],
        ))
        .unwrap();

    let _boom = MockHandler::failing("kaboom").attach(bus.as_ref(), "x.boom");
    let never = MockHandler::succeeding();
    let _never_sub = never.attach(bus.as_ref(), "x.never");
    let log = EventLog::new();
    let _subs = log.attach(bus.as_ref(), &[topics::BEAT_STARTED, topics::SEQUENCE_ERROR]);

    let err = conductor.start_sequence("abort", Baton::new()).await.unwrap_err();

    assert!(matches!(err, EngineError::BeatAborted { beat: 2, .. }));
    assert_eq!(started_beats(&log), vec![1, 2]);
    assert_eq!(never.call_count(), 0);
    assert_eq!(log.payloads_for(topics::SEQUENCE_ERROR).len(), 1);

    let stats = conductor.statistics();
    assert_eq!(stats.total_sequences_executed, 1);
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.success_rate, 0.0);

    // Failed timers are cleaned up rather than leaked.
    let debug = conductor.debug_info();
    assert_eq!(debug.active_timers, 0);
    assert_eq!(debug.completed_beats, 1);
    assert_eq!(debug.queue.executing, 0);
}

#[tokio::test]
async fn continue_policy_moves_on_to_the_next_beat() {
    let (bus, conductor) = setup();
    conductor
        .register_definition(&sequence(
            "lenient",
            vec![Movement::new(
                "m",
                vec![beat(1, "y.fail", ErrorHandling::Continue), beat(2, "y.next", ErrorHandling::Continue)],
            )],
        ))
        .unwrap();

    let _fail = MockHandler::failing("meh").attach(bus.as_ref(), "y.fail");
    let next = MockHandler::succeeding();
    let _next_sub = next.attach(bus.as_ref(), "y.next");
    let log = EventLog::new();
    let _subs = log.attach(bus.as_ref(), &[topics::BEAT_STARTED, topics::BEAT_FAILED]);

    conductor.start_sequence("lenient", Baton::new()).await.unwrap();

    assert_eq!(started_beats(&log), vec![1, 2]);
    assert_eq!(log.payloads_for(topics::BEAT_FAILED).len(), 1);
    assert_eq!(next.call_count(), 1);
    assert_eq!(conductor.statistics().successful, 1);
}

#[tokio::test]
async fn unrecognised_policy_behaves_like_continue() {
    let (bus, conductor) = setup();
    let report = conductor
        .register_sequence(json!({
            "name": "shrugging",
            "movements": [{
                "name": "m",
                "beats": [
                    { "number": 1, "event": "z.fail", "title": "t1", "dynamics": "mf", "timing": "immediate", "errorHandling": "shrug" },
                    { "number": 2, "event": "z.next", "title": "t2", "dynamics": "mf", "timing": "immediate", "errorHandling": "continue" }
                ]
            }]
        }))
        .unwrap();
    assert!(report.warnings.iter().any(|w| w.contains("errorHandling")));

    let _fail = MockHandler::failing("nope").attach(bus.as_ref(), "z.fail");
    let next = MockHandler::succeeding();
    let _next_sub = next.attach(bus.as_ref(), "z.next");
    let log = EventLog::new();
    let _subs = log.attach(bus.as_ref(), &[topics::BEAT_STARTED, topics::BEAT_FAILED]);

    conductor.start_sequence("shrugging", Baton::new()).await.unwrap();

    assert_eq!(started_beats(&log), vec![1, 2]);
    assert_eq!(log.payloads_for(topics::BEAT_FAILED).len(), 1);
    assert_eq!(next.call_count(), 1);
    assert_eq!(conductor.statistics().successful, 1);
}

// Retry is bounded: the default allows three extra publishes before the
// run is aborted.
#[tokio::test(start_paused = true)]
async fn retry_policy_aborts_after_bounded_attempts() {
    let (bus, conductor) = setup();
    conductor
        .register_definition(&sequence(
            "retrying",
            vec![Movement::new(
                "m",
                vec![beat(1, "r.flaky", ErrorHandling::Retry), beat(2, "r.after", ErrorHandling::Continue)],
            )],
        ))
        .unwrap();

    let flaky = MockHandler::failing("down");
    let _flaky_sub = flaky.attach(bus.as_ref(), "r.flaky");
    let after = MockHandler::succeeding();
    let _after_sub = after.attach(bus.as_ref(), "r.after");

    let err = conductor.start_sequence("retrying", Baton::new()).await.unwrap_err();

    assert!(matches!(err, EngineError::RetryExhausted { attempts: 4, .. }));
    assert_eq!(flaky.call_count(), 4);
    assert_eq!(after.call_count(), 0);
}

#[tokio::test]
async fn bookkeeping_after_successful_runs() {
    let (_bus, conductor) = setup();
    conductor
        .register_definition(&sequence(
            "books",
            vec![
                Movement::new("a", vec![beat(1, "k.one", ErrorHandling::Continue)]),
                Movement::new("b", vec![beat(2, "k.two", ErrorHandling::Continue)]),
            ],
        ))
        .unwrap();

    conductor.start_sequence("books", Baton::new()).await.unwrap();
    conductor
        .start_sequence_with_priority("books", Baton::new(), Priority::High)
        .await
        .unwrap();

    let stats = conductor.statistics();
    assert_eq!(stats.total_sequences_executed, 2);
    assert_eq!(stats.success_rate, 1.0);

    let status = conductor.queue_status();
    assert_eq!(status.completed, 2);
    assert_eq!(status.pending, 0);
    assert!(status.executing_run.is_none());

    conductor.with_performance(|tracker| {
        assert_eq!(tracker.movement_timings(Some("books")).len(), 4);
        assert_eq!(tracker.sequence_timings(Some("books")).len(), 2);
        assert_eq!(tracker.beat_statistics("books").unwrap().count, 4);
    });

    let debug = conductor.debug_info();
    assert_eq!(debug.active_timers, 0);
    assert_eq!(debug.completed_beats, 4);
    assert!(debug.beat_statistics.contains_key("books"));
    assert!(debug.warnings.is_empty());
    assert_eq!(debug.registered_sequences, 1);
}

#[tokio::test]
async fn back_to_back_runs_do_not_interleave() {
    let (bus, conductor) = setup();
    for name in ["A", "B"] {
        conductor
            .register_definition(&sequence(
                name,
                vec![Movement::new(
                    "m",
                    vec![
                        beat(1, "z.one", ErrorHandling::Continue),
                        beat(2, "z.two", ErrorHandling::Continue),
                        beat(3, "z.three", ErrorHandling::Continue),
                    ],
                )],
            ))
            .unwrap();
    }

    let log = EventLog::new();
    let _subs = log.attach(bus.as_ref(), &[topics::BEAT_STARTED]);

    let (a, b) = tokio::join!(
        conductor.start_sequence("A", Baton::new()),
        conductor.start_sequence("B", Baton::new())
    );
    a.unwrap();
    b.unwrap();

    assert_eq!(started_sequences(&log), vec!["A", "A", "A", "B", "B", "B"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn queued_run_waits_for_the_run_in_flight() {
    let (bus, conductor) = setup();
    conductor
        .register_definition(&sequence(
            "held",
            vec![Movement::new(
                "m",
                vec![beat(1, "h.hold", ErrorHandling::AbortSequence), beat(2, "h.after", ErrorHandling::Continue)],
            )],
        ))
        .unwrap();
    conductor
        .register_definition(&sequence(
            "second",
            vec![Movement::new("m", vec![beat(1, "s.one", ErrorHandling::Continue)])],
        ))
        .unwrap();

    let hold = Hold::new();
    let _hold_sub = bus.subscribe("h.hold", hold.handler.clone());
    let log = EventLog::new();
    let _subs = log.attach(bus.as_ref(), &[topics::BEAT_STARTED, topics::SEQUENCE_QUEUED]);

    let first = conductor.submit("held", Baton::new(), Priority::Normal).unwrap();
    hold.wait_entered();

    let second = conductor.submit("second", Baton::new(), Priority::Normal).unwrap();
    assert_ne!(first.run_id(), second.run_id());

    let status = conductor.queue_status();
    assert_eq!(status.executing, 1);
    assert_eq!(status.pending, 1);
    assert_eq!(status.executing_run.as_ref().map(|r| r.run_id), Some(first.run_id()));
    assert_eq!(status.pending_runs[0].run_id, second.run_id());
    assert_eq!(log.payloads_for(topics::SEQUENCE_QUEUED).len(), 1);

    hold.release();
    assert_eq!(first.wait().await.unwrap(), status.executing_run.unwrap().run_id);
    second.wait().await.unwrap();

    assert_eq!(started_sequences(&log), vec!["held", "held", "second"]);
    assert_eq!(conductor.queue_status().completed, 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn clearing_the_beat_queue_discards_waiting_beats_only() {
    let (bus, conductor) = setup();
    let definition = Arc::new(sequence(
        "direct",
        vec![Movement::new(
            "m",
            vec![beat(1, "d.hold", ErrorHandling::AbortSequence), beat(2, "d.next", ErrorHandling::Continue)],
        )],
    ));

    let hold = Hold::new();
    let _hold_sub = bus.subscribe("d.hold", hold.handler.clone());

    let spawn_beat = |index: usize| {
        let conductor = Arc::clone(&conductor);
        let definition = Arc::clone(&definition);
        tokio::spawn(async move {
            let movement = definition.movements[0].clone();
            let beat = movement.beats[index].clone();
            let mut ctx = ExecutionContext::new(uuid::Uuid::new_v4(), definition, Baton::new(), Priority::Normal);
            conductor.executor().execute_beat(&beat, &mut ctx, &movement).await
        })
    };

    let running = spawn_beat(0);
    hold.wait_entered();
    let waiting = spawn_beat(1);

    for _ in 0..100 {
        if !conductor.executor().queued_beats().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(conductor.executor().queued_beats().len(), 1);

    assert_eq!(conductor.clear_beat_queue(), 1);
    assert!(matches!(
        waiting.await.unwrap(),
        Err(EngineError::BeatDiscarded { beat: 2, .. })
    ));
    assert!(conductor.executor().is_busy());

    hold.release();
    let report = running.await.unwrap().unwrap();
    assert_eq!(report.status, BeatStatus::Completed);
    assert!(!conductor.executor().is_busy());
}

#[tokio::test]
async fn lifecycle_topics_bracket_a_run() {
    let (bus, conductor) = setup();
    conductor
        .register_definition(&sequence(
            "life",
            vec![Movement::new("m", vec![beat(1, "l.one", ErrorHandling::Continue)])],
        ))
        .unwrap();

    let log = EventLog::new();
    let _subs = log.attach(bus.as_ref(), &topics::ALL);
    let run_id = conductor.start_sequence("life", Baton::new()).await.unwrap();

    assert_eq!(
        log.topics(),
        vec![
            topics::SEQUENCE_STARTED,
            topics::BEAT_STARTED,
            topics::BEAT_COMPLETED,
            topics::SEQUENCE_COMPLETED,
        ]
    );
    let started: &Value = &log.payloads_for(topics::SEQUENCE_STARTED)[0];
    assert_eq!(started["runId"], json!(run_id));
}

// ============================================================
// Process-wide instance
// ============================================================

#[test]
fn process_wide_instance_is_shared_until_reset() {
    reset_instance();
    let bus: Arc<dyn EventBus> = InMemoryBus::shared();

    let first = get_instance(Arc::clone(&bus));
    let again = get_instance(Arc::clone(&bus));
    assert!(Arc::ptr_eq(&first, &again));

    first
        .register_definition(&sequence("global", vec![Movement::new("m", vec![beat(1, "g.one", ErrorHandling::Continue)])]))
        .unwrap();
    assert_eq!(again.sequence_names(), vec!["global"]);

    reset_instance();
    let fresh = get_instance(bus);
    assert!(!Arc::ptr_eq(&first, &fresh));
    assert!(fresh.sequence_names().is_empty());
    reset_instance();
}
