//! Structural validation — run this before registering a sequence.
//!
//! Works on raw JSON so that wrong types can be *reported* instead of
//! failing deserialisation.  Only structural impossibilities are errors;
//! anything that affects quality but not executability is a warning.
//!
//! Rules enforced:
//! 1. The sequence has a non-empty `name` and a `movements` array.
//! 2. Each movement has a non-empty `name` and a `beats` array.
//! 3. Each beat has an integer `number` ≥ 1, a non-empty `event` and `title`,
//!    and vocabulary-valid `dynamics` / `timing` when present.
//! 4. Handler sets, when supplied, bind every key to a callable.
//! 5. Compliance recommendations (metadata, event naming, handler keys).

use std::collections::BTreeMap;
use std::fmt;

use bus::Handler;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::models::{Beat, Dynamics, ErrorHandling, Timing};

// ---------------------------------------------------------------------------
// Handler sets
// ---------------------------------------------------------------------------

/// One entry of a plugin's handler set.
#[derive(Clone)]
pub enum HandlerBinding {
    Callable(Handler),
    /// Whatever the plugin declared that is not a callable.
    Unbound(Value),
}

impl fmt::Debug for HandlerBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Callable(_) => f.write_str("Callable(..)"),
            Self::Unbound(value) => f.debug_tuple("Unbound").field(value).finish(),
        }
    }
}

/// Handler key → binding.  Keys are the bus topics the handlers answer.
pub type HandlerSet = BTreeMap<String, HandlerBinding>;

/// Names that point at host-environment globals rather than plugin code.
const ENVIRONMENT_GLOBALS: [&str; 6] = ["window", "document", "global", "globalthis", "process", "env"];

// ---------------------------------------------------------------------------
// Report
// ---------------------------------------------------------------------------

/// Outcome of [`validate_sequence`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationReport {
    pub is_valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationReport {
    fn error(&mut self, msg: impl Into<String>) {
        self.errors.push(msg.into());
    }

    fn warn(&mut self, msg: impl Into<String>) {
        self.warnings.push(msg.into());
    }
}

// ---------------------------------------------------------------------------
// Entry points
// ---------------------------------------------------------------------------

/// Validate a raw sequence definition and, optionally, the handlers that
/// come with it.  Never fails; malformedness is reported in the result.
pub fn validate_sequence(definition: &Value, handlers: Option<&HandlerSet>) -> ValidationReport {
    let mut report = ValidationReport::default();

    match definition.as_object() {
        Some(sequence) => {
            check_sequence(sequence, &mut report);
            check_compliance(sequence, &mut report);
        }
        None => report.error("sequence definition must be an object"),
    }

    if let Some(handlers) = handlers {
        check_handlers(handlers, &mut report);
    }

    report.is_valid = report.errors.is_empty();
    report
}

/// Last-line runtime guard used by the executor on already-typed beats.
pub fn validate_beat(beat: &Beat) -> bool {
    beat.number >= 1 && !beat.event.trim().is_empty() && !beat.title.trim().is_empty()
}

/// Recommended event naming: namespaced with `-` or `.`.
pub fn is_structured_event_name(event: &str) -> bool {
    event.contains('-') || event.contains('.')
}

// ---------------------------------------------------------------------------
// Structural checks
// ---------------------------------------------------------------------------

fn check_sequence(sequence: &Map<String, Value>, report: &mut ValidationReport) {
    if non_empty_str(sequence.get("name")).is_none() {
        report.error("sequence name must be a non-empty string");
    }

    match sequence.get("tempo") {
        None | Some(Value::Null) => {}
        Some(Value::Number(n)) if n.as_f64().is_some_and(|t| t > 0.0) => {}
        Some(_) => report.error("sequence tempo must be a positive number"),
    }

    for field in ["key", "timeSignature", "description", "version"] {
        if let Some(value) = sequence.get(field) {
            if !value.is_string() && !value.is_null() {
                report.error(format!("sequence {field} must be a string when present"));
            }
        }
    }

    match sequence.get("movements") {
        Some(Value::Array(movements)) if movements.is_empty() => {
            report.warn("sequence has no movements");
        }
        Some(Value::Array(movements)) => {
            for (index, movement) in movements.iter().enumerate() {
                check_movement(index, movement, report);
            }
        }
        Some(_) => report.error("sequence movements must be an array"),
        None => report.error("sequence movements are required"),
    }
}

fn check_movement(index: usize, movement: &Value, report: &mut ValidationReport) {
    let Some(movement) = movement.as_object() else {
        report.error(format!("movement {index} must be an object"));
        return;
    };

    if non_empty_str(movement.get("name")).is_none() {
        report.error(format!("movement {index} name must be a non-empty string"));
    }

    if let Some(description) = movement.get("description") {
        if !description.is_string() && !description.is_null() {
            report.error(format!("movement {index} description must be a string when present"));
        }
    }

    match movement.get("beats") {
        Some(Value::Array(beats)) if beats.is_empty() => {
            report.warn(format!("movement {index} has no beats"));
        }
        Some(Value::Array(beats)) => {
            for (beat_index, beat) in beats.iter().enumerate() {
                check_beat(index, beat_index, beat, report);
            }
        }
        Some(_) => report.error(format!("movement {index} beats must be an array")),
        None => report.error(format!("movement {index} beats are required")),
    }
}

fn check_beat(movement: usize, index: usize, beat: &Value, report: &mut ValidationReport) {
    let at = format!("movement {movement} beat {index}");
    let Some(beat) = beat.as_object() else {
        report.error(format!("{at} must be an object"));
        return;
    };

    let number_ok = beat
        .get("number")
        .and_then(Value::as_u64)
        .is_some_and(|n| n >= 1 && n <= u64::from(u32::MAX));
    if !number_ok {
        report.error(format!("{at} number must be an integer >= 1"));
    }

    if non_empty_str(beat.get("event")).is_none() {
        report.error(format!("{at} event must be a non-empty string"));
    }
    if non_empty_str(beat.get("title")).is_none() {
        report.error(format!("{at} title must be a non-empty string"));
    }

    match beat.get("dynamics") {
        None | Some(Value::Null) => report.warn(format!("{at} has no dynamics")),
        Some(value) if serde_json::from_value::<Dynamics>(value.clone()).is_err() => {
            report.error(format!("{at} dynamics {value} is not a recognised level"));
        }
        Some(_) => {}
    }

    match beat.get("timing") {
        None | Some(Value::Null) => report.warn(format!("{at} has no timing")),
        Some(value) if serde_json::from_value::<Timing>(value.clone()).is_err() => {
            report.error(format!("{at} timing {value} is not a recognised timing"));
        }
        Some(_) => {}
    }

    match beat.get("errorHandling") {
        None | Some(Value::Null) => report.warn(format!("{at} has no errorHandling")),
        Some(value) => match serde_json::from_value::<ErrorHandling>(value.clone()) {
            Ok(ErrorHandling::Unrecognized) | Err(_) => report.warn(format!(
                "{at} errorHandling {value} is not one of continue, abort-sequence, retry"
            )),
            Ok(_) => {}
        },
    }
}

fn check_handlers(handlers: &HandlerSet, report: &mut ValidationReport) {
    if handlers.is_empty() {
        report.warn("handler set is empty; beats must be driven by bus subscribers");
        return;
    }

    for (key, binding) in handlers {
        if let HandlerBinding::Unbound(value) = binding {
            report.error(format!("handler '{key}' must be callable, found {}", type_name(value)));
        }
        if references_environment_global(key) {
            report.warn(format!("handler '{key}' references an environment global and may leak resources"));
        }
    }
}

// ---------------------------------------------------------------------------
// Compliance pass (warnings only)
// ---------------------------------------------------------------------------

fn check_compliance(sequence: &Map<String, Value>, report: &mut ValidationReport) {
    if non_empty_str(sequence.get("description")).is_none() {
        report.warn("sequence should carry a description");
    }
    if non_empty_str(sequence.get("version")).is_none() {
        report.warn("sequence should carry a version");
    }

    let events = sequence
        .get("movements")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(|m| m.get("beats").and_then(Value::as_array))
        .flatten()
        .filter_map(|b| b.get("event").and_then(Value::as_str))
        .filter(|event| !event.is_empty());

    for event in events {
        if !is_structured_event_name(event) {
            report.warn(format!("event '{event}' should be namespaced with '-' or '.'"));
        }
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn non_empty_str(value: Option<&Value>) -> Option<&str> {
    value
        .and_then(Value::as_str)
        .filter(|s| !s.trim().is_empty())
}

fn references_environment_global(key: &str) -> bool {
    key.split(|c: char| !c.is_ascii_alphanumeric())
        .any(|segment| ENVIRONMENT_GLOBALS.contains(&segment.to_ascii_lowercase().as_str()))
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
