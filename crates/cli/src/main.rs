//! `conductor` CLI entry-point.
//!
//! Available sub-commands:
//! - `validate` — validate a sequence definition JSON file.
//! - `run`      — register the sequences in a file and run them.
//! - `estimate` — print advisory beat duration estimates.

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{bail, Context};
use bus::{handler, Baton, EventBus, InMemoryBus};
use clap::{Parser, Subcommand};
use engine::executor::DEFAULT_TEMPO;
use engine::{
    estimate_beat_execution_time, estimate_sequence_execution_time, topics, validate_sequence, Conductor,
    ConductorConfig, SequenceDefinition,
};
use serde_json::Value;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "conductor",
    about = "Run and inspect movement/beat sequence definitions",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Validate a sequence definition JSON file (one object or an array).
    Validate {
        path: PathBuf,
    },
    /// Register every sequence in the file and run them in order.
    Run {
        path: PathBuf,
        /// Only run this sequence.
        #[arg(long)]
        sequence: Option<String>,
        /// Initial baton, as a JSON object.
        #[arg(long, default_value = "{}")]
        payload: String,
    },
    /// Print advisory duration estimates per beat.
    Estimate {
        path: PathBuf,
        /// Override the sequence's own tempo.
        #[arg(long)]
        tempo: Option<f64>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Validate { path } => validate(&path),
        Command::Run { path, sequence, payload } => run(&path, sequence.as_deref(), &payload).await,
        Command::Estimate { path, tempo } => estimate(&path, tempo),
    }
}

fn load_definitions(path: &Path) -> anyhow::Result<Vec<Value>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("cannot read file {}", path.display()))?;
    let parsed: Value = serde_json::from_str(&content).context("invalid JSON")?;
    Ok(match parsed {
        Value::Array(items) => items,
        single => vec![single],
    })
}

fn validate(path: &Path) -> anyhow::Result<ExitCode> {
    let mut all_valid = true;
    for definition in load_definitions(path)? {
        let name = definition.get("name").and_then(Value::as_str).unwrap_or("<unnamed>");
        let report = validate_sequence(&definition, None);
        if report.is_valid {
            println!("✅ {name} is valid ({} warnings)", report.warnings.len());
        } else {
            println!("❌ {name} failed validation");
            all_valid = false;
        }
        println!("{}", serde_json::to_string_pretty(&report)?);
    }
    Ok(if all_valid { ExitCode::SUCCESS } else { ExitCode::FAILURE })
}

async fn run(path: &Path, only: Option<&str>, payload: &str) -> anyhow::Result<ExitCode> {
    let baton: Baton = match serde_json::from_str(payload).context("invalid --payload JSON")? {
        Value::Object(map) => map,
        other => bail!("--payload must be a JSON object, got {other}"),
    };

    let bus = InMemoryBus::shared();
    for topic in topics::ALL {
        let _ = bus.subscribe(
            topic,
            handler(|delivery| {
                info!(topic = delivery.topic(), payload = %delivery.payload(), "lifecycle");
                Ok(())
            }),
        );
    }

    let conductor = Conductor::new(bus, ConductorConfig::from_env());
    let mut names = Vec::new();
    for definition in load_definitions(path)? {
        let name = definition.get("name").and_then(Value::as_str).map(str::to_owned);
        let report = conductor.register_sequence(definition)?;
        for warning in &report.warnings {
            info!("validation warning: {warning}");
        }
        match name {
            Some(name) if !names.contains(&name) => names.push(name),
            _ => {}
        }
    }

    let targets: Vec<String> = match only {
        Some(name) => vec![name.to_owned()],
        None => names,
    };

    let mut failures = 0usize;
    for name in &targets {
        match conductor.start_sequence(name, baton.clone()).await {
            Ok(run_id) => println!("✅ {name} finished (run {run_id})"),
            Err(e) => {
                error!("{name} failed: {e}");
                println!("❌ {name} failed: {e}");
                failures += 1;
            }
        }
    }

    println!("{}", serde_json::to_string_pretty(&conductor.statistics())?);
    println!("{}", serde_json::to_string_pretty(&conductor.debug_info())?);

    Ok(if failures == 0 { ExitCode::SUCCESS } else { ExitCode::FAILURE })
}

fn estimate(path: &Path, tempo: Option<f64>) -> anyhow::Result<ExitCode> {
    for raw in load_definitions(path)? {
        let mut definition: SequenceDefinition =
            serde_json::from_value(raw).context("definition does not match the sequence schema")?;
        if tempo.is_some() {
            definition.tempo = tempo;
        }
        let bpm = definition.tempo.unwrap_or(DEFAULT_TEMPO);

        println!("{} @ {bpm} BPM", definition.name);
        for movement in &definition.movements {
            println!("  {}", movement.name);
            for beat in &movement.beats {
                let estimate = estimate_beat_execution_time(beat, bpm);
                println!("    #{:<3} {:<30} {:>8.1} ms", beat.number, beat.event, estimate.as_secs_f64() * 1000.0);
            }
        }
        println!(
            "  total {:.1} ms",
            estimate_sequence_execution_time(&definition).as_secs_f64() * 1000.0
        );
    }
    Ok(ExitCode::SUCCESS)
}
