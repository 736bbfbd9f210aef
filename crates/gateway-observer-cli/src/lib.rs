//! Trace pipeline CLI (`gwo`) for the gateway observer.
//!
//! Reads line-oriented traces (or a gateway snapshot envelope), derives
//! canonical lengths and digests, attaches diagnostics, and renders trace,
//! explanation, diff, or summary output. Exit codes are contractual:
//! 0 success, 1 input parse failure, 2 canonicalization/digest or gateway
//! fetch failure, 3 output write failure.

use std::fs::File;
use std::io::{self, BufReader, Write};
use std::thread;
use std::time::Duration;

use clap::{Args, Parser, Subcommand, ValueEnum};
use gateway_observer_core::trace::TraceEvent;
use gateway_observer_core::{canon, diagnostics, render, trace, ObserverError};
use serde_json::{Map, Value};

#[derive(Debug, Parser)]
#[command(name = "gwo")]
#[command(about = "Trace pipeline for the gateway observer")]
pub struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Annotate a full trace with ordering and reference diagnostics.
    Diagnose(TraceArgs),
    /// Derive canonical lengths and digests for raw events or a snapshot
    /// envelope.
    Project(TraceArgs),
    /// Render one explanation line per event.
    Explain(TraceArgs),
    /// Render only events whose digest disagrees with the reference trace.
    Diff(TraceArgs),
    /// Render per-source and per-artifact counts.
    Summary(TraceArgs),
    /// Poll the gateway snapshot endpoint and print events as they arrive.
    Gateway(GatewayArgs),
}

#[derive(Debug, Args)]
struct TraceArgs {
    #[arg(long, default_value = "-")]
    input: String,
    #[arg(long, default_value = "-")]
    output: String,
    #[arg(long)]
    reference: Option<String>,
}

#[derive(Debug, Args)]
struct GatewayArgs {
    #[arg(long, default_value = "http://127.0.0.1:8010")]
    gateway_url: String,
    #[arg(long, default_value = "-")]
    output: String,
    #[arg(long, default_value_t = 200)]
    limit: usize,
    #[arg(long)]
    follow: bool,
    #[arg(long, default_value_t = 1000)]
    poll_interval_ms: u64,
    #[arg(long, value_enum, default_value_t = OutputFormat::Line)]
    format: OutputFormat,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum OutputFormat {
    Line,
    Json,
}

#[derive(Debug, Clone, Copy)]
enum TraceMode {
    Diagnose,
    Project,
    Explain,
    Diff,
    Summary,
}

#[derive(Debug)]
struct CliFailure {
    code: u8,
    message: String,
}

/// Executes the parsed CLI and returns the process exit code; failures are
/// printed to stderr.
#[must_use]
pub fn run_cli(cli: Cli) -> u8 {
    match run(cli) {
        Ok(()) => 0,
        Err(failure) => {
            eprintln!("gwo: {}", failure.message);
            failure.code
        }
    }
}

fn run(cli: Cli) -> Result<(), CliFailure> {
    match cli.command {
        Command::Diagnose(args) => run_trace(TraceMode::Diagnose, &args),
        Command::Project(args) => run_trace(TraceMode::Project, &args),
        Command::Explain(args) => run_trace(TraceMode::Explain, &args),
        Command::Diff(args) => run_trace(TraceMode::Diff, &args),
        Command::Summary(args) => run_trace(TraceMode::Summary, &args),
        Command::Gateway(args) => run_gateway(&args),
    }
}

fn run_trace(mode: TraceMode, args: &TraceArgs) -> Result<(), CliFailure> {
    if matches!(mode, TraceMode::Diff) && args.reference.is_none() {
        return Err(CliFailure {
            code: 1,
            message: "diff requires --reference".to_string(),
        });
    }

    let expect_raw = matches!(mode, TraceMode::Project);
    let events = read_trace(&args.input, expect_raw)?;
    let reference = match &args.reference {
        Some(path) => Some(read_trace(path, false)?),
        None => None,
    };

    let events = diagnostics::apply_trace_diagnostics(events, reference.as_deref());
    let trace_diags = diagnostics::trace_diagnostics(&events, reference.as_deref());

    let mut output = open_output(&args.output).map_err(output_failure)?;
    match mode {
        TraceMode::Diagnose | TraceMode::Project => {
            trace::write_events(&events, &mut output).map_err(output_failure)?;
        }
        TraceMode::Explain => {
            write_lines(&render::explain_lines(&events, &trace_diags), &mut output)?;
        }
        TraceMode::Diff => {
            write_lines(&render::diff_lines(&events, &trace_diags), &mut output)?;
        }
        TraceMode::Summary => {
            write_lines(&render::summary_lines(&events), &mut output)?;
        }
    }
    output.flush().map_err(output_failure)
}

// Follows the gateway snapshot cursor, rendering one line per event. The
// fetch failure path deliberately shares exit code 2 with the digest
// pipeline: both mean the observation could not be derived.
fn run_gateway(args: &GatewayArgs) -> Result<(), CliFailure> {
    let client = reqwest::blocking::Client::new();
    let interval = Duration::from_millis(args.poll_interval_ms);
    let mut output = open_output(&args.output).map_err(output_failure)?;
    let mut offset: usize = 0;

    loop {
        let snapshot = fetch_snapshot(&client, &args.gateway_url, offset, args.limit)?;
        let items = snapshot_items(&snapshot)?;
        for item in items {
            let line = match args.format {
                OutputFormat::Json => canonical_line(item)?,
                OutputFormat::Line => gateway_line(item)?,
            };
            writeln!(output, "{line}").map_err(output_failure)?;
        }
        output.flush().map_err(output_failure)?;
        offset += items.len();
        if !args.follow {
            break;
        }
        if items.is_empty() {
            thread::sleep(interval);
        }
    }
    Ok(())
}

fn fetch_snapshot(
    client: &reqwest::blocking::Client,
    base_url: &str,
    offset: usize,
    limit: usize,
) -> Result<Value, CliFailure> {
    let url = format!(
        "{}/snapshot?offset={offset}&limit={limit}",
        base_url.trim_end_matches('/')
    );
    let fetch = || -> reqwest::Result<Value> {
        client.get(&url).send()?.error_for_status()?.json()
    };
    fetch().map_err(|err| CliFailure {
        code: 2,
        message: format!("gateway snapshot fetch failed: {err}"),
    })
}

fn snapshot_items(snapshot: &Value) -> Result<&Vec<Value>, CliFailure> {
    if let Some(items) = snapshot.as_array() {
        return Ok(items);
    }
    if let Some(items) = snapshot.get("events").and_then(Value::as_array) {
        return Ok(items);
    }
    Err(CliFailure {
        code: 2,
        message: "snapshot response is not a list or envelope".to_string(),
    })
}

fn gateway_line(event: &Value) -> Result<String, CliFailure> {
    let index = event.get("index").and_then(Value::as_i64).unwrap_or(-1);
    let empty = Value::Object(Map::new());
    let payload = event.get("payload").unwrap_or(&empty);
    let field = |key: &str| -> &str {
        payload
            .as_object()
            .and_then(|fields| fields.get(key))
            .and_then(Value::as_str)
            .unwrap_or("")
    };
    Ok(format!(
        "index={index} kind={} thread_id={} turn_id={} actor={} payload={}",
        field("kind"),
        field("thread_id"),
        field("turn_id"),
        field("actor"),
        canonical_line(payload)?
    ))
}

fn canonical_line(value: &Value) -> Result<String, CliFailure> {
    let bytes = canon::canonical_bytes(value).map_err(|err| CliFailure {
        code: 2,
        message: err.to_string(),
    })?;
    String::from_utf8(bytes).map_err(|err| CliFailure {
        code: 2,
        message: format!("canonical line is not UTF-8: {err}"),
    })
}

fn read_trace(path: &str, expect_raw: bool) -> Result<Vec<TraceEvent>, CliFailure> {
    let events = if path == "-" {
        let stdin = io::stdin();
        trace::read_events(stdin.lock(), expect_raw)
    } else {
        let file = File::open(path).map_err(|err| CliFailure {
            code: 2,
            message: format!("failed to open {path}: {err}"),
        })?;
        trace::read_events(BufReader::new(file), expect_raw)
    };
    events.map_err(|err| read_failure(&err))
}

fn open_output(path: &str) -> io::Result<Box<dyn Write>> {
    if path == "-" {
        Ok(Box::new(io::stdout()))
    } else {
        Ok(Box::new(File::create(path)?))
    }
}

fn write_lines(lines: &[String], output: &mut dyn Write) -> Result<(), CliFailure> {
    for line in lines {
        writeln!(output, "{line}").map_err(output_failure)?;
    }
    Ok(())
}

fn read_failure(err: &ObserverError) -> CliFailure {
    let code = match err {
        ObserverError::InvalidInput(_) => 1,
        _ => 2,
    };
    CliFailure {
        code,
        message: err.to_string(),
    }
}

fn output_failure(err: impl std::fmt::Display) -> CliFailure {
    CliFailure {
        code: 3,
        message: format!("output write failed: {err}"),
    }
}
