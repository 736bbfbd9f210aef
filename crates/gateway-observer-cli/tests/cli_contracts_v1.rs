use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use serde_json::{json, Value};
use ulid::Ulid;

fn gwo_binary_path() -> PathBuf {
    match std::env::var("CARGO_BIN_EXE_gwo") {
        Ok(value) => PathBuf::from(value),
        Err(_) => {
            let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../target/debug/gwo");
            if !path.exists() {
                let status = Command::new("cargo")
                    .args(["build", "-p", "gateway-observer-cli", "--bin", "gwo"])
                    .status();
                match status {
                    Ok(value) if value.success() => {}
                    Ok(value) => panic!("failed to build gwo binary (status={value})"),
                    Err(err) => panic!("failed to invoke cargo build: {err}"),
                }
            }
            path
        }
    }
}

fn gwo_output(args: &[&str]) -> Output {
    let mut command = Command::new(gwo_binary_path());
    for arg in args {
        command.arg(arg);
    }
    match command.output() {
        Ok(output) => output,
        Err(err) => panic!("failed to run gwo command {args:?}: {err}"),
    }
}

fn temp_file(label: &str, contents: &str) -> PathBuf {
    let path = std::env::temp_dir().join(format!("gwo-{label}-{}.jsonl", Ulid::new()));
    if let Err(err) = fs::write(&path, contents) {
        panic!("failed to write fixture {}: {err}", path.display());
    }
    path
}

fn raw_line(event_id: u64, payload: Value) -> String {
    json!({
        "event_id": event_id,
        "source": "gateway",
        "artifact": "gateway_event",
        "payload": payload,
    })
    .to_string()
}

fn stdout_lines(output: &Output) -> Vec<String> {
    String::from_utf8_lossy(&output.stdout)
        .lines()
        .map(str::to_string)
        .collect()
}

#[test]
fn help_contract_lists_expected_subcommands() {
    let output = gwo_output(&["--help"]);
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    for required in ["diagnose", "project", "explain", "diff", "summary", "gateway"] {
        assert!(
            stdout.contains(required),
            "expected help output to contain subcommand {required}; output={stdout}"
        );
    }
}

#[test]
fn project_emits_strict_trace_lines_for_raw_input() {
    let input = temp_file(
        "project-in",
        &format!(
            "{}\n{}\n",
            raw_line(1, json!({"b": 2, "a": 1})),
            raw_line(2, json!({}))
        ),
    );
    let output = gwo_output(&["project", "--input", &input.to_string_lossy()]);
    assert_eq!(output.status.code(), Some(0));

    let lines = stdout_lines(&output);
    assert_eq!(lines.len(), 2);
    for line in &lines {
        let value: Value = match serde_json::from_str(line) {
            Ok(value) => value,
            Err(err) => panic!("trace line is not JSON: {err}; line={line}"),
        };
        let Some(object) = value.as_object() else {
            panic!("trace line is not an object: {line}");
        };
        assert_eq!(object.len(), 7);
        for key in [
            "event_id",
            "source",
            "artifact",
            "payload",
            "canon_len",
            "digest",
            "diagnostics",
        ] {
            assert!(object.contains_key(key), "missing {key} in {line}");
        }
    }
    // Canonical line encoding writes keys alphabetically.
    assert!(lines[0].starts_with(r#"{"artifact":"gateway_event","canon_len":13,"#));
    assert!(lines[0].contains(r#""payload":{"a":1,"b":2}"#));

    let _ = fs::remove_file(&input);
}

#[test]
fn project_accepts_a_snapshot_envelope() {
    let envelope = json!({
        "events": [
            {"index": 4, "payload": {"kind": "decision"}},
            {"index": 5, "payload": {"kind": "execution"}},
        ],
        "offset": 4,
        "limit": 2,
    });
    let input = temp_file("envelope-in", &format!("{envelope}\n"));
    let output = gwo_output(&["project", "--input", &input.to_string_lossy()]);
    assert_eq!(output.status.code(), Some(0));
    let lines = stdout_lines(&output);
    assert_eq!(lines.len(), 2);
    assert!(lines[0].contains(r#""event_id":4"#));
    assert!(lines[1].contains(r#""event_id":5"#));

    let _ = fs::remove_file(&input);
}

#[test]
fn diagnose_round_trips_its_own_output() {
    let input = temp_file("diagnose-in", &format!("{}\n", raw_line(1, json!({"k": "v"}))));
    let projected = gwo_output(&["project", "--input", &input.to_string_lossy()]);
    assert_eq!(projected.status.code(), Some(0));

    let trace_path = temp_file("diagnose-trace", &String::from_utf8_lossy(&projected.stdout));
    let diagnosed = gwo_output(&["diagnose", "--input", &trace_path.to_string_lossy()]);
    assert_eq!(diagnosed.status.code(), Some(0));
    assert_eq!(stdout_lines(&diagnosed), stdout_lines(&projected));

    let _ = fs::remove_file(&input);
    let _ = fs::remove_file(&trace_path);
}

#[test]
fn explain_renders_ordering_diagnostics() {
    let input = temp_file(
        "explain-in",
        &format!(
            "{}\n{}\n{}\n",
            raw_line(1, json!({})),
            raw_line(5, json!({})),
            raw_line(3, json!({}))
        ),
    );
    let projected = gwo_output(&["project", "--input", &input.to_string_lossy()]);
    let trace_path = temp_file("explain-trace", &String::from_utf8_lossy(&projected.stdout));

    let output = gwo_output(&["explain", "--input", &trace_path.to_string_lossy()]);
    assert_eq!(output.status.code(), Some(0));
    let lines = stdout_lines(&output);
    assert_eq!(lines.len(), 3);
    assert!(lines[1].contains("diagnostics=[ordering_gap_observed]"));
    assert!(lines[2].contains("diagnostics=[non_monotonic_event_id_observed]"));

    let _ = fs::remove_file(&input);
    let _ = fs::remove_file(&trace_path);
}

#[test]
fn explain_with_reordered_reference_reports_order_mismatch() {
    let subject_raw = temp_file(
        "order-subject-raw",
        &format!(
            "{}\n{}\n{}\n",
            raw_line(1, json!({"n": 1})),
            raw_line(2, json!({"n": 2})),
            raw_line(3, json!({"n": 3}))
        ),
    );
    let reference_raw = temp_file(
        "order-reference-raw",
        &format!(
            "{}\n{}\n{}\n",
            raw_line(1, json!({"n": 1})),
            raw_line(3, json!({"n": 3})),
            raw_line(2, json!({"n": 2}))
        ),
    );
    let subject = gwo_output(&["project", "--input", &subject_raw.to_string_lossy()]);
    let reference = gwo_output(&["project", "--input", &reference_raw.to_string_lossy()]);
    let subject_path = temp_file("order-subject", &String::from_utf8_lossy(&subject.stdout));
    let reference_path = temp_file("order-reference", &String::from_utf8_lossy(&reference.stdout));

    let output = gwo_output(&[
        "explain",
        "--input",
        &subject_path.to_string_lossy(),
        "--reference",
        &reference_path.to_string_lossy(),
    ]);
    assert_eq!(output.status.code(), Some(0));
    let lines = stdout_lines(&output);
    assert_eq!(
        lines[0],
        "trace_diagnostics=[reference_order_mismatch_observed]"
    );
    // Order disagreement suppresses per-event digest comparison.
    for line in &lines[1..] {
        assert!(!line.contains("reference_digest_mismatch_observed"));
    }

    for path in [subject_raw, reference_raw, subject_path, reference_path] {
        let _ = fs::remove_file(path);
    }
}

#[test]
fn diff_lists_only_digest_divergence() {
    let subject_raw = temp_file(
        "diff-subject-raw",
        &format!(
            "{}\n{}\n",
            raw_line(1, json!({"n": 1})),
            raw_line(2, json!({"n": 2}))
        ),
    );
    let reference_raw = temp_file(
        "diff-reference-raw",
        &format!(
            "{}\n{}\n",
            raw_line(1, json!({"n": 1})),
            raw_line(2, json!({"n": 99}))
        ),
    );
    let subject = gwo_output(&["project", "--input", &subject_raw.to_string_lossy()]);
    let reference = gwo_output(&["project", "--input", &reference_raw.to_string_lossy()]);
    let subject_path = temp_file("diff-subject", &String::from_utf8_lossy(&subject.stdout));
    let reference_path = temp_file("diff-reference", &String::from_utf8_lossy(&reference.stdout));

    let output = gwo_output(&[
        "diff",
        "--input",
        &subject_path.to_string_lossy(),
        "--reference",
        &reference_path.to_string_lossy(),
    ]);
    assert_eq!(output.status.code(), Some(0));
    let lines = stdout_lines(&output);
    assert_eq!(lines.len(), 1);
    assert!(lines[0].starts_with("event_id=2 "));
    assert!(lines[0].contains("reference_digest_mismatch_observed"));

    for path in [subject_raw, reference_raw, subject_path, reference_path] {
        let _ = fs::remove_file(path);
    }
}

#[test]
fn summary_tallies_sources_and_artifacts() {
    let input = temp_file(
        "summary-in",
        &format!(
            "{}\n{}\n",
            json!({
                "event_id": 1,
                "source": "alpha",
                "artifact": "reply",
                "payload": {},
            }),
            json!({
                "event_id": 2,
                "source": "beta",
                "artifact": "reply",
                "payload": {},
            })
        ),
    );
    let projected = gwo_output(&["project", "--input", &input.to_string_lossy()]);
    let trace_path = temp_file("summary-trace", &String::from_utf8_lossy(&projected.stdout));

    let output = gwo_output(&["summary", "--input", &trace_path.to_string_lossy()]);
    assert_eq!(output.status.code(), Some(0));
    assert_eq!(
        stdout_lines(&output),
        vec![
            "total_events=2",
            "source=alpha count=1",
            "source=beta count=1",
            "artifact=reply count=2",
        ]
    );

    let _ = fs::remove_file(&input);
    let _ = fs::remove_file(&trace_path);
}

#[test]
fn invalid_json_input_exits_1() {
    let input = temp_file("bad-json", "{not json\n");
    let output = gwo_output(&["project", "--input", &input.to_string_lossy()]);
    assert_eq!(output.status.code(), Some(1));
    let _ = fs::remove_file(&input);
}

#[test]
fn diff_without_reference_exits_1() {
    let output = gwo_output(&["diff", "--input", "-"]);
    assert_eq!(output.status.code(), Some(1));
}

#[test]
fn float_payload_exits_2() {
    let input = temp_file("float-payload", &format!("{}\n", raw_line(1, json!({"x": 1.5}))));
    let output = gwo_output(&["project", "--input", &input.to_string_lossy()]);
    assert_eq!(output.status.code(), Some(2));
    let _ = fs::remove_file(&input);
}

#[test]
fn unwritable_output_exits_3() {
    let input = temp_file("out-fail-in", &format!("{}\n", raw_line(1, json!({}))));
    let missing_dir = std::env::temp_dir().join(format!("gwo-missing-{}/out.jsonl", Ulid::new()));
    let output = gwo_output(&[
        "project",
        "--input",
        &input.to_string_lossy(),
        "--output",
        &missing_dir.to_string_lossy(),
    ]);
    assert_eq!(output.status.code(), Some(3));
    let _ = fs::remove_file(&input);
}
