use std::collections::BTreeMap;

use crate::diagnostics::DIAG_REFERENCE_DIGEST_MISMATCH;
use crate::trace::TraceEvent;

/// One explanation line per event, preceded by the trace-level labels when
/// any fired.
#[must_use]
pub fn explain_lines(events: &[TraceEvent], trace_diags: &[String]) -> Vec<String> {
    let mut lines = Vec::new();
    if !trace_diags.is_empty() {
        lines.push(format!("trace_diagnostics=[{}]", trace_diags.join(",")));
    }
    for event in events {
        lines.push(event_line(event));
    }
    lines
}

/// Like [`explain_lines`] but keeps only events whose digest disagrees with
/// the reference trace.
#[must_use]
pub fn diff_lines(events: &[TraceEvent], trace_diags: &[String]) -> Vec<String> {
    let mut lines = Vec::new();
    if !trace_diags.is_empty() {
        lines.push(format!("trace_diagnostics=[{}]", trace_diags.join(",")));
    }
    for event in events {
        if event
            .diagnostics
            .iter()
            .any(|label| label == DIAG_REFERENCE_DIGEST_MISMATCH)
        {
            lines.push(event_line(event));
        }
    }
    lines
}

/// Total count plus per-source and per-artifact tallies, sorted by key.
#[must_use]
pub fn summary_lines(events: &[TraceEvent]) -> Vec<String> {
    let mut source_counts: BTreeMap<&str, usize> = BTreeMap::new();
    let mut artifact_counts: BTreeMap<&str, usize> = BTreeMap::new();
    for event in events {
        *source_counts.entry(event.source.as_str()).or_insert(0) += 1;
        *artifact_counts.entry(event.artifact.as_str()).or_insert(0) += 1;
    }

    let mut lines = vec![format!("total_events={}", events.len())];
    for (source, count) in &source_counts {
        lines.push(format!("source={source} count={count}"));
    }
    for (artifact, count) in &artifact_counts {
        lines.push(format!("artifact={artifact} count={count}"));
    }
    lines
}

fn event_line(event: &TraceEvent) -> String {
    format!(
        "event_id={} source={} artifact={} canon_len={} digest={} diagnostics=[{}]",
        event.event_id,
        event.source,
        event.artifact,
        event.canon_len,
        event.digest,
        event.diagnostics.join(",")
    )
}
