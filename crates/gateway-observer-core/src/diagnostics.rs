use std::collections::{BTreeSet, HashMap};

use crate::trace::TraceEvent;

// Frozen v1 diagnostic vocabulary. Emitting any label outside this set is a
// bug. The engine only describes what it saw; it never rejects a trace.

pub const DIAG_DUPLICATE_EVENT_ID: &str = "duplicate_event_id_observed";
pub const DIAG_NON_MONOTONIC_EVENT_ID: &str = "non_monotonic_event_id_observed";
pub const DIAG_ORDERING_GAP: &str = "ordering_gap_observed";
pub const DIAG_CANON_LEN_MISMATCH: &str = "canon_len_mismatch_observed";
pub const DIAG_DIGEST_MISMATCH: &str = "digest_mismatch_observed";
pub const DIAG_REFERENCE_LENGTH_MISMATCH: &str = "reference_length_mismatch_observed";
pub const DIAG_REFERENCE_EVENT_ID_SET_MISMATCH: &str = "reference_event_id_set_mismatch_observed";
pub const DIAG_REFERENCE_ORDER_MISMATCH: &str = "reference_order_mismatch_observed";
pub const DIAG_REFERENCE_DIGEST_MISMATCH: &str = "reference_digest_mismatch_observed";

pub const DIAGNOSTICS_V1: [&str; 9] = [
    DIAG_DUPLICATE_EVENT_ID,
    DIAG_NON_MONOTONIC_EVENT_ID,
    DIAG_ORDERING_GAP,
    DIAG_CANON_LEN_MISMATCH,
    DIAG_DIGEST_MISMATCH,
    DIAG_REFERENCE_LENGTH_MISMATCH,
    DIAG_REFERENCE_EVENT_ID_SET_MISMATCH,
    DIAG_REFERENCE_ORDER_MISMATCH,
    DIAG_REFERENCE_DIGEST_MISMATCH,
];

/// Trace-level labels. Emitted only when a reference trace is supplied and
/// the subject trace is non-empty. Length, set, and order predicates are
/// independent; the order label fires only when the id sets already match.
#[must_use]
pub fn trace_diagnostics(
    events: &[TraceEvent],
    reference: Option<&[TraceEvent]>,
) -> Vec<String> {
    let Some(reference) = reference else {
        return Vec::new();
    };
    if events.is_empty() {
        return Vec::new();
    }

    let mut labels = Vec::new();
    if events.len() != reference.len() {
        labels.push(DIAG_REFERENCE_LENGTH_MISMATCH.to_string());
    }

    let ids: Vec<u64> = events.iter().map(|event| event.event_id).collect();
    let reference_ids: Vec<u64> = reference.iter().map(|event| event.event_id).collect();
    let id_set: BTreeSet<u64> = ids.iter().copied().collect();
    let reference_id_set: BTreeSet<u64> = reference_ids.iter().copied().collect();

    if id_set != reference_id_set {
        labels.push(DIAG_REFERENCE_EVENT_ID_SET_MISMATCH.to_string());
    } else if ids != reference_ids {
        labels.push(DIAG_REFERENCE_ORDER_MISMATCH.to_string());
    }

    labels
}

/// Attaches per-event labels over the whole trace in file order: duplicate
/// ids, non-monotonic ids, ordering gaps, and (only when both traces agree
/// on `event_id` order) per-index reference digest mismatches. Existing labels
/// (canonical recomputation mismatches from parsing) stay in front.
#[must_use]
pub fn apply_trace_diagnostics(
    mut events: Vec<TraceEvent>,
    reference: Option<&[TraceEvent]>,
) -> Vec<TraceEvent> {
    if events.is_empty() {
        return events;
    }

    let mut id_counts: HashMap<u64, usize> = HashMap::new();
    for event in &events {
        *id_counts.entry(event.event_id).or_insert(0) += 1;
    }

    let mut digest_mismatch_ids: BTreeSet<u64> = BTreeSet::new();
    if let Some(reference) = reference {
        let order_matches = events.len() == reference.len()
            && events
                .iter()
                .zip(reference)
                .all(|(event, reference_event)| event.event_id == reference_event.event_id);
        if order_matches {
            for (event, reference_event) in events.iter().zip(reference) {
                if event.digest != reference_event.digest {
                    digest_mismatch_ids.insert(event.event_id);
                }
            }
        }
    }

    let mut prev_id: Option<u64> = None;
    for event in &mut events {
        if id_counts.get(&event.event_id).copied().unwrap_or(0) > 1 {
            event.diagnostics.push(DIAG_DUPLICATE_EVENT_ID.to_string());
        }
        if let Some(prev) = prev_id {
            if event.event_id <= prev {
                event
                    .diagnostics
                    .push(DIAG_NON_MONOTONIC_EVENT_ID.to_string());
            } else if event.event_id > prev + 1 {
                event.diagnostics.push(DIAG_ORDERING_GAP.to_string());
            }
        }
        if digest_mismatch_ids.contains(&event.event_id) {
            event
                .diagnostics
                .push(DIAG_REFERENCE_DIGEST_MISMATCH.to_string());
        }
        prev_id = Some(event.event_id);
    }

    events
}
