use std::sync::{Mutex, PoisonError};

use serde::Serialize;
use serde_json::Value;

use crate::canon;
use crate::error::ObserverError;
use crate::event::ObservedEvent;
use crate::projection::{LatencySummary, ProjectionIndex, ThreadSummary, TurnSummary};
use crate::signal::{self, Signal, SignalSeverity, SignalThresholds};
use crate::store::EventStore;

/// Default page size for [`Observer::tail`].
pub const DEFAULT_TAIL_LIMIT: usize = 200;

const ENVELOPE_KEYS: [&str; 3] = ["events", "offset", "limit"];

/// Outcome of one ingest batch. The batch is processed item by item; the
/// first invalid item halts it, and everything accepted before the halt
/// stays durable.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct IngestReport {
    pub accepted: usize,
    pub rejected_at: Option<usize>,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct SignalCounts {
    pub info: usize,
    pub warn: usize,
    pub critical: usize,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct StatusSummary {
    pub event_count: u64,
    pub thread_count: usize,
    pub turn_count: usize,
    pub decision_count: u64,
    pub allow_count: u64,
    pub deny_count: u64,
    pub error_count: u64,
    pub deny_rate: f64,
    pub latency: LatencySummary,
    pub active_signals: SignalCounts,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ThreadDetail {
    pub thread: ThreadSummary,
    pub turns: Vec<TurnSummary>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct TailPage {
    pub events: Vec<ObservedEvent>,
    pub next_cursor: u64,
}

/// Process-lifetime handle over the event store and projection index.
///
/// Constructed explicitly at startup and passed around as a handle; test
/// suites build fresh instances per test. Ingest batches are serialized by
/// an internal mutex, so concurrent callers never interleave appends; reads
/// proceed concurrently against consistent snapshots.
#[derive(Debug, Default)]
pub struct Observer {
    store: EventStore,
    projection: ProjectionIndex,
    thresholds: SignalThresholds,
    ingest_serial: Mutex<()>,
}

impl Observer {
    #[must_use]
    pub fn new(thresholds: SignalThresholds) -> Self {
        Self {
            store: EventStore::new(),
            projection: ProjectionIndex::new(),
            thresholds,
            ingest_serial: Mutex::new(()),
        }
    }

    #[must_use]
    pub fn store(&self) -> &EventStore {
        &self.store
    }

    #[must_use]
    pub fn projection(&self) -> &ProjectionIndex {
        &self.projection
    }

    /// Ingests one gateway snapshot envelope in array order.
    ///
    /// Item pipeline: normalize (`index` becomes `event_id`), require a
    /// canonical-safe payload, append to the store (strictly monotonic
    /// `event_id`), then project. The first failing item halts the batch and
    /// is reported through the returned [`IngestReport`].
    ///
    /// # Errors
    /// Returns [`ObserverError::InvalidInput`] when the envelope itself is
    /// malformed (not an object, unknown top-level key, `events` missing or
    /// not an array); item failures are reported, not returned.
    pub fn ingest(&self, envelope: &Value) -> Result<IngestReport, ObserverError> {
        let _serial = self
            .ingest_serial
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let events = parse_envelope(envelope)?;

        let mut accepted = 0;
        for (position, raw) in events.iter().enumerate() {
            if let Err(err) = self.ingest_item(raw) {
                return Ok(IngestReport {
                    accepted,
                    rejected_at: Some(position),
                    reason: Some(err.code().to_string()),
                });
            }
            accepted += 1;
        }
        Ok(IngestReport {
            accepted,
            rejected_at: None,
            reason: None,
        })
    }

    fn ingest_item(&self, raw: &Value) -> Result<(), ObserverError> {
        let event = ObservedEvent::from_gateway(raw)?;
        canon::validate(&event.payload)?;
        self.store.append(event.clone())?;
        self.projection.on_event(&event);
        Ok(())
    }

    #[must_use]
    pub fn status(&self) -> StatusSummary {
        let metrics = self.projection.metrics();
        let mut active = SignalCounts::default();
        for signal in self.signals() {
            match signal.severity {
                SignalSeverity::Info => active.info += 1,
                SignalSeverity::Warn => active.warn += 1,
                SignalSeverity::Critical => active.critical += 1,
            }
        }
        StatusSummary {
            event_count: metrics.event_count,
            thread_count: metrics.thread_count,
            turn_count: metrics.turn_count,
            decision_count: metrics.decision_count,
            allow_count: metrics.allow_count,
            deny_count: metrics.deny_count,
            error_count: metrics.error_count,
            deny_rate: metrics.deny_rate,
            latency: metrics.latency,
            active_signals: active,
        }
    }

    #[must_use]
    pub fn threads(&self) -> Vec<ThreadSummary> {
        self.projection.threads()
    }

    /// Thread summary plus its turns ordered by `first_event_id`.
    ///
    /// # Errors
    /// Returns [`ObserverError::NotFound`] for an unknown thread id.
    pub fn thread(&self, thread_id: &str) -> Result<ThreadDetail, ObserverError> {
        let Some(thread) = self.projection.thread(thread_id) else {
            return Err(ObserverError::NotFound(format!(
                "unknown thread: {thread_id}"
            )));
        };
        Ok(ThreadDetail {
            thread,
            turns: self.projection.turns_for_thread(thread_id),
        })
    }

    #[must_use]
    pub fn signals(&self) -> Vec<Signal> {
        signal::evaluate(&self.projection.signal_snapshot(), &self.thresholds)
    }

    /// Stored events with `event_id` above the cursor, capped by `limit`.
    /// `next_cursor` is the last returned `event_id`, or the request cursor
    /// echoed back when the page is empty.
    #[must_use]
    pub fn tail(&self, after_event_id: Option<u64>, limit: Option<usize>) -> TailPage {
        let events = self
            .store
            .tail(after_event_id, limit.unwrap_or(DEFAULT_TAIL_LIMIT));
        let next_cursor = events
            .last()
            .map(|event| event.event_id)
            .or(after_event_id)
            .unwrap_or(0);
        TailPage {
            events,
            next_cursor,
        }
    }
}

fn parse_envelope(envelope: &Value) -> Result<&Vec<Value>, ObserverError> {
    let Some(object) = envelope.as_object() else {
        return Err(ObserverError::InvalidInput(
            "snapshot envelope must be an object".to_string(),
        ));
    };
    for key in object.keys() {
        if !ENVELOPE_KEYS.contains(&key.as_str()) {
            return Err(ObserverError::InvalidInput(format!(
                "unknown envelope field: {key}"
            )));
        }
    }
    let Some(events) = object.get("events").and_then(Value::as_array) else {
        return Err(ObserverError::InvalidInput(
            "envelope events must be an array".to_string(),
        ));
    };
    for key in ["offset", "limit"] {
        if let Some(value) = object.get(key) {
            if !value.is_null() && value.as_u64().is_none() {
                return Err(ObserverError::InvalidInput(format!(
                    "envelope {key} must be a non-negative integer"
                )));
            }
        }
    }
    Ok(events)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::projection::DUPLICATE_DECISION_MARKER;
    use serde_json::json;

    fn must_ingest(observer: &Observer, envelope: &Value) -> IngestReport {
        match observer.ingest(envelope) {
            Ok(report) => report,
            Err(err) => panic!("expected envelope to be accepted: {err}"),
        }
    }

    fn must_full(report: &IngestReport) {
        assert_eq!(
            report.rejected_at, None,
            "expected full batch, got {report:?}"
        );
    }

    #[test]
    fn empty_observer_reports_empty_status() {
        let observer = Observer::default();
        let status = observer.status();
        assert_eq!(status.event_count, 0);
        assert!((status.deny_rate - 0.0).abs() < f64::EPSILON);
        assert_eq!(status.latency, LatencySummary::empty());
        assert_eq!(status.active_signals, SignalCounts::default());
        assert!(observer.signals().is_empty());
        assert!(observer.threads().is_empty());
    }

    #[test]
    fn allow_deny_batch_rolls_up_into_status() {
        let observer = Observer::default();
        let report = must_ingest(
            &observer,
            &json!({"events": [
                {"index": 1, "payload": {"thread_id": "T1", "kind": "decision",
                 "decision_result": "ALLOW", "latency_ms": 100}},
                {"index": 2, "payload": {"thread_id": "T1", "kind": "execution"}},
                {"index": 3, "payload": {"thread_id": "T1", "kind": "decision",
                 "decision_result": "DENY", "latency_ms": 200}},
                {"index": 4, "payload": {"thread_id": "T1", "kind": "error"}},
            ]}),
        );
        must_full(&report);
        assert_eq!(report.accepted, 4);

        let status = observer.status();
        assert_eq!(status.event_count, 4);
        assert_eq!(status.thread_count, 1);
        assert_eq!(status.turn_count, 0);
        assert_eq!(status.allow_count, 1);
        assert_eq!(status.deny_count, 1);
        assert_eq!(status.error_count, 1);
        assert!((status.deny_rate - 0.5).abs() < f64::EPSILON);
        assert_eq!(status.latency.count, 2);
        assert_eq!(status.latency.p50, Some(100));
        assert_eq!(status.latency.p95, Some(200));
    }

    #[test]
    fn turn_aggregation_surfaces_duplicate_marker() {
        let observer = Observer::default();
        must_full(&must_ingest(
            &observer,
            &json!({"events": [
                {"index": 1, "payload": {"thread_id": "T", "turn_id": "U", "kind": "decision",
                 "decision_result": "ALLOW", "latency_ms": 50}},
                {"index": 2, "payload": {"thread_id": "T", "turn_id": "U", "kind": "execution"}},
                {"index": 3, "payload": {"thread_id": "T", "turn_id": "U", "kind": "decision",
                 "decision_result": "DENY"}},
            ]}),
        ));

        let detail = match observer.thread("T") {
            Ok(detail) => detail,
            Err(err) => panic!("expected thread to exist: {err}"),
        };
        assert_eq!(detail.turns.len(), 1);
        let turn = &detail.turns[0];
        assert_eq!(
            turn.decision_result,
            Some(crate::event::DecisionResult::Allow)
        );
        assert_eq!(turn.latency_ms, Some(50));
        assert!(turn.has_execution);
        assert_eq!(turn.markers, vec![DUPLICATE_DECISION_MARKER.to_string()]);
        assert_eq!(detail.thread.allow_total, 1);
        assert_eq!(detail.thread.deny_total, 1);
    }

    #[test]
    fn non_monotonic_item_halts_the_batch_and_keeps_the_prefix() {
        let observer = Observer::default();
        must_full(&must_ingest(&observer, &json!({"events": [{"index": 10}]})));

        let report = must_ingest(
            &observer,
            &json!({"events": [
                {"index": 11}, {"index": 12}, {"index": 9}, {"index": 13},
            ]}),
        );
        assert_eq!(report.accepted, 2);
        assert_eq!(report.rejected_at, Some(2));
        assert_eq!(report.reason.as_deref(), Some("non_monotonic_ingest"));
        assert_eq!(observer.store().last_event_id(), Some(12));
        assert_eq!(observer.store().size(), 3);
    }

    #[test]
    fn float_payload_halts_with_canonicalization_error() {
        let observer = Observer::default();
        let report = must_ingest(
            &observer,
            &json!({"events": [
                {"index": 1},
                {"index": 2, "payload": {"score": 0.5}},
                {"index": 3},
            ]}),
        );
        assert_eq!(report.accepted, 1);
        assert_eq!(report.rejected_at, Some(1));
        assert_eq!(report.reason.as_deref(), Some("canonicalization_error"));
        assert_eq!(observer.store().size(), 1);
    }

    #[test]
    fn missing_index_halts_with_invalid_input() {
        let observer = Observer::default();
        let report = must_ingest(
            &observer,
            &json!({"events": [{"index": 1}, {"payload": {"kind": "decision"}}]}),
        );
        assert_eq!(report.rejected_at, Some(1));
        assert_eq!(report.reason.as_deref(), Some("invalid_input"));
    }

    #[test]
    fn unknown_envelope_field_is_rejected_outright() {
        let observer = Observer::default();
        let err = match observer.ingest(&json!({"events": [], "surprise": 1})) {
            Ok(report) => panic!("expected envelope rejection, got {report:?}"),
            Err(err) => err,
        };
        assert_eq!(err.code(), "invalid_input");
        assert!(observer
            .ingest(&json!({"events": [], "offset": 0, "limit": 200}))
            .is_ok());
        assert!(observer.ingest(&json!({"events": {}})).is_err());
        assert!(observer.ingest(&json!({"events": [], "offset": -1})).is_err());
    }

    #[test]
    fn unknown_thread_is_not_found() {
        let observer = Observer::default();
        let err = match observer.thread("missing") {
            Ok(detail) => panic!("expected not_found, got {detail:?}"),
            Err(err) => err,
        };
        assert_eq!(err.code(), "not_found");
    }

    #[test]
    fn tail_pages_with_cursor() {
        let observer = Observer::default();
        must_full(&must_ingest(
            &observer,
            &json!({"events": [
                {"index": 1}, {"index": 2}, {"index": 5}, {"index": 8},
            ]}),
        ));

        let page = observer.tail(Some(1), Some(2));
        let ids: Vec<u64> = page.events.iter().map(|event| event.event_id).collect();
        assert_eq!(ids, vec![2, 5]);
        assert_eq!(page.next_cursor, 5);

        let rest = observer.tail(Some(page.next_cursor), None);
        assert_eq!(rest.events.len(), 1);
        assert_eq!(rest.next_cursor, 8);

        let empty = observer.tail(Some(8), None);
        assert!(empty.events.is_empty());
        assert_eq!(empty.next_cursor, 8);
    }

    #[test]
    fn replaying_the_store_reproduces_live_projection() {
        let observer = Observer::default();
        must_full(&must_ingest(
            &observer,
            &json!({"events": [
                {"index": 1, "payload": {"thread_id": "T1", "turn_id": "U1", "kind": "decision",
                 "decision_result": "ALLOW", "latency_ms": 10, "actor": "alice"}},
                {"index": 2, "payload": {"thread_id": "T1", "turn_id": "U1", "kind": "execution"}},
                {"index": 3, "payload": {"kind": "policy_change", "policy_version": "v2"}},
                {"index": 4, "payload": {"thread_id": "T2", "kind": "error", "actor": "bob"}},
            ]}),
        ));

        let replayed = ProjectionIndex::new();
        for event in observer.store().all() {
            replayed.on_event(&event);
        }
        assert_eq!(observer.projection().metrics(), replayed.metrics());
        assert_eq!(observer.projection().threads(), replayed.threads());
        assert_eq!(observer.projection().actors(), replayed.actors());
        assert_eq!(
            observer.projection().policy_windows(),
            replayed.policy_windows()
        );
    }

    #[test]
    fn signal_counts_surface_in_status() {
        let observer = Observer::default();
        let events: Vec<Value> = (1..=20)
            .map(|index| {
                json!({
                    "index": index,
                    "payload": {
                        "thread_id": "T1",
                        "kind": "decision",
                        "decision_result": if index % 2 == 0 { "DENY" } else { "ALLOW" },
                    },
                })
            })
            .collect();
        must_full(&must_ingest(&observer, &json!({ "events": events })));

        let status = observer.status();
        assert_eq!(status.decision_count, 20);
        assert_eq!(status.active_signals.critical, 1);
        let signals = observer.signals();
        assert_eq!(signals.len(), 1);
        assert_eq!(signals[0].name, "deny_rate_critical");
    }
}
