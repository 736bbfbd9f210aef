use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::{PoisonError, RwLock};

use serde::Serialize;

use crate::event::{DecisionResult, EventKind, ObservedEvent};

/// Bounded reservoir size for decision latency samples.
pub const MAX_LATENCY_SAMPLES: usize = 5000;

/// Per-turn marker attached when a second decision event is observed for the
/// same turn. Surfaced only through the turn query surface; deliberately not
/// part of the frozen wire diagnostics vocabulary.
pub const DUPLICATE_DECISION_MARKER: &str = "duplicate_decision_observed";

// Per-thread window consulted by the error-cluster signal rule.
const THREAD_RECENT_WINDOW: usize = 20;

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct TurnSummary {
    pub turn_id: String,
    pub thread_id: Option<String>,
    pub parent_turn_id: Option<String>,
    pub decision_result: Option<DecisionResult>,
    pub latency_ms: Option<u64>,
    pub has_execution: bool,
    pub has_error: bool,
    pub first_event_id: u64,
    pub last_event_id: u64,
    pub markers: Vec<String>,
    #[serde(skip)]
    decision_seen: bool,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ThreadSummary {
    pub thread_id: String,
    pub turns_total: u64,
    pub deny_total: u64,
    pub allow_total: u64,
    pub error_total: u64,
    pub first_event_id: u64,
    pub last_event_id: u64,
    pub last_observed_at: i64,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ActorSummary {
    pub actor: String,
    pub event_count: u64,
    pub deny_count: u64,
    pub allow_count: u64,
    pub error_count: u64,
    pub last_observed_at: i64,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct PolicyWindow {
    pub policy_version: Option<String>,
    pub started_at_event_id: u64,
    /// `None` while the window is still open.
    pub ended_at_event_id: Option<u64>,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub struct LatencySummary {
    pub count: usize,
    pub p50: Option<u64>,
    pub p95: Option<u64>,
    pub p99: Option<u64>,
}

impl LatencySummary {
    #[must_use]
    pub fn empty() -> Self {
        Self {
            count: 0,
            p50: None,
            p95: None,
            p99: None,
        }
    }
}

/// Aggregates consumed by `status()`.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ProjectionMetrics {
    pub event_count: u64,
    pub thread_count: usize,
    pub turn_count: usize,
    pub decision_count: u64,
    pub allow_count: u64,
    pub deny_count: u64,
    pub error_count: u64,
    pub deny_rate: f64,
    pub latency: LatencySummary,
}

/// Input of the signal evaluator: everything the rules consult, captured
/// under one lock so a single evaluation sees one consistent prefix.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct SignalSnapshot {
    pub decision_count: u64,
    pub deny_count: u64,
    pub error_count: u64,
    pub last_event_id: Option<u64>,
    pub latency: LatencySummary,
    pub threads: Vec<ThreadErrorWindow>,
    pub policy_window_starts: Vec<u64>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ThreadErrorWindow {
    pub thread_id: String,
    pub error_total: u64,
    /// Errors among the thread's last 20 events.
    pub recent_error_total: u64,
}

/// Incremental aggregator over the stored event sequence.
///
/// Driven exclusively by [`ProjectionIndex::on_event`] in append order.
/// Every summary is a pure function of the event prefix seen so far:
/// replaying the same prefix into a fresh index reproduces identical state.
/// `on_event` never fails; malformed events are filtered upstream.
#[derive(Debug, Default)]
pub struct ProjectionIndex {
    inner: RwLock<ProjectionInner>,
}

#[derive(Debug, Default)]
struct ProjectionInner {
    event_count: u64,
    decision_count: u64,
    allow_count: u64,
    deny_count: u64,
    error_count: u64,
    last_event_id: Option<u64>,
    turns: BTreeMap<String, TurnSummary>,
    threads: BTreeMap<String, ThreadState>,
    actors: BTreeMap<String, ActorSummary>,
    policy_windows: Vec<PolicyWindow>,
    latency_samples: VecDeque<u64>,
}

#[derive(Debug)]
struct ThreadState {
    summary: ThreadSummary,
    seen_turns: BTreeSet<String>,
    recent_kinds: VecDeque<EventKind>,
}

impl ProjectionIndex {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_event(&self, event: &ObservedEvent) {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        inner.event_count += 1;
        inner.last_event_id = Some(event.event_id);

        match event.kind {
            EventKind::Decision => {
                inner.decision_count += 1;
                match event.decision_result {
                    Some(DecisionResult::Allow) => inner.allow_count += 1,
                    Some(DecisionResult::Deny) => inner.deny_count += 1,
                    None => {}
                }
                if let Some(latency) = event.latency_ms {
                    inner.latency_samples.push_back(latency);
                    while inner.latency_samples.len() > MAX_LATENCY_SAMPLES {
                        let _ = inner.latency_samples.pop_front();
                    }
                }
            }
            EventKind::Error => inner.error_count += 1,
            _ => {}
        }

        update_thread(&mut inner, event);
        update_turn(&mut inner, event);
        update_actor(&mut inner, event);
        if event.kind == EventKind::PolicyChange {
            update_policy(&mut inner, event);
        }
    }

    #[must_use]
    pub fn metrics(&self) -> ProjectionMetrics {
        let inner = self.read();
        let deny_rate = if inner.decision_count == 0 {
            0.0
        } else {
            inner.deny_count as f64 / inner.decision_count as f64
        };
        ProjectionMetrics {
            event_count: inner.event_count,
            thread_count: inner.threads.len(),
            turn_count: inner.turns.len(),
            decision_count: inner.decision_count,
            allow_count: inner.allow_count,
            deny_count: inner.deny_count,
            error_count: inner.error_count,
            deny_rate,
            latency: latency_summary(&inner.latency_samples),
        }
    }

    /// Thread summaries sorted by `last_observed_at` descending, ties broken
    /// by `last_event_id` descending, then `thread_id` ascending.
    #[must_use]
    pub fn threads(&self) -> Vec<ThreadSummary> {
        let mut threads: Vec<ThreadSummary> = self
            .read()
            .threads
            .values()
            .map(|state| state.summary.clone())
            .collect();
        threads.sort_by(|left, right| {
            right
                .last_observed_at
                .cmp(&left.last_observed_at)
                .then_with(|| right.last_event_id.cmp(&left.last_event_id))
                .then_with(|| left.thread_id.cmp(&right.thread_id))
        });
        threads
    }

    #[must_use]
    pub fn thread(&self, thread_id: &str) -> Option<ThreadSummary> {
        self.read()
            .threads
            .get(thread_id)
            .map(|state| state.summary.clone())
    }

    /// Turns belonging to a thread, ordered by `first_event_id` ascending.
    #[must_use]
    pub fn turns_for_thread(&self, thread_id: &str) -> Vec<TurnSummary> {
        let mut turns: Vec<TurnSummary> = self
            .read()
            .turns
            .values()
            .filter(|turn| turn.thread_id.as_deref() == Some(thread_id))
            .cloned()
            .collect();
        turns.sort_by_key(|turn| turn.first_event_id);
        turns
    }

    #[must_use]
    pub fn turn(&self, turn_id: &str) -> Option<TurnSummary> {
        self.read().turns.get(turn_id).cloned()
    }

    /// Actor summaries sorted by `event_count` descending, ties by actor
    /// ascending.
    #[must_use]
    pub fn actors(&self) -> Vec<ActorSummary> {
        let mut actors: Vec<ActorSummary> = self.read().actors.values().cloned().collect();
        actors.sort_by(|left, right| {
            right
                .event_count
                .cmp(&left.event_count)
                .then_with(|| left.actor.cmp(&right.actor))
        });
        actors
    }

    /// Policy windows in creation order.
    #[must_use]
    pub fn policy_windows(&self) -> Vec<PolicyWindow> {
        self.read().policy_windows.clone()
    }

    #[must_use]
    pub fn latency(&self) -> LatencySummary {
        latency_summary(&self.read().latency_samples)
    }

    #[must_use]
    pub fn signal_snapshot(&self) -> SignalSnapshot {
        let inner = self.read();
        SignalSnapshot {
            decision_count: inner.decision_count,
            deny_count: inner.deny_count,
            error_count: inner.error_count,
            last_event_id: inner.last_event_id,
            latency: latency_summary(&inner.latency_samples),
            threads: inner
                .threads
                .values()
                .map(|state| ThreadErrorWindow {
                    thread_id: state.summary.thread_id.clone(),
                    error_total: state.summary.error_total,
                    recent_error_total: state
                        .recent_kinds
                        .iter()
                        .filter(|kind| **kind == EventKind::Error)
                        .count() as u64,
                })
                .collect(),
            policy_window_starts: inner
                .policy_windows
                .iter()
                .map(|window| window.started_at_event_id)
                .collect(),
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, ProjectionInner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }
}

fn update_thread(inner: &mut ProjectionInner, event: &ObservedEvent) {
    let Some(thread_id) = &event.thread_id else {
        return;
    };
    let state = inner
        .threads
        .entry(thread_id.clone())
        .or_insert_with(|| ThreadState {
            summary: ThreadSummary {
                thread_id: thread_id.clone(),
                turns_total: 0,
                deny_total: 0,
                allow_total: 0,
                error_total: 0,
                first_event_id: event.event_id,
                last_event_id: event.event_id,
                last_observed_at: event.observed_at,
            },
            seen_turns: BTreeSet::new(),
            recent_kinds: VecDeque::new(),
        });

    state.summary.last_event_id = event.event_id;
    state.summary.last_observed_at = event.observed_at;
    match event.kind {
        EventKind::Decision => match event.decision_result {
            Some(DecisionResult::Allow) => state.summary.allow_total += 1,
            Some(DecisionResult::Deny) => state.summary.deny_total += 1,
            None => {}
        },
        EventKind::Error => state.summary.error_total += 1,
        _ => {}
    }
    if let Some(turn_id) = &event.turn_id {
        if state.seen_turns.insert(turn_id.clone()) {
            state.summary.turns_total += 1;
        }
    }
    state.recent_kinds.push_back(event.kind);
    while state.recent_kinds.len() > THREAD_RECENT_WINDOW {
        let _ = state.recent_kinds.pop_front();
    }
}

fn update_turn(inner: &mut ProjectionInner, event: &ObservedEvent) {
    let Some(turn_id) = &event.turn_id else {
        return;
    };
    let turn = inner
        .turns
        .entry(turn_id.clone())
        .or_insert_with(|| TurnSummary {
            turn_id: turn_id.clone(),
            thread_id: event.thread_id.clone(),
            parent_turn_id: event.parent_turn_id.clone(),
            decision_result: None,
            latency_ms: None,
            has_execution: false,
            has_error: false,
            first_event_id: event.event_id,
            last_event_id: event.event_id,
            markers: Vec::new(),
            decision_seen: false,
        });

    turn.last_event_id = event.event_id;
    if turn.parent_turn_id.is_none() {
        turn.parent_turn_id = event.parent_turn_id.clone();
    }
    match event.kind {
        EventKind::Decision => {
            if turn.decision_seen {
                if !turn
                    .markers
                    .iter()
                    .any(|marker| marker == DUPLICATE_DECISION_MARKER)
                {
                    turn.markers.push(DUPLICATE_DECISION_MARKER.to_string());
                }
            } else {
                // First decision event wins the slot, result and latency
                // included, even when the result is null.
                turn.decision_seen = true;
                turn.decision_result = event.decision_result;
                turn.latency_ms = event.latency_ms;
            }
        }
        EventKind::Execution => turn.has_execution = true,
        EventKind::Error => turn.has_error = true,
        _ => {}
    }
}

fn update_actor(inner: &mut ProjectionInner, event: &ObservedEvent) {
    let Some(actor) = &event.actor else {
        return;
    };
    let summary = inner
        .actors
        .entry(actor.clone())
        .or_insert_with(|| ActorSummary {
            actor: actor.clone(),
            event_count: 0,
            deny_count: 0,
            allow_count: 0,
            error_count: 0,
            last_observed_at: event.observed_at,
        });

    summary.event_count += 1;
    summary.last_observed_at = event.observed_at;
    match event.kind {
        EventKind::Decision => match event.decision_result {
            Some(DecisionResult::Allow) => summary.allow_count += 1,
            Some(DecisionResult::Deny) => summary.deny_count += 1,
            None => {}
        },
        EventKind::Error => summary.error_count += 1,
        _ => {}
    }
}

fn update_policy(inner: &mut ProjectionInner, event: &ObservedEvent) {
    if let Some(open) = inner.policy_windows.last_mut() {
        if open.ended_at_event_id.is_none() {
            open.ended_at_event_id = Some(event.event_id.saturating_sub(1));
        }
    }
    inner.policy_windows.push(PolicyWindow {
        policy_version: event.policy_version.clone(),
        started_at_event_id: event.event_id,
        ended_at_event_id: None,
    });
}

// Nearest-rank percentile: index ceil(p * n / 100) - 1, clamped to [0, n-1].
fn latency_summary(samples: &VecDeque<u64>) -> LatencySummary {
    let count = samples.len();
    if count == 0 {
        return LatencySummary::empty();
    }
    let mut sorted: Vec<u64> = samples.iter().copied().collect();
    sorted.sort_unstable();
    let rank = |percentile: usize| -> u64 {
        let index = (percentile * count)
            .div_ceil(100)
            .saturating_sub(1)
            .min(count - 1);
        sorted[index]
    };
    LatencySummary {
        count,
        p50: Some(rank(50)),
        p95: Some(rank(95)),
        p99: Some(rank(99)),
    }
}
