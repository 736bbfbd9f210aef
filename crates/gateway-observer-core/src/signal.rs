use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::ObserverError;
use crate::projection::SignalSnapshot;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SignalSeverity {
    Info,
    Warn,
    Critical,
}

impl SignalSeverity {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Critical => "critical",
        }
    }
}

/// A non-normative attention marker. Signals describe, they never decide.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Signal {
    pub name: &'static str,
    pub severity: SignalSeverity,
    pub observation: String,
    pub evidence: Value,
}

/// Signal rule thresholds. The numbers are configuration; the vocabulary of
/// signal names is frozen.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct SignalThresholds {
    pub latency_p95_warn_ms: u64,
    pub latency_p95_critical_ms: u64,
    pub latency_min_samples: usize,
    pub deny_rate_warn: f64,
    pub deny_rate_critical: f64,
    pub deny_rate_min_decisions: u64,
    pub thread_error_cluster: u64,
    pub total_error_cluster: u64,
    pub policy_change_count: usize,
    pub policy_change_window: u64,
}

impl Default for SignalThresholds {
    fn default() -> Self {
        Self {
            latency_p95_warn_ms: 500,
            latency_p95_critical_ms: 2000,
            latency_min_samples: 50,
            deny_rate_warn: 0.25,
            deny_rate_critical: 0.5,
            deny_rate_min_decisions: 20,
            thread_error_cluster: 3,
            total_error_cluster: 10,
            policy_change_count: 3,
            policy_change_window: 100,
        }
    }
}

impl SignalThresholds {
    /// Validates threshold ordering and bounds.
    ///
    /// # Errors
    /// Returns [`ObserverError::InvalidInput`] when a bound is out of range
    /// or warn/critical thresholds are not strictly ordered.
    pub fn validate(&self) -> Result<(), ObserverError> {
        if self.latency_p95_warn_ms >= self.latency_p95_critical_ms {
            return Err(ObserverError::InvalidInput(
                "latency_p95_warn_ms MUST be below latency_p95_critical_ms".to_string(),
            ));
        }
        for (name, value) in [
            ("deny_rate_warn", self.deny_rate_warn),
            ("deny_rate_critical", self.deny_rate_critical),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(ObserverError::InvalidInput(format!(
                    "{name} MUST be in [0.0, 1.0]"
                )));
            }
        }
        if self.deny_rate_warn >= self.deny_rate_critical {
            return Err(ObserverError::InvalidInput(
                "deny_rate_warn MUST be below deny_rate_critical".to_string(),
            ));
        }
        if self.policy_change_window == 0 {
            return Err(ObserverError::InvalidInput(
                "policy_change_window MUST be >= 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Decodes and validates thresholds from JSON. Absent fields keep their
    /// defaults, so partial override documents work.
    ///
    /// # Errors
    /// Returns [`ObserverError::InvalidInput`] when decoding fails or the
    /// decoded thresholds violate [`SignalThresholds::validate`].
    pub fn from_json(value: &Value) -> Result<Self, ObserverError> {
        let thresholds: Self = serde_json::from_value(value.clone()).map_err(|err| {
            ObserverError::InvalidInput(format!("invalid thresholds JSON payload: {err}"))
        })?;
        thresholds.validate()?;
        Ok(thresholds)
    }
}

/// Evaluates all signal rules against one projection snapshot.
///
/// Pure: identical snapshot and thresholds always produce the identical
/// signal list, order included (latency, deny rate, error cluster, policy
/// changes).
#[must_use]
pub fn evaluate(snapshot: &SignalSnapshot, thresholds: &SignalThresholds) -> Vec<Signal> {
    let mut signals = Vec::new();
    check_latency(snapshot, thresholds, &mut signals);
    check_deny_rate(snapshot, thresholds, &mut signals);
    check_error_cluster(snapshot, thresholds, &mut signals);
    check_policy_changes(snapshot, thresholds, &mut signals);
    signals
}

fn check_latency(snapshot: &SignalSnapshot, thresholds: &SignalThresholds, out: &mut Vec<Signal>) {
    let Some(p95) = snapshot.latency.p95 else {
        return;
    };
    if snapshot.latency.count < thresholds.latency_min_samples {
        return;
    }
    let evidence = json!({
        "p50": snapshot.latency.p50,
        "p95": snapshot.latency.p95,
        "p99": snapshot.latency.p99,
        "count": snapshot.latency.count,
    });
    if p95 >= thresholds.latency_p95_critical_ms {
        out.push(Signal {
            name: "latency_p95_critical",
            severity: SignalSeverity::Critical,
            observation: format!(
                "p95 decision latency is {p95} ms (threshold {} ms) over {} samples",
                thresholds.latency_p95_critical_ms, snapshot.latency.count
            ),
            evidence,
        });
    } else if p95 >= thresholds.latency_p95_warn_ms {
        out.push(Signal {
            name: "latency_p95_elevated",
            severity: SignalSeverity::Warn,
            observation: format!(
                "p95 decision latency is {p95} ms (threshold {} ms) over {} samples",
                thresholds.latency_p95_warn_ms, snapshot.latency.count
            ),
            evidence,
        });
    }
}

fn check_deny_rate(
    snapshot: &SignalSnapshot,
    thresholds: &SignalThresholds,
    out: &mut Vec<Signal>,
) {
    if snapshot.decision_count < thresholds.deny_rate_min_decisions {
        return;
    }
    let deny_rate = snapshot.deny_count as f64 / snapshot.decision_count as f64;
    let evidence = json!({
        "deny_count": snapshot.deny_count,
        "decision_count": snapshot.decision_count,
        "deny_rate": deny_rate,
    });
    if deny_rate >= thresholds.deny_rate_critical {
        out.push(Signal {
            name: "deny_rate_critical",
            severity: SignalSeverity::Critical,
            observation: format!(
                "{} of {} decisions denied (rate {deny_rate:.2})",
                snapshot.deny_count, snapshot.decision_count
            ),
            evidence,
        });
    } else if deny_rate >= thresholds.deny_rate_warn {
        out.push(Signal {
            name: "deny_rate_elevated",
            severity: SignalSeverity::Warn,
            observation: format!(
                "{} of {} decisions denied (rate {deny_rate:.2})",
                snapshot.deny_count, snapshot.decision_count
            ),
            evidence,
        });
    }
}

fn check_error_cluster(
    snapshot: &SignalSnapshot,
    thresholds: &SignalThresholds,
    out: &mut Vec<Signal>,
) {
    let clustered: Vec<&str> = snapshot
        .threads
        .iter()
        .filter(|thread| thread.recent_error_total >= thresholds.thread_error_cluster)
        .map(|thread| thread.thread_id.as_str())
        .collect();
    let total_tripped = snapshot.error_count >= thresholds.total_error_cluster;
    if clustered.is_empty() && !total_tripped {
        return;
    }
    out.push(Signal {
        name: "error_cluster",
        severity: SignalSeverity::Warn,
        observation: if clustered.is_empty() {
            format!("{} error events observed in total", snapshot.error_count)
        } else {
            format!(
                "recent error clusters in {} thread(s); {} error events in total",
                clustered.len(),
                snapshot.error_count
            )
        },
        evidence: json!({
            "threads": clustered,
            "error_count": snapshot.error_count,
        }),
    });
}

fn check_policy_changes(
    snapshot: &SignalSnapshot,
    thresholds: &SignalThresholds,
    out: &mut Vec<Signal>,
) {
    let Some(last_event_id) = snapshot.last_event_id else {
        return;
    };
    let floor = last_event_id.saturating_sub(thresholds.policy_change_window - 1);
    let recent = snapshot
        .policy_window_starts
        .iter()
        .filter(|started_at| **started_at >= floor)
        .count();
    if recent < thresholds.policy_change_count {
        return;
    }
    out.push(Signal {
        name: "frequent_policy_changes",
        severity: SignalSeverity::Info,
        observation: format!(
            "{recent} policy windows opened within the last {} events",
            thresholds.policy_change_window
        ),
        evidence: json!({
            "recent_window_count": recent,
            "window_events": thresholds.policy_change_window,
        }),
    });
}
