use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::ObserverError;

/// Adapter label synthesized for events that arrive without a `source`.
pub const GATEWAY_SOURCE: &str = "gateway";
/// Class label synthesized for events that arrive without an `artifact`.
pub const GATEWAY_ARTIFACT: &str = "gateway_event";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Decision,
    Execution,
    Error,
    PolicyChange,
    Other,
}

impl EventKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Decision => "decision",
            Self::Execution => "execution",
            Self::Error => "error",
            Self::PolicyChange => "policy_change",
            Self::Other => "other",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "decision" => Some(Self::Decision),
            "execution" => Some(Self::Execution),
            "error" => Some(Self::Error),
            "policy_change" => Some(Self::PolicyChange),
            "other" => Some(Self::Other),
            _ => None,
        }
    }
}

/// Gateway decision verdicts keep their upstream uppercase wire form.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
pub enum DecisionResult {
    #[serde(rename = "ALLOW")]
    Allow,
    #[serde(rename = "DENY")]
    Deny,
}

impl DecisionResult {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Allow => "ALLOW",
            Self::Deny => "DENY",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        if value.eq_ignore_ascii_case("ALLOW") {
            Some(Self::Allow)
        } else if value.eq_ignore_ascii_case("DENY") {
            Some(Self::Deny)
        } else {
            None
        }
    }
}

/// One record as the upstream gateway reported it, normalized for storage
/// and projection. Never authoritative.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ObservedEvent {
    pub event_id: u64,
    pub source: String,
    pub artifact: String,
    pub thread_id: Option<String>,
    pub turn_id: Option<String>,
    pub parent_turn_id: Option<String>,
    pub actor: Option<String>,
    pub kind: EventKind,
    pub decision_result: Option<DecisionResult>,
    pub policy_version: Option<String>,
    pub latency_ms: Option<u64>,
    pub observed_at: i64,
    pub payload: Value,
}

impl ObservedEvent {
    /// Normalizes one raw gateway event. The gateway `index` becomes
    /// `event_id`; `source` / `artifact` default to the gateway labels when
    /// absent; recognized fields are extracted tolerantly from the payload
    /// object (wrong-typed values read as absent) and the payload is kept
    /// verbatim, unknown keys included.
    ///
    /// # Errors
    /// Returns [`ObserverError::InvalidInput`] when the event is not an
    /// object or `index` is missing or not a non-negative integer.
    pub fn from_gateway(raw: &Value) -> Result<Self, ObserverError> {
        let Some(object) = raw.as_object() else {
            return Err(ObserverError::InvalidInput(
                "gateway event must be an object".to_string(),
            ));
        };
        let event_id = object.get("index").and_then(Value::as_u64).ok_or_else(|| {
            ObserverError::InvalidInput(
                "gateway event index must be a non-negative integer".to_string(),
            )
        })?;

        let payload = object
            .get("payload")
            .cloned()
            .unwrap_or_else(|| Value::Object(Map::new()));
        let empty = Map::new();
        let fields = payload.as_object().unwrap_or(&empty);

        let kind = field_str(fields, "kind")
            .and_then(EventKind::parse)
            .unwrap_or(EventKind::Other);

        Ok(Self {
            event_id,
            source: field_str(object, "source")
                .unwrap_or(GATEWAY_SOURCE)
                .to_string(),
            artifact: field_str(object, "artifact")
                .unwrap_or(GATEWAY_ARTIFACT)
                .to_string(),
            thread_id: field_owned(fields, "thread_id"),
            turn_id: field_owned(fields, "turn_id"),
            parent_turn_id: field_owned(fields, "parent_turn_id"),
            actor: field_owned(fields, "actor"),
            kind,
            decision_result: field_str(fields, "decision_result").and_then(DecisionResult::parse),
            policy_version: field_owned(fields, "policy_version"),
            latency_ms: fields.get("latency_ms").and_then(Value::as_u64),
            observed_at: fields
                .get("observed_at")
                .and_then(Value::as_i64)
                .unwrap_or(0),
            payload,
        })
    }
}

fn field_str<'a>(object: &'a Map<String, Value>, key: &str) -> Option<&'a str> {
    object.get(key).and_then(Value::as_str)
}

fn field_owned(object: &Map<String, Value>, key: &str) -> Option<String> {
    field_str(object, key).map(str::to_string)
}
