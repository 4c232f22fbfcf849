//! Step events recorded during a run.
//!
//! An event is written once at its index and never altered afterwards.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Structured event data (a JSON object)
pub type EventData = Map<String, Value>;

/// A single entry in a run's history.
///
/// Indices are 0-based and dense: the event at `index` i is always preceded
/// by exactly i events in the same run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Position in the run's history
    pub index: u64,

    /// When the event was recorded (ISO 8601)
    pub timestamp: DateTime<Utc>,

    /// Step name, or `<step>_error` for a failed step
    pub name: String,

    /// Step outcome data
    #[serde(default)]
    pub data: EventData,
}

impl Event {
    /// Create an event with the current timestamp
    pub fn new(index: u64, name: impl Into<String>, data: EventData) -> Self {
        Self {
            index,
            timestamp: Utc::now(),
            name: name.into(),
            data,
        }
    }

    /// Whether this event records a step failure
    pub fn is_error(&self) -> bool {
        self.name.ends_with(ERROR_SUFFIX)
    }

    /// Look up a string field in the event data
    pub fn data_str(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(Value::as_str)
    }
}

/// Suffix appended to a step name for its failure event
pub const ERROR_SUFFIX: &str = "_error";

/// Name of the failure event for a step
pub fn error_event_name(step: &str) -> String {
    format!("{}{}", step, ERROR_SUFFIX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn data(value: Value) -> EventData {
        match value {
            Value::Object(map) => map,
            _ => EventData::new(),
        }
    }

    #[test]
    fn test_event_serialization() {
        let event = Event::new(0, "auth", data(json!({"provider": "mock"})));

        let json = serde_json::to_string(&event).unwrap();
        let parsed: Event = serde_json::from_str(&json).unwrap();

        assert_eq!(parsed, event);
        assert_eq!(parsed.data_str("provider"), Some("mock"));
    }

    #[test]
    fn test_error_event_name() {
        let event = Event::new(2, error_event_name("call"), EventData::new());
        assert_eq!(event.name, "call_error");
        assert!(event.is_error());
        assert!(!Event::new(0, "auth", EventData::new()).is_error());
    }

    #[test]
    fn test_missing_data_defaults_to_empty() {
        let parsed: Event = serde_json::from_str(
            r#"{"index":0,"timestamp":"2026-01-01T00:00:00Z","name":"auth"}"#,
        )
        .unwrap();
        assert!(parsed.data.is_empty());
    }
}
