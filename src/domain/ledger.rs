//! Persistent, append-only event ledger.
//!
//! `record` never touches the receiver: it returns a new ledger that shares
//! nothing mutable with the old one. A snapshot taken for a checkpoint stays
//! exactly as it was while the orchestrator keeps extending its own copy.

use std::sync::Arc;

use super::events::{Event, EventData};

/// Immutable sequence of step events for one run
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EventLedger {
    events: Arc<Vec<Event>>,
}

impl EventLedger {
    /// An empty ledger for a fresh run
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a ledger from persisted events
    pub fn from_events(events: Vec<Event>) -> Self {
        Self {
            events: Arc::new(events),
        }
    }

    /// Return a new ledger with one more event; `self` is left untouched.
    #[must_use]
    pub fn record(&self, name: impl Into<String>, data: EventData) -> Self {
        let mut events = Vec::with_capacity(self.events.len() + 1);
        events.extend(self.events.iter().cloned());
        events.push(Event::new(self.events.len() as u64, name, data));
        Self {
            events: Arc::new(events),
        }
    }

    pub fn events(&self) -> &[Event] {
        &self.events
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn last(&self) -> Option<&Event> {
        self.events.last()
    }

    /// Most recent event with the given name
    pub fn last_named(&self, name: &str) -> Option<&Event> {
        self.events.iter().rev().find(|e| e.name == name)
    }

    /// Whether `self` is a prefix of `other`
    pub fn is_prefix_of(&self, other: &EventLedger) -> bool {
        self.len() <= other.len() && other.events[..self.len()] == self.events[..]
    }

    pub fn into_vec(self) -> Vec<Event> {
        Arc::try_unwrap(self.events).unwrap_or_else(|shared| (*shared).clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    fn data(value: Value) -> EventData {
        match value {
            Value::Object(map) => map,
            _ => EventData::new(),
        }
    }

    #[test]
    fn test_record_leaves_previous_value_intact() {
        let empty = EventLedger::new();
        let after_auth = empty.record("auth", data(json!({"provider": "mock"})));
        let after_select = after_auth.record("model_select", EventData::new());

        assert!(empty.is_empty());
        assert_eq!(after_auth.len(), 1);
        assert_eq!(after_select.len(), 2);
        assert_eq!(after_auth.events()[0].name, "auth");
    }

    #[test]
    fn test_indices_are_dense() {
        let ledger = EventLedger::new()
            .record("auth", EventData::new())
            .record("model_select", EventData::new())
            .record("call", EventData::new());

        for (i, event) in ledger.events().iter().enumerate() {
            assert_eq!(event.index, i as u64);
        }
    }

    #[test]
    fn test_prefix_property() {
        let v1 = EventLedger::new().record("auth", EventData::new());
        let v2 = v1.record("model_select", EventData::new());

        assert!(v1.is_prefix_of(&v2));
        assert!(!v2.is_prefix_of(&v1));

        let forked = EventLedger::new().record("other", EventData::new());
        assert!(!forked.is_prefix_of(&v2));
    }

    #[test]
    fn test_last_named() {
        let ledger = EventLedger::new()
            .record("model_select", data(json!({"chosen": "a"})))
            .record("model_select", data(json!({"chosen": "b"})));

        assert_eq!(
            ledger.last_named("model_select").and_then(|e| e.data_str("chosen")),
            Some("b")
        );
        assert!(ledger.last_named("call").is_none());
    }
}
