//! Activity event types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One entry of the activity feed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[cfg_attr(feature = "typescript", derive(ts_rs::TS))]
#[cfg_attr(feature = "typescript", ts(export))]
pub struct ActivityEvent {
    /// Position in the feed, starting at 1
    pub id: u64,
    /// When the event was emitted
    pub timestamp: DateTime<Utc>,
    /// Event name, e.g. `plan_step` or `amendment`
    pub event: String,
    /// Run the event belongs to, if any
    pub run_id: Option<String>,
    /// Free-form payload
    #[cfg_attr(feature = "typescript", ts(type = "Record<string, unknown>"))]
    pub fields: Map<String, Value>,
}

impl ActivityEvent {
    pub fn field_str(&self, key: &str) -> Option<&str> {
        self.fields.get(key).and_then(Value::as_str)
    }
}

/// A window of the feed returned by [`crate::ActivityBus::get`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[cfg_attr(feature = "typescript", derive(ts_rs::TS))]
#[cfg_attr(feature = "typescript", ts(export))]
pub struct ActivityPage {
    pub events: Vec<ActivityEvent>,
    /// Pass back as `since_id` to continue after this page
    pub next_since_id: u64,
    /// Highest id ever assigned
    pub latest_id: u64,
}

/// Converts an arbitrary JSON value into an event payload. Objects are used
/// as-is; any other value is stored under `value`.
pub fn into_fields(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        Value::Null => Map::new(),
        other => {
            let mut map = Map::new();
            map.insert("value".to_string(), other);
            map
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_into_fields() {
        let fields = into_fields(json!({"text": "hi"}));
        assert_eq!(fields["text"], "hi");

        assert!(into_fields(Value::Null).is_empty());

        let fields = into_fields(json!(42));
        assert_eq!(fields["value"], 42);
    }
}
