use std::{
    fmt,
    ops::{Deref, DerefMut},
};

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Value of the `type` field of synthesized lost event telemetry.
pub const LOST_EVENT_TELEMETRY: &str = "lost_event_telemetry";

/// An open mapping of fields describing something a probe observed.
///
/// Probes build it during enrichment, the probe instance stamps it with
/// `timestamp` and `probe`, and every plugin of the chain may add or
/// overwrite fields. Once serialized it is never read again in its mutable form.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Event(Map<String, Value>);

impl Event {
    pub fn new() -> Self {
        Self(Map::new())
    }

    /// Builder style insertion.
    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.0.insert(key.to_string(), value.into());
        self
    }

    /// Parse a raw `key=value key=value` record.
    ///
    /// Integer values become JSON numbers, everything else is kept as a string.
    /// Tokens without `=` are ignored.
    pub fn from_key_values(record: &str) -> Self {
        let fields = record
            .split_whitespace()
            .filter_map(|token| token.split_once('='))
            .filter(|(key, _)| !key.is_empty())
            .map(|(key, value)| {
                let value = match value.parse::<i64>() {
                    Ok(number) => Value::from(number),
                    Err(_) => Value::from(value),
                };
                (key.to_string(), value)
            })
            .collect();
        Self(fields)
    }

    /// Synthesize the telemetry event summarizing dropped events.
    pub fn lost_event_telemetry(count: u64) -> Self {
        Self::new()
            .with("type", LOST_EVENT_TELEMETRY)
            .with("count", count)
    }

    /// Add the current UTC time and the name of the emitting probe.
    pub fn stamp(&mut self, probe: &str) {
        self.0.insert("timestamp".to_string(), Value::from(utc_timestamp()));
        self.0.insert("probe".to_string(), Value::from(probe));
    }

    /// Serialize to the compact single line form placed on the queue.
    pub fn serialize(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(&self.0)
    }

    pub fn into_inner(self) -> Map<String, Value> {
        self.0
    }
}

impl Deref for Event {
    type Target = Map<String, Value>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for Event {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

impl From<Map<String, Value>> for Event {
    fn from(fields: Map<String, Value>) -> Self {
        Self(fields)
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.serialize() {
            Ok(line) => write!(f, "{line}"),
            Err(_) => write!(f, "{:?}", self.0),
        }
    }
}

/// ISO-8601 UTC timestamp with microsecond precision and a trailing `Z`.
pub fn utc_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

#[cfg(test)]
mod tests {
    use chrono::DateTime;
    use serde_json::json;

    use super::*;

    #[test]
    fn key_values_are_typed() {
        let event = Event::from_key_values("pid=42 daddr=10.0.0.1 port=443 garbage =x");
        assert_eq!(event["pid"], json!(42));
        assert_eq!(event["daddr"], json!("10.0.0.1"));
        assert_eq!(event["port"], json!(443));
        assert_eq!(event.len(), 3);
    }

    #[test]
    fn empty_record_gives_empty_event() {
        assert!(Event::from_key_values("   ").is_empty());
    }

    #[test]
    fn stamp_adds_timestamp_and_probe() {
        let mut event = Event::new().with("pid", 1);
        event.stamp("tcp_connect");

        let timestamp = event["timestamp"].as_str().unwrap();
        assert!(timestamp.ends_with('Z'));
        assert!(DateTime::parse_from_rfc3339(timestamp).is_ok());
        // microseconds are kept
        assert_eq!(timestamp.split('.').nth(1).unwrap().len(), "123456Z".len());
        assert_eq!(event["probe"], json!("tcp_connect"));
    }

    #[test]
    fn serialized_event_parses_back_equal() {
        let mut event = Event::new()
            .with("pid", 7)
            .with("proctree", json!([{"pid": 7, "cmdline": "curl example.com"}]))
            .with("nested", json!({"b": 1.5, "a": null}));
        event.stamp("net_listen");

        let line = event.serialize().unwrap();
        assert!(!line.contains('\n'));
        let parsed: Event = serde_json::from_str(&line).unwrap();
        assert_eq!(parsed, event);
    }

    #[test]
    fn telemetry_shape() {
        let event = Event::lost_event_telemetry(12);
        assert_eq!(event["type"], json!(LOST_EVENT_TELEMETRY));
        assert_eq!(event["count"], json!(12));
    }
}
