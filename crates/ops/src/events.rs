//! Core `Event` objects projected to a flat row.

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventSummary {
    pub name: String,
    pub namespace: String,
    pub reason: String,
    pub message: String,
    pub source: String,
    #[serde(rename = "type")]
    pub type_: String,
    pub count: i64,
    pub first_time: Option<String>,
    pub last_time: Option<String>,
}

fn s(v: &Value, pointer: &str) -> String {
    v.pointer(pointer).and_then(Value::as_str).unwrap_or_default().to_string()
}

fn ts(v: &Value, pointer: &str) -> Option<String> {
    v.pointer(pointer).and_then(Value::as_str).filter(|t| !t.is_empty()).map(str::to_string)
}

pub fn project(ev: &Value) -> EventSummary {
    EventSummary {
        name: s(ev, "/metadata/name"),
        namespace: s(ev, "/metadata/namespace"),
        reason: s(ev, "/reason"),
        message: s(ev, "/message"),
        source: s(ev, "/source/component"),
        type_: s(ev, "/type"),
        count: ev.get("count").and_then(Value::as_i64).unwrap_or_default(),
        first_time: ts(ev, "/firstTimestamp"),
        last_time: ts(ev, "/lastTimestamp"),
    }
}

/// Project and order by last occurrence, most recent last. Events without
/// a timestamp sort first.
pub fn project_all<'a>(events: impl IntoIterator<Item = &'a Value>) -> Vec<EventSummary> {
    let mut out: Vec<EventSummary> = events.into_iter().map(project).collect();
    // RFC3339 with a fixed UTC offset orders lexically
    out.sort_by(|a, b| a.last_time.cmp(&b.last_time).then_with(|| a.name.cmp(&b.name)));
    out
}
