/// Pull countable messages out of assistant session log records.
///
/// Records look like:
///   {"type":"assistant","uuid":"...","timestamp":"2025-01-02T03:04:05Z",
///    "message":{"content":[{"type":"text","text":"..."},{"type":"tool_use",...}]}}
/// User records may carry `message.content` as a bare string instead.
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Which side of the conversation a tracker counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Assistant,
    User,
}

impl Role {
    /// Value of the record's `type` field for this role.
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Assistant => "assistant",
            Role::User => "user",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A message that passed the role filter and has a stable id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogMessage {
    pub role: Role,
    pub id: String,
    pub day: NaiveDate,
    pub segments: Vec<String>,
}

impl LogMessage {
    /// `YYYY-MM-DD` bucket key.
    pub fn day_key(&self) -> String {
        day_key(self.day)
    }
}

/// Format a date as the `YYYY-MM-DD` key used everywhere.
pub fn day_key(day: NaiveDate) -> String {
    day.format("%Y-%m-%d").to_string()
}

/// Current UTC calendar day.
pub fn utc_today() -> NaiveDate {
    Utc::now().date_naive()
}

/// Extract a message of `role` from a record, or `None` if it should not be counted.
pub fn extract(record: &Value, role: Role) -> Option<LogMessage> {
    extract_on(record, role, utc_today())
}

/// Like [`extract`], with `today` used when the record carries no usable timestamp.
pub fn extract_on(record: &Value, role: Role, today: NaiveDate) -> Option<LogMessage> {
    if record.get("type").and_then(|t| t.as_str()) != Some(role.as_str()) {
        return None;
    }

    let id = non_empty_str(record, "uuid").or_else(|| non_empty_str(record, "requestId"))?;

    let day = record
        .get("timestamp")
        .and_then(|t| t.as_str())
        .and_then(parse_day)
        .unwrap_or(today);

    let segments = record
        .get("message")
        .and_then(|m| m.get("content"))
        .map(text_segments)
        .unwrap_or_default();

    Some(LogMessage {
        role,
        id: id.to_string(),
        day,
        segments,
    })
}

fn non_empty_str<'a>(record: &'a Value, key: &str) -> Option<&'a str> {
    record
        .get(key)
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
}

/// Parse an ISO-8601 timestamp and floor it to its UTC day.
///
/// Offsets (including a trailing `Z`) are honoured; timestamps without an
/// offset are taken as UTC.
pub fn parse_day(timestamp: &str) -> Option<NaiveDate> {
    let ts = timestamp.trim();
    if ts.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(ts) {
        return Some(dt.with_timezone(&Utc).date_naive());
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(ts, "%Y-%m-%dT%H:%M:%S%.f") {
        return Some(naive.date());
    }
    NaiveDate::parse_from_str(ts, "%Y-%m-%d").ok()
}

/// Text segments from `message.content`: a string is one segment, an array
/// yields one segment per `{"type":"text"}` item.
fn text_segments(content: &Value) -> Vec<String> {
    match content {
        Value::String(s) => vec![s.clone()],
        Value::Array(items) => items
            .iter()
            .filter(|item| item.get("type").and_then(|t| t.as_str()) == Some("text"))
            .map(|item| {
                item.get("text")
                    .and_then(|t| t.as_str())
                    .unwrap_or_default()
                    .to_string()
            })
            .collect(),
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 6, 1).unwrap()
    }

    #[test]
    fn assistant_record_with_text_items() {
        let rec = json!({
            "type": "assistant",
            "uuid": "u-1",
            "timestamp": "2025-03-04T10:00:00.000Z",
            "message": {"content": [
                {"type": "text", "text": "You're absolutely right"},
                {"type": "tool_use", "name": "Read", "input": {}},
                {"type": "text", "text": "Fixing now."}
            ]}
        });
        let msg = extract_on(&rec, Role::Assistant, today()).unwrap();
        assert_eq!(msg.id, "u-1");
        assert_eq!(msg.day_key(), "2025-03-04");
        assert_eq!(msg.segments, vec!["You're absolutely right", "Fixing now."]);
    }

    #[test]
    fn wrong_role_is_skipped() {
        let rec = json!({"type": "user", "uuid": "u-1", "message": {"content": "hi"}});
        assert!(extract_on(&rec, Role::Assistant, today()).is_none());
        let rec = json!({"type": "summary", "uuid": "u-2"});
        assert!(extract_on(&rec, Role::User, today()).is_none());
        let rec = json!({"uuid": "u-3"});
        assert!(extract_on(&rec, Role::User, today()).is_none());
    }

    #[test]
    fn missing_both_ids_is_skipped() {
        let rec = json!({"type": "assistant", "message": {"content": [{"type": "text", "text": "x"}]}});
        assert!(extract_on(&rec, Role::Assistant, today()).is_none());
        let rec = json!({"type": "assistant", "uuid": "", "requestId": null});
        assert!(extract_on(&rec, Role::Assistant, today()).is_none());
    }

    #[test]
    fn request_id_is_the_fallback() {
        let rec = json!({"type": "assistant", "requestId": "req_9"});
        let msg = extract_on(&rec, Role::Assistant, today()).unwrap();
        assert_eq!(msg.id, "req_9");

        let rec = json!({"type": "assistant", "uuid": "u-7", "requestId": "req_9"});
        assert_eq!(extract_on(&rec, Role::Assistant, today()).unwrap().id, "u-7");
    }

    #[test]
    fn missing_timestamp_uses_today() {
        let rec = json!({"type": "user", "uuid": "u-1", "message": {"content": "please"}});
        let msg = extract_on(&rec, Role::User, today()).unwrap();
        assert_eq!(msg.day, today());
    }

    #[test]
    fn unparsable_timestamp_uses_today() {
        let rec = json!({"type": "user", "uuid": "u-1", "timestamp": "yesterday-ish"});
        let msg = extract_on(&rec, Role::User, today()).unwrap();
        assert_eq!(msg.day, today());
    }

    #[test]
    fn default_clock_is_utc_today() {
        let rec = json!({"type": "user", "uuid": "u-1"});
        let before = utc_today();
        let msg = extract(&rec, Role::User).unwrap();
        let after = utc_today();
        assert!(msg.day == before || msg.day == after);
    }

    #[test]
    fn offsets_are_converted_to_utc() {
        assert_eq!(
            parse_day("2025-01-01T23:30:00-02:00"),
            NaiveDate::from_ymd_opt(2025, 1, 2)
        );
        assert_eq!(
            parse_day("2025-01-02T00:30:00+01:00"),
            NaiveDate::from_ymd_opt(2025, 1, 1)
        );
        assert_eq!(
            parse_day("2025-01-02T08:00:00"),
            NaiveDate::from_ymd_opt(2025, 1, 2)
        );
        assert_eq!(parse_day(""), None);
    }

    #[test]
    fn string_content_is_one_segment() {
        let rec = json!({"type": "user", "uuid": "u-1", "message": {"content": "thanks, please continue"}});
        let msg = extract_on(&rec, Role::User, today()).unwrap();
        assert_eq!(msg.segments, vec!["thanks, please continue"]);
    }

    #[test]
    fn list_content_yields_one_segment_per_text_item() {
        let rec = json!({"type": "user", "uuid": "u-1", "message": {"content": [
            {"type": "text", "text": "a"},
            {"type": "tool_result", "tool_use_id": "x", "content": "ignored"},
            {"type": "text"},
            "bare string item"
        ]}});
        let msg = extract_on(&rec, Role::User, today()).unwrap();
        assert_eq!(msg.segments, vec!["a", ""]);
    }

    #[test]
    fn absent_content_yields_no_segments() {
        let rec = json!({"type": "assistant", "uuid": "u-1", "message": {}});
        assert!(extract_on(&rec, Role::Assistant, today())
            .unwrap()
            .segments
            .is_empty());
        let rec = json!({"type": "assistant", "uuid": "u-1"});
        assert!(extract_on(&rec, Role::Assistant, today())
            .unwrap()
            .segments
            .is_empty());
    }

    #[test]
    fn role_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&Role::Assistant).unwrap(), r#""assistant""#);
        let r: Role = serde_json::from_str(r#""user""#).unwrap();
        assert_eq!(r, Role::User);
    }
}
