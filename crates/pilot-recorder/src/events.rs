use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One line of `stream.jsonl`: the raw executor event plus the fields the
/// parser could extract from it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamEvent {
    pub seq: u64,
    pub ts: DateTime<Utc>,
    pub raw: Value,
    pub parsed: ParsedEvent,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ParsedEvent {
    #[serde(default)]
    pub event_type: String,
    #[serde(default)]
    pub subtype: String,
    pub tool_name: Option<String>,
    pub tool_input: Option<Value>,
    pub text: Option<String>,
    pub result: Option<String>,
    #[serde(default)]
    pub is_error: bool,
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
}

fn str_at<'a>(raw: &'a Value, keys: &[&str]) -> Option<&'a str> {
    keys.iter().find_map(|k| {
        if k.starts_with('/') {
            raw.pointer(k).and_then(|v| v.as_str())
        } else {
            raw.get(k).and_then(|v| v.as_str())
        }
    })
}

/// Best-effort extraction from a raw executor event. Executors disagree on
/// payload shape, so every field probes a couple of known locations and
/// falls back to empty.
pub fn parse_event(raw: &Value) -> ParsedEvent {
    ParsedEvent {
        event_type: str_at(raw, &["type"]).unwrap_or_default().to_string(),
        subtype: str_at(raw, &["subtype"]).unwrap_or_default().to_string(),
        tool_name: str_at(raw, &["tool_name", "/tool/name"]).map(|s| s.to_string()),
        tool_input: raw
            .get("tool_input")
            .or_else(|| raw.pointer("/tool/input"))
            .cloned(),
        text: str_at(raw, &["text", "/message/text"]).map(|s| s.to_string()),
        result: str_at(raw, &["result"]).map(|s| s.to_string()),
        is_error: raw
            .get("is_error")
            .and_then(|v| v.as_bool())
            .unwrap_or(false),
        input_tokens: raw
            .pointer("/usage/input_tokens")
            .and_then(|v| v.as_u64())
            .unwrap_or(0),
        output_tokens: raw
            .pointer("/usage/output_tokens")
            .and_then(|v| v.as_u64())
            .unwrap_or(0),
    }
}

impl ParsedEvent {
    /// File path touched by this event, when it is a file-oriented tool call.
    pub fn touched_file(&self) -> Option<String> {
        let tool = self.tool_name.as_deref()?;
        if !matches!(tool, "Read" | "Write" | "Edit") {
            return None;
        }
        self.tool_input
            .as_ref()?
            .get("file_path")
            .and_then(|p| p.as_str())
            .map(|p| p.to_string())
    }
}
