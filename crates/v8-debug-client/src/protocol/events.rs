use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Script descriptor embedded in break and exception events.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScriptRef {
    #[serde(default)]
    pub id: Option<i64>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub line_offset: Option<u32>,
    #[serde(default)]
    pub column_offset: Option<u32>,
    #[serde(default)]
    pub line_count: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BreakEvent {
    #[serde(default)]
    pub invocation_text: Option<String>,
    #[serde(default)]
    pub source_line: Option<u32>,
    #[serde(default)]
    pub source_column: Option<u32>,
    #[serde(default)]
    pub source_line_text: Option<String>,
    #[serde(default)]
    pub script: Option<ScriptRef>,
    /// Breakpoint numbers that triggered the stop; empty for a step or suspend.
    #[serde(default)]
    pub breakpoints: Vec<u32>,
    #[serde(skip)]
    pub raw: Value,
}

impl BreakEvent {
    pub fn from_body(body: &Value) -> Self {
        let mut event: BreakEvent = serde_json::from_value(body.clone()).unwrap_or_default();
        event.raw = body.clone();
        event
    }

    pub fn script_name(&self) -> Option<&str> {
        self.script.as_ref().and_then(|script| script.name.as_deref())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExceptionEvent {
    #[serde(default)]
    pub uncaught: bool,
    #[serde(default)]
    pub exception: Value,
    #[serde(default)]
    pub source_line: Option<u32>,
    #[serde(default)]
    pub source_column: Option<u32>,
    #[serde(default)]
    pub source_line_text: Option<String>,
    #[serde(default)]
    pub script: Option<ScriptRef>,
    #[serde(skip)]
    pub raw: Value,
}

impl ExceptionEvent {
    pub fn from_body(body: &Value) -> Self {
        let mut event: ExceptionEvent = serde_json::from_value(body.clone()).unwrap_or_default();
        event.raw = body.clone();
        event
    }

    /// Best-effort human text for the thrown value.
    pub fn description(&self) -> String {
        self.exception
            .get("text")
            .and_then(Value::as_str)
            .map(str::to_owned)
            .or_else(|| self.exception.as_str().map(str::to_owned))
            .unwrap_or_else(|| self.exception.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn break_event_fields() {
        let body = json!({
            "invocationText": "#<Object>.[anonymous]()",
            "sourceLine": 5,
            "sourceColumn": 2,
            "sourceLineText": "  x++;",
            "script": {"id": 12, "name": "s_abc.js [temp]", "lineOffset": 0, "lineCount": 9},
            "breakpoints": [3]
        });
        let event = BreakEvent::from_body(&body);
        assert_eq!(event.source_line, Some(5));
        assert_eq!(event.breakpoints, vec![3]);
        assert_eq!(event.script_name(), Some("s_abc.js [temp]"));
        assert_eq!(event.raw, body);
    }

    #[test]
    fn malformed_body_keeps_raw() {
        let body = json!("garbage");
        let event = BreakEvent::from_body(&body);
        assert_eq!(event.source_line, None);
        assert_eq!(event.raw, body);
    }

    #[test]
    fn exception_description() {
        let event = ExceptionEvent::from_body(&json!({
            "uncaught": true,
            "exception": {"type": "error", "text": "ReferenceError: y is not defined"}
        }));
        assert!(event.uncaught);
        assert_eq!(event.description(), "ReferenceError: y is not defined");
    }
}
