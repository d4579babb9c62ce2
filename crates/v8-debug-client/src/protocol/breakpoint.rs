use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A logical breakpoint: where to stop, independent of any script name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakpointSpec {
    pub line: u32,
    pub column: Option<u32>,
    pub enabled: bool,
    pub condition: Option<String>,
    pub ignore_count: Option<u32>,
}

impl BreakpointSpec {
    pub fn at_line(line: u32) -> Self {
        Self {
            line,
            column: None,
            enabled: true,
            condition: None,
            ignore_count: None,
        }
    }

    pub fn column(mut self, column: u32) -> Self {
        self.column = Some(column);
        self
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn condition(mut self, condition: impl Into<String>) -> Self {
        self.condition = Some(condition.into());
        self
    }

    pub fn ignore_count(mut self, count: u32) -> Self {
        self.ignore_count = Some(count);
        self
    }
}

/// A protocol-level breakpoint as reported by `listbreakpoints`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Breakpoint {
    pub number: u32,
    #[serde(default)]
    pub line: Option<u32>,
    #[serde(default)]
    pub column: Option<u32>,
    #[serde(default = "default_active", rename = "active")]
    pub enabled: bool,
    #[serde(default)]
    pub condition: Option<String>,
    #[serde(default, rename = "ignoreCount")]
    pub ignore_count: Option<u32>,
    #[serde(default)]
    pub hit_count: Option<u32>,
    #[serde(default)]
    pub script_name: Option<String>,
}

fn default_active() -> bool {
    true
}

impl Breakpoint {
    /// Parses the `breakpoints` array of a `listbreakpoints` body. Entries
    /// that are not script breakpoints (no number) are skipped.
    pub fn list_from_body(body: &Value) -> Vec<Breakpoint> {
        body.get("breakpoints")
            .and_then(Value::as_array)
            .map(|entries| {
                entries
                    .iter()
                    .filter_map(|entry| serde_json::from_value(entry.clone()).ok())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn is_bound_to(&self, script_name: &str) -> bool {
        self.script_name.as_deref() == Some(script_name)
    }
}

/// Server-assigned number from a `setbreakpoint` response body.
pub fn breakpoint_number(body: &Value) -> Option<u32> {
    body.get("breakpoint")
        .and_then(Value::as_u64)
        .and_then(|number| u32::try_from(number).ok())
}
