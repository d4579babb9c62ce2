//! Typed request/response/event envelopes.
//!
//! Each command carries its own argument struct so arguments never leak
//! between commands; optional arguments are left off the wire entirely.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use super::breakpoint::BreakpointSpec;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepAction {
    In,
    Next,
    Out,
}

impl StepAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepAction::In => "in",
            StepAction::Next => "next",
            StepAction::Out => "out",
        }
    }
}

impl std::str::FromStr for StepAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "in" | "into" => Ok(StepAction::In),
            "next" | "over" => Ok(StepAction::Next),
            "out" => Ok(StepAction::Out),
            other => Err(format!("unknown step action '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BacktraceArgs {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from_frame: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub to_frame: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bottom: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeBreakpointArgs {
    pub breakpoint: u32,
    #[serde(skip_serializing_if = "is_true")]
    pub enabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    #[serde(skip_serializing_if = "is_zero")]
    pub ignore_count: u32,
}

impl ChangeBreakpointArgs {
    pub fn new(breakpoint: u32) -> Self {
        Self {
            breakpoint,
            enabled: true,
            condition: None,
            ignore_count: 0,
        }
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn condition(mut self, condition: impl Into<String>) -> Self {
        self.condition = non_blank(condition.into());
        self
    }

    pub fn ignore_count(mut self, count: u32) -> Self {
        self.ignore_count = count;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ClearBreakpointArgs {
    pub breakpoint: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContinueArgs {
    #[serde(rename = "stepaction")]
    pub step_action: StepAction,
    #[serde(skip_serializing_if = "is_single_step")]
    pub step_count: u32,
}

impl ContinueArgs {
    pub fn new(step_action: StepAction) -> Self {
        Self {
            step_action,
            step_count: 1,
        }
    }

    pub fn step_count(mut self, count: u32) -> Self {
        self.step_count = count;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EvaluateArgs {
    pub expression: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frame: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub global: Option<bool>,
    pub disable_break: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub additional_context: Option<Vec<Value>>,
}

impl EvaluateArgs {
    /// Evaluation in the top frame of a paused engine.
    pub fn immediate(expression: impl Into<String>, disable_break: bool) -> Self {
        Self {
            expression: expression.into(),
            frame: Some(0),
            global: None,
            disable_break,
            additional_context: Some(Vec::new()),
        }
    }

    /// Evaluation in the global scope; usable while the engine is running.
    pub fn global(expression: impl Into<String>) -> Self {
        Self {
            expression: expression.into(),
            frame: None,
            global: Some(true),
            disable_break: false,
            additional_context: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FrameArgs {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub number: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LookupArgs {
    pub handles: Vec<i64>,
    pub include_source: bool,
}

impl LookupArgs {
    pub fn new(handles: impl Into<Vec<i64>>) -> Self {
        Self {
            handles: handles.into(),
            include_source: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScopeArgs {
    pub number: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frame_number: Option<u32>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScopesArgs {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frame_number: Option<u32>,
}

/// Bit set of script kinds accepted by the `scripts` command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct ScriptTypes(pub u8);

impl ScriptTypes {
    pub const NATIVE: ScriptTypes = ScriptTypes(1);
    pub const EXTENSION: ScriptTypes = ScriptTypes(2);
    pub const NORMAL: ScriptTypes = ScriptTypes(4);
}

impl std::ops::BitOr for ScriptTypes {
    type Output = ScriptTypes;

    fn bitor(self, rhs: Self) -> Self::Output {
        ScriptTypes(self.0 | rhs.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum ScriptFilter {
    Id(i64),
    Text(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScriptsArgs {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub types: Option<ScriptTypes>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ids: Option<Vec<i64>>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub include_source: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filter: Option<ScriptFilter>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceArgs {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frame: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from_line: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub to_line: Option<u32>,
}

/// `setbreakpoint` arguments: one logical breakpoint bound to a concrete
/// script name.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SetBreakpointArgs {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub target: String,
    pub line: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub column: Option<u32>,
    #[serde(skip_serializing_if = "is_true")]
    pub enabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ignore_count: Option<u32>,
}

impl SetBreakpointArgs {
    pub fn bind(spec: &BreakpointSpec, target: impl Into<String>) -> Self {
        Self {
            kind: "script",
            target: target.into(),
            line: spec.line,
            column: spec.column.filter(|column| *column > 0),
            enabled: spec.enabled,
            condition: spec.condition.clone().and_then(non_blank),
            ignore_count: spec.ignore_count.filter(|count| *count > 0),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Backtrace(BacktraceArgs),
    ChangeBreakpoint(ChangeBreakpointArgs),
    ClearBreakpoint(ClearBreakpointArgs),
    Continue(ContinueArgs),
    Disconnect,
    Evaluate(EvaluateArgs),
    Frame(FrameArgs),
    Gc,
    ListBreakpoints,
    Lookup(LookupArgs),
    Scope(ScopeArgs),
    Scopes(ScopesArgs),
    Scripts(ScriptsArgs),
    SetBreakpoint(SetBreakpointArgs),
    Source(SourceArgs),
    Suspend,
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::Backtrace(_) => "backtrace",
            Command::ChangeBreakpoint(_) => "changebreakpoint",
            Command::ClearBreakpoint(_) => "clearbreakpoint",
            Command::Continue(_) => "continue",
            Command::Disconnect => "disconnect",
            Command::Evaluate(_) => "evaluate",
            Command::Frame(_) => "frame",
            Command::Gc => "gc",
            Command::ListBreakpoints => "listbreakpoints",
            Command::Lookup(_) => "lookup",
            Command::Scope(_) => "scope",
            Command::Scopes(_) => "scopes",
            Command::Scripts(_) => "scripts",
            Command::SetBreakpoint(_) => "setbreakpoint",
            Command::Source(_) => "source",
            Command::Suspend => "suspend",
        }
    }

    /// Argument object for the wire. Commands without arguments send `{}`.
    pub fn arguments(&self) -> Result<Value, serde_json::Error> {
        match self {
            Command::Backtrace(args) => serde_json::to_value(args),
            Command::ChangeBreakpoint(args) => serde_json::to_value(args),
            Command::ClearBreakpoint(args) => serde_json::to_value(args),
            Command::Continue(args) => serde_json::to_value(args),
            Command::Evaluate(args) => serde_json::to_value(args),
            Command::Frame(args) => serde_json::to_value(args),
            Command::Lookup(args) => serde_json::to_value(args),
            Command::Scope(args) => serde_json::to_value(args),
            Command::Scopes(args) => serde_json::to_value(args),
            Command::Scripts(args) => serde_json::to_value(args),
            Command::SetBreakpoint(args) => serde_json::to_value(args),
            Command::Source(args) => serde_json::to_value(args),
            Command::Disconnect | Command::Gc | Command::ListBreakpoints | Command::Suspend => {
                Ok(json!({}))
            }
        }
    }

    /// Rejects argument combinations the debug agent would refuse anyway.
    pub fn validate(&self) -> Result<(), String> {
        match self {
            Command::Backtrace(args) if args.from_frame.is_some() != args.to_frame.is_some() => {
                Err("backtrace needs both fromFrame and toFrame, or neither".into())
            }
            Command::Backtrace(BacktraceArgs {
                from_frame: Some(from),
                to_frame: Some(to),
                ..
            }) if from > to => Err(format!("backtrace fromFrame {from} is past toFrame {to}")),
            Command::Continue(args) if args.step_count == 0 => {
                Err("continue stepCount must be at least 1".into())
            }
            Command::Evaluate(args) if args.frame.is_some() && args.global == Some(true) => {
                Err("evaluate takes either a frame or global, not both".into())
            }
            Command::Lookup(args) if args.handles.is_empty() => {
                Err("lookup needs at least one handle".into())
            }
            Command::SetBreakpoint(args) if args.target.trim().is_empty() => {
                Err("setbreakpoint needs a target script name".into())
            }
            Command::Source(SourceArgs {
                from_line: Some(from),
                to_line: Some(to),
                ..
            }) if from > to => Err(format!("source fromLine {from} is past toLine {to}")),
            _ => Ok(()),
        }
    }
}

/// A request as built by the caller. `seq` is normally left unset and assigned
/// by the client at send time.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub seq: Option<u64>,
    pub command: Command,
}

impl Request {
    pub fn new(command: Command) -> Self {
        Self { seq: None, command }
    }

    pub fn with_seq(mut self, seq: u64) -> Self {
        self.seq = Some(seq);
        self
    }

    pub fn to_wire(&self, seq: u64) -> Result<String, serde_json::Error> {
        #[derive(Serialize)]
        struct Wire<'a> {
            seq: u64,
            #[serde(rename = "type")]
            kind: &'static str,
            command: &'a str,
            arguments: Value,
        }

        serde_json::to_string(&Wire {
            seq,
            kind: "request",
            command: self.command.name(),
            arguments: self.command.arguments()?,
        })
    }
}

impl From<Command> for Request {
    fn from(command: Command) -> Self {
        Request::new(command)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Response {
    #[serde(default)]
    pub seq: Option<u64>,
    pub request_seq: u64,
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub body: Value,
    #[serde(default)]
    pub running: bool,
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub message: Option<String>,
}

impl Response {
    /// Failure text from the agent, or a generic one when it sent none.
    pub fn failure_message(&self) -> Option<String> {
        if self.success {
            return None;
        }
        Some(
            self.message
                .clone()
                .filter(|message| !message.is_empty())
                .unwrap_or_else(|| {
                    format!("{} failed", self.command.as_deref().unwrap_or("request"))
                }),
        )
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct EventMessage {
    #[serde(default)]
    pub seq: Option<u64>,
    pub event: String,
    #[serde(default)]
    pub body: Value,
}

/// Top-level classification of an inbound message.
#[derive(Debug)]
pub enum Inbound {
    Response(Response),
    Event(EventMessage),
    Unknown(String),
}

pub fn parse_inbound(message: &str) -> Result<Inbound, serde_json::Error> {
    let value: Value = serde_json::from_str(message)?;
    let kind = value
        .get("type")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    match kind.as_str() {
        "response" => serde_json::from_value(value).map(Inbound::Response),
        "event" => serde_json::from_value(value).map(Inbound::Event),
        _ => Ok(Inbound::Unknown(kind)),
    }
}

fn is_true(value: &bool) -> bool {
    *value
}

fn is_zero(value: &u32) -> bool {
    *value == 0
}

fn is_single_step(value: &u32) -> bool {
    *value <= 1
}

fn non_blank(value: String) -> Option<String> {
    if value.trim().is_empty() {
        None
    } else {
        Some(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wire(command: Command, seq: u64) -> Value {
        let text = Request::new(command).to_wire(seq).unwrap();
        serde_json::from_str(&text).unwrap()
    }

    #[test]
    fn request_envelope() {
        let value = wire(Command::Gc, 7);
        assert_eq!(
            value,
            json!({"seq": 7, "type": "request", "command": "gc", "arguments": {}})
        );
    }

    #[test]
    fn continue_omits_single_step_count() {
        let value = wire(Command::Continue(ContinueArgs::new(StepAction::Out)), 1);
        assert_eq!(value["arguments"], json!({"stepaction": "out"}));

        let value = wire(
            Command::Continue(ContinueArgs::new(StepAction::In).step_count(3)),
            2,
        );
        assert_eq!(value["arguments"], json!({"stepaction": "in", "stepCount": 3}));
    }

    #[test]
    fn immediate_evaluate_arguments() {
        let value = wire(Command::Evaluate(EvaluateArgs::immediate("x + 1", true)), 3);
        assert_eq!(
            value["arguments"],
            json!({
                "expression": "x + 1",
                "frame": 0,
                "disable_break": true,
                "additional_context": []
            })
        );
    }

    #[test]
    fn setbreakpoint_drops_default_arguments() {
        let spec = BreakpointSpec::at_line(5).column(0).condition("  ");
        let value = wire(Command::SetBreakpoint(SetBreakpointArgs::bind(&spec, "a.js")), 4);
        assert_eq!(
            value["arguments"],
            json!({"type": "script", "target": "a.js", "line": 5})
        );

        let spec = BreakpointSpec::at_line(9)
            .column(2)
            .enabled(false)
            .condition("i > 3")
            .ignore_count(2);
        let value = wire(Command::SetBreakpoint(SetBreakpointArgs::bind(&spec, "a.js")), 5);
        assert_eq!(
            value["arguments"],
            json!({
                "type": "script",
                "target": "a.js",
                "line": 9,
                "column": 2,
                "enabled": false,
                "condition": "i > 3",
                "ignoreCount": 2
            })
        );
    }

    #[test]
    fn scripts_filter_is_untagged() {
        let args = ScriptsArgs {
            types: Some(ScriptTypes::NORMAL | ScriptTypes::NATIVE),
            filter: Some(ScriptFilter::Text("app".into())),
            ..Default::default()
        };
        let value = wire(Command::Scripts(args), 6);
        assert_eq!(value["arguments"], json!({"types": 5, "filter": "app"}));
    }

    #[test]
    fn validation_catches_bad_combinations() {
        assert!(Command::Lookup(LookupArgs::new(Vec::new())).validate().is_err());
        assert!(
            Command::Backtrace(BacktraceArgs {
                from_frame: Some(1),
                ..Default::default()
            })
            .validate()
            .is_err()
        );
        assert!(
            Command::Continue(ContinueArgs::new(StepAction::Next).step_count(0))
                .validate()
                .is_err()
        );
        assert!(Command::Lookup(LookupArgs::new(vec![3])).validate().is_ok());
    }

    #[test]
    fn classifies_inbound_messages() {
        let response = parse_inbound(
            r#"{"seq":3,"type":"response","request_seq":1,"command":"evaluate","body":{"value":2},"running":false,"success":true}"#,
        )
        .unwrap();
        match response {
            Inbound::Response(response) => {
                assert_eq!(response.request_seq, 1);
                assert_eq!(response.body["value"], json!(2));
                assert!(response.success);
            }
            other => panic!("unexpected {other:?}"),
        }

        let event = parse_inbound(r#"{"seq":4,"type":"event","event":"break","body":{}}"#).unwrap();
        assert!(matches!(event, Inbound::Event(event) if event.event == "break"));

        let unknown = parse_inbound(r#"{"type":"mystery"}"#).unwrap();
        assert!(matches!(unknown, Inbound::Unknown(kind) if kind == "mystery"));
        assert!(parse_inbound("not json").is_err());
    }

    #[test]
    fn failure_message_falls_back_to_command() {
        let response: Response =
            serde_json::from_str(r#"{"request_seq":1,"command":"lookup","success":false}"#)
                .unwrap();
        assert_eq!(response.failure_message().as_deref(), Some("lookup failed"));
    }

    #[test]
    fn step_action_parsing() {
        assert_eq!("into".parse::<StepAction>(), Ok(StepAction::In));
        assert_eq!("OUT".parse::<StepAction>(), Ok(StepAction::Out));
        assert!("sideways".parse::<StepAction>().is_err());
    }
}
