//! The script engine seam.
//!
//! A debug session never runs JavaScript itself. It hands code to a
//! [`ScriptEngine`] under the session's current document name and talks to the
//! engine's debug port over a [`ProtocolClient`] on the side.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;
use v8_debug_client::{ProtocolClient, RequestError, Response};

mod debug_channel;

pub use debug_channel::DebugChannelEngine;

/// Suffix the engine appends to a document name when it compiles a script.
pub const TEMP_SCRIPT_SUFFIX: &str = " [temp]";

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("script engine failed to start: {0}")]
    Launch(String),
    #[error("script engine disposed")]
    Disposed,
    #[error("{command} rejected by engine: {message}")]
    Rejected {
        command: &'static str,
        message: String,
    },
    #[error(transparent)]
    Request(#[from] RequestError),
}

/// Outcome of running code. A script error is a successful call with
/// `success == false`; [`EngineError`] is for the engine itself failing.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EvalResult {
    pub success: bool,
    pub running: bool,
    pub body: Value,
    pub message: Option<String>,
}

impl EvalResult {
    pub fn value(&self) -> &Value {
        &self.body["value"]
    }

    /// One-line rendering for consoles.
    pub fn display_text(&self) -> String {
        if !self.success {
            return self
                .message
                .clone()
                .unwrap_or_else(|| "evaluation failed".to_string());
        }
        match self.body.get("text").and_then(Value::as_str) {
            Some(text) => text.to_string(),
            None => match self.value() {
                Value::Null => self.body.to_string(),
                value => value.to_string(),
            },
        }
    }
}

impl From<Response> for EvalResult {
    fn from(response: Response) -> Self {
        let message = response.failure_message();
        Self {
            success: response.success,
            running: response.running,
            body: response.body,
            message,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsoleLevel {
    Log,
    Info,
    Warn,
    Error,
    Debug,
}

impl fmt::Display for ConsoleLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConsoleLevel::Log => "log",
            ConsoleLevel::Info => "info",
            ConsoleLevel::Warn => "warn",
            ConsoleLevel::Error => "error",
            ConsoleLevel::Debug => "debug",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConsoleMessage {
    pub level: ConsoleLevel,
    pub text: String,
}

/// Where an engine's `console.*` output goes.
#[derive(Debug, Clone)]
pub struct ConsoleSink {
    tx: Option<mpsc::UnboundedSender<ConsoleMessage>>,
}

impl ConsoleSink {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ConsoleMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx: Some(tx) }, rx)
    }

    pub fn discard() -> Self {
        Self { tx: None }
    }

    /// False once nobody is listening.
    pub fn write(&self, level: ConsoleLevel, text: impl Into<String>) -> bool {
        match &self.tx {
            Some(tx) => tx
                .send(ConsoleMessage {
                    level,
                    text: text.into(),
                })
                .is_ok(),
            None => false,
        }
    }

    pub fn log(&self, text: impl Into<String>) -> bool {
        self.write(ConsoleLevel::Log, text)
    }
}

#[async_trait]
pub trait ScriptEngine: Send + Sync {
    /// Appended to the document name to form the script name the debug
    /// agent reports and breakpoints target.
    fn target_suffix(&self) -> &'static str {
        TEMP_SCRIPT_SUFFIX
    }

    /// Runs `code` as the script `document`; returns once execution finished.
    async fn evaluate(
        &self,
        debugger: &ProtocolClient,
        document: &str,
        code: &str,
    ) -> Result<EvalResult, EngineError>;

    /// Forces running script to stop.
    async fn interrupt(&self, debugger: &ProtocolClient) -> Result<(), EngineError>;

    /// Releases the engine. Idempotent.
    async fn dispose(&self);
}

/// Everything an engine needs at start-up.
#[derive(Debug, Clone)]
pub struct LaunchContext {
    pub name: String,
    /// Loopback port the engine must expose its debug agent on.
    pub debug_port: u16,
    pub console: ConsoleSink,
}

#[async_trait]
pub trait EngineLauncher: Send + Sync {
    async fn launch(&self, context: LaunchContext) -> Result<Arc<dyn ScriptEngine>, EngineError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn eval_result_from_failed_response() {
        let response: Response = serde_json::from_value(json!({
            "request_seq": 4,
            "command": "evaluate",
            "success": false,
            "message": "SyntaxError: Unexpected end of input"
        }))
        .unwrap();
        let result = EvalResult::from(response);
        assert!(!result.success);
        assert_eq!(result.display_text(), "SyntaxError: Unexpected end of input");
        assert_eq!(result.value(), &Value::Null);
    }

    #[test]
    fn display_prefers_text() {
        let result = EvalResult {
            success: true,
            running: false,
            body: json!({"type": "number", "value": 2, "text": "2"}),
            message: None,
        };
        assert_eq!(result.display_text(), "2");
        assert_eq!(result.value(), &json!(2));
    }

    #[tokio::test]
    async fn console_sink_delivers_until_receiver_drops() {
        let (sink, mut rx) = ConsoleSink::channel();
        assert!(sink.log("hello"));
        assert!(sink.write(ConsoleLevel::Warn, "careful"));
        assert_eq!(rx.recv().await.unwrap().text, "hello");
        assert_eq!(rx.recv().await.unwrap().level, ConsoleLevel::Warn);
        drop(rx);
        assert!(!sink.log("gone"));
        assert!(!ConsoleSink::discard().log("nowhere"));
    }
}
