use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tracing::debug;
use v8_debug_client::protocol::EvaluateArgs;
use v8_debug_client::{Command, ProtocolClient};

use super::{EngineError, EvalResult, ScriptEngine};

/// Runs code through the debug agent itself: a global `evaluate` tagged with
/// a `sourceURL` so the agent reports it under the session's document name.
///
/// Used when attaching to an engine that is already running somewhere else.
#[derive(Debug, Default)]
pub struct DebugChannelEngine {
    disposed: AtomicBool,
}

impl DebugChannelEngine {
    pub fn new() -> Self {
        Self::default()
    }

    fn ensure_live(&self) -> Result<(), EngineError> {
        if self.disposed.load(Ordering::Acquire) {
            Err(EngineError::Disposed)
        } else {
            Ok(())
        }
    }
}

fn tagged_source(document: &str, code: &str) -> String {
    format!("{code}\n//# sourceURL={document}")
}

#[async_trait]
impl ScriptEngine for DebugChannelEngine {
    fn target_suffix(&self) -> &'static str {
        ""
    }

    async fn evaluate(
        &self,
        debugger: &ProtocolClient,
        document: &str,
        code: &str,
    ) -> Result<EvalResult, EngineError> {
        self.ensure_live()?;
        let args = EvaluateArgs::global(tagged_source(document, code));
        // No deadline: a breakpoint inside the code holds the response until
        // the user resumes. A closed connection still ends the wait.
        let response = debugger
            .send_request_timeout(Command::Evaluate(args), None)
            .await?;
        Ok(EvalResult::from(response))
    }

    async fn interrupt(&self, debugger: &ProtocolClient) -> Result<(), EngineError> {
        self.ensure_live()?;
        let response = debugger.send_request(Command::Suspend).await?;
        match response.failure_message() {
            Some(message) => Err(EngineError::Rejected {
                command: "suspend",
                message,
            }),
            None => Ok(()),
        }
    }

    async fn dispose(&self) {
        if !self.disposed.swap(true, Ordering::AcqRel) {
            debug!("debug channel engine disposed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_is_tagged_with_document() {
        assert_eq!(
            tagged_source("console_abc.js", "1+1"),
            "1+1\n//# sourceURL=console_abc.js"
        );
    }
}
