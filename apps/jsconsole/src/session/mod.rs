//! One user's debug session: a protocol client bound to one script engine.
//!
//! The session keeps the illusion of a single editable script. Every
//! evaluation runs under a fresh virtual script name, and the reset cycle
//! moves the user's logical breakpoints onto the new name afterwards.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use v8_debug_client::protocol::{
    BacktraceArgs, ChangeBreakpointArgs, ClearBreakpointArgs, ContinueArgs, EvaluateArgs,
    FrameArgs, LookupArgs, ScopeArgs, ScopesArgs, ScriptsArgs, SetBreakpointArgs, SourceArgs,
    breakpoint_number,
};
use v8_debug_client::{
    BreakEvent, Breakpoint, BreakpointSpec, ClientError, Command, ExceptionEvent, ProtocolClient,
    RequestError, Response, StepAction,
};

use crate::config::SessionConfig;
use crate::engine::{EngineError, EvalResult, ScriptEngine};

pub mod breakpoints;
pub mod scope;
pub mod script;

use breakpoints::{LogicalBreakpoint, LogicalBreakpoints};
use scope::{ScopeResolver, ScopeVariables};
use script::VirtualScript;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("failed to connect to debug agent: {0}")]
    Connect(#[from] ClientError),
    #[error(transparent)]
    Request(#[from] RequestError),
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error("{command} failed: {message}")]
    Protocol {
        command: &'static str,
        message: String,
    },
    #[error("session disconnected")]
    Disconnected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Idle,
    Evaluating,
    Paused,
    /// Terminal.
    Disconnected,
}

#[derive(Clone)]
pub struct DebugSession {
    inner: Arc<SessionInner>,
}

impl std::fmt::Debug for DebugSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DebugSession")
            .field("name", &self.inner.name)
            .finish_non_exhaustive()
    }
}

struct SessionInner {
    name: String,
    client: ProtocolClient,
    engine: Arc<dyn ScriptEngine>,
    config: SessionConfig,
    /// Reset cycles and breakpoint edits run one at a time under this lock.
    cycle: tokio::sync::Mutex<Bookkeeping>,
    state: Arc<watch::Sender<SessionState>>,
    evaluations: AtomicUsize,
    disposed: AtomicBool,
    watcher: Mutex<Option<JoinHandle<()>>>,
}

struct Bookkeeping {
    script: VirtualScript,
    breakpoints: LogicalBreakpoints,
}

impl DebugSession {
    /// Connects to the engine's debug agent at `uri`. The engine is disposed
    /// if the connection cannot be made.
    pub async fn attach(
        name: impl Into<String>,
        uri: &str,
        engine: Arc<dyn ScriptEngine>,
        config: SessionConfig,
    ) -> Result<Self, SessionError> {
        match ProtocolClient::connect(uri, config.client_options()).await {
            Ok(client) => Ok(Self::new(name, client, engine, config)),
            Err(err) => {
                engine.dispose().await;
                Err(err.into())
            }
        }
    }

    pub fn new(
        name: impl Into<String>,
        client: ProtocolClient,
        engine: Arc<dyn ScriptEngine>,
        config: SessionConfig,
    ) -> Self {
        let name = name.into();
        let script = VirtualScript::new(name.clone(), engine.target_suffix());
        let (state, _) = watch::channel(SessionState::Idle);
        let state = Arc::new(state);
        let watcher = tokio::spawn(watch_connection(
            client.clone(),
            client.subscribe_breaks(),
            Arc::clone(&state),
        ));
        debug!(session = %name, script = %script.target(), "debug session created");

        Self {
            inner: Arc::new(SessionInner {
                name,
                client,
                engine,
                config,
                cycle: tokio::sync::Mutex::new(Bookkeeping {
                    script,
                    breakpoints: LogicalBreakpoints::default(),
                }),
                state,
                evaluations: AtomicUsize::new(0),
                disposed: AtomicBool::new(false),
                watcher: Mutex::new(Some(watcher)),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn client(&self) -> &ProtocolClient {
        &self.inner.client
    }

    pub fn state(&self) -> SessionState {
        *self.inner.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.inner.state.subscribe()
    }

    pub fn subscribe_breaks(&self) -> broadcast::Receiver<BreakEvent> {
        self.inner.client.subscribe_breaks()
    }

    pub fn subscribe_exceptions(&self) -> broadcast::Receiver<ExceptionEvent> {
        self.inner.client.subscribe_exceptions()
    }

    /// Script name breakpoints are currently bound against.
    pub async fn script_target(&self) -> String {
        self.inner.cycle.lock().await.script.target()
    }

    pub async fn script_generation(&self) -> u64 {
        self.inner.cycle.lock().await.script.generation()
    }

    pub async fn logical_breakpoints(&self) -> Vec<LogicalBreakpoint> {
        self.inner.cycle.lock().await.breakpoints.snapshot()
    }

    /// Runs `code` in the engine under the current virtual script, then runs
    /// the reset cycle.
    pub async fn evaluate(&self, code: &str) -> Result<EvalResult, SessionError> {
        self.ensure_open()?;
        let document = self.inner.cycle.lock().await.script.document_name();

        self.inner.evaluations.fetch_add(1, Ordering::AcqRel);
        self.transition(SessionState::Evaluating);
        let outcome = self
            .inner
            .engine
            .evaluate(&self.inner.client, &document, code)
            .await;
        let remaining = self.inner.evaluations.fetch_sub(1, Ordering::AcqRel) - 1;

        let result = match outcome {
            Ok(result) => result,
            Err(err) => {
                if remaining == 0 {
                    self.transition_from(SessionState::Evaluating, SessionState::Idle);
                }
                return Err(err.into());
            }
        };
        debug!(
            session = %self.inner.name,
            document = %document,
            success = result.success,
            "evaluation finished"
        );
        let reset = self.reset_cycle().await;
        if remaining == 0 {
            self.transition_from(SessionState::Evaluating, SessionState::Idle);
        }
        reset.map(|()| result)
    }

    /// Stops the engine, moves breakpoints off the half-run script, and steps
    /// out so the engine is not left paused with nobody listening.
    pub async fn interrupt(&self) -> Result<(), SessionError> {
        self.ensure_open()?;
        self.inner.engine.interrupt(&self.inner.client).await?;
        self.reset_cycle().await?;
        self.request(Command::Continue(ContinueArgs::new(StepAction::Out)))
            .await?;
        self.resume_state();
        info!(session = %self.inner.name, "engine interrupted");
        Ok(())
    }

    pub async fn set_breakpoint(&self, spec: BreakpointSpec) -> Result<u32, SessionError> {
        self.ensure_open()?;
        let mut book = self.inner.cycle.lock().await;
        let target = book.script.target();
        let number = self.bind(&spec, &target).await?;
        debug!(session = %self.inner.name, number, line = spec.line, script = %target, "breakpoint set");
        book.breakpoints.push(spec, number);
        Ok(number)
    }

    /// Clears a protocol breakpoint and drops the logical breakpoint bound to it.
    pub async fn clear_breakpoint(&self, number: u32) -> Result<(), SessionError> {
        self.ensure_open()?;
        let mut book = self.inner.cycle.lock().await;
        self.request(Command::ClearBreakpoint(ClearBreakpointArgs { breakpoint: number }))
            .await?;
        if book.breakpoints.remove_bound(number).is_none() {
            debug!(session = %self.inner.name, number, "cleared breakpoint had no logical entry");
        }
        Ok(())
    }

    /// Changes a bound breakpoint; the logical breakpoint follows so the
    /// change survives the next reset cycle.
    pub async fn change_breakpoint(&self, args: ChangeBreakpointArgs) -> Result<(), SessionError> {
        self.ensure_open()?;
        let mut book = self.inner.cycle.lock().await;
        let number = args.breakpoint;
        self.request(Command::ChangeBreakpoint(args.clone())).await?;
        if let Some(entry) = book.breakpoints.find_bound_mut(number) {
            entry.spec.enabled = args.enabled;
            entry.spec.condition = args.condition;
            entry.spec.ignore_count = (args.ignore_count > 0).then_some(args.ignore_count);
        }
        Ok(())
    }

    /// Protocol breakpoints bound to the current virtual script.
    pub async fn list_breakpoints(&self) -> Result<Vec<Breakpoint>, SessionError> {
        self.ensure_open()?;
        let book = self.inner.cycle.lock().await;
        let target = book.script.target();
        let response = self.request(Command::ListBreakpoints).await?;
        Ok(Breakpoint::list_from_body(&response.body)
            .into_iter()
            .filter(|breakpoint| breakpoint.is_bound_to(&target))
            .collect())
    }

    pub async fn continue_execution(
        &self,
        action: StepAction,
        count: Option<u32>,
    ) -> Result<Response, SessionError> {
        self.ensure_open()?;
        let mut args = ContinueArgs::new(action);
        if let Some(count) = count {
            args = args.step_count(count);
        }
        let response = self.request(Command::Continue(args)).await?;
        self.resume_state();
        Ok(response)
    }

    /// Evaluates in the top frame of a paused engine. A script error comes
    /// back as an unsuccessful result, not an error.
    pub async fn evaluate_immediate(
        &self,
        expression: &str,
        disable_break: bool,
    ) -> Result<EvalResult, SessionError> {
        self.ensure_open()?;
        let response = self
            .inner
            .client
            .send_request(Command::Evaluate(EvaluateArgs::immediate(
                expression,
                disable_break,
            )))
            .await?;
        Ok(EvalResult::from(response))
    }

    pub async fn backtrace(&self, args: BacktraceArgs) -> Result<Value, SessionError> {
        self.body(Command::Backtrace(args)).await
    }

    pub async fn frame(&self, number: Option<u32>) -> Result<Value, SessionError> {
        self.body(Command::Frame(FrameArgs { number })).await
    }

    pub async fn scope(&self, number: u32, frame: Option<u32>) -> Result<Value, SessionError> {
        self.body(Command::Scope(ScopeArgs {
            number,
            frame_number: frame,
        }))
        .await
    }

    pub async fn scopes(&self, frame: Option<u32>) -> Result<Value, SessionError> {
        self.body(Command::Scopes(ScopesArgs {
            frame_number: frame,
        }))
        .await
    }

    pub async fn lookup(&self, handles: Vec<i64>, include_source: bool) -> Result<Value, SessionError> {
        let mut args = LookupArgs::new(handles);
        args.include_source = include_source;
        self.body(Command::Lookup(args)).await
    }

    pub async fn scripts(&self, args: ScriptsArgs) -> Result<Value, SessionError> {
        self.body(Command::Scripts(args)).await
    }

    pub async fn source(&self, args: SourceArgs) -> Result<Value, SessionError> {
        self.body(Command::Source(args)).await
    }

    pub async fn gc(&self) -> Result<Value, SessionError> {
        self.body(Command::Gc).await
    }

    /// Variables of one scope (`scope = Some(n)`) or of every scope of the
    /// frame, with handles resolved into plain values.
    pub async fn get_scope_variables(
        &self,
        scope: Option<u32>,
        frame: Option<u32>,
    ) -> Result<Vec<ScopeVariables>, SessionError> {
        let scopes = match scope {
            Some(number) => vec![self.scope(number, frame).await?],
            None => self
                .scopes(frame)
                .await?
                .get("scopes")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default(),
        };

        let mut resolver = ScopeResolver::new(&self.inner.client, self.inner.config.max_scope_depth);
        let mut resolved = Vec::with_capacity(scopes.len());
        for scope in &scopes {
            let object = scope.get("object").cloned().unwrap_or(Value::Null);
            let variables = resolver.resolve(object).await?;
            resolved.push(ScopeVariables::from_scope(scope, variables));
        }
        Ok(resolved)
    }

    /// Detaches the debugger. The agent does not reliably resume a halted
    /// engine on `disconnect`, so breakpoints are cleared and the engine is
    /// stepped out explicitly afterwards.
    pub async fn disconnect(&self) -> Result<(), SessionError> {
        if self.state() == SessionState::Disconnected {
            return Ok(());
        }
        let mut book = self.inner.cycle.lock().await;
        let outcome = self.request(Command::Disconnect).await;

        let bound: Vec<u32> = book.breakpoints.iter().filter_map(|entry| entry.bound).collect();
        book.breakpoints.clear();
        for number in bound {
            if let Err(err) = self
                .request(Command::ClearBreakpoint(ClearBreakpointArgs { breakpoint: number }))
                .await
            {
                debug!(session = %self.inner.name, number, error = %err, "clearing breakpoint after disconnect failed");
            }
        }
        if let Err(err) = self
            .request(Command::Continue(ContinueArgs::new(StepAction::Out)))
            .await
        {
            debug!(session = %self.inner.name, error = %err, "continue after disconnect failed");
        }

        self.transition(SessionState::Disconnected);
        info!(session = %self.inner.name, "debugger disconnected");
        outcome.map(|_| ())
    }

    /// Interrupts and disposes the engine, then closes the debug connection.
    /// Idempotent.
    pub async fn dispose(&self) {
        if self.inner.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        // After a disconnect the agent has already let go of the engine.
        if self.state() != SessionState::Disconnected {
            if let Err(err) = self.inner.engine.interrupt(&self.inner.client).await {
                debug!(session = %self.inner.name, error = %err, "interrupt during dispose failed");
            }
        }
        self.inner.engine.dispose().await;
        self.inner.client.close().await;
        if let Some(watcher) = self.inner.watcher.lock().take() {
            watcher.abort();
        }
        self.transition(SessionState::Disconnected);
        debug!(session = %self.inner.name, "debug session disposed");
    }

    async fn reset_cycle(&self) -> Result<(), SessionError> {
        let mut book = self.inner.cycle.lock().await;
        let previous = book.script.target();

        let listed = self.request(Command::ListBreakpoints).await?;
        let stale: Vec<u32> = Breakpoint::list_from_body(&listed.body)
            .into_iter()
            .filter(|breakpoint| breakpoint.is_bound_to(&previous))
            .map(|breakpoint| breakpoint.number)
            .collect();
        for number in stale {
            self.request(Command::ClearBreakpoint(ClearBreakpointArgs { breakpoint: number }))
                .await?;
        }
        self.request(Command::Gc).await?;

        book.script.regenerate();
        book.breakpoints.unbind_all();
        let target = book.script.target();
        let specs: Vec<BreakpointSpec> = book.breakpoints.iter().map(|entry| entry.spec.clone()).collect();

        let mut first_failure = None;
        for (index, spec) in specs.iter().enumerate() {
            match self.bind(spec, &target).await {
                Ok(number) => book.breakpoints.bind(index, number),
                Err(err) => {
                    warn!(session = %self.inner.name, line = spec.line, error = %err, "failed to rebind breakpoint");
                    first_failure.get_or_insert(err);
                }
            }
        }
        debug!(
            session = %self.inner.name,
            from = %previous,
            to = %target,
            rebound = specs.len(),
            "virtual script regenerated"
        );
        first_failure.map_or(Ok(()), Err)
    }

    async fn bind(&self, spec: &BreakpointSpec, target: &str) -> Result<u32, SessionError> {
        let response = self
            .request(Command::SetBreakpoint(SetBreakpointArgs::bind(spec, target)))
            .await?;
        breakpoint_number(&response.body).ok_or_else(|| SessionError::Protocol {
            command: "setbreakpoint",
            message: "response carried no breakpoint number".to_string(),
        })
    }

    /// Sends a command and turns an unsuccessful response into an error.
    async fn request(&self, command: Command) -> Result<Response, SessionError> {
        let name = command.name();
        let response = self.inner.client.send_request(command).await?;
        match response.failure_message() {
            Some(message) => Err(SessionError::Protocol {
                command: name,
                message,
            }),
            None => Ok(response),
        }
    }

    async fn body(&self, command: Command) -> Result<Value, SessionError> {
        self.ensure_open()?;
        Ok(self.request(command).await?.body)
    }

    fn ensure_open(&self) -> Result<(), SessionError> {
        if self.inner.disposed.load(Ordering::Acquire) || self.state() == SessionState::Disconnected {
            return Err(SessionError::Disconnected);
        }
        Ok(())
    }

    fn transition(&self, to: SessionState) {
        transition(&self.inner.state, |_| true, to);
    }

    fn transition_from(&self, from: SessionState, to: SessionState) {
        transition(&self.inner.state, |current| current == from, to);
    }

    /// After a continue: still evaluating if an evaluation is in flight.
    fn resume_state(&self) {
        let to = if self.inner.evaluations.load(Ordering::Acquire) > 0 {
            SessionState::Evaluating
        } else {
            SessionState::Idle
        };
        self.transition(to);
    }
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        if let Some(watcher) = self.watcher.lock().take() {
            watcher.abort();
        }
    }
}

/// Disconnected is terminal; nothing leaves it.
fn transition(
    state: &watch::Sender<SessionState>,
    allowed: impl Fn(SessionState) -> bool,
    to: SessionState,
) {
    state.send_if_modified(|current| {
        if *current == SessionState::Disconnected || *current == to || !allowed(*current) {
            return false;
        }
        *current = to;
        true
    });
}

async fn watch_connection(
    client: ProtocolClient,
    mut breaks: broadcast::Receiver<BreakEvent>,
    state: Arc<watch::Sender<SessionState>>,
) {
    loop {
        tokio::select! {
            event = breaks.recv() => match event {
                Ok(event) => {
                    debug!(line = ?event.source_line, script = ?event.script_name(), "engine paused");
                    transition(&state, |_| true, SessionState::Paused);
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "break events dropped");
                }
                Err(RecvError::Closed) => break,
            },
            _ = client.closed() => {
                transition(&state, |_| true, SessionState::Disconnected);
                break;
            }
        }
    }
}
