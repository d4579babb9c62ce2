use std::future::{Future, pending};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::framed::{ConnectionEvent, FramedConnection};
use crate::transport::{self, Transport, TransportError};

use super::events::{BreakEvent, ExceptionEvent};
use super::messages::{EventMessage, Inbound, Request, Response, parse_inbound};
use super::pending::{PendingGuard, PendingTable};

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Events the agent emits that the client knows about but has no use for.
const IGNORED_EVENTS: &[&str] = &[
    "afterCompile",
    "beforeCompile",
    "breakForCommand",
    "newFunction",
    "scriptCollected",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientOptions {
    /// Applied by [`ProtocolClient::send_request`]; `None` waits forever.
    pub request_timeout: Option<Duration>,
    /// Per-subscriber buffer for break and exception events.
    pub event_capacity: usize,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            request_timeout: Some(DEFAULT_REQUEST_TIMEOUT),
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

#[derive(Debug, Error)]
pub enum RequestError {
    #[error("{command} request (seq {seq}) timed out after {after:?}")]
    TimedOut {
        command: &'static str,
        seq: u64,
        after: Duration,
    },
    #[error("debugger connection closed")]
    ConnectionClosed,
    #[error("request cancelled")]
    Cancelled,
    #[error("sequence number {0} is already in flight")]
    DuplicateSequence(u64),
    #[error("invalid request arguments: {0}")]
    InvalidArguments(String),
    #[error("failed to encode request: {0}")]
    Encode(#[source] serde_json::Error),
}

impl RequestError {
    pub fn is_connection_closed(&self) -> bool {
        matches!(self, RequestError::ConnectionClosed)
    }
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Request/response correlation and event fan-out over one debugger
/// connection. Cheap to clone; all clones share the connection.
#[derive(Clone)]
pub struct ProtocolClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    connection: FramedConnection,
    dispatch: Arc<Dispatch>,
    options: ClientOptions,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

/// State shared with the dispatch task.
struct Dispatch {
    pending: PendingTable,
    closed: AtomicBool,
    closed_tx: watch::Sender<bool>,
    breaks: broadcast::Sender<BreakEvent>,
    exceptions: broadcast::Sender<ExceptionEvent>,
}

impl ProtocolClient {
    pub async fn connect(uri: &str, options: ClientOptions) -> Result<Self, ClientError> {
        let transport = transport::connect(uri).await?;
        Self::from_transport(transport, options)
    }

    /// Starts framing and dispatch over an already connected transport.
    pub fn from_transport(
        transport: Arc<dyn Transport>,
        options: ClientOptions,
    ) -> Result<Self, ClientError> {
        let (connection, events) = FramedConnection::start(transport)?;
        let capacity = options.event_capacity.max(1);
        let (closed_tx, _) = watch::channel(false);
        let dispatch = Arc::new(Dispatch {
            pending: PendingTable::new(),
            closed: AtomicBool::new(false),
            closed_tx,
            breaks: broadcast::channel(capacity).0,
            exceptions: broadcast::channel(capacity).0,
        });
        let dispatcher = tokio::spawn(dispatch_loop(Arc::clone(&dispatch), events));
        Ok(Self {
            inner: Arc::new(ClientInner {
                connection,
                dispatch,
                options,
                dispatcher: Mutex::new(Some(dispatcher)),
            }),
        })
    }

    pub fn options(&self) -> &ClientOptions {
        &self.inner.options
    }

    pub fn is_connected(&self) -> bool {
        !self.inner.dispatch.closed.load(Ordering::Acquire) && self.inner.connection.is_connected()
    }

    pub fn subscribe_breaks(&self) -> broadcast::Receiver<BreakEvent> {
        self.inner.dispatch.breaks.subscribe()
    }

    pub fn subscribe_exceptions(&self) -> broadcast::Receiver<ExceptionEvent> {
        self.inner.dispatch.exceptions.subscribe()
    }

    /// Resolves once the connection is gone and every pending request failed.
    pub async fn closed(&self) {
        let mut rx = self.inner.dispatch.closed_tx.subscribe();
        // Only fails if the sender is gone, which means the client is gone too.
        let _ = rx.wait_for(|closed| *closed).await;
    }

    pub fn pending_requests(&self) -> usize {
        self.inner.dispatch.pending.len()
    }

    /// Sends with the default timeout from [`ClientOptions`].
    pub async fn send_request(&self, request: impl Into<Request>) -> Result<Response, RequestError> {
        self.send_request_with(request, self.inner.options.request_timeout, pending())
            .await
    }

    pub async fn send_request_timeout(
        &self,
        request: impl Into<Request>,
        timeout: Option<Duration>,
    ) -> Result<Response, RequestError> {
        self.send_request_with(request, timeout, pending()).await
    }

    /// Sends one request and waits for the earliest of: its response, the
    /// connection closing, `timeout`, or `cancel` completing. Cancelling only
    /// stops the wait; the agent still acts on the request.
    pub async fn send_request_with<F>(
        &self,
        request: impl Into<Request>,
        timeout: Option<Duration>,
        cancel: F,
    ) -> Result<Response, RequestError>
    where
        F: Future<Output = ()>,
    {
        let request = request.into();
        let command = request.command.name();
        request
            .command
            .validate()
            .map_err(RequestError::InvalidArguments)?;

        let dispatch = &self.inner.dispatch;
        let (seq, waiter) = dispatch.pending.register(request.seq)?;
        let _guard = PendingGuard::new(&dispatch.pending, seq);

        // Registered after the close drain ran: nobody would ever fail us.
        if dispatch.closed.load(Ordering::Acquire) {
            return Err(RequestError::ConnectionClosed);
        }

        let message = request.to_wire(seq).map_err(RequestError::Encode)?;
        self.inner
            .connection
            .send(&message)
            .map_err(|_| RequestError::ConnectionClosed)?;
        trace!(seq, command, "request sent");

        let response = async {
            match waiter.await {
                Ok(outcome) => outcome,
                Err(_) => Err(RequestError::ConnectionClosed),
            }
        };
        tokio::pin!(cancel);

        match timeout {
            Some(after) => tokio::select! {
                outcome = tokio::time::timeout(after, response) => outcome
                    .unwrap_or(Err(RequestError::TimedOut { command, seq, after })),
                _ = &mut cancel => Err(RequestError::Cancelled),
            },
            None => tokio::select! {
                outcome = response => outcome,
                _ = &mut cancel => Err(RequestError::Cancelled),
            },
        }
    }

    /// Closes the connection and waits for the pending table to drain.
    pub async fn close(&self) {
        self.inner.connection.close().await;
        let dispatcher = self.inner.dispatcher.lock().take();
        if let Some(dispatcher) = dispatcher {
            let _ = dispatcher.await;
        }
    }
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        self.connection.shutdown();
        if let Some(dispatcher) = self.dispatcher.lock().take() {
            dispatcher.abort();
        }
        self.dispatch.connection_closed();
    }
}

impl Dispatch {
    fn handle_message(&self, message: &str) {
        match parse_inbound(message) {
            Ok(Inbound::Response(response)) => {
                let seq = response.request_seq;
                if !self.pending.resolve(response) {
                    warn!(request_seq = seq, "dropping response with no pending request");
                }
            }
            Ok(Inbound::Event(event)) => self.handle_event(event),
            Ok(Inbound::Unknown(kind)) => {
                warn!(kind = %kind, "unrecognized debugger message type");
            }
            Err(err) => {
                warn!(error = %err, "dropping unparseable debugger message");
            }
        }
    }

    fn handle_event(&self, event: EventMessage) {
        match event.event.as_str() {
            "break" => {
                if self.breaks.receiver_count() > 0 {
                    let _ = self.breaks.send(BreakEvent::from_body(&event.body));
                } else {
                    debug!("break event with no subscribers");
                }
            }
            "exception" => {
                if self.exceptions.receiver_count() > 0 {
                    let _ = self.exceptions.send(ExceptionEvent::from_body(&event.body));
                } else {
                    debug!("exception event with no subscribers");
                }
            }
            name if IGNORED_EVENTS.contains(&name) => {
                trace!(event = name, "ignoring debugger event");
            }
            name => {
                warn!(event = name, body = %event.body, "unrecognized debugger event");
            }
        }
    }

    fn connection_closed(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let failed = self.pending.fail_all();
        self.closed_tx.send_replace(true);
        debug!(failed, "debugger connection closed; pending requests failed");
    }
}

async fn dispatch_loop(dispatch: Arc<Dispatch>, mut events: mpsc::UnboundedReceiver<ConnectionEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            ConnectionEvent::Message(message) => dispatch.handle_message(&message),
            ConnectionEvent::Closed => break,
        }
    }
    dispatch.connection_closed();
}
