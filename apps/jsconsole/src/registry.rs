//! Maps client connections to their debug sessions.
//!
//! Each connection id owns at most one [`DebugSession`] and one script engine.
//! Break, exception, console and evaluation output of every session is
//! republished on one broadcast channel, tagged with the connection id.

use std::collections::HashMap;
use std::io;
use std::net::{Ipv4Addr, TcpListener};
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{Mutex, OnceCell, broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use v8_debug_client::protocol::ChangeBreakpointArgs;
use v8_debug_client::{BreakEvent, Breakpoint, BreakpointSpec, ExceptionEvent, StepAction};

use crate::config::SessionConfig;
use crate::engine::{
    ConsoleMessage, ConsoleSink, EngineError, EngineLauncher, EvalResult, LaunchContext,
};
use crate::session::scope::ScopeVariables;
use crate::session::{DebugSession, SessionError};

const NOTIFICATION_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    BreakpointHit(BreakEvent),
    Exception(ExceptionEvent),
    EvalResult(EvalResult),
    Console(ConsoleMessage),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionNotification {
    pub connection_id: String,
    pub event: SessionEvent,
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("no free debug port: {0}")]
    Port(#[from] io::Error),
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error("no session for connection {0}")]
    UnknownConnection(String),
}

struct SessionEntry {
    session: DebugSession,
    forwarder: JoinHandle<()>,
}

impl SessionEntry {
    async fn dispose(&self) {
        self.forwarder.abort();
        self.session.dispose().await;
    }
}

/// Filled once by whichever caller creates the connection's session; other
/// callers for the same id wait on it without holding the map lock.
type Slot = Arc<OnceCell<SessionEntry>>;

pub struct SessionRegistry {
    launcher: Arc<dyn EngineLauncher>,
    config: SessionConfig,
    sessions: Mutex<HashMap<String, Slot>>,
    notifications: broadcast::Sender<SessionNotification>,
}

impl SessionRegistry {
    pub fn new(launcher: Arc<dyn EngineLauncher>, config: SessionConfig) -> Self {
        let (notifications, _) = broadcast::channel(NOTIFICATION_CAPACITY);
        Self {
            launcher,
            config,
            sessions: Mutex::new(HashMap::new()),
            notifications,
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionNotification> {
        self.notifications.subscribe()
    }

    /// Returns the connection's session, launching an engine and attaching to
    /// it on first use. Concurrent calls for one id create one session; other
    /// ids are served while it launches.
    pub async fn get_or_create(&self, connection_id: &str) -> Result<DebugSession, RegistryError> {
        let slot = Arc::clone(
            self.sessions
                .lock()
                .await
                .entry(connection_id.to_string())
                .or_default(),
        );

        match slot.get_or_try_init(|| self.create(connection_id)).await {
            Ok(entry) => {
                let session = entry.session.clone();
                if !self.holds(connection_id, &slot).await {
                    // Removed while it was being created.
                    entry.dispose().await;
                    return Err(RegistryError::UnknownConnection(connection_id.to_string()));
                }
                Ok(session)
            }
            Err(err) => {
                let mut sessions = self.sessions.lock().await;
                // Keep the slot if another caller is still waiting on it.
                let abandoned = sessions.get(connection_id).is_some_and(|current| {
                    Arc::ptr_eq(current, &slot)
                        && !current.initialized()
                        && Arc::strong_count(current) == 2
                });
                if abandoned {
                    sessions.remove(connection_id);
                }
                Err(err)
            }
        }
    }

    async fn create(&self, connection_id: &str) -> Result<SessionEntry, RegistryError> {
        let port = free_loopback_port()?;
        let (console, console_rx) = ConsoleSink::channel();
        let engine = self
            .launcher
            .launch(LaunchContext {
                name: connection_id.to_string(),
                debug_port: port,
                console,
            })
            .await?;
        let uri = self.config.debug_uri(port);
        let session =
            DebugSession::attach(connection_id, &uri, engine, self.config.clone()).await?;

        let forwarder = tokio::spawn(forward_events(
            connection_id.to_string(),
            session.subscribe_breaks(),
            session.subscribe_exceptions(),
            console_rx,
            self.notifications.clone(),
        ));
        info!(connection_id, %uri, "debug session attached");
        Ok(SessionEntry { session, forwarder })
    }

    async fn holds(&self, connection_id: &str, slot: &Slot) -> bool {
        self.sessions
            .lock()
            .await
            .get(connection_id)
            .is_some_and(|current| Arc::ptr_eq(current, slot))
    }

    /// Sessions still being created are not returned.
    pub async fn get(&self, connection_id: &str) -> Option<DebugSession> {
        self.sessions
            .lock()
            .await
            .get(connection_id)
            .and_then(|slot| slot.get())
            .map(|entry| entry.session.clone())
    }

    pub async fn contains(&self, connection_id: &str) -> bool {
        self.get(connection_id).await.is_some()
    }

    pub async fn len(&self) -> usize {
        self.sessions
            .lock()
            .await
            .values()
            .filter(|slot| slot.initialized())
            .count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Tears the connection's session down. Returns false for unknown ids.
    /// A session still being created is disposed by its creator.
    pub async fn remove(&self, connection_id: &str) -> bool {
        let slot = self.sessions.lock().await.remove(connection_id);
        let Some(entry) = slot.as_ref().and_then(|slot| slot.get()) else {
            return false;
        };
        entry.dispose().await;
        info!(connection_id, "debug session removed");
        true
    }

    pub async fn shutdown(&self) {
        let slots: Vec<(String, Slot)> = self.sessions.lock().await.drain().collect();
        for (connection_id, slot) in slots {
            if let Some(entry) = slot.get() {
                entry.dispose().await;
                debug!(connection_id = %connection_id, "debug session closed on shutdown");
            }
        }
    }

    /// Evaluates in the connection's session and publishes the result.
    pub async fn evaluate(&self, connection_id: &str, code: &str) -> Result<EvalResult, RegistryError> {
        let result = self.session(connection_id).await?.evaluate(code).await?;
        self.publish(connection_id, SessionEvent::EvalResult(result.clone()));
        Ok(result)
    }

    pub async fn interrupt(&self, connection_id: &str) -> Result<(), RegistryError> {
        Ok(self.session(connection_id).await?.interrupt().await?)
    }

    pub async fn set_breakpoint(
        &self,
        connection_id: &str,
        spec: BreakpointSpec,
    ) -> Result<u32, RegistryError> {
        Ok(self.session(connection_id).await?.set_breakpoint(spec).await?)
    }

    pub async fn clear_breakpoint(&self, connection_id: &str, number: u32) -> Result<(), RegistryError> {
        Ok(self
            .session(connection_id)
            .await?
            .clear_breakpoint(number)
            .await?)
    }

    pub async fn change_breakpoint(
        &self,
        connection_id: &str,
        args: ChangeBreakpointArgs,
    ) -> Result<(), RegistryError> {
        Ok(self
            .session(connection_id)
            .await?
            .change_breakpoint(args)
            .await?)
    }

    pub async fn list_breakpoints(&self, connection_id: &str) -> Result<Vec<Breakpoint>, RegistryError> {
        Ok(self.session(connection_id).await?.list_breakpoints().await?)
    }

    pub async fn continue_execution(
        &self,
        connection_id: &str,
        action: StepAction,
        count: Option<u32>,
    ) -> Result<Value, RegistryError> {
        let response = self
            .session(connection_id)
            .await?
            .continue_execution(action, count)
            .await?;
        Ok(response.body)
    }

    pub async fn get_scope_variables(
        &self,
        connection_id: &str,
        scope: Option<u32>,
        frame: Option<u32>,
    ) -> Result<Vec<ScopeVariables>, RegistryError> {
        Ok(self
            .session(connection_id)
            .await?
            .get_scope_variables(scope, frame)
            .await?)
    }

    pub async fn disconnect(&self, connection_id: &str) -> Result<(), RegistryError> {
        Ok(self.session(connection_id).await?.disconnect().await?)
    }

    async fn session(&self, connection_id: &str) -> Result<DebugSession, RegistryError> {
        self.get(connection_id)
            .await
            .ok_or_else(|| RegistryError::UnknownConnection(connection_id.to_string()))
    }

    fn publish(&self, connection_id: &str, event: SessionEvent) {
        // No subscribers is fine.
        let _ = self.notifications.send(SessionNotification {
            connection_id: connection_id.to_string(),
            event,
        });
    }
}

/// Asks the OS for an unused loopback port. The listener is dropped before
/// the engine binds it, so another process could take the port in between.
fn free_loopback_port() -> io::Result<u16> {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))?;
    Ok(listener.local_addr()?.port())
}

async fn forward_events(
    connection_id: String,
    mut breaks: broadcast::Receiver<BreakEvent>,
    mut exceptions: broadcast::Receiver<ExceptionEvent>,
    mut console: mpsc::UnboundedReceiver<ConsoleMessage>,
    notifications: broadcast::Sender<SessionNotification>,
) {
    let mut console_open = true;
    loop {
        let event = tokio::select! {
            event = breaks.recv() => match event {
                Ok(event) => SessionEvent::BreakpointHit(event),
                Err(RecvError::Lagged(skipped)) => {
                    warn!(connection_id = %connection_id, skipped, "break notifications dropped");
                    continue;
                }
                Err(RecvError::Closed) => break,
            },
            event = exceptions.recv() => match event {
                Ok(event) => SessionEvent::Exception(event),
                Err(RecvError::Lagged(skipped)) => {
                    warn!(connection_id = %connection_id, skipped, "exception notifications dropped");
                    continue;
                }
                Err(RecvError::Closed) => break,
            },
            message = console.recv(), if console_open => match message {
                Some(message) => SessionEvent::Console(message),
                None => {
                    console_open = false;
                    continue;
                }
            },
        };
        let _ = notifications.send(SessionNotification {
            connection_id: connection_id.clone(),
            event,
        });
    }
    debug!(connection_id = %connection_id, "event forwarding stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn notifications_serialize_tagged() {
        let notification = SessionNotification {
            connection_id: "c1".to_string(),
            event: SessionEvent::Console(ConsoleMessage {
                level: crate::engine::ConsoleLevel::Warn,
                text: "careful".to_string(),
            }),
        };
        let value = serde_json::to_value(&notification).unwrap();
        assert_eq!(value["connection_id"], "c1");
        assert_eq!(value["event"]["type"], "console");
        assert_eq!(value["event"]["level"], "warn");
    }

    #[test]
    fn free_port_is_nonzero() {
        assert_ne!(free_loopback_port().unwrap(), 0);
    }
}
