use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use url::Url;

pub mod tcp;
pub mod websocket;

pub use tcp::TcpTransport;
pub use websocket::WebSocketTransport;

/// Byte stream handed to the framing layer.
pub trait DebugStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> DebugStream for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

pub type BoxedStream = Box<dyn DebugStream>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Tcp,
    WebSocket,
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("invalid debugger uri '{uri}': {reason}")]
    InvalidUri { uri: String, reason: String },
    #[error("tcp://, ws:// or wss:// uri required, got '{0}'")]
    UnsupportedScheme(String),
    #[error("tcp:// uri must include a port number: {0}")]
    MissingPort(String),
    #[error("failed to connect to {uri}: {source}")]
    Connect {
        uri: String,
        #[source]
        source: std::io::Error,
    },
    #[error("websocket handshake with {uri} failed: {reason}")]
    Handshake { uri: String, reason: String },
    #[error("transport stream already taken")]
    StreamTaken,
}

/// A connected byte stream to a debugger endpoint.
#[async_trait]
pub trait Transport: Send + Sync {
    fn kind(&self) -> TransportKind;

    /// True until [`Transport::close`] runs. A framed connection closes its
    /// transport when the peer hangs up.
    fn is_connected(&self) -> bool;

    /// Hands out the underlying stream. Only the first call gets it.
    fn take_stream(&self) -> Option<BoxedStream>;

    /// Idempotent.
    async fn close(&self);
}

/// Opens a transport, choosing the implementation from the uri scheme.
pub async fn connect(uri: &str) -> Result<Arc<dyn Transport>, TransportError> {
    let parsed = Url::parse(uri).map_err(|err| TransportError::InvalidUri {
        uri: uri.to_string(),
        reason: err.to_string(),
    })?;
    match parsed.scheme() {
        "tcp" => {
            let host = parsed
                .host_str()
                .ok_or_else(|| TransportError::InvalidUri {
                    uri: uri.to_string(),
                    reason: "missing host".into(),
                })?
                .to_string();
            let port = parsed
                .port()
                .ok_or_else(|| TransportError::MissingPort(uri.to_string()))?;
            let transport = TcpTransport::connect(&host, port).await?;
            Ok(Arc::new(transport))
        }
        "ws" | "wss" => {
            let transport = WebSocketTransport::connect(&parsed).await?;
            Ok(Arc::new(transport))
        }
        other => Err(TransportError::UnsupportedScheme(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn rejects_unknown_scheme() {
        let err = connect("http://127.0.0.1:5858").await.err().expect("error");
        assert!(matches!(err, TransportError::UnsupportedScheme(scheme) if scheme == "http"));
    }

    #[tokio::test]
    async fn tcp_requires_port() {
        let err = connect("tcp://127.0.0.1").await.err().expect("error");
        assert!(matches!(err, TransportError::MissingPort(_)));
    }

    #[tokio::test]
    async fn relative_uri_is_invalid() {
        let err = connect("localhost:5858/debug").await.err().expect("error");
        assert!(matches!(
            err,
            TransportError::InvalidUri { .. } | TransportError::UnsupportedScheme(_)
        ));
    }

    #[tokio::test]
    async fn unreachable_host_surfaces_connect_error() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let err = connect(&format!("tcp://127.0.0.1:{port}"))
            .await
            .err()
            .expect("error");
        assert!(matches!(err, TransportError::Connect { .. }));
    }
}
