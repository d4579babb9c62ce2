use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tracing::debug;

use super::{BoxedStream, Transport, TransportError, TransportKind};

/// Raw socket to a `tcp://host:port` debug agent.
pub struct TcpTransport {
    peer: String,
    stream: Mutex<Option<TcpStream>>,
    connected: AtomicBool,
}

impl TcpTransport {
    pub async fn connect(host: &str, port: u16) -> Result<Self, TransportError> {
        let peer = format!("{host}:{port}");
        let stream = TcpStream::connect((host, port))
            .await
            .map_err(|source| TransportError::Connect {
                uri: format!("tcp://{peer}"),
                source,
            })?;
        if let Err(err) = stream.set_nodelay(true) {
            debug!(peer = %peer, error = %err, "failed to set TCP_NODELAY");
        }
        debug!(peer = %peer, "tcp debugger transport connected");
        Ok(Self::from_stream(peer, stream))
    }

    pub fn from_stream(peer: impl Into<String>, stream: TcpStream) -> Self {
        Self {
            peer: peer.into(),
            stream: Mutex::new(Some(stream)),
            connected: AtomicBool::new(true),
        }
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }
}

#[async_trait]
impl Transport for TcpTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Tcp
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    fn take_stream(&self) -> Option<BoxedStream> {
        self.stream
            .lock()
            .take()
            .map(|stream| Box::new(stream) as BoxedStream)
    }

    async fn close(&self) {
        if self.connected.swap(false, Ordering::AcqRel) {
            debug!(peer = %self.peer, "closing tcp debugger transport");
        }
        // Untaken stream is dropped here; a taken one is owned by the framing loops.
        self.stream.lock().take();
    }
}
