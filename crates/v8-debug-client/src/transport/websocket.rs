use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};
use tracing::{debug, trace};
use url::Url;

use super::{BoxedStream, Transport, TransportError, TransportKind};

const PROBE_TIMEOUT: Duration = Duration::from_secs(5);
const CLOSE_GRACE: Duration = Duration::from_secs(1);
const PIPE_CAPACITY: usize = 64 * 1024;
const READ_CHUNK: usize = 16 * 1024;

/// WebSocket endpoint exposed as a plain byte stream.
///
/// A pump task moves bytes between the socket and one end of an in-memory
/// duplex pipe; the other end is what [`Transport::take_stream`] returns.
pub struct WebSocketTransport {
    url: Url,
    stream: Mutex<Option<DuplexStream>>,
    connected: Arc<AtomicBool>,
    shutdown: watch::Sender<bool>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl WebSocketTransport {
    pub async fn connect(url: &Url) -> Result<Self, TransportError> {
        probe(url).await;

        let (ws_stream, _) =
            connect_async(url.as_str())
                .await
                .map_err(|err| TransportError::Handshake {
                    uri: url.to_string(),
                    reason: err.to_string(),
                })?;
        debug!(url = %url, "websocket debugger transport connected");

        let (near, far) = tokio::io::duplex(PIPE_CAPACITY);
        let connected = Arc::new(AtomicBool::new(true));
        let (shutdown, shutdown_rx) = watch::channel(false);
        let pump = tokio::spawn(pump_websocket(
            ws_stream,
            far,
            Arc::clone(&connected),
            shutdown_rx,
        ));

        Ok(Self {
            url: url.clone(),
            stream: Mutex::new(Some(near)),
            connected,
            shutdown,
            pump: Mutex::new(Some(pump)),
        })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::WebSocket
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
        self.connected.store(false, Ordering::Release);
        let _ = self.shutdown.send(true);
        let pump = self.pump.lock().take();
        if let Some(mut pump) = pump {
            if tokio::time::timeout(CLOSE_GRACE, &mut pump).await.is_err() {
                debug!(url = %self.url, "websocket pump did not stop in time; aborting");
                pump.abort();
            }
        }
        self.stream.lock().take();
    }
}

impl Drop for WebSocketTransport {
    fn drop(&mut self) {
        if let Some(pump) = self.pump.lock().take() {
            pump.abort();
        }
    }
}

/// Best-effort HTTP HEAD against the endpoint's host. Failures are ignored;
/// the websocket handshake reports real connectivity problems.
async fn probe(url: &Url) {
    let mut probe_url = url.clone();
    let scheme = if url.scheme() == "wss" { "https" } else { "http" };
    if probe_url.set_scheme(scheme).is_err() {
        return;
    }
    probe_url.set_path("/");
    probe_url.set_query(None);

    let client = match reqwest::Client::builder().timeout(PROBE_TIMEOUT).build() {
        Ok(client) => client,
        Err(err) => {
            debug!(error = %err, "unable to build probe client");
            return;
        }
    };
    match client.head(probe_url.clone()).send().await {
        Ok(response) => {
            debug!(url = %probe_url, status = %response.status(), "websocket endpoint probe")
        }
        Err(err) => debug!(url = %probe_url, error = %err, "websocket probe failed; connecting anyway"),
    }
}

async fn pump_websocket(
    ws_stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    pipe: DuplexStream,
    connected: Arc<AtomicBool>,
    mut shutdown: watch::Receiver<bool>,
) {
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
    let (mut pipe_reader, mut pipe_writer) = tokio::io::split(pipe);
    let mut buf = vec![0u8; READ_CHUNK];

    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    let _ = ws_sender.send(Message::Close(None)).await;
                    break;
                }
            }
            read = pipe_reader.read(&mut buf) => {
                let n = match read {
                    Ok(0) | Err(_) => {
                        let _ = ws_sender.send(Message::Close(None)).await;
                        break;
                    }
                    Ok(n) => n,
                };
                let message = match String::from_utf8(buf[..n].to_vec()) {
                    Ok(text) => Message::Text(text),
                    Err(err) => Message::Binary(err.into_bytes()),
                };
                trace!(bytes = n, "websocket send");
                if ws_sender.send(message).await.is_err() {
                    break;
                }
            }
            incoming = ws_receiver.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        if pipe_writer.write_all(text.as_bytes()).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Binary(data))) => {
                        if pipe_writer.write_all(&data).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    connected.store(false, Ordering::Release);
    let _ = pipe_writer.shutdown().await;
    debug!("websocket pump stopped");
}
