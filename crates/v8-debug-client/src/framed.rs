//! `Content-Length` framing over a [`Transport`] stream.
//!
//! Outbound: `Content-Length: N\r\n\r\n` followed by exactly `N` UTF-8 bytes.
//! Inbound: any line that does not carry a `Content-Length: <digits>` header is
//! informational noise; a header is followed by one separator line and then
//! the body bytes. Zero-length frames (the V8 handshake ends with one) are
//! skipped.

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::transport::{BoxedStream, Transport, TransportError};

const CONTENT_LENGTH: &str = "Content-Length: ";

/// Larger bodies are rejected before anything is allocated for them.
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    Message(String),
    /// Published once, after the reader loop has stopped for any reason.
    Closed,
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("debugger connection closed")]
pub struct ConnectionClosed;

pub fn encode_frame(message: &str) -> Bytes {
    let mut buf = Vec::with_capacity(CONTENT_LENGTH.len() + 24 + message.len());
    buf.extend_from_slice(CONTENT_LENGTH.as_bytes());
    buf.extend_from_slice(message.len().to_string().as_bytes());
    buf.extend_from_slice(b"\r\n\r\n");
    buf.extend_from_slice(message.as_bytes());
    Bytes::from(buf)
}

/// Extracts `N` from a line containing `Content-Length: N`.
pub fn parse_content_length(line: &str) -> Option<usize> {
    let start = line.find(CONTENT_LENGTH)? + CONTENT_LENGTH.len();
    let digits: &str = {
        let rest = &line[start..];
        let end = rest
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(rest.len());
        &rest[..end]
    };
    if digits.is_empty() {
        return None;
    }
    digits.parse().ok()
}

/// Reads the next non-empty frame. `Ok(None)` means end of stream.
///
/// A body that is not valid UTF-8 comes back as `InvalidData`; the stream is
/// still positioned at the next frame, so callers may keep reading. A length
/// above [`MAX_FRAME_LEN`] is also `InvalidData`; its body is left unread and
/// gets skipped as noise.
pub async fn read_frame<R>(reader: &mut R) -> io::Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = Vec::new();
    loop {
        line.clear();
        if reader.read_until(b'\n', &mut line).await? == 0 {
            return Ok(None);
        }
        let text = String::from_utf8_lossy(&line);
        let Some(length) = parse_content_length(&text) else {
            let noise = text.trim_end();
            if !noise.is_empty() {
                debug!(line = %noise, "debugger info");
            }
            continue;
        };

        line.clear();
        reader.read_until(b'\n', &mut line).await?;

        if length == 0 {
            continue;
        }
        if length > MAX_FRAME_LEN {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("frame of {length} bytes exceeds {MAX_FRAME_LEN}"),
            ));
        }

        let mut body = vec![0u8; length];
        reader.read_exact(&mut body).await?;
        return String::from_utf8(body)
            .map(Some)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err));
    }
}

/// Two loops over one transport stream: a writer draining the outbound queue
/// and a reader publishing [`ConnectionEvent`]s.
#[derive(Clone)]
pub struct FramedConnection {
    shared: Arc<Shared>,
}

struct Shared {
    transport: Arc<dyn Transport>,
    outbound: mpsc::UnboundedSender<Bytes>,
    closed: AtomicBool,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl FramedConnection {
    /// Takes the transport stream and spawns the reader and writer loops.
    /// Must be called from within a tokio runtime.
    pub fn start(
        transport: Arc<dyn Transport>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<ConnectionEvent>), TransportError> {
        let stream = transport.take_stream().ok_or(TransportError::StreamTaken)?;
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (shutdown, shutdown_rx) = watch::channel(false);

        let shared = Arc::new(Shared {
            transport,
            outbound,
            closed: AtomicBool::new(false),
            shutdown,
            tasks: Mutex::new(Vec::new()),
        });

        let (read_half, write_half) = tokio::io::split(stream);
        let reader = tokio::spawn(read_loop(
            read_half,
            events_tx,
            Arc::clone(&shared),
            shutdown_rx.clone(),
        ));
        let writer = tokio::spawn(write_loop(
            write_half,
            outbound_rx,
            Arc::clone(&shared),
            shutdown_rx,
        ));
        shared.tasks.lock().extend([reader, writer]);

        debug!(kind = ?shared.transport.kind(), "framed debugger connection started");
        Ok((Self { shared }, events_rx))
    }

    /// Queues one message. Frames never interleave on the wire.
    pub fn send(&self, message: &str) -> Result<(), ConnectionClosed> {
        if !self.is_connected() {
            return Err(ConnectionClosed);
        }
        trace!(message, "debugger request");
        self.shared
            .outbound
            .send(encode_frame(message))
            .map_err(|_| ConnectionClosed)
    }

    pub fn is_connected(&self) -> bool {
        !self.shared.closed.load(Ordering::Acquire) && self.shared.transport.is_connected()
    }

    /// Signals both loops to stop without waiting for them.
    pub fn shutdown(&self) {
        let _ = self.shared.shutdown.send(true);
    }

    /// Stops both loops and closes the transport. Safe to call repeatedly and
    /// from any task.
    pub async fn close(&self) {
        self.shutdown();
        self.shared.transport.close().await;
        let tasks: Vec<_> = self.shared.tasks.lock().drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }
    }
}

async fn read_loop(
    read_half: tokio::io::ReadHalf<BoxedStream>,
    events: mpsc::UnboundedSender<ConnectionEvent>,
    shared: Arc<Shared>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut reader = BufReader::new(read_half);
    let mut peer_gone = false;
    loop {
        if *shutdown.borrow() {
            break;
        }
        tokio::select! {
            _ = shutdown.changed() => break,
            frame = read_frame(&mut reader) => match frame {
                Ok(Some(message)) => {
                    trace!(message = %message, "debugger message");
                    if events.send(ConnectionEvent::Message(message)).is_err() {
                        break;
                    }
                }
                Ok(None) => {
                    debug!("debugger stream ended");
                    peer_gone = true;
                    break;
                }
                Err(err) if err.kind() == io::ErrorKind::InvalidData => {
                    warn!(error = %err, "dropping undecodable debugger frame");
                }
                Err(err) => {
                    debug!(error = %err, "debugger stream read failed");
                    peer_gone = true;
                    break;
                }
            },
        }
    }

    if peer_gone {
        shared.transport.close().await;
    }

    shared.closed.store(true, Ordering::Release);
    let _ = shared.shutdown.send(true);
    debug!("debugger connection closed");
    let _ = events.send(ConnectionEvent::Closed);
}

async fn write_loop(
    mut write_half: tokio::io::WriteHalf<BoxedStream>,
    mut outbound: mpsc::UnboundedReceiver<Bytes>,
    shared: Arc<Shared>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        if *shutdown.borrow() {
            break;
        }
        let frame = tokio::select! {
            _ = shutdown.changed() => break,
            frame = outbound.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };
        if let Err(err) = write_frame(&mut write_half, &frame).await {
            debug!(error = %err, "debugger stream write failed");
            let _ = shared.shutdown.send(true);
            break;
        }
    }
    let _ = write_half.shutdown().await;
}

async fn write_frame(
    write_half: &mut tokio::io::WriteHalf<BoxedStream>,
    frame: &[u8],
) -> io::Result<()> {
    write_half.write_all(frame).await?;
    write_half.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::TcpTransport;
    use proptest::prelude::*;
    use std::time::Duration;
    use tokio::net::TcpListener;

    fn decode_all(bytes: &[u8]) -> Vec<String> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .build()
            .expect("runtime");
        runtime.block_on(async {
            let mut reader = BufReader::new(bytes);
            let mut out = Vec::new();
            while let Some(message) = read_frame(&mut reader).await.expect("frame") {
                out.push(message);
            }
            out
        })
    }

    #[test]
    fn header_uses_byte_length() {
        let frame = encode_frame("héllo");
        assert_eq!(&frame[..], "Content-Length: 6\r\n\r\nhéllo".as_bytes());
    }

    #[test]
    fn content_length_header_detection() {
        assert_eq!(parse_content_length("Content-Length: 42\r\n"), Some(42));
        assert_eq!(parse_content_length("Content-Length: 0"), Some(0));
        assert_eq!(parse_content_length("Type: connect\r\n"), None);
        assert_eq!(parse_content_length("Content-Length: abc"), None);
        assert_eq!(parse_content_length("Content-Length:12"), None);
    }

    #[test]
    fn skips_handshake_noise_and_empty_frames() {
        let mut wire = Vec::new();
        wire.extend_from_slice(b"Type: connect\r\nV8-Version: 3.28\r\nProtocol-Version: 1\r\n");
        wire.extend_from_slice(b"Embedding-Host: mock\r\nContent-Length: 0\r\n\r\n");
        wire.extend_from_slice(&encode_frame(r#"{"type":"event","event":"break"}"#));
        wire.extend_from_slice(&encode_frame("second"));
        let messages = decode_all(&wire);
        assert_eq!(
            messages,
            vec![r#"{"type":"event","event":"break"}"#.to_string(), "second".to_string()]
        );
    }

    #[test]
    fn invalid_utf8_body_is_reported_and_stream_continues() {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .build()
            .expect("runtime");
        runtime.block_on(async {
            let mut wire = b"Content-Length: 2\r\n\r\n\xff\xfe".to_vec();
            wire.extend_from_slice(&encode_frame("ok"));
            let mut reader = BufReader::new(&wire[..]);
            let err = read_frame(&mut reader).await.expect_err("invalid data");
            assert_eq!(err.kind(), io::ErrorKind::InvalidData);
            let next = read_frame(&mut reader).await.expect("frame");
            assert_eq!(next.as_deref(), Some("ok"));
        });
    }

    #[test]
    fn oversized_length_is_rejected_and_stream_continues() {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .build()
            .expect("runtime");
        runtime.block_on(async {
            let mut wire = b"Content-Length: 18446744073709551615\r\n\r\n".to_vec();
            wire.extend_from_slice(&encode_frame("after"));
            let mut reader = BufReader::new(&wire[..]);
            let err = read_frame(&mut reader).await.expect_err("oversized frame");
            assert_eq!(err.kind(), io::ErrorKind::InvalidData);
            let next = read_frame(&mut reader).await.expect("frame");
            assert_eq!(next.as_deref(), Some("after"));
        });
    }

    proptest! {
        #[test]
        fn frame_round_trip(message in any::<String>()) {
            prop_assume!(!message.is_empty());
            let decoded = decode_all(&encode_frame(&message));
            prop_assert_eq!(decoded, vec![message]);
        }

        #[test]
        fn frame_round_trip_with_line_breaks(head in "\\PC*", tail in "\\PC*") {
            let message = format!("{head}\r\n{tail}\r\n");
            let decoded = decode_all(&encode_frame(&message));
            prop_assert_eq!(decoded, vec![message]);
        }
    }

    async fn connected_pair() -> (FramedConnection, mpsc::UnboundedReceiver<ConnectionEvent>, tokio::net::TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let accept = tokio::spawn(async move { listener.accept().await.unwrap().0 });
        let transport = TcpTransport::connect("127.0.0.1", port).await.unwrap();
        let (connection, events) = FramedConnection::start(Arc::new(transport)).unwrap();
        let peer = accept.await.unwrap();
        (connection, events, peer)
    }

    #[tokio::test]
    async fn sends_framed_messages_and_publishes_inbound() {
        let (connection, mut events, peer) = connected_pair().await;
        let (peer_read, mut peer_write) = peer.into_split();

        connection.send(r#"{"seq":1}"#).unwrap();
        let mut peer_reader = BufReader::new(peer_read);
        let received = read_frame(&mut peer_reader).await.unwrap();
        assert_eq!(received.as_deref(), Some(r#"{"seq":1}"#));

        peer_write.write_all(&encode_frame("pong")).await.unwrap();
        let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .unwrap();
        assert_eq!(event, Some(ConnectionEvent::Message("pong".into())));
    }

    #[tokio::test]
    async fn peer_hangup_publishes_closed_once() {
        let (connection, mut events, peer) = connected_pair().await;
        drop(peer);
        let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .unwrap();
        assert_eq!(event, Some(ConnectionEvent::Closed));
        let after = tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .unwrap();
        assert_eq!(after, None);
        assert!(!connection.is_connected());
        assert_eq!(connection.send("late"), Err(ConnectionClosed));
    }

    #[tokio::test]
    async fn peer_hangup_closes_the_transport() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let accept = tokio::spawn(async move { listener.accept().await.unwrap().0 });
        let transport: Arc<dyn Transport> =
            Arc::new(TcpTransport::connect("127.0.0.1", port).await.unwrap());
        let (_connection, mut events) = FramedConnection::start(Arc::clone(&transport)).unwrap();
        assert!(transport.is_connected());

        drop(accept.await.unwrap());
        let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .unwrap();
        assert_eq!(event, Some(ConnectionEvent::Closed));
        assert!(!transport.is_connected());
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let (connection, mut events, _peer) = connected_pair().await;
        connection.close().await;
        connection.close().await;
        let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .unwrap();
        assert_eq!(event, Some(ConnectionEvent::Closed));
        assert!(!connection.is_connected());
    }

    #[tokio::test]
    async fn stream_can_only_be_started_once() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let _accept = tokio::spawn(async move { listener.accept().await });
        let transport: Arc<dyn Transport> =
            Arc::new(TcpTransport::connect("127.0.0.1", port).await.unwrap());
        let _first = FramedConnection::start(Arc::clone(&transport)).unwrap();
        assert!(matches!(
            FramedConnection::start(transport),
            Err(TransportError::StreamTaken)
        ));
    }
}
