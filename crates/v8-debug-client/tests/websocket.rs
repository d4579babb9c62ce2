use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use test_timeout::tokio_timeout_test;
use tokio::io::BufReader;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;
use v8_debug_client::framed::{encode_frame, read_frame};
use v8_debug_client::protocol::EvaluateArgs;
use v8_debug_client::{ClientOptions, Command, ProtocolClient, TransportKind};

/// Decodes the first complete frame in `buffered`, if there is one yet.
async fn complete_frame(buffered: &[u8]) -> Option<String> {
    let mut reader = BufReader::new(buffered);
    read_frame(&mut reader).await.ok().flatten()
}

/// Accepts connections until one completes a websocket upgrade; the plain
/// HTTP `HEAD` sent ahead of the upgrade fails its handshake and is dropped.
/// Answers one request, then hangs up once `hang_up` fires.
async fn serve_one_request(listener: TcpListener, hang_up: oneshot::Receiver<()>) -> Value {
    let mut socket = loop {
        let (stream, _) = listener.accept().await.expect("accept");
        if let Ok(socket) = accept_async(stream).await {
            break socket;
        }
    };

    let mut buffered = Vec::new();
    let request: Value = loop {
        match socket.next().await.expect("request message").expect("websocket read") {
            Message::Text(text) => buffered.extend_from_slice(text.as_bytes()),
            Message::Binary(data) => buffered.extend_from_slice(&data),
            _ => continue,
        }
        if let Some(message) = complete_frame(&buffered).await {
            break serde_json::from_str(&message).expect("request json");
        }
    };

    let response = json!({
        "seq": 1,
        "type": "response",
        "request_seq": request["seq"],
        "command": request["command"],
        "success": true,
        "running": false,
        "body": {"type": "number", "value": 3, "text": "3"},
    });
    let frame = encode_frame(&response.to_string());
    // Split mid-frame: the byte stream must not depend on message boundaries.
    let (head, tail) = frame.split_at(10);
    socket
        .send(Message::Binary(head.to_vec()))
        .await
        .expect("send head");
    socket
        .send(Message::Text(String::from_utf8(tail.to_vec()).expect("utf8 tail")))
        .await
        .expect("send tail");

    let _ = hang_up.await;
    drop(socket);
    request
}

#[tokio_timeout_test(15)]
async fn request_round_trips_over_websocket_and_hangup_closes() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let (hang_up, hang_up_rx) = oneshot::channel();
    let server = tokio::spawn(serve_one_request(listener, hang_up_rx));

    let client = ProtocolClient::connect(&format!("ws://127.0.0.1:{port}/debug"), ClientOptions::default())
        .await
        .expect("websocket connect");
    assert!(client.is_connected());

    let response = client
        .send_request(Command::Evaluate(EvaluateArgs::global("1+2")))
        .await
        .unwrap();
    assert!(response.success);
    assert_eq!(response.body["value"], json!(3));

    hang_up.send(()).unwrap();
    let request = server.await.unwrap();
    assert_eq!(request["command"], json!("evaluate"));
    assert_eq!(request["arguments"]["expression"], json!("1+2"));

    tokio::time::timeout(Duration::from_secs(5), client.closed())
        .await
        .expect("closed after server hangup");
    assert!(!client.is_connected());
    assert_eq!(client.pending_requests(), 0);
}

#[tokio_timeout_test(15)]
async fn websocket_transport_reports_its_kind_and_closes() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let (_hang_up, hang_up_rx) = oneshot::channel::<()>();
    let _server = tokio::spawn(serve_one_request(listener, hang_up_rx));

    let transport = v8_debug_client::transport::connect(&format!("ws://127.0.0.1:{port}/"))
        .await
        .expect("websocket connect");
    assert_eq!(transport.kind(), TransportKind::WebSocket);
    assert!(transport.is_connected());

    transport.close().await;
    transport.close().await;
    assert!(!transport.is_connected());
    assert!(transport.take_stream().is_none());
}
