//! In-process debug agent for tests.
//!
//! Speaks the framed wire format over TCP, keeps a breakpoint table, evaluates
//! integer arithmetic, serves a configurable scope/lookup object graph, and
//! records every request it receives.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::io;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::{Map, Value, json};
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::framed::{encode_frame, read_frame};
use crate::protocol::Breakpoint;

const HANDSHAKE: &str = "Type: connect\r\nV8-Version: 3.28.73\r\nProtocol-Version: 1\r\nEmbedding-Host: mock\r\nContent-Length: 0\r\n\r\n";

pub struct MockDebugger {
    port: u16,
    state: Arc<MockState>,
    accept: JoinHandle<()>,
}

#[derive(Default)]
struct MockState {
    inner: Mutex<MockInner>,
    clients: Mutex<Vec<MockClient>>,
}

struct MockClient {
    outbound: mpsc::UnboundedSender<String>,
    tasks: Vec<JoinHandle<()>>,
}

#[derive(Default)]
struct MockInner {
    next_seq: u64,
    next_breakpoint: u32,
    breakpoints: BTreeMap<u32, Value>,
    objects: HashMap<i64, Value>,
    scopes: Vec<Value>,
    canned: HashMap<String, Value>,
    requests: Vec<Value>,
    held: Option<VecDeque<(mpsc::UnboundedSender<String>, String)>>,
    silent: Vec<String>,
}

impl MockDebugger {
    /// Listens on an ephemeral loopback port.
    pub async fn start() -> io::Result<Self> {
        Self::start_on(0).await
    }

    pub async fn start_on(port: u16) -> io::Result<Self> {
        let listener = TcpListener::bind(("127.0.0.1", port)).await?;
        let port = listener.local_addr()?.port();
        let state = Arc::new(MockState::default());
        let accept = tokio::spawn(accept_loop(listener, Arc::clone(&state)));
        debug!(port, "mock debugger listening");
        Ok(Self {
            port,
            state,
            accept,
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn uri(&self) -> String {
        format!("tcp://127.0.0.1:{}", self.port)
    }

    /// Every request received so far, as parsed JSON.
    pub fn requests(&self) -> Vec<Value> {
        self.state.inner.lock().requests.clone()
    }

    pub fn request_count(&self, command: &str) -> usize {
        self.state
            .inner
            .lock()
            .requests
            .iter()
            .filter(|request| request["command"] == command)
            .count()
    }

    pub fn clear_requests(&self) {
        self.state.inner.lock().requests.clear();
    }

    /// Breakpoints currently registered, as `listbreakpoints` would report them.
    pub fn breakpoints(&self) -> Vec<Breakpoint> {
        let body = self.state.inner.lock().list_breakpoints();
        Breakpoint::list_from_body(&body)
    }

    /// Registers an object served by `lookup` under `handle`.
    pub fn insert_object(&self, handle: i64, object: Value) {
        self.state.inner.lock().objects.insert(handle, object);
    }

    /// Scope chain served by `scopes`/`scope`, top scope first.
    pub fn set_scopes(&self, scopes: Vec<Value>) {
        self.state.inner.lock().scopes = scopes;
    }

    /// Fixed successful body for a command the mock does not model itself
    /// (`backtrace`, `frame`, `scripts`, `source`, ...).
    pub fn canned_response(&self, command: &str, body: Value) {
        self.state.inner.lock().canned.insert(command.to_string(), body);
    }

    /// Requests for `command` are recorded but never answered.
    pub fn ignore_command(&self, command: &str) {
        self.state.inner.lock().silent.push(command.to_string());
    }

    /// Queues responses instead of sending them until [`Self::release_responses`].
    pub fn hold_responses(&self) {
        let mut inner = self.state.inner.lock();
        if inner.held.is_none() {
            inner.held = Some(VecDeque::new());
        }
    }

    pub fn held_responses(&self) -> usize {
        self.state
            .inner
            .lock()
            .held
            .as_ref()
            .map_or(0, VecDeque::len)
    }

    /// Sends held responses, most recent first.
    pub fn release_responses(&self) {
        let held = self.state.inner.lock().held.take().unwrap_or_default();
        for (client, message) in held.into_iter().rev() {
            let _ = client.send(message);
        }
    }

    pub fn emit_event(&self, event: &str, body: Value) {
        let seq = self.state.inner.lock().next_seq();
        let message = json!({"seq": seq, "type": "event", "event": event, "body": body});
        self.send_raw(&message.to_string());
    }

    /// Writes an arbitrary message to every connected client.
    pub fn send_raw(&self, message: &str) {
        for client in self.state.clients.lock().iter() {
            let _ = client.outbound.send(message.to_string());
        }
    }

    pub fn connected_clients(&self) -> usize {
        self.state
            .clients
            .lock()
            .iter()
            .filter(|client| !client.outbound.is_closed())
            .count()
    }

    /// Drops every client socket.
    pub fn disconnect_clients(&self) {
        let clients: Vec<_> = self.state.clients.lock().drain(..).collect();
        for client in clients {
            for task in client.tasks {
                task.abort();
            }
        }
    }
}

impl Drop for MockDebugger {
    fn drop(&mut self) {
        self.accept.abort();
        self.disconnect_clients();
    }
}

async fn accept_loop(listener: TcpListener, state: Arc<MockState>) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                debug!(%peer, "mock debugger accepted client");
                let client = serve_client(stream, Arc::clone(&state));
                state.clients.lock().push(client);
            }
            Err(err) => {
                debug!(error = %err, "mock debugger accept failed");
                break;
            }
        }
    }
}

fn serve_client(stream: TcpStream, state: Arc<MockState>) -> MockClient {
    let _ = stream.set_nodelay(true);
    let (read_half, mut write_half) = stream.into_split();
    let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<String>();

    let writer = tokio::spawn(async move {
        if write_half.write_all(HANDSHAKE.as_bytes()).await.is_err() {
            return;
        }
        while let Some(message) = outbound_rx.recv().await {
            if write_half.write_all(&encode_frame(&message)).await.is_err() {
                break;
            }
        }
    });

    let replies = outbound.clone();
    let reader = tokio::spawn(async move {
        let mut reader = BufReader::new(read_half);
        loop {
            let message = match read_frame(&mut reader).await {
                Ok(Some(message)) => message,
                Ok(None) => break,
                Err(err) if err.kind() == io::ErrorKind::InvalidData => continue,
                Err(_) => break,
            };
            let Ok(request) = serde_json::from_str::<Value>(&message) else {
                continue;
            };
            let mut inner = state.inner.lock();
            let Some(response) = inner.handle(request) else {
                continue;
            };
            let text = response.to_string();
            match inner.held.as_mut() {
                Some(held) => held.push_back((replies.clone(), text)),
                None => {
                    let _ = replies.send(text);
                }
            }
        }
    });

    MockClient {
        outbound,
        tasks: vec![reader, writer],
    }
}

impl MockInner {
    fn next_seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }

    fn handle(&mut self, request: Value) -> Option<Value> {
        let request_seq = request["seq"].as_u64().unwrap_or_default();
        let command = request["command"].as_str().unwrap_or_default().to_string();
        let args = request
            .get("arguments")
            .cloned()
            .unwrap_or_else(|| json!({}));
        self.requests.push(request);

        if self.silent.contains(&command) {
            return None;
        }

        let (outcome, running) = match command.as_str() {
            "setbreakpoint" => (self.set_breakpoint(&args), false),
            "clearbreakpoint" => (self.clear_breakpoint(&args), false),
            "changebreakpoint" => (self.change_breakpoint(&args), false),
            "listbreakpoints" => (Ok(self.list_breakpoints()), false),
            "evaluate" => (evaluate(&args), false),
            "lookup" => (self.lookup(&args), false),
            "scopes" => (Ok(self.scopes_body()), false),
            "scope" => (self.scope(&args), false),
            "gc" => (Ok(json!({"before": 4096, "after": 2048})), false),
            "continue" | "disconnect" => (Ok(Value::Null), true),
            "suspend" => (Ok(Value::Null), false),
            other => match self.canned.get(other) {
                Some(body) => (Ok(body.clone()), false),
                None => (Err(format!("Unknown command \"{other}\" in request")), false),
            },
        };

        let seq = self.next_seq();
        let mut response = json!({
            "seq": seq,
            "type": "response",
            "request_seq": request_seq,
            "command": command,
            "running": running,
        });
        match outcome {
            Ok(body) => {
                response["success"] = json!(true);
                response["body"] = body;
            }
            Err(message) => {
                response["success"] = json!(false);
                response["message"] = json!(message);
            }
        }
        Some(response)
    }

    fn set_breakpoint(&mut self, args: &Value) -> Result<Value, String> {
        if args["type"] != "script" {
            return Err(format!("Illegal type \"{}\"", args["type"]));
        }
        let target = args["target"]
            .as_str()
            .ok_or_else(|| "Missing argument \"target\"".to_string())?;
        let line = args["line"]
            .as_u64()
            .ok_or_else(|| "Missing argument \"line\"".to_string())?;
        self.next_breakpoint += 1;
        let number = self.next_breakpoint;
        let entry = json!({
            "type": "scriptName",
            "script_name": target,
            "number": number,
            "line": line,
            "column": args.get("column").cloned().unwrap_or(Value::Null),
            "groupId": null,
            "hit_count": 0,
            "active": args.get("enabled").and_then(Value::as_bool).unwrap_or(true),
            "condition": args.get("condition").cloned().unwrap_or(Value::Null),
            "ignoreCount": args.get("ignoreCount").and_then(Value::as_u64).unwrap_or(0),
            "actual_locations": [],
        });
        self.breakpoints.insert(number, entry);
        Ok(json!({
            "type": "scriptName",
            "breakpoint": number,
            "script_name": target,
            "line": line,
            "column": args.get("column").cloned().unwrap_or(Value::Null),
            "actual_locations": [],
        }))
    }

    fn clear_breakpoint(&mut self, args: &Value) -> Result<Value, String> {
        let number = breakpoint_arg(args)?;
        match self.breakpoints.remove(&number) {
            Some(_) => Ok(json!({"type": "scriptName", "breakpoint": number})),
            None => Err(format!("Unknown breakpoint {number}")),
        }
    }

    fn change_breakpoint(&mut self, args: &Value) -> Result<Value, String> {
        let number = breakpoint_arg(args)?;
        let entry = self
            .breakpoints
            .get_mut(&number)
            .ok_or_else(|| format!("Unknown breakpoint {number}"))?;
        entry["active"] = json!(args.get("enabled").and_then(Value::as_bool).unwrap_or(true));
        entry["condition"] = args.get("condition").cloned().unwrap_or(Value::Null);
        entry["ignoreCount"] = json!(args.get("ignoreCount").and_then(Value::as_u64).unwrap_or(0));
        Ok(Value::Null)
    }

    fn list_breakpoints(&self) -> Value {
        json!({
            "breakpoints": self.breakpoints.values().cloned().collect::<Vec<_>>(),
            "breakOnExceptions": false,
            "breakOnUncaughtExceptions": false,
        })
    }

    fn lookup(&self, args: &Value) -> Result<Value, String> {
        let handles = args["handles"]
            .as_array()
            .ok_or_else(|| "Missing argument \"handles\"".to_string())?;
        let mut body = Map::new();
        for handle in handles {
            let handle = handle
                .as_i64()
                .ok_or_else(|| format!("Invalid handle {handle}"))?;
            let object = self
                .objects
                .get(&handle)
                .ok_or_else(|| format!("Object #{handle}# not found"))?;
            body.insert(handle.to_string(), object.clone());
        }
        Ok(Value::Object(body))
    }

    fn scopes_body(&self) -> Value {
        json!({
            "fromScope": 0,
            "toScope": self.scopes.len(),
            "totalScopes": self.scopes.len(),
            "scopes": self.scopes,
        })
    }

    fn scope(&self, args: &Value) -> Result<Value, String> {
        let number = args["number"]
            .as_u64()
            .ok_or_else(|| "Missing argument \"number\"".to_string())?;
        usize::try_from(number)
            .ok()
            .and_then(|index| self.scopes.get(index))
            .cloned()
            .ok_or_else(|| format!("Invalid scope number {number}"))
    }
}

fn breakpoint_arg(args: &Value) -> Result<u32, String> {
    args["breakpoint"]
        .as_u64()
        .and_then(|number| u32::try_from(number).ok())
        .ok_or_else(|| "Missing argument \"breakpoint\"".to_string())
}

fn evaluate(args: &Value) -> Result<Value, String> {
    let expression = args["expression"]
        .as_str()
        .ok_or_else(|| "Missing argument \"expression\"".to_string())?;
    // `//# sourceURL=` tags and other line comments carry no value.
    let code = expression
        .lines()
        .filter(|line| !line.trim_start().starts_with("//"))
        .collect::<Vec<_>>()
        .join("\n");
    let value = integer_expression(&code)?;
    Ok(json!({
        "handle": -1,
        "type": "number",
        "value": value,
        "text": value.to_string(),
    }))
}

/// `N`, or `A op B` with integers and one of `+ - * /`.
fn integer_expression(expression: &str) -> Result<i64, String> {
    let syntax_error = || format!("SyntaxError: Unexpected token in '{expression}'");
    let expr = expression.trim().trim_end_matches(';').trim();
    if expr.is_empty() {
        return Ok(0);
    }
    if let Ok(value) = expr.parse::<i64>() {
        return Ok(value);
    }
    for op in ['+', '-', '*', '/'] {
        let Some((index, _)) = expr.char_indices().skip(1).find(|(_, c)| *c == op) else {
            continue;
        };
        let left = expr[..index].trim().parse::<i64>().map_err(|_| syntax_error())?;
        let right = expr[index + 1..]
            .trim()
            .parse::<i64>()
            .map_err(|_| syntax_error())?;
        return match op {
            '+' => left.checked_add(right),
            '-' => left.checked_sub(right),
            '*' => left.checked_mul(right),
            _ => left.checked_div(right),
        }
        .ok_or_else(|| format!("RangeError: cannot evaluate '{expression}'"));
    }
    Err(syntax_error())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integer_arithmetic() {
        assert_eq!(integer_expression("1+1"), Ok(2));
        assert_eq!(integer_expression(" 6 * 7; "), Ok(42));
        assert_eq!(integer_expression("-3"), Ok(-3));
        assert_eq!(integer_expression("10 - 4"), Ok(6));
        assert!(integer_expression("1 +").is_err());
        assert!(integer_expression("var x = ;").is_err());
        assert!(integer_expression("1 / 0").is_err());
    }

    #[test]
    fn evaluate_skips_comment_lines() {
        let body = evaluate(&json!({"expression": "20 + 22\n//# sourceURL=s_x.js"})).unwrap();
        assert_eq!(body["value"], json!(42));
        assert_eq!(body["text"], json!("42"));
    }

    #[test]
    fn breakpoint_table() {
        let mut inner = MockInner::default();
        let body = inner
            .set_breakpoint(&json!({"type": "script", "target": "a.js", "line": 5}))
            .unwrap();
        assert_eq!(body["breakpoint"], json!(1));
        assert_eq!(inner.list_breakpoints()["breakpoints"][0]["script_name"], json!("a.js"));
        assert!(inner.clear_breakpoint(&json!({"breakpoint": 1})).is_ok());
        assert!(inner.clear_breakpoint(&json!({"breakpoint": 1})).is_err());
    }

    #[test]
    fn unknown_command_fails() {
        let mut inner = MockInner::default();
        let response = inner
            .handle(json!({"seq": 3, "type": "request", "command": "frobnicate", "arguments": {}}))
            .unwrap();
        assert_eq!(response["success"], json!(false));
        assert_eq!(response["request_seq"], json!(3));
        assert_eq!(inner.requests.len(), 1);
    }
}
