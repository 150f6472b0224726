//! End-to-end WebSocket scenarios (§8) driven over a real bound TCP listener and a
//! real WebSocket client, rather than the inline tests' direct `handle_text_frame`
//! calls. `WsFrontend::serve` is the crate's only public entry point, so this is the
//! only way to exercise the frontend as a genuine black box.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use relay_demo_tools::{EchoTool, SlowEchoTool};
use relay_dispatch::Dispatcher;
use relay_provider::ProviderRegistry;
use relay_scheduler::Scheduler;
use relay_session::SessionManager;
use relay_telemetry::TelemetryEmitter;
use relay_tool::ToolRegistry;
use relay_types::{TimeoutTable, TimeoutTier};
use relay_ws::WsFrontend;
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

fn timeouts() -> TimeoutTable {
    let tier = TimeoutTier {
        tool: Duration::from_secs(5),
        daemon: Duration::from_secs(8),
        frontend: Duration::from_secs(10),
        client: Duration::from_secs(13),
    };
    TimeoutTable { simple: tier, workflow: tier, expert: tier }
}

struct Harness {
    shutdown: CancellationToken,
    serve: tokio::task::JoinHandle<Result<(), relay_ws::WsError>>,
}

impl Harness {
    async fn stop(self) {
        self.shutdown.cancel();
        let _ = tokio::time::timeout(Duration::from_secs(2), self.serve).await;
    }
}

async fn spawn_server(auth_token: Option<&str>, port: u16, telemetry_path: Option<PathBuf>) -> Harness {
    let mut tools = ToolRegistry::new();
    tools.register(Arc::new(EchoTool)).unwrap();
    tools.register(Arc::new(SlowEchoTool)).unwrap();

    let dispatcher = Arc::new(Dispatcher::new(
        Arc::new(tools),
        Arc::new(ProviderRegistry::new()),
        Arc::new(Scheduler::new(8, 8, HashSet::new())),
        TelemetryEmitter::start_with_capacity(256, telemetry_path),
        timeouts(),
    ));

    let shutdown = CancellationToken::new();
    let sessions = Arc::new(SessionManager::new(shutdown.clone(), auth_token.map(str::to_string), 4));

    let frontend = WsFrontend::new(
        dispatcher,
        sessions,
        TelemetryEmitter::start_with_capacity(256, None),
        "127.0.0.1",
        port,
        Duration::from_secs(2),
    );

    let serve = tokio::spawn(frontend.serve(shutdown.clone()));
    Harness { shutdown, serve }
}

async fn connect_with_retry(port: u16) -> WsStream {
    let url = format!("ws://127.0.0.1:{port}/ws");
    for _ in 0..50 {
        if let Ok((stream, _response)) = connect_async(&url).await {
            return stream;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("failed to connect to websocket server at {url}");
}

async fn send_json(ws: &mut WsStream, value: Value) {
    ws.send(Message::Text(value.to_string().into())).await.unwrap();
}

/// Reads frames until a text frame arrives, a close/error is seen, or `budget` elapses.
async fn try_recv_json(ws: &mut WsStream, budget: Duration) -> Option<Value> {
    let deadline = Instant::now() + budget;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return None;
        }
        match tokio::time::timeout(remaining, ws.next()).await {
            Ok(Some(Ok(Message::Text(text)))) => {
                return Some(serde_json::from_str::<Value>(text.as_ref()).unwrap())
            }
            Ok(Some(Ok(Message::Ping(_) | Message::Pong(_)))) => continue,
            Ok(Some(Ok(Message::Close(_)))) | Ok(None) => return None,
            Ok(Some(Ok(_))) => continue,
            Ok(Some(Err(_))) => return None,
            Err(_) => return None,
        }
    }
}

/// §8 scenario S1: hello admits a session, and a subsequent `call_tool` yields a
/// `result` frame carrying the tool's payload.
#[tokio::test]
async fn s1_happy_path_echo_round_trip() {
    let harness = spawn_server(None, 18171, None).await;
    let mut ws = connect_with_retry(18171).await;

    send_json(&mut ws, json!({"op": "hello", "token": null})).await;
    send_json(&mut ws, json!({
        "op": "call_tool", "request_id": "r1", "tool": "echo", "arguments": {"msg": "hi"}
    }))
    .await;

    let mut saw_received = false;
    let mut saw_admitted = false;
    let result = loop {
        let frame = try_recv_json(&mut ws, Duration::from_secs(5)).await.expect("server closed unexpectedly");
        match frame["op"].as_str() {
            Some("event") => match frame["event"].as_str() {
                Some("tool_call_received") => saw_received = true,
                Some("tool_call_admitted") => saw_admitted = true,
                _ => {}
            },
            Some("result") => break frame,
            other => panic!("unexpected frame op: {other:?}"),
        }
    };

    assert!(saw_received, "expected a tool_call_received event before the result");
    assert!(saw_admitted, "expected a tool_call_admitted event before the result");
    assert_eq!(result["payload"], json!({"reply": "hi"}));

    harness.stop().await;
}

/// §8 scenario S2: ten concurrent identical `call_tool`s over one connection admit
/// exactly once and coalesce the other nine, all resolving together in roughly two
/// seconds (`slow_echo`'s sleep), not twenty.
#[tokio::test]
async fn s2_ten_identical_calls_coalesce_into_one_admission() {
    let harness = spawn_server(None, 18172, None).await;
    let mut ws = connect_with_retry(18172).await;
    send_json(&mut ws, json!({"op": "hello", "token": null})).await;

    for i in 0..10 {
        send_json(&mut ws, json!({
            "op": "call_tool",
            "request_id": format!("r{i}"),
            "tool": "slow_echo",
            "arguments": {"msg": "x"},
        }))
        .await;
    }

    let mut admitted = 0;
    let mut coalesced = 0;
    let mut results: HashMap<String, Value> = HashMap::new();
    let deadline = Instant::now() + Duration::from_secs(6);

    while results.len() < 10 {
        let remaining = deadline.saturating_duration_since(Instant::now());
        assert!(!remaining.is_zero(), "timed out with only {} of 10 results", results.len());
        let frame = try_recv_json(&mut ws, remaining)
            .await
            .expect("connection closed before all ten results arrived");
        match frame["op"].as_str() {
            Some("event") => match frame["event"].as_str() {
                Some("tool_call_admitted") => admitted += 1,
                Some("tool_coalesced") => coalesced += 1,
                _ => {}
            },
            Some("result") => {
                assert_eq!(frame["payload"], json!({"reply": "x"}));
                results.insert(frame["request_id"].as_str().unwrap().to_string(), frame["payload"].clone());
            }
            other => panic!("unexpected frame op: {other:?}"),
        }
    }

    assert_eq!(admitted, 1, "exactly one of the ten calls should have been admitted as leader");
    assert_eq!(coalesced, 9, "the other nine calls should have coalesced onto the leader");

    harness.stop().await;
}

/// §8 scenario S5: closing the connection while a `slow_echo` call is in flight
/// cancels it, reported via telemetry as `tool_call_cancelled`/`session_closed` — no
/// result frame is ever produced since nobody is left to read the connection.
#[tokio::test]
async fn s5_closing_the_connection_cancels_the_in_flight_call() {
    let dir = tempfile::tempdir().unwrap();
    let telemetry_path = dir.path().join("telemetry.jsonl");
    let harness = spawn_server(None, 18173, Some(telemetry_path.clone())).await;

    {
        let mut ws = connect_with_retry(18173).await;
        send_json(&mut ws, json!({"op": "hello", "token": null})).await;
        send_json(&mut ws, json!({
            "op": "call_tool", "request_id": "r1", "tool": "slow_echo", "arguments": {"msg": "x"}
        }))
        .await;

        loop {
            let frame = try_recv_json(&mut ws, Duration::from_secs(2))
                .await
                .expect("expected a tool_call_admitted event before disconnecting");
            if frame["event"] == json!("tool_call_admitted") {
                break;
            }
        }
        // `ws` drops here, closing the TCP connection before slow_echo's two-second
        // sleep finishes.
    }

    let mut contents = String::new();
    for _ in 0..20 {
        contents = tokio::fs::read_to_string(&telemetry_path).await.unwrap_or_default();
        if contents.contains("tool_call_cancelled") {
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert!(
        contents.contains("tool_call_cancelled") && contents.contains("session_closed"),
        "expected a tool_call_cancelled/session_closed telemetry line, got: {contents}"
    );

    harness.stop().await;
}

/// §8 scenario S7: a wrong token on `hello` closes the session with `AuthError` and
/// accepts no further frames.
#[tokio::test]
async fn s7_wrong_token_closes_the_session_with_auth_error() {
    let harness = spawn_server(Some("secret"), 18174, None).await;
    let mut ws = connect_with_retry(18174).await;
    send_json(&mut ws, json!({"op": "hello", "token": "wrong"})).await;

    let frame = try_recv_json(&mut ws, Duration::from_secs(5)).await.expect("expected an auth error frame");
    assert_eq!(frame["op"], json!("error"));
    assert_eq!(frame["kind"], json!("AuthError"));

    let after = try_recv_json(&mut ws, Duration::from_millis(500)).await;
    assert!(after.is_none(), "the connection should be closed after an auth failure");

    harness.stop().await;
}
