#![deny(missing_docs)]
//! WebSocket frontend for the relay broker (§4.9).
//!
//! Accepts connections at `WS_HOST:WS_PORT`. A connection speaks one JSON object per
//! text frame; binary frames are rejected. The first frame MUST be `hello`; any other
//! op received first is rejected with `InvalidRequest` and the connection is left open
//! (§8: "the session is not yet established", not an auth failure). Every accepted
//! `call_tool` is routed through the shared [`relay_dispatch::Dispatcher`], with its
//! `received`/`admitted`/`coalesced` telemetry events mirrored onto the connection's own
//! wire as `{op: "event", ...}` frames before the terminal `{op: "result"}` /
//! `{op: "error"}` frame (§4.9, §6).

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use futures::{SinkExt, StreamExt};
use relay_dispatch::Dispatcher;
use relay_session::{Session, SessionManager};
use relay_telemetry::{Event, TelemetryEmitter};
use relay_types::{Arguments, BrokerError, Call, CallOutcome, RequestId, Tier, Transport, Visibility};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Everything that can go wrong standing up or running the WebSocket listener itself.
#[derive(Debug, thiserror::Error)]
pub enum WsError {
    /// Binding `WS_HOST:WS_PORT` failed.
    #[error("failed to bind {0}: {1}")]
    Bind(SocketAddr, std::io::Error),
    /// The listener's accept loop returned an error.
    #[error("websocket server error: {0}")]
    Serve(std::io::Error),
}

/// WebSocket frontend: binds one listener and serves every connection concurrently.
pub struct WsFrontend {
    dispatcher: Arc<Dispatcher>,
    sessions: Arc<SessionManager>,
    telemetry: TelemetryEmitter,
    host: String,
    port: u16,
    hello_timeout: Duration,
}

impl WsFrontend {
    /// Build a frontend over the daemon's shared registries/dispatcher.
    #[must_use]
    pub fn new(
        dispatcher: Arc<Dispatcher>,
        sessions: Arc<SessionManager>,
        telemetry: TelemetryEmitter,
        host: impl Into<String>,
        port: u16,
        hello_timeout: Duration,
    ) -> Self {
        Self {
            dispatcher,
            sessions,
            telemetry,
            host: host.into(),
            port,
            hello_timeout,
        }
    }

    /// Bind `host:port` and serve connections until `shutdown` is cancelled.
    ///
    /// # Errors
    ///
    /// Returns [`WsError::Bind`] if the listener cannot be bound, or [`WsError::Serve`]
    /// if the accept loop itself fails (not individual connection errors, which are
    /// handled per-connection and never propagate here).
    pub async fn serve(self, shutdown: CancellationToken) -> Result<(), WsError> {
        let addr: SocketAddr = format!("{}:{}", self.host, self.port)
            .parse()
            .unwrap_or_else(|_| SocketAddr::from(([127, 0, 0, 1], self.port)));

        let state = WsState {
            dispatcher: self.dispatcher,
            sessions: self.sessions,
            telemetry: self.telemetry,
            hello_timeout: self.hello_timeout,
        };

        let app = Router::new().route("/ws", get(websocket_handler)).with_state(state);

        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .map_err(|e| WsError::Bind(addr, e))?;
        tracing::info!(%addr, "websocket frontend listening");

        axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await
            .map_err(WsError::Serve)
    }
}

#[derive(Clone)]
struct WsState {
    dispatcher: Arc<Dispatcher>,
    sessions: Arc<SessionManager>,
    telemetry: TelemetryEmitter,
    hello_timeout: Duration,
}

async fn websocket_handler(ws: WebSocketUpgrade, State(state): State<WsState>) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_connection(socket, state))
}

#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum ClientFrame {
    Hello {
        token: Option<String>,
        #[serde(default)]
        #[allow(dead_code)]
        client_info: Option<Value>,
    },
    ListTools {
        request_id: RequestId,
    },
    CallTool {
        request_id: RequestId,
        tool: String,
        #[serde(default)]
        arguments: Arguments,
    },
    Cancel {
        request_id: RequestId,
    },
}

/// Owns one connection's lifecycle from upgrade to close (§4.4, §4.9).
async fn handle_connection(socket: WebSocket, state: WsState) {
    let conn_id = uuid::Uuid::new_v4().to_string();
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Value>();

    let send_task = tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            let text = serde_json::to_string(&frame).unwrap_or_else(|_| "{}".to_string());
            if ws_sender.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    let hello_received = Arc::new(AtomicBool::new(false));
    let watchdog = {
        let hello_received = hello_received.clone();
        let telemetry = state.telemetry.clone();
        let conn_id = conn_id.clone();
        let hello_timeout = state.hello_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(hello_timeout).await;
            if !hello_received.load(Ordering::SeqCst) {
                telemetry.emit(Event::SessionClosed {
                    ts: chrono::Utc::now(),
                    session_id: relay_types::SessionId::new(conn_id),
                    transport: Transport::Ws,
                    reason: Some("hello_timeout".to_string()),
                });
            }
        })
    };

    let mut session: Option<Arc<Session>> = None;

    while let Some(message) = ws_receiver.next().await {
        let message = match message {
            Ok(m) => m,
            Err(_) => break,
        };
        match message {
            Message::Text(text) => {
                if !handle_text_frame(&text, &state, &mut session, &conn_id, &hello_received, &out_tx).await {
                    break;
                }
            }
            Message::Binary(_) => {
                let _ = out_tx.send(json!({
                    "op": "error",
                    "kind": BrokerError::InvalidRequest(String::new()).kind(),
                    "message": "binary frames are not supported",
                }));
            }
            Message::Close(_) => break,
            Message::Ping(_) | Message::Pong(_) => {}
        }
    }

    watchdog.abort();
    drop(out_tx);
    let _ = send_task.await;

    if let Some(session) = session {
        if state.sessions.destroy(&session.id, "session_closed") {
            state.telemetry.emit(Event::SessionClosed {
                ts: chrono::Utc::now(),
                session_id: session.id.clone(),
                transport: Transport::Ws,
                reason: Some("session_closed".to_string()),
            });
        }
    }
}

/// Handle one parsed text frame. Returns `false` when the connection should be closed
/// (an auth failure on `hello`, per §8's "session is closed with AuthError").
async fn handle_text_frame(
    text: &str,
    state: &WsState,
    session: &mut Option<Arc<Session>>,
    conn_id: &str,
    hello_received: &Arc<AtomicBool>,
    out_tx: &mpsc::UnboundedSender<Value>,
) -> bool {
    let frame: ClientFrame = match serde_json::from_str(text) {
        Ok(frame) => frame,
        Err(err) => {
            let _ = out_tx.send(json!({
                "op": "error",
                "kind": BrokerError::InvalidRequest(String::new()).kind(),
                "message": format!("malformed frame: {err}"),
            }));
            return true;
        }
    };

    match frame {
        ClientFrame::Hello { token, .. } => {
            if session.is_some() {
                return true; // a second hello on an already-established session is a no-op
            }
            match state.sessions.admit(Transport::Ws, token.as_deref()) {
                Ok(new_session) => {
                    hello_received.store(true, Ordering::SeqCst);
                    state.telemetry.emit(Event::SessionOpened {
                        ts: chrono::Utc::now(),
                        session_id: new_session.id.clone(),
                        transport: Transport::Ws,
                    });
                    *session = Some(new_session);
                    true
                }
                Err(err) => {
                    let _ = out_tx.send(json!({
                        "op": "error",
                        "kind": err.kind(),
                        "message": err.to_string(),
                    }));
                    state.telemetry.emit(Event::SessionClosed {
                        ts: chrono::Utc::now(),
                        session_id: relay_types::SessionId::new(conn_id),
                        transport: Transport::Ws,
                        reason: Some("auth_error".to_string()),
                    });
                    false
                }
            }
        }
        ClientFrame::ListTools { request_id } => {
            if session.is_none() {
                return reject_before_hello(out_tx, &request_id);
            }
            let descriptors = state.dispatcher.tools().list(|d| d.visibility != Visibility::Hidden);
            let tools: Vec<Value> = descriptors
                .into_iter()
                .map(|d| {
                    json!({
                        "name": d.name,
                        "description": d.description,
                        "input_schema": d.input_schema,
                        "tier": d.tier,
                    })
                })
                .collect();
            let _ = out_tx.send(json!({
                "op": "result",
                "request_id": request_id,
                "ok": true,
                "payload": { "tools": tools },
            }));
            true
        }
        ClientFrame::CallTool { request_id, tool, arguments } => {
            let Some(session) = session.clone() else {
                return reject_before_hello(out_tx, &request_id);
            };
            spawn_call(state.clone(), session, request_id, tool, arguments, out_tx.clone());
            true
        }
        ClientFrame::Cancel { request_id } => {
            if session.is_none() {
                return reject_before_hello(out_tx, &request_id);
            }
            state.dispatcher.cancel(&request_id, "client_cancel");
            true
        }
    }
}

fn reject_before_hello(out_tx: &mpsc::UnboundedSender<Value>, request_id: &RequestId) -> bool {
    let err = BrokerError::InvalidRequest("no session established; send hello first".to_string());
    let _ = out_tx.send(json!({
        "op": "error",
        "request_id": request_id,
        "kind": err.kind(),
        "message": err.to_string(),
    }));
    true
}

/// Run one `call_tool` to completion on its own task, mirroring telemetry events onto
/// `out_tx` as they're produced and finishing with a single terminal frame (§4.9's "the
/// frontend MUST send a terminal frame for every `call_tool` it accepted").
fn spawn_call(
    state: WsState,
    session: Arc<Session>,
    request_id: RequestId,
    tool: String,
    arguments: Arguments,
    out_tx: mpsc::UnboundedSender<Value>,
) {
    tokio::spawn(async move {
        let args_value = Value::Object(arguments.clone());
        let tier = state
            .dispatcher
            .tools()
            .get(&tool)
            .map(|t| t.descriptor().tier)
            .unwrap_or(Tier::Simple);
        let fingerprint = state.dispatcher.compute_fingerprint(&tool, &args_value);

        let call = Call {
            request_id: request_id.clone(),
            session_id: session.id.clone(),
            tool,
            arguments,
            provider: None,
            fingerprint,
            tier,
            created_at: chrono::Utc::now(),
        };

        let (event_tx, mut event_rx) = mpsc::unbounded_channel::<Event>();
        let forward_out = out_tx.clone();
        let forward = tokio::spawn(async move {
            while let Some(event) = event_rx.recv().await {
                let _ = forward_out.send(event_frame(&event));
            }
        });

        let outcome = state.dispatcher.dispatch_with_sink(call, &session, Some(&event_tx)).await;
        drop(event_tx);
        let _ = forward.await;

        let _ = out_tx.send(outcome_frame(&request_id, outcome));
    });
}

/// Mirror one telemetry event onto the wire as `{op: "event", ...}` (§6).
fn event_frame(event: &Event) -> Value {
    let mut value = serde_json::to_value(event).unwrap_or_else(|_| json!({}));
    if let Value::Object(ref mut map) = value {
        map.insert("op".to_string(), json!("event"));
    }
    value
}

/// Translate a terminal [`CallOutcome`] into the final `{op: "result"}` /
/// `{op: "error"}` frame for a call (§6).
fn outcome_frame(request_id: &RequestId, outcome: CallOutcome) -> Value {
    match outcome {
        CallOutcome::Ok { payload } => json!({
            "op": "result",
            "request_id": request_id,
            "ok": true,
            "payload": payload,
        }),
        CallOutcome::Error { kind, message, detail } => json!({
            "op": "error",
            "request_id": request_id,
            "kind": kind,
            "message": message,
            "detail": detail,
        }),
        CallOutcome::Timeout => json!({
            "op": "error",
            "request_id": request_id,
            "kind": BrokerError::Timeout.kind(),
            "message": BrokerError::Timeout.to_string(),
        }),
        CallOutcome::Cancelled { reason } => json!({
            "op": "error",
            "request_id": request_id,
            "kind": BrokerError::Cancelled(reason.clone()).kind(),
            "message": BrokerError::Cancelled(reason).to_string(),
        }),
    }
}
