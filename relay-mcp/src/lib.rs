#![deny(missing_docs)]
//! MCP stdio frontend for the relay broker (§4.9).
//!
//! Reads JSON-RPC messages line-by-line from stdin, writes responses line-by-line to
//! stdout, via `rmcp`'s `transport-io` stdio transport. Supports `initialize`,
//! `tools/list`, `tools/call`, and the `notifications/initialized` notification (the
//! latter handled for free by `rmcp`'s own service loop). Every `tools/call` is routed
//! through the shared [`relay_dispatch::Dispatcher`] exactly as the WebSocket
//! frontend's `call_tool` is — "the Dispatcher does not know which protocol
//! originated a Call" (§4.9) — so admission control, coalescing, and telemetry apply
//! uniformly regardless of which frontend accepted the frame.
//!
//! `HELLO_TIMEOUT_SECS` (§4.4) has no literal `hello` frame in MCP; this frontend
//! treats the JSON-RPC `initialize` request as the hello-equivalent first frame (it is
//! structurally the same thing: the one message that must arrive before any other
//! method is meaningful). A watchdog task destroys the Session with reason
//! `"hello_timeout"` if `initialize` hasn't landed within the configured window,
//! which for a single-connection stdio transport amounts to ending the connection.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use relay_dispatch::Dispatcher;
use relay_session::SessionManager;
use relay_telemetry::{Event, TelemetryEmitter};
use relay_types::{Arguments, BrokerError, Call, CallOutcome, Tier, Transport, Visibility};
use rmcp::model::{
    CallToolRequestParams, CallToolResult, Implementation, InitializeRequestParam,
    InitializeResult, ListToolsResult, PaginatedRequestParams, ProtocolVersion,
    ServerCapabilities, ServerInfo, Tool as McpTool,
};
use rmcp::service::{RequestContext, RoleServer};
use rmcp::transport::io::stdio;
use rmcp::{ErrorData, ServerHandler, ServiceExt};

/// Everything that can go wrong standing up or running the stdio transport itself
/// (not a protocol-level error, which is surfaced as a JSON-RPC error object instead).
#[derive(Debug, thiserror::Error)]
pub enum McpError {
    /// The underlying stdio transport failed to start or exited abnormally.
    #[error("mcp transport error: {0}")]
    Transport(String),
}

/// MCP stdio frontend: one [`McpFrontend`] serves exactly one stdio connection (the
/// daemon process's own stdin/stdout), mirroring the fact that stdio has no listening
/// socket to accept multiple clients on.
pub struct McpFrontend {
    dispatcher: Arc<Dispatcher>,
    sessions: Arc<SessionManager>,
    telemetry: TelemetryEmitter,
    hello_timeout: Duration,
    server_name: String,
    server_version: String,
}

impl McpFrontend {
    /// Build a frontend over the daemon's shared registries/dispatcher.
    #[must_use]
    pub fn new(
        dispatcher: Arc<Dispatcher>,
        sessions: Arc<SessionManager>,
        telemetry: TelemetryEmitter,
        hello_timeout: Duration,
        server_name: impl Into<String>,
        server_version: impl Into<String>,
    ) -> Self {
        Self {
            dispatcher,
            sessions,
            telemetry,
            hello_timeout,
            server_name: server_name.into(),
            server_version: server_version.into(),
        }
    }

    /// Serve stdio until the client disconnects, `initialize` never arrives within
    /// `hello_timeout`, or the daemon shuts down. Blocks until the connection ends.
    ///
    /// # Errors
    ///
    /// Returns [`McpError::Transport`] if the stdio transport fails to start or the
    /// underlying service loop errors out.
    pub async fn serve_stdio(self) -> Result<(), McpError> {
        // stdio admission ignores credentials and is always admitted (§4.4).
        let session = self
            .sessions
            .admit(Transport::Stdio, None)
            .expect("stdio admission never fails");
        self.telemetry.emit(Event::SessionOpened {
            ts: chrono::Utc::now(),
            session_id: session.id.clone(),
            transport: Transport::Stdio,
        });

        let hello_received = Arc::new(AtomicBool::new(false));
        let watchdog = {
            let hello_received = hello_received.clone();
            let sessions = self.sessions.clone();
            let telemetry = self.telemetry.clone();
            let session_id = session.id.clone();
            let hello_timeout = self.hello_timeout;
            tokio::spawn(async move {
                tokio::time::sleep(hello_timeout).await;
                if !hello_received.load(Ordering::SeqCst) {
                    tracing::warn!(session_id = %session_id, "no initialize frame within HELLO_TIMEOUT_SECS");
                    if sessions.destroy(&session_id, "hello_timeout") {
                        telemetry.emit(Event::SessionClosed {
                            ts: chrono::Utc::now(),
                            session_id,
                            transport: Transport::Stdio,
                            reason: Some("hello_timeout".to_string()),
                        });
                    }
                }
            })
        };

        let session_id = session.id.clone();
        let handler = McpServerHandler {
            dispatcher: self.dispatcher,
            session,
            hello_received,
            server_name: self.server_name,
            server_version: self.server_version,
        };

        let transport = stdio();
        let service = handler
            .serve(transport)
            .await
            .map_err(|e| McpError::Transport(e.to_string()))?;
        let result = service.waiting().await.map_err(|e| McpError::Transport(e.to_string()));
        watchdog.abort();
        if self.sessions.destroy(&session_id, "session_closed") {
            self.telemetry.emit(Event::SessionClosed {
                ts: chrono::Utc::now(),
                session_id,
                transport: Transport::Stdio,
                reason: Some("session_closed".to_string()),
            });
        }
        result.map(|_| ())
    }
}

struct McpServerHandler {
    dispatcher: Arc<Dispatcher>,
    session: Arc<relay_session::Session>,
    hello_received: Arc<AtomicBool>,
    server_name: String,
    server_version: String,
}

impl ServerHandler for McpServerHandler {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: ProtocolVersion::LATEST,
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: Implementation {
                name: self.server_name.clone(),
                version: self.server_version.clone(),
                ..Default::default()
            },
            instructions: None,
        }
    }

    async fn initialize(
        &self,
        _request: InitializeRequestParam,
        _context: RequestContext<RoleServer>,
    ) -> Result<InitializeResult, ErrorData> {
        self.hello_received.store(true, Ordering::SeqCst);
        Ok(self.get_info())
    }

    async fn list_tools(
        &self,
        _request: Option<PaginatedRequestParams>,
        _context: RequestContext<RoleServer>,
    ) -> Result<ListToolsResult, ErrorData> {
        let descriptors = self.dispatcher.tools().list(|d| d.visibility != Visibility::Hidden);
        let tools: Vec<McpTool> = descriptors
            .into_iter()
            .map(|d| {
                let schema_obj = d.input_schema.as_object().cloned().unwrap_or_default();
                McpTool {
                    name: d.name.into(),
                    title: None,
                    description: Some(d.description.into()),
                    input_schema: Arc::new(schema_obj),
                    output_schema: None,
                    annotations: None,
                    execution: None,
                    icons: None,
                    meta: None,
                }
            })
            .collect();

        Ok(ListToolsResult::with_all_items(tools))
    }

    async fn call_tool(
        &self,
        request: CallToolRequestParams,
        _context: RequestContext<RoleServer>,
    ) -> Result<CallToolResult, ErrorData> {
        let tool_name = request.name.to_string();
        let arguments: Arguments = request.arguments.unwrap_or_default();
        let args_value = serde_json::Value::Object(arguments.clone());

        let tier = self
            .dispatcher
            .tools()
            .get(&tool_name)
            .map(|t| t.descriptor().tier)
            .unwrap_or(Tier::Simple);
        let fingerprint = self.dispatcher.compute_fingerprint(&tool_name, &args_value);
        let request_id = relay_types::RequestId::new(uuid::Uuid::new_v4().to_string());

        let call = Call {
            request_id,
            session_id: self.session.id.clone(),
            tool: tool_name,
            arguments,
            provider: None,
            fingerprint,
            tier,
            created_at: chrono::Utc::now(),
        };

        let outcome = self.dispatcher.dispatch(call, &self.session).await;
        outcome_to_call_tool_result(outcome)
    }
}

/// Translate a terminal [`CallOutcome`] into the MCP result shape. Per §7's
/// "errors use JSON-RPC error objects with codes drawn from the Error Taxonomy", every
/// non-`Ok` outcome is surfaced as a `Result::Err(ErrorData)` rather than an in-band
/// `CallToolResult::error` content block. The taxonomy's stable `code`/`kind` pair
/// travels in the error's `data` field; the top-level JSON-RPC `code` is the nearest
/// standard code so generic JSON-RPC clients still get a sensible bucket.
fn outcome_to_call_tool_result(outcome: CallOutcome) -> Result<CallToolResult, ErrorData> {
    match outcome {
        CallOutcome::Ok { payload } => {
            let text = serde_json::to_string_pretty(&payload).unwrap_or_else(|_| payload.to_string());
            Ok(CallToolResult::success(vec![rmcp::model::Content::text(text)]))
        }
        CallOutcome::Error { kind, message, detail } => {
            Err(taxonomy_error(code_for_kind(&kind), &kind, message, detail))
        }
        CallOutcome::Timeout => Err(taxonomy_error(
            BrokerError::Timeout.code(),
            BrokerError::Timeout.kind(),
            BrokerError::Timeout.to_string(),
            None,
        )),
        CallOutcome::Cancelled { reason } => Err(taxonomy_error(
            BrokerError::Cancelled(reason.clone()).code(),
            BrokerError::Cancelled(reason.clone()).kind(),
            BrokerError::Cancelled(reason).to_string(),
            None,
        )),
    }
}

/// Build an [`ErrorData`] that keeps the taxonomy's stable numeric `code` and `kind`
/// string intact inside `data`, alongside whatever the outcome itself attached.
fn taxonomy_error(
    taxonomy_code: i32,
    kind: &str,
    message: String,
    detail: Option<serde_json::Value>,
) -> ErrorData {
    let mut data = serde_json::json!({ "code": taxonomy_code, "kind": kind });
    if let Some(detail) = detail {
        data["detail"] = detail;
    }
    if is_caller_fault(kind) {
        ErrorData::invalid_params(message, Some(data))
    } else {
        ErrorData::internal_error(message, Some(data))
    }
}

/// Whether a taxonomy `kind` describes a malformed or unauthorized request (the
/// caller's fault) as opposed to a failure on the daemon/tool/provider side.
fn is_caller_fault(kind: &str) -> bool {
    matches!(
        kind,
        "InvalidRequest" | "UnknownTool" | "InvalidArgs" | "UnknownProvider" | "AuthError"
    )
}

fn code_for_kind(kind: &str) -> i32 {
    // `CallOutcome::Error` only ever carries a kind string produced by
    // `BrokerError::kind()`, so this reconstructs the numeric code from the same
    // stable string the error taxonomy already guarantees round-trips (§7).
    match kind {
        "InvalidRequest" => BrokerError::InvalidRequest(String::new()).code(),
        "UnknownTool" => BrokerError::UnknownTool(String::new()).code(),
        "InvalidArgs" => BrokerError::InvalidArgs { tool: String::new(), message: String::new() }.code(),
        "UnknownProvider" => BrokerError::UnknownProvider(String::new()).code(),
        "AuthError" => BrokerError::AuthError.code(),
        "HelloTimeout" => BrokerError::HelloTimeout.code(),
        "Timeout" => BrokerError::Timeout.code(),
        "Cancelled" => BrokerError::Cancelled(String::new()).code(),
        "ToolError" => BrokerError::ToolError(String::new()).code(),
        "ProviderError" => BrokerError::ProviderError(String::new()).code(),
        _ => BrokerError::Internal.code(),
    }
}
