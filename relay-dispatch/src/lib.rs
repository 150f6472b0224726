#![deny(missing_docs)]
//! Dispatcher for the relay broker (§4.6), plus the cancellation-tree helpers (§4.7)
//! needed to support a frontend's best-effort `cancel` operation.
//!
//! The Dispatcher is the only component that sees a [`Call`] end to end: it validates
//! args, resolves the tool and provider, asks the [`relay_scheduler::Scheduler`] for
//! admission, runs the tool (or a provider's `invoke`, when one resolves) under a
//! deadline race against cancellation, and normalizes the result. Both frontends
//! funnel through the same [`Dispatcher::dispatch`] — "the Dispatcher does not know
//! which protocol originated a Call" (§4.9).

use std::sync::{Arc, Mutex};

use chrono::Utc;
use dashmap::DashMap;
use relay_provider::ProviderRegistry;
use relay_scheduler::{Admission, Scheduler};
use relay_session::Session;
use relay_telemetry::{Event, TelemetryEmitter};
use relay_tool::ToolRegistry;
use relay_types::{BrokerError, Call, CallContext, CallOutcome, RequestId, TimeoutTable};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Per-Call cancellation handle tracked by the Dispatcher while a Call (leader or
/// follower) is live, so a frontend's `cancel` op can reach it by request id.
struct ActiveCall {
    token: CancellationToken,
    reason: Mutex<String>,
}

/// Validates, resolves, schedules, executes, and normalizes Calls (§4.6).
pub struct Dispatcher {
    tools: Arc<ToolRegistry>,
    providers: Arc<ProviderRegistry>,
    scheduler: Arc<Scheduler>,
    telemetry: TelemetryEmitter,
    timeouts: TimeoutTable,
    active: DashMap<RequestId, Arc<ActiveCall>>,
}

impl Dispatcher {
    /// Build a Dispatcher over the three shared registries/scheduler/telemetry sink
    /// the daemon constructs once at bootstrap.
    #[must_use]
    pub fn new(
        tools: Arc<ToolRegistry>,
        providers: Arc<ProviderRegistry>,
        scheduler: Arc<Scheduler>,
        telemetry: TelemetryEmitter,
        timeouts: TimeoutTable,
    ) -> Self {
        Self {
            tools,
            providers,
            scheduler,
            telemetry,
            timeouts,
            active: DashMap::new(),
        }
    }

    /// Compute a tool call's coalescing fingerprint, so a frontend can fill in
    /// [`Call::fingerprint`] before constructing the Call (admission needs it
    /// up front; see `relay_scheduler::Scheduler::admit`).
    #[must_use]
    pub fn compute_fingerprint(&self, tool: &str, args: &serde_json::Value) -> String {
        self.scheduler.compute_fingerprint(tool, args)
    }

    /// The tool registry this Dispatcher was built with, for a frontend's
    /// `list_tools`/`tools/list` (§4.2's `list(visibilityFilter)`).
    #[must_use]
    pub fn tools(&self) -> &Arc<ToolRegistry> {
        &self.tools
    }

    /// The per-tier timeout table, for a frontend to surface `client` deadline hints.
    #[must_use]
    pub fn timeouts(&self) -> &TimeoutTable {
        &self.timeouts
    }

    /// Best-effort cancellation of an in-flight Call by request id (§4.9's `cancel`
    /// frontend op and §4.7's "client disconnect" source). Returns whether a live Call
    /// was found and signalled; a no-op on an unknown or already-terminal request id
    /// (§8: "`cancel` on an already-terminal request id is a no-op and returns
    /// success").
    pub fn cancel(&self, request_id: &RequestId, reason: &str) -> bool {
        match self.active.get(request_id) {
            Some(entry) => {
                *entry.reason.lock().expect("cancel-reason mutex is never held across a panic") =
                    reason.to_string();
                entry.token.cancel();
                true
            }
            None => false,
        }
    }

    /// Run every still-active Call's cancellation with `reason`, for daemon shutdown
    /// (§4.7): the caller (`relayd`) pairs this with cancelling the session tree's own
    /// root token, so calls admitted in the brief window between the two still observe
    /// `"shutdown"` as their reason rather than the session-teardown default.
    pub fn cancel_all(&self, reason: &str) {
        for entry in &self.active {
            *entry.value().reason.lock().expect("cancel-reason mutex is never held across a panic") =
                reason.to_string();
            entry.value().token.cancel();
        }
    }

    /// Number of Calls currently tracked as active (leader or follower), for
    /// diagnostics and shutdown draining.
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    /// Run one Call to a terminal state (§4.6's seven steps). `session` is the Call's
    /// owning [`Session`], already admitted by the Session Manager.
    pub async fn dispatch(&self, call: Call, session: &Arc<Session>) -> CallOutcome {
        self.dispatch_with_sink(call, session, None).await
    }

    /// As [`Self::dispatch`], additionally mirroring every telemetry event produced
    /// for this Call onto `sink`, for a frontend that needs to forward events onto
    /// its own wire (§4.9's "server-sent frames mirror the telemetry events for the
    /// call's request id") without the Dispatcher itself knowing anything about a
    /// particular frontend's frame shape. `dispatch` is the common case (no frontend
    /// mirroring, e.g. the MCP stdio frontend, which has no such requirement).
    pub async fn dispatch_with_sink(
        &self,
        call: Call,
        session: &Arc<Session>,
        sink: Option<&tokio::sync::mpsc::UnboundedSender<Event>>,
    ) -> CallOutcome {
        let start = Instant::now();

        let received = Event::ToolCallReceived {
            ts: Utc::now(),
            session_id: call.session_id.clone(),
            request_id: call.request_id.clone(),
            tool: call.tool.clone(),
            provider: call.provider.clone(),
            arg_summary: summarize_args(&call.arguments),
        };
        self.emit(sink, received);

        let Some(tool) = self.tools.get(&call.tool).cloned() else {
            let err = BrokerError::UnknownTool(call.tool.clone());
            return self.terminal(&call, CallOutcome::from_broker_error(&err), start, sink).await;
        };

        let args_value = serde_json::Value::Object(call.arguments.clone());
        if let Err(message) = relay_types::schema::validate(&tool.descriptor().input_schema, &args_value) {
            let err = BrokerError::InvalidArgs { tool: call.tool.clone(), message };
            return self.terminal(&call, CallOutcome::from_broker_error(&err), start, sink).await;
        }

        let provider_name = tool
            .descriptor()
            .provider
            .clone()
            .or_else(|| call.provider.clone());
        let provider_handle = match provider_name.as_deref() {
            Some(name) => match self.providers.get(name) {
                Some(handle) => Some(handle),
                None => {
                    let err = BrokerError::UnknownProvider(name.to_string());
                    return self.terminal(&call, CallOutcome::from_broker_error(&err), start, sink).await;
                }
            },
            None => None,
        };

        let tier = self.timeouts.get(call.tier);
        let admission_deadline = Instant::now() + tier.daemon;
        let admit_start = Instant::now();

        let admission = match self
            .scheduler
            .admit(&call.fingerprint, &call.request_id, provider_name.as_deref(), session, admission_deadline)
            .await
        {
            Ok(admission) => admission,
            Err(err) => return self.terminal(&call, CallOutcome::from_broker_error(&err), start, sink).await,
        };

        let call_token = session.child_token();
        let active = Arc::new(ActiveCall {
            token: call_token.clone(),
            reason: Mutex::new("session_closed".to_string()),
        });
        self.active.insert(call.request_id.clone(), active.clone());

        let outcome = match admission {
            Admission::Follower { wait, leader_request_id } => {
                self.emit(sink, Event::ToolCoalesced {
                    ts: Utc::now(),
                    request_id: call.request_id.clone(),
                    tool: call.tool.clone(),
                    leader_request_id,
                });

                tokio::select! {
                    outcome = wait.wait() => outcome,
                    () = call_token.cancelled() => CallOutcome::Cancelled {
                        reason: active.reason.lock().expect("cancel-reason mutex is never held across a panic").clone(),
                    },
                }
            }
            Admission::Leader(guard) => {
                let wait_ms = u64::try_from(admit_start.elapsed().as_millis()).unwrap_or(u64::MAX);
                self.emit(sink, Event::ToolCallAdmitted {
                    ts: Utc::now(),
                    request_id: call.request_id.clone(),
                    tool: call.tool.clone(),
                    provider: provider_name.clone(),
                    wait_ms,
                });

                let deadline = Instant::now() + tier.tool;
                let ctx = CallContext {
                    request_id: call.request_id.clone(),
                    session_id: call.session_id.clone(),
                    cancellation: call_token.clone(),
                    deadline,
                    provider: provider_name.clone(),
                };

                let tool_name = call.tool.clone();
                let exec = async {
                    match &provider_handle {
                        Some(handle) => handle.invoke(&tool_name, args_value.clone(), &ctx).await,
                        None => tool.execute(args_value.clone(), &ctx).await,
                    }
                };

                let outcome = tokio::select! {
                    result = exec => match result {
                        Ok(payload) => CallOutcome::Ok { payload },
                        Err(message) => CallOutcome::from_broker_error(&BrokerError::ToolError(message)),
                    },
                    () = tokio::time::sleep_until(deadline) => CallOutcome::Timeout,
                    () = call_token.cancelled() => CallOutcome::Cancelled {
                        reason: active.reason.lock().expect("cancel-reason mutex is never held across a panic").clone(),
                    },
                };

                self.scheduler.complete(guard.fingerprint(), outcome.clone());
                drop(guard); // releases global -> provider -> session permits, in that order
                outcome
            }
        };

        self.active.remove(&call.request_id);
        self.terminal(&call, outcome, start, sink).await
    }

    /// Send `event` to both the shared telemetry sink (always) and, if present, a
    /// frontend's own per-call mirror channel. A closed/dropped `sink` (the client
    /// disconnected before the terminal event) is not an error — there is simply no
    /// one left to mirror to.
    fn emit(&self, sink: Option<&tokio::sync::mpsc::UnboundedSender<Event>>, event: Event) {
        if let Some(sink) = sink {
            let _ = sink.send(event.clone());
        }
        self.telemetry.emit(event);
    }

    async fn terminal(
        &self,
        call: &Call,
        outcome: CallOutcome,
        start: Instant,
        sink: Option<&tokio::sync::mpsc::UnboundedSender<Event>>,
    ) -> CallOutcome {
        let ts = Utc::now();
        let duration_ms = u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX);

        match &outcome {
            CallOutcome::Ok { payload } => {
                let result_size = serde_json::to_vec(payload).map(|bytes| bytes.len()).unwrap_or(0);
                self.emit(sink, Event::ToolCallComplete {
                    ts,
                    request_id: call.request_id.clone(),
                    tool: call.tool.clone(),
                    provider: call.provider.clone(),
                    duration_ms,
                    result_size,
                });
            }
            CallOutcome::Error { kind, message, .. } => {
                self.emit(sink, Event::ToolCallFailed {
                    ts,
                    request_id: call.request_id.clone(),
                    tool: call.tool.clone(),
                    provider: call.provider.clone(),
                    duration_ms,
                    error_kind: kind.clone(),
                    error_message: message.clone(),
                    stack: None,
                });
            }
            CallOutcome::Timeout => {
                self.emit(sink, Event::ToolCallTimeout {
                    ts,
                    request_id: call.request_id.clone(),
                    tool: call.tool.clone(),
                    provider: call.provider.clone(),
                    deadline_ms: duration_ms,
                });
            }
            CallOutcome::Cancelled { reason } => {
                self.emit(sink, Event::ToolCallCancelled {
                    ts,
                    request_id: call.request_id.clone(),
                    reason: reason.clone(),
                });
            }
        }

        outcome
    }
}

/// Reduce an argument bag to a telemetry-safe summary: just the field names, not
/// values, so telemetry never carries potentially sensitive call payloads.
fn summarize_args(args: &relay_types::Arguments) -> serde_json::Value {
    let mut keys: Vec<&String> = args.keys().collect();
    keys.sort();
    serde_json::json!({ "fields": keys, "count": args.len() })
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_provider::ProviderHandle;
    use relay_tool::ToolDyn;
    use relay_types::{SessionId, Tier, ToolDescriptor, Transport, Visibility};
    use serde_json::json;
    use std::collections::HashSet;
    use std::future::Future;
    use std::pin::Pin;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken as Ct;

    struct EchoTool;
    impl ToolDyn for EchoTool {
        fn descriptor(&self) -> &ToolDescriptor {
            static DESCRIPTOR: std::sync::OnceLock<ToolDescriptor> = std::sync::OnceLock::new();
            DESCRIPTOR.get_or_init(|| ToolDescriptor {
                name: "echo".into(),
                description: "echoes".into(),
                input_schema: json!({"type": "object", "required": ["msg"]}),
                visibility: Visibility::Core,
                provider: None,
                tier: Tier::Simple,
            })
        }

        fn execute(
            &self,
            args: serde_json::Value,
            _ctx: &CallContext,
        ) -> Pin<Box<dyn Future<Output = Result<serde_json::Value, String>> + Send + '_>> {
            Box::pin(async move { Ok(json!({"reply": args.get("msg").cloned().unwrap_or(json!(null))})) })
        }
    }

    struct HangTool;
    impl ToolDyn for HangTool {
        fn descriptor(&self) -> &ToolDescriptor {
            static DESCRIPTOR: std::sync::OnceLock<ToolDescriptor> = std::sync::OnceLock::new();
            DESCRIPTOR.get_or_init(|| ToolDescriptor {
                name: "hang".into(),
                description: "never returns".into(),
                input_schema: json!({"type": "object"}),
                visibility: Visibility::Core,
                provider: None,
                tier: Tier::Simple,
            })
        }

        fn execute(
            &self,
            _args: serde_json::Value,
            _ctx: &CallContext,
        ) -> Pin<Box<dyn Future<Output = Result<serde_json::Value, String>> + Send + '_>> {
            Box::pin(async move {
                std::future::pending::<()>().await;
                unreachable!()
            })
        }
    }

    struct EchoProvider;
    #[async_trait::async_trait]
    impl ProviderHandle for EchoProvider {
        fn canonical_name(&self) -> &str {
            "demo"
        }
        async fn invoke(
            &self,
            tool_name: &str,
            args: serde_json::Value,
            _ctx: &CallContext,
        ) -> Result<serde_json::Value, String> {
            Ok(json!({"via_provider": tool_name, "args": args}))
        }
    }

    fn timeouts(tool: Duration) -> TimeoutTable {
        let tier = relay_types::TimeoutTier {
            tool,
            daemon: tool.mul_f64(1.5),
            frontend: tool.mul_f64(2.0),
            client: tool.mul_f64(2.5),
        };
        TimeoutTable { simple: tier, workflow: tier, expert: tier }
    }

    fn dispatcher(tool_timeout: Duration) -> (Dispatcher, Arc<Session>) {
        let mut tools = ToolRegistry::new();
        tools.register(Arc::new(EchoTool)).unwrap();
        tools.register(Arc::new(HangTool)).unwrap();

        let mut providers = ProviderRegistry::new();
        providers.register("demo", Arc::new(EchoProvider));

        let scheduler = Arc::new(Scheduler::new(8, 8, HashSet::new()));
        let telemetry = TelemetryEmitter::start_with_capacity(64, None);

        let dispatcher = Dispatcher::new(
            Arc::new(tools),
            Arc::new(providers),
            scheduler,
            telemetry,
            timeouts(tool_timeout),
        );

        let session = Arc::new(Session {
            id: SessionId::new("s1"),
            transport: Transport::Stdio,
            created_at: chrono::Utc::now(),
            semaphore: Arc::new(tokio::sync::Semaphore::new(4)),
            cancellation: Ct::new(),
        });

        (dispatcher, session)
    }

    fn call(request_id: &str, tool: &str, args: serde_json::Value, tier: Tier) -> Call {
        let mut arguments = relay_types::Arguments::new();
        if let serde_json::Value::Object(map) = args {
            arguments = map;
        }
        Call {
            request_id: RequestId::new(request_id),
            session_id: SessionId::new("s1"),
            tool: tool.to_string(),
            arguments,
            provider: None,
            fingerprint: relay_types::fingerprint(tool, &serde_json::Value::Object(Default::default())),
            tier,
            created_at: chrono::Utc::now(),
        }
    }

    #[tokio::test]
    async fn happy_path_returns_ok() {
        let (dispatcher, session) = dispatcher(Duration::from_secs(5));
        let c = call("r1", "echo", json!({"msg": "hi"}), Tier::Simple);
        let outcome = dispatcher.dispatch(c, &session).await;
        assert!(matches!(outcome, CallOutcome::Ok { payload } if payload == json!({"reply": "hi"})));
    }

    #[tokio::test]
    async fn unknown_tool_is_rejected_without_touching_the_scheduler() {
        let (dispatcher, session) = dispatcher(Duration::from_secs(5));
        let c = call("r1", "nope", json!({}), Tier::Simple);
        let outcome = dispatcher.dispatch(c, &session).await;
        assert!(matches!(outcome, CallOutcome::Error { kind, .. } if kind == "UnknownTool"));
    }

    #[tokio::test]
    async fn invalid_args_is_rejected_before_admission() {
        let (dispatcher, session) = dispatcher(Duration::from_secs(5));
        let c = call("r1", "echo", json!({}), Tier::Simple);
        let outcome = dispatcher.dispatch(c, &session).await;
        assert!(matches!(outcome, CallOutcome::Error { kind, .. } if kind == "InvalidArgs"));
    }

    #[tokio::test]
    async fn unknown_provider_is_rejected() {
        let (dispatcher, session) = dispatcher(Duration::from_secs(5));
        let mut c = call("r1", "echo", json!({"msg": "hi"}), Tier::Simple);
        c.provider = Some("nonexistent".into());
        let outcome = dispatcher.dispatch(c, &session).await;
        assert!(matches!(outcome, CallOutcome::Error { kind, .. } if kind == "UnknownProvider"));
    }

    #[tokio::test]
    async fn known_provider_is_invoked_instead_of_the_tool() {
        let (dispatcher, session) = dispatcher(Duration::from_secs(5));
        let mut c = call("r1", "echo", json!({"msg": "hi"}), Tier::Simple);
        c.provider = Some("demo".into());
        let outcome = dispatcher.dispatch(c, &session).await;
        assert!(matches!(outcome, CallOutcome::Ok { payload } if payload["via_provider"] == json!("echo")));
    }

    #[tokio::test(start_paused = true)]
    async fn hang_tool_times_out_at_the_tier_deadline() {
        let (dispatcher, session) = dispatcher(Duration::from_millis(50));
        let c = call("r1", "hang", json!({}), Tier::Simple);
        let outcome = tokio::time::timeout(Duration::from_secs(5), dispatcher.dispatch(c, &session))
            .await
            .expect("dispatch should resolve once the tool-tier deadline elapses");
        assert!(matches!(outcome, CallOutcome::Timeout));
    }

    #[tokio::test]
    async fn explicit_cancel_surfaces_the_requested_reason() {
        let (dispatcher, session) = dispatcher(Duration::from_secs(30));
        let c = call("r1", "hang", json!({}), Tier::Simple);
        let request_id = c.request_id.clone();

        let dispatch = async { dispatcher.dispatch(c, &session).await };
        let cancel = async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            assert!(dispatcher.cancel(&request_id, "client_cancel"));
        };

        let (outcome, ()) = tokio::join!(dispatch, cancel);
        assert!(matches!(outcome, CallOutcome::Cancelled { reason } if reason == "client_cancel"));
    }

    #[tokio::test]
    async fn cancel_on_unknown_request_id_is_a_no_op() {
        let (dispatcher, _session) = dispatcher(Duration::from_secs(5));
        assert!(!dispatcher.cancel(&RequestId::new("ghost"), "client_cancel"));
    }

    #[tokio::test]
    async fn dispatch_with_sink_mirrors_received_and_terminal_events() {
        let (dispatcher, session) = dispatcher(Duration::from_secs(5));
        let c = call("r1", "echo", json!({"msg": "hi"}), Tier::Simple);
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

        let outcome = dispatcher.dispatch_with_sink(c, &session, Some(&tx)).await;
        assert!(matches!(outcome, CallOutcome::Ok { .. }));
        drop(tx);

        let mut seen = Vec::new();
        while let Some(event) = rx.recv().await {
            seen.push(event);
        }
        assert!(matches!(seen[0], Event::ToolCallReceived { .. }));
        assert!(matches!(seen[1], Event::ToolCallAdmitted { .. }));
        assert!(matches!(seen[2], Event::ToolCallComplete { .. }));
    }
}
