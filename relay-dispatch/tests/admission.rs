//! Cross-component admission scenarios that need real concurrency and the scheduler's
//! session semaphore, rather than the single-call cases covered inline.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use relay_demo_tools::{EchoTool, HangTool, SlowEchoTool};
use relay_dispatch::Dispatcher;
use relay_provider::ProviderRegistry;
use relay_scheduler::Scheduler;
use relay_session::Session;
use relay_telemetry::{Event, TelemetryEmitter};
use relay_tool::ToolRegistry;
use relay_types::{Call, CallOutcome, RequestId, SessionId, Tier, TimeoutTable, TimeoutTier, Transport};
use serde_json::json;
use tokio_util::sync::CancellationToken;

fn timeouts(tool: Duration) -> TimeoutTable {
    let tier = TimeoutTier {
        tool,
        daemon: tool.mul_f64(1.5),
        frontend: tool.mul_f64(2.0),
        client: tool.mul_f64(2.5),
    };
    TimeoutTable { simple: tier, workflow: tier, expert: tier }
}

fn dispatcher(tool_timeout: Duration) -> Arc<Dispatcher> {
    let mut tools = ToolRegistry::new();
    tools.register(Arc::new(EchoTool)).unwrap();
    tools.register(Arc::new(SlowEchoTool)).unwrap();
    tools.register(Arc::new(HangTool)).unwrap();

    Arc::new(Dispatcher::new(
        Arc::new(tools),
        Arc::new(ProviderRegistry::new()),
        Arc::new(Scheduler::new(8, 8, HashSet::new())),
        TelemetryEmitter::start_with_capacity(256, None),
        timeouts(tool_timeout),
    ))
}

fn session(session_max_inflight: usize) -> Arc<Session> {
    Arc::new(Session {
        id: SessionId::new("s1"),
        transport: Transport::Stdio,
        created_at: chrono::Utc::now(),
        semaphore: Arc::new(tokio::sync::Semaphore::new(session_max_inflight)),
        cancellation: CancellationToken::new(),
    })
}

fn call(request_id: &str, tool: &str, args: serde_json::Value, dispatcher: &Dispatcher) -> Call {
    let arguments = match &args {
        serde_json::Value::Object(map) => map.clone(),
        _ => Default::default(),
    };
    Call {
        request_id: RequestId::new(request_id),
        session_id: SessionId::new("s1"),
        tool: tool.to_string(),
        fingerprint: dispatcher.compute_fingerprint(tool, &args),
        arguments,
        provider: None,
        tier: Tier::Simple,
        created_at: chrono::Utc::now(),
    }
}

async fn dispatch_and_collect_wait_ms(
    dispatcher: Arc<Dispatcher>,
    session: Arc<Session>,
    c: Call,
) -> (CallOutcome, Option<u64>) {
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let outcome = dispatcher.dispatch_with_sink(c, &session, Some(&tx)).await;
    drop(tx);
    let mut wait_ms = None;
    while let Some(event) = rx.recv().await {
        if let Event::ToolCallAdmitted { wait_ms: w, .. } = event {
            wait_ms = Some(w);
        }
    }
    (outcome, wait_ms)
}

/// §8 scenario S3: a session capped at two in-flight calls admits a third only once a
/// slot frees up, and the third call's `wait_ms` reflects the full wait.
#[tokio::test(start_paused = true)]
async fn third_concurrent_call_on_a_two_slot_session_waits_for_a_slot() {
    let dispatcher = dispatcher(Duration::from_secs(10));
    let session = session(2);

    let a = call("r-a", "slow_echo", json!({"msg": "a"}), &dispatcher);
    let b = call("r-b", "slow_echo", json!({"msg": "b"}), &dispatcher);
    let c = call("r-c", "slow_echo", json!({"msg": "c"}), &dispatcher);

    let (ra, rb, rc) = tokio::join!(
        dispatch_and_collect_wait_ms(dispatcher.clone(), session.clone(), a),
        dispatch_and_collect_wait_ms(dispatcher.clone(), session.clone(), b),
        dispatch_and_collect_wait_ms(dispatcher.clone(), session.clone(), c),
    );

    for (outcome, _) in [&ra, &rb, &rc] {
        assert!(matches!(outcome, CallOutcome::Ok { .. }), "every call should eventually succeed");
    }

    let waits = [ra.1.unwrap_or(0), rb.1.unwrap_or(0), rc.1.unwrap_or(0)];
    let max_wait = *waits.iter().max().unwrap();
    assert!(
        max_wait >= 1900,
        "the third call should have waited roughly the slow tool's two seconds for a slot, got {waits:?}"
    );
}

/// §8 scenario S4 follow-up: once a `hang` call times out, its session semaphore is
/// released immediately, so the next call on the same session is admitted with no wait.
#[tokio::test(start_paused = true)]
async fn a_call_after_a_timeout_is_admitted_immediately() {
    let dispatcher = dispatcher(Duration::from_millis(50));
    let session = session(2);

    let timed_out = call("r1", "hang", json!({}), &dispatcher);
    let outcome1 = tokio::time::timeout(Duration::from_secs(5), dispatcher.dispatch(timed_out, &session))
        .await
        .expect("dispatch should resolve once the tool-tier deadline elapses");
    assert!(matches!(outcome1, CallOutcome::Timeout));

    let fresh = call("r2", "echo", json!({"msg": "hi"}), &dispatcher);
    let (outcome2, wait_ms) = dispatch_and_collect_wait_ms(dispatcher.clone(), session.clone(), fresh).await;

    assert!(matches!(outcome2, CallOutcome::Ok { .. }));
    assert_eq!(wait_ms, Some(0), "the session semaphore freed by the timed-out call should be available immediately");
}
