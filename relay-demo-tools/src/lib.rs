#![deny(missing_docs)]
//! The three demo tools §8's concrete scenarios exercise: `echo`, `slow_echo`, `hang`.
//!
//! None of these are part of the brokering core — they exist only to give the daemon
//! *a* tool to dispatch against, the way the teacher keeps its own `EchoTool`/`FailTool`
//! test fixtures out of `neuron-tool`'s library surface proper.

use std::future::Future;
use std::pin::Pin;
use std::sync::OnceLock;
use std::time::Duration;

use relay_types::{CallContext, Tier, ToolDescriptor, Visibility};
use serde_json::{json, Value};

/// Returns `{"reply": args.msg}` immediately.
pub struct EchoTool;

impl relay_tool::ToolDyn for EchoTool {
    fn descriptor(&self) -> &ToolDescriptor {
        static DESCRIPTOR: OnceLock<ToolDescriptor> = OnceLock::new();
        DESCRIPTOR.get_or_init(|| ToolDescriptor {
            name: "echo".into(),
            description: "Echoes args.msg back as { reply: msg }.".into(),
            input_schema: json!({
                "type": "object",
                "properties": {"msg": {"type": "string"}},
                "required": ["msg"],
            }),
            visibility: Visibility::Core,
            provider: None,
            tier: Tier::Simple,
        })
    }

    fn execute(
        &self,
        args: Value,
        _ctx: &CallContext,
    ) -> Pin<Box<dyn Future<Output = Result<Value, String>> + Send + '_>> {
        Box::pin(async move { Ok(json!({"reply": args.get("msg").cloned().unwrap_or(Value::Null)})) })
    }
}

/// Sleeps two seconds, then returns `{"reply": args.msg}` — §8 scenarios S2/S3's
/// coalescing and session-limit fixture. Observes `ctx.cancellation` at its one I/O
/// boundary (the sleep) rather than running it to completion regardless (§4.7).
pub struct SlowEchoTool;

impl relay_tool::ToolDyn for SlowEchoTool {
    fn descriptor(&self) -> &ToolDescriptor {
        static DESCRIPTOR: OnceLock<ToolDescriptor> = OnceLock::new();
        DESCRIPTOR.get_or_init(|| ToolDescriptor {
            name: "slow_echo".into(),
            description: "Sleeps two seconds, then echoes args.msg back as { reply: msg }.".into(),
            input_schema: json!({
                "type": "object",
                "properties": {"msg": {"type": "string"}},
                "required": ["msg"],
            }),
            visibility: Visibility::Core,
            provider: None,
            tier: Tier::Simple,
        })
    }

    fn execute(
        &self,
        args: Value,
        ctx: &CallContext,
    ) -> Pin<Box<dyn Future<Output = Result<Value, String>> + Send + '_>> {
        Box::pin(async move {
            let sleep = tokio::time::sleep(Duration::from_secs(2));
            tokio::pin!(sleep);
            tokio::select! {
                () = &mut sleep => {}
                () = ctx.cancellation.cancelled() => return Err("cancelled before completion".to_string()),
            }
            Ok(json!({"reply": args.get("msg").cloned().unwrap_or(Value::Null)}))
        })
    }
}

/// Never returns on its own — §8 scenario S4's timeout fixture. Only resolves when
/// `ctx.cancellation` fires (deadline, disconnect, or shutdown), at which point it
/// reports cancellation rather than racing the Dispatcher's own timeout branch.
pub struct HangTool;

impl relay_tool::ToolDyn for HangTool {
    fn descriptor(&self) -> &ToolDescriptor {
        static DESCRIPTOR: OnceLock<ToolDescriptor> = OnceLock::new();
        DESCRIPTOR.get_or_init(|| ToolDescriptor {
            name: "hang".into(),
            description: "Never returns; only stops when cancelled.".into(),
            input_schema: json!({"type": "object"}),
            visibility: Visibility::Core,
            provider: None,
            tier: Tier::Simple,
        })
    }

    fn execute(
        &self,
        _args: Value,
        ctx: &CallContext,
    ) -> Pin<Box<dyn Future<Output = Result<Value, String>> + Send + '_>> {
        Box::pin(async move {
            ctx.cancellation.cancelled().await;
            Err("cancelled before completion".to_string())
        })
    }
}
