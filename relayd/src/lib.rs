#![deny(missing_docs)]
//! Daemon binary support library for `relayd` (§4, §6).
//!
//! Boots the shared core (tool/provider registries, scheduler, telemetry sink,
//! dispatcher, session manager) once and hands it to both frontends. Mirrors the
//! teacher's own `brain::run`/`run_cli` split: `main.rs` stays a thin
//! `#[tokio::main]` shim that turns a [`RelaydError`] into a process exit code, all
//! the real bootstrap work lives in [`run`] so it can be read top-to-bottom.

use std::sync::Arc;
use std::time::Duration;

use relay_demo_tools::{EchoTool, HangTool, SlowEchoTool};
use relay_dispatch::Dispatcher;
use relay_provider::ProviderRegistry;
use relay_scheduler::Scheduler;
use relay_session::SessionManager;
use relay_telemetry::TelemetryEmitter;
use relay_tool::ToolRegistry;
use tokio_util::sync::CancellationToken;

/// Everything that can make the daemon fail to start or exit abnormally.
#[derive(Debug, thiserror::Error)]
pub enum RelaydError {
    /// `Config::from_env()` rejected the process environment (§6: exit code 1).
    #[error("configuration error: {0}")]
    Config(#[from] relay_config::ConfigError),
    /// The WebSocket listener failed to bind or its accept loop errored.
    #[error("websocket frontend error: {0}")]
    Ws(#[from] relay_ws::WsError),
    /// The stdio transport failed to start or errored out.
    #[error("mcp frontend error: {0}")]
    Mcp(#[from] relay_mcp::McpError),
    /// A frontend task panicked instead of returning normally.
    #[error("frontend task panicked: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl RelaydError {
    /// The process exit code this error maps to (§6): `1` for a configuration or
    /// startup error, `2` for an unrecoverable runtime error (a frontend that was
    /// already serving sessions failed and could not be re-bound).
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        match self {
            RelaydError::Config(_) => 1,
            RelaydError::Ws(_) | RelaydError::Mcp(_) | RelaydError::Join(_) => 2,
        }
    }
}

/// Install the process-wide `tracing` subscriber. Logs go to stderr, never stdout —
/// the MCP frontend's stdio transport owns stdout for JSON-RPC traffic, so anything
/// sharing that stream would corrupt the protocol.
pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();
}

/// Wait for SIGINT (Ctrl+C) or, on Unix, SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install SIGINT handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("received SIGINT, shutting down"),
        () = terminate => tracing::info!("received SIGTERM, shutting down"),
    }
}

/// Build the shared core and both frontends, then run until a shutdown signal or a
/// frontend error, draining in-flight work before returning (§4.7, §8 property 7).
///
/// # Errors
///
/// Returns [`RelaydError::Config`] if the environment fails validation, or whichever
/// frontend error surfaced first if a frontend exits abnormally before shutdown.
pub async fn run() -> Result<(), RelaydError> {
    let config = relay_config::Config::from_env()?;

    let mut tools = ToolRegistry::new();
    tools.register(Arc::new(EchoTool)).expect("demo tool names never collide at bootstrap");
    tools.register(Arc::new(SlowEchoTool)).expect("demo tool names never collide at bootstrap");
    tools.register(Arc::new(HangTool)).expect("demo tool names never collide at bootstrap");
    let tools = Arc::new(tools);

    let providers = Arc::new(ProviderRegistry::new());

    let scheduler = Arc::new(Scheduler::new(
        config.global_max_inflight,
        config.provider_max_inflight,
        config.coalesce_disabled_tools.clone(),
    ));

    let telemetry = TelemetryEmitter::start(config.telemetry_path.clone());

    let dispatcher = Arc::new(Dispatcher::new(
        tools,
        providers,
        scheduler,
        telemetry.clone(),
        config.timeouts.clone(),
    ));

    let root = CancellationToken::new();
    let sessions = Arc::new(SessionManager::new(
        root.clone(),
        config.ws_auth_token.clone(),
        config.session_max_inflight,
    ));

    let ws = relay_ws::WsFrontend::new(
        dispatcher.clone(),
        sessions.clone(),
        telemetry.clone(),
        config.ws_host.clone(),
        config.ws_port,
        config.hello_timeout,
    );
    let mut ws_task = tokio::spawn(ws.serve(root.clone()));

    let mcp = relay_mcp::McpFrontend::new(
        dispatcher.clone(),
        sessions.clone(),
        telemetry.clone(),
        config.hello_timeout,
        "relayd",
        env!("CARGO_PKG_VERSION"),
    );
    let mut mcp_task = tokio::spawn(mcp.serve_stdio());

    let early_exit = tokio::select! {
        () = shutdown_signal() => None,
        result = &mut ws_task => Some(result.map_err(RelaydError::from).and_then(|r| r.map_err(RelaydError::from))),
        result = &mut mcp_task => Some(result.map_err(RelaydError::from).and_then(|r| r.map_err(RelaydError::from))),
    };

    // §4.7 shutdown: cancel the root token (fans out to every session and, through
    // it, every in-flight Call) and mark every still-active Call's cancel reason
    // "shutdown" before the frontends have a chance to race ahead with their own.
    dispatcher.cancel_all("shutdown");
    sessions.shutdown();

    let max_tool_timeout = [
        config.timeouts.simple.tool,
        config.timeouts.workflow.tool,
        config.timeouts.expert.tool,
    ]
    .into_iter()
    .max()
    .expect("TimeoutTable always has three tiers");
    let drain_window = max_tool_timeout.mul_f64(1.2) + Duration::from_secs(5);

    match tokio::time::timeout(drain_window, async {
        let _ = (&mut ws_task).await;
        let _ = (&mut mcp_task).await;
    })
    .await
    {
        Ok(()) => tracing::info!("drained in-flight work before exit"),
        Err(_) => {
            tracing::warn!(?drain_window, "drain window elapsed; exiting with work still in flight")
        }
    }

    if let Some(result) = early_exit {
        result?;
    }
    Ok(())
}
