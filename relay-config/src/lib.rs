#![deny(missing_docs)]
//! Environment-backed configuration and timeout-hierarchy derivation (§4.1).
//!
//! [`Config::from_env`] reads the flat string-valued options enumerated in §4.1,
//! validates them, and derives the four-tier [`relay_types::TimeoutTable`]. Validation
//! failures are fatal at startup (`relayd` turns [`ConfigError`] into exit code `1`,
//! per §6) — this crate never silently falls back to a default for a value the
//! operator got wrong, only for a value they didn't set at all.

use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use relay_types::{Tier, TimeoutTable, TimeoutTier};
use thiserror::Error;

/// Everything that can go wrong loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// `TOOL_TIMEOUT_<TIER>` was not a positive integer number of seconds.
    #[error("{var} must be a positive integer number of seconds, got {value:?}")]
    NonPositiveTimeout {
        /// Name of the offending environment variable.
        var: &'static str,
        /// The raw string value that failed to parse or was non-positive.
        value: String,
    },

    /// After deriving `tool -> daemon -> frontend -> client` and rounding, the
    /// strict nesting `tool < daemon < frontend < client` did not hold.
    #[error("timeout hierarchy collapsed for {tier} tier: tool={tool_ms}ms daemon={daemon_ms}ms frontend={frontend_ms}ms client={client_ms}ms")]
    TimeoutHierarchyViolation {
        /// Which tier's derived table collapsed.
        tier: &'static str,
        /// Tool-facing deadline, milliseconds.
        tool_ms: u64,
        /// Daemon-facing admission deadline, milliseconds.
        daemon_ms: u64,
        /// Frontend-facing send deadline, milliseconds.
        frontend_ms: u64,
        /// External client hint deadline, milliseconds.
        client_ms: u64,
    },

    /// A semaphore capacity variable was not a positive integer.
    #[error("{var} must be a positive integer >= 1, got {value:?}")]
    InvalidCapacity {
        /// Name of the offending environment variable.
        var: &'static str,
        /// The raw string value that failed to parse or was below 1.
        value: String,
    },

    /// `WS_PORT` did not parse as a `u16`.
    #[error("WS_PORT must be a valid port number, got {0:?}")]
    InvalidPort(String),
}

/// The daemon's fully validated runtime configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Derived, validated per-tier deadline table.
    pub timeouts: TimeoutTable,
    /// Process-wide in-flight call cap.
    pub global_max_inflight: usize,
    /// Per-provider in-flight call cap (applied lazily, per provider name).
    pub provider_max_inflight: usize,
    /// Per-session in-flight call cap.
    pub session_max_inflight: usize,
    /// WebSocket bind host.
    pub ws_host: String,
    /// WebSocket bind port.
    pub ws_port: u16,
    /// Required bearer for WebSocket clients; `None` means the WS frontend is
    /// unauthenticated (stdio never checks this regardless).
    pub ws_auth_token: Option<String>,
    /// Max time between transport accept and first valid `hello` frame.
    pub hello_timeout: Duration,
    /// Tool names exempt from coalescing.
    pub coalesce_disabled_tools: HashSet<String>,
    /// Optional file path for the append-only JSON-lines telemetry sink.
    pub telemetry_path: Option<PathBuf>,
}

impl Config {
    /// Load and validate configuration from the process environment.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if any timeout is non-positive, any derived tier's
    /// nesting collapses under rounding, or any semaphore capacity is below 1.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut builder = ConfigBuilder::new();

        if let Some(v) = env_var("TOOL_TIMEOUT_SIMPLE") {
            builder = builder.simple_timeout_secs(parse_positive_secs("TOOL_TIMEOUT_SIMPLE", &v)?);
        }
        if let Some(v) = env_var("TOOL_TIMEOUT_WORKFLOW") {
            builder =
                builder.workflow_timeout_secs(parse_positive_secs("TOOL_TIMEOUT_WORKFLOW", &v)?);
        }
        if let Some(v) = env_var("TOOL_TIMEOUT_EXPERT") {
            builder = builder.expert_timeout_secs(parse_positive_secs("TOOL_TIMEOUT_EXPERT", &v)?);
        }
        if let Some(v) = env_var("GLOBAL_MAX_INFLIGHT") {
            builder = builder
                .global_max_inflight(parse_capacity("GLOBAL_MAX_INFLIGHT", &v)?);
        }
        if let Some(v) = env_var("PROVIDER_MAX_INFLIGHT") {
            builder = builder
                .provider_max_inflight(parse_capacity("PROVIDER_MAX_INFLIGHT", &v)?);
        }
        if let Some(v) = env_var("SESSION_MAX_INFLIGHT") {
            builder = builder
                .session_max_inflight(parse_capacity("SESSION_MAX_INFLIGHT", &v)?);
        }
        if let Some(v) = env_var("WS_HOST") {
            builder = builder.ws_host(v);
        }
        if let Some(v) = env_var("WS_PORT") {
            let port: u16 = v.parse().map_err(|_| ConfigError::InvalidPort(v.clone()))?;
            builder = builder.ws_port(port);
        }
        if let Some(v) = env_var("WS_AUTH_TOKEN") {
            builder = builder.ws_auth_token(Some(v));
        }
        if let Some(v) = env_var("HELLO_TIMEOUT_SECS") {
            let secs: u64 = v
                .parse()
                .map_err(|_| ConfigError::NonPositiveTimeout { var: "HELLO_TIMEOUT_SECS", value: v })?;
            builder = builder.hello_timeout(Duration::from_secs(secs));
        }
        if let Some(v) = env_var("COALESCE_DISABLED_TOOLS") {
            let names = v
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
            builder = builder.coalesce_disabled_tools(names);
        }
        if let Some(v) = env_var("TELEMETRY_PATH") {
            builder = builder.telemetry_path(Some(PathBuf::from(v)));
        }

        builder.build()
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn parse_positive_secs(var: &'static str, value: &str) -> Result<u64, ConfigError> {
    match value.parse::<i64>() {
        Ok(secs) if secs > 0 => Ok(secs as u64),
        _ => Err(ConfigError::NonPositiveTimeout {
            var,
            value: value.to_string(),
        }),
    }
}

fn parse_capacity(var: &'static str, value: &str) -> Result<usize, ConfigError> {
    match value.parse::<i64>() {
        Ok(n) if n >= 1 => Ok(n as usize),
        _ => Err(ConfigError::InvalidCapacity {
            var,
            value: value.to_string(),
        }),
    }
}

/// Builder-style [`Config`] construction, mirroring the teacher's
/// `AgentLoopBuilder`/`UsageLimits::with_*` idiom: sensible defaults, one setter per
/// field, `build()` performs the cross-field validation that a plain struct literal
/// can't enforce.
#[derive(Debug, Clone)]
pub struct ConfigBuilder {
    simple_timeout_secs: u64,
    workflow_timeout_secs: u64,
    expert_timeout_secs: u64,
    global_max_inflight: usize,
    provider_max_inflight: usize,
    session_max_inflight: usize,
    ws_host: String,
    ws_port: u16,
    ws_auth_token: Option<String>,
    hello_timeout: Duration,
    coalesce_disabled_tools: HashSet<String>,
    telemetry_path: Option<PathBuf>,
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self {
            simple_timeout_secs: 10,
            workflow_timeout_secs: 60,
            expert_timeout_secs: 300,
            global_max_inflight: 64,
            provider_max_inflight: 16,
            session_max_inflight: 4,
            ws_host: "127.0.0.1".to_string(),
            ws_port: 8787,
            ws_auth_token: None,
            hello_timeout: Duration::from_secs(10),
            coalesce_disabled_tools: HashSet::new(),
            telemetry_path: None,
        }
    }
}

impl ConfigBuilder {
    /// Start from the built-in defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set `TOOL_TIMEOUT_SIMPLE`.
    #[must_use]
    pub fn simple_timeout_secs(mut self, secs: u64) -> Self {
        self.simple_timeout_secs = secs;
        self
    }

    /// Set `TOOL_TIMEOUT_WORKFLOW`.
    #[must_use]
    pub fn workflow_timeout_secs(mut self, secs: u64) -> Self {
        self.workflow_timeout_secs = secs;
        self
    }

    /// Set `TOOL_TIMEOUT_EXPERT`.
    #[must_use]
    pub fn expert_timeout_secs(mut self, secs: u64) -> Self {
        self.expert_timeout_secs = secs;
        self
    }

    /// Set `GLOBAL_MAX_INFLIGHT`.
    #[must_use]
    pub fn global_max_inflight(mut self, n: usize) -> Self {
        self.global_max_inflight = n;
        self
    }

    /// Set `PROVIDER_MAX_INFLIGHT`.
    #[must_use]
    pub fn provider_max_inflight(mut self, n: usize) -> Self {
        self.provider_max_inflight = n;
        self
    }

    /// Set `SESSION_MAX_INFLIGHT`.
    #[must_use]
    pub fn session_max_inflight(mut self, n: usize) -> Self {
        self.session_max_inflight = n;
        self
    }

    /// Set `WS_HOST`.
    #[must_use]
    pub fn ws_host(mut self, host: impl Into<String>) -> Self {
        self.ws_host = host.into();
        self
    }

    /// Set `WS_PORT`.
    #[must_use]
    pub fn ws_port(mut self, port: u16) -> Self {
        self.ws_port = port;
        self
    }

    /// Set `WS_AUTH_TOKEN`.
    #[must_use]
    pub fn ws_auth_token(mut self, token: Option<String>) -> Self {
        self.ws_auth_token = token;
        self
    }

    /// Set `HELLO_TIMEOUT_SECS`.
    #[must_use]
    pub fn hello_timeout(mut self, timeout: Duration) -> Self {
        self.hello_timeout = timeout;
        self
    }

    /// Set `COALESCE_DISABLED_TOOLS`.
    #[must_use]
    pub fn coalesce_disabled_tools(mut self, tools: HashSet<String>) -> Self {
        self.coalesce_disabled_tools = tools;
        self
    }

    /// Set `TELEMETRY_PATH`.
    #[must_use]
    pub fn telemetry_path(mut self, path: Option<PathBuf>) -> Self {
        self.telemetry_path = path;
        self
    }

    /// Validate and derive the timeout table, producing a [`Config`].
    ///
    /// # Errors
    ///
    /// See [`ConfigError`].
    pub fn build(self) -> Result<Config, ConfigError> {
        let simple = derive_tier("simple", self.simple_timeout_secs)?;
        let workflow = derive_tier("workflow", self.workflow_timeout_secs)?;
        let expert = derive_tier("expert", self.expert_timeout_secs)?;

        require_capacity("GLOBAL_MAX_INFLIGHT", self.global_max_inflight)?;
        require_capacity("PROVIDER_MAX_INFLIGHT", self.provider_max_inflight)?;
        require_capacity("SESSION_MAX_INFLIGHT", self.session_max_inflight)?;

        Ok(Config {
            timeouts: TimeoutTable {
                simple,
                workflow,
                expert,
            },
            global_max_inflight: self.global_max_inflight,
            provider_max_inflight: self.provider_max_inflight,
            session_max_inflight: self.session_max_inflight,
            ws_host: self.ws_host,
            ws_port: self.ws_port,
            ws_auth_token: self.ws_auth_token,
            hello_timeout: self.hello_timeout,
            coalesce_disabled_tools: self.coalesce_disabled_tools,
            telemetry_path: self.telemetry_path,
        })
    }
}

/// Derive one tier's nested deadlines from its tool-facing seconds value and
/// validate strict monotonicity after rounding (§4.1, §8 property 6).
///
/// Ratios are applied in whole milliseconds rather than whole seconds: `TOOL_TIMEOUT_*`
/// is seconds-granular on the wire, but deriving the 1.5x/2x/2.5x multiples at
/// millisecond resolution before rounding avoids the hierarchy collapsing for small
/// tool timeouts purely due to integer-second truncation (e.g. a 1-second tool tier
/// would otherwise round daemon and frontend to the same value).
fn derive_tier(name: &'static str, tool_secs: u64) -> Result<TimeoutTier, ConfigError> {
    if tool_secs == 0 {
        return Err(ConfigError::NonPositiveTimeout {
            var: name,
            value: "0".to_string(),
        });
    }
    let tool_ms = tool_secs * 1000;
    let daemon_ms = round_ratio(tool_ms, 1.5);
    let frontend_ms = round_ratio(tool_ms, 2.0);
    let client_ms = round_ratio(tool_ms, 2.5);

    if !(tool_ms < daemon_ms && daemon_ms < frontend_ms && frontend_ms < client_ms) {
        return Err(ConfigError::TimeoutHierarchyViolation {
            tier: name,
            tool_ms,
            daemon_ms,
            frontend_ms,
            client_ms,
        });
    }

    Ok(TimeoutTier {
        tool: Duration::from_millis(tool_ms),
        daemon: Duration::from_millis(daemon_ms),
        frontend: Duration::from_millis(frontend_ms),
        client: Duration::from_millis(client_ms),
    })
}

fn round_ratio(base_ms: u64, ratio: f64) -> u64 {
    ((base_ms as f64) * ratio).round() as u64
}

fn require_capacity(var: &'static str, n: usize) -> Result<(), ConfigError> {
    if n < 1 {
        return Err(ConfigError::InvalidCapacity {
            var,
            value: n.to_string(),
        });
    }
    Ok(())
}
