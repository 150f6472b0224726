//! The data model shared by every broker component (§3 of the design).

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::id::RequestId;

/// Determines a tool's deadline. See [`TimeoutTable`] for the derived nesting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    /// Short, cheap operations.
    Simple,
    /// Multi-step operations.
    Workflow,
    /// Long-running, expensive operations.
    Expert,
}

/// Who may see a tool in a `list_tools` response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Visibility {
    /// Shown to every client.
    Core,
    /// Shown only when a client opts in to advanced tooling.
    Advanced,
    /// Never listed; only callable if the caller already knows the name.
    Hidden,
}

/// Static, immutable-after-registration description of one callable tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDescriptor {
    /// Unique tool name.
    pub name: String,
    /// Human-readable description.
    pub description: String,
    /// JSON Schema fragment sufficient to validate required-field presence and
    /// primitive types; see [`crate::schema::validate`].
    pub input_schema: serde_json::Value,
    /// Who may see this tool in a listing.
    pub visibility: Visibility,
    /// Fixed provider binding, if any. When unset, the dispatcher reads
    /// `args.provider` instead.
    pub provider: Option<String>,
    /// Determines the deadline applied to calls against this tool.
    pub tier: Tier,
}

/// Transport a [`crate::SessionId`] was admitted over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Transport {
    /// Newline-delimited JSON-RPC over stdin/stdout.
    Stdio,
    /// Framed JSON over WebSocket.
    Ws,
}

/// The per-tier deadlines derived at startup, nested strictly per §3/§4.1:
/// `tool < daemon < frontend < client`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutTier {
    /// Deadline the tool implementation itself is held to.
    pub tool: Duration,
    /// Deadline for admission (semaphore acquisition), `tool * 1.5`.
    pub daemon: Duration,
    /// Deadline a frontend should use for its own send timeout, `tool * 2.0`.
    pub frontend: Duration,
    /// Deadline hint surfaced to external clients, `tool * 2.5`.
    pub client: Duration,
}

/// The full three-tier timeout table, one [`TimeoutTier`] per [`Tier`].
#[derive(Debug, Clone, Copy)]
pub struct TimeoutTable {
    /// Deadlines for [`Tier::Simple`].
    pub simple: TimeoutTier,
    /// Deadlines for [`Tier::Workflow`].
    pub workflow: TimeoutTier,
    /// Deadlines for [`Tier::Expert`].
    pub expert: TimeoutTier,
}

impl TimeoutTable {
    /// Look up the deadlines for a given tier.
    #[must_use]
    pub fn get(&self, tier: Tier) -> TimeoutTier {
        match tier {
            Tier::Simple => self.simple,
            Tier::Workflow => self.workflow,
            Tier::Expert => self.expert,
        }
    }
}

/// Raw JSON argument bag a `call_tool`/`tools/call` frame carried.
pub type Arguments = serde_json::Map<String, serde_json::Value>;

/// One tool invocation, as produced by either frontend and consumed by the dispatcher.
///
/// Structurally identical regardless of which frontend created it — "the Dispatcher
/// does not know which protocol originated a Call" (§4.9).
#[derive(Debug, Clone)]
pub struct Call {
    /// Client-supplied request id, echoed in every response and telemetry event.
    pub request_id: RequestId,
    /// Owning session.
    pub session_id: crate::id::SessionId,
    /// Name of the tool being invoked.
    pub tool: String,
    /// Raw argument bag.
    pub arguments: Arguments,
    /// Resolved provider name, filled in by the dispatcher once known.
    pub provider: Option<String>,
    /// SHA-256 fingerprint used for coalescing; empty disables coalescing.
    pub fingerprint: String,
    /// Deadline tier, copied from the tool's [`ToolDescriptor`] at Call construction.
    pub tier: Tier,
    /// Wall-clock instant the Call was created, for `wait_ms`/`duration_ms` telemetry.
    pub created_at: chrono::DateTime<chrono::Utc>,
}

/// The normalized terminal result of a Call (§4.6 step 6).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CallOutcome {
    /// The tool returned a result.
    Ok {
        /// The tool's JSON payload.
        payload: serde_json::Value,
    },
    /// The tool or the broker reported a structured error.
    Error {
        /// Stable error kind string (`BrokerError::kind()`).
        kind: String,
        /// Human-readable message.
        message: String,
        /// Optional structured detail (e.g. which argument failed validation).
        detail: Option<serde_json::Value>,
    },
    /// The tool or admission deadline elapsed.
    Timeout,
    /// The call was cancelled before completion.
    Cancelled {
        /// Why: `"session_closed"`, `"client_cancel"`, `"shutdown"`.
        reason: String,
    },
}

impl CallOutcome {
    /// Build an `Error` outcome from a [`crate::error::BrokerError`].
    #[must_use]
    pub fn from_broker_error(err: &crate::error::BrokerError) -> Self {
        Self::Error {
            kind: err.kind().to_string(),
            message: err.to_string(),
            detail: None,
        }
    }

    /// Whether this outcome is one of the four terminal states (it always is —
    /// every variant of this enum is terminal; the helper exists for call sites
    /// that pattern-match generically over "is this a Call done yet").
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        true
    }
}

/// Extra context passed to a tool at execution time (§4.6 step 4).
pub struct CallContext {
    /// Echoed in telemetry and error responses.
    pub request_id: RequestId,
    /// Owning session.
    pub session_id: crate::id::SessionId,
    /// Cooperative cancellation handle; tools MUST observe this at I/O boundaries.
    pub cancellation: tokio_util::sync::CancellationToken,
    /// Absolute deadline for tool execution.
    pub deadline: tokio::time::Instant,
    /// Resolved provider name, if any.
    pub provider: Option<String>,
}

/// Canonicalize a JSON value for fingerprinting: recursively sort object keys.
///
/// Arrays keep their order (argument order inside a list is meaningful); only object
/// key order is normalized, since JSON object key order is not semantically meaningful
/// but does affect naive serialization.
#[must_use]
pub fn canonical_json(value: &serde_json::Value) -> serde_json::Value {
    match value {
        serde_json::Value::Object(map) => {
            let mut entries: Vec<(&String, &serde_json::Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            let mut out = serde_json::Map::with_capacity(entries.len());
            for (k, v) in entries {
                out.insert(k.clone(), canonical_json(v));
            }
            serde_json::Value::Object(out)
        }
        serde_json::Value::Array(items) => {
            serde_json::Value::Array(items.iter().map(canonical_json).collect())
        }
        other => other.clone(),
    }
}

/// Compute a Call's fingerprint: SHA-256 of `toolName || '\0' || canonicalJSON(args)`.
///
/// Returns an empty string (disabling coalescing) if `tool` is empty — the spec treats
/// that as a fingerprint-computation failure case (§4.5 step 1).
#[must_use]
pub fn fingerprint(tool: &str, args: &serde_json::Value) -> String {
    if tool.is_empty() {
        return String::new();
    }
    use sha2::{Digest, Sha256};
    let canonical = canonical_json(args);
    let canonical_bytes = match serde_json::to_vec(&canonical) {
        Ok(bytes) => bytes,
        Err(_) => return String::new(),
    };
    let mut hasher = Sha256::new();
    hasher.update(tool.as_bytes());
    hasher.update([0u8]);
    hasher.update(&canonical_bytes);
    hex_encode(&hasher.finalize())
}

fn hex_encode(bytes: &[u8]) -> String {
    use std::fmt::Write;
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(out, "{b:02x}");
    }
    out
}
