//! The closed error taxonomy shared by the dispatcher, both frontends, and telemetry.
//!
//! Every fallible path in the broker produces one of these variants. Each carries a
//! stable numeric JSON-RPC code and a stable string kind; neither may be renumbered or
//! renamed once a client depends on it, so the enum is deliberately not
//! `#[non_exhaustive]` — see DESIGN.md for why that's a departure from the rest of this
//! workspace's error enums.

use thiserror::Error;

/// A terminal or propagated error produced by the broker core.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// Malformed frame or missing required field.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Tool name not registered.
    #[error("unknown tool: {0}")]
    UnknownTool(String),

    /// Args failed schema validation.
    #[error("invalid args for {tool}: {message}")]
    InvalidArgs {
        /// Name of the tool whose schema rejected the args.
        tool: String,
        /// Human-readable validation failure.
        message: String,
    },

    /// Provider name not registered.
    #[error("unknown provider: {0}")]
    UnknownProvider(String),

    /// Credential missing or invalid.
    #[error("authentication failed")]
    AuthError,

    /// No `hello` frame within `HELLO_TIMEOUT_SECS`.
    #[error("no hello frame received within the timeout")]
    HelloTimeout,

    /// Tool or admission deadline elapsed.
    #[error("deadline exceeded")]
    Timeout,

    /// Cancelled by client, disconnect, or shutdown.
    #[error("cancelled: {0}")]
    Cancelled(String),

    /// Tool reported a structured error.
    #[error("tool error: {0}")]
    ToolError(String),

    /// Provider invocation failed (network, upstream 5xx, etc.).
    #[error("provider error: {0}")]
    ProviderError(String),

    /// Unexpected exception in the core. Clients only ever see the generic message;
    /// `detail` (if any) goes to telemetry only.
    #[error("internal error")]
    Internal,
}

impl BrokerError {
    /// The stable numeric code used in JSON-RPC error objects.
    #[must_use]
    pub fn code(&self) -> i32 {
        match self {
            Self::InvalidRequest(_) => -32600,
            Self::UnknownTool(_) => -32601,
            Self::InvalidArgs { .. } => -32602,
            Self::UnknownProvider(_) => -32010,
            Self::AuthError => -32011,
            Self::HelloTimeout => -32012,
            Self::Timeout => -32013,
            Self::Cancelled(_) => -32014,
            Self::ToolError(_) => -32015,
            Self::ProviderError(_) => -32016,
            Self::Internal => -32000,
        }
    }

    /// The stable string kind used in WebSocket frames and telemetry events.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidRequest(_) => "InvalidRequest",
            Self::UnknownTool(_) => "UnknownTool",
            Self::InvalidArgs { .. } => "InvalidArgs",
            Self::UnknownProvider(_) => "UnknownProvider",
            Self::AuthError => "AuthError",
            Self::HelloTimeout => "HelloTimeout",
            Self::Timeout => "Timeout",
            Self::Cancelled(_) => "Cancelled",
            Self::ToolError(_) => "ToolError",
            Self::ProviderError(_) => "ProviderError",
            Self::Internal => "Internal",
        }
    }

    /// Whether this error closes the owning session (per §7's propagation column).
    #[must_use]
    pub fn closes_session(&self) -> bool {
        matches!(self, Self::AuthError | Self::HelloTimeout)
    }
}
