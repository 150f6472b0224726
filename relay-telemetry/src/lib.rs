#![deny(missing_docs)]
//! Telemetry Emitter for the relay broker (§4.8).
//!
//! Structured JSON-lines events to stderr and, optionally, to a `TELEMETRY_PATH` file,
//! mirrored as `tracing` events. Emission is non-blocking from the caller's point of
//! view: [`TelemetryEmitter::emit`] only ever touches an in-memory ring buffer, never
//! an I/O call, matching §5's "writer MUST NOT block the calling task for more than a
//! small bounded time". A background task drains the buffer; when the buffer is full,
//! the oldest queued event is dropped and counted (§5's "bounded channel with
//! drop-oldest on overflow, and count drops") rather than applying backpressure to
//! the caller — `tokio::sync::mpsc` has no drop-oldest mode, so this is a small
//! `VecDeque` + `Notify` ring buffer instead, grounded on the teacher's own
//! `Notify`-driven producer/consumer split in its idempotency store.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use relay_types::{RequestId, SessionId, Transport};
use serde::Serialize;
use tokio::sync::Notify;

/// Default capacity of the in-memory ring buffer between `emit` and the drain task.
pub const DEFAULT_CAPACITY: usize = 4096;

/// Minimum interval between consecutive "telemetry events were dropped" warnings.
const DROP_WARNING_INTERVAL: Duration = Duration::from_secs(60);

/// One structured telemetry event (§4.8's table). `#[serde(tag = "event")]` plus
/// `rename_all = "snake_case"` makes the wire tag exactly the event names the table
/// lists (`tool_call_received`, `tool_coalesced`, `session_opened`, ...).
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Event {
    /// A Call was accepted by a frontend, before admission is attempted.
    ToolCallReceived {
        /// Emission timestamp.
        ts: DateTime<Utc>,
        /// Owning session.
        session_id: SessionId,
        /// Client-supplied request id.
        request_id: RequestId,
        /// Tool name.
        tool: String,
        /// Resolved provider name, if known yet.
        provider: Option<String>,
        /// Small summary of the argument bag (never the full payload).
        arg_summary: serde_json::Value,
    },
    /// A Call acquired all required semaphores and became a leader.
    ToolCallAdmitted {
        /// Emission timestamp.
        ts: DateTime<Utc>,
        /// Client-supplied request id.
        request_id: RequestId,
        /// Tool name.
        tool: String,
        /// Resolved provider name, if any.
        provider: Option<String>,
        /// Milliseconds spent waiting for admission.
        wait_ms: u64,
    },
    /// A Call joined an already in-flight identical call as a follower.
    ToolCoalesced {
        /// Emission timestamp.
        ts: DateTime<Utc>,
        /// Client-supplied request id.
        request_id: RequestId,
        /// Tool name.
        tool: String,
        /// The leader Call's request id.
        leader_request_id: RequestId,
    },
    /// A Call's tool returned a result.
    ToolCallComplete {
        /// Emission timestamp.
        ts: DateTime<Utc>,
        /// Client-supplied request id.
        request_id: RequestId,
        /// Tool name.
        tool: String,
        /// Resolved provider name, if any.
        provider: Option<String>,
        /// Milliseconds spent running (from admission to completion).
        duration_ms: u64,
        /// Serialized size in bytes of the result payload.
        result_size: usize,
    },
    /// A Call's tool or the broker reported a structured error.
    ToolCallFailed {
        /// Emission timestamp.
        ts: DateTime<Utc>,
        /// Client-supplied request id.
        request_id: RequestId,
        /// Tool name.
        tool: String,
        /// Resolved provider name, if any.
        provider: Option<String>,
        /// Milliseconds spent running before failing.
        duration_ms: u64,
        /// Stable `BrokerError::kind()` string.
        error_kind: String,
        /// Human-readable message.
        error_message: String,
        /// Optional backtrace/diagnostic detail; never sent to clients.
        stack: Option<String>,
    },
    /// A Call's tool or admission deadline elapsed.
    ToolCallTimeout {
        /// Emission timestamp.
        ts: DateTime<Utc>,
        /// Client-supplied request id.
        request_id: RequestId,
        /// Tool name.
        tool: String,
        /// Resolved provider name, if any.
        provider: Option<String>,
        /// The deadline that was exceeded, in milliseconds from Call creation.
        deadline_ms: u64,
    },
    /// A Call was cancelled before completion.
    ToolCallCancelled {
        /// Emission timestamp.
        ts: DateTime<Utc>,
        /// Client-supplied request id.
        request_id: RequestId,
        /// Why: `"session_closed"`, `"client_cancel"`, `"shutdown"`.
        reason: String,
    },
    /// A Session was admitted.
    SessionOpened {
        /// Emission timestamp.
        ts: DateTime<Utc>,
        /// The new session's id.
        session_id: SessionId,
        /// Transport it was admitted over.
        transport: Transport,
    },
    /// A Session was torn down.
    SessionClosed {
        /// Emission timestamp.
        ts: DateTime<Utc>,
        /// The session's id.
        session_id: SessionId,
        /// Transport it had been admitted over.
        transport: Transport,
        /// Why: `"disconnect"`, `"hello_timeout"`, `"auth_error"`, `"shutdown"`.
        reason: Option<String>,
    },
}

struct Inner {
    buffer: Mutex<VecDeque<Event>>,
    capacity: usize,
    notify: Notify,
    dropped: AtomicU64,
    last_drop_warning: Mutex<Option<Instant>>,
    file_path: Option<PathBuf>,
}

/// Handle to the running telemetry sink. Cheap to clone (an `Arc` underneath);
/// every clone shares the same buffer and drain task.
#[derive(Clone)]
pub struct TelemetryEmitter {
    inner: std::sync::Arc<Inner>,
}

impl TelemetryEmitter {
    /// Start a telemetry emitter with the default ring buffer capacity and spawn its
    /// background drain task. `file_path` is `TELEMETRY_PATH` from the environment, if
    /// configured.
    #[must_use]
    pub fn start(file_path: Option<PathBuf>) -> Self {
        Self::start_with_capacity(DEFAULT_CAPACITY, file_path)
    }

    /// As [`Self::start`], with an explicit ring buffer capacity (mainly for tests).
    #[must_use]
    pub fn start_with_capacity(capacity: usize, file_path: Option<PathBuf>) -> Self {
        let inner = std::sync::Arc::new(Inner {
            buffer: Mutex::new(VecDeque::with_capacity(capacity.min(256))),
            capacity,
            notify: Notify::new(),
            dropped: AtomicU64::new(0),
            last_drop_warning: Mutex::new(None),
            file_path,
        });
        tokio::spawn(drain_loop(inner.clone()));
        Self { inner }
    }

    /// Queue an event for emission. Never blocks on I/O; if the ring buffer is full,
    /// the oldest queued event is dropped and the drop counter incremented (§5).
    pub fn emit(&self, event: Event) {
        let dropped_now = {
            let mut buf = self
                .inner
                .buffer
                .lock()
                .expect("telemetry buffer mutex is never held across a panic");
            let dropped_now = if buf.len() >= self.inner.capacity {
                buf.pop_front();
                Some(self.inner.dropped.fetch_add(1, Ordering::Relaxed) + 1)
            } else {
                None
            };
            buf.push_back(event);
            dropped_now
        };
        if let Some(total) = dropped_now {
            self.maybe_warn_dropped(total);
        }
        self.inner.notify.notify_one();
    }

    fn maybe_warn_dropped(&self, total_dropped: u64) {
        let mut last = self
            .inner
            .last_drop_warning
            .lock()
            .expect("drop-warning mutex is never held across a panic");
        let now = Instant::now();
        let should_warn = match *last {
            Some(prev) => now.duration_since(prev) >= DROP_WARNING_INTERVAL,
            None => true,
        };
        if should_warn {
            *last = Some(now);
            tracing::warn!(total_dropped, "telemetry ring buffer overflowed, dropping oldest events");
        }
    }

    /// Total number of events dropped for overflow since startup, for diagnostics.
    #[must_use]
    pub fn dropped_count(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }
}

async fn drain_loop(inner: std::sync::Arc<Inner>) {
    use tokio::io::AsyncWriteExt;

    let mut file = match &inner.file_path {
        Some(path) => match tokio::fs::OpenOptions::new().create(true).append(true).open(path).await {
            Ok(f) => Some(f),
            Err(err) => {
                tracing::warn!(?err, path = %path.display(), "failed to open TELEMETRY_PATH, file sink disabled");
                None
            }
        },
        None => None,
    };

    loop {
        let notified = inner.notify.notified();
        let next = {
            let mut buf = inner.buffer.lock().expect("telemetry buffer mutex is never held across a panic");
            buf.pop_front()
        };
        let Some(event) = next else {
            notified.await;
            continue;
        };

        let line = match serde_json::to_string(&event) {
            Ok(line) => line,
            Err(err) => {
                tracing::warn!(?err, "failed to serialize telemetry event");
                continue;
            }
        };

        tracing::debug!(target: "relay_telemetry", "{line}");
        eprintln!("{line}");

        if let Some(f) = file.as_mut() {
            if let Err(err) = f.write_all(line.as_bytes()).await {
                tracing::warn!(?err, "failed to write telemetry event to TELEMETRY_PATH");
            } else if let Err(err) = f.write_all(b"\n").await {
                tracing::warn!(?err, "failed to write telemetry event to TELEMETRY_PATH");
            }
        }
    }
}
