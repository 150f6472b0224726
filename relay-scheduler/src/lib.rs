#![deny(missing_docs)]
//! Call Scheduler for the relay broker (§4.5) — the heart of the system.
//!
//! Owns three kinds of semaphore (global, per-provider, and — by reference — each
//! [`relay_session::Session`]'s own) and the coalescing map keyed by fingerprint.
//! Grounded on the `DashMap` + `Notify` leader/follower shape of the workspace's own
//! idempotency plugin pattern and on the `canonicalize`+`CancellationToken`+
//! `tokio::select!` cancellation-aware wait used by its parallel-tool-call pattern; see
//! `DESIGN.md` for exact sources.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use dashmap::mapref::entry::Entry as DashEntry;
use dashmap::DashMap;
use relay_session::Session;
use relay_types::{BrokerError, CallOutcome, RequestId};
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;

/// Per-fingerprint coalescing record (§3's `InflightEntry`), shared between the
/// leader's [`LeaderGuard`] and every [`FollowerWait`] registered against it.
struct LeaderEntry {
    leader_request_id: RequestId,
    notify: Notify,
    result: Mutex<Option<CallOutcome>>,
    followers: AtomicUsize,
}

/// What admission produced for a Call: it either became the leader (and must run the
/// tool itself) or a follower of an already-running identical call.
pub enum Admission {
    /// This Call acquired semaphores and owns the `InflightEntry`; it must execute the
    /// tool and call [`Scheduler::complete`] when done.
    Leader(LeaderGuard),
    /// This Call is riding an already-in-flight identical call. `request_id` is the
    /// leader's, for the `tool_coalesced` telemetry event's `leader_request_id` field.
    Follower {
        /// A future that resolves to the leader's terminal outcome.
        wait: FollowerWait,
        /// The leader's request id.
        leader_request_id: RequestId,
    },
}

/// Holds the session, provider, and global semaphore permits acquired for a leader
/// Call, in the exact field order that makes Rust's drop-in-declaration-order RAII
/// release them `global -> provider -> session` (§4.5 step 5) with no manual release
/// code — and therefore no way to hit the spec's `SemaphoreCorruption` failure mode
/// (release of an unheld semaphore), since there is nothing to release by hand.
pub struct LeaderGuard {
    fingerprint: String,
    _global_permit: OwnedSemaphorePermit,
    _provider_permit: Option<OwnedSemaphorePermit>,
    _session_permit: OwnedSemaphorePermit,
}

impl LeaderGuard {
    /// The fingerprint this leader is registered under (empty if coalescing was
    /// disabled for this call).
    #[must_use]
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }
}

/// A follower's handle on the leader's eventual result.
pub struct FollowerWait {
    entry: Arc<LeaderEntry>,
}

impl FollowerWait {
    /// Wait for the leader to reach a terminal state and return a copy of its
    /// outcome. Does not itself race against a deadline or cancellation token —
    /// callers compose this with `tokio::select!` against those, per §4.5's note that
    /// follower cancellation only removes the follower from the broadcast set.
    pub async fn wait(&self) -> CallOutcome {
        loop {
            // Create the `Notified` future before checking, so a `notify_waiters()`
            // racing in between is not missed (the standard safe-use pattern for
            // `tokio::sync::Notify`).
            let notified = self.entry.notify.notified();
            if let Some(outcome) = self.entry.result.lock().expect("result mutex poisoned").clone()
            {
                return outcome;
            }
            notified.await;
        }
    }
}

impl Drop for FollowerWait {
    fn drop(&mut self) {
        self.entry.followers.fetch_sub(1, Ordering::SeqCst);
    }
}

/// The session/provider/global semaphore tree plus the coalescing map.
pub struct Scheduler {
    global: Arc<Semaphore>,
    provider_capacity: usize,
    providers: DashMap<String, Arc<Semaphore>>,
    inflight: DashMap<String, Arc<LeaderEntry>>,
    coalesce_disabled: HashSet<String>,
}

impl Scheduler {
    /// Create a scheduler with the given capacities (§4.1's `GLOBAL_MAX_INFLIGHT` /
    /// `PROVIDER_MAX_INFLIGHT`) and the set of tool names exempt from coalescing
    /// (`COALESCE_DISABLED_TOOLS`).
    #[must_use]
    pub fn new(
        global_max_inflight: usize,
        provider_max_inflight: usize,
        coalesce_disabled_tools: HashSet<String>,
    ) -> Self {
        Self {
            global: Arc::new(Semaphore::new(global_max_inflight)),
            provider_capacity: provider_max_inflight,
            providers: DashMap::new(),
            inflight: DashMap::new(),
            coalesce_disabled: coalesce_disabled_tools,
        }
    }

    /// Compute a Call's coalescing fingerprint, honoring `COALESCE_DISABLED_TOOLS`
    /// (§4.5 step 1). An empty tool name or a disabled tool both yield an empty
    /// fingerprint, which disables coalescing for that call.
    #[must_use]
    pub fn compute_fingerprint(&self, tool: &str, args: &serde_json::Value) -> String {
        if tool.is_empty() || self.coalesce_disabled.contains(tool) {
            return String::new();
        }
        relay_types::fingerprint(tool, args)
    }

    /// Run the admission protocol for a Call (§4.5 steps 2-4).
    ///
    /// If `fingerprint` is non-empty and already has an in-flight leader, this Call
    /// becomes a follower without touching any semaphore. Otherwise it acquires
    /// `session -> provider -> global` semaphores in order, each bounded by
    /// `deadline`, releasing whatever it already holds (via RAII, in reverse order)
    /// the instant any acquisition times out.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::Timeout`] if a semaphore could not be acquired before
    /// `deadline`.
    pub async fn admit(
        &self,
        fingerprint: &str,
        request_id: &RequestId,
        provider: Option<&str>,
        session: &Session,
        deadline: Instant,
    ) -> Result<Admission, BrokerError> {
        if !fingerprint.is_empty() {
            if let Some(existing) = self.inflight.get(fingerprint) {
                return Ok(self.join_as_follower(existing.clone()));
            }
        }

        let session_permit = acquire_by(&session.semaphore, deadline).await?;
        let provider_permit = match provider {
            Some(name) => Some(acquire_by(&self.provider_semaphore(name), deadline).await?),
            None => None,
        };
        let global_permit = acquire_by(&self.global, deadline).await?;

        if !fingerprint.is_empty() {
            match self.inflight.entry(fingerprint.to_string()) {
                DashEntry::Occupied(occupied) => {
                    // Lost the race to become leader for this fingerprint; release the
                    // permits just acquired and join as a follower instead (§4.5's
                    // "the one that creates the InflightEntry first is leader").
                    let entry = occupied.get().clone();
                    drop(global_permit);
                    drop(provider_permit);
                    drop(session_permit);
                    return Ok(self.join_as_follower(entry));
                }
                DashEntry::Vacant(vacant) => {
                    vacant.insert(Arc::new(LeaderEntry {
                        leader_request_id: request_id.clone(),
                        notify: Notify::new(),
                        result: Mutex::new(None),
                        followers: AtomicUsize::new(0),
                    }));
                }
            }
        }

        Ok(Admission::Leader(LeaderGuard {
            fingerprint: fingerprint.to_string(),
            _global_permit: global_permit,
            _provider_permit: provider_permit,
            _session_permit: session_permit,
        }))
    }

    fn join_as_follower(&self, entry: Arc<LeaderEntry>) -> Admission {
        entry.followers.fetch_add(1, Ordering::SeqCst);
        let leader_request_id = entry.leader_request_id.clone();
        Admission::Follower {
            wait: FollowerWait { entry },
            leader_request_id,
        }
    }

    /// Record the leader's terminal outcome: broadcast it to every registered
    /// follower and remove the `InflightEntry` (§4.5 step 5, first half — semaphore
    /// release is the caller's [`LeaderGuard`] being dropped afterward).
    ///
    /// A no-op if `fingerprint` is empty (coalescing was disabled for this call).
    pub fn complete(&self, fingerprint: &str, outcome: CallOutcome) {
        if fingerprint.is_empty() {
            return;
        }
        if let Some((_, entry)) = self.inflight.remove(fingerprint) {
            *entry.result.lock().expect("result mutex poisoned") = Some(outcome);
            entry.notify.notify_waiters();
        }
    }

    fn provider_semaphore(&self, name: &str) -> Arc<Semaphore> {
        self.providers
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.provider_capacity)))
            .clone()
    }

    /// Current available permits on the global semaphore, for diagnostics/metrics.
    #[must_use]
    pub fn global_available_permits(&self) -> usize {
        self.global.available_permits()
    }
}

async fn acquire_by(
    semaphore: &Arc<Semaphore>,
    deadline: Instant,
) -> Result<OwnedSemaphorePermit, BrokerError> {
    match tokio::time::timeout_at(deadline, semaphore.clone().acquire_owned()).await {
        Ok(Ok(permit)) => Ok(permit),
        Ok(Err(_closed)) => Err(BrokerError::Internal),
        Err(_elapsed) => Err(BrokerError::Timeout),
    }
}
