#![deny(missing_docs)]
//! Bearer-credential admission check for the relay broker (§4.4).
//!
//! stdio clients carry no credential and are always admitted; WebSocket clients must
//! present a bearer that matches `WS_AUTH_TOKEN` exactly. The comparison is
//! constant-time so that a wrong-length or wrong-content guess cannot be distinguished
//! by response latency — the same property `neuron-auth-static`'s fixed-token provider
//! assumes is irrelevant for, but which is load-bearing here since this check sits on
//! an operator-facing network port rather than a trusted local provider credential.

use relay_types::BrokerError;

/// Verify a client-supplied bearer credential against the configured token.
///
/// - If `expected` is `None` (no `WS_AUTH_TOKEN` configured), every credential is
///   accepted — matching stdio's "credential ignored" rule, and letting an operator
///   run the WebSocket frontend unauthenticated in trusted local setups.
/// - If `expected` is `Some`, `provided` must be `Some` and match exactly.
///
/// Returns [`BrokerError::AuthError`] on mismatch, never leaking which side of the
/// comparison (missing vs. wrong) failed.
pub fn verify_bearer(provided: Option<&str>, expected: Option<&str>) -> Result<(), BrokerError> {
    match expected {
        None => Ok(()),
        Some(expected) => match provided {
            Some(provided) if constant_time_eq(provided.as_bytes(), expected.as_bytes()) => Ok(()),
            _ => Err(BrokerError::AuthError),
        },
    }
}

/// Byte-wise constant-time equality check.
///
/// Accumulates an XOR of every byte pair (and of the length difference) rather than
/// short-circuiting on the first mismatch, so runtime does not depend on where two
/// strings first diverge. No dependency on `subtle` is pulled in for this — nothing
/// else in the workspace uses it, and the check is small enough to hand-roll.
#[must_use]
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    let len_diff = (a.len() ^ b.len()) as u8;
    let mut diff: u8 = len_diff;
    for i in 0..a.len().max(b.len()) {
        let x = a.get(i).copied().unwrap_or(0);
        let y = b.get(i).copied().unwrap_or(0);
        diff |= x ^ y;
    }
    diff == 0
}
