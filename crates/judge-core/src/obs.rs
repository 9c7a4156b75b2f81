//! Structured observability hooks for the judge request lifecycle.
//!
//! This module provides:
//! - Request-scoped tracing spans via the `JudgeSpan` RAII guard
//! - Emission functions for decisions, rejections, quorum outcomes and key rotation
//!
//! Events are emitted at `info!` (or `warn!` for rejections and degradation).
//! For JSON output, set `JUDGE_LOG_FORMAT=json`.

use tracing::{info, warn};

/// RAII guard that enters a request-scoped span for the duration of a judgment.
///
/// # Example
///
/// ```ignore
/// let _span = JudgeSpan::enter("3f0c...");
/// // every event until the guard drops carries request_id = "3f0c..."
/// ```
pub struct JudgeSpan {
    _span: tracing::span::EnteredSpan,
}

impl JudgeSpan {
    /// Create and enter a span tagged with the request id.
    pub fn enter(request_id: &str) -> Self {
        Self {
            _span: request_span(request_id).entered(),
        }
    }
}

/// The request span itself, for `Instrument`-ing futures that cross `.await`.
pub fn request_span(request_id: &str) -> tracing::Span {
    tracing::info_span!("judge.request", request_id = %request_id)
}

/// Emit event: a judgment finished with a decision.
pub fn emit_judge_decided(key_id: &str, passed: bool, reason_count: usize, latency_ms: f64) {
    info!(
        event = "judge.decided",
        key_id = %key_id,
        passed = passed,
        reason_count = reason_count,
        latency_ms = latency_ms,
    );
}

/// Emit event: authentication rejected the request.
pub fn emit_auth_rejected(code: &str, key_id: Option<&str>) {
    warn!(event = "auth.rejected", code = %code, key_id = %key_id.unwrap_or("-"));
}

/// Emit event: the replay guard rejected a `(key_id, nonce)` pair.
pub fn emit_replay_rejected(key_id: &str, kind: &str) {
    warn!(event = "replay.rejected", key_id = %key_id, kind = %kind);
}

/// Emit event: quorum combined n votes into a final decision.
pub fn emit_quorum_decided(k: usize, n: usize, pass_count: usize, passed: bool, degraded: bool) {
    info!(
        event = "quorum.decided",
        k = k,
        n = n,
        pass_count = pass_count,
        passed = passed,
        degraded = degraded,
    );
}

/// Emit event: a refresh swapped in a new key set.
pub fn emit_keys_rotated(keys: usize, grace_keys: usize) {
    info!(event = "keys.rotated", keys = keys, grace_keys = grace_keys);
}

/// Emit event: no key source produced a usable key set.
pub fn emit_keys_degraded(reason: &str) {
    warn!(event = "keys.degraded", reason = %reason);
}
