//! Judge orchestrator: one signed request in, one decision out.
//!
//! `received -> parsed -> headers-extracted -> signature-verified ->
//! nonce-bound -> clock-checked -> replay-checked -> authorized -> payload-validated ->
//! evaluated -> responded`, terminal on the first failure. Whatever the exit
//! path, [`JudgeService::judge`] records exactly one observation in the
//! sliding window.

use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, Instrument};

use crate::auth::{AuthError, SignedHeaders};
use crate::authz::{AllowAll, Authorizer};
use crate::clock::{iso_seconds, within_skew, Clock};
use crate::domain::{Decision, Evidence, SloSpec, ValidationError};
use crate::keys::KeyStore;
use crate::metrics::{Counters, SlidingWindow};
use crate::obs;
use crate::quorum::{JudgeProvider, LocalJudge, ProviderError};
use crate::replay::{ReplayError, ReplayGuard};

/// Default tolerated difference between the caller's timestamp and ours.
pub const DEFAULT_CLOCK_SKEW_SEC: f64 = 90.0;

/// Successful judgment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JudgeResponse {
    pub decision: Decision,
    pub reasons: Vec<String>,
    /// ISO-8601 UTC, second precision.
    pub ts: String,
}

/// Every way a request can be refused.
#[derive(Debug, thiserror::Error)]
pub enum JudgeError {
    #[error("invalid json: {0}")]
    InvalidJson(#[source] serde_json::Error),

    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error("timestamp outside allowed clock skew")]
    ClockSkew,

    #[error(transparent)]
    Replay(#[from] ReplayError),

    #[error("key {key_id} not authorized")]
    Forbidden { key_id: String },

    #[error("invalid payload: {0}")]
    InvalidPayload(#[from] ValidationError),

    #[error("judge provider failed: {0}")]
    Provider(#[from] ProviderError),
}

impl JudgeError {
    /// Transport status for this error. The only place codes are mapped.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::InvalidJson(_) | Self::InvalidPayload(_) => 400,
            Self::Auth(e) => e.status_code(),
            Self::ClockSkew | Self::Replay(_) => 401,
            Self::Forbidden { .. } => 403,
            Self::Provider(_) => 502,
        }
    }

    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidJson(_) => "invalid_json",
            Self::Auth(e) => e.code(),
            Self::ClockSkew => "clock_skew",
            Self::Replay(e) => e.code(),
            Self::Forbidden { .. } => "forbidden",
            Self::InvalidPayload(_) => "invalid_payload",
            Self::Provider(_) => "judge_unavailable",
        }
    }

    /// Generic, non-disclosing message for the response body.
    pub fn detail(&self) -> &'static str {
        match self {
            Self::InvalidJson(_) => "invalid json",
            Self::Auth(AuthError::MissingSignatureHeaders) => "missing signature headers",
            Self::Auth(AuthError::InvalidTimestamp) => "invalid timestamp header",
            Self::Auth(AuthError::KeysUnavailable) => "signing keys unavailable",
            Self::Auth(_) => "invalid signature",
            Self::ClockSkew => "timestamp skew exceeded",
            Self::Replay(_) => "replay detected",
            Self::Forbidden { .. } => "authorization denied",
            Self::InvalidPayload(_) => "invalid payload structure",
            Self::Provider(_) => "judge unavailable",
        }
    }

    /// Counted as a signature error in the sliding window.
    pub fn is_signature_failure(&self) -> bool {
        matches!(
            self,
            Self::Auth(AuthError::UnknownKey | AuthError::SignatureMismatch | AuthError::KeyRetired)
                | Self::ClockSkew
                | Self::Replay(_)
        )
    }

    /// `{"error": <code>, "detail": <message>}`.
    pub fn body(&self) -> Value {
        json!({ "error": self.code(), "detail": self.detail() })
    }
}

/// Wires keys, replay guard, authorizer, evaluator and metrics together.
#[derive(Clone)]
pub struct JudgeService {
    keys: Arc<KeyStore>,
    replay: Arc<ReplayGuard>,
    window: Arc<SlidingWindow>,
    counters: Arc<Counters>,
    authorizer: Arc<dyn Authorizer>,
    judge: Arc<dyn JudgeProvider>,
    clock: Arc<dyn Clock>,
    clock_skew_sec: f64,
    require_signed_nonce: bool,
}

impl std::fmt::Debug for JudgeService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JudgeService")
            .field("replay", &self.replay)
            .field("judge", &self.judge.id())
            .field("authorizer", &self.authorizer)
            .field("clock_skew_sec", &self.clock_skew_sec)
            .field("require_signed_nonce", &self.require_signed_nonce)
            .finish_non_exhaustive()
    }
}

impl JudgeService {
    /// Service with a local evaluator, no authorization rules and a 300 s window.
    pub fn new(
        keys: Arc<KeyStore>,
        replay: Arc<ReplayGuard>,
        counters: Arc<Counters>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            keys,
            replay,
            window: Arc::new(SlidingWindow::new(300, Arc::clone(&clock))),
            counters,
            authorizer: Arc::new(AllowAll),
            judge: Arc::new(LocalJudge::default()),
            clock,
            clock_skew_sec: DEFAULT_CLOCK_SKEW_SEC,
            require_signed_nonce: false,
        }
    }

    pub fn with_window(mut self, window: Arc<SlidingWindow>) -> Self {
        self.window = window;
        self
    }

    pub fn with_authorizer(mut self, authorizer: Arc<dyn Authorizer>) -> Self {
        self.authorizer = authorizer;
        self
    }

    pub fn with_judge(mut self, judge: Arc<dyn JudgeProvider>) -> Self {
        self.judge = judge;
        self
    }

    pub fn with_clock_skew(mut self, clock_skew_sec: f64) -> Self {
        self.clock_skew_sec = clock_skew_sec;
        self
    }

    /// Refuse bodies that do not carry the header nonce inside the signed JSON.
    pub fn with_signed_nonce_required(mut self, required: bool) -> Self {
        self.require_signed_nonce = required;
        self
    }

    pub fn keys(&self) -> &Arc<KeyStore> {
        &self.keys
    }

    pub fn replay(&self) -> &Arc<ReplayGuard> {
        &self.replay
    }

    pub fn window(&self) -> &Arc<SlidingWindow> {
        &self.window
    }

    pub fn counters(&self) -> &Arc<Counters> {
        &self.counters
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Judge one request.
    ///
    /// `header` looks a header up by lowercase name.
    pub async fn judge<'h, F>(&self, header: F, body: &[u8]) -> Result<JudgeResponse, JudgeError>
    where
        F: Fn(&str) -> Option<&'h str>,
    {
        let started = Instant::now();
        self.counters.inc_requests();

        let request_id = uuid::Uuid::new_v4().to_string();
        let headers = SignedHeaders::extract(header);
        let outcome = self
            .run(headers, body)
            .instrument(obs::request_span(&request_id))
            .await;

        let latency_ms = started.elapsed().as_secs_f64() * 1000.0;
        match &outcome {
            Ok(resp) => {
                self.window.observe(latency_ms, 200, false);
                self.counters.inc_decision(resp.decision.is_pass());
            }
            Err(e) => {
                self.window
                    .observe(latency_ms, e.status_code(), e.is_signature_failure());
                self.count_rejection(e);
            }
        }
        outcome
    }

    async fn run(
        &self,
        headers: Result<SignedHeaders, AuthError>,
        body: &[u8],
    ) -> Result<JudgeResponse, JudgeError> {
        let started = Instant::now();
        let payload: Value = serde_json::from_slice(body).map_err(JudgeError::InvalidJson)?;

        let headers = headers.inspect_err(|e| obs::emit_auth_rejected(e.code(), None))?;

        self.keys
            .verify(&payload, &headers.signature, &headers.key_id)
            .inspect_err(|e| obs::emit_auth_rejected(e.code(), Some(&headers.key_id)))?;
        headers
            .check_body_binding(&payload, self.require_signed_nonce)
            .inspect_err(|e| obs::emit_auth_rejected(e.code(), Some(&headers.key_id)))?;

        if !within_skew(self.clock.epoch_secs(), headers.timestamp, self.clock_skew_sec) {
            obs::emit_auth_rejected("clock_skew", Some(&headers.key_id));
            return Err(JudgeError::ClockSkew);
        }

        self.replay
            .check(&headers.key_id, &headers.nonce, headers.epoch())
            .await
            .inspect_err(|e| obs::emit_replay_rejected(&headers.key_id, e.kind()))?;

        if !self.authorizer.authorize(&headers.key_id) {
            debug!(key_id = %headers.key_id, "authorizer denied key");
            return Err(JudgeError::Forbidden {
                key_id: headers.key_id,
            });
        }

        let (evidence, slo) = split_payload(payload)?;
        let verdict = self.judge.evaluate(&evidence, &slo).await?;

        obs::emit_judge_decided(
            &headers.key_id,
            verdict.passed(),
            verdict.reasons.len(),
            started.elapsed().as_secs_f64() * 1000.0,
        );
        Ok(JudgeResponse {
            decision: verdict.decision,
            reasons: verdict.reasons,
            ts: iso_seconds(self.clock.now()),
        })
    }

    /// Record a request the transport refused before it could be judged,
    /// such as an oversized body. Counts as one invalid rejection.
    pub fn record_transport_rejection(&self, started: Instant, status_code: u16) {
        self.counters.inc_requests();
        self.window
            .observe(started.elapsed().as_secs_f64() * 1000.0, status_code, false);
        self.counters.inc_rejected_invalid();
    }

    fn count_rejection(&self, err: &JudgeError) {
        match err {
            JudgeError::InvalidJson(_)
            | JudgeError::InvalidPayload(_)
            | JudgeError::Auth(AuthError::MissingSignatureHeaders | AuthError::InvalidTimestamp) => {
                self.counters.inc_rejected_invalid()
            }
            JudgeError::Auth(_) | JudgeError::ClockSkew => self.counters.inc_rejected_auth(),
            JudgeError::Replay(_) => self.counters.inc_rejected_replay(),
            JudgeError::Forbidden { .. } => self.counters.inc_rejected_authz(),
            JudgeError::Provider(_) => {}
        }
    }
}

/// Split a request body into Evidence and SLO.
pub fn split_payload(payload: Value) -> Result<(Evidence, SloSpec), ValidationError> {
    let Value::Object(mut body) = payload else {
        return Err(ValidationError::NotAnObject { what: "request body" });
    };
    let evidence = body
        .remove("evidence")
        .ok_or(ValidationError::MissingField { field: "evidence" })?;
    let slo = body
        .remove("slo")
        .ok_or(ValidationError::MissingField { field: "slo" })?;
    Ok((Evidence::from_value(evidence)?, SloSpec::from_value(slo)?))
}
