//! k-of-n quorum over independent judges.
//!
//! Every provider is asked concurrently, each on its own task under a
//! deadline. A provider that errors, times out or panics casts an explicit
//! `fail` vote and marks the result degraded; the quorum itself never aborts
//! because of a provider. This is a plurality gate, not Byzantine consensus.

pub mod http;
pub mod plurality;
pub mod provider;

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::warn;

use crate::domain::{Decision, Evidence, SloSpec, Verdict};
use crate::obs;

pub use http::{CircuitBreaker, HttpJudge, HttpJudgeConfig};
pub use plurality::{plurality, PluralityOutcome};
pub use provider::{JudgeProvider, LocalJudge, ProviderError};

/// Configuration errors; never a quorum outcome.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QuorumError {
    #[error("invalid quorum: k={k}, n={n} (need 0 < k <= n)")]
    InvalidQuorum { k: usize, n: usize },

    #[error("quorum n={n} but {providers} providers supplied")]
    ProviderCountMismatch { n: usize, providers: usize },
}

#[derive(Debug, Clone)]
pub struct QuorumOptions {
    pub provider_timeout: Duration,
    /// Force `fail` whenever any provider failed to answer. On by default.
    pub fail_closed_on_degrade: bool,
}

impl Default for QuorumOptions {
    fn default() -> Self {
        Self {
            provider_timeout: Duration::from_secs(5),
            fail_closed_on_degrade: true,
        }
    }
}

impl QuorumOptions {
    /// Options taking `fail_closed_on_degrade` from the SLO's quorum section.
    pub fn from_slo(slo: &SloSpec) -> Self {
        Self {
            fail_closed_on_degrade: slo.quorum.fail_closed_on_degrade,
            ..Self::default()
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.provider_timeout = timeout;
        self
    }
}

/// One provider's vote.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Vote {
    pub idx: usize,
    pub id: String,
    pub decision: Decision,
    pub reasons: Vec<String>,
    /// Version the provider reported, if any.
    pub version: Option<String>,
    pub meta: VoteMeta,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoteMeta {
    /// Wall time from dispatch to answer, rounded to 0.01 ms.
    pub latency_ms: f64,
    /// Failure class when the provider produced no verdict.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

fn round_ms(elapsed: Duration) -> f64 {
    (elapsed.as_secs_f64() * 100_000.0).round() / 100.0
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuorumResult {
    pub k: usize,
    pub n: usize,
    pub pass_count: usize,
    #[serde(rename = "final")]
    pub final_decision: Decision,
    /// At least one provider failed to produce a verdict.
    pub degraded: bool,
    pub votes: Vec<Vote>,
}

impl QuorumResult {
    pub fn passed(&self) -> bool {
        self.final_decision.is_pass()
    }
}

/// Ask `providers` concurrently and require `k` passes out of `n`.
pub async fn decide(
    providers: &[Arc<dyn JudgeProvider>],
    evidence: &Evidence,
    slo: &SloSpec,
    k: usize,
    n: usize,
    options: &QuorumOptions,
) -> Result<QuorumResult, QuorumError> {
    if k == 0 || k > n {
        return Err(QuorumError::InvalidQuorum { k, n });
    }
    if providers.len() != n {
        return Err(QuorumError::ProviderCountMismatch {
            n,
            providers: providers.len(),
        });
    }

    let evidence = Arc::new(evidence.clone());
    let slo = Arc::new(slo.clone());
    let deadline = options.provider_timeout;
    let dispatched = Instant::now();

    let handles: Vec<_> = providers
        .iter()
        .map(|provider| {
            let provider = Arc::clone(provider);
            let evidence = Arc::clone(&evidence);
            let slo = Arc::clone(&slo);
            tokio::spawn(async move {
                let started = Instant::now();
                let outcome =
                    tokio::time::timeout(deadline, provider.evaluate(&evidence, &slo)).await;
                (outcome, started.elapsed())
            })
        })
        .collect();
    let outcomes = futures::future::join_all(handles).await;

    let mut votes = Vec::with_capacity(n);
    let mut degraded = false;
    for (idx, (provider, outcome)) in providers.iter().zip(outcomes).enumerate() {
        let id = provider.id().to_string();
        let (verdict, error, latency) = match outcome {
            Ok((Ok(Ok(verdict)), latency)) => (verdict, None, latency),
            Ok((Ok(Err(e)), latency)) => {
                degraded = true;
                warn!(provider = %id, error = %e, "judge provider failed");
                (Verdict::fail(format!("provider.error:{e}")), Some("provider_error"), latency)
            }
            Ok((Err(_elapsed), latency)) => {
                degraded = true;
                warn!(provider = %id, timeout_ms = deadline.as_millis() as u64, "judge provider timed out");
                (Verdict::fail("provider.timeout"), Some("timeout"), latency)
            }
            Err(join_err) => {
                degraded = true;
                warn!(provider = %id, error = %join_err, "judge provider panicked");
                (Verdict::fail("provider.panicked"), Some("panic"), dispatched.elapsed())
            }
        };
        votes.push(Vote {
            idx,
            id,
            decision: verdict.decision,
            reasons: verdict.reasons,
            version: verdict.version,
            meta: VoteMeta {
                latency_ms: round_ms(latency),
                error: error.map(str::to_string),
            },
        });
    }

    let pass_count = votes.iter().filter(|v| v.decision.is_pass()).count();
    let mut final_decision = if pass_count >= k {
        Decision::Pass
    } else {
        Decision::Fail
    };
    if degraded && options.fail_closed_on_degrade {
        final_decision = Decision::Fail;
    }

    obs::emit_quorum_decided(k, n, pass_count, final_decision.is_pass(), degraded);
    Ok(QuorumResult {
        k,
        n,
        pass_count,
        final_decision,
        degraded,
        votes,
    })
}
