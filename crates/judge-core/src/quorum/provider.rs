//! Judge providers: anything that can turn `(evidence, slo)` into a verdict.

use async_trait::async_trait;

use crate::auth::AuthError;
use crate::domain::{Evidence, SloSpec, Verdict};
use crate::evaluator::evaluate;

/// Why a provider could not produce a verdict.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProviderError {
    #[error("transport: {0}")]
    Transport(String),

    #[error("http {status}")]
    Status { status: u16 },

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("circuit open")]
    CircuitOpen,

    #[error("signing failed: {0}")]
    Signing(#[from] AuthError),
}

/// One independent judge in a quorum.
#[async_trait]
pub trait JudgeProvider: Send + Sync {
    /// Stable identifier reported in votes.
    fn id(&self) -> &str;

    async fn evaluate(&self, evidence: &Evidence, slo: &SloSpec) -> Result<Verdict, ProviderError>;
}

/// In-process judge backed by the SLO evaluator.
#[derive(Debug, Clone)]
pub struct LocalJudge {
    id: String,
}

impl LocalJudge {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }
}

impl Default for LocalJudge {
    fn default() -> Self {
        Self::new("local")
    }
}

#[async_trait]
impl JudgeProvider for LocalJudge {
    fn id(&self) -> &str {
        &self.id
    }

    async fn evaluate(&self, evidence: &Evidence, slo: &SloSpec) -> Result<Verdict, ProviderError> {
        Ok(evaluate(evidence, slo).with_version(crate::VERSION))
    }
}
