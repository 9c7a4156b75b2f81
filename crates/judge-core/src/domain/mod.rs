//! Domain models for the judge.
//!
//! - `Evidence`: observed operational state submitted for judgment
//! - `SloSpec`: thresholds the evidence is judged against
//! - `Verdict`: pass/fail plus reason codes

pub mod error;
pub mod evidence;
pub mod slo;
pub mod verdict;

pub use error::ValidationError;
pub use evidence::{Evidence, OPTIONAL_BLOCKS, REQUIRED_BLOCKS};
pub use slo::{
    AnomalySpec, BudgetSpec, CanarySpec, CanaryThresholds, DriftSpec, ErrorSpec,
    InfraAvailabilitySpec, InfraSignatureSpec, IntegritySpec, JudgeInfraSpec, LatencySpec,
    QuorumSpec, QuotaSpec, SaturationSpec, SloSpec, WitnessSpec, DEFAULT_DRIFT_SOURCE,
};
pub use verdict::{Decision, Verdict};
