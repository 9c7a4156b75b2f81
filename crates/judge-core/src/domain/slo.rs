//! SLO specification (v1).
//!
//! Every field has a default so a partial document is valid; unknown fields
//! anywhere are rejected. Parse with [`SloSpec::from_value`], which also runs
//! the range checks serde cannot express.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::domain::error::ValidationError;

/// Default location of the posterior-drift artifact.
pub const DEFAULT_DRIFT_SOURCE: &str = "var/alerts/posterior_drift.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BudgetSpec {
    pub allow_levels: Vec<String>,
    pub max_spent: Option<f64>,
}

impl Default for BudgetSpec {
    fn default() -> Self {
        Self {
            allow_levels: vec!["ok".to_string(), "warn".to_string()],
            max_spent: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct QuotaSpec {
    /// metric name -> quota actions that fail the judgment
    pub forbid_actions: BTreeMap<String, Vec<String>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AnomalySpec {
    pub allow_spike: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WitnessSpec {
    pub require_csv_sha256: bool,
    /// Accepted for compatibility; the integrity section governs signatures.
    pub require_signature: bool,
    pub min_rows: u64,
}

impl Default for WitnessSpec {
    fn default() -> Self {
        Self {
            require_csv_sha256: true,
            require_signature: true,
            min_rows: 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct IntegritySpec {
    pub require_signature: bool,
}

impl Default for IntegritySpec {
    fn default() -> Self {
        Self {
            require_signature: true,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LatencySpec {
    pub max_p95_ms: Option<f64>,
    pub max_p99_ms: Option<f64>,
    pub min_samples: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ErrorSpec {
    pub max_error_rate: Option<f64>,
    pub min_samples: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct QuorumSpec {
    pub k: u64,
    pub n: u64,
    pub fail_closed_on_degrade: bool,
}

impl Default for QuorumSpec {
    fn default() -> Self {
        Self {
            k: 2,
            n: 3,
            fail_closed_on_degrade: true,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct InfraAvailabilitySpec {
    pub min_availability: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct InfraSignatureSpec {
    pub max_sig_error_rate: Option<f64>,
    pub min_samples: Option<u64>,
}

/// Thresholds on the judge's own serving health (`perf_judge` evidence).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct JudgeInfraSpec {
    pub latency: Option<LatencySpec>,
    pub availability: Option<InfraAvailabilitySpec>,
    pub sig: Option<InfraSignatureSpec>,
    pub window_sec: u64,
    /// Ceilings are multiplied by `1 + grace_burst`; floors are not.
    pub grace_burst: f64,
}

impl Default for JudgeInfraSpec {
    fn default() -> Self {
        Self {
            latency: None,
            availability: None,
            sig: None,
            window_sec: 300,
            grace_burst: 0.0,
        }
    }
}

impl JudgeInfraSpec {
    /// True when at least one threshold or sample floor is configured.
    pub fn has_thresholds(&self) -> bool {
        let latency = self.latency.as_ref().is_some_and(|l| {
            l.max_p95_ms.is_some() || l.max_p99_ms.is_some() || l.min_samples.is_some()
        });
        let availability = self
            .availability
            .as_ref()
            .is_some_and(|a| a.min_availability.is_some());
        let sig = self
            .sig
            .as_ref()
            .is_some_and(|s| s.max_sig_error_rate.is_some() || s.min_samples.is_some());
        latency || availability || sig
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CanaryThresholds {
    pub max_p95_rel_increase: f64,
    pub max_error_abs_delta: f64,
    pub max_sig_error_delta: f64,
}

impl Default for CanaryThresholds {
    fn default() -> Self {
        Self {
            max_p95_rel_increase: 0.15,
            max_error_abs_delta: 0.01,
            max_sig_error_delta: 0.0005,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CanarySpec {
    pub thresholds: CanaryThresholds,
    pub min_sample_count: u64,
    pub guardband_minutes: u64,
}

impl Default for CanarySpec {
    fn default() -> Self {
        Self {
            thresholds: CanaryThresholds::default(),
            min_sample_count: 1000,
            guardband_minutes: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DriftSpec {
    /// Path of the drift artifact (JSON object with `severity`, `abs_diff`, `kl`).
    pub source: String,
    pub max_abs_diff: f64,
    pub max_kl: f64,
    pub forbid_severity: Vec<String>,
}

impl Default for DriftSpec {
    fn default() -> Self {
        Self {
            source: DEFAULT_DRIFT_SOURCE.to_string(),
            max_abs_diff: 0.15,
            max_kl: 1.0,
            forbid_severity: vec!["critical".to_string()],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SaturationSpec {
    pub max_cpu_percent: Option<f64>,
    pub max_mem_percent: Option<f64>,
    pub max_qps: Option<f64>,
    /// A configured ceiling with no matching usage field fails the judgment.
    pub fail_closed: bool,
}

impl Default for SaturationSpec {
    fn default() -> Self {
        Self {
            max_cpu_percent: Some(90.0),
            max_mem_percent: Some(85.0),
            max_qps: None,
            fail_closed: true,
        }
    }
}

/// Full SLO specification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SloSpec {
    pub version: String,
    pub budget: BudgetSpec,
    pub quota: QuotaSpec,
    pub anomaly: AnomalySpec,
    pub witness: WitnessSpec,
    pub integrity: IntegritySpec,
    pub latency: LatencySpec,
    pub error: ErrorSpec,
    pub quorum: QuorumSpec,
    pub judge_infra: Option<JudgeInfraSpec>,
    pub canary: Option<CanarySpec>,
    pub drift: Option<DriftSpec>,
    pub saturation: Option<SaturationSpec>,
}

impl Default for SloSpec {
    fn default() -> Self {
        Self {
            version: "v1".to_string(),
            budget: BudgetSpec::default(),
            quota: QuotaSpec::default(),
            anomaly: AnomalySpec::default(),
            witness: WitnessSpec::default(),
            integrity: IntegritySpec::default(),
            latency: LatencySpec::default(),
            error: ErrorSpec::default(),
            quorum: QuorumSpec::default(),
            judge_infra: None,
            canary: None,
            drift: None,
            saturation: None,
        }
    }
}

impl SloSpec {
    /// Parse and validate an SLO document.
    pub fn from_value(value: Value) -> Result<Self, ValidationError> {
        if !value.is_object() {
            return Err(ValidationError::NotAnObject { what: "slo" });
        }
        let spec: SloSpec =
            serde_json::from_value(value).map_err(|e| ValidationError::malformed("slo", e))?;
        spec.validate()?;
        Ok(spec)
    }

    /// Range checks: thresholds and rates non-negative, sane quorum.
    pub fn validate(&self) -> Result<(), ValidationError> {
        let mut thresholds: Vec<(&str, Option<f64>)> = vec![
            ("budget.max_spent", self.budget.max_spent),
            ("latency.max_p95_ms", self.latency.max_p95_ms),
            ("latency.max_p99_ms", self.latency.max_p99_ms),
            ("error.max_error_rate", self.error.max_error_rate),
        ];

        if let Some(infra) = &self.judge_infra {
            thresholds.push(("judge_infra.grace_burst", Some(infra.grace_burst)));
            if let Some(l) = &infra.latency {
                thresholds.push(("judge_infra.latency.max_p95_ms", l.max_p95_ms));
                thresholds.push(("judge_infra.latency.max_p99_ms", l.max_p99_ms));
            }
            if let Some(a) = &infra.availability {
                thresholds.push(("judge_infra.availability.min_availability", a.min_availability));
            }
            if let Some(s) = &infra.sig {
                thresholds.push(("judge_infra.sig.max_sig_error_rate", s.max_sig_error_rate));
            }
        }
        if let Some(c) = &self.canary {
            let t = &c.thresholds;
            thresholds.push(("canary.thresholds.max_p95_rel_increase", Some(t.max_p95_rel_increase)));
            thresholds.push(("canary.thresholds.max_error_abs_delta", Some(t.max_error_abs_delta)));
            thresholds.push(("canary.thresholds.max_sig_error_delta", Some(t.max_sig_error_delta)));
        }
        if let Some(d) = &self.drift {
            thresholds.push(("drift.max_abs_diff", Some(d.max_abs_diff)));
            thresholds.push(("drift.max_kl", Some(d.max_kl)));
        }
        if let Some(s) = &self.saturation {
            thresholds.push(("saturation.max_cpu_percent", s.max_cpu_percent));
            thresholds.push(("saturation.max_mem_percent", s.max_mem_percent));
            thresholds.push(("saturation.max_qps", s.max_qps));
        }

        for (field, value) in thresholds {
            if let Some(v) = value {
                if v < 0.0 || v.is_nan() {
                    return Err(ValidationError::Negative {
                        field: field.to_string(),
                        value: v,
                    });
                }
            }
        }

        let q = &self.quorum;
        if q.k == 0 || q.k > q.n {
            return Err(ValidationError::InvalidQuorum { k: q.k, n: q.n });
        }
        Ok(())
    }

    /// Whether the latency/error section needs `perf` evidence.
    pub fn requires_perf(&self) -> bool {
        self.latency.max_p95_ms.is_some()
            || self.latency.max_p99_ms.is_some()
            || self.error.max_error_rate.is_some()
    }
}
