//! SLO evaluator.
//!
//! Compares an [`Evidence`] document against an [`SloSpec`] and returns a
//! [`Verdict`] whose reasons are stable, dotted reason codes. Checks run in a
//! fixed order; only the required-block check stops evaluation early.
//!
//! Thresholds are exclusive upper bounds (`actual > threshold` fails) and
//! floors fail on `actual < floor`. Missing numeric evidence reads as `0`.
//!
//! The evaluator is pure apart from reading the drift artifact named by the
//! `drift` section.

use std::path::Path;

use serde_json::Value;
use tracing::debug;

use crate::domain::evidence::{lookup, number_at, number_or_zero};
use crate::domain::{
    CanarySpec, DriftSpec, Evidence, JudgeInfraSpec, SaturationSpec, SloSpec, Verdict,
};

/// Evaluate `evidence` against `slo`.
pub fn evaluate(evidence: &Evidence, slo: &SloSpec) -> Verdict {
    let mut reasons = Vec::new();

    let missing = evidence.missing_blocks();
    if !missing.is_empty() {
        reasons.extend(missing.iter().map(|b| format!("evidence.missing:{b}")));
        return Verdict::from_reasons(reasons);
    }

    check_integrity(evidence, slo, &mut reasons);
    check_witness(evidence, slo, &mut reasons);
    check_budget(evidence, slo, &mut reasons);
    check_quota(evidence, slo, &mut reasons);
    check_anomaly(evidence, slo, &mut reasons);
    check_perf(evidence, slo, &mut reasons);
    if let Some(infra) = &slo.judge_infra {
        check_judge_infra(evidence, infra, &mut reasons);
    }
    if let Some(canary) = &slo.canary {
        check_canary(evidence, canary, &mut reasons);
    }
    if let Some(drift) = &slo.drift {
        check_drift(drift, &mut reasons);
    }
    if let Some(saturation) = &slo.saturation {
        check_saturation(evidence, saturation, &mut reasons);
    }

    debug!(reasons = reasons.len(), "evidence evaluated");
    Verdict::from_reasons(reasons)
}

/// Shortest round-trip decimal, with float noise from scaling trimmed.
fn num(x: f64) -> String {
    let rounded = (x * 1e9).round() / 1e9;
    if rounded.is_finite() {
        format!("{rounded}")
    } else {
        format!("{x}")
    }
}

fn block<'a>(evidence: &'a Evidence, name: &str) -> &'a Value {
    evidence.block(name).unwrap_or(&Value::Null)
}

fn check_integrity(evidence: &Evidence, slo: &SloSpec, reasons: &mut Vec<String>) {
    if !slo.integrity.require_signature {
        return;
    }
    let expected = evidence.compute_signature();
    if evidence.claimed_signature() != Some(expected.as_str()) {
        reasons.push("integrity.signature_mismatch".to_string());
    }
}

fn check_witness(evidence: &Evidence, slo: &SloSpec, reasons: &mut Vec<String>) {
    let witness = block(evidence, "witness");

    if slo.witness.require_csv_sha256 {
        let has_digest = witness
            .get("csv_sha256")
            .and_then(Value::as_str)
            .is_some_and(|s| !s.is_empty());
        if !has_digest {
            reasons.push("witness.no_csv_sha256".to_string());
        }
    }

    let min_rows = slo.witness.min_rows;
    if min_rows > 0 {
        if let Some(rows) = number_at(witness, &["rows"]) {
            if rows < min_rows as f64 {
                reasons.push(format!("witness.rows_insufficient:{}<{}", num(rows), min_rows));
            }
        }
    }
}

fn check_budget(evidence: &Evidence, slo: &SloSpec, reasons: &mut Vec<String>) {
    let budget = block(evidence, "budget");

    let level = match budget.get("level") {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(s.clone()),
        Some(other) => Some(other.to_string()),
    };
    let allowed = level
        .as_ref()
        .is_some_and(|l| slo.budget.allow_levels.iter().any(|a| a == l));
    if !allowed {
        reasons.push(format!(
            "budget.level_forbidden:{}",
            level.as_deref().unwrap_or("none")
        ));
    }

    if let Some(max_spent) = slo.budget.max_spent {
        let spent = number_or_zero(budget, &["spent"]);
        if spent > max_spent {
            reasons.push(format!("budget.spent_over:{}>{}", num(spent), num(max_spent)));
        }
    }
}

fn check_quota(evidence: &Evidence, slo: &SloSpec, reasons: &mut Vec<String>) {
    let quota = block(evidence, "quota");
    // BTreeMap iteration gives metrics in sorted order
    for (metric, forbidden) in &slo.quota.forbid_actions {
        let action = lookup(quota, &["decisions", metric.as_str(), "action"]).and_then(Value::as_str);
        if let Some(action) = action {
            if forbidden.iter().any(|f| f == action) {
                reasons.push(format!("quota.forbid:{metric}:{action}"));
            }
        }
    }
}

fn check_anomaly(evidence: &Evidence, slo: &SloSpec, reasons: &mut Vec<String>) {
    if slo.anomaly.allow_spike {
        return;
    }
    let is_spike = block(evidence, "anomaly")
        .get("is_spike")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    if is_spike {
        reasons.push("anomaly.spike_forbidden".to_string());
    }
}

fn check_perf(evidence: &Evidence, slo: &SloSpec, reasons: &mut Vec<String>) {
    if !slo.requires_perf() {
        return;
    }
    let Some(perf) = evidence.block("perf") else {
        reasons.push("perf.missing".to_string());
        return;
    };
    let count = number_or_zero(perf, &["count"]);

    let latency = &slo.latency;
    match latency.min_samples {
        Some(min) if count < min as f64 => {
            reasons.push(format!("latency.samples_insufficient:{}<{}", num(count), min));
        }
        _ => {
            if let Some(max) = latency.max_p95_ms {
                let p95 = number_or_zero(perf, &["latency_ms", "p95"]);
                if p95 > max {
                    reasons.push(format!("latency.p95_over:{}>{}", num(p95), num(max)));
                }
            }
            if let Some(max) = latency.max_p99_ms {
                let p99 = number_or_zero(perf, &["latency_ms", "p99"]);
                if p99 > max {
                    reasons.push(format!("latency.p99_over:{}>{}", num(p99), num(max)));
                }
            }
        }
    }

    let error = &slo.error;
    match error.min_samples {
        Some(min) if count < min as f64 => {
            reasons.push(format!("error.samples_insufficient:{}<{}", num(count), min));
        }
        _ => {
            if let Some(max) = error.max_error_rate {
                let rate = number_or_zero(perf, &["error_rate"]);
                if rate > max {
                    reasons.push(format!("error.rate_over:{}>{}", num(rate), num(max)));
                }
            }
        }
    }
}

fn check_judge_infra(evidence: &Evidence, infra: &JudgeInfraSpec, reasons: &mut Vec<String>) {
    if !infra.has_thresholds() {
        return;
    }
    let Some(pj) = evidence.block("perf_judge") else {
        reasons.push("infra.perf_missing".to_string());
        return;
    };
    let burst = 1.0 + infra.grace_burst.max(0.0);
    let count = number_or_zero(pj, &["count"]);

    if let Some(latency) = &infra.latency {
        match latency.min_samples {
            Some(min) if count < min as f64 => {
                reasons.push("infra.samples_insufficient_latency".to_string());
            }
            _ => {
                if let Some(max) = latency.max_p95_ms {
                    let ceiling = max * burst;
                    let p95 = number_or_zero(pj, &["latency_ms", "p95"]);
                    if p95 > ceiling {
                        reasons.push(format!(
                            "infra.latency_p95_over:{}>{}",
                            num(p95),
                            num(ceiling)
                        ));
                    }
                }
                if let Some(max) = latency.max_p99_ms {
                    let ceiling = max * burst;
                    let p99 = number_or_zero(pj, &["latency_ms", "p99"]);
                    if p99 > ceiling {
                        reasons.push(format!(
                            "infra.latency_p99_over:{}>{}",
                            num(p99),
                            num(ceiling)
                        ));
                    }
                }
            }
        }
    }

    if let Some(min) = infra.availability.as_ref().and_then(|a| a.min_availability) {
        let availability = number_or_zero(pj, &["availability"]);
        if availability < min {
            reasons.push(format!(
                "infra.availability_low:{}<{}",
                num(availability),
                num(min)
            ));
        }
    }

    if let Some(sig) = &infra.sig {
        match sig.min_samples {
            Some(min) if count < min as f64 => {
                reasons.push("infra.samples_insufficient_sig".to_string());
            }
            _ => {
                if let Some(max) = sig.max_sig_error_rate {
                    let ceiling = max * burst;
                    let rate = number_or_zero(pj, &["signature_error_rate"]);
                    if rate > ceiling {
                        reasons.push(format!(
                            "infra.sig_error_rate_over:{}>{}",
                            num(rate),
                            num(ceiling)
                        ));
                    }
                }
            }
        }
    }
}

fn check_canary(evidence: &Evidence, canary: &CanarySpec, reasons: &mut Vec<String>) {
    let Some(block) = evidence.block("canary") else {
        reasons.push("canary.missing".to_string());
        return;
    };

    let samples = number_or_zero(block, &["canary_perf", "count"]);
    if samples < canary.min_sample_count as f64 {
        reasons.push("canary.sample_insufficient".to_string());
        return;
    }

    let t = &canary.thresholds;
    let checks = [
        ("p95_rel", t.max_p95_rel_increase, "canary.p95_rel_over"),
        ("error_delta", t.max_error_abs_delta, "canary.error_delta_over"),
        ("sig_error_delta", t.max_sig_error_delta, "canary.sig_error_delta_over"),
    ];
    for (name, limit, code) in checks {
        match number_at(block, &["deltas", name]) {
            None => reasons.push(format!("canary.delta_missing:{name}")),
            Some(delta) if delta > limit => {
                reasons.push(format!("{code}:{}>{}", num(delta), num(limit)));
            }
            Some(_) => {}
        }
    }
}

fn check_drift(drift: &DriftSpec, reasons: &mut Vec<String>) {
    let path = Path::new(&drift.source);
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) => {
            debug!(path = %drift.source, error = %e, "drift artifact unreadable");
            reasons.push(format!("drift.source_missing:{}", drift.source));
            return;
        }
    };
    let artifact = match serde_json::from_str::<Value>(&raw) {
        Ok(v @ Value::Object(_)) => v,
        _ => {
            reasons.push(format!("drift.source_invalid:{}", drift.source));
            return;
        }
    };

    if let Some(severity) = artifact.get("severity").and_then(Value::as_str) {
        if drift.forbid_severity.iter().any(|s| s == severity) {
            reasons.push(format!("drift.severity_forbidden:{severity}"));
        }
    }
    let abs_diff = number_or_zero(&artifact, &["abs_diff"]);
    if abs_diff > drift.max_abs_diff {
        reasons.push(format!(
            "drift.abs_over:{}>{}",
            num(abs_diff),
            num(drift.max_abs_diff)
        ));
    }
    let kl = number_or_zero(&artifact, &["kl"]);
    if kl > drift.max_kl {
        reasons.push(format!("drift.kl_over:{}>{}", num(kl), num(drift.max_kl)));
    }
}

fn check_saturation(evidence: &Evidence, sat: &SaturationSpec, reasons: &mut Vec<String>) {
    let usage = block(evidence, "usage");
    let checks = [
        ("cpu", "cpu_percent", sat.max_cpu_percent),
        ("mem", "mem_percent", sat.max_mem_percent),
        ("qps", "qps", sat.max_qps),
    ];
    for (metric, field, ceiling) in checks {
        let Some(ceiling) = ceiling else { continue };
        match number_at(usage, &[field]) {
            Some(actual) if actual > ceiling => {
                reasons.push(format!(
                    "infra.saturation.{metric}:{}>{}",
                    num(actual),
                    num(ceiling)
                ));
            }
            Some(_) => {}
            None if sat.fail_closed => {
                reasons.push(format!("infra.saturation.{metric}_missing"));
            }
            None => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sealed(mut v: Value) -> Evidence {
        let mut ev = Evidence::from_value(v.take()).unwrap();
        ev.seal();
        ev
    }

    fn base() -> Value {
        json!({
            "meta": {"tenant": "t1", "window": "2026-10-01"},
            "witness": {"csv_sha256": "ab12", "rows": 42},
            "usage": {"cpu_percent": 40.0, "mem_percent": 50.0, "qps": 120},
            "rating": {"total": 12.5},
            "quota": {"decisions": {"tokens": {"action": "allow"}}},
            "budget": {"level": "ok", "spent": 80},
            "anomaly": {"is_spike": false},
            "integrity": {}
        })
    }

    #[test]
    fn number_format_is_shortest() {
        assert_eq!(num(1300.0), "1300");
        assert_eq!(num(0.03), "0.03");
        assert_eq!(num(300.0 * 1.1), "330");
    }

    #[test]
    fn missing_blocks_stop_evaluation() {
        let v = json!({"meta": {}, "budget": {"level": "exceeded"}});
        let ev = Evidence::from_value(v).unwrap();
        let verdict = evaluate(&ev, &SloSpec::default());
        assert_eq!(
            verdict.reasons,
            vec![
                "evidence.missing:witness",
                "evidence.missing:usage",
                "evidence.missing:rating",
                "evidence.missing:quota",
                "evidence.missing:anomaly",
                "evidence.missing:integrity",
            ]
        );
    }

    #[test]
    fn tampered_evidence_fails_integrity() {
        let mut ev = sealed(base()).into_value();
        ev["rating"]["total"] = json!(1.0);
        let ev = Evidence::from_value(ev).unwrap();
        let verdict = evaluate(&ev, &SloSpec::default());
        assert_eq!(verdict.reasons, vec!["integrity.signature_mismatch"]);
    }

    #[test]
    fn witness_rows_floor() {
        let mut v = base();
        v["witness"]["rows"] = json!(3);
        let slo = SloSpec::from_value(json!({"witness": {"min_rows": 5}})).unwrap();
        let verdict = evaluate(&sealed(v), &slo);
        assert_eq!(verdict.reasons, vec!["witness.rows_insufficient:3<5"]);
    }

    #[test]
    fn missing_budget_level_prints_none() {
        let mut v = base();
        v["budget"] = json!({});
        let verdict = evaluate(&sealed(v), &SloSpec::default());
        assert_eq!(verdict.reasons, vec!["budget.level_forbidden:none"]);
    }

    #[test]
    fn quota_reasons_in_metric_order() {
        let mut v = base();
        v["quota"] = json!({"decisions": {
            "tokens": {"action": "block"},
            "api_calls": {"action": "throttle"}
        }});
        let slo = SloSpec::from_value(json!({"quota": {"forbid_actions": {
            "tokens": ["block"],
            "api_calls": ["throttle", "block"]
        }}}))
        .unwrap();
        let verdict = evaluate(&sealed(v), &slo);
        assert_eq!(
            verdict.reasons,
            vec!["quota.forbid:api_calls:throttle", "quota.forbid:tokens:block"]
        );
    }

    #[test]
    fn latency_floor_skips_percentiles_but_not_error_rate() {
        let mut v = base();
        v["perf"] = json!({"count": 10, "latency_ms": {"p95": 9999}, "error_rate": 0.5});
        let slo = SloSpec::from_value(json!({
            "latency": {"max_p95_ms": 300, "min_samples": 100},
            "error": {"max_error_rate": 0.01}
        }))
        .unwrap();
        let verdict = evaluate(&sealed(v), &slo);
        assert_eq!(
            verdict.reasons,
            vec!["latency.samples_insufficient:10<100", "error.rate_over:0.5>0.01"]
        );
    }

    #[test]
    fn saturation_missing_metric_fails_closed() {
        let mut v = base();
        v["usage"] = json!({"cpu_percent": 95.5});
        let slo = SloSpec::from_value(json!({"saturation": {}})).unwrap();
        let verdict = evaluate(&sealed(v), &slo);
        assert_eq!(
            verdict.reasons,
            vec!["infra.saturation.cpu:95.5>90", "infra.saturation.mem_missing"]
        );
    }

    #[test]
    fn saturation_missing_metric_tolerated_when_open() {
        let mut v = base();
        v["usage"] = json!({});
        let slo = SloSpec::from_value(json!({"saturation": {"fail_closed": false}})).unwrap();
        assert!(evaluate(&sealed(v), &slo).passed());
    }
}
