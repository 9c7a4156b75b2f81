//! Pass/fail verdict produced by a judge.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Binary outcome of a judgment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Decision {
    Pass,
    Fail,
}

impl Decision {
    pub fn is_pass(self) -> bool {
        matches!(self, Self::Pass)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pass => "pass",
            Self::Fail => "fail",
        }
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Decision plus the reason codes that produced it.
///
/// # Invariants
///
/// `decision == Fail` iff `reasons` is non-empty. Build verdicts through
/// [`Verdict::from_reasons`] or [`Verdict::fail`] to keep that true.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Verdict {
    pub decision: Decision,
    pub reasons: Vec<String>,
    /// Version reported by the judge that produced this verdict.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

impl Verdict {
    pub fn pass() -> Self {
        Self {
            decision: Decision::Pass,
            reasons: Vec::new(),
            version: None,
        }
    }

    /// Fail with a single reason.
    pub fn fail(reason: impl Into<String>) -> Self {
        Self {
            decision: Decision::Fail,
            reasons: vec![reason.into()],
            version: None,
        }
    }

    pub fn from_reasons(reasons: Vec<String>) -> Self {
        let decision = if reasons.is_empty() {
            Decision::Pass
        } else {
            Decision::Fail
        };
        Self {
            decision,
            reasons,
            version: None,
        }
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    pub fn passed(&self) -> bool {
        self.decision.is_pass()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decision_follows_reasons() {
        assert!(Verdict::from_reasons(vec![]).passed());
        let v = Verdict::from_reasons(vec!["anomaly.spike_forbidden".into()]);
        assert_eq!(v.decision, Decision::Fail);
    }

    #[test]
    fn decision_serializes_lowercase() {
        let json = serde_json::to_string(&Verdict::fail("x")).unwrap();
        assert_eq!(json, r#"{"decision":"fail","reasons":["x"]}"#);
    }

    #[test]
    fn version_is_optional_on_the_wire() {
        let v: Verdict = serde_json::from_str(r#"{"decision":"pass","reasons":[]}"#).unwrap();
        assert_eq!(v.version, None);
        let v: Verdict =
            serde_json::from_str(r#"{"decision":"pass","reasons":[],"version":"0.5.11j"}"#).unwrap();
        assert_eq!(v.version.as_deref(), Some("0.5.11j"));
        assert!(serde_json::to_string(&Verdict::pass().with_version("1"))
            .unwrap()
            .ends_with(r#""version":"1"}"#));
    }
}
