//! Domain-level error taxonomy for the judge.

/// Errors produced when Evidence, SLO specs or request payloads are malformed.
#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    #[error("{what} must be a JSON object")]
    NotAnObject { what: &'static str },

    #[error("payload missing required field: {field}")]
    MissingField { field: &'static str },

    #[error("malformed {what}: {detail}")]
    Malformed { what: &'static str, detail: String },

    #[error("{field} must not be negative (got {value})")]
    Negative { field: String, value: f64 },

    #[error("invalid quorum: k={k}, n={n} (need 0 < k <= n)")]
    InvalidQuorum { k: u64, n: u64 },
}

impl ValidationError {
    pub(crate) fn malformed(what: &'static str, err: impl std::fmt::Display) -> Self {
        Self::Malformed {
            what,
            detail: err.to_string(),
        }
    }
}
