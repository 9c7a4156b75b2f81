//! Evidence document submitted for judgment.
//!
//! Evidence is kept as a raw JSON object: producers attach blocks the judge
//! does not interpret, and the integrity digest has to cover them byte for
//! byte. Typed access goes through the small helpers below.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::canonical::integrity_sha256;
use crate::domain::error::ValidationError;

/// Blocks every Evidence document must carry.
pub const REQUIRED_BLOCKS: [&str; 8] = [
    "meta",
    "witness",
    "usage",
    "rating",
    "quota",
    "budget",
    "anomaly",
    "integrity",
];

/// Blocks included in the integrity digest when present and non-null.
pub const OPTIONAL_BLOCKS: [&str; 4] = ["perf", "perf_judge", "judges", "canary"];

/// Read-only Evidence object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Evidence(Map<String, Value>);

impl Evidence {
    /// Accept any JSON object; block-level checks happen during evaluation.
    pub fn from_value(value: Value) -> Result<Self, ValidationError> {
        match value {
            Value::Object(map) => Ok(Self(map)),
            _ => Err(ValidationError::NotAnObject { what: "evidence" }),
        }
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }

    /// Raw block, `None` when the key is absent. A JSON `null` is returned as-is.
    pub fn raw_block(&self, name: &str) -> Option<&Value> {
        self.0.get(name)
    }

    /// Block that is present and not `null`.
    pub fn block(&self, name: &str) -> Option<&Value> {
        self.0.get(name).filter(|v| !v.is_null())
    }

    /// Required blocks whose key is absent, in declaration order.
    pub fn missing_blocks(&self) -> Vec<&'static str> {
        REQUIRED_BLOCKS
            .iter()
            .copied()
            .filter(|name| !self.0.contains_key(*name))
            .collect()
    }

    /// The object the integrity digest is computed over: required blocks
    /// except `integrity`, plus optional blocks that are present and non-null.
    pub fn integrity_payload(&self) -> Value {
        let mut core = Map::new();
        for name in REQUIRED_BLOCKS.iter().filter(|n| **n != "integrity") {
            if let Some(v) = self.0.get(*name) {
                core.insert((*name).to_string(), v.clone());
            }
        }
        for name in OPTIONAL_BLOCKS {
            if let Some(v) = self.block(name) {
                core.insert(name.to_string(), v.clone());
            }
        }
        Value::Object(core)
    }

    /// Recompute `integrity.signature_sha256` for this document.
    ///
    /// Hashes [`crate::canonical::integrity_json`] of the integrity payload,
    /// the same bytes Python producers hash.
    pub fn compute_signature(&self) -> String {
        integrity_sha256(&self.integrity_payload())
    }

    /// Signature claimed by the producer.
    pub fn claimed_signature(&self) -> Option<&str> {
        self.block("integrity")
            .and_then(|i| i.get("signature_sha256"))
            .and_then(Value::as_str)
    }

    /// Insert or replace a top-level block. Reseal afterwards when the block
    /// is covered by the integrity digest.
    pub fn set_block(&mut self, name: &str, value: Value) {
        self.0.insert(name.to_string(), value);
    }

    /// Write a fresh integrity signature into the document (producer side).
    pub fn seal(&mut self) {
        let sig = self.compute_signature();
        let integrity = self
            .0
            .entry("integrity".to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if !integrity.is_object() {
            *integrity = Value::Object(Map::new());
        }
        if let Value::Object(map) = integrity {
            map.insert("signature_sha256".to_string(), Value::String(sig));
        }
    }
}

/// Follow a dotted path of object keys.
pub(crate) fn lookup<'a>(value: &'a Value, path: &[&str]) -> Option<&'a Value> {
    path.iter().try_fold(value, |cur, key| cur.get(*key))
}

/// Numeric field at `path`, if present and numeric.
pub(crate) fn number_at(value: &Value, path: &[&str]) -> Option<f64> {
    lookup(value, path).and_then(Value::as_f64)
}

/// Numeric field at `path`, defaulting to `0` when absent.
pub(crate) fn number_or_zero(value: &Value, path: &[&str]) -> f64 {
    number_at(value, path).unwrap_or(0.0)
}
