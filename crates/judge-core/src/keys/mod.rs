//! Signing keys: material, lifecycle state, sources and the rotating store.
//!
//! - [`SigningKey`]: one HMAC secret with its state and validity window
//! - [`KeySource`]: where key lists come from (override, remote, file, env)
//! - [`KeyStore`]: current set + grace buckets, copy-on-write rotation

pub mod source;
pub mod store;

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use source::{KeySource, KeySources};
pub use store::{KeyStore, KeyStoreConfig, KeyStoreStatus, RefreshOutcome};

/// Errors raised while loading key material.
#[derive(Debug, thiserror::Error)]
pub enum KeyError {
    #[error("key source io error ({source_name}): {detail}")]
    Io { source_name: String, detail: String },

    #[error("key source {source_name} is not a valid key list: {detail}")]
    Parse { source_name: String, detail: String },

    #[error("invalid secret for key {key_id}: {detail}")]
    InvalidSecret { key_id: String, detail: String },

    #[error("remote key endpoint failed: {0}")]
    Remote(String),
}

/// Lifecycle state of a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyState {
    /// Signs and verifies.
    #[default]
    Active,
    /// Verifies only; kept for an overlap window around rotation.
    Grace,
    /// Never verifies.
    Retired,
}

impl KeyState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Grace => "grace",
            Self::Retired => "retired",
        }
    }
}

/// Key entry as it appears in a source document.
///
/// `[{"key_id","secret","state"?,"not_before"?,"not_after"?}]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct KeySpec {
    pub key_id: String,
    /// `hex:<hex>` or raw UTF-8.
    pub secret: String,
    #[serde(default)]
    pub state: KeyState,
    #[serde(default)]
    pub not_before: Option<DateTime<Utc>>,
    #[serde(default)]
    pub not_after: Option<DateTime<Utc>>,
}

/// Decode a secret from its source encoding.
pub fn parse_secret(key_id: &str, raw: &str) -> Result<Vec<u8>, KeyError> {
    let bytes = match raw.strip_prefix("hex:") {
        Some(hex_part) => hex::decode(hex_part).map_err(|e| KeyError::InvalidSecret {
            key_id: key_id.to_string(),
            detail: e.to_string(),
        })?,
        None => raw.as_bytes().to_vec(),
    };
    if bytes.is_empty() {
        return Err(KeyError::InvalidSecret {
            key_id: key_id.to_string(),
            detail: "secret is empty".to_string(),
        });
    }
    Ok(bytes)
}

/// HMAC key held by the store. Secrets never appear in `Debug` output.
#[derive(Clone, PartialEq, Eq)]
pub struct SigningKey {
    key_id: String,
    secret: Vec<u8>,
    state: KeyState,
    not_before: Option<DateTime<Utc>>,
    not_after: Option<DateTime<Utc>>,
}

impl SigningKey {
    pub fn new(key_id: impl Into<String>, secret: impl Into<Vec<u8>>, state: KeyState) -> Self {
        Self {
            key_id: key_id.into(),
            secret: secret.into(),
            state,
            not_before: None,
            not_after: None,
        }
    }

    pub fn with_validity(
        mut self,
        not_before: Option<DateTime<Utc>>,
        not_after: Option<DateTime<Utc>>,
    ) -> Self {
        self.not_before = not_before;
        self.not_after = not_after;
        self
    }

    pub fn from_spec(spec: KeySpec) -> Result<Self, KeyError> {
        let secret = parse_secret(&spec.key_id, &spec.secret)?;
        Ok(Self::new(spec.key_id, secret, spec.state).with_validity(spec.not_before, spec.not_after))
    }

    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    pub fn state(&self) -> KeyState {
        self.state
    }

    pub(crate) fn secret(&self) -> &[u8] {
        &self.secret
    }

    /// State at `now`: outside `[not_before, not_after]` the key counts as retired.
    pub fn effective_state(&self, now: DateTime<Utc>) -> KeyState {
        let before_window = self.not_before.is_some_and(|nb| now < nb);
        let after_window = self.not_after.is_some_and(|na| now > na);
        if before_window || after_window {
            KeyState::Retired
        } else {
            self.state
        }
    }
}

impl fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SigningKey")
            .field("key_id", &self.key_id)
            .field("secret", &"<redacted>")
            .field("state", &self.state)
            .field("not_before", &self.not_before)
            .field("not_after", &self.not_after)
            .finish()
    }
}

/// Immutable set of keys keyed by `key_id`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeySet {
    keys: BTreeMap<String, SigningKey>,
}

impl KeySet {
    pub fn new(keys: impl IntoIterator<Item = SigningKey>) -> Self {
        Self {
            keys: keys
                .into_iter()
                .map(|k| (k.key_id.clone(), k))
                .collect(),
        }
    }

    pub fn get(&self, key_id: &str) -> Option<&SigningKey> {
        self.keys.get(key_id)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Keys in key-id order.
    pub fn iter(&self) -> impl Iterator<Item = &SigningKey> {
        self.keys.values()
    }

    pub fn key_ids(&self) -> Vec<String> {
        self.keys.keys().cloned().collect()
    }
}
