//! Key sources and priority merge.
//!
//! Priority, highest first: explicit override > remote key endpoint > key
//! file > environment. On merge a higher-priority source wins per `key_id`.
//! A source that fails is logged and skipped; an empty merge is the caller's
//! signal to degrade.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, warn};

use super::{KeyError, KeySet, KeySpec, KeyState, SigningKey};
use crate::canonical::sha256_hex;

/// Key id assigned to a bare single secret from the legacy variable.
pub const LEGACY_KEY_ID: &str = "legacy";

/// One place keys can be loaded from.
#[derive(Debug, Clone)]
pub enum KeySource {
    /// Keys supplied programmatically; always wins.
    Override(Vec<SigningKey>),
    /// HTTP endpoint returning a key document.
    Remote { url: String, timeout: Duration },
    /// JSON key document on disk.
    File(PathBuf),
    /// Environment variable holding a JSON key document or `id:secret,...`
    /// pairs, with an optional single-secret fallback variable.
    Env {
        var: String,
        legacy_var: Option<String>,
    },
}

impl KeySource {
    /// Lower number = higher priority.
    fn priority(&self) -> u8 {
        match self {
            Self::Override(_) => 0,
            Self::Remote { .. } => 1,
            Self::File(_) => 2,
            Self::Env { .. } => 3,
        }
    }

    pub fn name(&self) -> String {
        match self {
            Self::Override(_) => "override".to_string(),
            Self::Remote { url, .. } => format!("remote:{url}"),
            Self::File(path) => format!("file:{}", path.display()),
            Self::Env { var, .. } => format!("env:{var}"),
        }
    }

    /// Load this source's keys.
    pub async fn load(&self, http: &reqwest::Client) -> Result<Vec<SigningKey>, KeyError> {
        match self {
            Self::Override(keys) => Ok(keys.clone()),
            Self::Remote { url, timeout } => {
                let body = fetch_remote(http, url, *timeout).await?;
                parse_key_document(&self.name(), &body)
            }
            Self::File(path) => match tokio::fs::read_to_string(path).await {
                Ok(text) => parse_key_document(&self.name(), &text),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
                Err(e) => Err(KeyError::Io {
                    source_name: self.name(),
                    detail: e.to_string(),
                }),
            },
            Self::Env { var, legacy_var } => {
                if let Some(raw) = std::env::var(var).ok().filter(|v| !v.trim().is_empty()) {
                    return parse_env_value(&self.name(), &raw);
                }
                match legacy_var.as_deref().and_then(|v| std::env::var(v).ok()) {
                    Some(secret) if !secret.is_empty() => Ok(vec![SigningKey::new(
                        LEGACY_KEY_ID,
                        secret.into_bytes(),
                        KeyState::Active,
                    )]),
                    _ => Ok(Vec::new()),
                }
            }
        }
    }
}

async fn fetch_remote(
    http: &reqwest::Client,
    url: &str,
    timeout: Duration,
) -> Result<String, KeyError> {
    let resp = http
        .get(url)
        .timeout(timeout)
        .send()
        .await
        .map_err(|e| KeyError::Remote(e.to_string()))?;
    let status = resp.status();
    if !status.is_success() {
        return Err(KeyError::Remote(format!("{url} returned {status}")));
    }
    resp.text().await.map_err(|e| KeyError::Remote(e.to_string()))
}

#[derive(Deserialize)]
#[serde(untagged)]
enum KeyDocument {
    List(Vec<KeySpec>),
    Wrapped { keys: Vec<KeySpec> },
}

/// Parse `[{...}]` or `{"keys": [{...}]}`.
pub fn parse_key_document(source_name: &str, text: &str) -> Result<Vec<SigningKey>, KeyError> {
    let doc: KeyDocument = serde_json::from_str(text).map_err(|e| KeyError::Parse {
        source_name: source_name.to_string(),
        detail: e.to_string(),
    })?;
    let specs = match doc {
        KeyDocument::List(specs) | KeyDocument::Wrapped { keys: specs } => specs,
    };
    specs.into_iter().map(SigningKey::from_spec).collect()
}

/// Environment values are either a key document or `id:secret,id:secret`.
fn parse_env_value(source_name: &str, raw: &str) -> Result<Vec<SigningKey>, KeyError> {
    let trimmed = raw.trim();
    if trimmed.starts_with('[') || trimmed.starts_with('{') {
        return parse_key_document(source_name, trimmed);
    }
    trimmed
        .split(',')
        .filter(|pair| !pair.trim().is_empty())
        .map(|pair| {
            let (id, secret) = pair.split_once(':').ok_or_else(|| KeyError::Parse {
                source_name: source_name.to_string(),
                detail: format!("expected key_id:secret, got '{}'", pair.trim()),
            })?;
            let id = id.trim();
            let secret = super::parse_secret(id, secret.trim())?;
            Ok(SigningKey::new(id, secret, KeyState::Active))
        })
        .collect()
}

/// Result of loading every configured source.
#[derive(Debug, Clone, Default)]
pub struct MergedKeys {
    pub set: KeySet,
    /// Per-source failures, already logged.
    pub errors: Vec<String>,
    /// Fingerprint of the merged key material (ids, states, secret digests).
    pub fingerprint: Option<String>,
}

/// Ordered collection of key sources.
#[derive(Debug, Clone)]
pub struct KeySources {
    sources: Vec<KeySource>,
    http: reqwest::Client,
}

impl Default for KeySources {
    fn default() -> Self {
        Self::new()
    }
}

impl KeySources {
    pub fn new() -> Self {
        Self {
            sources: Vec::new(),
            http: reqwest::Client::new(),
        }
    }

    pub fn with_source(mut self, source: KeySource) -> Self {
        self.sources.push(source);
        self.sources.sort_by_key(KeySource::priority);
        self
    }

    pub fn with_override(self, keys: Vec<SigningKey>) -> Self {
        self.with_source(KeySource::Override(keys))
    }

    pub fn with_remote(self, url: impl Into<String>, timeout: Duration) -> Self {
        self.with_source(KeySource::Remote {
            url: url.into(),
            timeout,
        })
    }

    pub fn with_file(self, path: impl Into<PathBuf>) -> Self {
        self.with_source(KeySource::File(path.into()))
    }

    pub fn with_env(self, var: impl Into<String>, legacy_var: Option<String>) -> Self {
        self.with_source(KeySource::Env {
            var: var.into(),
            legacy_var,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    pub fn names(&self) -> Vec<String> {
        self.sources.iter().map(KeySource::name).collect()
    }

    /// Load every source and merge, higher priority winning per key id.
    pub async fn load_merged(&self) -> MergedKeys {
        let mut merged: BTreeMap<String, SigningKey> = BTreeMap::new();
        let mut errors = Vec::new();

        // lowest priority first so later inserts override
        for source in self.sources.iter().rev() {
            match source.load(&self.http).await {
                Ok(keys) => {
                    debug!(source = %source.name(), count = keys.len(), "key source loaded");
                    for key in keys {
                        merged.insert(key.key_id().to_string(), key);
                    }
                }
                Err(e) => {
                    warn!(source = %source.name(), error = %e, "key source failed");
                    errors.push(format!("{}: {}", source.name(), e));
                }
            }
        }

        let set = KeySet::new(merged.into_values());
        let fingerprint = (!set.is_empty()).then(|| fingerprint(&set));
        MergedKeys {
            set,
            errors,
            fingerprint,
        }
    }
}

fn fingerprint(set: &KeySet) -> String {
    let lines: Vec<String> = set
        .iter()
        .map(|k| {
            format!(
                "{}:{}:{}",
                k.key_id(),
                k.state().as_str(),
                sha256_hex(k.secret())
            )
        })
        .collect();
    sha256_hex(lines.join("\n").as_bytes())
}
