//! Rotating key store.
//!
//! The store holds one immutable [`KeyRing`] behind `RwLock<Arc<_>>`. Readers
//! clone the `Arc` and work on a consistent snapshot; `refresh` builds a new
//! ring off-lock and swaps it in. On rotation the previous current set moves
//! into a grace bucket that keeps verifying until
//! `rotated_at + grace_window_sec`.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::Serialize;
use serde_json::Value;
use sha2::Sha256;
use subtle::ConstantTimeEq;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use super::source::KeySources;
use super::{KeySet, KeyState, SigningKey};
use crate::auth::AuthError;
use crate::canonical::canonical_bytes;
use crate::clock::{iso_seconds, Clock};
use crate::metrics::Counters;
use crate::obs;

type HmacSha256 = Hmac<Sha256>;

/// Key store tuning.
#[derive(Debug, Clone)]
pub struct KeyStoreConfig {
    /// How long keys from the previous set keep verifying after a rotation.
    pub grace_window_sec: i64,
    /// How long the last good set keeps serving once every source is empty.
    /// `0` means fail immediately.
    pub stale_allowance_sec: i64,
    /// Background refresh period for [`KeyStore::spawn_refresh`].
    pub refresh_interval: Duration,
}

impl Default for KeyStoreConfig {
    fn default() -> Self {
        Self {
            grace_window_sec: 60,
            stale_allowance_sec: 0,
            refresh_interval: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone)]
struct GraceBucket {
    keys: KeySet,
    expires_at: DateTime<Utc>,
}

/// Immutable snapshot of everything the store knows.
#[derive(Debug, Clone, Default)]
struct KeyRing {
    current: KeySet,
    grace: Vec<GraceBucket>,
    loaded_at: Option<DateTime<Utc>>,
    degraded_since: Option<DateTime<Utc>>,
    last_error: Option<String>,
    fingerprint: Option<String>,
}

impl KeyRing {
    /// The current set may serve at `now`.
    fn usable(&self, now: DateTime<Utc>, stale_allowance_sec: i64) -> bool {
        if self.current.is_empty() {
            return false;
        }
        match (self.degraded_since, self.loaded_at) {
            (None, _) => true,
            (Some(_), Some(loaded)) => (now - loaded).num_seconds() < stale_allowance_sec,
            (Some(_), None) => false,
        }
    }

    fn live_grace_keys(&self, now: DateTime<Utc>) -> usize {
        self.grace
            .iter()
            .filter(|b| b.expires_at > now)
            .map(|b| b.keys.len())
            .sum()
    }
}

/// What a refresh did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// First successful load.
    Loaded { keys: usize },
    /// Key material changed; the previous set is now in grace.
    Rotated { keys: usize, grace_keys: usize },
    /// Sources returned the same material.
    Unchanged,
    /// No source yielded any key.
    Degraded { reason: String },
}

/// Readiness view of the key store.
#[derive(Debug, Clone, Serialize)]
pub struct KeyStoreStatus {
    pub healthy: bool,
    pub degraded: bool,
    pub keys_count: usize,
    pub grace_keys_count: usize,
    pub loaded_at: Option<String>,
    pub age_sec: Option<i64>,
    pub last_error: Option<String>,
    pub fingerprint: Option<String>,
}

/// Multi-key HMAC store with rotation and grace.
#[derive(Debug)]
pub struct KeyStore {
    sources: KeySources,
    config: KeyStoreConfig,
    clock: Arc<dyn Clock>,
    ring: RwLock<Arc<KeyRing>>,
}

impl KeyStore {
    pub fn new(sources: KeySources, config: KeyStoreConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            sources,
            config,
            clock,
            ring: RwLock::new(Arc::new(KeyRing::default())),
        }
    }

    /// Store serving a fixed key list.
    pub fn with_keys(keys: Vec<SigningKey>, clock: Arc<dyn Clock>) -> Self {
        let store = Self::new(
            KeySources::new().with_override(keys.clone()),
            KeyStoreConfig::default(),
            clock,
        );
        store.install(KeySet::new(keys), None);
        store
    }

    pub fn config(&self) -> &KeyStoreConfig {
        &self.config
    }

    fn snapshot(&self) -> Arc<KeyRing> {
        let guard = self.ring.read().unwrap_or_else(|p| p.into_inner());
        Arc::clone(&guard)
    }

    fn swap(&self, ring: KeyRing) {
        let mut guard = self.ring.write().unwrap_or_else(|p| p.into_inner());
        *guard = Arc::new(ring);
    }

    /// Replace the current set without consulting sources (initial/static load).
    fn install(&self, set: KeySet, fingerprint: Option<String>) {
        let now = self.clock.now();
        self.swap(KeyRing {
            current: set,
            grace: Vec::new(),
            loaded_at: Some(now),
            degraded_since: None,
            last_error: None,
            fingerprint,
        });
    }

    /// Reload from every source and rotate if the material changed.
    pub async fn refresh(&self) -> RefreshOutcome {
        let merged = self.sources.load_merged().await;
        let now = self.clock.now();
        let previous = self.snapshot();

        if merged.set.is_empty() {
            let reason = if merged.errors.is_empty() {
                "no keys loaded from any source".to_string()
            } else {
                merged.errors.join("; ")
            };
            let mut ring = (*previous).clone();
            ring.degraded_since = ring.degraded_since.or(Some(now));
            ring.last_error = Some(reason.clone());
            self.swap(ring);
            error!(reason = %reason, "key store degraded");
            obs::emit_keys_degraded(&reason);
            return RefreshOutcome::Degraded { reason };
        }

        if previous.current == merged.set {
            let mut ring = (*previous).clone();
            ring.loaded_at = Some(now);
            ring.degraded_since = None;
            ring.last_error = None;
            self.swap(ring);
            debug!(keys = merged.set.len(), "key refresh: unchanged");
            return RefreshOutcome::Unchanged;
        }

        let mut grace: Vec<GraceBucket> = previous
            .grace
            .iter()
            .filter(|b| b.expires_at > now)
            .cloned()
            .collect();
        let first_load = previous.current.is_empty();
        if !first_load {
            grace.push(GraceBucket {
                keys: previous.current.clone(),
                expires_at: now + chrono::Duration::seconds(self.config.grace_window_sec),
            });
        }

        let keys = merged.set.len();
        let ring = KeyRing {
            current: merged.set,
            grace,
            loaded_at: Some(now),
            degraded_since: None,
            last_error: None,
            fingerprint: merged.fingerprint,
        };
        let grace_keys = ring.live_grace_keys(now);
        self.swap(ring);

        if first_load {
            info!(keys, "keys loaded");
            RefreshOutcome::Loaded { keys }
        } else {
            obs::emit_keys_rotated(keys, grace_keys);
            RefreshOutcome::Rotated { keys, grace_keys }
        }
    }

    /// Run `refresh` every `refresh_interval` until the task is aborted.
    pub fn spawn_refresh(self: Arc<Self>, counters: Arc<Counters>) -> JoinHandle<()> {
        let store = self;
        let period = store.config.refresh_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            // the first tick completes immediately; startup already loaded
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match store.refresh().await {
                    RefreshOutcome::Rotated { .. } => counters.inc_key_rotations(),
                    RefreshOutcome::Degraded { .. } => counters.inc_key_refresh_failures(),
                    RefreshOutcome::Loaded { .. } | RefreshOutcome::Unchanged => {}
                }
            }
        })
    }

    fn find_key(&self, ring: &KeyRing, key_id: &str, now: DateTime<Utc>) -> Option<(SigningKey, KeyState)> {
        if let Some(key) = ring.current.get(key_id) {
            return Some((key.clone(), key.effective_state(now)));
        }
        ring.grace
            .iter()
            .filter(|b| b.expires_at > now)
            .find_map(|b| b.keys.get(key_id))
            .map(|key| {
                let state = match key.effective_state(now) {
                    KeyState::Retired => KeyState::Retired,
                    _ => KeyState::Grace,
                };
                (key.clone(), state)
            })
    }

    /// Verify a hex HMAC over the canonical form of `payload`.
    pub fn verify(&self, payload: &Value, signature_hex: &str, key_id: &str) -> Result<KeyState, AuthError> {
        self.verify_bytes(&canonical_bytes(payload), signature_hex, key_id)
    }

    /// Verify a hex HMAC over already-canonical bytes.
    ///
    /// Returns the state the key verified under (`Active` or `Grace`).
    pub fn verify_bytes(&self, payload: &[u8], signature_hex: &str, key_id: &str) -> Result<KeyState, AuthError> {
        let now = self.clock.now();
        let ring = self.snapshot();
        if !ring.usable(now, self.config.stale_allowance_sec) {
            return Err(AuthError::KeysUnavailable);
        }

        let (key, state) = self
            .find_key(&ring, key_id, now)
            .ok_or(AuthError::UnknownKey)?;

        let provided = hex::decode(signature_hex.trim()).map_err(|_| AuthError::SignatureMismatch)?;
        let expected = mac(key.secret(), payload);
        if expected.is_empty() || !bool::from(expected.as_slice().ct_eq(provided.as_slice())) {
            return Err(AuthError::SignatureMismatch);
        }
        if state == KeyState::Retired {
            return Err(AuthError::KeyRetired);
        }
        Ok(state)
    }

    /// Hex HMAC of the canonical form of `payload` under `key_id`.
    ///
    /// Retired keys do not sign.
    pub fn sign(&self, payload: &Value, key_id: &str) -> Result<String, AuthError> {
        let now = self.clock.now();
        let ring = self.snapshot();
        if !ring.usable(now, self.config.stale_allowance_sec) {
            return Err(AuthError::KeysUnavailable);
        }
        let (key, state) = self
            .find_key(&ring, key_id, now)
            .ok_or(AuthError::UnknownKey)?;
        if state == KeyState::Retired {
            return Err(AuthError::KeyRetired);
        }
        Ok(hex::encode(mac(key.secret(), &canonical_bytes(payload))))
    }

    /// Sign with the first active key in key-id order; returns `(key_id, signature)`.
    pub fn sign_with_active(&self, payload: &Value) -> Result<(String, String), AuthError> {
        let now = self.clock.now();
        let ring = self.snapshot();
        if !ring.usable(now, self.config.stale_allowance_sec) {
            return Err(AuthError::KeysUnavailable);
        }
        let key = ring
            .current
            .iter()
            .find(|k| k.effective_state(now) == KeyState::Active)
            .ok_or(AuthError::KeysUnavailable)?;
        Ok((
            key.key_id().to_string(),
            hex::encode(mac(key.secret(), &canonical_bytes(payload))),
        ))
    }

    /// Whether verification currently fails with `keys_unavailable`.
    pub fn is_degraded(&self) -> bool {
        !self
            .snapshot()
            .usable(self.clock.now(), self.config.stale_allowance_sec)
    }

    pub fn status(&self) -> KeyStoreStatus {
        let now = self.clock.now();
        let ring = self.snapshot();
        let healthy = ring.usable(now, self.config.stale_allowance_sec);
        KeyStoreStatus {
            healthy,
            degraded: !healthy || ring.degraded_since.is_some(),
            keys_count: ring.current.len(),
            grace_keys_count: ring.live_grace_keys(now),
            loaded_at: ring.loaded_at.map(iso_seconds),
            age_sec: ring.loaded_at.map(|t| (now - t).num_seconds()),
            last_error: ring.last_error.clone(),
            fingerprint: ring.fingerprint.clone(),
        }
    }
}

fn mac(secret: &[u8], payload: &[u8]) -> Vec<u8> {
    // HMAC accepts keys of any length
    let mut m = match HmacSha256::new_from_slice(secret) {
        Ok(m) => m,
        Err(_) => return Vec::new(),
    };
    m.update(payload);
    m.finalize().into_bytes().to_vec()
}
