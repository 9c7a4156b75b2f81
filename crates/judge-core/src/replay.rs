//! Replay guard: at-most-once acceptance of `(key_id, nonce)`.
//!
//! A request is admitted only if its timestamp lies in
//! `[now - skew - ttl, now + skew]` and the pair has not been recorded.
//! Anything outside that window is rejected without touching the store, so
//! records older than `now - skew - ttl` can be purged safely.
//!
//! Backend failures reject the request (fail closed).

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use judge_state::{InsertOutcome, ReplayRecord, ReplayStore, StorageError};
use tracing::{debug, error, warn};

use crate::clock::Clock;
use crate::metrics::Counters;

/// Replay window tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplayGuardConfig {
    pub ttl_sec: i64,
    pub skew_sec: i64,
    pub purge_interval_sec: i64,
}

impl Default for ReplayGuardConfig {
    fn default() -> Self {
        Self {
            ttl_sec: 600,
            skew_sec: 120,
            purge_interval_sec: 60,
        }
    }
}

/// Why a request was not admitted.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReplayError {
    #[error("timestamp {ts} outside replay window")]
    OutsideWindow { ts: i64 },

    #[error("nonce already used")]
    Replayed,

    #[error("replay backend unavailable: {0}")]
    BackendUnavailable(String),
}

impl ReplayError {
    /// All replay rejections share one public code.
    pub fn code(&self) -> &'static str {
        "replay_rejected"
    }

    /// Short label for logs and counters.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::OutsideWindow { .. } => "outside_window",
            Self::Replayed => "replayed",
            Self::BackendUnavailable(_) => "backend_unavailable",
        }
    }
}

pub struct ReplayGuard {
    store: Arc<dyn ReplayStore>,
    config: ReplayGuardConfig,
    clock: Arc<dyn Clock>,
    counters: Arc<Counters>,
    last_purge: AtomicI64,
}

impl std::fmt::Debug for ReplayGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplayGuard")
            .field("backend", &self.store.backend_name())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl ReplayGuard {
    pub fn new(
        store: Arc<dyn ReplayStore>,
        config: ReplayGuardConfig,
        clock: Arc<dyn Clock>,
        counters: Arc<Counters>,
    ) -> Self {
        Self {
            store,
            config,
            clock,
            counters,
            last_purge: AtomicI64::new(i64::MIN),
        }
    }

    pub fn config(&self) -> ReplayGuardConfig {
        self.config
    }

    pub fn backend_name(&self) -> &'static str {
        self.store.backend_name()
    }

    /// `true` when the request must be rejected.
    pub async fn seen_or_insert(&self, key_id: &str, nonce: &str, ts_epoch: i64) -> bool {
        self.check(key_id, nonce, ts_epoch).await.is_err()
    }

    /// Admit `(key_id, nonce)` once, or say why not.
    pub async fn check(&self, key_id: &str, nonce: &str, ts_epoch: i64) -> Result<(), ReplayError> {
        let now = self.clock.epoch();
        let lower = now - self.config.skew_sec - self.config.ttl_sec;
        let upper = now + self.config.skew_sec;
        if ts_epoch < lower || ts_epoch > upper {
            debug!(key_id, ts_epoch, now, "replay window rejected");
            return Err(ReplayError::OutsideWindow { ts: ts_epoch });
        }

        let record = ReplayRecord::new(key_id, nonce, ts_epoch);
        match self.store.insert_if_absent(&record).await {
            Ok(InsertOutcome::Inserted) => {
                self.maybe_purge(now).await;
                Ok(())
            }
            Ok(InsertOutcome::AlreadySeen) => Err(ReplayError::Replayed),
            Err(e) => {
                self.counters.inc_replay_backend_failures();
                error!(
                    backend = self.store.backend_name(),
                    error = %e,
                    "replay backend failure, rejecting request"
                );
                Err(ReplayError::BackendUnavailable(e.to_string()))
            }
        }
    }

    /// Purge expired records at most once per `purge_interval_sec`.
    async fn maybe_purge(&self, now: i64) {
        let last = self.last_purge.load(Ordering::Relaxed);
        if last != i64::MIN && now - last < self.config.purge_interval_sec {
            return;
        }
        if self
            .last_purge
            .compare_exchange(last, now, Ordering::AcqRel, Ordering::Relaxed)
            .is_err()
        {
            // another task won the slot
            return;
        }
        let cutoff = now - self.config.skew_sec - self.config.ttl_sec;
        match self.store.purge_older_than(cutoff).await {
            Ok(removed) => debug!(removed, cutoff, "replay records purged"),
            Err(e) => warn!(error = %e, "replay purge failed"),
        }
    }

    /// Backend health for readiness.
    pub async fn ping(&self) -> Result<(), StorageError> {
        self.store.ping().await
    }
}
