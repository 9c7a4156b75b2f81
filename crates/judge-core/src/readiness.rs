//! Readiness report backing `/readyz`.
//!
//! Each check reports its own detail; a failing check contributes a
//! `<check>:<code>` reason code and makes the whole report `degraded`.

use serde::Serialize;

use crate::clock::{iso_seconds, Clock};
use crate::keys::{KeyStore, KeyStoreStatus};
use crate::replay::ReplayGuard;

#[derive(Debug, Clone, Serialize)]
pub struct ReplayStoreCheck {
    pub ok: bool,
    pub backend: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReadinessChecks {
    pub keys: KeyStoreStatus,
    pub replay_store: ReplayStoreCheck,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReadinessReport {
    /// `"ready"` or `"degraded"`.
    pub status: &'static str,
    pub checks: ReadinessChecks,
    pub reason_codes: Vec<String>,
    pub ts: String,
}

impl ReadinessReport {
    pub fn is_ready(&self) -> bool {
        self.reason_codes.is_empty()
    }

    /// 200 when ready, 503 otherwise.
    pub fn status_code(&self) -> u16 {
        if self.is_ready() {
            200
        } else {
            503
        }
    }
}

/// Run every readiness check.
pub async fn check_readiness(
    keys: &KeyStore,
    replay: &ReplayGuard,
    clock: &dyn Clock,
) -> ReadinessReport {
    let mut reason_codes = Vec::new();

    let key_status = keys.status();
    if key_status.keys_count == 0 {
        reason_codes.push("keys:missing".to_string());
    } else if key_status.degraded {
        reason_codes.push("keys:degraded".to_string());
    }

    let replay_store = match replay.ping().await {
        Ok(()) => ReplayStoreCheck {
            ok: true,
            backend: replay.backend_name(),
            error: None,
        },
        Err(e) => {
            reason_codes.push("replay_store:unavailable".to_string());
            ReplayStoreCheck {
                ok: false,
                backend: replay.backend_name(),
                error: Some(e.to_string()),
            }
        }
    };

    ReadinessReport {
        status: if reason_codes.is_empty() {
            "ready"
        } else {
            "degraded"
        },
        checks: ReadinessChecks {
            keys: key_status,
            replay_store,
        },
        reason_codes,
        ts: iso_seconds(clock.now()),
    }
}
