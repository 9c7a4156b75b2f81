//! Remote judge reached over HTTP.
//!
//! Each attempt POSTs `{"evidence","slo","ts","nonce"}` with a fresh nonce and
//! timestamp, signed by the local key store. Transport errors and 5xx are
//! retried with exponential backoff; 4xx is final. A consecutive-failure
//! circuit breaker short-circuits calls to a judge that keeps failing.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::time::Instant;
use tracing::{debug, warn};

use super::provider::{JudgeProvider, ProviderError};
use crate::auth::{HEADER_KEY_ID, HEADER_NONCE, HEADER_SIGNATURE, HEADER_TIMESTAMP};
use crate::clock::Clock;
use crate::domain::{Evidence, SloSpec, Verdict};
use crate::keys::KeyStore;

/// Remote judge settings.
#[derive(Debug, Clone)]
pub struct HttpJudgeConfig {
    pub id: String,
    /// Full URL of the remote `/judge` endpoint.
    pub url: String,
    /// Key to sign with; the first active key when unset.
    pub key_id: Option<String>,
    /// Per-attempt request timeout.
    pub request_timeout: Duration,
    pub max_attempts: u32,
    /// Delay before the second attempt; doubles after each retry.
    pub backoff_base: Duration,
    pub breaker_max_failures: u32,
    pub breaker_reset: Duration,
}

impl HttpJudgeConfig {
    pub fn new(id: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            url: url.into(),
            key_id: None,
            request_timeout: Duration::from_secs(5),
            max_attempts: 3,
            backoff_base: Duration::from_millis(200),
            breaker_max_failures: 5,
            breaker_reset: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Default)]
struct BreakerState {
    consecutive_failures: u32,
    open_until: Option<Instant>,
}

/// Opens after `max_failures` consecutive failures and stays open for `reset`.
#[derive(Debug)]
pub struct CircuitBreaker {
    max_failures: u32,
    reset: Duration,
    state: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(max_failures: u32, reset: Duration) -> Self {
        Self {
            max_failures: max_failures.max(1),
            reset,
            state: Mutex::new(BreakerState::default()),
        }
    }

    /// Whether a call may go out now. After `reset` one trial call is let through.
    pub fn allow(&self) -> bool {
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        match state.open_until {
            Some(until) if Instant::now() < until => false,
            Some(_) => {
                // half-open: one failure re-opens immediately
                state.open_until = None;
                state.consecutive_failures = self.max_failures - 1;
                true
            }
            None => true,
        }
    }

    pub fn record_success(&self) {
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        state.consecutive_failures = 0;
        state.open_until = None;
    }

    pub fn record_failure(&self) {
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        state.consecutive_failures += 1;
        if state.consecutive_failures >= self.max_failures {
            state.open_until = Some(Instant::now() + self.reset);
        }
    }

    pub fn is_open(&self) -> bool {
        let state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        state.open_until.is_some_and(|until| Instant::now() < until)
    }
}

/// Quorum member that delegates to a remote judge.
#[derive(Debug)]
pub struct HttpJudge {
    config: HttpJudgeConfig,
    client: reqwest::Client,
    keys: Arc<KeyStore>,
    clock: Arc<dyn Clock>,
    breaker: CircuitBreaker,
}

enum Attempt {
    Done(Result<Verdict, ProviderError>),
    Retry(ProviderError),
}

impl HttpJudge {
    pub fn new(config: HttpJudgeConfig, keys: Arc<KeyStore>, clock: Arc<dyn Clock>) -> Self {
        let breaker = CircuitBreaker::new(config.breaker_max_failures, config.breaker_reset);
        Self {
            config,
            client: reqwest::Client::new(),
            keys,
            clock,
            breaker,
        }
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    async fn attempt(&self, evidence: &Evidence, slo: &Value) -> Attempt {
        let ts = self.clock.epoch();
        let nonce = uuid::Uuid::new_v4().to_string();
        let body = json!({
            "evidence": evidence.as_map(),
            "slo": slo,
            "ts": ts,
            "nonce": nonce,
        });
        let signed = match &self.config.key_id {
            Some(key_id) => self
                .keys
                .sign(&body, key_id)
                .map(|signature| (key_id.clone(), signature)),
            None => self.keys.sign_with_active(&body),
        };
        let (key_id, signature) = match signed {
            Ok(signed) => signed,
            Err(e) => return Attempt::Done(Err(ProviderError::Signing(e))),
        };

        let sent = self
            .client
            .post(&self.config.url)
            .timeout(self.config.request_timeout)
            .header(HEADER_KEY_ID, key_id)
            .header(HEADER_SIGNATURE, signature)
            .header(HEADER_NONCE, nonce)
            .header(HEADER_TIMESTAMP, ts.to_string())
            .json(&body)
            .send()
            .await;

        let resp = match sent {
            Ok(resp) => resp,
            Err(e) => return Attempt::Retry(ProviderError::Transport(e.to_string())),
        };
        let status = resp.status();
        if status.is_server_error() {
            return Attempt::Retry(ProviderError::Status {
                status: status.as_u16(),
            });
        }
        if !status.is_success() {
            return Attempt::Done(Err(ProviderError::Status {
                status: status.as_u16(),
            }));
        }
        match resp.json::<Verdict>().await {
            Ok(verdict) => Attempt::Done(Ok(verdict)),
            Err(e) => Attempt::Done(Err(ProviderError::InvalidResponse(e.to_string()))),
        }
    }
}

#[async_trait]
impl JudgeProvider for HttpJudge {
    fn id(&self) -> &str {
        &self.config.id
    }

    async fn evaluate(&self, evidence: &Evidence, slo: &SloSpec) -> Result<Verdict, ProviderError> {
        if !self.breaker.allow() {
            debug!(judge = %self.config.id, "circuit open, skipping remote judge");
            return Err(ProviderError::CircuitOpen);
        }
        let slo = serde_json::to_value(slo)
            .map_err(|e| ProviderError::InvalidResponse(format!("slo encoding: {e}")))?;

        let attempts = self.config.max_attempts.max(1);
        let mut delay = self.config.backoff_base;
        let mut last_err = ProviderError::Transport("no attempt made".to_string());

        for attempt in 1..=attempts {
            match self.attempt(evidence, &slo).await {
                Attempt::Done(result) => {
                    match &result {
                        Ok(_) => self.breaker.record_success(),
                        Err(_) => self.breaker.record_failure(),
                    }
                    return result;
                }
                Attempt::Retry(err) => {
                    warn!(judge = %self.config.id, attempt, error = %err, "remote judge attempt failed");
                    last_err = err;
                    if attempt < attempts {
                        tokio::time::sleep(delay).await;
                        delay *= 2;
                    }
                }
            }
        }

        self.breaker.record_failure();
        Err(last_err)
    }
}
