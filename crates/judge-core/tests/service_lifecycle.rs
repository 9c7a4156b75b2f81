//! Judge orchestrator lifecycle: every exit path, one observation each.

use std::collections::HashMap;
use std::sync::Arc;

use judge_core::auth::{HEADER_KEY_ID, HEADER_NONCE, HEADER_SIGNATURE, HEADER_TIMESTAMP};
use judge_core::keys::{KeyState, KeyStore, SigningKey};
use judge_core::replay::{ReplayGuard, ReplayGuardConfig};
use judge_core::{
    AuthError, Counters, Decision, Evidence, JudgeError, JudgeService, ManualClock,
    SlidingWindow, StaticAllowList,
};
use judge_state::fakes::{FailingReplayStore, MemoryReplayStore};
use judge_state::ReplayStore;
use serde_json::{json, Value};

const NOW: i64 = 1_760_000_000;

struct Harness {
    service: JudgeService,
    keys: Arc<KeyStore>,
    clock: Arc<ManualClock>,
    window: Arc<SlidingWindow>,
    counters: Arc<Counters>,
}

fn harness_with(store: Arc<dyn ReplayStore>) -> Harness {
    let clock = Arc::new(ManualClock::at_epoch(NOW));
    let keys = Arc::new(KeyStore::with_keys(
        vec![
            SigningKey::new("deployer", b"deploy-secret".to_vec(), KeyState::Active),
            SigningKey::new("intruder", b"other-secret".to_vec(), KeyState::Active),
        ],
        clock.clone(),
    ));
    let counters = Arc::new(Counters::new());
    let replay = Arc::new(ReplayGuard::new(
        store,
        ReplayGuardConfig::default(),
        clock.clone(),
        Arc::clone(&counters),
    ));
    let window = Arc::new(SlidingWindow::new(300, clock.clone()));
    let service = JudgeService::new(Arc::clone(&keys), replay, Arc::clone(&counters), clock.clone())
        .with_window(Arc::clone(&window))
        .with_authorizer(Arc::new(StaticAllowList::new(["deployer"])));
    Harness {
        service,
        keys,
        clock,
        window,
        counters,
    }
}

fn harness() -> Harness {
    harness_with(Arc::new(MemoryReplayStore::new()))
}

fn body() -> Value {
    let mut evidence = Evidence::from_value(json!({
        "meta": {"tenant": "acme", "stage": "canary-25"},
        "witness": {"csv_sha256": "c0ffee", "rows": 96},
        "usage": {"cpu_percent": 41.0},
        "rating": {"total": 88.1},
        "quota": {"decisions": {}},
        "budget": {"level": "ok", "spent": 10},
        "anomaly": {"is_spike": false},
        "integrity": {}
    }))
    .unwrap();
    evidence.seal();
    json!({"evidence": evidence, "slo": {"budget": {"allow_levels": ["ok"]}}})
}

struct Request {
    headers: HashMap<String, String>,
    body: Vec<u8>,
}

impl Request {
    fn signed(h: &Harness, key_id: &str, nonce: &str, ts: i64, body: &Value) -> Self {
        let signature = h.keys.sign(body, key_id).unwrap();
        let headers = [
            (HEADER_KEY_ID, key_id.to_string()),
            (HEADER_SIGNATURE, signature),
            (HEADER_NONCE, nonce.to_string()),
            (HEADER_TIMESTAMP, ts.to_string()),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();
        Self {
            headers,
            body: serde_json::to_vec(body).unwrap(),
        }
    }

    async fn send(&self, h: &Harness) -> Result<judge_core::JudgeResponse, JudgeError> {
        h.service
            .judge(|name| self.headers.get(name).map(String::as_str), &self.body)
            .await
    }
}

#[tokio::test]
async fn happy_path_returns_decision_with_iso_timestamp() {
    let h = harness();
    let resp = Request::signed(&h, "deployer", "n-1", NOW, &body())
        .send(&h)
        .await
        .unwrap();
    assert_eq!(resp.decision, Decision::Pass);
    assert!(resp.reasons.is_empty());
    assert_eq!(resp.ts, "2025-10-09T08:53:20Z");

    let summary = h.window.summary();
    assert_eq!(summary.count, 1);
    assert_eq!(summary.signature_error_rate, 0.0);
    assert_eq!(h.counters.snapshot().decisions_pass, 1);
}

#[tokio::test]
async fn evaluation_fail_is_a_200_decision_not_an_error() {
    let h = harness();
    let mut b = body();
    b["slo"] = json!({"budget": {"allow_levels": ["warn"]}});
    let resp = Request::signed(&h, "deployer", "n-1", NOW, &b)
        .send(&h)
        .await
        .unwrap();
    assert_eq!(resp.decision, Decision::Fail);
    assert_eq!(resp.reasons, vec!["budget.level_forbidden:ok"]);
    assert_eq!(h.window.summary().availability, 1.0);
}

#[tokio::test]
async fn every_exit_path_records_exactly_one_observation() {
    let h = harness();
    let b = body();
    let mut expected = 0;

    // malformed json
    let mut bad_json = Request::signed(&h, "deployer", "n-json", NOW, &b);
    bad_json.body = b"{not json".to_vec();
    let err = bad_json.send(&h).await.unwrap_err();
    assert_eq!((err.code(), err.status_code()), ("invalid_json", 400));
    expected += 1;
    assert_eq!(h.window.summary().count, expected);

    // missing headers
    let mut no_headers = Request::signed(&h, "deployer", "n-hdr", NOW, &b);
    no_headers.headers.remove(HEADER_NONCE);
    let err = no_headers.send(&h).await.unwrap_err();
    assert_eq!(err.code(), "missing_signature_headers");
    expected += 1;
    assert_eq!(h.window.summary().count, expected);

    // unparseable timestamp
    let mut bad_ts = Request::signed(&h, "deployer", "n-ts", NOW, &b);
    bad_ts.headers.insert(HEADER_TIMESTAMP.to_string(), "yesterday".to_string());
    let err = bad_ts.send(&h).await.unwrap_err();
    assert_eq!((err.code(), err.status_code()), ("invalid_timestamp", 400));
    expected += 1;

    // tampered body
    let mut tampered = Request::signed(&h, "deployer", "n-sig", NOW, &b);
    let mut changed = b.clone();
    changed["slo"] = json!({});
    tampered.body = serde_json::to_vec(&changed).unwrap();
    let err = tampered.send(&h).await.unwrap_err();
    assert!(matches!(err, JudgeError::Auth(AuthError::SignatureMismatch)));
    assert_eq!(err.status_code(), 401);
    expected += 1;

    // clock skew
    let err = Request::signed(&h, "deployer", "n-skew", NOW - 91, &b)
        .send(&h)
        .await
        .unwrap_err();
    assert_eq!((err.code(), err.status_code()), ("clock_skew", 401));
    expected += 1;

    // replay
    let first = Request::signed(&h, "deployer", "n-once", NOW, &b);
    first.send(&h).await.unwrap();
    expected += 1;
    let err = first.send(&h).await.unwrap_err();
    assert_eq!((err.code(), err.status_code()), ("replay_rejected", 401));
    expected += 1;

    // authorization
    let err = Request::signed(&h, "intruder", "n-authz", NOW, &b)
        .send(&h)
        .await
        .unwrap_err();
    assert_eq!((err.code(), err.status_code()), ("forbidden", 403));
    expected += 1;

    // invalid payload, signed correctly
    let err = Request::signed(&h, "deployer", "n-payload", NOW, &json!({"evidence": {}}))
        .send(&h)
        .await
        .unwrap_err();
    assert_eq!((err.code(), err.status_code()), ("invalid_payload", 400));
    expected += 1;

    // invalid SLO document
    let mut bad_slo = b.clone();
    bad_slo["slo"] = json!({"quorum": {"k": 0, "n": 3}});
    let err = Request::signed(&h, "deployer", "n-slo", NOW, &bad_slo)
        .send(&h)
        .await
        .unwrap_err();
    assert_eq!(err.code(), "invalid_payload");
    expected += 1;

    let summary = h.window.summary();
    assert_eq!(summary.count, expected);
    // signature mismatch, skew and replay carry the signature flag
    assert_eq!(summary.signature_error_rate, (3.0 / expected as f64 * 1e6).round() / 1e6);

    let counters = h.counters.snapshot();
    assert_eq!(counters.requests, expected as u64);
    assert_eq!(counters.decisions_pass, 1);
    assert_eq!(counters.rejected_invalid, 5);
    assert_eq!(counters.rejected_auth, 2);
    assert_eq!(counters.rejected_replay, 1);
    assert_eq!(counters.rejected_authz, 1);
}

#[tokio::test]
async fn skew_boundary_is_inclusive() {
    let h = harness();
    let b = body();
    assert!(Request::signed(&h, "deployer", "n-89", NOW - 89, &b)
        .send(&h)
        .await
        .is_ok());
    assert!(Request::signed(&h, "deployer", "n-90", NOW + 90, &b)
        .send(&h)
        .await
        .is_ok());
}

#[tokio::test]
async fn replay_backend_failure_rejects() {
    let h = harness_with(Arc::new(FailingReplayStore::default()));
    let err = Request::signed(&h, "deployer", "n-1", NOW, &body())
        .send(&h)
        .await
        .unwrap_err();
    assert_eq!(err.code(), "replay_rejected");
    assert_eq!(err.status_code(), 401);
    assert_eq!(h.counters.replay_backend_failures(), 1);
    assert_eq!(h.window.summary().count, 1);
}

#[tokio::test]
async fn degraded_keys_return_503() {
    let h = harness();
    let req = Request::signed(&h, "deployer", "n-1", NOW, &body());
    let degraded = JudgeService::new(
        Arc::new(KeyStore::with_keys(Vec::new(), h.clock.clone())),
        h.service.replay().clone(),
        Arc::clone(&h.counters),
        h.clock.clone(),
    )
    .with_window(Arc::clone(&h.window));
    let err = degraded
        .judge(|name| req.headers.get(name).map(String::as_str), &req.body)
        .await
        .unwrap_err();
    assert_eq!((err.code(), err.status_code()), ("keys_unavailable", 503));
    assert_eq!(err.body()["detail"], "signing keys unavailable");
    assert_eq!(h.window.summary().availability, 0.0);
}

fn bound_body(nonce: &str, ts: i64) -> Value {
    let mut b = body();
    b["nonce"] = json!(nonce);
    b["ts"] = json!(ts);
    b
}

#[tokio::test]
async fn captured_body_under_fresh_nonce_is_rejected() {
    let h = harness();
    let b = bound_body("n-1", NOW);
    let original = Request::signed(&h, "deployer", "n-1", NOW, &b);
    original.send(&h).await.unwrap();

    // same signed bytes, new nonce header
    let mut resent = Request::signed(&h, "deployer", "n-1", NOW, &b);
    resent
        .headers
        .insert(HEADER_NONCE.to_string(), "n-fresh".to_string());
    let err = resent.send(&h).await.unwrap_err();
    assert!(matches!(err, JudgeError::Auth(AuthError::SignatureMismatch)));
    assert_eq!(err.status_code(), 401);

    // same signed bytes, shifted timestamp header
    let mut shifted = Request::signed(&h, "deployer", "n-2", NOW, &bound_body("n-2", NOW));
    shifted
        .headers
        .insert(HEADER_TIMESTAMP.to_string(), (NOW + 30).to_string());
    let err = shifted.send(&h).await.unwrap_err();
    assert_eq!(err.code(), "signature_mismatch");

    let summary = h.window.summary();
    assert_eq!(summary.count, 3);
    assert_eq!(h.counters.snapshot().rejected_auth, 2);
}

#[tokio::test]
async fn required_nonce_refuses_unbound_bodies() {
    let h = harness();
    let strict = h.service.clone().with_signed_nonce_required(true);

    let unbound = Request::signed(&h, "deployer", "n-1", NOW, &body());
    let err = strict
        .judge(|name| unbound.headers.get(name).map(String::as_str), &unbound.body)
        .await
        .unwrap_err();
    assert_eq!(err.code(), "signature_mismatch");

    let bound = Request::signed(&h, "deployer", "n-2", NOW, &bound_body("n-2", NOW));
    let resp = strict
        .judge(|name| bound.headers.get(name).map(String::as_str), &bound.body)
        .await
        .unwrap();
    assert_eq!(resp.decision, Decision::Pass);
}
