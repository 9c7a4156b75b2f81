//! Drives the daemon router over real HTTP on an ephemeral port.

use std::sync::Arc;

use judge_core::auth::{HEADER_KEY_ID, HEADER_NONCE, HEADER_SIGNATURE, HEADER_TIMESTAMP};
use judge_core::keys::{KeyState, SigningKey};
use judge_core::{
    Counters, Evidence, JudgeService, KeyStore, ManualClock, ReplayGuard, ReplayGuardConfig,
};
use judge_state::fakes::MemoryReplayStore;
use serde_json::{json, Value};
use tokio::sync::oneshot;

const NOW: i64 = 1_760_000_000;

struct Daemon {
    base: String,
    keys: Arc<KeyStore>,
    client: reqwest::Client,
    stop: Option<oneshot::Sender<()>>,
    server: tokio::task::JoinHandle<()>,
}

impl Daemon {
    async fn start(signing_keys: Vec<SigningKey>) -> Self {
        let clock = Arc::new(ManualClock::at_epoch(NOW));
        let keys = Arc::new(KeyStore::with_keys(signing_keys, clock.clone()));
        let counters = Arc::new(Counters::new());
        let replay = Arc::new(ReplayGuard::new(
            Arc::new(MemoryReplayStore::new()),
            ReplayGuardConfig::default(),
            clock.clone(),
            Arc::clone(&counters),
        ));
        let service = JudgeService::new(Arc::clone(&keys), replay, counters, clock);

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("addr");
        let (tx, rx) = oneshot::channel::<()>();
        let server = tokio::spawn(async move {
            let _ = judged::serve(listener, service, async move {
                let _ = rx.await;
            })
            .await;
        });

        Self {
            base: format!("http://{addr}"),
            keys,
            client: reqwest::Client::new(),
            stop: Some(tx),
            server,
        }
    }

    async fn with_deployer() -> Self {
        Self::start(vec![SigningKey::new(
            "deployer",
            b"deploy-secret".to_vec(),
            KeyState::Active,
        )])
        .await
    }

    async fn post_signed(&self, body: &Value, nonce: &str) -> reqwest::Response {
        let signature = self.keys.sign(body, "deployer").unwrap_or_default();
        self.client
            .post(format!("{}/judge", self.base))
            .header(HEADER_KEY_ID, "deployer")
            .header(HEADER_SIGNATURE, signature)
            .header(HEADER_NONCE, nonce)
            .header(HEADER_TIMESTAMP, NOW.to_string())
            .header("content-type", "application/json")
            .body(serde_json::to_vec(body).unwrap())
            .send()
            .await
            .expect("request")
    }

    async fn get(&self, path: &str) -> (u16, Value) {
        let resp = self
            .client
            .get(format!("{}{path}", self.base))
            .send()
            .await
            .expect("request");
        let status = resp.status().as_u16();
        (status, resp.json().await.expect("json body"))
    }

    async fn stop(mut self) {
        if let Some(tx) = self.stop.take() {
            let _ = tx.send(());
        }
        let _ = self.server.await;
    }
}

fn body() -> Value {
    let mut evidence = Evidence::from_value(json!({
        "meta": {"tenant": "acme"},
        "witness": {"csv_sha256": "ab12", "rows": 42},
        "usage": {"cpu_percent": 20.0},
        "rating": {},
        "quota": {},
        "budget": {"level": "ok"},
        "anomaly": {"is_spike": false},
        "integrity": {}
    }))
    .unwrap();
    evidence.seal();
    json!({"evidence": evidence, "slo": {"budget": {"allow_levels": ["ok"]}}})
}

#[tokio::test]
async fn judge_then_replay_is_rejected() {
    let daemon = Daemon::with_deployer().await;

    let resp = daemon.post_signed(&body(), "n-1").await;
    assert_eq!(resp.status().as_u16(), 200);
    let decided: Value = resp.json().await.unwrap();
    assert_eq!(decided["decision"], "pass");
    assert_eq!(decided["reasons"], json!([]));
    assert_eq!(decided["ts"], "2025-10-09T08:53:20Z");

    let resp = daemon.post_signed(&body(), "n-1").await;
    assert_eq!(resp.status().as_u16(), 401);
    let err: Value = resp.json().await.unwrap();
    assert_eq!(err, json!({"error": "replay_rejected", "detail": "replay detected"}));

    daemon.stop().await;
}

#[tokio::test]
async fn unsigned_request_is_a_400() {
    let daemon = Daemon::with_deployer().await;
    let resp = daemon
        .client
        .post(format!("{}/judge", daemon.base))
        .body(serde_json::to_vec(&body()).unwrap())
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 400);
    let err: Value = resp.json().await.unwrap();
    assert_eq!(err["error"], "missing_signature_headers");
    daemon.stop().await;
}

#[tokio::test]
async fn tampered_body_is_a_401_with_generic_detail() {
    let daemon = Daemon::with_deployer().await;
    let signature = daemon.keys.sign(&body(), "deployer").unwrap();
    let mut tampered = body();
    tampered["slo"] = json!({});
    let resp = daemon
        .client
        .post(format!("{}/judge", daemon.base))
        .header(HEADER_KEY_ID, "deployer")
        .header(HEADER_SIGNATURE, signature)
        .header(HEADER_NONCE, "n-2")
        .header(HEADER_TIMESTAMP, NOW.to_string())
        .body(serde_json::to_vec(&tampered).unwrap())
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 401);
    let err: Value = resp.json().await.unwrap();
    assert_eq!(err["detail"], "invalid signature");
    daemon.stop().await;
}

#[tokio::test]
async fn resent_body_with_new_nonce_is_a_401() {
    let daemon = Daemon::with_deployer().await;
    let mut signed = body();
    signed["nonce"] = json!("n-7");
    signed["ts"] = json!(NOW);

    assert_eq!(daemon.post_signed(&signed, "n-7").await.status().as_u16(), 200);

    let resp = daemon.post_signed(&signed, "n-8").await;
    assert_eq!(resp.status().as_u16(), 401);
    let err: Value = resp.json().await.unwrap();
    assert_eq!(err, json!({"error": "signature_mismatch", "detail": "invalid signature"}));

    daemon.stop().await;
}

#[tokio::test]
async fn health_ready_and_metrics() {
    let daemon = Daemon::with_deployer().await;

    assert_eq!(daemon.get("/healthz").await, (200, json!({"status": "ok"})));

    let (status, ready) = daemon.get("/readyz").await;
    assert_eq!(status, 200);
    assert_eq!(ready["status"], "ready");
    assert_eq!(ready["checks"]["replay_store"]["ok"], true);
    assert_eq!(ready["reason_codes"], json!([]));

    assert_eq!(daemon.post_signed(&body(), "n-1").await.status().as_u16(), 200);
    assert_eq!(daemon.post_signed(&body(), "n-1").await.status().as_u16(), 401);

    let (status, summary) = daemon.get("/metrics").await;
    assert_eq!(status, 200);
    assert_eq!(summary["count"], 2);
    assert_eq!(summary["availability"], 1.0);
    assert_eq!(summary["signature_error_rate"], 0.5);
    assert_eq!(summary["window"]["seconds"], 300);

    daemon.stop().await;
}

#[tokio::test]
async fn no_keys_means_not_ready_and_503() {
    let daemon = Daemon::start(Vec::new()).await;

    let (status, ready) = daemon.get("/readyz").await;
    assert_eq!(status, 503);
    assert_eq!(ready["status"], "degraded");
    assert_eq!(ready["reason_codes"], json!(["keys:missing"]));

    let resp = daemon
        .client
        .post(format!("{}/judge", daemon.base))
        .header(HEADER_KEY_ID, "deployer")
        .header(HEADER_SIGNATURE, "00")
        .header(HEADER_NONCE, "n-1")
        .header(HEADER_TIMESTAMP, NOW.to_string())
        .body(serde_json::to_vec(&body()).unwrap())
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 503);
    let err: Value = resp.json().await.unwrap();
    assert_eq!(err["error"], "keys_unavailable");

    daemon.stop().await;
}

#[tokio::test]
async fn oversized_body_is_refused_and_observed() {
    let daemon = Daemon::with_deployer().await;
    let resp = daemon
        .client
        .post(format!("{}/judge", daemon.base))
        .body(vec![b' '; judged::MAX_BODY_BYTES + 1])
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 413);

    let (_, summary) = daemon.get("/metrics").await;
    assert_eq!(summary["count"], 1);
    assert_eq!(summary["availability"], 1.0);
    assert_eq!(summary["error_rate"], 0.0);
    daemon.stop().await;
}
