//! Key store rotation, grace, degradation and source priority.

use std::path::Path;
use std::sync::Arc;

use judge_core::keys::{
    KeySources, KeyState, KeyStore, KeyStoreConfig, RefreshOutcome, SigningKey,
};
use judge_core::readiness::check_readiness;
use judge_core::replay::{ReplayGuard, ReplayGuardConfig};
use judge_core::{AuthError, Counters, ManualClock};
use judge_state::fakes::MemoryReplayStore;
use serde_json::{json, Value};

const T0: i64 = 1_760_000_000;

fn write_keys(path: &Path, doc: Value) {
    std::fs::write(path, doc.to_string()).unwrap();
}

fn file_store(path: &Path, config: KeyStoreConfig) -> (KeyStore, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::at_epoch(T0));
    let store = KeyStore::new(KeySources::new().with_file(path), config, clock.clone());
    (store, clock)
}

fn payload() -> Value {
    json!({"evidence": {"meta": {"tenant": "acme"}}, "slo": {"version": "v1"}, "nonce": "n-1"})
}

#[tokio::test]
async fn sign_verify_and_flipped_bit() {
    let store = KeyStore::with_keys(
        vec![SigningKey::new("k1", b"alpha".to_vec(), KeyState::Active)],
        Arc::new(ManualClock::at_epoch(T0)),
    );
    let sig = store.sign(&payload(), "k1").unwrap();
    assert_eq!(store.verify(&payload(), &sig, "k1"), Ok(KeyState::Active));

    // flip the lowest bit of the first byte
    let mut bytes = hex::decode(&sig).unwrap();
    bytes[0] ^= 0x01;
    let flipped = hex::encode(bytes);
    assert_eq!(
        store.verify(&payload(), &flipped, "k1"),
        Err(AuthError::SignatureMismatch)
    );
    assert_eq!(
        store.verify(&payload(), "not-hex", "k1"),
        Err(AuthError::SignatureMismatch)
    );
    assert_eq!(
        store.verify(&payload(), &sig, "k9"),
        Err(AuthError::UnknownKey)
    );

    // key order in the payload does not matter
    let reordered: Value =
        serde_json::from_str(r#"{"slo":{"version":"v1"},"nonce":"n-1","evidence":{"meta":{"tenant":"acme"}}}"#)
            .unwrap();
    assert_eq!(store.verify(&reordered, &sig, "k1"), Ok(KeyState::Active));
}

#[tokio::test]
async fn grace_key_verifies_until_expiry_then_unknown() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("keys.json");
    write_keys(&path, json!([{"key_id": "k1", "secret": "first"}]));
    let (store, clock) = file_store(&path, KeyStoreConfig::default());

    assert_eq!(store.refresh().await, RefreshOutcome::Loaded { keys: 1 });
    let old_sig = store.sign(&payload(), "k1").unwrap();

    write_keys(&path, json!({"keys": [{"key_id": "k2", "secret": "hex:7365636f6e64"}]}));
    assert_eq!(
        store.refresh().await,
        RefreshOutcome::Rotated {
            keys: 1,
            grace_keys: 1
        }
    );
    assert_eq!(store.verify(&payload(), &old_sig, "k1"), Ok(KeyState::Grace));
    assert_eq!(store.status().grace_keys_count, 1);

    clock.advance_secs(59);
    assert_eq!(store.verify(&payload(), &old_sig, "k1"), Ok(KeyState::Grace));

    clock.advance_secs(2);
    assert_eq!(
        store.verify(&payload(), &old_sig, "k1"),
        Err(AuthError::UnknownKey)
    );
    assert_eq!(store.status().grace_keys_count, 0);

    let new_sig = store.sign(&payload(), "k2").unwrap();
    assert_eq!(store.verify(&payload(), &new_sig, "k2"), Ok(KeyState::Active));
}

#[tokio::test]
async fn unchanged_material_does_not_rotate() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("keys.json");
    write_keys(&path, json!([{"key_id": "k1", "secret": "same"}]));
    let (store, _clock) = file_store(&path, KeyStoreConfig::default());

    store.refresh().await;
    assert_eq!(store.refresh().await, RefreshOutcome::Unchanged);
    assert_eq!(store.status().grace_keys_count, 0);
    assert!(store.status().fingerprint.is_some());
}

#[tokio::test]
async fn degraded_store_hard_fails_and_readiness_reports_it() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("keys.json");
    write_keys(&path, json!([{"key_id": "k1", "secret": "s"}]));
    let (store, clock) = file_store(&path, KeyStoreConfig::default());
    store.refresh().await;
    let sig = store.sign(&payload(), "k1").unwrap();

    std::fs::remove_file(&path).unwrap();
    assert!(matches!(
        store.refresh().await,
        RefreshOutcome::Degraded { .. }
    ));
    assert!(store.is_degraded());
    assert_eq!(
        store.verify(&payload(), &sig, "k1"),
        Err(AuthError::KeysUnavailable)
    );
    assert_eq!(AuthError::KeysUnavailable.status_code(), 503);

    let replay = ReplayGuard::new(
        Arc::new(MemoryReplayStore::new()),
        ReplayGuardConfig::default(),
        clock.clone(),
        Arc::new(Counters::new()),
    );
    let report = check_readiness(&store, &replay, clock.as_ref()).await;
    assert_eq!(report.status_code(), 503);
    assert_eq!(report.reason_codes, vec!["keys:degraded"]);
    assert!(report.checks.keys.last_error.is_some());

    // keys come back
    write_keys(&path, json!([{"key_id": "k1", "secret": "s"}]));
    assert_eq!(store.refresh().await, RefreshOutcome::Unchanged);
    assert_eq!(store.verify(&payload(), &sig, "k1"), Ok(KeyState::Active));
    assert!(check_readiness(&store, &replay, clock.as_ref()).await.is_ready());
}

#[tokio::test]
async fn stale_allowance_serves_last_good_set_for_a_while() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("keys.json");
    write_keys(&path, json!([{"key_id": "k1", "secret": "s"}]));
    let config = KeyStoreConfig {
        stale_allowance_sec: 120,
        ..KeyStoreConfig::default()
    };
    let (store, clock) = file_store(&path, config);
    store.refresh().await;
    let sig = store.sign(&payload(), "k1").unwrap();

    clock.advance_secs(30);
    std::fs::remove_file(&path).unwrap();
    store.refresh().await;
    assert_eq!(store.verify(&payload(), &sig, "k1"), Ok(KeyState::Active));
    assert!(store.status().degraded);

    clock.advance_secs(100);
    assert_eq!(
        store.verify(&payload(), &sig, "k1"),
        Err(AuthError::KeysUnavailable)
    );
}

#[tokio::test]
async fn retired_and_expired_keys_never_verify() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("keys.json");
    write_keys(
        &path,
        json!([
            {"key_id": "old", "secret": "s-old", "state": "retired"},
            {"key_id": "expired", "secret": "s-exp", "not_after": "2020-01-01T00:00:00Z"},
            {"key_id": "future", "secret": "s-fut", "not_before": "2030-01-01T00:00:00Z"}
        ]),
    );
    let (store, _clock) = file_store(&path, KeyStoreConfig::default());
    store.refresh().await;

    // sign the same payload with active twins of each secret
    let twins = KeyStore::with_keys(
        vec![
            SigningKey::new("old", b"s-old".to_vec(), KeyState::Active),
            SigningKey::new("expired", b"s-exp".to_vec(), KeyState::Active),
            SigningKey::new("future", b"s-fut".to_vec(), KeyState::Active),
        ],
        Arc::new(ManualClock::at_epoch(T0)),
    );
    for id in ["old", "expired", "future"] {
        let sig = twins.sign(&payload(), id).unwrap();
        assert_eq!(
            store.verify(&payload(), &sig, id),
            Err(AuthError::KeyRetired),
            "{id}"
        );
    }
    // no active key to sign with
    assert_eq!(
        store.sign_with_active(&payload()),
        Err(AuthError::KeysUnavailable)
    );
}

#[tokio::test]
async fn override_beats_file_per_key_id() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("keys.json");
    write_keys(
        &path,
        json!([{"key_id": "k1", "secret": "from-file"}, {"key_id": "k2", "secret": "file-only"}]),
    );
    let clock = Arc::new(ManualClock::at_epoch(T0));
    let sources = KeySources::new()
        .with_file(&path)
        .with_override(vec![SigningKey::new("k1", b"from-override".to_vec(), KeyState::Active)]);
    assert_eq!(sources.names()[0], "override");
    let store = KeyStore::new(sources, KeyStoreConfig::default(), clock.clone());
    assert_eq!(store.refresh().await, RefreshOutcome::Loaded { keys: 2 });

    let reference = KeyStore::with_keys(
        vec![SigningKey::new("k1", b"from-override".to_vec(), KeyState::Active)],
        clock,
    );
    let sig = reference.sign(&payload(), "k1").unwrap();
    assert_eq!(store.verify(&payload(), &sig, "k1"), Ok(KeyState::Active));
    assert_eq!(store.sign_with_active(&payload()).unwrap().0, "k1");
}

#[tokio::test]
async fn env_source_accepts_pairs_and_legacy_secret() {
    std::env::set_var("JUDGE_TEST_KEYS_PAIRS", "a:hex:6869, b:plain");
    let clock = Arc::new(ManualClock::at_epoch(T0));
    let store = KeyStore::new(
        KeySources::new().with_env("JUDGE_TEST_KEYS_PAIRS", None),
        KeyStoreConfig::default(),
        clock.clone(),
    );
    assert_eq!(store.refresh().await, RefreshOutcome::Loaded { keys: 2 });

    let reference = KeyStore::with_keys(
        vec![SigningKey::new("a", b"hi".to_vec(), KeyState::Active)],
        clock.clone(),
    );
    let sig = reference.sign(&payload(), "a").unwrap();
    assert_eq!(store.verify(&payload(), &sig, "a"), Ok(KeyState::Active));

    std::env::set_var("JUDGE_TEST_LEGACY_SECRET", "legacy-secret");
    let legacy = KeyStore::new(
        KeySources::new().with_env(
            "JUDGE_TEST_KEYS_UNSET",
            Some("JUDGE_TEST_LEGACY_SECRET".to_string()),
        ),
        KeyStoreConfig::default(),
        clock,
    );
    legacy.refresh().await;
    assert_eq!(legacy.status().keys_count, 1);
    assert_eq!(legacy.sign_with_active(&payload()).unwrap().0, "legacy");
}
