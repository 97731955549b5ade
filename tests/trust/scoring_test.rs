//! Score arithmetic, status bands, ledger consistency, and band
//! enforcement.

use std::sync::Arc;
use std::time::Duration;

use clarad::bus::EventBus;
use clarad::caps::{CapCall, RecordingCaps};
use clarad::store::TrustStore;
use clarad::trust::TrustEngine;
use clarad::types::{AppStatus, ViolationKind};

fn engine(dir: &std::path::Path, caps: Arc<RecordingCaps>) -> (TrustEngine, Arc<TrustStore>) {
    let store = Arc::new(
        TrustStore::open(&dir.join("trust.json"), &dir.join("violations.jsonl")).expect("store"),
    );
    let (bus, _dispatcher) = EventBus::new(
        256,
        Duration::from_millis(50),
        Duration::from_secs(2),
    );
    (
        TrustEngine::new(Arc::clone(&store), caps, bus),
        store,
    )
}

fn play_store_caps(package: &str) -> Arc<RecordingCaps> {
    let caps = Arc::new(RecordingCaps::new());
    caps.set_installer(package, "com.android.vending");
    caps.set_uid(package, 10300);
    caps
}

#[tokio::test]
async fn repeated_violations_walk_down_the_bands() {
    let dir = tempfile::tempdir().expect("tempdir");
    let caps = play_store_caps("com.shop.app");
    let (engine, _store) = engine(dir.path(), Arc::clone(&caps));

    let record = engine.register("com.shop.app").await.expect("register");
    assert_eq!(record.score, 80);
    assert_eq!(record.status, AppStatus::Trusted);

    let expected = [(70, AppStatus::Normal), (60, AppStatus::Normal), (50, AppStatus::Normal)];
    for (score, status) in expected {
        engine
            .record_violation("com.shop.app", ViolationKind::BackgroundLocation, "")
            .await
            .expect("violation");
        let record = engine.info("com.shop.app").await.expect("record");
        assert_eq!(record.score, score);
        assert_eq!(record.status, status);
    }

    // Fourth violation drops into the suspicious band.
    caps.clear_calls();
    engine
        .record_violation("com.shop.app", ViolationKind::BackgroundLocation, "")
        .await
        .expect("violation");
    let record = engine.info("com.shop.app").await.expect("record");
    assert_eq!(record.score, 40);
    assert_eq!(record.status, AppStatus::Suspicious);

    let revoked: Vec<String> = caps
        .calls()
        .into_iter()
        .filter_map(|c| match c {
            CapCall::Revoke { permission, .. } => Some(permission),
            _ => None,
        })
        .collect();
    assert!(revoked.contains(&"android.permission.CAMERA".to_owned()));
    assert!(revoked.contains(&"android.permission.RECORD_AUDIO".to_owned()));
    assert!(revoked.contains(&"android.permission.READ_CONTACTS".to_owned()));
}

#[tokio::test]
async fn score_is_the_clamped_fold_of_all_transitions() {
    let dir = tempfile::tempdir().expect("tempdir");
    let caps = play_store_caps("com.shop.app");
    let (engine, _store) = engine(dir.path(), Arc::clone(&caps));
    engine.register("com.shop.app").await.expect("register");

    // Mixed sequence; deltas are applied with clamping at every step.
    let ops: Vec<i32> = vec![-30, 5, -20, 3, -30, 2, 10, -5];
    let mut model = 80i32;
    for delta in &ops {
        if *delta < 0 {
            let kind = match delta {
                -30 => ViolationKind::HiddenCamera,
                -20 => ViolationKind::SmsRead,
                -5 => ViolationKind::BootStart,
                _ => unreachable!(),
            };
            engine
                .record_violation("com.shop.app", kind, "")
                .await
                .expect("violation");
            model = (model + delta).max(0);
        } else {
            engine
                .reward_good_behavior("com.shop.app", *delta)
                .await
                .expect("reward");
            model = (model + delta).min(95);
        }
        let record = engine.info("com.shop.app").await.expect("record");
        assert_eq!(record.score, model);
        // Status is always the derivation of the score.
        assert_eq!(record.status, AppStatus::from_score(record.score));
    }
}

#[tokio::test]
async fn reward_never_exceeds_source_ceiling() {
    let dir = tempfile::tempdir().expect("tempdir");
    let caps = play_store_caps("com.shop.app");
    let (engine, _store) = engine(dir.path(), caps);
    engine.register("com.shop.app").await.expect("register");

    for _ in 0..20 {
        engine
            .reward_good_behavior("com.shop.app", 2)
            .await
            .expect("reward");
    }
    let record = engine.info("com.shop.app").await.expect("record");
    assert_eq!(record.score, 95, "play store ceiling");
}

#[tokio::test]
async fn ledger_has_one_entry_per_successful_violation() {
    let dir = tempfile::tempdir().expect("tempdir");
    let caps = play_store_caps("com.shop.app");
    let (engine, store) = engine(dir.path(), caps);
    engine.register("com.shop.app").await.expect("register");

    for _ in 0..5 {
        engine
            .record_violation("com.shop.app", ViolationKind::ClipboardSnoop, "")
            .await
            .expect("violation");
    }

    let ledger = store.violations_for("com.shop.app").expect("ledger");
    assert_eq!(ledger.len(), 5);
    let ids: Vec<u64> = ledger.iter().map(|v| v.id).collect();
    assert_eq!(ids, vec![1, 2, 3, 4, 5]);

    let record = engine.info("com.shop.app").await.expect("record");
    assert_eq!(record.violation_count, 5);
}

#[tokio::test]
async fn whitelisted_app_is_exempt_from_scoring() {
    let dir = tempfile::tempdir().expect("tempdir");
    let caps = play_store_caps("com.shop.app");
    let (engine, store) = engine(dir.path(), Arc::clone(&caps));

    engine.register("com.shop.app").await.expect("register");
    engine
        .whitelist("com.shop.app", true)
        .await
        .expect("whitelist");

    engine
        .record_violation("com.shop.app", ViolationKind::HiddenCamera, "")
        .await
        .expect("violation");
    engine
        .reward_good_behavior("com.shop.app", 5)
        .await
        .expect("reward");

    let record = engine.info("com.shop.app").await.expect("record");
    assert_eq!(record.score, 80, "whitelisted score never moves");
    assert!(store.violations_for("com.shop.app").expect("ledger").is_empty());
    assert!(caps.calls().is_empty(), "no enforcement against whitelisted");
}

#[tokio::test]
async fn system_app_is_exempt_from_scoring() {
    let dir = tempfile::tempdir().expect("tempdir");
    let caps = Arc::new(RecordingCaps::new());
    caps.set_path("com.android.phone", "/system/priv-app/Phone.apk");
    let (engine, store) = engine(dir.path(), Arc::clone(&caps));

    engine.register("com.android.phone").await.expect("register");
    engine
        .record_violation("com.android.phone", ViolationKind::SmsRead, "")
        .await
        .expect("violation");

    let record = engine.info("com.android.phone").await.expect("record");
    assert_eq!(record.score, 100);
    assert_eq!(record.status, AppStatus::System);
    assert!(store
        .violations_for("com.android.phone")
        .expect("ledger")
        .is_empty());
}

#[tokio::test]
async fn normal_band_revokes_precision_location_and_marks_fuzzy() {
    let dir = tempfile::tempdir().expect("tempdir");
    let caps = play_store_caps("com.shop.app");
    let (engine, _store) = engine(dir.path(), Arc::clone(&caps));
    engine.register("com.shop.app").await.expect("register");

    engine
        .record_violation("com.shop.app", ViolationKind::SmsRead, "")
        .await
        .expect("violation");

    let record = engine.info("com.shop.app").await.expect("record");
    assert_eq!(record.score, 60);
    assert!(record.fuzzy_location);
    assert_eq!(
        caps.calls(),
        vec![CapCall::Revoke {
            package: "com.shop.app".to_owned(),
            permission: "android.permission.ACCESS_FINE_LOCATION".to_owned(),
        }]
    );
}

#[tokio::test]
async fn enforcement_failure_keeps_ledger_and_score() {
    let dir = tempfile::tempdir().expect("tempdir");
    let caps = play_store_caps("com.shop.app");
    caps.deny("revoke");
    let (engine, store) = engine(dir.path(), caps);
    engine.register("com.shop.app").await.expect("register");

    engine
        .record_violation("com.shop.app", ViolationKind::SmsRead, "")
        .await
        .expect("violation succeeds despite enforcement failure");

    let record = engine.info("com.shop.app").await.expect("record");
    assert_eq!(record.score, 60, "score change persists");
    assert_eq!(store.violations_for("com.shop.app").expect("ledger").len(), 1);
}
