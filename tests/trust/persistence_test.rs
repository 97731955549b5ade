//! Restart durability: the engine exposes identical records after reopen.

use std::sync::Arc;
use std::time::Duration;

use clarad::bus::EventBus;
use clarad::caps::RecordingCaps;
use clarad::store::TrustStore;
use clarad::trust::TrustEngine;
use clarad::types::ViolationKind;

fn engine(dir: &std::path::Path, caps: Arc<RecordingCaps>) -> TrustEngine {
    let store = Arc::new(
        TrustStore::open(&dir.join("trust.json"), &dir.join("violations.jsonl")).expect("store"),
    );
    let (bus, _dispatcher) = EventBus::new(
        256,
        Duration::from_millis(50),
        Duration::from_secs(2),
    );
    TrustEngine::new(store, caps, bus)
}

fn scripted_caps() -> Arc<RecordingCaps> {
    let caps = Arc::new(RecordingCaps::new());
    caps.set_installer("com.shop.app", "com.android.vending");
    caps.set_installer("com.media.app", "org.fdroid.fdroid");
    caps.set_uid("com.evil.app", 10700);
    caps
}

#[tokio::test]
async fn reopened_engine_exposes_identical_records() {
    let dir = tempfile::tempdir().expect("tempdir");

    let before = {
        let engine = engine(dir.path(), scripted_caps());

        engine.register("com.shop.app").await.expect("register");
        engine.register("com.media.app").await.expect("register");
        engine.on_install("com.evil.app").await.expect("on_install");
        engine
            .record_violation("com.shop.app", ViolationKind::ClipboardSnoop, "ctx")
            .await
            .expect("violation");
        engine
            .whitelist("com.media.app", true)
            .await
            .expect("whitelist");
        engine.flush().expect("flush");

        serde_json::to_value(engine.all()).expect("serialize")
    };

    let engine = engine(dir.path(), scripted_caps());
    let after = serde_json::to_value(engine.all()).expect("serialize");

    assert_eq!(before, after);
}

#[tokio::test]
async fn ledger_survives_reopen_in_id_order() {
    let dir = tempfile::tempdir().expect("tempdir");

    {
        let engine = engine(dir.path(), scripted_caps());
        engine.register("com.shop.app").await.expect("register");
        for kind in [
            ViolationKind::SmsRead,
            ViolationKind::GalleryScan,
            ViolationKind::BootStart,
        ] {
            engine
                .record_violation("com.shop.app", kind, "")
                .await
                .expect("violation");
        }
    }

    let engine = engine(dir.path(), scripted_caps());
    let recent = engine.recent_violations(10).expect("recent");
    assert_eq!(recent.len(), 3);
    assert_eq!(recent[0].id, 3, "newest first");
    assert_eq!(recent[0].kind, ViolationKind::BootStart);

    // New violations continue the id sequence.
    engine
        .record_violation("com.shop.app", ViolationKind::OverlayUsage, "")
        .await
        .expect("violation");
    let recent = engine.recent_violations(1).expect("recent");
    assert_eq!(recent[0].id, 4);
}

#[tokio::test]
async fn stats_reflect_store_contents() {
    let dir = tempfile::tempdir().expect("tempdir");
    let engine = engine(dir.path(), scripted_caps());

    engine.register("com.shop.app").await.expect("register");
    engine.on_install("com.evil.app").await.expect("on_install");
    engine
        .record_violation("com.shop.app", ViolationKind::BootStart, "")
        .await
        .expect("violation");

    let stats = engine.stats();
    assert_eq!(stats.total_apps, 2);
    assert_eq!(stats.trusted_apps, 0, "shop dropped to 75 after violation");
    assert_eq!(stats.quarantined_apps, 1);
    assert_eq!(stats.total_violations, 1);
}
