//! Install-time admission control: untrusted sources are quarantined on
//! sight, store-attributed installs are admitted.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use clarad::bus::EventBus;
use clarad::caps::{CapCall, RecordingCaps};
use clarad::store::TrustStore;
use clarad::trust::{Admission, TrustEngine};
use clarad::types::{AppStatus, EventKind, InstallSource};

fn engine_with_caps(dir: &std::path::Path, caps: Arc<RecordingCaps>) -> (TrustEngine, EventBus) {
    let store = Arc::new(
        TrustStore::open(&dir.join("trust.json"), &dir.join("violations.jsonl")).expect("store"),
    );
    let (bus, _dispatcher) = EventBus::new(
        256,
        Duration::from_millis(50),
        Duration::from_secs(2),
    );
    (TrustEngine::new(store, caps, bus.clone()), bus)
}

#[tokio::test]
async fn sideloaded_install_is_quarantined() {
    let dir = tempfile::tempdir().expect("tempdir");
    let caps = Arc::new(RecordingCaps::new());
    caps.set_path("com.evil.app", "/data/app/com.evil.app/base.apk");
    caps.set_uid("com.evil.app", 10422);
    // installer_of deliberately unscripted: resolves to "".

    let (engine, _bus) = engine_with_caps(dir.path(), Arc::clone(&caps));

    let admission = engine.on_install("com.evil.app").await.expect("on_install");
    assert_eq!(admission, Admission::Quarantined);

    let record = engine.info("com.evil.app").await.expect("record");
    assert_eq!(record.install_source, InstallSource::Sideload);
    assert_eq!(record.score, 20);
    assert_eq!(record.status, AppStatus::Quarantined);
    assert!(record.quarantined);
    assert!(record.suspended);
    assert!(record.network_blocked);

    // Exactly suspend-then-block, nothing else.
    assert_eq!(
        caps.calls(),
        vec![
            CapCall::Suspend {
                package: "com.evil.app".to_owned(),
                on: true
            },
            CapCall::NetBlock {
                uid: 10422,
                on: true
            },
        ]
    );
}

#[tokio::test]
async fn quarantine_entry_emits_event_with_target() {
    let dir = tempfile::tempdir().expect("tempdir");
    let caps = Arc::new(RecordingCaps::new());
    caps.set_path("com.evil.app", "/data/app/com.evil.app/base.apk");
    caps.set_uid("com.evil.app", 10422);

    let store = Arc::new(
        TrustStore::open(
            &dir.path().join("trust.json"),
            &dir.path().join("violations.jsonl"),
        )
        .expect("store"),
    );
    let (bus, dispatcher) = EventBus::new(
        256,
        Duration::from_millis(50),
        Duration::from_secs(2),
    );
    let engine = TrustEngine::new(store, caps, bus.clone());

    let targets = Arc::new(Mutex::new(Vec::new()));
    {
        let targets = Arc::clone(&targets);
        bus.subscribe(
            EventKind::QuarantineEntered,
            Box::new(move |e| {
                targets.lock().expect("test lock").push(e.target.clone());
                Ok(())
            }),
        );
    }

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let handle = tokio::spawn(dispatcher.run(shutdown_rx));

    engine.on_install("com.evil.app").await.expect("on_install");
    tokio::time::sleep(Duration::from_millis(100)).await;
    shutdown_tx.send(true).expect("signal");
    handle.await.expect("join");

    assert_eq!(
        targets.lock().expect("test lock").clone(),
        vec!["com.evil.app".to_owned()]
    );
}

#[tokio::test]
async fn adb_and_unknown_sources_are_quarantined() {
    let dir = tempfile::tempdir().expect("tempdir");
    let caps = Arc::new(RecordingCaps::new());
    caps.set_installer("com.dev.app", "com.android.shell");
    caps.set_uid("com.dev.app", 10100);
    caps.set_installer("com.odd.app", "com.some.unknown.store");
    caps.set_uid("com.odd.app", 10101);

    let (engine, _bus) = engine_with_caps(dir.path(), Arc::clone(&caps));

    assert_eq!(
        engine.on_install("com.dev.app").await.expect("adb install"),
        Admission::Quarantined
    );
    assert_eq!(
        engine.on_install("com.odd.app").await.expect("unknown install"),
        Admission::Quarantined
    );
}

#[tokio::test]
async fn play_store_install_is_admitted() {
    let dir = tempfile::tempdir().expect("tempdir");
    let caps = Arc::new(RecordingCaps::new());
    caps.set_installer("com.shop.app", "com.android.vending");

    let (engine, _bus) = engine_with_caps(dir.path(), Arc::clone(&caps));

    let admission = engine.on_install("com.shop.app").await.expect("on_install");
    assert_eq!(admission, Admission::Admitted);

    let record = engine.info("com.shop.app").await.expect("record");
    assert_eq!(record.install_source, InstallSource::PlayStore);
    assert_eq!(record.score, 80);
    assert!(!record.quarantined);
    assert!(caps.calls().is_empty(), "no enforcement for admitted installs");
}

#[tokio::test]
async fn whitelisted_sideload_is_admitted() {
    let dir = tempfile::tempdir().expect("tempdir");
    let caps = Arc::new(RecordingCaps::new());
    caps.set_uid("com.my.tool", 10200);

    let (engine, _bus) = engine_with_caps(dir.path(), Arc::clone(&caps));

    engine.whitelist("com.my.tool", true).await.expect("whitelist");
    caps.clear_calls();

    let admission = engine.on_install("com.my.tool").await.expect("on_install");
    assert_eq!(admission, Admission::Admitted);
    assert!(caps.calls().is_empty());
}

#[tokio::test]
async fn system_package_is_never_quarantined() {
    let dir = tempfile::tempdir().expect("tempdir");
    let caps = Arc::new(RecordingCaps::new());
    caps.set_path("com.android.settings", "/system/priv-app/Settings.apk");

    let (engine, _bus) = engine_with_caps(dir.path(), Arc::clone(&caps));

    let admission = engine
        .on_install("com.android.settings")
        .await
        .expect("on_install");
    assert_eq!(admission, Admission::Admitted);

    let record = engine.info("com.android.settings").await.expect("record");
    assert_eq!(record.status, AppStatus::System);
    assert_eq!(record.score, 100);
}
