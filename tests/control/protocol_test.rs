//! Control protocol over a real Unix socket: one request, one JSON line,
//! connection closed by the server.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;

use clarad::caps::RecordingCaps;
use clarad::config::DaemonConfig;
use clarad::runtime::CoreContext;
use clarad::types::{Event, EventKind, ServiceDescriptor};

struct Harness {
    socket: std::path::PathBuf,
    context_bus: clarad::bus::EventBus,
    shutdown_tx: tokio::sync::watch::Sender<bool>,
    _dir: tempfile::TempDir,
}

/// Stand up store, bus, trust, supervisor, and control plane on temp paths.
async fn harness(services: Vec<ServiceDescriptor>, caps: Arc<RecordingCaps>) -> Harness {
    let dir = tempfile::tempdir().expect("tempdir");
    let socket = dir.path().join("control.sock");

    let mut config = DaemonConfig::default();
    config.data_dir = dir.path().to_path_buf();
    config.control_socket = socket.clone();
    config.services = services;
    config.timing.spawn_settle_ms = 100;
    config.timing.stop_grace_ms = 100;
    config.timing.read_timeout_secs = 2;

    let (context, dispatcher) = CoreContext::initialize(config, caps).expect("initialize");

    let deps = Arc::new(clarad::control::ControlDeps {
        supervisor: Arc::clone(&context.supervisor),
        trust: Arc::clone(&context.trust),
        bus: context.bus.clone(),
        stats: Arc::clone(&context.stats),
        config_map: std::sync::Mutex::new(
            clarad::config::ConfigMap::load(&context.config.config_map_path()).expect("map"),
        ),
        config_map_path: context.config.config_map_path(),
    });
    let control = clarad::control::ControlPlane::bind(&context.config, deps).expect("bind");

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(dispatcher.run(shutdown_rx.clone()));
    tokio::spawn(control.run(shutdown_rx));

    Harness {
        socket,
        context_bus: context.bus.clone(),
        shutdown_tx,
        _dir: dir,
    }
}

/// One request/response exchange; asserts the server closes afterwards.
async fn send(socket: &Path, line: &str) -> serde_json::Value {
    let stream = UnixStream::connect(socket).await.expect("connect");
    let (read_half, mut write_half) = stream.into_split();

    write_half
        .write_all(format!("{line}\n").as_bytes())
        .await
        .expect("write");

    let mut reader = BufReader::new(read_half);
    let mut response = String::new();
    reader.read_line(&mut response).await.expect("read");

    // Server closes after the single response.
    let mut extra = String::new();
    let eof = reader.read_line(&mut extra).await.expect("read eof");
    assert_eq!(eof, 0, "server must close the connection");

    serde_json::from_str(response.trim()).expect("response is one JSON object")
}

fn sleeper(name: &str, dir: &Path) -> ServiceDescriptor {
    ServiceDescriptor {
        name: name.to_owned(),
        binary_path: "/bin/sleep".to_owned(),
        args: vec!["30".to_owned()],
        socket_path: dir.join(format!("{name}.sock")).display().to_string(),
        auto_start: false,
        auto_restart: false,
        restart_delay_ms: 10,
        max_restarts: 3,
    }
}

#[tokio::test]
async fn status_reports_running_services_and_event_count() {
    let dir = tempfile::tempdir().expect("tempdir");
    let caps = Arc::new(RecordingCaps::new());
    let harness = harness(
        vec![sleeper("alpha", dir.path()), sleeper("beta", dir.path())],
        caps,
    )
    .await;

    // Two running services.
    assert_eq!(send(&harness.socket, "start alpha").await["success"], true);
    assert_eq!(send(&harness.socket, "start beta").await["success"], true);

    // Seventeen processed events.
    for _ in 0..17 {
        harness
            .context_bus
            .publish(Event::core(EventKind::TrackerBlocked, "t", "", 1))
            .await;
    }
    tokio::time::sleep(Duration::from_millis(200)).await;

    let status = send(&harness.socket, "status").await;
    assert_eq!(status["running"], true);
    assert_eq!(status["services"], 2);
    // start alpha/beta events also pass through the dispatcher.
    assert_eq!(status["events_processed"], 17 + 2);
    assert_eq!(status["trackers_blocked"], 17);
    assert!(status["uptime_seconds"].is_u64());

    send(&harness.socket, "stop alpha").await;
    send(&harness.socket, "stop beta").await;
    let _ = harness.shutdown_tx.send(true);
}

#[tokio::test]
async fn services_lists_name_status_code_and_pid() {
    let dir = tempfile::tempdir().expect("tempdir");
    let caps = Arc::new(RecordingCaps::new());
    let harness = harness(vec![sleeper("alpha", dir.path())], caps).await;

    let services = send(&harness.socket, "services").await;
    let list = services.as_array().expect("array");
    assert_eq!(list.len(), 1);
    assert_eq!(list[0]["name"], "alpha");
    assert_eq!(list[0]["status"], 0, "unknown before first start");
    assert_eq!(list[0]["pid"], 0);

    send(&harness.socket, "start alpha").await;
    let services = send(&harness.socket, "services").await;
    assert_eq!(services[0]["status"], 2, "running");
    assert!(services[0]["pid"].as_u64().expect("pid") > 0);

    send(&harness.socket, "stop alpha").await;
    let _ = harness.shutdown_tx.send(true);
}

#[tokio::test]
async fn unknown_command_is_rejected() {
    let caps = Arc::new(RecordingCaps::new());
    let harness = harness(vec![], caps).await;

    let response = send(&harness.socket, "frobnicate now").await;
    assert_eq!(response["error"], "unknown_command");
    let _ = harness.shutdown_tx.send(true);
}

#[tokio::test]
async fn start_of_unknown_service_reports_the_error_kind() {
    let caps = Arc::new(RecordingCaps::new());
    let harness = harness(vec![], caps).await;

    let response = send(&harness.socket, "start ghost").await;
    assert_eq!(response["success"], false);
    assert_eq!(response["error"], "not_found");
    let _ = harness.shutdown_tx.send(true);
}

#[tokio::test]
async fn trust_returns_score_status_and_source() {
    let caps = Arc::new(RecordingCaps::new());
    caps.set_installer("com.shop.app", "com.android.vending");
    let harness = harness(vec![], caps).await;

    let response = send(&harness.socket, "trust com.shop.app").await;
    assert_eq!(response["package"], "com.shop.app");
    assert_eq!(response["score"], 80);
    assert_eq!(response["status"], "trusted");
    assert_eq!(response["source"], "play_store");
    let _ = harness.shutdown_tx.send(true);
}

#[tokio::test]
async fn whitelist_round_trip() {
    let caps = Arc::new(RecordingCaps::new());
    let harness = harness(vec![], caps).await;

    let response = send(&harness.socket, "whitelist com.my.tool on").await;
    assert_eq!(response["success"], true);

    let response = send(&harness.socket, "whitelist com.my.tool maybe").await;
    assert_eq!(response["error"], "protocol");
    let _ = harness.shutdown_tx.send(true);
}

#[tokio::test]
async fn scan_without_service_fails_with_transport() {
    let dir = tempfile::tempdir().expect("tempdir");
    let caps = Arc::new(RecordingCaps::new());
    // security_core configured but never started; its socket is absent.
    let harness = harness(vec![sleeper("security_core", dir.path())], caps).await;

    let response = send(&harness.socket, "scan").await;
    assert_eq!(response["success"], false);
    assert_eq!(response["error"], "transport");
    let _ = harness.shutdown_tx.send(true);
}

#[tokio::test]
async fn config_set_then_get_round_trips() {
    let caps = Arc::new(RecordingCaps::new());
    let harness = harness(vec![], caps).await;

    let response = send(&harness.socket, "config set protection_level high").await;
    assert_eq!(response["success"], true);

    let response = send(&harness.socket, "config get protection_level").await;
    assert_eq!(response["value"], "high");

    let response = send(&harness.socket, "config get absent_key").await;
    assert_eq!(response["error"], "not_found");
    let _ = harness.shutdown_tx.send(true);
}

#[tokio::test]
async fn threats_and_trackers_report_counters() {
    let caps = Arc::new(RecordingCaps::new());
    caps.set_installer("com.shop.app", "com.android.vending");
    let harness = harness(vec![], caps).await;

    harness
        .context_bus
        .publish(Event::core(EventKind::SmsThreat, "com.shop.app", "", 9))
        .await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let threats = send(&harness.socket, "threats").await;
    assert_eq!(threats["threats_today"], 1);
    assert!(threats["recent"].is_array());

    let trackers = send(&harness.socket, "trackers").await;
    assert_eq!(trackers["trackers_blocked"], 0);
    let _ = harness.shutdown_tx.send(true);
}

#[tokio::test]
async fn oversized_request_is_a_protocol_error() {
    let caps = Arc::new(RecordingCaps::new());
    let harness = harness(vec![], caps).await;

    let stream = UnixStream::connect(&harness.socket).await.expect("connect");
    let (read_half, mut write_half) = stream.into_split();
    let big = "x".repeat(5000);
    write_half.write_all(big.as_bytes()).await.expect("write");
    write_half.shutdown().await.expect("shutdown");

    let mut response = String::new();
    BufReader::new(read_half)
        .read_line(&mut response)
        .await
        .expect("read");
    let value: serde_json::Value = serde_json::from_str(response.trim()).expect("json");
    assert_eq!(value["error"], "protocol");
    let _ = harness.shutdown_tx.send(true);
}
