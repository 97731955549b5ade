//! Restart budget exhaustion and the absorbing error state.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clarad::bus::EventBus;
use clarad::config::TimingConfig;
use clarad::supervisor::ServiceSupervisor;
use clarad::types::{EventKind, ServiceDescriptor, ServiceStatus};

fn fast_timing() -> TimingConfig {
    TimingConfig {
        spawn_settle_ms: 50,
        stop_grace_ms: 50,
        restart_reset_secs: 1,
        read_timeout_secs: 1,
        ..TimingConfig::default()
    }
}

/// A service whose binary exits immediately with a failure code.
fn crasher(dir: &std::path::Path) -> ServiceDescriptor {
    ServiceDescriptor {
        name: "crasher".to_owned(),
        binary_path: "/bin/false".to_owned(),
        args: vec![],
        socket_path: dir.join("crasher.sock").display().to_string(),
        auto_start: false,
        auto_restart: true,
        restart_delay_ms: 10,
        max_restarts: 3,
    }
}

#[tokio::test]
async fn crash_loop_exhausts_budget_and_enters_error() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (bus, dispatcher) = EventBus::new(
        256,
        Duration::from_millis(50),
        Duration::from_secs(2),
    );
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let supervisor = Arc::new(ServiceSupervisor::new(
        vec![crasher(dir.path())],
        &fast_timing(),
        bus.clone(),
        shutdown_rx.clone(),
    ));

    let error_severities = Arc::new(AtomicU64::new(0));
    let error_count = Arc::new(AtomicU64::new(0));
    {
        let severities = Arc::clone(&error_severities);
        let count = Arc::clone(&error_count);
        bus.subscribe(
            EventKind::ServiceError,
            Box::new(move |e| {
                severities.store(u64::from(e.severity), Ordering::Relaxed);
                count.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }),
        );
    }
    let dispatcher_handle = tokio::spawn(dispatcher.run(shutdown_rx));

    let err = supervisor.start("crasher").await.expect_err("cannot start");
    assert_eq!(err.kind(), "internal");
    assert_eq!(supervisor.status("crasher"), Some(ServiceStatus::Error));
    assert_eq!(supervisor.snapshot()[0].restart_count, 3);
    assert_eq!(supervisor.counts(), (0, 1));

    // A further start against the absorbing state is rejected.
    let err = supervisor.start("crasher").await.expect_err("still error");
    assert_eq!(err.kind(), "invalid_state");

    tokio::time::sleep(Duration::from_millis(100)).await;
    shutdown_tx.send(true).expect("signal");
    dispatcher_handle.await.expect("join");

    assert_eq!(error_count.load(Ordering::Relaxed), 1, "one error event");
    assert_eq!(error_severities.load(Ordering::Relaxed), 8);
}

#[tokio::test]
async fn operator_restart_clears_the_streak_and_tries_again() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (bus, _dispatcher) = EventBus::new(
        256,
        Duration::from_millis(50),
        Duration::from_secs(2),
    );
    let (_shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let supervisor = Arc::new(ServiceSupervisor::new(
        vec![crasher(dir.path())],
        &fast_timing(),
        bus,
        shutdown_rx,
    ));

    let _ = supervisor.start("crasher").await;
    assert_eq!(supervisor.status("crasher"), Some(ServiceStatus::Error));

    // restart = stop (clears error) + fresh budget + start; the binary
    // still crashes, so the streak ends in error again.
    let err = supervisor.restart("crasher").await.expect_err("still broken");
    assert_eq!(err.kind(), "internal");
    assert_eq!(supervisor.status("crasher"), Some(ServiceStatus::Error));
    assert_eq!(supervisor.snapshot()[0].restart_count, 3);
}

#[tokio::test]
async fn missing_binary_consumes_budget_and_errors() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut descriptor = crasher(dir.path());
    descriptor.binary_path = "/nonexistent/clara_service".to_owned();
    let (bus, _dispatcher) = EventBus::new(
        256,
        Duration::from_millis(50),
        Duration::from_secs(2),
    );
    let (_shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let supervisor = Arc::new(ServiceSupervisor::new(
        vec![descriptor],
        &fast_timing(),
        bus,
        shutdown_rx,
    ));

    let err = supervisor.start("crasher").await.expect_err("no binary");
    assert_eq!(err.kind(), "internal");
    assert_eq!(supervisor.status("crasher"), Some(ServiceStatus::Error));
}

#[tokio::test]
async fn no_auto_restart_means_error_after_first_failure() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut descriptor = crasher(dir.path());
    descriptor.auto_restart = false;
    let (bus, _dispatcher) = EventBus::new(
        256,
        Duration::from_millis(50),
        Duration::from_secs(2),
    );
    let (_shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let supervisor = Arc::new(ServiceSupervisor::new(
        vec![descriptor],
        &fast_timing(),
        bus,
        shutdown_rx,
    ));

    let err = supervisor.start("crasher").await.expect_err("cannot start");
    assert_eq!(err.kind(), "internal");
    assert_eq!(supervisor.status("crasher"), Some(ServiceStatus::Error));
    assert_eq!(supervisor.snapshot()[0].restart_count, 1);
}
