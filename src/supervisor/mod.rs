//! Service supervisor: spawns, probes, and restarts the worker services.
//!
//! The service table lives behind a plain mutex that is never held across
//! an await; every blocking step (settle sleep, grace period, liveness
//! probe) happens between short lock windows. Child processes are reaped
//! non-blockingly on the health tick, and unexpected exits consume the
//! per-service restart budget.

pub mod ipc;

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::bus::EventBus;
use crate::config::TimingConfig;
use crate::error::CoreError;
use crate::types::{Event, EventKind, ServiceDescriptor, ServiceStatus};

use self::ipc::ServiceLinks;

/// Point-in-time view of one service for the control plane.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceSnapshot {
    /// Service name.
    pub name: String,
    /// Current lifecycle state.
    pub status: ServiceStatus,
    /// Child pid while spawned.
    pub pid: Option<u32>,
    /// When the current incarnation was spawned.
    pub started_at: Option<DateTime<Utc>>,
    /// Restarts consumed in the current failure streak.
    pub restart_count: u32,
    /// Last successful liveness probe.
    pub last_heartbeat: Option<DateTime<Utc>>,
    /// Failure detail once the service is in `error`.
    pub error_message: Option<String>,
}

struct ServiceEntry {
    descriptor: ServiceDescriptor,
    status: ServiceStatus,
    pid: Option<u32>,
    child: Option<Child>,
    started_at: Option<DateTime<Utc>>,
    running_since: Option<Instant>,
    last_heartbeat: Option<DateTime<Utc>>,
    restart_count: u32,
    error_message: Option<String>,
    reader: Option<JoinHandle<()>>,
}

impl ServiceEntry {
    fn new(descriptor: ServiceDescriptor) -> Self {
        Self {
            descriptor,
            status: ServiceStatus::Unknown,
            pid: None,
            child: None,
            started_at: None,
            running_since: None,
            last_heartbeat: None,
            restart_count: 0,
            error_message: None,
            reader: None,
        }
    }

    fn snapshot(&self, name: &str) -> ServiceSnapshot {
        ServiceSnapshot {
            name: name.to_owned(),
            status: self.status,
            pid: self.pid,
            started_at: self.started_at,
            restart_count: self.restart_count,
            last_heartbeat: self.last_heartbeat,
            error_message: self.error_message.clone(),
        }
    }
}

/// Outcome of one spawn-and-settle attempt.
enum Settle {
    Running,
    Died(String),
}

/// What to do after a failure was noted against the budget.
enum FailureDecision {
    Retry(Duration),
    GiveUp,
}

/// Supervisor over the fixed, configured service set.
pub struct ServiceSupervisor {
    table: Mutex<HashMap<String, ServiceEntry>>,
    order: Vec<String>,
    links: ServiceLinks,
    bus: EventBus,
    spawn_settle: Duration,
    stop_grace: Duration,
    restart_reset: Duration,
    shutdown_rx: watch::Receiver<bool>,
}

impl ServiceSupervisor {
    /// Build the table from the configured descriptors.
    pub fn new(
        descriptors: Vec<ServiceDescriptor>,
        timing: &TimingConfig,
        bus: EventBus,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        let order: Vec<String> = descriptors.iter().map(|d| d.name.clone()).collect();
        let table = descriptors
            .into_iter()
            .map(|d| (d.name.clone(), ServiceEntry::new(d)))
            .collect();
        Self {
            table: Mutex::new(table),
            order,
            links: ServiceLinks::new(Duration::from_secs(timing.read_timeout_secs)),
            bus,
            spawn_settle: Duration::from_millis(timing.spawn_settle_ms),
            stop_grace: Duration::from_millis(timing.stop_grace_ms),
            restart_reset: Duration::from_secs(timing.restart_reset_secs),
            shutdown_rx,
        }
    }

    /// Start every `auto_start` service, in configuration order.
    pub async fn start_auto(&self) {
        let auto: Vec<String> = {
            let table = self.lock_table();
            self.order
                .iter()
                .filter(|name| {
                    table
                        .get(name.as_str())
                        .is_some_and(|e| e.descriptor.auto_start)
                })
                .cloned()
                .collect()
        };
        for name in auto {
            if let Err(e) = self.start(&name).await {
                error!(service = %name, error = %e, "auto-start failed");
            }
        }
    }

    /// Start one service, consuming the restart budget on crash loops.
    ///
    /// # Errors
    ///
    /// [`CoreError::NotFound`] for an unknown service,
    /// [`CoreError::InvalidState`] unless the service is `unknown` or
    /// `stopped`, [`CoreError::Internal`] when the budget is exhausted.
    pub async fn start(&self, name: &str) -> Result<(), CoreError> {
        {
            let table = self.lock_table();
            let entry = table
                .get(name)
                .ok_or_else(|| CoreError::NotFound(format!("service {name}")))?;
            match entry.status {
                ServiceStatus::Unknown | ServiceStatus::Stopped => {}
                other => {
                    return Err(CoreError::InvalidState(format!(
                        "cannot start {name} while {}",
                        other.code()
                    )))
                }
            }
        }

        match self.spawn_and_settle(name).await {
            Settle::Running => {
                self.after_start(name).await;
                Ok(())
            }
            Settle::Died(detail) => {
                warn!(service = %name, detail = %detail, "service died during startup");
                if self.handle_failure(name).await {
                    Ok(())
                } else {
                    Err(CoreError::Internal(format!(
                        "service {name} failed to start"
                    )))
                }
            }
        }
    }

    /// Stop one service: SIGTERM, grace period, SIGKILL, reap.
    ///
    /// Stopping a service in `error` is allowed and clears it back to
    /// `stopped` so an operator restart can begin a fresh streak.
    ///
    /// # Errors
    ///
    /// [`CoreError::NotFound`] for an unknown service,
    /// [`CoreError::InvalidState`] when already stopped or stopping.
    pub async fn stop(&self, name: &str) -> Result<(), CoreError> {
        let (child, pid, reader) = {
            let mut table = self.lock_table();
            let entry = table
                .get_mut(name)
                .ok_or_else(|| CoreError::NotFound(format!("service {name}")))?;
            match entry.status {
                ServiceStatus::Running | ServiceStatus::Starting => {}
                ServiceStatus::Error => {
                    entry.status = ServiceStatus::Stopped;
                    entry.error_message = None;
                    entry.pid = None;
                    entry.child = None;
                    return Ok(());
                }
                other => {
                    return Err(CoreError::InvalidState(format!(
                        "cannot stop {name} while {}",
                        other.code()
                    )))
                }
            }
            entry.status = ServiceStatus::Stopping;
            (entry.child.take(), entry.pid.take(), entry.reader.take())
        };

        if let Some(reader) = reader {
            reader.abort();
        }
        self.links.disconnect(name).await;

        if let Some(mut child) = child {
            if let Some(pid) = pid {
                send_sigterm(pid);
            }
            tokio::time::sleep(self.stop_grace).await;
            match child.try_wait() {
                Ok(Some(_)) => {}
                _ => {
                    debug!(service = %name, "grace period expired, killing");
                    let _ = child.kill().await;
                }
            }
        }

        {
            let mut table = self.lock_table();
            if let Some(entry) = table.get_mut(name) {
                entry.status = ServiceStatus::Stopped;
                entry.running_since = None;
            }
        }

        info!(service = %name, "service stopped");
        self.bus
            .publish(Event::core(
                EventKind::ServiceStopped,
                name,
                "service stopped",
                3,
            ))
            .await;
        Ok(())
    }

    /// Stop then start, clearing the failure streak.
    ///
    /// # Errors
    ///
    /// Propagates [`ServiceSupervisor::start`] errors; a stop on an
    /// already-stopped service is not an error here.
    pub async fn restart(&self, name: &str) -> Result<(), CoreError> {
        match self.stop(name).await {
            Ok(()) | Err(CoreError::InvalidState(_)) => {}
            Err(e) => return Err(e),
        }
        {
            let mut table = self.lock_table();
            if let Some(entry) = table.get_mut(name) {
                entry.restart_count = 0;
                entry.error_message = None;
            }
        }
        self.start(name).await
    }

    /// One health pass: reap exits, reset stale budgets, probe liveness.
    pub async fn health_tick(&self) {
        let mut failed: Vec<String> = Vec::new();
        let mut stopped: Vec<String> = Vec::new();

        {
            let mut table = self.lock_table();
            for (name, entry) in table.iter_mut() {
                // Non-blocking reap.
                if let Some(child) = entry.child.as_mut() {
                    match child.try_wait() {
                        Ok(Some(exit)) => {
                            if matches!(
                                entry.status,
                                ServiceStatus::Running | ServiceStatus::Starting
                            ) {
                                warn!(
                                    service = %name,
                                    pid = ?entry.pid,
                                    code = ?exit.code(),
                                    "service exited unexpectedly"
                                );
                                entry.child = None;
                                entry.pid = None;
                                entry.running_since = None;
                                entry.status = ServiceStatus::Stopped;
                                if let Some(reader) = entry.reader.take() {
                                    reader.abort();
                                }
                                if entry.descriptor.auto_restart {
                                    failed.push(name.clone());
                                } else {
                                    stopped.push(name.clone());
                                }
                            }
                        }
                        Ok(None) => {}
                        Err(e) => {
                            debug!(service = %name, error = %e, "reap failed");
                        }
                    }
                }

                // A stretch of continuous running forgives past failures.
                if entry.status == ServiceStatus::Running
                    && entry.restart_count > 0
                    && entry
                        .running_since
                        .is_some_and(|since| since.elapsed() >= self.restart_reset)
                {
                    debug!(service = %name, "restart budget reset");
                    entry.restart_count = 0;
                }
            }
        }

        for name in stopped {
            self.bus
                .publish(Event::core(
                    EventKind::ServiceStopped,
                    &name,
                    "service exited",
                    3,
                ))
                .await;
        }
        for name in failed {
            self.handle_failure(&name).await;
        }

        self.probe_heartbeats().await;
    }

    /// Forward one request line to a service and return its response line.
    ///
    /// # Errors
    ///
    /// [`CoreError::NotFound`] for an unknown service; transport, timeout,
    /// and protocol errors from the link layer.
    pub async fn request(&self, name: &str, line: &str) -> Result<String, CoreError> {
        let socket_path = {
            let table = self.lock_table();
            table
                .get(name)
                .map(|e| e.descriptor.socket_path.clone())
                .ok_or_else(|| CoreError::NotFound(format!("service {name}")))?
        };
        self.links.request(name, &socket_path, line).await
    }

    /// Snapshots in configuration order.
    pub fn snapshot(&self) -> Vec<ServiceSnapshot> {
        let table = self.lock_table();
        self.order
            .iter()
            .filter_map(|name| table.get(name).map(|e| e.snapshot(name)))
            .collect()
    }

    /// Current status of one service.
    pub fn status(&self, name: &str) -> Option<ServiceStatus> {
        self.lock_table().get(name).map(|e| e.status)
    }

    /// `(running, failed)` service counts.
    pub fn counts(&self) -> (usize, usize) {
        let table = self.lock_table();
        let running = table
            .values()
            .filter(|e| e.status == ServiceStatus::Running)
            .count();
        let failed = table
            .values()
            .filter(|e| e.status == ServiceStatus::Error)
            .count();
        (running, failed)
    }

    /// Number of configured services.
    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// Whether no services are configured.
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Stop everything in reverse configuration order.
    pub async fn shutdown(&self) {
        for name in self.order.iter().rev() {
            match self.stop(name).await {
                Ok(()) | Err(CoreError::InvalidState(_)) => {}
                Err(e) => warn!(service = %name, error = %e, "stop during shutdown failed"),
            }
        }
    }

    // -- internals --

    /// Spawn the child and probe it after the settle window.
    async fn spawn_and_settle(&self, name: &str) -> Settle {
        let descriptor = {
            let mut table = self.lock_table();
            let Some(entry) = table.get_mut(name) else {
                return Settle::Died(format!("service {name} disappeared"));
            };
            entry.status = ServiceStatus::Starting;
            entry.started_at = Some(Utc::now());
            entry.running_since = None;
            entry.descriptor.clone()
        };

        let mut command = Command::new(&descriptor.binary_path);
        command
            .args(&descriptor.args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .process_group(0);

        let child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                let detail = format!("spawn {}: {e}", descriptor.binary_path);
                let mut table = self.lock_table();
                if let Some(entry) = table.get_mut(name) {
                    entry.status = ServiceStatus::Stopped;
                    entry.error_message = Some(detail.clone());
                }
                return Settle::Died(detail);
            }
        };

        let pid = child.id();
        {
            let mut table = self.lock_table();
            if let Some(entry) = table.get_mut(name) {
                entry.pid = pid;
                entry.child = Some(child);
            }
        }
        debug!(service = %name, pid = ?pid, "service spawned");

        tokio::time::sleep(self.spawn_settle).await;

        let mut table = self.lock_table();
        let Some(entry) = table.get_mut(name) else {
            return Settle::Died(format!("service {name} disappeared"));
        };
        let Some(child) = entry.child.as_mut() else {
            return Settle::Died("child taken during settle".to_owned());
        };
        match child.try_wait() {
            Ok(Some(exit)) => {
                entry.child = None;
                entry.pid = None;
                entry.status = ServiceStatus::Stopped;
                Settle::Died(format!("exited during startup with {exit}"))
            }
            Ok(None) => {
                entry.status = ServiceStatus::Running;
                entry.running_since = Some(Instant::now());
                Settle::Running
            }
            Err(e) => {
                entry.child = None;
                entry.pid = None;
                entry.status = ServiceStatus::Stopped;
                Settle::Died(format!("probe failed: {e}"))
            }
        }
    }

    /// Post-start bookkeeping: announce and attach the inbound reader.
    async fn after_start(&self, name: &str) {
        let (pid, socket_path) = {
            let table = self.lock_table();
            let Some(entry) = table.get(name) else {
                return;
            };
            (entry.pid, entry.descriptor.socket_path.clone())
        };

        info!(service = %name, pid = ?pid, "service running");

        let reader = tokio::spawn(ipc::run_inbound_reader(
            name.to_owned(),
            socket_path,
            self.bus.clone(),
            self.shutdown_rx.clone(),
        ));
        {
            let mut table = self.lock_table();
            if let Some(entry) = table.get_mut(name) {
                if let Some(old) = entry.reader.replace(reader) {
                    old.abort();
                }
            }
        }

        let mut event = Event::core(EventKind::ServiceStarted, name, "service started", 2);
        event.data = serde_json::json!({ "pid": pid });
        self.bus.publish(event).await;
    }

    /// Consume restart budget until the service runs or the budget is gone.
    ///
    /// Returns `true` if a retry ended with the service running.
    async fn handle_failure(&self, name: &str) -> bool {
        loop {
            match self.note_failure(name) {
                FailureDecision::Retry(delay) => {
                    tokio::time::sleep(delay).await;
                    match self.spawn_and_settle(name).await {
                        Settle::Running => {
                            self.after_start(name).await;
                            return true;
                        }
                        Settle::Died(detail) => {
                            warn!(service = %name, detail = %detail, "restart attempt failed");
                        }
                    }
                }
                FailureDecision::GiveUp => {
                    error!(service = %name, "restart budget exhausted");
                    self.bus
                        .publish(Event::core(
                            EventKind::ServiceError,
                            name,
                            "restart budget exhausted",
                            8,
                        ))
                        .await;
                    return false;
                }
            }
        }
    }

    /// Charge one failure against the budget and decide what happens next.
    fn note_failure(&self, name: &str) -> FailureDecision {
        let mut table = self.lock_table();
        let Some(entry) = table.get_mut(name) else {
            return FailureDecision::GiveUp;
        };

        entry.restart_count += 1;
        if entry.descriptor.auto_restart && entry.restart_count < entry.descriptor.max_restarts {
            info!(
                service = %name,
                attempt = entry.restart_count + 1,
                max = entry.descriptor.max_restarts,
                "scheduling restart"
            );
            FailureDecision::Retry(Duration::from_millis(entry.descriptor.restart_delay_ms))
        } else {
            entry.status = ServiceStatus::Error;
            entry.error_message = Some("restart budget exhausted".to_owned());
            FailureDecision::GiveUp
        }
    }

    /// Refresh `last_heartbeat` for services answering `PING`.
    async fn probe_heartbeats(&self) {
        let targets: Vec<(String, String)> = {
            let table = self.lock_table();
            table
                .iter()
                .filter(|(_, e)| e.status == ServiceStatus::Running)
                .map(|(name, e)| (name.clone(), e.descriptor.socket_path.clone()))
                .collect()
        };

        for (name, socket_path) in targets {
            // A failed probe is not a service failure; liveness is owned by
            // the process reap above.
            if self.links.ping(&name, &socket_path).await {
                let mut table = self.lock_table();
                if let Some(entry) = table.get_mut(&name) {
                    entry.last_heartbeat = Some(Utc::now());
                }
            }
        }
    }

    fn lock_table(&self) -> std::sync::MutexGuard<'_, HashMap<String, ServiceEntry>> {
        self.table
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Deliver SIGTERM to a child process.
#[allow(unsafe_code)]
fn send_sigterm(pid: u32) {
    // SAFETY: kill(2) with a plain signal touches no memory; an invalid or
    // stale pid returns ESRCH which we deliberately ignore.
    unsafe {
        libc::kill(pid as libc::pid_t, libc::SIGTERM);
    }
}
