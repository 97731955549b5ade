//! Process wiring and lifecycle.
//!
//! One [`CoreContext`] is built at startup and threaded by reference into
//! every component; there are no process-wide singletons. Shutdown follows
//! a fixed order: stop accepting control connections, drain the bus, stop
//! services in reverse configuration order, persist trust state.

use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::Context as _;
use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

use crate::bus::{BusDispatcher, EventBus};
use crate::caps::Capabilities;
use crate::config::{ConfigMap, DaemonConfig};
use crate::control::{ControlDeps, ControlPlane};
use crate::store::TrustStore;
use crate::supervisor::ServiceSupervisor;
use crate::trust::TrustEngine;
use crate::types::{EventKind, ViolationKind};

/// Process-wide counters surfaced by the `status` command.
pub struct RuntimeStats {
    start: Instant,
    threats: AtomicU64,
    trackers: AtomicU64,
}

impl RuntimeStats {
    /// Counters at zero, clock started now.
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
            threats: AtomicU64::new(0),
            trackers: AtomicU64::new(0),
        }
    }

    /// Seconds since process start.
    pub fn uptime_seconds(&self) -> u64 {
        self.start.elapsed().as_secs()
    }

    /// Threat events observed.
    pub fn threats_today(&self) -> u64 {
        self.threats.load(Ordering::Relaxed)
    }

    /// Tracker-blocked events observed.
    pub fn trackers_blocked(&self) -> u64 {
        self.trackers.load(Ordering::Relaxed)
    }

    /// Count one threat event.
    pub fn note_threat(&self) {
        self.threats.fetch_add(1, Ordering::Relaxed);
    }

    /// Count one blocked tracker.
    pub fn note_tracker(&self) {
        self.trackers.fetch_add(1, Ordering::Relaxed);
    }
}

impl Default for RuntimeStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Everything the daemon runs on, built once at startup.
pub struct CoreContext {
    /// Loaded configuration.
    pub config: DaemonConfig,
    /// Event bus publish handle.
    pub bus: EventBus,
    /// Trust engine.
    pub trust: Arc<TrustEngine>,
    /// Service supervisor.
    pub supervisor: Arc<ServiceSupervisor>,
    /// Stats counters.
    pub stats: Arc<RuntimeStats>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl CoreContext {
    /// Wire all components against the given capability layer.
    ///
    /// # Errors
    ///
    /// Returns an error if the persistent stores cannot be opened.
    pub fn initialize(
        config: DaemonConfig,
        caps: Arc<dyn Capabilities>,
    ) -> anyhow::Result<(Self, BusDispatcher)> {
        std::fs::create_dir_all(&config.data_dir).with_context(|| {
            format!("failed to create data dir {}", config.data_dir.display())
        })?;

        let store = Arc::new(
            TrustStore::open(&config.trust_checkpoint_path(), &config.violation_log_path())
                .context("failed to open trust store")?,
        );

        let (bus, dispatcher) = EventBus::new(
            config.timing.queue_capacity,
            Duration::from_millis(config.timing.produce_timeout_ms),
            Duration::from_millis(config.timing.shutdown_drain_ms),
        );

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let trust = Arc::new(TrustEngine::new(store, caps, bus.clone()));
        let supervisor = Arc::new(ServiceSupervisor::new(
            config.services.clone(),
            &config.timing,
            bus.clone(),
            shutdown_rx.clone(),
        ));

        let stats = Arc::new(RuntimeStats::new());
        wire_stat_subscribers(&bus, &stats);

        Ok((
            Self {
                config,
                bus,
                trust,
                supervisor,
                stats,
                shutdown_tx,
                shutdown_rx,
            },
            dispatcher,
        ))
    }

    /// Receiver every long-lived task watches for shutdown.
    pub fn shutdown_rx(&self) -> watch::Receiver<bool> {
        self.shutdown_rx.clone()
    }

    /// Flip the process-wide shutdown flag.
    pub fn signal_shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Run the daemon until `wait_for_signal` completes.
    ///
    /// Starts auto-start services, the dispatcher, the control plane, and
    /// the health loop, then performs the ordered shutdown.
    ///
    /// # Errors
    ///
    /// Returns an error for fatal startup failures (control socket bind,
    /// config map load). Runtime errors are logged, never fatal.
    pub async fn run(
        self,
        dispatcher: BusDispatcher,
        wait_for_signal: impl std::future::Future<Output = ()>,
    ) -> anyhow::Result<()> {
        let config_map_path = self.config.config_map_path();
        let config_map = ConfigMap::load(&config_map_path).context("failed to load config map")?;

        let deps = Arc::new(ControlDeps {
            supervisor: Arc::clone(&self.supervisor),
            trust: Arc::clone(&self.trust),
            bus: self.bus.clone(),
            stats: Arc::clone(&self.stats),
            config_map: Mutex::new(config_map),
            config_map_path,
        });
        let control = ControlPlane::bind(&self.config, deps).context("failed to bind control socket")?;

        let (violation_tx, violation_rx) = mpsc::channel(256);
        wire_violation_router(&self.bus, violation_tx);
        let violation_handle = tokio::spawn(run_violation_worker(
            Arc::clone(&self.trust),
            violation_rx,
        ));

        let dispatcher_handle = tokio::spawn(dispatcher.run(self.shutdown_rx()));
        let control_handle = tokio::spawn(control.run(self.shutdown_rx()));

        self.supervisor.start_auto().await;

        let health_handle = tokio::spawn(run_health_loop(
            Arc::clone(&self.supervisor),
            Arc::clone(&self.trust),
            self.config.daily_tick_cron.clone(),
            Duration::from_secs(self.config.timing.health_interval_secs),
            self.shutdown_rx(),
        ));

        info!("core running");
        wait_for_signal.await;
        info!("shutdown requested");

        // Fixed order: stop accepting, drain the bus, stop services, persist.
        self.signal_shutdown();
        let _ = control_handle.await;
        let _ = health_handle.await;
        let _ = dispatcher_handle.await;
        // The bus is drained; nothing can enqueue more violations.
        violation_handle.abort();
        self.supervisor.shutdown().await;
        if let Err(e) = self.trust.flush() {
            error!(error = %e, "failed to persist trust state during shutdown");
        }

        info!("core stopped");
        Ok(())
    }
}

/// One violation extracted from a detector event.
#[derive(Debug)]
pub struct ViolationRequest {
    /// Offending package.
    pub package: String,
    /// Classified behavior.
    pub kind: ViolationKind,
    /// Free-form detail from the detector.
    pub context: String,
}

/// Event kinds whose payload may carry a violation classification.
const VIOLATION_SOURCES: [EventKind; 7] = [
    EventKind::SmsThreat,
    EventKind::FileThreat,
    EventKind::NetworkThreat,
    EventKind::MessengerThreat,
    EventKind::KeyloggerDetected,
    EventKind::PermissionAccess,
    EventKind::AppLockTriggered,
];

/// Route detector events into the trust engine.
///
/// Bus callbacks are synchronous, so scoring goes through a channel to a
/// single worker; that also keeps violation application serialized in
/// arrival order. An event feeds the ledger only when its payload names a
/// violation kind, because the classification belongs to the detector,
/// not to the core.
pub fn wire_violation_router(bus: &EventBus, tx: mpsc::Sender<ViolationRequest>) {
    for kind in VIOLATION_SOURCES {
        let tx = tx.clone();
        bus.subscribe(
            kind,
            Box::new(move |event| {
                let Some(violation) = event.data.get("violation").and_then(|v| v.as_str()) else {
                    return Ok(());
                };
                if event.target.is_empty() {
                    anyhow::bail!("violation event without a target package");
                }
                let kind = ViolationKind::parse(violation)
                    .map_err(|e| anyhow::anyhow!("unroutable violation: {e}"))?;
                let request = ViolationRequest {
                    package: event.target.clone(),
                    kind,
                    context: event.message.clone(),
                };
                tx.try_send(request)
                    .map_err(|e| anyhow::anyhow!("violation queue full: {e}"))
            }),
        );
    }
}

/// Apply queued violations until the sender side closes.
pub async fn run_violation_worker(
    trust: Arc<TrustEngine>,
    mut rx: mpsc::Receiver<ViolationRequest>,
) {
    while let Some(request) = rx.recv().await {
        if let Err(e) = trust
            .record_violation(&request.package, request.kind, &request.context)
            .await
        {
            error!(
                package = %request.package,
                kind = request.kind.as_str(),
                error = %e,
                "violation application failed"
            );
        }
    }
    info!("violation worker stopped");
}

/// Feed the threat and tracker counters from the bus.
fn wire_stat_subscribers(bus: &EventBus, stats: &Arc<RuntimeStats>) {
    for kind in [
        EventKind::SmsThreat,
        EventKind::FileThreat,
        EventKind::NetworkThreat,
        EventKind::MessengerThreat,
        EventKind::KeyloggerDetected,
    ] {
        let stats = Arc::clone(stats);
        bus.subscribe(
            kind,
            Box::new(move |_| {
                stats.note_threat();
                Ok(())
            }),
        );
    }

    let stats = Arc::clone(stats);
    bus.subscribe(
        EventKind::TrackerBlocked,
        Box::new(move |_| {
            stats.note_tracker();
            Ok(())
        }),
    );
}

/// Health ticker: supervisor pass every interval, trust daily tick on cron.
pub async fn run_health_loop(
    supervisor: Arc<ServiceSupervisor>,
    trust: Arc<TrustEngine>,
    daily_cron: String,
    interval: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let schedule = match cron::Schedule::from_str(&daily_cron) {
        Ok(schedule) => Some(schedule),
        Err(e) => {
            warn!(cron = %daily_cron, error = %e, "invalid daily tick cron, sweep disabled");
            None
        }
    };

    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The immediate first tick would probe services mid-startup.
    ticker.tick().await;

    let mut last_daily = Utc::now();
    info!(interval_secs = interval.as_secs(), "health loop started");

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                supervisor.health_tick().await;

                if let Some(schedule) = &schedule {
                    let now = Utc::now();
                    if daily_tick_due(schedule, last_daily, now) {
                        if let Err(e) = trust.daily_tick().await {
                            warn!(error = %e, "daily tick failed");
                        }
                        last_daily = now;
                    }
                }
            }
            result = shutdown_rx.changed() => {
                if result.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }
        }
    }

    info!("health loop stopped");
}

/// Whether a cron occurrence falls between the last run and now.
pub fn daily_tick_due(
    schedule: &cron::Schedule,
    last_run: DateTime<Utc>,
    now: DateTime<Utc>,
) -> bool {
    schedule.after(&last_run).take(1).any(|next| next <= now)
}
