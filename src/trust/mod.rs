//! Trust engine: per-package score state machine and admission control.
//!
//! Score transitions are totally ordered per package through a per-package
//! async lock. Store locks are internal to [`TrustStore`] and are never
//! held across a capability call; enforcement reads and writes the record
//! before and after talking to the OS, not during.

pub mod enforcement;
pub mod source;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{Duration as ChronoDuration, Utc};
use serde::Serialize;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};

use crate::bus::EventBus;
use crate::caps::Capabilities;
use crate::error::CoreError;
use crate::store::TrustStore;
use crate::types::{
    AppStatus, AppTrustRecord, Event, EventKind, ViolationKind, ViolationRecord,
};

/// Default bonus granted by the daily tick.
pub const DAILY_GOOD_BEHAVIOR_BONUS: i32 = 2;

/// Outcome of install-time admission control.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// The package may run unrestricted.
    Admitted,
    /// The package was quarantined on sight.
    Quarantined,
}

/// Aggregate trust statistics for the control plane.
#[derive(Debug, Clone, Serialize)]
pub struct TrustStats {
    /// Known packages.
    pub total_apps: usize,
    /// Packages in the trusted band.
    pub trusted_apps: usize,
    /// Packages in the suspicious band.
    pub suspicious_apps: usize,
    /// Packages currently quarantined.
    pub quarantined_apps: usize,
    /// Ledger entries over its lifetime.
    pub total_violations: u64,
}

/// The per-package trust score state machine.
pub struct TrustEngine {
    store: Arc<TrustStore>,
    caps: Arc<dyn Capabilities>,
    bus: EventBus,
    package_locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl TrustEngine {
    /// Wire the engine to its store, capability layer, and bus.
    pub fn new(store: Arc<TrustStore>, caps: Arc<dyn Capabilities>, bus: EventBus) -> Self {
        Self {
            store,
            caps,
            bus,
            package_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Lazily create the record for a package.
    ///
    /// Classifies the install source on first observation and emits a
    /// `config_changed` event announcing the addition. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Transport`] if the record cannot be persisted.
    pub async fn register(&self, package: &str) -> Result<AppTrustRecord, CoreError> {
        if let Some(existing) = self.store.get(package) {
            return Ok(existing);
        }

        let lock = self.package_lock(package);
        let _guard = lock.lock().await;
        // Another caller may have registered while we waited.
        if let Some(existing) = self.store.get(package) {
            return Ok(existing);
        }

        let source = source::classify(self.caps.as_ref(), package).await;
        let record = AppTrustRecord::new(package, source);
        self.store.put(record.clone())?;

        info!(
            package,
            source = source.as_str(),
            score = record.score,
            "package registered"
        );

        let mut event = Event::core(EventKind::ConfigChanged, package, "package_added", 2);
        event.data = serde_json::json!({ "source": source.as_str() });
        self.bus.publish(event).await;

        Ok(record)
    }

    /// Install-time admission control.
    ///
    /// Untrusted sources (sideload, adb, unknown) are quarantined on sight
    /// unless whitelisted.
    ///
    /// # Errors
    ///
    /// Returns an error if registration or persistence fails; enforcement
    /// failures are best-effort and do not fail admission.
    pub async fn on_install(&self, package: &str) -> Result<Admission, CoreError> {
        let record = self.register(package).await?;

        if !record.install_source.is_untrusted() || record.whitelisted {
            debug!(package, source = record.install_source.as_str(), "install admitted");
            return Ok(Admission::Admitted);
        }

        warn!(
            package,
            source = record.install_source.as_str(),
            "untrusted install, quarantining"
        );

        let lock = self.package_lock(package);
        let _guard = lock.lock().await;
        let mut record = self
            .store
            .get(package)
            .ok_or_else(|| CoreError::NotFound(format!("package {package}")))?;
        if self.enter_quarantine(&mut record, false).await {
            self.store.put(record)?;
            return Ok(Admission::Quarantined);
        }
        Ok(Admission::Admitted)
    }

    /// Record a violation: ledger append, score decrement, enforcement.
    ///
    /// Whitelisted and system packages are exempt; the observation is
    /// logged and nothing else happens. Otherwise the ledger entry and the
    /// score change commit in one store transaction, and enforcement is
    /// re-evaluated against the new score.
    ///
    /// # Errors
    ///
    /// Returns an error if the transaction cannot be committed. Capability
    /// failures during enforcement do not roll the ledger back.
    pub async fn record_violation(
        &self,
        package: &str,
        kind: ViolationKind,
        context: &str,
    ) -> Result<(), CoreError> {
        self.register(package).await?;

        let lock = self.package_lock(package);
        let _guard = lock.lock().await;
        let mut record = self
            .store
            .get(package)
            .ok_or_else(|| CoreError::NotFound(format!("package {package}")))?;

        if record.whitelisted || record.status == AppStatus::System {
            info!(
                package,
                kind = kind.as_str(),
                whitelisted = record.whitelisted,
                "violation ignored for exempt package"
            );
            return Ok(());
        }

        let penalty = kind.penalty();
        let old_score = record.score;
        record.score = (record.score + penalty).max(0);
        record.last_violation = Some(Utc::now());
        record.violation_count += 1;
        record.good_streak_days = 0;
        record.recompute_status();

        let violation = self
            .store
            .commit_violation(record.clone(), kind, context, false)?;

        warn!(
            package,
            kind = kind.as_str(),
            penalty,
            old_score,
            new_score = record.score,
            violation_id = violation.id,
            "violation recorded"
        );

        self.enforce(&mut record).await;
        self.store.put(record)?;
        Ok(())
    }

    /// Reward good behavior with a score bonus.
    ///
    /// System and whitelisted packages are not scored. Leaving the
    /// quarantined band triggers the inverse enforcement steps.
    ///
    /// # Errors
    ///
    /// Returns an error if persistence fails.
    pub async fn reward_good_behavior(&self, package: &str, bonus: i32) -> Result<(), CoreError> {
        let lock = self.package_lock(package);
        let _guard = lock.lock().await;
        let Some(mut record) = self.store.get(package) else {
            return Ok(());
        };

        if record.status == AppStatus::System || record.whitelisted {
            return Ok(());
        }

        let old_score = record.score;
        let old_status = record.status;
        record.score = (record.score + bonus).min(record.max_score);
        record.last_good_behavior = Utc::now();
        record.good_streak_days += 1;
        record.recompute_status();

        if old_status == AppStatus::Quarantined && record.status != AppStatus::Quarantined {
            self.release_quarantine(&mut record).await;
        }

        self.store.put(record.clone())?;

        if old_score != record.score {
            debug!(
                package,
                bonus,
                old_score,
                new_score = record.score,
                "good behavior rewarded"
            );
        }
        Ok(())
    }

    /// Daily sweep: reward every package with a clean last 24 hours.
    ///
    /// # Errors
    ///
    /// Returns the first persistence error; remaining packages are still
    /// visited on the next tick.
    pub async fn daily_tick(&self) -> Result<(), CoreError> {
        let now = Utc::now();
        let one_day = ChronoDuration::hours(24);
        let mut rewarded = 0usize;

        for record in self.store.all() {
            let clean = match record.last_violation {
                Some(last) => now - last >= one_day,
                None => true,
            };
            if clean {
                self.reward_good_behavior(&record.package, DAILY_GOOD_BEHAVIOR_BONUS)
                    .await?;
                rewarded += 1;
            }
        }

        info!(rewarded, "daily behavior check complete");
        Ok(())
    }

    /// Set or clear the whitelist flag.
    ///
    /// Whitelisting a quarantined package releases it.
    ///
    /// # Errors
    ///
    /// Returns an error if registration or persistence fails.
    pub async fn whitelist(&self, package: &str, on: bool) -> Result<(), CoreError> {
        self.register(package).await?;

        let lock = self.package_lock(package);
        let _guard = lock.lock().await;
        let mut record = self
            .store
            .get(package)
            .ok_or_else(|| CoreError::NotFound(format!("package {package}")))?;

        record.whitelisted = on;
        if on && record.quarantined {
            self.release_quarantine(&mut record).await;
        }
        self.store.put(record)?;

        info!(package, on, "whitelist updated");
        Ok(())
    }

    /// Record for one package, registering it on first sight.
    ///
    /// # Errors
    ///
    /// Returns an error if first-sight registration fails.
    pub async fn info(&self, package: &str) -> Result<AppTrustRecord, CoreError> {
        self.register(package).await
    }

    /// Snapshot of every record.
    pub fn all(&self) -> Vec<AppTrustRecord> {
        self.store.all()
    }

    /// Packages whose flag marks them quarantined.
    pub fn quarantined(&self) -> Vec<AppTrustRecord> {
        self.store
            .all()
            .into_iter()
            .filter(|r| r.quarantined)
            .collect()
    }

    /// Most recent violations, newest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the ledger cannot be read.
    pub fn recent_violations(&self, count: usize) -> Result<Vec<ViolationRecord>, CoreError> {
        self.store.recent_violations(count)
    }

    /// Aggregate statistics.
    pub fn stats(&self) -> TrustStats {
        let all = self.store.all();
        TrustStats {
            total_apps: all.len(),
            trusted_apps: all.iter().filter(|r| r.status == AppStatus::Trusted).count(),
            suspicious_apps: all
                .iter()
                .filter(|r| r.status == AppStatus::Suspicious)
                .count(),
            quarantined_apps: all.iter().filter(|r| r.quarantined).count(),
            total_violations: self.store.violation_count(),
        }
    }

    /// Persist in-memory state; called once during shutdown.
    ///
    /// # Errors
    ///
    /// Returns an error if the checkpoint write fails.
    pub fn flush(&self) -> Result<(), CoreError> {
        self.store.flush()
    }

    /// One async lock per package, created on demand.
    fn package_lock(&self, package: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = self
            .package_locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Arc::clone(
            locks
                .entry(package.to_owned())
                .or_insert_with(|| Arc::new(AsyncMutex::new(()))),
        )
    }
}
