//! Score-band enforcement against the capability layer.
//!
//! Enforcement is best-effort: a failed capability call leaves the
//! corresponding flag unset, logs at warning level, and emits an
//! `enforcement_failed` event. The score change that triggered enforcement
//! is already durable and is never rolled back.

use tracing::{info, warn};

use crate::error::CoreError;
use crate::types::{AppStatus, AppTrustRecord, Event, EventKind};

use super::TrustEngine;

/// Precision location permission, revoked in the normal band.
pub const PERM_FINE_LOCATION: &str = "android.permission.ACCESS_FINE_LOCATION";

/// Camera permission, revoked in the suspicious band.
pub const PERM_CAMERA: &str = "android.permission.CAMERA";

/// Microphone permission, revoked in the suspicious band.
pub const PERM_RECORD_AUDIO: &str = "android.permission.RECORD_AUDIO";

/// Contacts permission, revoked in the suspicious band.
pub const PERM_READ_CONTACTS: &str = "android.permission.READ_CONTACTS";

impl TrustEngine {
    /// Re-evaluate enforcement for the record's current score.
    ///
    /// Mutates enforcement flags to mirror what actually succeeded; the
    /// caller persists the record afterwards.
    pub(crate) async fn enforce(&self, record: &mut AppTrustRecord) {
        if record.whitelisted {
            return;
        }

        // Climbing out of the quarantined band undoes quarantine before any
        // band action applies.
        if record.quarantined && record.score >= 20 {
            self.release_quarantine(record).await;
        }

        match record.score {
            score if score >= 80 => {}
            score if score >= 50 => {
                self.try_revoke(record, PERM_FINE_LOCATION).await;
                record.fuzzy_location = true;
            }
            score if score >= 20 => {
                self.try_revoke(record, PERM_FINE_LOCATION).await;
                record.fuzzy_location = true;
                self.try_revoke(record, PERM_CAMERA).await;
                self.try_revoke(record, PERM_RECORD_AUDIO).await;
                self.try_revoke(record, PERM_READ_CONTACTS).await;
            }
            _ => {
                self.enter_quarantine(record, true).await;
            }
        }
    }

    /// Quarantine a package: suspend, then blackhole its uid.
    ///
    /// Returns `false` when skipped (whitelisted or already quarantined).
    /// `force_stop` additionally kills the package's processes, used when
    /// quarantine is entered through the score policy rather than at
    /// install time.
    pub(crate) async fn enter_quarantine(
        &self,
        record: &mut AppTrustRecord,
        force_stop: bool,
    ) -> bool {
        if record.whitelisted {
            info!(package = %record.package, "whitelisted, quarantine skipped");
            return false;
        }
        if record.quarantined {
            return true;
        }

        let package = record.package.clone();

        match self.caps.suspend(&package, true).await {
            Ok(()) => record.suspended = true,
            Err(e) => self.enforcement_failed(&package, "suspend", &e).await,
        }

        match self.caps.uid_of(&package).await {
            Ok(uid) => match self.caps.net_block(uid, true).await {
                Ok(()) => record.network_blocked = true,
                Err(e) => self.enforcement_failed(&package, "net_block", &e).await,
            },
            Err(e) => self.enforcement_failed(&package, "net_block", &e).await,
        }

        record.quarantined = true;
        record.status = AppStatus::Quarantined;

        warn!(package = %package, score = record.score, "package quarantined");
        self.bus
            .publish(Event::core(
                EventKind::QuarantineEntered,
                &package,
                "package quarantined",
                7,
            ))
            .await;

        if force_stop {
            if let Err(e) = self.caps.force_stop(&package).await {
                self.enforcement_failed(&package, "force_stop", &e).await;
            }
        }

        true
    }

    /// Release a package from quarantine: unblock, then unsuspend.
    ///
    /// Inverse order of entry. Flags clear only for the steps that
    /// succeed, so a failed call leaves the record telling the truth.
    pub(crate) async fn release_quarantine(&self, record: &mut AppTrustRecord) {
        if !record.quarantined {
            return;
        }

        let package = record.package.clone();

        if record.network_blocked {
            match self.caps.uid_of(&package).await {
                Ok(uid) => match self.caps.net_block(uid, false).await {
                    Ok(()) => record.network_blocked = false,
                    Err(e) => self.enforcement_failed(&package, "net_unblock", &e).await,
                },
                Err(e) => self.enforcement_failed(&package, "net_unblock", &e).await,
            }
        }

        if record.suspended {
            match self.caps.suspend(&package, false).await {
                Ok(()) => record.suspended = false,
                Err(e) => self.enforcement_failed(&package, "unsuspend", &e).await,
            }
        }

        record.quarantined = false;
        record.recompute_status();

        info!(package = %package, score = record.score, "package released from quarantine");
        self.bus
            .publish(Event::core(
                EventKind::QuarantineReleased,
                &package,
                "package released from quarantine",
                3,
            ))
            .await;
    }

    /// Revoke one permission, surfacing failure as an event.
    async fn try_revoke(&self, record: &AppTrustRecord, permission: &str) {
        if let Err(e) = self.caps.revoke(&record.package, permission).await {
            self.enforcement_failed(&record.package, "revoke", &e).await;
        }
    }

    /// Log and emit a single enforcement failure.
    async fn enforcement_failed(&self, package: &str, action: &str, err: &CoreError) {
        warn!(package, action, error = %err, "enforcement call failed");
        let mut event = Event::core(
            EventKind::EnforcementFailed,
            package,
            format!("{action} failed"),
            6,
        );
        event.data = serde_json::json!({ "action": action, "error": err.kind() });
        self.bus.publish(event).await;
    }
}
