//! Shared data model: events, trust records, violations, service state.
//!
//! Every enum that crosses a persistence or wire boundary carries an
//! `as_str`/`parse` pair so the stored representation is stable and
//! independent of Rust enum ordering.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::CoreError;

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// Kind of event flowing through the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// Phishing or scam content detected in SMS.
    SmsThreat,
    /// Malicious or suspicious file found by the file scanner.
    FileThreat,
    /// Hostile network activity observed.
    NetworkThreat,
    /// Threat detected inside a messenger application.
    MessengerThreat,
    /// Keylogger behavior detected.
    KeyloggerDetected,
    /// A sensitive permission was exercised.
    PermissionAccess,
    /// An advertising/analytics tracker was blocked.
    TrackerBlocked,
    /// A locked application was opened and challenged.
    AppLockTriggered,
    /// An application probed for root access.
    RootDetectionAttempt,
    /// A supervised service entered the running state.
    ServiceStarted,
    /// A supervised service was stopped.
    ServiceStopped,
    /// A supervised service exhausted its restart budget.
    ServiceError,
    /// A configuration key changed.
    ConfigChanged,
    /// A package was placed in quarantine.
    QuarantineEntered,
    /// A package was released from quarantine.
    QuarantineReleased,
    /// An enforcement capability call failed.
    EnforcementFailed,
}

impl EventKind {
    /// String form used on the wire and in subscriber registries.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SmsThreat => "sms_threat",
            Self::FileThreat => "file_threat",
            Self::NetworkThreat => "network_threat",
            Self::MessengerThreat => "messenger_threat",
            Self::KeyloggerDetected => "keylogger_detected",
            Self::PermissionAccess => "permission_access",
            Self::TrackerBlocked => "tracker_blocked",
            Self::AppLockTriggered => "app_lock_triggered",
            Self::RootDetectionAttempt => "root_detection_attempt",
            Self::ServiceStarted => "service_started",
            Self::ServiceStopped => "service_stopped",
            Self::ServiceError => "service_error",
            Self::ConfigChanged => "config_changed",
            Self::QuarantineEntered => "quarantine_entered",
            Self::QuarantineReleased => "quarantine_released",
            Self::EnforcementFailed => "enforcement_failed",
        }
    }

    /// Parse the wire form.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Protocol`] if the value is not a known kind.
    pub fn parse(s: &str) -> Result<Self, CoreError> {
        match s {
            "sms_threat" => Ok(Self::SmsThreat),
            "file_threat" => Ok(Self::FileThreat),
            "network_threat" => Ok(Self::NetworkThreat),
            "messenger_threat" => Ok(Self::MessengerThreat),
            "keylogger_detected" => Ok(Self::KeyloggerDetected),
            "permission_access" => Ok(Self::PermissionAccess),
            "tracker_blocked" => Ok(Self::TrackerBlocked),
            "app_lock_triggered" => Ok(Self::AppLockTriggered),
            "root_detection_attempt" => Ok(Self::RootDetectionAttempt),
            "service_started" => Ok(Self::ServiceStarted),
            "service_stopped" => Ok(Self::ServiceStopped),
            "service_error" => Ok(Self::ServiceError),
            "config_changed" => Ok(Self::ConfigChanged),
            "quarantine_entered" => Ok(Self::QuarantineEntered),
            "quarantine_released" => Ok(Self::QuarantineReleased),
            "enforcement_failed" => Ok(Self::EnforcementFailed),
            other => Err(CoreError::Protocol(format!("unknown event kind: {other}"))),
        }
    }

    /// Threat kinds count toward the `threats_today` statistic.
    pub fn is_threat(&self) -> bool {
        matches!(
            self,
            Self::SmsThreat
                | Self::FileThreat
                | Self::NetworkThreat
                | Self::MessengerThreat
                | Self::KeyloggerDetected
        )
    }

    /// Mandatory kinds bypass the bus capacity bound.
    pub fn is_mandatory(&self) -> bool {
        matches!(self, Self::ServiceError | Self::QuarantineEntered)
    }
}

/// A single event on the bus.
///
/// `id` is assigned by the bus at publish time and is monotonic for the
/// lifetime of the process. `data` is an opaque JSON payload owned by the
/// producing service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Monotonic event id, assigned on publish.
    #[serde(default)]
    pub id: u64,
    /// Wall-clock time the event was produced.
    pub timestamp: DateTime<Utc>,
    /// Event kind.
    pub kind: EventKind,
    /// Name of the producing service.
    pub source_service: String,
    /// Subject of the event, usually a package identifier.
    #[serde(default)]
    pub target: String,
    /// Human-readable description.
    #[serde(default)]
    pub message: String,
    /// Opaque structured payload.
    #[serde(default)]
    pub data: serde_json::Value,
    /// Severity, 0 (informational) to 10 (critical).
    pub severity: u8,
}

impl Event {
    /// Build an event originating from the core itself.
    pub fn core(
        kind: EventKind,
        target: impl Into<String>,
        message: impl Into<String>,
        severity: u8,
    ) -> Self {
        Self {
            id: 0,
            timestamp: Utc::now(),
            kind,
            source_service: "core".to_owned(),
            target: target.into(),
            message: message.into(),
            data: serde_json::Value::Null,
            severity,
        }
    }
}

// ---------------------------------------------------------------------------
// Trust model
// ---------------------------------------------------------------------------

/// Where a package was installed from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstallSource {
    /// Google Play (`com.android.vending`).
    PlayStore,
    /// Samsung Galaxy Store.
    GalaxyStore,
    /// Xiaomi GetApps / Market.
    XiaomiStore,
    /// Huawei AppGallery.
    HuaweiStore,
    /// Amazon Appstore.
    AmazonStore,
    /// F-Droid.
    Fdroid,
    /// Manually installed APK.
    Sideload,
    /// Installed over `adb install`.
    Adb,
    /// Preinstalled system package.
    System,
    /// Installer could not be determined.
    Unknown,
}

impl InstallSource {
    /// Initial trust score granted at registration.
    pub fn initial_score(&self) -> i32 {
        match self {
            Self::PlayStore => 80,
            Self::GalaxyStore | Self::XiaomiStore | Self::HuaweiStore => 75,
            Self::AmazonStore => 70,
            Self::Fdroid => 85,
            Self::Sideload => 20,
            Self::Adb => 30,
            Self::System => 100,
            Self::Unknown => 20,
        }
    }

    /// Highest score a package from this source can ever reach.
    pub fn max_score(&self) -> i32 {
        match self {
            Self::PlayStore | Self::Fdroid => 95,
            Self::GalaxyStore | Self::XiaomiStore | Self::HuaweiStore => 90,
            Self::AmazonStore => 85,
            Self::Sideload => 70,
            Self::Adb => 75,
            Self::System => 100,
            Self::Unknown => 60,
        }
    }

    /// Sources that trigger install-time quarantine.
    pub fn is_untrusted(&self) -> bool {
        matches!(self, Self::Sideload | Self::Adb | Self::Unknown)
    }

    /// Stable string form.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PlayStore => "play_store",
            Self::GalaxyStore => "galaxy_store",
            Self::XiaomiStore => "xiaomi_store",
            Self::HuaweiStore => "huawei_store",
            Self::AmazonStore => "amazon_store",
            Self::Fdroid => "fdroid",
            Self::Sideload => "sideload",
            Self::Adb => "adb",
            Self::System => "system",
            Self::Unknown => "unknown",
        }
    }
}

/// Status band derived from the trust score.
///
/// `System` is sticky: preinstalled packages keep it regardless of score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AppStatus {
    /// Score 80 and above.
    Trusted,
    /// Score 50–79.
    Normal,
    /// Score 20–49.
    Suspicious,
    /// Score below 20.
    Quarantined,
    /// Preinstalled system package, never scored.
    System,
}

impl AppStatus {
    /// Derive the status band from a score.
    pub fn from_score(score: i32) -> Self {
        if score >= 80 {
            Self::Trusted
        } else if score >= 50 {
            Self::Normal
        } else if score >= 20 {
            Self::Suspicious
        } else {
            Self::Quarantined
        }
    }

    /// Stable string form.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Trusted => "trusted",
            Self::Normal => "normal",
            Self::Suspicious => "suspicious",
            Self::Quarantined => "quarantined",
            Self::System => "system",
        }
    }
}

/// Categorized bad behavior, each with a fixed score penalty.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationKind {
    /// Camera opened without visible UI.
    HiddenCamera,
    /// Microphone opened without visible UI.
    HiddenMicrophone,
    /// Accessibility service abused for input capture.
    AccessibilityAbuse,
    /// Bulk read of the photo gallery.
    GalleryScan,
    /// Bulk filesystem scan.
    FileScan,
    /// Contacts exported off-device.
    ContactExport,
    /// SMS inbox read.
    SmsRead,
    /// Clipboard contents read in background.
    ClipboardSnoop,
    /// Notification contents read.
    NotificationRead,
    /// Call log accessed.
    CallLogAccess,
    /// Location polled from background.
    BackgroundLocation,
    /// Sustained abnormal battery use.
    BatteryDrain,
    /// Abnormally high data transfer.
    DataUsageHigh,
    /// Screen overlay drawn over other apps.
    OverlayUsage,
    /// Auto-start at boot.
    BootStart,
}

impl ViolationKind {
    /// Fixed penalty applied to the score (always negative).
    pub fn penalty(&self) -> i32 {
        match self {
            Self::HiddenCamera | Self::HiddenMicrophone | Self::AccessibilityAbuse => -30,
            Self::GalleryScan | Self::FileScan | Self::ContactExport | Self::SmsRead => -20,
            Self::ClipboardSnoop | Self::NotificationRead | Self::CallLogAccess => -15,
            Self::BackgroundLocation | Self::BatteryDrain | Self::DataUsageHigh => -10,
            Self::OverlayUsage | Self::BootStart => -5,
        }
    }

    /// Stable string form.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::HiddenCamera => "hidden_camera",
            Self::HiddenMicrophone => "hidden_microphone",
            Self::AccessibilityAbuse => "accessibility_abuse",
            Self::GalleryScan => "gallery_scan",
            Self::FileScan => "file_scan",
            Self::ContactExport => "contact_export",
            Self::SmsRead => "sms_read",
            Self::ClipboardSnoop => "clipboard_snoop",
            Self::NotificationRead => "notification_read",
            Self::CallLogAccess => "call_log_access",
            Self::BackgroundLocation => "background_location",
            Self::BatteryDrain => "battery_drain",
            Self::DataUsageHigh => "data_usage_high",
            Self::OverlayUsage => "overlay_usage",
            Self::BootStart => "boot_start",
        }
    }

    /// Parse the stable string form.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Protocol`] if the value is not a known kind.
    pub fn parse(s: &str) -> Result<Self, CoreError> {
        match s {
            "hidden_camera" => Ok(Self::HiddenCamera),
            "hidden_microphone" => Ok(Self::HiddenMicrophone),
            "accessibility_abuse" => Ok(Self::AccessibilityAbuse),
            "gallery_scan" => Ok(Self::GalleryScan),
            "file_scan" => Ok(Self::FileScan),
            "contact_export" => Ok(Self::ContactExport),
            "sms_read" => Ok(Self::SmsRead),
            "clipboard_snoop" => Ok(Self::ClipboardSnoop),
            "notification_read" => Ok(Self::NotificationRead),
            "call_log_access" => Ok(Self::CallLogAccess),
            "background_location" => Ok(Self::BackgroundLocation),
            "battery_drain" => Ok(Self::BatteryDrain),
            "data_usage_high" => Ok(Self::DataUsageHigh),
            "overlay_usage" => Ok(Self::OverlayUsage),
            "boot_start" => Ok(Self::BootStart),
            other => Err(CoreError::Protocol(format!(
                "unknown violation kind: {other}"
            ))),
        }
    }
}

/// Per-package trust state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppTrustRecord {
    /// OS-level package identifier, the primary key.
    pub package: String,
    /// Display name; falls back to the package identifier.
    pub display_name: String,
    /// Classified install source.
    pub install_source: InstallSource,
    /// Current score, clamped to `[0, max_score]`.
    pub score: i32,
    /// Source-dependent score ceiling.
    pub max_score: i32,
    /// Status band derived from the score (`System` is sticky).
    pub status: AppStatus,
    /// First time the package was observed.
    pub first_seen: DateTime<Utc>,
    /// Time of the most recent violation, if any.
    pub last_violation: Option<DateTime<Utc>>,
    /// Time of the most recent reward.
    pub last_good_behavior: DateTime<Utc>,
    /// Total violations recorded.
    pub violation_count: u32,
    /// Consecutive days without a violation.
    pub good_streak_days: u32,
    /// User marked the package as trusted; scoring becomes a no-op.
    pub whitelisted: bool,
    /// Package is currently quarantined.
    pub quarantined: bool,
    /// Package is suspended at the OS level.
    pub suspended: bool,
    /// Package traffic is blackholed.
    pub network_blocked: bool,
    /// Detectors should serve this package coarse location data.
    #[serde(default)]
    pub fuzzy_location: bool,
}

impl AppTrustRecord {
    /// Fresh record for a newly observed package.
    pub fn new(package: impl Into<String>, source: InstallSource) -> Self {
        let package = package.into();
        let score = source.initial_score();
        let status = if source == InstallSource::System {
            AppStatus::System
        } else {
            AppStatus::from_score(score)
        };
        let now = Utc::now();
        Self {
            display_name: package.clone(),
            package,
            install_source: source,
            score,
            max_score: source.max_score(),
            status,
            first_seen: now,
            last_violation: None,
            last_good_behavior: now,
            violation_count: 0,
            good_streak_days: 0,
            whitelisted: false,
            quarantined: false,
            suspended: false,
            network_blocked: false,
            fuzzy_location: false,
        }
    }

    /// Recompute the derived status band; `System` never changes.
    pub fn recompute_status(&mut self) {
        if self.status != AppStatus::System {
            self.status = AppStatus::from_score(self.score);
        }
    }
}

/// One immutable entry in the violation ledger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ViolationRecord {
    /// Monotonic id assigned by the store on append.
    pub id: u64,
    /// Offending package.
    pub package: String,
    /// Categorized behavior.
    pub kind: ViolationKind,
    /// Penalty that was applied (negative).
    pub penalty: i32,
    /// When the violation was recorded.
    pub timestamp: DateTime<Utc>,
    /// Free-form detail from the detector.
    pub context: String,
    /// Whether the behavior itself was blocked by a detector.
    pub was_blocked: bool,
}

// ---------------------------------------------------------------------------
// Services
// ---------------------------------------------------------------------------

/// Lifecycle state of a supervised service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceStatus {
    /// Not yet started.
    Unknown,
    /// Spawned, liveness not yet confirmed.
    Starting,
    /// Alive with a live pid.
    Running,
    /// Termination in progress.
    Stopping,
    /// Exited or stopped on request.
    Stopped,
    /// Restart budget exhausted; absorbing.
    Error,
}

impl ServiceStatus {
    /// Numeric code used in the `services` control response.
    pub fn code(&self) -> u8 {
        match self {
            Self::Unknown => 0,
            Self::Starting => 1,
            Self::Running => 2,
            Self::Stopping => 3,
            Self::Stopped => 4,
            Self::Error => 5,
        }
    }
}

/// Static definition of one supervised service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceDescriptor {
    /// Unique service name.
    pub name: String,
    /// Absolute path of the service binary.
    pub binary_path: String,
    /// Arguments passed to the binary.
    #[serde(default)]
    pub args: Vec<String>,
    /// Path of the service's request/event socket.
    pub socket_path: String,
    /// Start this service when the daemon starts.
    #[serde(default = "default_true")]
    pub auto_start: bool,
    /// Restart on unexpected exit.
    #[serde(default = "default_true")]
    pub auto_restart: bool,
    /// Delay between an exit and the restart attempt.
    #[serde(default = "default_restart_delay_ms")]
    pub restart_delay_ms: u64,
    /// Restarts allowed inside one failure streak.
    #[serde(default = "default_max_restarts")]
    pub max_restarts: u32,
}

fn default_true() -> bool {
    true
}

fn default_restart_delay_ms() -> u64 {
    5000
}

fn default_max_restarts() -> u32 {
    5
}
