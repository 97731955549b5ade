//! Capability layer: the narrow, typed boundary to the OS.
//!
//! Everything the daemon does to the outside world (package queries,
//! suspension, permission revocation, packet-filter rules) goes through
//! the [`Capabilities`] trait. Implementations normalize raw tool output
//! into the declared result types; raw command output never crosses this
//! boundary. Each call is idempotent and individually timeboxed.

pub mod android;
pub mod recording;

use async_trait::async_trait;

use crate::error::CoreError;

pub use self::android::AndroidCaps;
pub use self::recording::{CapCall, RecordingCaps};

/// Typed OS operations. All side effects of the daemon are behind this.
#[async_trait]
pub trait Capabilities: Send + Sync {
    /// List every installed package identifier.
    async fn list_packages(&self) -> Result<Vec<String>, CoreError>;

    /// Installer package of `package`, or empty when unattributed.
    async fn installer_of(&self, package: &str) -> Result<String, CoreError>;

    /// Filesystem path of the package's APK, or empty when unknown.
    async fn path_of(&self, package: &str) -> Result<String, CoreError>;

    /// Numeric uid assigned to the package.
    async fn uid_of(&self, package: &str) -> Result<u32, CoreError>;

    /// Suspend (`on = true`) or unsuspend the package.
    async fn suspend(&self, package: &str, on: bool) -> Result<(), CoreError>;

    /// Force-stop the package's processes.
    async fn force_stop(&self, package: &str) -> Result<(), CoreError>;

    /// Revoke a runtime permission from the package.
    async fn revoke(&self, package: &str, permission: &str) -> Result<(), CoreError>;

    /// Insert (`on = true`) or remove the packet-filter drop rule for a uid.
    async fn net_block(&self, uid: u32, on: bool) -> Result<(), CoreError>;

    /// Package currently in the foreground, or empty when undetermined.
    async fn foreground_app(&self) -> Result<String, CoreError>;
}
