//! In-memory capability fake that records every call.
//!
//! Used by the test suites to assert exactly which enforcement calls were
//! made and in what order, and to inject failures at the capability
//! boundary. Query results (installer, path, uid) are scripted per package.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::CoreError;

use super::Capabilities;

/// One recorded capability invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CapCall {
    /// `suspend(package, on)`.
    Suspend {
        /// Target package.
        package: String,
        /// Suspend (`true`) or unsuspend.
        on: bool,
    },
    /// `force_stop(package)`.
    ForceStop {
        /// Target package.
        package: String,
    },
    /// `revoke(package, permission)`.
    Revoke {
        /// Target package.
        package: String,
        /// Revoked permission id.
        permission: String,
    },
    /// `net_block(uid, on)`.
    NetBlock {
        /// Target uid.
        uid: u32,
        /// Insert (`true`) or remove the drop rule.
        on: bool,
    },
}

#[derive(Default)]
struct Script {
    installers: HashMap<String, String>,
    paths: HashMap<String, String>,
    uids: HashMap<String, u32>,
    packages: Vec<String>,
    foreground: String,
    deny: Vec<&'static str>,
}

/// Scriptable recording fake of the capability layer.
#[derive(Default)]
pub struct RecordingCaps {
    calls: Mutex<Vec<CapCall>>,
    script: Mutex<Script>,
}

impl RecordingCaps {
    /// Empty fake: every query resolves to "unknown", every action succeeds.
    pub fn new() -> Self {
        Self::default()
    }

    /// Script the installer reported for a package.
    pub fn set_installer(&self, package: &str, installer: &str) {
        self.lock_script()
            .installers
            .insert(package.to_owned(), installer.to_owned());
    }

    /// Script the APK path reported for a package.
    pub fn set_path(&self, package: &str, path: &str) {
        self.lock_script()
            .paths
            .insert(package.to_owned(), path.to_owned());
    }

    /// Script the uid reported for a package.
    pub fn set_uid(&self, package: &str, uid: u32) {
        self.lock_script().uids.insert(package.to_owned(), uid);
    }

    /// Script the installed package list.
    pub fn set_packages(&self, packages: &[&str]) {
        self.lock_script().packages = packages.iter().map(|p| (*p).to_owned()).collect();
    }

    /// Script the foreground package.
    pub fn set_foreground(&self, package: &str) {
        self.lock_script().foreground = package.to_owned();
    }

    /// Make the named operation fail with `denied` from now on.
    /// Operations: `suspend`, `force_stop`, `revoke`, `net_block`.
    pub fn deny(&self, operation: &'static str) {
        self.lock_script().deny.push(operation);
    }

    /// All calls recorded so far, in order.
    pub fn calls(&self) -> Vec<CapCall> {
        self.lock_calls().clone()
    }

    /// Drop the recorded history.
    pub fn clear_calls(&self) {
        self.lock_calls().clear();
    }

    fn check_denied(&self, operation: &'static str) -> Result<(), CoreError> {
        if self.lock_script().deny.contains(&operation) {
            return Err(CoreError::Denied(format!("{operation} scripted to fail")));
        }
        Ok(())
    }

    fn lock_calls(&self) -> std::sync::MutexGuard<'_, Vec<CapCall>> {
        self.calls
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_script(&self) -> std::sync::MutexGuard<'_, Script> {
        self.script
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl Capabilities for RecordingCaps {
    async fn list_packages(&self) -> Result<Vec<String>, CoreError> {
        Ok(self.lock_script().packages.clone())
    }

    async fn installer_of(&self, package: &str) -> Result<String, CoreError> {
        Ok(self
            .lock_script()
            .installers
            .get(package)
            .cloned()
            .unwrap_or_default())
    }

    async fn path_of(&self, package: &str) -> Result<String, CoreError> {
        Ok(self
            .lock_script()
            .paths
            .get(package)
            .cloned()
            .unwrap_or_default())
    }

    async fn uid_of(&self, package: &str) -> Result<u32, CoreError> {
        self.lock_script()
            .uids
            .get(package)
            .copied()
            .ok_or_else(|| CoreError::NotFound(format!("package {package}")))
    }

    async fn suspend(&self, package: &str, on: bool) -> Result<(), CoreError> {
        self.check_denied("suspend")?;
        self.lock_calls().push(CapCall::Suspend {
            package: package.to_owned(),
            on,
        });
        Ok(())
    }

    async fn force_stop(&self, package: &str) -> Result<(), CoreError> {
        self.check_denied("force_stop")?;
        self.lock_calls().push(CapCall::ForceStop {
            package: package.to_owned(),
        });
        Ok(())
    }

    async fn revoke(&self, package: &str, permission: &str) -> Result<(), CoreError> {
        self.check_denied("revoke")?;
        self.lock_calls().push(CapCall::Revoke {
            package: package.to_owned(),
            permission: permission.to_owned(),
        });
        Ok(())
    }

    async fn net_block(&self, uid: u32, on: bool) -> Result<(), CoreError> {
        self.check_denied("net_block")?;
        self.lock_calls().push(CapCall::NetBlock { uid, on });
        Ok(())
    }

    async fn foreground_app(&self) -> Result<String, CoreError> {
        Ok(self.lock_script().foreground.clone())
    }
}
