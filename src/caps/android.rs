//! Shell-backed capability implementation for rooted Android.
//!
//! Wraps `pm`, `am`, `iptables`, and `dumpsys` with explicit argument
//! vectors; nothing is ever interpolated into a shell line. Output is
//! parsed with anchored regular expressions and reduced to the declared
//! result types.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::error::CoreError;

use super::Capabilities;

/// Capability layer speaking to the Android package manager and netfilter.
pub struct AndroidCaps {
    budget: Duration,
    installer_re: Regex,
    uid_re: Regex,
    foreground_re: Regex,
}

impl AndroidCaps {
    /// Create with the given per-call time budget.
    pub fn new(budget: Duration) -> Self {
        Self {
            budget,
            // pm dump: "    installerPackageName=com.android.vending"
            installer_re: Regex::new(r"installerPackageName=(\S+)").expect("static regex"),
            // pm dump: "    userId=10123"
            uid_re: Regex::new(r"userId=(\d+)").expect("static regex"),
            // dumpsys activity: "  mResumedActivity: ActivityRecord{... com.app/.Main t12}"
            foreground_re: Regex::new(r"mResumedActivity:.*?\s([A-Za-z][\w.]*)/")
                .expect("static regex"),
        }
    }

    /// Run one external tool under the call budget and capture stdout.
    async fn run(&self, program: &str, args: &[&str]) -> Result<String, CoreError> {
        let mut command = Command::new(program);
        command
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!(program, ?args, "capability call");

        let output = tokio::time::timeout(self.budget, command.output())
            .await
            .map_err(|_| CoreError::Timeout(format!("{program} exceeded call budget")))?
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => {
                    CoreError::CapabilityUnavailable(format!("{program} not present"))
                }
                _ => CoreError::Transport(format!("{program}: {e}")),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let detail = stderr.lines().next().unwrap_or("").trim().to_owned();
            warn!(program, ?args, code = ?output.status.code(), "capability call refused");
            return Err(CoreError::Denied(format!(
                "{program} exited {:?}: {detail}",
                output.status.code()
            )));
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// `pm dump <package>` output, mapped to `not_found` when pm does not
    /// know the package.
    async fn pm_dump(&self, package: &str) -> Result<String, CoreError> {
        let out = self.run("pm", &["dump", package]).await?;
        if out.contains("Unable to find package") || out.trim().is_empty() {
            return Err(CoreError::NotFound(format!("package {package}")));
        }
        Ok(out)
    }
}

#[async_trait]
impl Capabilities for AndroidCaps {
    async fn list_packages(&self) -> Result<Vec<String>, CoreError> {
        let out = self.run("pm", &["list", "packages"]).await.map_err(|e| {
            match e {
                CoreError::Denied(d) => CoreError::CapabilityUnavailable(d),
                other => other,
            }
        })?;
        Ok(out
            .lines()
            .filter_map(|line| line.strip_prefix("package:"))
            .map(|p| p.trim().to_owned())
            .filter(|p| !p.is_empty())
            .collect())
    }

    async fn installer_of(&self, package: &str) -> Result<String, CoreError> {
        let dump = self.pm_dump(package).await?;
        let installer = self
            .installer_re
            .captures(&dump)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str())
            .unwrap_or("");
        // pm prints the literal string "null" for unattributed installs.
        if installer == "null" {
            return Ok(String::new());
        }
        Ok(installer.to_owned())
    }

    async fn path_of(&self, package: &str) -> Result<String, CoreError> {
        let out = self.run("pm", &["path", package]).await?;
        match out.lines().find_map(|line| line.strip_prefix("package:")) {
            Some(path) => Ok(path.trim().to_owned()),
            None => {
                if out.trim().is_empty() {
                    Ok(String::new())
                } else {
                    Err(CoreError::NotFound(format!("package {package}")))
                }
            }
        }
    }

    async fn uid_of(&self, package: &str) -> Result<u32, CoreError> {
        let dump = self.pm_dump(package).await?;
        let uid = self
            .uid_re
            .captures(&dump)
            .and_then(|c| c.get(1))
            .and_then(|m| m.as_str().parse::<u32>().ok())
            .ok_or_else(|| CoreError::NotFound(format!("uid of {package}")))?;
        Ok(uid)
    }

    async fn suspend(&self, package: &str, on: bool) -> Result<(), CoreError> {
        let verb = if on { "suspend" } else { "unsuspend" };
        self.run("pm", &[verb, package]).await?;
        Ok(())
    }

    async fn force_stop(&self, package: &str) -> Result<(), CoreError> {
        self.run("am", &["force-stop", package]).await?;
        Ok(())
    }

    async fn revoke(&self, package: &str, permission: &str) -> Result<(), CoreError> {
        self.run("pm", &["revoke", package, permission])
            .await
            .map_err(|e| match e {
                // pm reports unknown permissions as a failed exit with a
                // SecurityException line; keep the taxonomy precise.
                CoreError::Denied(d) if d.contains("Unknown permission") => {
                    CoreError::Protocol(format!("unknown permission {permission}"))
                }
                other => other,
            })?;
        Ok(())
    }

    async fn net_block(&self, uid: u32, on: bool) -> Result<(), CoreError> {
        let action = if on { "-A" } else { "-D" };
        let uid_str = uid.to_string();
        self.run(
            "iptables",
            &[
                action,
                "OUTPUT",
                "-m",
                "owner",
                "--uid-owner",
                &uid_str,
                "-j",
                "DROP",
            ],
        )
        .await?;
        Ok(())
    }

    async fn foreground_app(&self) -> Result<String, CoreError> {
        let out = self
            .run("dumpsys", &["activity", "activities"])
            .await
            .map_err(|e| match e {
                CoreError::Denied(d) => CoreError::CapabilityUnavailable(d),
                other => other,
            })?;
        Ok(self
            .foreground_re
            .captures(&out)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().to_owned())
            .unwrap_or_default())
    }
}
