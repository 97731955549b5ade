//! Crash-atomic checkpoint file for the trust record map.
//!
//! Writes go to a sibling temp file which is fsynced and then renamed over
//! the target, so a reader (or a restart) sees either the old or the new
//! map, never a torn one.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::error::CoreError;
use crate::types::AppTrustRecord;

/// Replace `path` with `bytes` atomically: temp file, fsync, rename.
///
/// The file is created with mode `0600`; daemon state must not be readable
/// by non-root users.
///
/// # Errors
///
/// Returns [`CoreError::Transport`] on any I/O failure.
pub fn atomic_replace(path: &Path, bytes: &[u8]) -> Result<(), CoreError> {
    let tmp = temp_path(path);
    {
        let mut file = std::fs::File::create(&tmp)?;
        restrict_mode(&file)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }
    std::fs::rename(&tmp, path)?;
    Ok(())
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".tmp");
    PathBuf::from(name)
}

#[cfg(unix)]
fn restrict_mode(file: &std::fs::File) -> Result<(), CoreError> {
    use std::os::unix::fs::PermissionsExt;
    let mut perms = file.metadata()?.permissions();
    perms.set_mode(0o600);
    file.set_permissions(perms)?;
    Ok(())
}

/// Checkpointed map of trust records keyed by package.
pub struct Checkpoint {
    path: PathBuf,
}

impl Checkpoint {
    /// Bind a checkpoint to its on-disk path.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Load the last durably written map.
    ///
    /// A missing file yields an empty map. A leftover temp file from an
    /// interrupted write is deleted and ignored.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Protocol`] if the checkpoint exists but cannot
    /// be parsed, or [`CoreError::Transport`] on read failure.
    pub fn load(&self) -> Result<HashMap<String, AppTrustRecord>, CoreError> {
        let tmp = temp_path(&self.path);
        if tmp.exists() {
            warn!(path = %tmp.display(), "discarding interrupted checkpoint write");
            let _ = std::fs::remove_file(&tmp);
        }

        if !self.path.exists() {
            return Ok(HashMap::new());
        }

        let contents = std::fs::read_to_string(&self.path)?;
        let records: Vec<AppTrustRecord> = serde_json::from_str(&contents)
            .map_err(|e| CoreError::Protocol(format!("checkpoint {}: {e}", self.path.display())))?;
        let map: HashMap<String, AppTrustRecord> = records
            .into_iter()
            .map(|r| (r.package.clone(), r))
            .collect();
        info!(path = %self.path.display(), records = map.len(), "trust checkpoint loaded");
        Ok(map)
    }

    /// Write the full map atomically.
    ///
    /// Records are serialized sorted by package so rewrites of unchanged
    /// state produce identical bytes.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Transport`] on I/O failure.
    pub fn save(&self, records: &HashMap<String, AppTrustRecord>) -> Result<(), CoreError> {
        let mut sorted: Vec<&AppTrustRecord> = records.values().collect();
        sorted.sort_by(|a, b| a.package.cmp(&b.package));
        let bytes = serde_json::to_vec_pretty(&sorted)?;
        atomic_replace(&self.path, &bytes)
    }
}
