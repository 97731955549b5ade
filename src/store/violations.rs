//! Append-only violation ledger.
//!
//! One JSON object per line, opened with `O_APPEND` so every write lands at
//! the end regardless of interleaving. Ids are monotonic and assigned at
//! append time; the next id is recovered on open by replaying the file. A
//! torn trailing line (crash mid-write) is skipped on replay; the ledger
//! never rewrites existing bytes.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use chrono::Utc;
use tracing::{info, warn};

use crate::error::CoreError;
use crate::types::{ViolationKind, ViolationRecord};

/// Append-only log of [`ViolationRecord`]s.
pub struct ViolationLog {
    path: PathBuf,
    file: File,
    next_id: u64,
    entries: u64,
}

impl ViolationLog {
    /// Open (or create) the log and recover the next id.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Transport`] if the file cannot be opened.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, CoreError> {
        let path = path.into();
        let (next_id, entries) = replay_ids(&path)?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)?;
        restrict_mode(&file)?;
        info!(path = %path.display(), entries, next_id, "violation log opened");
        Ok(Self {
            path,
            file,
            next_id,
            entries,
        })
    }

    /// Append a violation, assigning the next monotonic id.
    ///
    /// The line is flushed before the call returns so a subsequent reader
    /// observes it.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Transport`] on write failure.
    pub fn append(
        &mut self,
        package: &str,
        kind: ViolationKind,
        context: &str,
        was_blocked: bool,
    ) -> Result<ViolationRecord, CoreError> {
        let record = ViolationRecord {
            id: self.next_id,
            package: package.to_owned(),
            kind,
            penalty: kind.penalty(),
            timestamp: Utc::now(),
            context: context.to_owned(),
            was_blocked,
        };
        let line = serde_json::to_string(&record)?;
        writeln!(self.file, "{line}")?;
        self.file.flush()?;
        self.next_id += 1;
        self.entries += 1;
        Ok(record)
    }

    /// Total entries appended over the log's lifetime.
    pub fn len(&self) -> u64 {
        self.entries
    }

    /// Whether the log has no entries.
    pub fn is_empty(&self) -> bool {
        self.entries == 0
    }

    /// The most recent `count` records, newest first.
    ///
    /// Reads the file back in; the ledger is small and bounded by the
    /// device's app population, not by event volume.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Transport`] on read failure.
    pub fn recent(&self, count: usize) -> Result<Vec<ViolationRecord>, CoreError> {
        let mut records = read_all(&self.path)?;
        records.reverse();
        records.truncate(count);
        Ok(records)
    }

    /// All records for one package, in id order.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Transport`] on read failure.
    pub fn for_package(&self, package: &str) -> Result<Vec<ViolationRecord>, CoreError> {
        Ok(read_all(&self.path)?
            .into_iter()
            .filter(|r| r.package == package)
            .collect())
    }
}

#[cfg(unix)]
fn restrict_mode(file: &File) -> Result<(), CoreError> {
    use std::os::unix::fs::PermissionsExt;
    let mut perms = file.metadata()?.permissions();
    perms.set_mode(0o600);
    file.set_permissions(perms)?;
    Ok(())
}

/// Replay the file to find the next id and entry count.
fn replay_ids(path: &Path) -> Result<(u64, u64), CoreError> {
    if !path.exists() {
        return Ok((1, 0));
    }
    let records = read_all(path)?;
    let next = records.last().map_or(1, |r| r.id + 1);
    Ok((next, records.len() as u64))
}

/// Read every parseable line, skipping malformed ones.
fn read_all(path: &Path) -> Result<Vec<ViolationRecord>, CoreError> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let reader = BufReader::new(File::open(path)?);
    let mut records = Vec::new();
    for line in reader.lines() {
        let line = line?;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        match serde_json::from_str::<ViolationRecord>(trimmed) {
            Ok(record) => records.push(record),
            Err(e) => {
                warn!(error = %e, "skipping malformed violation line");
            }
        }
    }
    Ok(records)
}
