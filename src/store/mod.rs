//! Persistent store: checkpointed trust records plus the violation ledger.
//!
//! Single-writer, many-reader. Record reads go through a shared lock on the
//! in-memory map; every mutation rewrites the checkpoint atomically before
//! the write lock is released. Ledger appends and the record update they
//! belong to commit under the same write lock, so a violation can never be
//! observed without its score change or vice versa.
//!
//! All I/O is synchronous `std::fs`; these are quick local writes and the
//! store is never touched from the dispatch hot path.

pub mod checkpoint;
pub mod violations;

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Mutex, RwLock};

use tracing::debug;

use crate::error::CoreError;
use crate::types::{AppTrustRecord, ViolationKind, ViolationRecord};

use self::checkpoint::Checkpoint;
use self::violations::ViolationLog;

/// Durable home of all trust state.
pub struct TrustStore {
    records: RwLock<HashMap<String, AppTrustRecord>>,
    checkpoint: Checkpoint,
    log: Mutex<ViolationLog>,
}

impl TrustStore {
    /// Open both stores, recovering the last durably written state.
    ///
    /// # Errors
    ///
    /// Returns an error if either file exists but cannot be read or parsed.
    pub fn open(checkpoint_path: &Path, log_path: &Path) -> Result<Self, CoreError> {
        let checkpoint = Checkpoint::new(checkpoint_path);
        let records = checkpoint.load()?;
        let log = ViolationLog::open(log_path)?;
        Ok(Self {
            records: RwLock::new(records),
            checkpoint,
            log: Mutex::new(log),
        })
    }

    /// Fetch one record by package.
    pub fn get(&self, package: &str) -> Option<AppTrustRecord> {
        self.read_records().get(package).cloned()
    }

    /// Whether a record exists for the package.
    pub fn contains(&self, package: &str) -> bool {
        self.read_records().contains_key(package)
    }

    /// Point-in-time snapshot of every record.
    pub fn all(&self) -> Vec<AppTrustRecord> {
        let mut records: Vec<AppTrustRecord> = self.read_records().values().cloned().collect();
        records.sort_by(|a, b| a.package.cmp(&b.package));
        records
    }

    /// Number of known packages.
    pub fn len(&self) -> usize {
        self.read_records().len()
    }

    /// Whether the store has no records.
    pub fn is_empty(&self) -> bool {
        self.read_records().is_empty()
    }

    /// Insert or replace one record and checkpoint the map.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Transport`] if the checkpoint write fails; the
    /// in-memory map is not updated in that case.
    pub fn put(&self, record: AppTrustRecord) -> Result<(), CoreError> {
        let mut records = self.write_records();
        let mut staged = records.clone();
        staged.insert(record.package.clone(), record);
        self.checkpoint.save(&staged)?;
        *records = staged;
        Ok(())
    }

    /// Commit a violation and its score change as one transaction.
    ///
    /// Appends to the ledger and replaces the record under a single write
    /// lock. The ledger append happens first; if the checkpoint write then
    /// fails the record is left unchanged in memory and the error is
    /// surfaced, so the caller can retry the score application against the
    /// already-durable ledger entry.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Transport`] on ledger or checkpoint failure.
    pub fn commit_violation(
        &self,
        record: AppTrustRecord,
        kind: ViolationKind,
        context: &str,
        was_blocked: bool,
    ) -> Result<ViolationRecord, CoreError> {
        let mut records = self.write_records();
        let violation = self
            .lock_log()
            .append(&record.package, kind, context, was_blocked)?;

        let mut staged = records.clone();
        staged.insert(record.package.clone(), record);
        self.checkpoint.save(&staged)?;
        *records = staged;

        debug!(
            package = %violation.package,
            id = violation.id,
            kind = violation.kind.as_str(),
            "violation committed"
        );
        Ok(violation)
    }

    /// Most recent violations, newest first.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Transport`] on read failure.
    pub fn recent_violations(&self, count: usize) -> Result<Vec<ViolationRecord>, CoreError> {
        self.lock_log().recent(count)
    }

    /// All violations for one package, in id order.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Transport`] on read failure.
    pub fn violations_for(&self, package: &str) -> Result<Vec<ViolationRecord>, CoreError> {
        self.lock_log().for_package(package)
    }

    /// Total violations appended over the ledger's lifetime.
    pub fn violation_count(&self) -> u64 {
        self.lock_log().len()
    }

    /// Rewrite the checkpoint from current memory state.
    ///
    /// Called once during shutdown; individual mutations already
    /// checkpoint, so this only matters if a previous write failed.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Transport`] on write failure.
    pub fn flush(&self) -> Result<(), CoreError> {
        let records = self.read_records();
        self.checkpoint.save(&records)
    }

    fn read_records(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, AppTrustRecord>> {
        self.records.read().unwrap_or_else(|poisoned| {
            // A writer panicked mid-update; the map itself is still
            // structurally sound because updates swap a staged clone.
            poisoned.into_inner()
        })
    }

    fn write_records(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, AppTrustRecord>> {
        self.records
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_log(&self) -> std::sync::MutexGuard<'_, ViolationLog> {
        self.log
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
