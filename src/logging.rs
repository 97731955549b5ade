//! Logging for the daemon: JSON lines on disk, human-readable stderr.
//!
//! Log files live under the daemon's data directory next to the trust
//! store and are subject to the same rule as the rest of the persisted
//! state: readable by root only. Files rotate daily as
//! `clarad.<date>.jsonl` and old rotations are pruned so a quiet device
//! does not accumulate months of logs.

use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::config::DaemonConfig;

/// Rotated files kept on disk before the appender prunes the oldest.
const MAX_LOG_FILES: usize = 14;

/// Holds the non-blocking writer guard for file logging.
///
/// Must be kept alive for the lifetime of the process; dropping it flushes
/// pending entries and closes the file.
pub struct LoggingGuard {
    _guard: WorkerGuard,
}

/// Initialise logging from the daemon configuration.
///
/// Field-structured JSON goes to `<data_dir>/logs/clarad.<date>.jsonl`
/// through a non-blocking writer; a compact console layer mirrors events
/// to stderr. Verbosity comes from `RUST_LOG`, defaulting to `info`.
///
/// # Errors
///
/// Returns an error if the logs directory cannot be created or secured,
/// or if the file appender rejects its configuration.
pub fn init(config: &DaemonConfig) -> anyhow::Result<LoggingGuard> {
    let logs_dir = config.logs_dir();
    prepare_logs_dir(&logs_dir)?;

    let file_appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix("clarad")
        .filename_suffix("jsonl")
        .max_log_files(MAX_LOG_FILES)
        .build(&logs_dir)
        .map_err(|e| anyhow::anyhow!("cannot open log file in {}: {e}", logs_dir.display()))?;
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();

    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .flatten_event(true)
                .with_writer(non_blocking),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .compact()
                .with_writer(std::io::stderr),
        )
        .init();

    Ok(LoggingGuard { _guard: guard })
}

/// Create the logs directory and deny access to non-root users.
fn prepare_logs_dir(logs_dir: &Path) -> anyhow::Result<()> {
    std::fs::create_dir_all(logs_dir).map_err(|e| {
        anyhow::anyhow!(
            "failed to create logs directory {}: {e}",
            logs_dir.display()
        )
    })?;
    restrict_dir_mode(logs_dir)
}

#[cfg(unix)]
fn restrict_dir_mode(logs_dir: &Path) -> anyhow::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let mut perms = std::fs::metadata(logs_dir)?.permissions();
    perms.set_mode(0o700);
    std::fs::set_permissions(logs_dir, perms)?;
    Ok(())
}
