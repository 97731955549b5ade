//! `clarad` — the CLARA core daemon.
//!
//! Loads configuration (`CLARA_CONFIG` overrides the default path),
//! initialises logging, builds the [`CoreContext`], and runs until
//! SIGTERM or SIGINT. Any fatal startup error is logged and the process
//! exits non-zero; runtime errors never crash the core.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing::{error, info};

use clarad::caps::AndroidCaps;
use clarad::config::DaemonConfig;
use clarad::runtime::CoreContext;

/// Default location of the typed daemon configuration.
const DEFAULT_CONFIG_PATH: &str = "/data/clara/clarad.json";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = std::env::var("CLARA_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH));

    let config = DaemonConfig::load(&config_path).context("failed to load configuration")?;

    let _logging_guard =
        clarad::logging::init(&config).context("failed to initialise logging")?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %config_path.display(),
        "clarad starting"
    );

    let caps = Arc::new(AndroidCaps::new(Duration::from_millis(
        config.timing.cap_timeout_ms,
    )));

    let (context, dispatcher) =
        CoreContext::initialize(config, caps).context("failed to initialise core")?;

    let result = context.run(dispatcher, wait_for_signal()).await;
    if let Err(e) = &result {
        error!(error = %e, "core exited with error");
    }
    result
}

/// Resolve when SIGTERM or SIGINT arrives.
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut term = match signal(SignalKind::terminate()) {
        Ok(term) => term,
        Err(e) => {
            error!(error = %e, "cannot install SIGTERM handler");
            std::future::pending::<()>().await;
            return;
        }
    };

    tokio::select! {
        _ = term.recv() => info!("SIGTERM received"),
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                error!(error = %e, "signal wait failed");
            } else {
                info!("SIGINT received");
            }
        }
    }
}
