//! Control plane: the local request/response socket for UI and CLI.
//!
//! One command per connection: read a single line (4096 bytes max, 5 s
//! deadline), write a single line of JSON, close. Concurrency is a small
//! semaphore-bounded pool over the accept loop. Every response is built
//! through `serde_json`; error kinds from the taxonomy pass through
//! unchanged and raw OS detail stays out of the `error` field.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use serde_json::json;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{watch, Semaphore};
use tracing::{debug, info, warn};

use crate::bus::EventBus;
use crate::config::{ConfigMap, DaemonConfig};
use crate::error::CoreError;
use crate::runtime::RuntimeStats;
use crate::supervisor::ServiceSupervisor;
use crate::trust::TrustEngine;
use crate::types::{Event, EventKind};

/// Maximum request line length in bytes.
pub const MAX_REQUEST_BYTES: u64 = 4096;

/// Shared handles every command handler works against.
pub struct ControlDeps {
    /// Service supervisor for lifecycle and forwarding commands.
    pub supervisor: Arc<ServiceSupervisor>,
    /// Trust engine for score queries and whitelist changes.
    pub trust: Arc<TrustEngine>,
    /// Bus for `events_processed` and `config_changed` emission.
    pub bus: EventBus,
    /// Process-wide counters.
    pub stats: Arc<RuntimeStats>,
    /// Runtime flat string map.
    pub config_map: Mutex<ConfigMap>,
    /// Where the flat map persists.
    pub config_map_path: PathBuf,
}

/// The bound control listener.
pub struct ControlPlane {
    listener: UnixListener,
    socket_path: PathBuf,
    deps: Arc<ControlDeps>,
    workers: Arc<Semaphore>,
    read_timeout: std::time::Duration,
}

impl ControlPlane {
    /// Bind the control socket, replacing any stale file, mode `0666`.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Transport`] if the socket cannot be bound.
    pub fn bind(config: &DaemonConfig, deps: Arc<ControlDeps>) -> Result<Self, CoreError> {
        let socket_path = config.control_socket.clone();
        if socket_path.exists() {
            std::fs::remove_file(&socket_path)?;
        }
        if let Some(parent) = socket_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let listener = UnixListener::bind(&socket_path)
            .map_err(|e| CoreError::Transport(format!("bind {}: {e}", socket_path.display())))?;
        set_world_accessible(&socket_path)?;

        info!(path = %socket_path.display(), "control socket listening");
        Ok(Self {
            listener,
            socket_path,
            deps,
            workers: Arc::new(Semaphore::new(config.timing.control_workers)),
            read_timeout: std::time::Duration::from_secs(config.timing.read_timeout_secs),
        })
    }

    /// Accept loop; exits on shutdown and removes the socket file.
    pub async fn run(self, mut shutdown_rx: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, _)) => {
                            let permit = match Arc::clone(&self.workers).acquire_owned().await {
                                Ok(permit) => permit,
                                Err(_) => break,
                            };
                            let deps = Arc::clone(&self.deps);
                            let read_timeout = self.read_timeout;
                            tokio::spawn(async move {
                                handle_connection(stream, deps, read_timeout).await;
                                drop(permit);
                            });
                        }
                        Err(e) => {
                            warn!(error = %e, "accept failed");
                        }
                    }
                }
                result = shutdown_rx.changed() => {
                    if result.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }

        let _ = std::fs::remove_file(&self.socket_path);
        info!("control socket closed");
    }
}

#[cfg(unix)]
fn set_world_accessible(path: &std::path::Path) -> Result<(), CoreError> {
    use std::os::unix::fs::PermissionsExt;
    let mut perms = std::fs::metadata(path)?.permissions();
    perms.set_mode(0o666);
    std::fs::set_permissions(path, perms)?;
    Ok(())
}

/// Serve one connection: one request line, one response line.
async fn handle_connection(
    stream: UnixStream,
    deps: Arc<ControlDeps>,
    read_timeout: std::time::Duration,
) {
    let (read_half, mut write_half) = stream.into_split();
    let mut limited = BufReader::new(read_half).take(MAX_REQUEST_BYTES);
    let mut line = String::new();

    let response = match tokio::time::timeout(read_timeout, limited.read_line(&mut line)).await {
        Err(_) => error_response(&CoreError::Timeout("request read deadline".to_owned())),
        Ok(Err(e)) => error_response(&CoreError::Transport(e.to_string())),
        Ok(Ok(read)) => {
            if read as u64 >= MAX_REQUEST_BYTES && !line.ends_with('\n') {
                error_response(&CoreError::Protocol("request exceeds 4096 bytes".to_owned()))
            } else {
                let command = line.trim();
                if command.is_empty() {
                    error_response(&CoreError::Protocol("empty request".to_owned()))
                } else {
                    dispatch(&deps, command).await
                }
            }
        }
    };

    let mut payload = response.to_string();
    payload.push('\n');
    if let Err(e) = write_half.write_all(payload.as_bytes()).await {
        debug!(error = %e, "response write failed");
    }
    let _ = write_half.shutdown().await;
}

/// Map an error into the protocol's error object.
fn error_response(err: &CoreError) -> serde_json::Value {
    json!({ "error": err.kind(), "detail": err.detail() })
}

/// `{"success":...}` form used by the service and enforcement commands.
fn success_response(result: Result<(), CoreError>) -> serde_json::Value {
    match result {
        Ok(()) => json!({ "success": true }),
        Err(e) => json!({ "success": false, "error": e.kind() }),
    }
}

/// Parse and execute one command line.
async fn dispatch(deps: &ControlDeps, command: &str) -> serde_json::Value {
    let mut parts = command.split_whitespace();
    let verb = parts.next().unwrap_or_default();
    let rest: Vec<&str> = parts.collect();

    debug!(verb, "control command");

    match (verb, rest.as_slice()) {
        ("status", []) => {
            let (running, _) = deps.supervisor.counts();
            json!({
                "running": true,
                "services": running,
                "events_processed": deps.bus.dispatched(),
                "threats_today": deps.stats.threats_today(),
                "trackers_blocked": deps.stats.trackers_blocked(),
                "uptime_seconds": deps.stats.uptime_seconds(),
            })
        }

        ("services", []) => {
            let entries: Vec<serde_json::Value> = deps
                .supervisor
                .snapshot()
                .into_iter()
                .map(|s| {
                    json!({
                        "name": s.name,
                        "status": s.status.code(),
                        "pid": s.pid.unwrap_or(0),
                    })
                })
                .collect();
            serde_json::Value::Array(entries)
        }

        ("scan", []) => match deps.supervisor.request("security_core", "SCAN_ALL").await {
            Ok(reply) if reply == "OK" => {
                json!({ "success": true, "message": "scan started" })
            }
            Ok(reply) => {
                json!({ "success": false, "error": "protocol", "detail": reply })
            }
            Err(e) => json!({ "success": false, "error": e.kind() }),
        },

        ("start", [name]) => success_response(deps.supervisor.start(name).await),
        ("stop", [name]) => success_response(deps.supervisor.stop(name).await),
        ("restart", [name]) => success_response(deps.supervisor.restart(name).await),

        ("lock", [package]) => forward_app_manager(deps, "LOCK", package).await,
        ("unlock", [package]) => forward_app_manager(deps, "UNLOCK", package).await,
        ("hide", [package]) => forward_app_manager(deps, "HIDE", package).await,
        ("unhide", [package]) => forward_app_manager(deps, "UNHIDE", package).await,

        ("trust", [package]) => match deps.trust.info(package).await {
            Ok(record) => json!({
                "package": record.package,
                "score": record.score,
                "status": record.status.as_str(),
                "source": record.install_source.as_str(),
            }),
            Err(e) => error_response(&e),
        },

        ("whitelist", [package, state]) => match *state {
            "on" => success_response(deps.trust.whitelist(package, true).await),
            "off" => success_response(deps.trust.whitelist(package, false).await),
            _ => error_response(&CoreError::Protocol(
                "whitelist expects on|off".to_owned(),
            )),
        },

        ("quarantined", []) => {
            let packages: Vec<serde_json::Value> = deps
                .trust
                .quarantined()
                .into_iter()
                .map(|r| json!({ "package": r.package, "score": r.score }))
                .collect();
            json!({ "packages": packages })
        }

        ("threats", []) => match deps.trust.recent_violations(20) {
            Ok(recent) => {
                let recent: Vec<serde_json::Value> = recent
                    .into_iter()
                    .map(|v| {
                        json!({
                            "id": v.id,
                            "package": v.package,
                            "kind": v.kind.as_str(),
                            "penalty": v.penalty,
                            "timestamp": v.timestamp.to_rfc3339(),
                        })
                    })
                    .collect();
                let trust = deps.trust.stats();
                json!({
                    "threats_today": deps.stats.threats_today(),
                    "total_violations": trust.total_violations,
                    "quarantined_apps": trust.quarantined_apps,
                    "recent": recent,
                })
            }
            Err(e) => error_response(&e),
        },

        ("trackers", []) => json!({ "trackers_blocked": deps.stats.trackers_blocked() }),

        ("config", ["get", key]) => {
            let map = deps
                .config_map
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            match map.get(key) {
                Some(value) => json!({ "key": key, "value": value }),
                None => error_response(&CoreError::NotFound(format!("config key {key}"))),
            }
        }

        ("config", ["set", key, value]) => {
            let result = {
                let mut map = deps
                    .config_map
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
                map.set(*key, *value);
                map.save(&deps.config_map_path)
            };
            match result {
                Ok(()) => {
                    deps.bus
                        .publish(Event::core(
                            EventKind::ConfigChanged,
                            *key,
                            format!("config {key} updated"),
                            2,
                        ))
                        .await;
                    json!({ "success": true })
                }
                Err(e) => json!({ "success": false, "error": e.kind() }),
            }
        }

        _ => json!({ "error": "unknown_command" }),
    }
}

/// Forward one single-word command plus package to the app manager.
async fn forward_app_manager(
    deps: &ControlDeps,
    verb: &str,
    package: &str,
) -> serde_json::Value {
    let line = format!("{verb} {package}");
    match deps.supervisor.request("app_manager", &line).await {
        Ok(reply) if reply == "OK" => json!({ "success": true }),
        Ok(reply) => json!({ "success": false, "error": "protocol", "detail": reply }),
        Err(e) => json!({ "success": false, "error": e.kind() }),
    }
}
