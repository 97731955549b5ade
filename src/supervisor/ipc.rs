//! Per-service socket plumbing.
//!
//! Two independent uses of a service's stream socket:
//! - [`ServiceLinks`] — one cached outbound request/response connection per
//!   service, opened lazily and reopened after any I/O error. Framing is a
//!   single newline-terminated UTF-8 line of at most 4096 bytes each way.
//! - [`run_inbound_reader`] — a long-lived task per running service that
//!   reads pushed events (one JSON object per line) and submits them to
//!   the bus. The task reconnects with a flat backoff and exits promptly
//!   on shutdown.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufStream};
use tokio::net::UnixStream;
use tokio::sync::{watch, Mutex as AsyncMutex};
use tracing::{debug, info, warn};

use crate::bus::EventBus;
use crate::error::CoreError;
use crate::types::Event;

/// Maximum request or response line length, newline included.
pub const MAX_LINE_BYTES: usize = 4096;

/// Reconnect delay for inbound readers after a failed connect or EOF.
const READER_RETRY_DELAY: Duration = Duration::from_secs(1);

type Link = Arc<AsyncMutex<Option<BufStream<UnixStream>>>>;

/// Cache of outbound request connections, one per service.
pub struct ServiceLinks {
    read_timeout: Duration,
    links: Mutex<HashMap<String, Link>>,
}

impl ServiceLinks {
    /// Create with the per-operation read deadline.
    pub fn new(read_timeout: Duration) -> Self {
        Self {
            read_timeout,
            links: Mutex::new(HashMap::new()),
        }
    }

    /// Send one line and read one line back.
    ///
    /// Holds the service's link lock for the whole exchange, so at most one
    /// outbound request is in flight per service. A dead cached connection
    /// is dropped and reopened once before the error is surfaced.
    ///
    /// # Errors
    ///
    /// [`CoreError::Protocol`] for oversized lines, [`CoreError::Timeout`]
    /// when the response misses the read deadline, [`CoreError::Transport`]
    /// when the socket cannot be opened or used.
    pub async fn request(
        &self,
        name: &str,
        socket_path: &str,
        line: &str,
    ) -> Result<String, CoreError> {
        if line.len() + 1 > MAX_LINE_BYTES {
            return Err(CoreError::Protocol(format!(
                "request line exceeds {MAX_LINE_BYTES} bytes"
            )));
        }

        let link = self.link_for(name);
        let mut slot = link.lock().await;

        let mut last_err = CoreError::Transport(format!("no connection to {name}"));
        for attempt in 0..2 {
            if slot.is_none() {
                match UnixStream::connect(socket_path).await {
                    Ok(stream) => *slot = Some(BufStream::new(stream)),
                    Err(e) => {
                        last_err =
                            CoreError::Transport(format!("connect {name} ({socket_path}): {e}"));
                        break;
                    }
                }
            }

            let stream = slot.as_mut().ok_or_else(|| {
                CoreError::Transport(format!("no connection to {name}"))
            })?;

            match self.exchange(stream, line).await {
                Ok(response) => return Ok(response),
                Err(e @ CoreError::Timeout(_)) => {
                    // The peer may still answer later; the connection is no
                    // longer in a known state either way.
                    *slot = None;
                    return Err(e);
                }
                Err(e) => {
                    debug!(service = name, attempt, error = %e, "request failed, reopening link");
                    *slot = None;
                    last_err = e;
                }
            }
        }

        Err(last_err)
    }

    /// Liveness probe: `PING` must answer `PONG`.
    pub async fn ping(&self, name: &str, socket_path: &str) -> bool {
        matches!(
            self.request(name, socket_path, "PING").await.as_deref(),
            Ok("PONG")
        )
    }

    /// Drop the cached connection for a service, if any.
    pub async fn disconnect(&self, name: &str) {
        let link = self.link_for(name);
        *link.lock().await = None;
    }

    async fn exchange(
        &self,
        stream: &mut BufStream<UnixStream>,
        line: &str,
    ) -> Result<String, CoreError> {
        stream.write_all(line.as_bytes()).await?;
        stream.write_all(b"\n").await?;
        stream.flush().await?;

        let mut response = String::new();
        let read = tokio::time::timeout(self.read_timeout, stream.read_line(&mut response))
            .await
            .map_err(|_| CoreError::Timeout("service response deadline".to_owned()))??;

        if read == 0 {
            return Err(CoreError::Transport("connection closed by service".to_owned()));
        }
        if response.len() > MAX_LINE_BYTES {
            return Err(CoreError::Protocol(format!(
                "response line exceeds {MAX_LINE_BYTES} bytes"
            )));
        }
        Ok(response.trim_end_matches(['\r', '\n']).to_owned())
    }

    fn link_for(&self, name: &str) -> Link {
        let mut links = self
            .links
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Arc::clone(
            links
                .entry(name.to_owned())
                .or_insert_with(|| Arc::new(AsyncMutex::new(None))),
        )
    }
}

/// Read pushed events from a service socket until shutdown.
///
/// Each line is one JSON event. `source_service` is stamped with the
/// supervisor's name for the service regardless of what the payload
/// claims. Malformed lines are logged and skipped.
pub async fn run_inbound_reader(
    name: String,
    socket_path: String,
    bus: EventBus,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    info!(service = %name, "inbound reader started");

    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        let stream = tokio::select! {
            connected = UnixStream::connect(&socket_path) => connected,
            result = shutdown_rx.changed() => {
                if result.is_err() {
                    break;
                }
                continue;
            }
        };

        let stream = match stream {
            Ok(stream) => stream,
            Err(e) => {
                debug!(service = %name, error = %e, "event socket not reachable, retrying");
                tokio::select! {
                    () = tokio::time::sleep(READER_RETRY_DELAY) => continue,
                    result = shutdown_rx.changed() => {
                        if result.is_err() {
                            break;
                        }
                        continue;
                    }
                }
            }
        };

        let mut lines = tokio::io::BufReader::new(stream).lines();
        loop {
            let line = tokio::select! {
                line = lines.next_line() => line,
                _ = shutdown_rx.changed() => break,
            };

            match line {
                Ok(Some(line)) => {
                    let trimmed = line.trim();
                    if trimmed.is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<Event>(trimmed) {
                        Ok(mut event) => {
                            event.source_service = name.clone();
                            bus.publish(event).await;
                        }
                        Err(e) => {
                            warn!(service = %name, error = %e, "malformed event line dropped");
                        }
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    debug!(service = %name, error = %e, "event stream closed");
                    break;
                }
            }
        }

        // Connection ended; pause before reconnecting.
        tokio::select! {
            () = tokio::time::sleep(READER_RETRY_DELAY) => {}
            result = shutdown_rx.changed() => {
                if result.is_err() {
                    break;
                }
            }
        }
    }

    info!(service = %name, "inbound reader stopped");
}
