//! In-process typed event bus.
//!
//! One bounded inbound queue, one dispatcher task. Subscribers register
//! per [`EventKind`] and run sequentially on the dispatcher, which keeps
//! per-topic ordering trivially correct. Producers that hit the capacity
//! bound block briefly, then drop with accounting. Mandatory kinds
//! (`service_error`, `quarantine_entered`) bypass the bound through a
//! small overflow list the dispatcher drains first.

use std::collections::{HashMap, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use tokio::sync::{mpsc, watch, Notify};
use tracing::{debug, error, info, warn};

use crate::types::{Event, EventKind};

/// Callback invoked on the dispatcher task for each matching event.
pub type Subscriber = Box<dyn Fn(&Event) -> anyhow::Result<()> + Send + Sync>;

/// State shared between the publish handle and the dispatcher.
struct BusShared {
    subscribers: RwLock<HashMap<EventKind, Vec<Subscriber>>>,
    overflow: Mutex<VecDeque<Event>>,
    overflow_notify: Notify,
    next_id: AtomicU64,
    published: AtomicU64,
    dispatched: AtomicU64,
    dropped: AtomicU64,
    callback_failures: AtomicU64,
}

/// Cloneable publish/subscribe handle.
#[derive(Clone)]
pub struct EventBus {
    shared: Arc<BusShared>,
    tx: mpsc::Sender<Event>,
    produce_timeout: Duration,
}

/// The single dispatcher owning the queue receiver.
pub struct BusDispatcher {
    shared: Arc<BusShared>,
    rx: mpsc::Receiver<Event>,
    drain_deadline: Duration,
}

impl EventBus {
    /// Create the bus and its dispatcher.
    ///
    /// `capacity` bounds the inbound queue; `produce_timeout` is how long a
    /// producer blocks on a full queue before dropping; `drain_deadline`
    /// bounds the shutdown drain.
    pub fn new(
        capacity: usize,
        produce_timeout: Duration,
        drain_deadline: Duration,
    ) -> (Self, BusDispatcher) {
        let (tx, rx) = mpsc::channel(capacity);
        let shared = Arc::new(BusShared {
            subscribers: RwLock::new(HashMap::new()),
            overflow: Mutex::new(VecDeque::new()),
            overflow_notify: Notify::new(),
            next_id: AtomicU64::new(1),
            published: AtomicU64::new(0),
            dispatched: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            callback_failures: AtomicU64::new(0),
        });
        let bus = Self {
            shared: Arc::clone(&shared),
            tx,
            produce_timeout,
        };
        let dispatcher = BusDispatcher {
            shared,
            rx,
            drain_deadline,
        };
        (bus, dispatcher)
    }

    /// Register a callback for one event kind.
    pub fn subscribe(&self, kind: EventKind, callback: Subscriber) {
        self.shared
            .subscribers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .entry(kind)
            .or_default()
            .push(callback);
    }

    /// Publish an event, assigning its monotonic id.
    ///
    /// Returns `false` if the event was dropped at the capacity bound.
    /// Mandatory kinds never drop.
    pub async fn publish(&self, mut event: Event) -> bool {
        event.id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);

        if event.kind.is_mandatory() {
            self.shared
                .overflow
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .push_back(event);
            self.shared.overflow_notify.notify_one();
            self.shared.published.fetch_add(1, Ordering::Relaxed);
            return true;
        }

        match tokio::time::timeout(self.produce_timeout, self.tx.send(event)).await {
            Ok(Ok(())) => {
                self.shared.published.fetch_add(1, Ordering::Relaxed);
                true
            }
            Ok(Err(_)) => {
                // Dispatcher is gone; only possible during shutdown.
                self.shared.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
            Err(_) => {
                self.shared.dropped.fetch_add(1, Ordering::Relaxed);
                debug!("event dropped at capacity bound");
                false
            }
        }
    }

    /// Events accepted onto the queue or overflow list.
    pub fn published(&self) -> u64 {
        self.shared.published.load(Ordering::Relaxed)
    }

    /// Events delivered to fan-out so far.
    pub fn dispatched(&self) -> u64 {
        self.shared.dispatched.load(Ordering::Relaxed)
    }

    /// Events dropped at the capacity bound.
    pub fn dropped(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }

    /// Subscriber callbacks that returned an error or panicked.
    pub fn callback_failures(&self) -> u64 {
        self.shared.callback_failures.load(Ordering::Relaxed)
    }
}

impl BusDispatcher {
    /// Run the dispatch loop until shutdown, then drain with a deadline.
    pub async fn run(mut self, mut shutdown_rx: watch::Receiver<bool>) {
        info!("event dispatcher started");

        loop {
            self.drain_overflow();

            tokio::select! {
                event = self.rx.recv() => {
                    match event {
                        Some(event) => self.dispatch(&event),
                        None => break,
                    }
                }
                _ = self.shared.overflow_notify.notified() => {
                    // Loop re-entry drains the overflow list.
                }
                result = shutdown_rx.changed() => {
                    if result.is_err() || *shutdown_rx.borrow() {
                        self.drain_remaining().await;
                        break;
                    }
                }
            }
        }

        info!(
            dispatched = self.shared.dispatched.load(Ordering::Relaxed),
            dropped = self.shared.dropped.load(Ordering::Relaxed),
            "event dispatcher stopped"
        );
    }

    /// Deliver everything still queued, bounded by the drain deadline.
    async fn drain_remaining(&mut self) {
        let deadline = tokio::time::Instant::now() + self.drain_deadline;
        loop {
            self.drain_overflow();
            if self.rx.is_empty() {
                break;
            }
            match tokio::time::timeout_at(deadline, self.rx.recv()).await {
                Ok(Some(event)) => self.dispatch(&event),
                Ok(None) => break,
                Err(_) => {
                    warn!("shutdown drain deadline reached with events remaining");
                    break;
                }
            }
        }
        self.drain_overflow();
    }

    /// Deliver all pending mandatory events first.
    fn drain_overflow(&self) {
        loop {
            let event = self
                .shared
                .overflow
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .pop_front();
            match event {
                Some(event) => self.dispatch(&event),
                None => break,
            }
        }
    }

    /// Fan one event out to its kind's subscribers.
    ///
    /// A failing or panicking subscriber is counted and skipped; it never
    /// stops delivery to the others.
    fn dispatch(&self, event: &Event) {
        self.shared.dispatched.fetch_add(1, Ordering::Relaxed);

        let subscribers = self
            .shared
            .subscribers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let Some(callbacks) = subscribers.get(&event.kind) else {
            return;
        };

        for callback in callbacks {
            match catch_unwind(AssertUnwindSafe(|| callback(event))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    self.shared.callback_failures.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        kind = event.kind.as_str(),
                        id = event.id,
                        error = %e,
                        "subscriber returned error"
                    );
                }
                Err(_) => {
                    self.shared.callback_failures.fetch_add(1, Ordering::Relaxed);
                    error!(
                        kind = event.kind.as_str(),
                        id = event.id,
                        "subscriber panicked"
                    );
                }
            }
        }
    }
}
