//! Publish dispatcher.
//!
//! Hands payloads to the sink without making the caller wait for the network.
//! Every payload goes through one delivery worker, so the consumer sees
//! readings and status changes in the order they were published. The frame
//! path calls [`Dispatcher::publish_readings`] once per frame; when the
//! consumer falls too far behind, new readings are dropped instead of queued.
//! Status changes are never dropped.
//!
//! Delivery failures are logged here and never reported back to the caller.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::frame::Snapshot;
use crate::sink::{LinkStatus, Payload, Sink, TransportError, TransportResult};

/// Upper bound on readings waiting for delivery.
pub const MAX_PENDING_READINGS: usize = 64;

/// Default time allowed for pending deliveries at shutdown.
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Fire-and-forget publisher in front of a [`Sink`].
pub struct Dispatcher {
    sink: Arc<dyn Sink>,
    health: Arc<DeliveryHealth>,
    queue: Option<mpsc::UnboundedSender<Payload>>,
    worker: Option<JoinHandle<()>>,
    drain_timeout: Duration,
}

/// Delivery counters, plus whether deliveries are currently failing so a
/// dead consumer produces one warning rather than one per frame.
#[derive(Debug, Default)]
struct DeliveryHealth {
    degraded: AtomicBool,
    failures: AtomicU64,
    dropped: AtomicU64,
    pending_readings: AtomicUsize,
}

impl DeliveryHealth {
    fn record(&self, sink: &str, payload: &Payload, result: TransportResult<()>) {
        let what = match payload {
            Payload::Readings(_) => "readings",
            Payload::Status(_) => "status",
            Payload::Reset => "reset",
        };
        match result {
            Ok(()) => {
                if self.degraded.swap(false, Ordering::SeqCst) {
                    info!(sink, "Consumer delivery recovered");
                }
            }
            Err(e) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                if self.degraded.swap(true, Ordering::SeqCst) {
                    debug!(sink, what, error = %e, "Delivery failed");
                } else {
                    warn!(sink, what, error = %e, "Delivery failed");
                }
            }
        }
    }
}

impl Dispatcher {
    /// Create a dispatcher and start its delivery worker.
    ///
    /// Must be called from within a Tokio runtime.
    #[must_use]
    pub fn new(sink: Arc<dyn Sink>) -> Self {
        let health = Arc::new(DeliveryHealth::default());
        let (queue, rx) = mpsc::unbounded_channel();
        let worker = tokio::spawn(deliver(Arc::clone(&sink), Arc::clone(&health), rx));

        Self {
            sink,
            health,
            queue: Some(queue),
            worker: Some(worker),
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
        }
    }

    /// Override the time allowed for pending deliveries at shutdown.
    #[must_use]
    pub const fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    /// Name of the underlying sink.
    #[must_use]
    pub fn sink_name(&self) -> &'static str {
        self.sink.name()
    }

    /// Total failed deliveries.
    #[must_use]
    pub fn failures(&self) -> u64 {
        self.health.failures.load(Ordering::Relaxed)
    }

    /// Readings dropped because the consumer fell behind.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.health.dropped.load(Ordering::Relaxed)
    }

    /// Report `connecting` to the consumer and wait for the outcome.
    ///
    /// This is the only delivery a caller waits on.
    ///
    /// # Errors
    ///
    /// Returns the sink's error if the consumer is unreachable.
    pub async fn first_contact(&self) -> TransportResult<()> {
        self.sink.first_contact().await
    }

    /// Queue one snapshot for delivery. Returns immediately.
    pub fn publish_readings(&self, snapshot: Snapshot) {
        let pending = self.health.pending_readings.fetch_add(1, Ordering::SeqCst);
        if pending >= MAX_PENDING_READINGS {
            self.health.pending_readings.fetch_sub(1, Ordering::SeqCst);
            let dropped = self.health.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            if dropped.is_power_of_two() {
                warn!(dropped, "Consumer too slow, dropping readings");
            }
            return;
        }

        if !self.enqueue(Payload::Readings(snapshot)) {
            self.health.pending_readings.fetch_sub(1, Ordering::SeqCst);
        }
    }

    /// Queue a status change. Returns immediately.
    pub fn publish_status(&self, status: LinkStatus) {
        if !self.enqueue(Payload::Status(status)) {
            debug!(%status, "Dispatcher closed, status not sent");
        }
    }

    fn enqueue(&self, payload: Payload) -> bool {
        self.queue
            .as_ref()
            .is_some_and(|queue| queue.send(payload).is_ok())
    }

    /// Flush and close.
    ///
    /// Waits (bounded) for queued deliveries, then sends `disconnected` and
    /// the all-zero snapshot, then closes the sink. Failures are logged and do
    /// not stop the sequence. Calling it again is a no-op.
    pub async fn shutdown(&mut self) {
        let Some(queue) = self.queue.take() else {
            return;
        };
        drop(queue);

        if let Some(mut worker) = self.worker.take() {
            if tokio::time::timeout(self.drain_timeout, &mut worker)
                .await
                .is_err()
            {
                warn!(
                    pending = self.health.pending_readings.load(Ordering::SeqCst),
                    "Abandoning undelivered payloads"
                );
                worker.abort();
            }
        }

        if let Err(e) = self.send_final(Payload::Status(LinkStatus::Disconnected)).await {
            warn!(error = %e, "Failed to report disconnected state");
        }
        if let Err(e) = self.send_final(Payload::Reset).await {
            warn!(error = %e, "Failed to clear readings");
        }

        self.sink.close().await;
        debug!(sink = self.sink.name(), "Dispatcher closed");
    }

    async fn send_final(&self, payload: Payload) -> TransportResult<()> {
        tokio::time::timeout(self.drain_timeout, self.sink.send(&payload))
            .await
            .map_err(|_| TransportError::Timeout {
                secs: self.drain_timeout.as_secs(),
            })?
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("sink", &self.sink.name())
            .field("open", &self.queue.is_some())
            .field("drain_timeout", &self.drain_timeout)
            .finish_non_exhaustive()
    }
}

async fn deliver(
    sink: Arc<dyn Sink>,
    health: Arc<DeliveryHealth>,
    mut rx: mpsc::UnboundedReceiver<Payload>,
) {
    while let Some(payload) = rx.recv().await {
        if matches!(payload, Payload::Readings(_)) {
            health.pending_readings.fetch_sub(1, Ordering::SeqCst);
        }
        let result = sink.send(&payload).await;
        health.record(sink.name(), &payload, result);
    }
}
