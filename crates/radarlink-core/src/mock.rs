//! Hardware-free stand-ins for the link, the consumer and the remediation.
//!
//! Used by the unit tests and, behind the `mock-bluetooth` feature, by the
//! bridge crate's tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::frame::Snapshot;
use crate::link::{
    Connector, FrameReceiver, LinkError, LinkResult, RadarLink, FRAME_QUEUE_CAPACITY,
};
use crate::recovery::{Remediation, RemediationError};
use crate::shutdown::Shutdown;
use crate::sink::{LinkStatus, Payload, Sink, TransportError, TransportResult};

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// =============================================================================
// LINK
// =============================================================================

/// What a scripted link does once its frames are delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEnd {
    /// The device reports itself disconnected.
    Disconnect,
    /// The notification channel closes.
    CloseNotifications,
    /// Keep the link up until it is torn down.
    Hold,
}

/// One scripted connection attempt.
#[derive(Debug, Clone)]
pub enum MockAttempt {
    /// `connect` fails with this error.
    Fail(LinkError),
    /// `connect` succeeds and the link delivers `frames`.
    Stream {
        /// Raw frames in delivery order.
        frames: Vec<Vec<u8>>,
        /// Behavior after the last frame.
        end: StreamEnd,
    },
    /// `connect` never completes.
    Hang,
}

/// Connector that plays back a script of attempts.
///
/// When the script runs out, `connect` fails and, if a [`Shutdown`] was
/// attached, requests a stop so that a test session terminates on its own.
#[derive(Debug, Default)]
pub struct MockConnector {
    script: Mutex<VecDeque<MockAttempt>>,
    stop_when_exhausted: Option<Shutdown>,
    attempts: Arc<AtomicUsize>,
    writes: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl MockConnector {
    /// Create a connector playing `script` in order.
    #[must_use]
    pub fn new(script: impl IntoIterator<Item = MockAttempt>) -> Self {
        Self {
            script: Mutex::new(script.into_iter().collect()),
            ..Self::default()
        }
    }

    /// Request `shutdown` once the script is exhausted.
    #[must_use]
    pub fn stop_when_exhausted(mut self, shutdown: Shutdown) -> Self {
        self.stop_when_exhausted = Some(shutdown);
        self
    }

    /// Handle to the number of `connect` calls so far.
    #[must_use]
    pub fn attempts(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.attempts)
    }

    /// Handle to every command written by links from this connector.
    #[must_use]
    pub fn writes(&self) -> Arc<Mutex<Vec<Vec<u8>>>> {
        Arc::clone(&self.writes)
    }
}

#[async_trait]
impl Connector for MockConnector {
    type Link = MockLink;

    async fn connect(&self) -> LinkResult<MockLink> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let next = lock(&self.script).pop_front();

        match next {
            Some(MockAttempt::Fail(err)) => Err(err),
            Some(MockAttempt::Hang) => std::future::pending().await,
            Some(MockAttempt::Stream { frames, end }) => Ok(MockLink {
                frames,
                end,
                connected: Arc::new(AtomicBool::new(true)),
                writes: Arc::clone(&self.writes),
                feeder: None,
            }),
            None => {
                if let Some(shutdown) = &self.stop_when_exhausted {
                    shutdown.request();
                }
                Err(LinkError::ConnectFailed {
                    address: self.address(),
                    message: "script exhausted".to_string(),
                })
            }
        }
    }

    fn address(&self) -> String {
        "AA:BB:CC:DD:EE:FF".to_string()
    }
}

/// Link produced by [`MockConnector`].
#[derive(Debug)]
pub struct MockLink {
    frames: Vec<Vec<u8>>,
    end: StreamEnd,
    connected: Arc<AtomicBool>,
    writes: Arc<Mutex<Vec<Vec<u8>>>>,
    feeder: Option<JoinHandle<()>>,
}

#[async_trait]
impl RadarLink for MockLink {
    async fn write_command(&mut self, command: &[u8]) -> LinkResult<()> {
        lock(&*self.writes).push(command.to_vec());
        Ok(())
    }

    async fn subscribe(&mut self) -> LinkResult<FrameReceiver> {
        let (tx, rx) = mpsc::channel(FRAME_QUEUE_CAPACITY);
        let frames = std::mem::take(&mut self.frames);
        let end = self.end;
        let connected = Arc::clone(&self.connected);

        self.feeder = Some(tokio::spawn(async move {
            for frame in frames {
                if tx.send(frame).await.is_err() {
                    return;
                }
            }
            match end {
                StreamEnd::Disconnect => {
                    connected.store(false, Ordering::SeqCst);
                    tx.closed().await;
                }
                StreamEnd::CloseNotifications => drop(tx),
                StreamEnd::Hold => tx.closed().await,
            }
        }));
        Ok(rx)
    }

    async fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn disconnect(&mut self) {
        self.connected.store(false, Ordering::SeqCst);
        if let Some(feeder) = self.feeder.take() {
            feeder.abort();
        }
    }
}

// =============================================================================
// SINK
// =============================================================================

/// Sink that records every payload it accepts.
#[derive(Debug, Default)]
pub struct RecordingSink {
    payloads: Mutex<Vec<Payload>>,
    failing: AtomicBool,
    unreachable: AtomicBool,
    closed: AtomicBool,
    delay: Mutex<Duration>,
}

impl RecordingSink {
    /// Create an empty, healthy sink.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make every `send` fail (`true`) or succeed again (`false`).
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Make the first contact fail.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    /// Delay every `send` by `delay`.
    pub fn set_delay(&self, delay: Duration) {
        *lock(&self.delay) = delay;
    }

    /// Every accepted payload in acceptance order.
    #[must_use]
    pub fn payloads(&self) -> Vec<Payload> {
        lock(&self.payloads).clone()
    }

    /// Accepted status payloads in acceptance order.
    #[must_use]
    pub fn statuses(&self) -> Vec<LinkStatus> {
        self.payloads()
            .into_iter()
            .filter_map(|p| match p {
                Payload::Status(status) => Some(status),
                _ => None,
            })
            .collect()
    }

    /// Accepted readings (not the reset) in acceptance order.
    #[must_use]
    pub fn readings(&self) -> Vec<Snapshot> {
        self.payloads()
            .into_iter()
            .filter_map(|p| match p {
                Payload::Readings(snapshot) => Some(snapshot),
                _ => None,
            })
            .collect()
    }

    /// Whether `close` was called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Sink for RecordingSink {
    fn name(&self) -> &'static str {
        "recording"
    }

    async fn send(&self, payload: &Payload) -> TransportResult<()> {
        let delay = *lock(&self.delay);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(TransportError::Status { status: 503 });
        }
        lock(&self.payloads).push(*payload);
        Ok(())
    }

    async fn first_contact(&self) -> TransportResult<()> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(TransportError::Request {
                endpoint: "http://127.0.0.1:8083/fhem".to_string(),
                message: "connection refused".to_string(),
            });
        }
        self.send(&Payload::Status(LinkStatus::Connecting)).await
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

// =============================================================================
// REMEDIATION
// =============================================================================

/// Remediation that counts invocations and reports a fixed outcome.
#[derive(Debug, Clone)]
pub struct CountingRemediation {
    calls: Arc<AtomicU32>,
    succeed: bool,
    delay: Duration,
}

impl CountingRemediation {
    /// Create a remediation that always succeeds (`true`) or fails.
    #[must_use]
    pub fn new(succeed: bool) -> Self {
        Self {
            calls: Arc::new(AtomicU32::new(0)),
            succeed,
            delay: Duration::ZERO,
        }
    }

    /// Take `delay` before reporting the outcome.
    #[must_use]
    pub const fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Number of invocations so far.
    #[must_use]
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Remediation for CountingRemediation {
    async fn remediate(&self) -> Result<(), RemediationError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.succeed {
            Ok(())
        } else {
            Err(RemediationError::Failed {
                command: self.describe(),
                code: 1,
                stderr: "Unit bluetooth.service not found.".to_string(),
            })
        }
    }

    fn describe(&self) -> String {
        "mock restart".to_string()
    }
}
