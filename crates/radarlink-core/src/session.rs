//! Session controller.
//!
//! Owns the connect / stream / retry loop:
//!
//! ```text
//! Idle -> Connecting -> Streaming -> Reconnecting -> Connecting ...
//!                                         |
//!                                         +-> Recovering -> Connecting
//! any -> ShuttingDown
//! ```
//!
//! The retry counter and current state belong to the controller alone. A
//! copy of them is published through a `watch` channel for the status API.

use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace, warn};

use crate::config::SessionConfig;
use crate::dispatch::Dispatcher;
use crate::error::{RadarError, Result};
use crate::frame;
use crate::link::{Connector, LinkError, RadarLink, START_STREAMING_COMMAND};
use crate::recovery::RecoveryEscalator;
use crate::shutdown::Shutdown;
use crate::sink::LinkStatus;

/// Controller state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkState {
    /// Not started.
    #[default]
    Idle,
    /// Establishing the link.
    Connecting,
    /// Receiving frames.
    Streaming,
    /// Link lost, waiting to retry.
    Reconnecting,
    /// Restarting the radio stack.
    Recovering,
    /// Stopping.
    ShuttingDown,
}

impl LinkState {
    /// Wire representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Streaming => "streaming",
            Self::Reconnecting => "reconnecting",
            Self::Recovering => "recovering",
            Self::ShuttingDown => "shutting_down",
        }
    }
}

impl std::fmt::Display for LinkState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Observable copy of the controller's progress.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStatus {
    /// Current state.
    pub state: LinkState,
    /// Consecutive failures since the last successful stream or recovery.
    pub retry_count: u32,
    /// Radio stack restarts so far.
    pub recoveries: u32,
    /// Frames decoded and forwarded.
    pub frames_received: u64,
    /// Frames rejected as malformed.
    pub frames_rejected: u64,
    /// When the last frame was decoded.
    pub last_frame_at_utc: Option<DateTime<Utc>>,
    /// Payloads the consumer did not accept.
    pub deliveries_failed: u64,
    /// Readings dropped because the consumer fell behind.
    pub readings_dropped: u64,
}

/// Loop timings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionSettings {
    /// Pause before every connection attempt.
    pub settle_delay: Duration,
    /// Pause between failed attempts below the escalation threshold.
    pub backoff: Duration,
    /// How often the link is checked while streaming.
    pub poll_interval: Duration,
    /// Pause between the start command and arming notifications.
    pub command_delay: Duration,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self::from(&SessionConfig::default())
    }
}

impl From<&SessionConfig> for SessionSettings {
    fn from(config: &SessionConfig) -> Self {
        Self {
            settle_delay: Duration::from_millis(config.settle_delay_ms),
            backoff: Duration::from_secs(config.backoff_secs),
            poll_interval: Duration::from_millis(config.poll_interval_ms),
            command_delay: Duration::from_millis(config.command_delay_ms),
        }
    }
}

/// How one link session ended.
#[derive(Debug)]
enum SessionEnd {
    Shutdown,
    Failed(LinkError),
}

/// Drives the radar link and feeds the dispatcher.
pub struct SessionController<C: Connector> {
    connector: C,
    dispatcher: Dispatcher,
    escalator: RecoveryEscalator,
    shutdown: Shutdown,
    settings: SessionSettings,
    state: LinkState,
    retry_count: u32,
    status: watch::Sender<SessionStatus>,
}

impl<C: Connector> SessionController<C> {
    /// Assemble a controller. Nothing runs until [`run`](Self::run).
    #[must_use]
    pub fn new(
        connector: C,
        dispatcher: Dispatcher,
        escalator: RecoveryEscalator,
        shutdown: Shutdown,
        settings: SessionSettings,
    ) -> Self {
        let (status, _) = watch::channel(SessionStatus::default());
        Self {
            connector,
            dispatcher,
            escalator,
            shutdown,
            settings,
            state: LinkState::Idle,
            retry_count: 0,
            status,
        }
    }

    /// Subscribe to status updates.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<SessionStatus> {
        self.status.subscribe()
    }

    /// Current state.
    #[must_use]
    pub const fn state(&self) -> LinkState {
        self.state
    }

    /// Run until a stop is requested.
    ///
    /// Reports `connecting` to the consumer first; if that fails the
    /// controller never touches the radar. On exit the dispatcher is flushed
    /// and the consumer receives `disconnected` and zeroed readings.
    ///
    /// # Errors
    ///
    /// Returns [`RadarError::StartupUnreachable`] if the consumer cannot be
    /// reached at startup. Every later failure is handled inside the loop.
    pub async fn run(mut self) -> Result<SessionStatus> {
        info!(
            address = %self.connector.address(),
            sink = self.dispatcher.sink_name(),
            "Starting session"
        );

        if let Err(e) = self.dispatcher.first_contact().await {
            self.transition(LinkState::ShuttingDown);
            return Err(RadarError::StartupUnreachable(e.to_string()));
        }

        loop {
            if self.shutdown.sleep(self.settings.settle_delay).await {
                break;
            }
            self.transition(LinkState::Connecting);

            let error = match self.stream_session().await {
                SessionEnd::Shutdown => break,
                SessionEnd::Failed(e) => e,
            };
            if self.shutdown.is_requested() {
                break;
            }

            self.retry_count += 1;
            self.status.send_modify(|s| s.retry_count = self.retry_count);
            warn!(
                error = %error,
                attempt = self.retry_count,
                max = self.escalator.max_attempts(),
                "Link failed"
            );
            self.transition(LinkState::Reconnecting);
            self.dispatcher.publish_status(LinkStatus::Reconnecting);

            if self.escalator.should_recover(self.retry_count) {
                self.transition(LinkState::Recovering);
                self.escalator.recover(&self.shutdown).await;
                self.retry_count = 0;
                self.status.send_modify(|s| {
                    s.retry_count = 0;
                    s.recoveries += 1;
                });
            } else if self.shutdown.sleep(self.settings.backoff).await {
                break;
            }
        }

        self.transition(LinkState::ShuttingDown);
        self.dispatcher.shutdown().await;
        self.record_delivery();
        info!("Session stopped");

        Ok(self.status.borrow().clone())
    }

    /// One connect-and-stream cycle. The link is always torn down on return.
    async fn stream_session(&mut self) -> SessionEnd {
        let shutdown = self.shutdown.clone();

        let mut link = match interruptible(&shutdown, self.connector.connect()).await {
            None => return SessionEnd::Shutdown,
            Some(Err(e)) => return SessionEnd::Failed(e),
            Some(Ok(link)) => link,
        };

        let end = self.stream(&mut link, &shutdown).await;
        link.disconnect().await;
        end
    }

    async fn stream(&mut self, link: &mut C::Link, shutdown: &Shutdown) -> SessionEnd {
        match interruptible(shutdown, link.write_command(&START_STREAMING_COMMAND)).await {
            None => return SessionEnd::Shutdown,
            Some(Err(e)) => return SessionEnd::Failed(e),
            Some(Ok(())) => {}
        }
        if shutdown.sleep(self.settings.command_delay).await {
            return SessionEnd::Shutdown;
        }

        let mut frames = match interruptible(shutdown, link.subscribe()).await {
            None => return SessionEnd::Shutdown,
            Some(Err(e)) => return SessionEnd::Failed(e),
            Some(Ok(frames)) => frames,
        };

        self.retry_count = 0;
        self.status.send_modify(|s| s.retry_count = 0);
        self.transition(LinkState::Streaming);
        self.dispatcher.publish_status(LinkStatus::Running);

        let mut poll = tokio::time::interval(self.settings.poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                () = shutdown.wait() => return SessionEnd::Shutdown,
                frame = frames.recv() => match frame {
                    Some(frame) => self.handle_frame(&frame),
                    None => return SessionEnd::Failed(LinkError::NotificationsClosed),
                },
                _ = poll.tick() => {
                    if !link.is_connected().await {
                        return SessionEnd::Failed(LinkError::Disconnected);
                    }
                }
            }
        }
    }

    fn handle_frame(&self, raw: &[u8]) {
        match frame::decode(raw) {
            Ok(snapshot) => {
                trace!(targets = snapshot.targets_present, "Frame decoded");
                self.dispatcher.publish_readings(snapshot);
                self.status.send_modify(|s| {
                    s.frames_received += 1;
                    s.last_frame_at_utc = Some(Utc::now());
                });
                self.record_delivery();
            }
            Err(e) => {
                warn!(error = %e, "Dropping frame");
                self.status.send_modify(|s| s.frames_rejected += 1);
            }
        }
    }

    fn transition(&mut self, next: LinkState) {
        if self.state == next {
            return;
        }
        debug!(from = %self.state, to = %next, "State change");
        self.state = next;
        self.status.send_modify(|s| s.state = next);
        self.record_delivery();
    }

    fn record_delivery(&self) {
        let failed = self.dispatcher.failures();
        let dropped = self.dispatcher.dropped();
        self.status.send_if_modified(|s| {
            let changed = s.deliveries_failed != failed || s.readings_dropped != dropped;
            s.deliveries_failed = failed;
            s.readings_dropped = dropped;
            changed
        });
    }
}

impl<C: Connector> std::fmt::Debug for SessionController<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionController")
            .field("state", &self.state)
            .field("retry_count", &self.retry_count)
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

/// Await `future` unless a stop is requested first.
async fn interruptible<F: Future>(shutdown: &Shutdown, future: F) -> Option<F::Output> {
    tokio::select! {
        biased;
        () = shutdown.wait() => None,
        output = future => Some(output),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::*;
    use crate::frame::{encode_value, Snapshot, TargetReading, MIN_FRAME_LEN};
    use crate::mock::{CountingRemediation, MockAttempt, MockConnector, RecordingSink, StreamEnd};

    fn fast_settings() -> SessionSettings {
        SessionSettings {
            settle_delay: Duration::from_millis(1),
            backoff: Duration::from_millis(1),
            poll_interval: Duration::from_millis(10),
            command_delay: Duration::from_millis(1),
        }
    }

    fn frame_with_first_target(x: i32, y: i32, speed: i32) -> Vec<u8> {
        let mut raw = vec![0u8; MIN_FRAME_LEN];
        raw[4..6].copy_from_slice(&encode_value(x));
        raw[6..8].copy_from_slice(&encode_value(y));
        raw[8..10].copy_from_slice(&encode_value(speed));
        raw
    }

    fn fail() -> MockAttempt {
        MockAttempt::Fail(LinkError::DeviceNotFound {
            address: "AA:BB:CC:DD:EE:FF".into(),
            timeout_secs: 0,
        })
    }

    struct Harness {
        controller: SessionController<MockConnector>,
        sink: Arc<RecordingSink>,
        remediation: CountingRemediation,
        shutdown: Shutdown,
        attempts: Arc<AtomicUsize>,
    }

    fn harness(script: Vec<MockAttempt>) -> Harness {
        let shutdown = Shutdown::new();
        let sink = RecordingSink::new();
        let remediation = CountingRemediation::new(false);
        let connector = MockConnector::new(script).stop_when_exhausted(shutdown.clone());
        let attempts = connector.attempts();
        let escalator =
            RecoveryEscalator::new(5, Duration::from_millis(1), Box::new(remediation.clone()));
        let controller = SessionController::new(
            connector,
            Dispatcher::new(sink.clone()),
            escalator,
            shutdown.clone(),
            fast_settings(),
        );

        Harness {
            controller,
            sink,
            remediation,
            shutdown,
            attempts,
        }
    }

    #[tokio::test]
    async fn test_five_failures_trigger_one_recovery() {
        let h = harness(vec![fail(), fail(), fail(), fail(), fail()]);
        let status = h.controller.run().await.unwrap();

        assert_eq!(h.remediation.calls(), 1);
        assert_eq!(status.recoveries, 1);
        assert_eq!(h.attempts.load(Ordering::SeqCst), 6);
        // One more attempt after recovery found the script exhausted.
        assert_eq!(status.retry_count, 0);
        assert_eq!(status.state, LinkState::ShuttingDown);
    }

    #[tokio::test]
    async fn test_fewer_failures_than_threshold_do_not_recover() {
        let h = harness(vec![fail(), fail(), fail()]);
        let status = h.controller.run().await.unwrap();

        assert_eq!(h.remediation.calls(), 0);
        assert_eq!(status.recoveries, 0);
        assert_eq!(status.retry_count, 3);
        assert_eq!(h.attempts.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_streaming_resets_retry_counter() {
        let script = vec![
            fail(),
            fail(),
            fail(),
            fail(),
            MockAttempt::Stream {
                frames: vec![frame_with_first_target(16, 0, 5)],
                end: StreamEnd::Disconnect,
            },
            fail(),
            fail(),
            fail(),
        ];
        let h = harness(script);
        let status = h.controller.run().await.unwrap();

        // Eight failures in total, but never five in a row.
        assert_eq!(h.remediation.calls(), 0);
        assert_eq!(status.retry_count, 4);
        assert_eq!(status.frames_received, 1);
    }

    #[tokio::test]
    async fn test_status_sequence_reported_to_consumer() {
        let script = vec![
            fail(),
            MockAttempt::Stream {
                frames: vec![],
                end: StreamEnd::CloseNotifications,
            },
        ];
        let h = harness(script);
        h.controller.run().await.unwrap();

        assert_eq!(
            h.sink.statuses(),
            vec![
                LinkStatus::Connecting,
                LinkStatus::Reconnecting,
                LinkStatus::Running,
                LinkStatus::Reconnecting,
                LinkStatus::Disconnected,
            ]
        );
    }

    #[tokio::test]
    async fn test_frames_forwarded_in_order() {
        let frames = vec![
            frame_with_first_target(16, 0, 5),
            frame_with_first_target(-200, 1500, -10),
            vec![0u8; MIN_FRAME_LEN],
        ];
        let h = harness(vec![MockAttempt::Stream {
            frames,
            end: StreamEnd::Disconnect,
        }]);
        let sink = h.sink.clone();
        h.controller.run().await.unwrap();

        let readings = sink.readings();
        assert_eq!(readings.len(), 3);
        assert_eq!(
            readings[0].readings[0],
            TargetReading {
                x_mm: 16,
                y_mm: 0,
                speed_mm_s: 5
            }
        );
        assert!(readings[0].movement);
        assert_eq!(readings[0].targets_present, 1);
        assert_eq!(readings[1].readings[0].x_mm, -200);
        assert_eq!(readings[2], Snapshot::zeroed());
    }

    #[tokio::test]
    async fn test_malformed_frame_rejected_without_ending_session() {
        let h = harness(vec![MockAttempt::Stream {
            frames: vec![vec![0u8; 27], frame_with_first_target(1, 1, 1)],
            end: StreamEnd::Disconnect,
        }]);
        let status = h.controller.run().await.unwrap();

        assert_eq!(status.frames_rejected, 1);
        assert_eq!(status.frames_received, 1);
        assert_eq!(h.sink.readings().len(), 1);
    }

    #[tokio::test]
    async fn test_start_command_written_on_connect() {
        let shutdown = Shutdown::new();
        let connector = MockConnector::new(vec![MockAttempt::Stream {
            frames: vec![],
            end: StreamEnd::Disconnect,
        }])
        .stop_when_exhausted(shutdown.clone());
        let writes = connector.writes();
        let controller = SessionController::new(
            connector,
            Dispatcher::new(RecordingSink::new()),
            RecoveryEscalator::new(5, Duration::ZERO, Box::new(CountingRemediation::new(true))),
            shutdown,
            fast_settings(),
        );
        controller.run().await.unwrap();

        let writes = writes.lock().unwrap().clone();
        assert_eq!(writes, vec![START_STREAMING_COMMAND.to_vec()]);
    }

    #[tokio::test]
    async fn test_shutdown_while_streaming() {
        let h = harness(vec![MockAttempt::Stream {
            frames: vec![frame_with_first_target(100, 200, 0)],
            end: StreamEnd::Hold,
        }]);
        let mut status_rx = h.controller.subscribe();
        let shutdown = h.shutdown.clone();
        let sink = h.sink.clone();
        let run = tokio::spawn(h.controller.run());

        status_rx
            .wait_for(|s| s.frames_received == 1)
            .await
            .unwrap();
        assert!(shutdown.request());
        assert!(!shutdown.request());

        let status = run.await.unwrap().unwrap();
        assert_eq!(status.state, LinkState::ShuttingDown);

        let payloads = sink.payloads();
        assert_eq!(
            payloads[payloads.len() - 2],
            crate::sink::Payload::Status(LinkStatus::Disconnected)
        );
        assert_eq!(payloads.last(), Some(&crate::sink::Payload::Reset));
        assert!(sink.is_closed());
    }

    #[tokio::test]
    async fn test_shutdown_interrupts_backoff() {
        let shutdown = Shutdown::new();
        let sink = RecordingSink::new();
        let mut settings = fast_settings();
        settings.backoff = Duration::from_secs(60);
        let controller = SessionController::new(
            MockConnector::new(vec![fail(), fail()]),
            Dispatcher::new(sink.clone()),
            RecoveryEscalator::new(5, Duration::ZERO, Box::new(CountingRemediation::new(true))),
            shutdown.clone(),
            settings,
        );
        let mut status_rx = controller.subscribe();
        let run = tokio::spawn(controller.run());

        status_rx
            .wait_for(|s| s.state == LinkState::Reconnecting)
            .await
            .unwrap();
        shutdown.request();

        let result = tokio::time::timeout(Duration::from_secs(2), run).await;
        assert!(result.is_ok());
        assert!(sink.is_closed());
    }

    #[tokio::test]
    async fn test_startup_unreachable_is_fatal() {
        let h = harness(vec![fail()]);
        h.sink.set_unreachable(true);
        let result = h.controller.run().await;

        assert!(matches!(result, Err(RadarError::StartupUnreachable(_))));
        assert_eq!(h.remediation.calls(), 0);
    }

    #[tokio::test]
    async fn test_publish_failures_do_not_affect_link() {
        let h = harness(vec![MockAttempt::Stream {
            frames: vec![frame_with_first_target(1, 2, 3); 3],
            end: StreamEnd::Disconnect,
        }]);
        let sink = h.sink.clone();
        let mut status_rx = h.controller.subscribe();
        // Reachable at startup, failing afterwards.
        let run = tokio::spawn(h.controller.run());
        status_rx
            .wait_for(|s| s.state != LinkState::Idle)
            .await
            .unwrap();
        sink.set_failing(true);

        let status = run.await.unwrap().unwrap();
        assert_eq!(status.frames_received, 3);
        assert_eq!(status.retry_count, 1);
        // running, three readings, reconnecting
        assert_eq!(status.deliveries_failed, 5);
        assert_eq!(status.readings_dropped, 0);
    }

    #[tokio::test]
    async fn test_shutdown_while_connect_hangs() {
        let h = harness(vec![MockAttempt::Hang]);
        let mut status_rx = h.controller.subscribe();
        let shutdown = h.shutdown.clone();
        let sink = h.sink.clone();
        let attempts = Arc::clone(&h.attempts);
        let run = tokio::spawn(h.controller.run());

        status_rx
            .wait_for(|s| s.state == LinkState::Connecting)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        shutdown.request();

        let status = tokio::time::timeout(Duration::from_secs(1), run)
            .await
            .expect("run did not return after shutdown")
            .unwrap()
            .unwrap();
        assert_eq!(status.state, LinkState::ShuttingDown);
        assert_eq!(
            sink.statuses(),
            vec![LinkStatus::Connecting, LinkStatus::Disconnected]
        );
        assert_eq!(sink.payloads().last(), Some(&crate::sink::Payload::Reset));
        assert!(sink.is_closed());
    }

    #[test]
    fn test_settings_from_config() {
        let settings = SessionSettings::from(&SessionConfig::default());
        assert_eq!(settings.settle_delay, Duration::from_secs(1));
        assert_eq!(settings.backoff, Duration::from_secs(5));
        assert_eq!(settings.poll_interval, Duration::from_secs(1));
        assert_eq!(settings.command_delay, Duration::from_millis(200));
    }

    #[test]
    fn test_link_state_serializes_snake_case() {
        let json = serde_json::to_string(&LinkState::ShuttingDown).unwrap();
        assert_eq!(json, "\"shutting_down\"");
    }
}
