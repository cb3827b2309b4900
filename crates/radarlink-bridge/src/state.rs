//! Application state shared across handlers.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use radarlink_core::SessionStatus;
use tokio::sync::watch;

/// Shared application state.
#[derive(Debug, Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

#[derive(Debug)]
struct AppStateInner {
    status: watch::Receiver<SessionStatus>,
    device_address: String,
    device_name: String,
    sink: &'static str,
    started_at: DateTime<Utc>,
}

impl AppState {
    /// Create state reading session progress from `status`.
    #[must_use]
    pub fn new(
        status: watch::Receiver<SessionStatus>,
        device_address: impl Into<String>,
        device_name: impl Into<String>,
        sink: &'static str,
    ) -> Self {
        Self {
            inner: Arc::new(AppStateInner {
                status,
                device_address: device_address.into(),
                device_name: device_name.into(),
                sink,
                started_at: Utc::now(),
            }),
        }
    }

    /// Latest session status.
    #[must_use]
    pub fn session(&self) -> SessionStatus {
        self.inner.status.borrow().clone()
    }

    /// Radar address.
    #[must_use]
    pub fn device_address(&self) -> &str {
        &self.inner.device_address
    }

    /// Device name used towards the consumer.
    #[must_use]
    pub fn device_name(&self) -> &str {
        &self.inner.device_name
    }

    /// Sink transport name.
    #[must_use]
    pub fn sink(&self) -> &'static str {
        self.inner.sink
    }

    /// Seconds since the bridge started.
    #[must_use]
    pub fn uptime_secs(&self) -> u64 {
        u64::try_from((Utc::now() - self.inner.started_at).num_seconds()).unwrap_or(0)
    }
}
