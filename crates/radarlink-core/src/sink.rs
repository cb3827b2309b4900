//! Consumer sinks.
//!
//! A sink is the single `send(payload)` capability the dispatcher talks to.
//! Two transports implement it:
//!
//! - [`http::BatchCommandSink`] - batched `setreading` commands over HTTP
//! - [`mqtt::MessageSink`] - JSON records and retained state over MQTT
//!
//! Which one a session uses is decided once, at construction, by [`connect`].

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::{DeviceConfig, SinkConfig};
use crate::frame::Snapshot;

pub mod http;
pub mod mqtt;

/// Connectivity state reported to the consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkStatus {
    /// Bridge started, radar not yet streaming.
    Connecting,
    /// Radar is streaming.
    Running,
    /// Link lost, retrying.
    Reconnecting,
    /// Bridge stopped.
    Disconnected,
}

impl LinkStatus {
    /// Wire representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Connecting => "connecting",
            Self::Running => "running",
            Self::Reconnecting => "reconnecting",
            Self::Disconnected => "disconnected",
        }
    }
}

impl fmt::Display for LinkStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Something to deliver to the consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Payload {
    /// Readings decoded from one frame.
    Readings(Snapshot),
    /// Connectivity state.
    Status(LinkStatus),
    /// All-zero readings sent once on shutdown, delivered at-least-once.
    Reset,
}

impl Payload {
    /// The readings this payload carries, if any.
    #[must_use]
    pub fn snapshot(&self) -> Option<Snapshot> {
        match self {
            Self::Readings(snapshot) => Some(*snapshot),
            Self::Reset => Some(Snapshot::zeroed()),
            Self::Status(_) => None,
        }
    }
}

/// Errors raised while delivering to the consumer.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The HTTP request could not be completed.
    #[error("Request to {endpoint} failed: {message}")]
    Request {
        /// Endpoint without query.
        endpoint: String,
        /// Underlying error.
        message: String,
    },

    /// The consumer answered with a non-success status.
    #[error("Consumer answered with HTTP {status}")]
    Status {
        /// HTTP status code.
        status: u16,
    },

    /// Connecting to the broker failed.
    #[error("Broker connection to {address} failed: {message}")]
    Connect {
        /// `host:port` of the broker.
        address: String,
        /// Underlying error.
        message: String,
    },

    /// Handing a message to the broker client failed.
    #[error("Publish to '{topic}' failed: {message}")]
    Publish {
        /// Target topic.
        topic: String,
        /// Underlying error.
        message: String,
    },

    /// The payload could not be serialized.
    #[error("Failed to encode payload: {0}")]
    Encode(#[from] serde_json::Error),

    /// The endpoint could not be built from the configuration.
    #[error("Invalid consumer endpoint: {0}")]
    InvalidEndpoint(String),

    /// The operation did not finish in time.
    #[error("Timed out after {secs}s")]
    Timeout {
        /// Timeout that elapsed.
        secs: u64,
    },
}

/// Result type for sink operations.
pub type TransportResult<T> = std::result::Result<T, TransportError>;

/// Delivery capability shared by all consumer transports.
///
/// Implementations must be usable from many concurrent `send` calls.
#[async_trait]
pub trait Sink: Send + Sync {
    /// Short transport name for logs and status.
    fn name(&self) -> &'static str;

    /// Deliver one payload.
    async fn send(&self, payload: &Payload) -> TransportResult<()>;

    /// Initial contact made before the first connection attempt.
    ///
    /// Reports [`LinkStatus::Connecting`]; failure here is fatal for the bridge.
    async fn first_contact(&self) -> TransportResult<()> {
        self.send(&Payload::Status(LinkStatus::Connecting)).await
    }

    /// Release the transport. Further sends may fail.
    async fn close(&self) {}
}

/// Build the sink selected by `config`.
///
/// For MQTT this waits for the broker to accept the connection.
///
/// # Errors
///
/// Returns a [`TransportError`] if the endpoint is invalid or the broker
/// cannot be reached.
pub async fn connect(config: &SinkConfig, device: &DeviceConfig) -> TransportResult<Arc<dyn Sink>> {
    match config {
        SinkConfig::Http(http_config) => {
            let sink = http::BatchCommandSink::new(http_config, &device.name)?;
            Ok(Arc::new(sink))
        }
        SinkConfig::Mqtt(mqtt_config) => {
            let sink = mqtt::MessageSink::connect(mqtt_config, &device.name).await?;
            Ok(Arc::new(sink))
        }
    }
}

/// Reading name prefix for a zero-based slot (`target1` .. `target3`).
pub(crate) fn target_name(slot: usize) -> String {
    format!("target{}", slot + 1)
}

pub(crate) const fn flag_str(value: bool) -> &'static str {
    if value {
        "true"
    } else {
        "false"
    }
}
