//! Batch-command sink for consumers driven by `setreading` commands over HTTP.
//!
//! One frame becomes one request: every reading is a `setreading` command,
//! the commands are joined with `"; "` and sent URL-escaped as the `cmd` query
//! parameter of `http://<host>:<port>/fhem`.

use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;
use url::Url;

use super::{flag_str, target_name, LinkStatus, Payload, Sink, TransportError, TransportResult};
use crate::config::HttpSinkConfig;
use crate::format::{CoordinateFormat, Position};
use crate::frame::Snapshot;

/// Separator between commands in one batch.
pub const COMMAND_SEPARATOR: &str = "; ";

/// HTTP sink issuing batched `setreading` commands.
#[derive(Debug, Clone)]
pub struct BatchCommandSink {
    client: reqwest::Client,
    endpoint: Url,
    device: String,
    format: CoordinateFormat,
    startup_timeout: Duration,
}

impl BatchCommandSink {
    /// Create a sink for the consumer described by `config`.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::InvalidEndpoint`] if host and port do not form
    /// a valid URL or the HTTP client cannot be built.
    pub fn new(config: &HttpSinkConfig, device: &str) -> TransportResult<Self> {
        let endpoint = Url::parse(&format!("http://{}:{}/fhem", config.host, config.port))
            .map_err(|e| TransportError::InvalidEndpoint(e.to_string()))?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| TransportError::InvalidEndpoint(e.to_string()))?;

        Ok(Self {
            client,
            endpoint,
            device: device.to_string(),
            format: config.coordinate_format,
            startup_timeout: Duration::from_secs(config.startup_timeout_secs),
        })
    }

    /// Render the batch command for `payload`.
    #[must_use]
    pub fn render(&self, payload: &Payload) -> String {
        match payload {
            Payload::Status(status) => render_status(&self.device, *status),
            Payload::Readings(snapshot) => render_readings(&self.device, snapshot, self.format),
            Payload::Reset => render_readings(&self.device, &Snapshot::zeroed(), self.format),
        }
    }

    /// Full request URL carrying `command`.
    #[must_use]
    pub fn request_url(&self, command: &str) -> Url {
        let mut url = self.endpoint.clone();
        url.query_pairs_mut().append_pair("cmd", command);
        url
    }

    async fn execute(&self, command: &str, timeout: Option<Duration>) -> TransportResult<()> {
        let mut request = self.client.get(self.request_url(command));
        if let Some(timeout) = timeout {
            request = request.timeout(timeout);
        }

        let response = request.send().await.map_err(|e| TransportError::Request {
            endpoint: self.endpoint.to_string(),
            message: e.to_string(),
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::Status {
                status: status.as_u16(),
            });
        }

        debug!(endpoint = %self.endpoint, "Batch command accepted");
        Ok(())
    }
}

#[async_trait]
impl Sink for BatchCommandSink {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn send(&self, payload: &Payload) -> TransportResult<()> {
        self.execute(&self.render(payload), None).await
    }

    async fn first_contact(&self) -> TransportResult<()> {
        let command = render_status(&self.device, LinkStatus::Connecting);
        self.execute(&command, Some(self.startup_timeout)).await
    }
}

/// Render one snapshot as a `"; "`-joined batch of `setreading` commands.
#[must_use]
pub fn render_readings(device: &str, snapshot: &Snapshot, format: CoordinateFormat) -> String {
    let mut commands = Vec::with_capacity(snapshot.readings.len() * 3 + 1);

    for (slot, reading) in snapshot.readings.iter().enumerate() {
        let target = target_name(slot);
        let (x, y) = match format.position(reading) {
            Position::Millimeters { x, y } => (x.to_string(), y.to_string()),
            Position::Meters { x, y } => (x.to_string(), y.to_string()),
        };
        commands.push(format!("setreading {device} {target}_x {x}"));
        commands.push(format!("setreading {device} {target}_y {y}"));
        commands.push(format!(
            "setreading {device} {target}_speed {}",
            reading.speed_mm_s
        ));
    }

    commands.push(format!(
        "setreading {device} movement {}",
        flag_str(snapshot.movement)
    ));

    commands.join(COMMAND_SEPARATOR)
}

/// Render a connectivity state report.
#[must_use]
pub fn render_status(device: &str, status: LinkStatus) -> String {
    format!("setreading {device} state {status}")
}
