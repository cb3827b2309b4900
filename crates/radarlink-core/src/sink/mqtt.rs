//! Structured-message sink over MQTT.
//!
//! Readings go to `<namespace>/<device>/readings` as one JSON record per
//! frame. Connectivity state goes to `<namespace>/<device>/state` as a plain
//! retained string so a consumer that subscribes late still sees it. The
//! broker is told to publish `disconnected` there if the bridge vanishes.

use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{
    AsyncClient, ConnectReturnCode, Event, EventLoop, LastWill, MqttOptions, Outgoing, Packet,
    QoS,
};
use serde_json::{Map, Value};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{flag_str, target_name, LinkStatus, Payload, Sink, TransportError, TransportResult};
use crate::config::MqttSinkConfig;
use crate::format::CoordinateFormat;
use crate::frame::Snapshot;

/// Capacity of the request channel between client and event loop.
const REQUEST_CAPACITY: usize = 64;

/// Pause between reconnect attempts of the event loop.
const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// How long `close` waits for the event loop to flush.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

/// Topics used for one device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topics {
    /// Readings channel, unretained.
    pub readings: String,
    /// State channel, retained.
    pub state: String,
}

impl Topics {
    /// Derive the topics for `device` under `namespace`.
    ///
    /// The device name is lower-cased and `-` becomes `_`.
    #[must_use]
    pub fn for_device(namespace: &str, device: &str) -> Self {
        let base = device.to_lowercase().replace('-', "_");
        Self {
            readings: format!("{namespace}/{base}/readings"),
            state: format!("{namespace}/{base}/state"),
        }
    }
}

/// MQTT sink publishing JSON readings and retained state.
pub struct MessageSink {
    client: AsyncClient,
    topics: Topics,
    format: CoordinateFormat,
    event_loop: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for MessageSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageSink")
            .field("topics", &self.topics)
            .field("format", &self.format)
            .finish_non_exhaustive()
    }
}

impl MessageSink {
    /// Connect to the broker and wait until it accepts the session.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Connect`] if the broker refuses or cannot be
    /// reached, or [`TransportError::Timeout`] if no answer arrives in time.
    pub async fn connect(config: &MqttSinkConfig, device: &str) -> TransportResult<Self> {
        let topics = Topics::for_device(&config.namespace, device);
        let address = format!("{}:{}", config.host, config.port);

        let mut options = MqttOptions::new(config.client_id.clone(), config.host.clone(), config.port);
        options.set_keep_alive(Duration::from_secs(config.keep_alive_secs));
        options.set_clean_session(true);
        options.set_last_will(LastWill::new(
            topics.state.clone(),
            LinkStatus::Disconnected.as_str(),
            QoS::AtLeastOnce,
            true,
        ));

        let (client, mut event_loop) = AsyncClient::new(options, REQUEST_CAPACITY);

        let timeout = Duration::from_secs(config.connect_timeout_secs);
        match tokio::time::timeout(timeout, await_connack(&mut event_loop, &address)).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(TransportError::Timeout {
                    secs: config.connect_timeout_secs,
                })
            }
        }

        info!(broker = %address, readings = %topics.readings, state = %topics.state, "Connected to MQTT broker");

        let handle = tokio::spawn(drive_event_loop(event_loop));

        Ok(Self {
            client,
            topics,
            format: config.coordinate_format,
            event_loop: Mutex::new(Some(handle)),
        })
    }

    /// Topics this sink publishes to.
    #[must_use]
    pub const fn topics(&self) -> &Topics {
        &self.topics
    }

    fn publish_error(&self, topic: &str, err: &rumqttc::ClientError) -> TransportError {
        TransportError::Publish {
            topic: topic.to_string(),
            message: err.to_string(),
        }
    }
}

#[async_trait]
impl Sink for MessageSink {
    fn name(&self) -> &'static str {
        "mqtt"
    }

    async fn send(&self, payload: &Payload) -> TransportResult<()> {
        match payload {
            Payload::Readings(snapshot) => {
                let body = serde_json::to_vec(&render_readings(snapshot, self.format))?;
                // Never wait on a full request queue for best-effort readings.
                self.client
                    .try_publish(self.topics.readings.as_str(), QoS::AtMostOnce, false, body)
                    .map_err(|e| self.publish_error(&self.topics.readings, &e))
            }
            Payload::Reset => {
                let body = serde_json::to_vec(&render_readings(&Snapshot::zeroed(), self.format))?;
                self.client
                    .publish(self.topics.readings.as_str(), QoS::AtLeastOnce, false, body)
                    .await
                    .map_err(|e| self.publish_error(&self.topics.readings, &e))
            }
            Payload::Status(status) => self
                .client
                .publish(
                    self.topics.state.as_str(),
                    QoS::AtLeastOnce,
                    true,
                    status.as_str(),
                )
                .await
                .map_err(|e| self.publish_error(&self.topics.state, &e)),
        }
    }

    async fn close(&self) {
        if let Err(e) = self.client.disconnect().await {
            debug!(error = %e, "MQTT disconnect request failed");
        }

        let handle = self.event_loop.lock().await.take();
        if let Some(handle) = handle {
            let abort = handle.abort_handle();
            if tokio::time::timeout(CLOSE_TIMEOUT, handle).await.is_err() {
                warn!("MQTT event loop did not stop in time");
                abort.abort();
            }
        }
    }
}

/// Render a snapshot as the JSON record the consumer expects.
#[must_use]
pub fn render_readings(snapshot: &Snapshot, format: CoordinateFormat) -> Value {
    let mut record = Map::new();

    for (slot, reading) in snapshot.readings.iter().enumerate() {
        let target = target_name(slot);
        let position = format.position(reading);
        record.insert(format!("{target}_x"), position.x_json());
        record.insert(format!("{target}_y"), position.y_json());
        record.insert(format!("{target}_speed"), reading.speed_mm_s.into());
    }

    record.insert("movement".to_string(), flag_str(snapshot.movement).into());
    record.insert("targetspresent".to_string(), snapshot.targets_present.into());

    Value::Object(record)
}

async fn await_connack(event_loop: &mut EventLoop, address: &str) -> TransportResult<()> {
    loop {
        match event_loop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                return if ack.code == ConnectReturnCode::Success {
                    Ok(())
                } else {
                    Err(TransportError::Connect {
                        address: address.to_string(),
                        message: format!("broker refused connection: {:?}", ack.code),
                    })
                };
            }
            Ok(_) => {}
            Err(e) => {
                return Err(TransportError::Connect {
                    address: address.to_string(),
                    message: e.to_string(),
                })
            }
        }
    }
}

async fn drive_event_loop(mut event_loop: EventLoop) {
    loop {
        match event_loop.poll().await {
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                debug!("MQTT session closed");
                break;
            }
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                info!("Reconnected to MQTT broker");
            }
            Ok(_) => {}
            Err(e) => {
                warn!(error = %e, "MQTT connection error, retrying");
                tokio::time::sleep(RECONNECT_DELAY).await;
            }
        }
    }
}
