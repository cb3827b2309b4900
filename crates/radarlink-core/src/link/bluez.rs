//! BlueZ-backed link using `bluer`.
//!
//! Every connection attempt opens a fresh D-Bus session so a restarted
//! `bluetoothd` is picked up without restarting the bridge.

use std::time::Duration;

use async_trait::async_trait;
use bluer::gatt::remote::Characteristic;
use bluer::{Adapter, AdapterEvent, Address, Device, Session};
use futures::{Stream, StreamExt};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{
    Connector, FrameReceiver, LinkError, LinkResult, RadarLink, FRAME_QUEUE_CAPACITY,
    NOTIFY_CHARACTERISTIC, WRITE_CHARACTERISTIC,
};

impl From<bluer::Error> for LinkError {
    fn from(err: bluer::Error) -> Self {
        Self::Bluetooth(err.to_string())
    }
}

/// Connects to the radar through the default BlueZ adapter.
#[derive(Debug, Clone)]
pub struct BluezConnector {
    address: Address,
    discovery_timeout: Duration,
}

impl BluezConnector {
    /// Create a connector for the radar at `address`.
    ///
    /// # Errors
    ///
    /// Returns [`LinkError::InvalidAddress`] if `address` does not parse.
    pub fn new(address: &str, discovery_timeout: Duration) -> LinkResult<Self> {
        let address: Address = address
            .parse()
            .map_err(|_| LinkError::InvalidAddress(address.to_string()))?;

        Ok(Self {
            address,
            discovery_timeout,
        })
    }

    async fn find_device(&self, adapter: &Adapter) -> LinkResult<Device> {
        if adapter.device_addresses().await?.contains(&self.address) {
            return Ok(adapter.device(self.address)?);
        }

        debug!(address = %self.address, "Device not cached, starting discovery");
        let events = adapter.discover_devices().await?;
        let wanted = self.address;

        let found = tokio::time::timeout(self.discovery_timeout, async move {
            let mut events = Box::pin(events);
            while let Some(event) = events.next().await {
                if let AdapterEvent::DeviceAdded(address) = event {
                    if address == wanted {
                        return true;
                    }
                }
            }
            false
        })
        .await
        .unwrap_or(false);

        if !found {
            return Err(LinkError::DeviceNotFound {
                address: self.address.to_string(),
                timeout_secs: self.discovery_timeout.as_secs(),
            });
        }

        Ok(adapter.device(self.address)?)
    }
}

#[async_trait]
impl Connector for BluezConnector {
    type Link = BluezLink;

    async fn connect(&self) -> LinkResult<BluezLink> {
        let session = Session::new().await?;
        let adapter = session
            .default_adapter()
            .await
            .map_err(|e| LinkError::AdapterUnavailable(e.to_string()))?;
        adapter.set_powered(true).await?;

        let device = self.find_device(&adapter).await?;
        if !device.is_connected().await? {
            device
                .connect()
                .await
                .map_err(|e| LinkError::ConnectFailed {
                    address: self.address.to_string(),
                    message: e.to_string(),
                })?;
        }
        info!(address = %self.address, "Connected to radar");

        let (notify, write) = find_characteristics(&device).await?;

        Ok(BluezLink {
            _session: session,
            device,
            notify,
            write,
            pump: None,
        })
    }

    fn address(&self) -> String {
        self.address.to_string()
    }
}

/// A live GATT connection to the radar.
pub struct BluezLink {
    _session: Session,
    device: Device,
    notify: Characteristic,
    write: Characteristic,
    pump: Option<JoinHandle<()>>,
}

#[async_trait]
impl RadarLink for BluezLink {
    async fn write_command(&mut self, command: &[u8]) -> LinkResult<()> {
        self.write
            .write(command)
            .await
            .map_err(|e| LinkError::WriteFailed(e.to_string()))
    }

    async fn subscribe(&mut self) -> LinkResult<FrameReceiver> {
        let stream = self
            .notify
            .notify()
            .await
            .map_err(|e| LinkError::NotifyFailed(e.to_string()))?;

        let (tx, rx) = mpsc::channel(FRAME_QUEUE_CAPACITY);
        if let Some(previous) = self.pump.replace(tokio::spawn(pump_frames(stream, tx))) {
            previous.abort();
        }
        Ok(rx)
    }

    async fn is_connected(&self) -> bool {
        self.device.is_connected().await.unwrap_or(false)
    }

    async fn disconnect(&mut self) {
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
        if let Err(e) = self.device.disconnect().await {
            debug!(error = %e, "Disconnect failed");
        }
    }
}

impl Drop for BluezLink {
    fn drop(&mut self) {
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
    }
}

/// Forward notifications into the frame channel without ever waiting on it.
async fn pump_frames<S>(stream: S, tx: mpsc::Sender<Vec<u8>>)
where
    S: Stream<Item = Vec<u8>> + Send,
{
    let mut stream = Box::pin(stream);
    let mut dropped: u64 = 0;

    while let Some(frame) = stream.next().await {
        match tx.try_send(frame) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                dropped += 1;
                if dropped.is_power_of_two() {
                    warn!(dropped, "Frame queue full, dropping frames");
                }
            }
            Err(TrySendError::Closed(_)) => break,
        }
    }
    debug!("Notification stream ended");
}

async fn find_characteristics(device: &Device) -> LinkResult<(Characteristic, Characteristic)> {
    let mut notify = None;
    let mut write = None;

    for service in device.services().await? {
        for characteristic in service.characteristics().await? {
            let uuid = characteristic.uuid().await?;
            if uuid == NOTIFY_CHARACTERISTIC {
                notify = Some(characteristic);
            } else if uuid == WRITE_CHARACTERISTIC {
                write = Some(characteristic);
            }
        }
    }

    let notify = notify.ok_or(LinkError::CharacteristicMissing(NOTIFY_CHARACTERISTIC))?;
    let write = write.ok_or(LinkError::CharacteristicMissing(WRITE_CHARACTERISTIC))?;
    Ok((notify, write))
}
