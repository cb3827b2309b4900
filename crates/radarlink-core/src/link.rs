//! Wireless link to the radar.
//!
//! The session controller only sees two capabilities:
//!
//! - [`Connector`] - establishes a fresh link, once per connection attempt
//! - [`RadarLink`] - an established link: write commands, receive frames
//!
//! Frames are handed from the wireless stack to the controller through a
//! bounded channel. The producer side never blocks: when the controller falls
//! behind, new frames are dropped rather than stalling notification delivery.

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

#[cfg(feature = "bluetooth")]
pub mod bluez;

/// Characteristic the radar sends frames on.
pub const NOTIFY_CHARACTERISTIC: Uuid = Uuid::from_u128(0x0000_fff1_0000_1000_8000_0080_5f9b_34fb);

/// Characteristic the radar accepts commands on.
pub const WRITE_CHARACTERISTIC: Uuid = Uuid::from_u128(0x0000_fff2_0000_1000_8000_0080_5f9b_34fb);

/// Command that makes the radar start streaming target frames.
pub const START_STREAMING_COMMAND: [u8; 5] = [0xAA, 0x55, 0x03, 0x00, 0x01];

/// Frames buffered between the wireless stack and the controller.
pub const FRAME_QUEUE_CAPACITY: usize = 64;

/// Receiving end of a link's frame channel.
pub type FrameReceiver = mpsc::Receiver<Vec<u8>>;

/// Errors raised by the wireless link.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LinkError {
    /// The configured address cannot be parsed.
    #[error("Invalid Bluetooth address: '{0}'")]
    InvalidAddress(String),

    /// No usable Bluetooth adapter.
    #[error("Bluetooth adapter unavailable: {0}")]
    AdapterUnavailable(String),

    /// The radar did not show up during discovery.
    #[error("Device {address} not found within {timeout_secs}s. Ensure it is powered and in range.")]
    DeviceNotFound {
        /// Radar address.
        address: String,
        /// Discovery time allowed.
        timeout_secs: u64,
    },

    /// Establishing the connection failed.
    #[error("Connection to {address} failed: {message}")]
    ConnectFailed {
        /// Radar address.
        address: String,
        /// Underlying error.
        message: String,
    },

    /// A required GATT characteristic is missing.
    #[error("Characteristic {0} not found on device")]
    CharacteristicMissing(Uuid),

    /// Writing a command failed.
    #[error("Command write failed: {0}")]
    WriteFailed(String),

    /// Arming notifications failed.
    #[error("Failed to arm notifications: {0}")]
    NotifyFailed(String),

    /// The device dropped the connection.
    #[error("Device disconnected")]
    Disconnected,

    /// The notification stream ended.
    #[error("Notification stream closed")]
    NotificationsClosed,

    /// Any other Bluetooth stack error.
    #[error("Bluetooth error: {0}")]
    Bluetooth(String),
}

/// Result type for link operations.
pub type LinkResult<T> = std::result::Result<T, LinkError>;

/// Establishes links to the radar.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Link type produced by this connector.
    type Link: RadarLink;

    /// Connect to the radar.
    async fn connect(&self) -> LinkResult<Self::Link>;

    /// Radar address, for logs and status.
    fn address(&self) -> String;
}

/// An established link to the radar.
#[async_trait]
pub trait RadarLink: Send {
    /// Write a command to the radar's command characteristic.
    async fn write_command(&mut self, command: &[u8]) -> LinkResult<()>;

    /// Arm notifications and return the channel frames arrive on.
    async fn subscribe(&mut self) -> LinkResult<FrameReceiver>;

    /// Whether the device still reports a connection.
    async fn is_connected(&self) -> bool;

    /// Tear the link down. Errors are logged, not returned.
    async fn disconnect(&mut self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_characteristic_uuids() {
        assert_eq!(
            NOTIFY_CHARACTERISTIC.to_string(),
            "0000fff1-0000-1000-8000-00805f9b34fb"
        );
        assert_eq!(
            WRITE_CHARACTERISTIC.to_string(),
            "0000fff2-0000-1000-8000-00805f9b34fb"
        );
    }

    #[test]
    fn test_start_command_bytes() {
        assert_eq!(START_STREAMING_COMMAND.len(), 5);
        assert_eq!(&START_STREAMING_COMMAND[..2], &[0xAA, 0x55]);
    }
}
