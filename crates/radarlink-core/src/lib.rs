//! # radarlink-core
//!
//! Core logic for bridging a Bluetooth LE presence radar to a home-automation
//! server.
//!
//! This crate provides:
//! - Decoding of the radar's target frames
//! - Delivery of readings and link state to the consumer over HTTP or MQTT
//! - The connect / stream / retry loop with radio stack recovery
//! - Configuration loading and validation
//!
//! ## Architecture
//!
//! The crate is organized into the following modules:
//!
//! - [`frame`] - Frame decoding into per-target readings
//! - [`format`] - Consumer-specific coordinate formatting
//! - [`sink`] - The delivery capability and its HTTP and MQTT transports
//! - [`dispatch`] - Non-blocking publishing in front of a sink
//! - [`link`] - The radar link capability and its BlueZ implementation
//! - [`session`] - The session state machine
//! - [`recovery`] - Radio stack restart after repeated failures
//! - [`shutdown`] - Cooperative stop requests
//! - [`config`] - Configuration loading, overrides and validation
//! - [`error`] - Unified error types for the crate

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![warn(missing_docs)]

pub mod config;
pub mod dispatch;
pub mod error;
pub mod format;
pub mod frame;
pub mod link;
#[cfg(any(test, feature = "mock-bluetooth"))]
pub mod mock;
pub mod recovery;
pub mod session;
pub mod shutdown;
pub mod sink;

// Re-export primary types for convenience
pub use config::{
    is_valid_mac_address, normalize_mac_address, Config, ConfigError, ConfigResult, SessionConfig,
    SinkConfig,
};
pub use dispatch::Dispatcher;
pub use error::{RadarError, Result};
pub use format::CoordinateFormat;
pub use frame::{decode, FrameError, Snapshot, TargetReading};
#[cfg(feature = "bluetooth")]
pub use link::bluez::BluezConnector;
pub use link::{Connector, LinkError, RadarLink};
pub use recovery::{CommandRemediation, RecoveryEscalator, Remediation, RemediationError};
pub use session::{LinkState, SessionController, SessionSettings, SessionStatus};
pub use shutdown::Shutdown;
pub use sink::{LinkStatus, Payload, Sink, TransportError};
