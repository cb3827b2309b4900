//! Unified error type for the radarlink core library.
//!
//! Each component keeps its own error enum ([`FrameError`], [`LinkError`],
//! [`TransportError`], [`RemediationError`], [`ConfigError`]). Only a few of
//! them ever leave their component: decode and publish failures are contained
//! where they happen, link failures drive the session state machine, and
//! configuration or startup failures end the process. [`RadarError`] is what
//! crosses the crate boundary.
//!
//! # Example
//!
//! ```rust
//! use radarlink_core::error::{RadarError, Result};
//!
//! fn first_contact(reachable: bool) -> Result<()> {
//!     if !reachable {
//!         return Err(RadarError::StartupUnreachable("connection refused".into()));
//!     }
//!     Ok(())
//! }
//!
//! assert!(first_contact(false).unwrap_err().is_fatal());
//! ```

use thiserror::Error;

use crate::config::ConfigError;
use crate::frame::FrameError;
use crate::link::LinkError;
use crate::recovery::RemediationError;
use crate::sink::TransportError;

/// The unified error type for radarlink operations.
#[derive(Debug, Error)]
pub enum RadarError {
    // =========================================================================
    // DEVICE ERRORS
    // =========================================================================
    /// A frame could not be decoded.
    #[error(transparent)]
    Frame(#[from] FrameError),

    /// The wireless link failed.
    #[error(transparent)]
    Link(#[from] LinkError),

    /// Restarting the radio stack failed.
    #[error(transparent)]
    Remediation(#[from] RemediationError),

    // =========================================================================
    // CONSUMER ERRORS
    // =========================================================================
    /// Delivery to the consumer failed.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The consumer could not be reached before the first connection attempt.
    #[error("Consumer unreachable at startup: {0}. Check that the home-automation server is running.")]
    StartupUnreachable(String),

    // =========================================================================
    // CONFIGURATION & I/O ERRORS
    // =========================================================================
    /// The configuration could not be loaded.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// A low-level I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A specialized [`Result`] type for radarlink operations.
pub type Result<T> = std::result::Result<T, RadarError>;

impl RadarError {
    /// Returns `true` if this error comes from the wireless link.
    #[inline]
    #[must_use]
    pub const fn is_link_error(&self) -> bool {
        matches!(self, Self::Link(_))
    }

    /// Returns `true` if this error is related to configuration.
    #[inline]
    #[must_use]
    pub const fn is_config_error(&self) -> bool {
        matches!(self, Self::Config(_))
    }

    /// Returns `true` if the process cannot continue.
    ///
    /// Everything else is handled inside the session loop.
    #[inline]
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::StartupUnreachable(_) | Self::Config(_) | Self::Io(_))
    }

    /// Process exit code for this error.
    #[inline]
    #[must_use]
    pub const fn exit_code(&self) -> u8 {
        match self {
            Self::Config(_) => 2,
            _ => 1,
        }
    }

    /// Returns a machine-readable error code.
    #[inline]
    #[must_use]
    pub const fn error_code(&self) -> &'static str {
        match self {
            Self::Frame(_) => "MALFORMED_FRAME",
            Self::Link(LinkError::DeviceNotFound { .. }) => "DEVICE_NOT_FOUND",
            Self::Link(LinkError::Disconnected | LinkError::NotificationsClosed) => {
                "LINK_LOST"
            }
            Self::Link(_) => "LINK_ERROR",
            Self::Remediation(_) => "REMEDIATION_FAILED",
            Self::Transport(_) => "TRANSPORT_ERROR",
            Self::StartupUnreachable(_) => "STARTUP_UNREACHABLE",
            Self::Config(_) => "CONFIG_ERROR",
            Self::Io(_) => "IO_ERROR",
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================
