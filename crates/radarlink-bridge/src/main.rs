//! # radarlink-bridge
//!
//! Forwards presence radar readings to a home-automation server.
//!
//! ## Running
//!
//! ```bash
//! # Development
//! RADARLINK_DEVICE_ADDRESS=C9:AE:AD:8D:1D:07 cargo run --package radarlink-bridge
//!
//! # Production
//! RADARLINK_ENV=production ./radarlink-bridge
//! ```
//!
//! Exit codes: 0 on shutdown, 1 if the consumer is unreachable at startup,
//! 2 on invalid configuration.

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]

use std::process::ExitCode;

use radarlink_bridge::{app, logging, signals};
use radarlink_core::{Config, ConfigError, RadarError, Shutdown};
use tracing::{error, info, warn};

const CONFIG_EXIT_CODE: u8 = 2;

#[tokio::main]
async fn main() -> ExitCode {
    let config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            report_config_error(&e);
            return ExitCode::from(CONFIG_EXIT_CODE);
        }
    };

    let is_production = logging::production_from_env() || config.logging.production;
    if let Err(e) = logging::init(is_production) {
        eprintln!("radarlink-bridge: failed to initialize logging: {e:#}");
        return ExitCode::FAILURE;
    }

    info!(
        version = env!("CARGO_PKG_VERSION"),
        address = %config.device.address,
        sink = config.sink.kind(),
        "Starting radarlink-bridge"
    );

    let shutdown = Shutdown::new();
    let signal_listener = match signals::install(shutdown.clone()) {
        Ok(handle) => handle,
        Err(e) => {
            error!(error = %e, "Failed to install signal handlers");
            return ExitCode::FAILURE;
        }
    };

    let outcome = app::run(config, shutdown.clone()).await;
    signal_listener.abort();

    match outcome {
        Ok(status) => {
            info!(
                frames = status.frames_received,
                rejected = status.frames_rejected,
                recoveries = status.recoveries,
                undelivered = status.deliveries_failed + status.readings_dropped,
                "Bridge stopped"
            );
            ExitCode::SUCCESS
        }
        Err(e) if shutdown.is_requested() => {
            warn!(error = %e, "Error during shutdown");
            ExitCode::SUCCESS
        }
        Err(e) => {
            let code = e.downcast_ref::<RadarError>().map_or(1, RadarError::exit_code);
            let error_code = e
                .downcast_ref::<RadarError>()
                .map_or("INTERNAL", RadarError::error_code);
            error!(error = %e, code = error_code, "Bridge failed");
            ExitCode::from(code)
        }
    }
}

fn report_config_error(err: &ConfigError) {
    eprintln!("radarlink-bridge: {err}");
    if let ConfigError::MultipleValidationErrors(errors) = err {
        for e in errors {
            eprintln!("  - {e}");
        }
    }
}
