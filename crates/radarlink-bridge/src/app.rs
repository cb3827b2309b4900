//! Wiring: sink, escalator, link and controller, plus the optional status API.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use radarlink_core::config::Config;
use radarlink_core::sink::{self, Sink};
use radarlink_core::{
    CommandRemediation, Connector, Dispatcher, RadarError, RecoveryEscalator, SessionController,
    SessionSettings, SessionStatus, Shutdown,
};
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use crate::api;
use crate::state::AppState;

/// Run the bridge with the BlueZ link until a stop is requested.
///
/// # Errors
///
/// Fails with [`RadarError::StartupUnreachable`] if the consumer cannot be
/// reached at startup, or with a [`RadarError`] if the link cannot be set up.
#[cfg(feature = "bluetooth")]
pub async fn run(config: Config, shutdown: Shutdown) -> anyhow::Result<SessionStatus> {
    let connector = radarlink_core::BluezConnector::new(
        &config.device.address,
        Duration::from_secs(config.session.discovery_timeout_secs),
    )
    .map_err(RadarError::from)?;

    let sink = sink::connect(&config.sink, &config.device)
        .await
        .map_err(|e| RadarError::StartupUnreachable(e.to_string()))?;

    run_with(connector, sink, &config, shutdown).await
}

/// Without Bluetooth support there is nothing to bridge.
///
/// # Errors
///
/// Always fails.
#[cfg(not(feature = "bluetooth"))]
pub async fn run(_config: Config, _shutdown: Shutdown) -> anyhow::Result<SessionStatus> {
    Err(RadarError::from(radarlink_core::LinkError::AdapterUnavailable(
        "built without the `bluetooth` feature".to_string(),
    ))
    .into())
}

/// Run a session over `connector` delivering to `sink`.
///
/// # Errors
///
/// Fails if the remediation command is empty, if the consumer is unreachable
/// at startup, or if the session task dies while no stop was requested.
pub async fn run_with<C>(
    connector: C,
    sink: Arc<dyn Sink>,
    config: &Config,
    shutdown: Shutdown,
) -> anyhow::Result<SessionStatus>
where
    C: Connector + 'static,
{
    let remediation =
        CommandRemediation::new(&config.session.remediation_command).map_err(RadarError::from)?;
    let escalator = RecoveryEscalator::new(
        config.session.max_reconnect_attempts,
        Duration::from_secs(config.session.recovery_settle_secs),
        Box::new(remediation),
    )
    .with_timeout(Duration::from_secs(config.session.remediation_timeout_secs));

    let sink_name = sink.name();
    let controller = SessionController::new(
        connector,
        Dispatcher::new(sink),
        escalator,
        shutdown.clone(),
        SessionSettings::from(&config.session),
    );

    let status_server = config.status.listen.map(|addr| {
        let state = AppState::new(
            controller.subscribe(),
            config.device.address.clone(),
            config.device.name.clone(),
            sink_name,
        );
        tokio::spawn(serve_status(addr, state, shutdown.clone()))
    });

    let session = tokio::spawn(controller.run()).await;

    if let Some(server) = status_server {
        server.abort();
    }

    match session {
        Ok(result) => Ok(result?),
        Err(join_error) if shutdown.is_requested() => {
            warn!(error = %join_error, "Session task ended abnormally during shutdown");
            Ok(SessionStatus::default())
        }
        Err(join_error) => Err(join_error).context("Session task failed"),
    }
}

async fn serve_status(addr: SocketAddr, state: AppState, shutdown: Shutdown) {
    let listener = match TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(%addr, error = %e, "Failed to bind status API");
            return;
        }
    };
    info!(%addr, "Status API listening");

    let result = axum::serve(listener, api::create_router(state))
        .with_graceful_shutdown(async move { shutdown.wait().await })
        .await;
    if let Err(e) = result {
        error!(error = %e, "Status API failed");
    }
}

#[cfg(test)]
mod tests {
    use radarlink_core::config::{HttpSinkConfig, SinkConfig};
    use async_trait::async_trait;
    use radarlink_core::link::LinkResult;
    use radarlink_core::mock::{MockAttempt, MockConnector, MockLink, RecordingSink, StreamEnd};
    use radarlink_core::{LinkState, LinkStatus, Payload};

    use super::*;

    fn test_config() -> Config {
        let mut config = Config::default();
        config.device.address = "C9:AE:AD:8D:1D:07".to_string();
        config.sink = SinkConfig::Http(HttpSinkConfig {
            host: "127.0.0.1".to_string(),
            ..HttpSinkConfig::default()
        });
        config.session.settle_delay_ms = 1;
        config.session.backoff_secs = 0;
        config.session.poll_interval_ms = 10;
        config.session.command_delay_ms = 1;
        config.session.recovery_settle_secs = 0;
        config.session.remediation_command = vec!["true".to_string()];
        config
    }

    fn frame() -> Vec<u8> {
        let mut raw = vec![0u8; radarlink_core::frame::MIN_FRAME_LEN];
        raw[4..6].copy_from_slice(&radarlink_core::frame::encode_value(250));
        raw[6..8].copy_from_slice(&radarlink_core::frame::encode_value(1200));
        raw
    }

    #[tokio::test]
    async fn test_run_with_mock_link_ends_cleanly() {
        let shutdown = Shutdown::new();
        let connector = MockConnector::new(vec![MockAttempt::Stream {
            frames: vec![frame(), frame()],
            end: StreamEnd::Disconnect,
        }])
        .stop_when_exhausted(shutdown.clone());
        let sink = RecordingSink::new();

        let status = run_with(connector, sink.clone(), &test_config(), shutdown)
            .await
            .unwrap();

        assert_eq!(status.state, LinkState::ShuttingDown);
        assert_eq!(status.frames_received, 2);
        assert_eq!(sink.readings().len(), 2);
        assert_eq!(sink.payloads().last(), Some(&Payload::Reset));
        assert_eq!(sink.statuses().first(), Some(&LinkStatus::Connecting));
        assert!(sink.is_closed());
    }

    #[tokio::test]
    async fn test_unreachable_consumer_is_startup_error() {
        let shutdown = Shutdown::new();
        let sink = RecordingSink::new();
        sink.set_unreachable(true);

        let err = run_with(MockConnector::new(vec![]), sink, &test_config(), shutdown)
            .await
            .unwrap_err();

        let radar_err = err.downcast_ref::<RadarError>().unwrap();
        assert!(matches!(radar_err, RadarError::StartupUnreachable(_)));
        assert_eq!(radar_err.exit_code(), 1);
    }

    /// Connector whose `connect` panics, optionally after requesting a stop.
    struct PanickingConnector {
        stop_first: Option<Shutdown>,
    }

    #[async_trait]
    impl Connector for PanickingConnector {
        type Link = MockLink;

        async fn connect(&self) -> LinkResult<MockLink> {
            if let Some(shutdown) = &self.stop_first {
                shutdown.request();
            }
            panic!("adapter driver crashed");
        }

        fn address(&self) -> String {
            "C9:AE:AD:8D:1D:07".to_string()
        }
    }

    #[tokio::test]
    async fn test_session_panic_after_stop_request_is_clean_exit() {
        let shutdown = Shutdown::new();
        let connector = PanickingConnector {
            stop_first: Some(shutdown.clone()),
        };

        let status = run_with(connector, RecordingSink::new(), &test_config(), shutdown)
            .await
            .unwrap();
        assert_eq!(status, SessionStatus::default());
    }

    #[tokio::test]
    async fn test_session_panic_without_stop_request_is_error() {
        let connector = PanickingConnector { stop_first: None };

        let err = run_with(
            connector,
            RecordingSink::new(),
            &test_config(),
            Shutdown::new(),
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("Session task failed"));
        assert!(err.downcast_ref::<RadarError>().is_none());
    }

    #[tokio::test]
    async fn test_empty_remediation_command_rejected() {
        let mut config = test_config();
        config.session.remediation_command.clear();

        let err = run_with(
            MockConnector::new(vec![]),
            RecordingSink::new(),
            &config,
            Shutdown::new(),
        )
        .await
        .unwrap_err();
        assert!(err.downcast_ref::<RadarError>().is_some());
    }
}
