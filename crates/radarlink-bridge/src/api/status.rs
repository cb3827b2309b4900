//! Session status endpoint.

use axum::extract::State;
use axum::Json;
use radarlink_core::SessionStatus;
use serde::{Deserialize, Serialize};

use crate::state::AppState;

/// Session status plus static bridge details.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResponse {
    /// Controller state and counters.
    #[serde(flatten)]
    pub session: SessionStatus,

    /// Radar address.
    pub device_address: String,

    /// Device name used towards the consumer.
    pub device_name: String,

    /// Sink transport (`http` or `mqtt`).
    pub sink: String,

    /// Seconds since the bridge started.
    pub uptime_secs: u64,
}

/// Returns the latest session status.
pub async fn get_status(State(state): State<AppState>) -> Json<StatusResponse> {
    Json(StatusResponse {
        session: state.session(),
        device_address: state.device_address().to_string(),
        device_name: state.device_name().to_string(),
        sink: state.sink().to_string(),
        uptime_secs: state.uptime_secs(),
    })
}
