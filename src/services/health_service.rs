use tracing::warn;

use crate::{dto::health::HealthResponse, state::SharedState};

/// Ping the connection store and report whether presence signals can be recorded.
pub async fn health_status(state: &SharedState) -> HealthResponse {
    match state.store().health_check().await {
        Ok(()) => HealthResponse::ok(state.storage_backend()),
        Err(err) => {
            warn!(error = %err, backend = state.storage_backend(), "storage health check failed");
            HealthResponse::degraded(state.storage_backend())
        }
    }
}
