use std::{sync::Arc, time::SystemTime};

use tracing::{debug, info, warn};

use crate::{
    config::PresenceConfig,
    dao::models::{ClientInfo, ConnectionKey, ConnectionRecord},
    error::ServiceError,
    services::recorder::ConnectionRecorder,
    state::state_machine::{self, ConnectionState},
};

const OP_HANDLE: &str = "handle_reconnection";

/// Drives the reconnect path with duplicate suppression.
pub struct ReconnectionCoordinator {
    recorder: Arc<ConnectionRecorder>,
    config: Arc<PresenceConfig>,
}

impl ReconnectionCoordinator {
    /// Build a coordinator around the shared recorder.
    pub fn new(recorder: Arc<ConnectionRecorder>, config: Arc<PresenceConfig>) -> Self {
        Self { recorder, config }
    }

    /// Whether the reconnection was recorded.
    pub async fn handle(
        &self,
        key: ConnectionKey,
        client: Option<ClientInfo>,
    ) -> Result<bool, ServiceError> {
        Ok(self.reconnect(key, client).await?.is_some())
    }

    /// Record a reconnection, returning the resumed (or opened) record.
    pub async fn reconnect(
        &self,
        key: ConnectionKey,
        client: Option<ClientInfo>,
    ) -> Result<Option<ConnectionRecord>, ServiceError> {
        if !self.recorder.subject_exists(OP_HANDLE, key).await? {
            return Ok(None);
        }

        let latest = self.recorder.latest(key).await?;
        if let Err(invalid) =
            state_machine::check(latest.as_ref().map(|record| record.state), ConnectionState::Connected)
        {
            debug!(
                operation = OP_HANDLE,
                subject_id = key.subject_id,
                context = %key.context,
                error = %invalid,
                "reconnection rejected"
            );
            return Ok(None);
        }

        let now = self.recorder.now();
        let window = self.config.duplicate_reconnection_window();
        let since = now.checked_sub(window).unwrap_or(SystemTime::UNIX_EPOCH);
        let recent = self.recorder.history(key, since).await?;
        if recent
            .iter()
            .filter_map(|record| record.reconnected_at)
            .any(|at| at >= since)
        {
            info!(
                operation = OP_HANDLE,
                subject_id = key.subject_id,
                context = %key.context,
                window_secs = window.as_secs(),
                "duplicate reconnection suppressed"
            );
            return Ok(None);
        }

        if let Some(down) = latest.as_ref().and_then(|record| record.disconnected_at) {
            let grace = self.config.grace_period(key.context.kind);
            let elapsed = now.duration_since(down).unwrap_or_default();
            if elapsed > grace {
                warn!(
                    operation = OP_HANDLE,
                    subject_id = key.subject_id,
                    context = %key.context,
                    elapsed_secs = elapsed.as_secs(),
                    grace_secs = grace.as_secs(),
                    "reconnection after grace period; resuming anyway"
                );
            }
        }

        self.recorder.record_reconnection(key, client).await
    }
}
