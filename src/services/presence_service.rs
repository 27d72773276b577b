use std::{
    sync::Arc,
    time::{Duration, SystemTime},
};

use tracing::debug;

use crate::{
    config::PresenceConfig,
    dao::models::{ClientInfo, ConnectionKey, ConnectionRecord},
    error::ServiceError,
    services::{
        anomaly::{AnomalyAnalyzer, ConnectionQuality},
        disconnection::DisconnectionCoordinator,
        reconnection::ReconnectionCoordinator,
        recorder::{ConnectionRecorder, SessionOpening},
        scheduler::{DeferredTaskHandle, DeferredTaskScheduler},
        sse_events,
    },
    state::{events::PresenceEvents, state_machine::ConnectionState},
};

/// Single entry point for presence signals and reads.
///
/// Every successful transition is published on the [`PresenceEvents`] hub and drops
/// the cached quality assessment of its connection.
pub struct PresenceService {
    recorder: Arc<ConnectionRecorder>,
    disconnection: DisconnectionCoordinator,
    reconnection: ReconnectionCoordinator,
    analyzer: AnomalyAnalyzer,
    events: Arc<PresenceEvents>,
    config: Arc<PresenceConfig>,
}

impl PresenceService {
    /// Wire the coordinators and the analyzer around a shared recorder.
    pub fn new(
        recorder: Arc<ConnectionRecorder>,
        scheduler: Arc<dyn DeferredTaskScheduler>,
        events: Arc<PresenceEvents>,
        config: Arc<PresenceConfig>,
    ) -> Self {
        Self {
            disconnection: DisconnectionCoordinator::new(
                recorder.clone(),
                scheduler,
                config.clone(),
            ),
            reconnection: ReconnectionCoordinator::new(recorder.clone(), config.clone()),
            analyzer: AnomalyAnalyzer::new(recorder.clone(), config.clone()),
            recorder,
            events,
            config,
        }
    }

    /// Current wall-clock time.
    pub fn now(&self) -> SystemTime {
        self.recorder.now()
    }

    /// Interval at which clients are expected to send heartbeats.
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.config.heartbeat_interval_seconds)
    }

    /// Open (or confirm) the subject's session in the context.
    pub async fn record_initial_connection(
        &self,
        key: ConnectionKey,
        client: Option<ClientInfo>,
    ) -> Result<Option<ConnectionRecord>, ServiceError> {
        let Some((record, opening)) = self.recorder.open_session(key, client).await? else {
            return Ok(None);
        };

        match opening {
            SessionOpening::AlreadyConnected => {}
            SessionOpening::Resumed => {
                self.written(key);
                sse_events::broadcast_reconnected(&self.events, &record);
            }
            SessionOpening::Opened => {
                self.written(key);
                sse_events::broadcast_connected(&self.events, &record);
            }
        }
        Ok(Some(record))
    }

    /// Record a transport drop and start the grace period.
    pub async fn handle_disconnection(
        &self,
        key: ConnectionKey,
        client: Option<ClientInfo>,
    ) -> Result<Option<DeferredTaskHandle>, ServiceError> {
        let Some((record, handle)) = self.disconnection.disconnect(key, client).await? else {
            return Ok(None);
        };
        self.written(key);
        sse_events::broadcast_disconnected(&self.events, &record, &handle);
        Ok(Some(handle))
    }

    /// Record an explicit reconnection. Returns whether it was recorded.
    pub async fn handle_reconnection(
        &self,
        key: ConnectionKey,
        client: Option<ClientInfo>,
    ) -> Result<bool, ServiceError> {
        Ok(self.reconnect(key, client).await?.is_some())
    }

    /// Record an explicit leave.
    pub async fn handle_graceful_disconnection(
        &self,
        key: ConnectionKey,
    ) -> Result<Option<ConnectionRecord>, ServiceError> {
        let record = self.recorder.record_graceful_disconnection(key).await?;
        if let Some(record) = &record {
            self.written(key);
            sse_events::broadcast_left(&self.events, record);
        }
        Ok(record)
    }

    /// Handler of the deferred finalize task; safe to run any number of times.
    pub async fn finalize_disconnection(
        &self,
        key: ConnectionKey,
    ) -> Result<Option<ConnectionRecord>, ServiceError> {
        let record = self.disconnection.finalize(key).await?;
        if let Some(record) = &record {
            self.written(key);
            sse_events::broadcast_finalized(&self.events, record);
        }
        Ok(record)
    }

    /// Heartbeat: stamps a connected record, resumes a dropped one, opens a session
    /// otherwise.
    pub async fn update_last_seen(
        &self,
        key: ConnectionKey,
        client: Option<ClientInfo>,
    ) -> Result<Option<ConnectionRecord>, ServiceError> {
        let latest = self.recorder.latest(key).await?;
        match latest.map(|record| record.state) {
            Some(ConnectionState::Connected) => self.recorder.update_heartbeat(key).await,
            Some(ConnectionState::TemporarilyDisconnected) => {
                debug!(
                    subject_id = key.subject_id,
                    context = %key.context,
                    "heartbeat while disconnected; treating as reconnection"
                );
                self.reconnect(key, client).await
            }
            _ => self.record_initial_connection(key, client).await,
        }
    }

    /// Latest record of the connection.
    pub async fn get_connection_state(
        &self,
        key: ConnectionKey,
    ) -> Result<Option<ConnectionRecord>, ServiceError> {
        self.recorder.latest(key).await
    }

    /// Quality assessment of the connection, possibly cached.
    pub async fn get_connection_quality(
        &self,
        key: ConnectionKey,
    ) -> Result<ConnectionQuality, ServiceError> {
        self.analyzer.quality(key).await
    }

    /// Whether the latest record is connected.
    pub async fn is_online(&self, key: ConnectionKey) -> Result<bool, ServiceError> {
        Ok(self
            .recorder
            .latest(key)
            .await?
            .is_some_and(|record| record.state == ConnectionState::Connected))
    }

    async fn reconnect(
        &self,
        key: ConnectionKey,
        client: Option<ClientInfo>,
    ) -> Result<Option<ConnectionRecord>, ServiceError> {
        let record = self.reconnection.reconnect(key, client).await?;
        if let Some(record) = &record {
            self.written(key);
            if record.reconnected_at.is_some() {
                sse_events::broadcast_reconnected(&self.events, record);
            } else {
                sse_events::broadcast_connected(&self.events, record);
            }
        }
        Ok(record)
    }

    fn written(&self, key: ConnectionKey) {
        self.analyzer.invalidate(key);
    }
}
