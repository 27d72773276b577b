use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;
use validator::{Validate, ValidationErrors};

use crate::{
    dao::models::{
        ClientInfo, ConnectionKey, ConnectionRecord, ContextId, ContextType, PresenceContext,
        SubjectId,
    },
    dto::{
        format_system_time,
        validation::{validate_ip_address, validate_positive_id, validate_user_agent},
    },
    services::{
        anomaly::{Anomalies, ConnectionQuality, ConnectionStats, QualityLevel},
        scheduler::DeferredTaskHandle,
    },
    state::state_machine::ConnectionState,
};

/// Presence signal sent by the transport layer on connect, heartbeat, disconnect,
/// reconnect and leave.
#[derive(Debug, Deserialize, ToSchema)]
pub struct PresenceSignalRequest {
    /// Subject the signal is about.
    pub subject_id: SubjectId,
    /// Kind of context.
    pub context_type: ContextType,
    /// Context identifier.
    pub context_id: ContextId,
    /// Client details, when the transport knows them.
    #[serde(default)]
    pub client: Option<ClientInfoPayload>,
}

impl PresenceSignalRequest {
    /// Connection the signal is about.
    pub fn key(&self) -> ConnectionKey {
        ConnectionKey::new(
            self.subject_id,
            PresenceContext::new(self.context_type, self.context_id),
        )
    }

    /// Client details in domain form.
    pub fn client_info(&self) -> Option<ClientInfo> {
        self.client.clone().map(ClientInfo::from)
    }
}

impl Validate for PresenceSignalRequest {
    fn validate(&self) -> Result<(), ValidationErrors> {
        let mut errors = ValidationErrors::new();

        if let Err(e) = validate_positive_id(self.subject_id) {
            errors.add("subject_id", e);
        }
        if let Err(e) = validate_positive_id(self.context_id) {
            errors.add("context_id", e);
        }
        if let Some(ref client) = self.client {
            if let Err(client_errors) = client.validate() {
                errors.merge_self("client", Err(client_errors));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// Client details attached to a presence signal.
#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct ClientInfoPayload {
    /// Client user agent, at most 512 characters.
    #[serde(default)]
    pub user_agent: Option<String>,
    /// Client IPv4 or IPv6 address.
    #[serde(default)]
    pub ip: Option<String>,
}

impl Validate for ClientInfoPayload {
    fn validate(&self) -> Result<(), ValidationErrors> {
        let mut errors = ValidationErrors::new();

        if let Some(ref user_agent) = self.user_agent {
            if let Err(e) = validate_user_agent(user_agent) {
                errors.add("user_agent", e);
            }
        }
        if let Some(ref ip) = self.ip {
            if let Err(e) = validate_ip_address(ip) {
                errors.add("ip", e);
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

impl From<ClientInfoPayload> for ClientInfo {
    fn from(payload: ClientInfoPayload) -> Self {
        Self {
            user_agent: payload.user_agent,
            ip: payload.ip,
        }
    }
}

/// Current presence of a subject in a context.
#[derive(Debug, Serialize, ToSchema)]
pub struct ConnectionStateResponse {
    /// Subject identifier.
    pub subject_id: SubjectId,
    /// Kind of context.
    pub context_type: ContextType,
    /// Context identifier.
    pub context_id: ContextId,
    /// State of the latest record; absent when the subject was never seen here.
    pub state: Option<ConnectionState>,
    /// Whether the latest record is connected.
    pub online: bool,
    /// Id of the latest record.
    pub record_id: Option<Uuid>,
    /// When the session was opened (RFC 3339).
    pub connected_at: Option<String>,
    /// When the connection last dropped (RFC 3339).
    pub disconnected_at: Option<String>,
    /// When the latest drop was resumed (RFC 3339).
    pub reconnected_at: Option<String>,
    /// Last heartbeat received (RFC 3339).
    pub last_heartbeat: Option<String>,
    /// Connected, but no signal for more than two heartbeat intervals.
    pub heartbeat_stale: bool,
    /// Interval at which clients are expected to send heartbeats.
    pub heartbeat_interval_seconds: u64,
}

impl ConnectionStateResponse {
    /// Project the latest record of `key` for API consumers.
    pub fn new(
        key: ConnectionKey,
        record: Option<&ConnectionRecord>,
        now: SystemTime,
        heartbeat_interval: Duration,
    ) -> Self {
        let state = record.map(|record| record.state);
        let online = state == Some(ConnectionState::Connected);
        let heartbeat_stale = match record {
            Some(record) if online => {
                let last_signal = record
                    .metadata
                    .last_heartbeat
                    .or(record.reconnected_at)
                    .unwrap_or(record.connected_at);
                now.duration_since(last_signal).unwrap_or_default() > heartbeat_interval * 2
            }
            _ => false,
        };

        Self {
            subject_id: key.subject_id,
            context_type: key.context.kind,
            context_id: key.context.id,
            state,
            online,
            record_id: record.map(|record| record.id),
            connected_at: record.map(|record| format_system_time(record.connected_at)),
            disconnected_at: record
                .and_then(|record| record.disconnected_at)
                .map(format_system_time),
            reconnected_at: record
                .and_then(|record| record.reconnected_at)
                .map(format_system_time),
            last_heartbeat: record
                .and_then(|record| record.metadata.last_heartbeat)
                .map(format_system_time),
            heartbeat_stale,
            heartbeat_interval_seconds: heartbeat_interval.as_secs(),
        }
    }
}

/// Outcome of a connect, heartbeat, reconnect or leave signal.
#[derive(Debug, Serialize, ToSchema)]
pub struct PresenceAck {
    /// Whether the signal changed or confirmed the connection.
    pub accepted: bool,
    /// Presence after the signal was processed.
    pub presence: ConnectionStateResponse,
}

/// Outcome of a disconnect signal.
#[derive(Debug, Serialize, ToSchema)]
pub struct DisconnectResponse {
    /// Whether a drop was recorded and a grace period started.
    pub accepted: bool,
    /// Key of the scheduled finalize task.
    pub finalize_task: Option<String>,
    /// When the connection is finalized unless it comes back.
    pub finalize_at: Option<String>,
}

impl From<Option<DeferredTaskHandle>> for DisconnectResponse {
    fn from(handle: Option<DeferredTaskHandle>) -> Self {
        match handle {
            Some(handle) => Self {
                accepted: true,
                finalize_task: Some(handle.task_key),
                finalize_at: Some(format_system_time(handle.due_at)),
            },
            None => Self {
                accepted: false,
                finalize_task: None,
                finalize_at: None,
            },
        }
    }
}

/// Connection-quality assessment of a subject in a context.
#[derive(Debug, Serialize, ToSchema)]
pub struct ConnectionQualityResponse {
    /// Subject identifier.
    pub subject_id: SubjectId,
    /// Kind of context.
    pub context_type: ContextType,
    /// Context identifier.
    pub context_id: ContextId,
    /// Length of the analysed history.
    pub window_hours: u64,
    /// Aggregates over the window.
    pub stats: ConnectionStats,
    /// Detected anomalies.
    pub anomalies: Anomalies,
    /// Score between 0 and 100.
    pub score: u8,
    /// Bucketed score.
    pub level: QualityLevel,
    /// When the assessment was computed (RFC 3339).
    pub computed_at: String,
}

impl From<ConnectionQuality> for ConnectionQualityResponse {
    fn from(quality: ConnectionQuality) -> Self {
        Self {
            subject_id: quality.key.subject_id,
            context_type: quality.key.context.kind,
            context_id: quality.key.context.id,
            window_hours: quality.window.as_secs() / 3_600,
            stats: quality.stats,
            anomalies: quality.anomalies,
            score: quality.score,
            level: quality.level,
            computed_at: format_system_time(quality.computed_at),
        }
    }
}
