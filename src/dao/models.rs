use std::{
    fmt,
    time::{Duration, SystemTime},
};

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::state::state_machine::ConnectionState;

/// Identifier of a subject (a user).
pub type SubjectId = i64;
/// Identifier of a room, debate or admin console.
pub type ContextId = i64;

/// Kind of shared real-time context a subject can be present in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum ContextType {
    /// Waiting room before a debate starts.
    Room,
    /// Active debate session.
    Debate,
    /// Administrative console.
    Admin,
}

impl ContextType {
    /// Stable identifier used in logs, storage and task keys.
    pub fn as_str(self) -> &'static str {
        match self {
            ContextType::Room => "room",
            ContextType::Debate => "debate",
            ContextType::Admin => "admin",
        }
    }
}

impl fmt::Display for ContextType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A `(type, id)` pair a subject is connected to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PresenceContext {
    /// Context kind.
    pub kind: ContextType,
    /// Context identifier, unique within its kind.
    pub id: ContextId,
}

impl PresenceContext {
    /// Build a context from its parts.
    pub fn new(kind: ContextType, id: ContextId) -> Self {
        Self { kind, id }
    }

    /// Waiting room context.
    pub fn room(id: ContextId) -> Self {
        Self::new(ContextType::Room, id)
    }

    /// Debate context.
    pub fn debate(id: ContextId) -> Self {
        Self::new(ContextType::Debate, id)
    }
}

impl fmt::Display for PresenceContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.id)
    }
}

/// Key under which connection records are grouped; only the latest record per key is
/// authoritative.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectionKey {
    /// Subject the records belong to.
    pub subject_id: SubjectId,
    /// Context the subject is present in.
    pub context: PresenceContext,
}

impl ConnectionKey {
    /// Build a key from its parts.
    pub fn new(subject_id: SubjectId, context: PresenceContext) -> Self {
        Self {
            subject_id,
            context,
        }
    }

    /// Key identifying the deferred finalize task of this connection.
    pub fn finalize_task_key(&self) -> String {
        format!("finalize-disconnection:{}:{}", self.subject_id, self.context)
    }
}

impl fmt::Display for ConnectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "subject {} @ {}", self.subject_id, self.context)
    }
}

/// Client details reported by the transport.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientInfo {
    /// Raw `User-Agent` of the client.
    pub user_agent: Option<String>,
    /// Remote IP address as seen by the edge.
    pub ip: Option<String>,
}

/// Lifecycle events kept in the audit trail of a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEvent {
    /// A new session was opened.
    Connected,
    /// The transport dropped.
    Disconnected,
    /// The session resumed within the same record.
    Reconnected,
    /// The subject left on purpose.
    Left,
    /// The grace period elapsed and the session was closed.
    Finalized,
}

/// One entry of the append-only audit trail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEntry {
    /// When the event was recorded.
    pub timestamp: SystemTime,
    /// What happened.
    pub event: AuditEvent,
    /// Free-form detail.
    pub details: Option<String>,
}

/// Structured metadata attached to a connection record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionMetadata {
    /// Client details from the most recent presence signal that carried them.
    pub client: Option<ClientInfo>,
    /// Last heartbeat received while connected.
    pub last_heartbeat: Option<SystemTime>,
    /// Whole seconds spent temporarily disconnected before the last reconnection.
    pub disconnection_duration_secs: Option<u64>,
    /// When the record was finalized as disconnected.
    pub finalized_at: Option<SystemTime>,
    /// Append-only trail of lifecycle events.
    pub audit: Vec<AuditEntry>,
}

impl ConnectionMetadata {
    /// Append an entry to the audit trail.
    pub fn record(&mut self, timestamp: SystemTime, event: AuditEvent, details: Option<String>) {
        self.audit.push(AuditEntry {
            timestamp,
            event,
            details,
        });
    }

    /// Replace client details when the signal carried any.
    pub fn merge_client(&mut self, client: Option<ClientInfo>) {
        if let Some(client) = client {
            self.client = Some(client);
        }
    }
}

/// Persisted connection record, shared by the storage and service layers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionRecord {
    /// Stable identifier; kept across reconnections.
    pub id: Uuid,
    /// Subject the record belongs to.
    pub subject_id: SubjectId,
    /// Context the subject is present in.
    pub context: PresenceContext,
    /// Current lifecycle state.
    pub state: ConnectionState,
    /// Start of the session.
    pub connected_at: SystemTime,
    /// Set when entering [`ConnectionState::TemporarilyDisconnected`].
    pub disconnected_at: Option<SystemTime>,
    /// Set when leaving [`ConnectionState::TemporarilyDisconnected`] back to connected.
    pub reconnected_at: Option<SystemTime>,
    /// Structured metadata and audit trail.
    pub metadata: ConnectionMetadata,
    /// Insertion time of the row.
    pub created_at: SystemTime,
    /// Last state change of the row.
    pub updated_at: SystemTime,
    /// Insertion order within the key; the highest value is the latest record.
    pub seq: u64,
    /// Incremented on every in-place update.
    pub version: u64,
}

impl ConnectionRecord {
    /// Open a new session row in the connected state.
    pub fn open(key: ConnectionKey, seq: u64, now: SystemTime, client: Option<ClientInfo>) -> Self {
        let mut metadata = ConnectionMetadata {
            client,
            ..ConnectionMetadata::default()
        };
        metadata.record(now, AuditEvent::Connected, None);

        Self {
            id: Uuid::new_v4(),
            subject_id: key.subject_id,
            context: key.context,
            state: ConnectionState::Connected,
            connected_at: now,
            disconnected_at: None,
            reconnected_at: None,
            metadata,
            created_at: now,
            updated_at: now,
            seq,
            version: 0,
        }
    }

    /// Key this record is grouped under.
    pub fn key(&self) -> ConnectionKey {
        ConnectionKey::new(self.subject_id, self.context)
    }

    /// Time spent disconnected for a row that went down and came back.
    pub fn resolved_disconnection(&self) -> Option<Duration> {
        let (down, up) = self.disconnected_at.zip(self.reconnected_at)?;
        Some(up.duration_since(down).unwrap_or_default())
    }
}
