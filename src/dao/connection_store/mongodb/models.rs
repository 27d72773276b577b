use mongodb::bson::{DateTime, Document, doc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::error::MongoDaoError;
use crate::{
    dao::models::{
        AuditEntry, AuditEvent, ClientInfo, ConnectionKey, ConnectionMetadata, ConnectionRecord,
        ContextType, PresenceContext,
    },
    state::state_machine::ConnectionState,
};

/// Document stored in the `connections` collection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MongoConnectionDocument {
    #[serde(rename = "_id")]
    id: String,
    subject_id: i64,
    context_type: ContextType,
    context_id: i64,
    state: ConnectionState,
    connected_at: DateTime,
    disconnected_at: Option<DateTime>,
    reconnected_at: Option<DateTime>,
    metadata: MongoMetadataDocument,
    created_at: DateTime,
    updated_at: DateTime,
    seq: i64,
    version: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct MongoMetadataDocument {
    client: Option<ClientInfo>,
    last_heartbeat: Option<DateTime>,
    disconnection_duration_secs: Option<i64>,
    finalized_at: Option<DateTime>,
    #[serde(default)]
    audit: Vec<MongoAuditDocument>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct MongoAuditDocument {
    timestamp: DateTime,
    event: AuditEvent,
    details: Option<String>,
}

impl From<ConnectionRecord> for MongoConnectionDocument {
    fn from(value: ConnectionRecord) -> Self {
        let metadata = value.metadata;
        Self {
            id: value.id.to_string(),
            subject_id: value.subject_id,
            context_type: value.context.kind,
            context_id: value.context.id,
            state: value.state,
            connected_at: DateTime::from_system_time(value.connected_at),
            disconnected_at: value.disconnected_at.map(DateTime::from_system_time),
            reconnected_at: value.reconnected_at.map(DateTime::from_system_time),
            metadata: MongoMetadataDocument {
                client: metadata.client,
                last_heartbeat: metadata.last_heartbeat.map(DateTime::from_system_time),
                disconnection_duration_secs: metadata
                    .disconnection_duration_secs
                    .map(|secs| i64::try_from(secs).unwrap_or(i64::MAX)),
                finalized_at: metadata.finalized_at.map(DateTime::from_system_time),
                audit: metadata
                    .audit
                    .into_iter()
                    .map(|entry| MongoAuditDocument {
                        timestamp: DateTime::from_system_time(entry.timestamp),
                        event: entry.event,
                        details: entry.details,
                    })
                    .collect(),
            },
            created_at: DateTime::from_system_time(value.created_at),
            updated_at: DateTime::from_system_time(value.updated_at),
            seq: to_stored_counter(value.seq),
            version: to_stored_counter(value.version),
        }
    }
}

impl TryFrom<MongoConnectionDocument> for ConnectionRecord {
    type Error = MongoDaoError;

    fn try_from(value: MongoConnectionDocument) -> Result<Self, Self::Error> {
        let id = Uuid::parse_str(&value.id).map_err(|err| MongoDaoError::CorruptRecord {
            id: value.id.clone(),
            reason: err.to_string(),
        })?;
        let seq = from_stored_counter(&value.id, "seq", value.seq)?;
        let version = from_stored_counter(&value.id, "version", value.version)?;
        let metadata = value.metadata;

        Ok(Self {
            id,
            subject_id: value.subject_id,
            context: PresenceContext::new(value.context_type, value.context_id),
            state: value.state,
            connected_at: value.connected_at.to_system_time(),
            disconnected_at: value.disconnected_at.map(DateTime::to_system_time),
            reconnected_at: value.reconnected_at.map(DateTime::to_system_time),
            metadata: ConnectionMetadata {
                client: metadata.client,
                last_heartbeat: metadata.last_heartbeat.map(DateTime::to_system_time),
                disconnection_duration_secs: metadata
                    .disconnection_duration_secs
                    .map(|secs| u64::try_from(secs).unwrap_or_default()),
                finalized_at: metadata.finalized_at.map(DateTime::to_system_time),
                audit: metadata
                    .audit
                    .into_iter()
                    .map(|entry| AuditEntry {
                        timestamp: entry.timestamp.to_system_time(),
                        event: entry.event,
                        details: entry.details,
                    })
                    .collect(),
            },
            created_at: value.created_at.to_system_time(),
            updated_at: value.updated_at.to_system_time(),
            seq,
            version,
        })
    }
}

fn to_stored_counter(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn from_stored_counter(id: &str, field: &str, value: i64) -> Result<u64, MongoDaoError> {
    u64::try_from(value).map_err(|_| MongoDaoError::CorruptRecord {
        id: id.to_owned(),
        reason: format!("negative `{field}` ({value})"),
    })
}

/// Filter matching every record of a key.
pub fn key_filter(key: ConnectionKey) -> Document {
    doc! {
        "subject_id": key.subject_id,
        "context_type": key.context.kind.as_str(),
        "context_id": key.context.id,
    }
}

/// Filter matching one record at an exact version.
pub fn versioned_id_filter(id: Uuid, version: u64) -> Document {
    doc! {
        "_id": id.to_string(),
        "version": to_stored_counter(version),
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, UNIX_EPOCH};

    use super::*;

    fn key() -> ConnectionKey {
        ConnectionKey::new(7, PresenceContext::debate(3))
    }

    #[test]
    fn key_filter_uses_stored_context_name() {
        let filter = key_filter(key());
        assert_eq!(filter.get_str("context_type").unwrap(), "debate");
        assert_eq!(filter.get_i64("subject_id").unwrap(), 7);
    }

    #[test]
    fn negative_counter_is_reported_as_corrupt() {
        let now = UNIX_EPOCH + Duration::from_secs(1_700_000_000);
        let mut document = MongoConnectionDocument::from(ConnectionRecord::open(key(), 2, now, None));
        assert_eq!(document.seq, 2);

        document.version = -1;
        let err = ConnectionRecord::try_from(document).unwrap_err();
        assert!(matches!(err, MongoDaoError::CorruptRecord { .. }));
    }
}
