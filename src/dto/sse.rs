use serde::Serialize;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::{
    dao::models::{ContextId, ContextType, SubjectId},
    state::state_machine::ConnectionState,
};

#[derive(Clone, Debug)]
/// Dispatched payload carried across SSE channels.
pub struct ServerEvent {
    /// SSE event name.
    pub event: Option<String>,
    /// Serialized payload.
    pub data: String,
}

impl ServerEvent {
    /// Construct an event from a raw data string.
    pub fn new(event: Option<String>, data: String) -> Self {
        Self { event, data }
    }

    /// Convenience wrapper that serialises `payload` into the SSE data field.
    pub fn json<E, T>(event: E, payload: &T) -> serde_json::Result<Self>
    where
        E: Into<Option<String>>,
        T: Serialize,
    {
        Ok(Self {
            event: event.into(),
            data: serde_json::to_string(payload)?,
        })
    }
}

#[derive(Debug, Serialize, ToSchema)]
/// Initial metadata sent to an SSE client when it connects.
pub struct Handshake {
    /// Identifier of the SSE stream.
    pub stream: String,
    /// Human-readable message confirming the subscription.
    pub message: String,
}

#[derive(Debug, Serialize, ToSchema)]
/// Broadcast on every connection lifecycle transition.
pub struct PresenceChangedEvent {
    /// Subject whose presence changed.
    pub subject_id: SubjectId,
    /// Kind of context the subject is present in.
    pub context_type: ContextType,
    /// Context identifier.
    pub context_id: ContextId,
    /// State after the transition.
    pub state: ConnectionState,
    /// Record the transition was written to.
    pub record_id: Uuid,
    /// When the transition was recorded.
    pub at: String,
    /// Set on disconnection: when the connection is finalized unless it comes back.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finalize_at: Option<String>,
}
