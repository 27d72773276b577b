use serde::Serialize;
use tracing::warn;

use crate::{
    dao::models::ConnectionRecord,
    dto::{
        format_system_time,
        sse::{PresenceChangedEvent, ServerEvent},
    },
    services::scheduler::DeferredTaskHandle,
    state::events::PresenceEvents,
};

pub(crate) const EVENT_CONNECTED: &str = "connection.connected";
pub(crate) const EVENT_DISCONNECTED: &str = "connection.disconnected";
pub(crate) const EVENT_RECONNECTED: &str = "connection.reconnected";
pub(crate) const EVENT_LEFT: &str = "connection.left";
pub(crate) const EVENT_FINALIZED: &str = "connection.finalized";

/// Broadcast that a session was opened.
pub fn broadcast_connected(events: &PresenceEvents, record: &ConnectionRecord) {
    send_event(events, EVENT_CONNECTED, &changed(record, None));
}

/// Broadcast that a connection dropped and when it will be finalized.
pub fn broadcast_disconnected(
    events: &PresenceEvents,
    record: &ConnectionRecord,
    handle: &DeferredTaskHandle,
) {
    send_event(
        events,
        EVENT_DISCONNECTED,
        &changed(record, Some(format_system_time(handle.due_at))),
    );
}

/// Broadcast that a dropped connection came back.
pub fn broadcast_reconnected(events: &PresenceEvents, record: &ConnectionRecord) {
    send_event(events, EVENT_RECONNECTED, &changed(record, None));
}

/// Broadcast that a subject left on purpose.
pub fn broadcast_left(events: &PresenceEvents, record: &ConnectionRecord) {
    send_event(events, EVENT_LEFT, &changed(record, None));
}

/// Broadcast that the grace period elapsed and the connection was closed.
///
/// Downstream consumers decide what a finalized connection means for the context.
pub fn broadcast_finalized(events: &PresenceEvents, record: &ConnectionRecord) {
    send_event(events, EVENT_FINALIZED, &changed(record, None));
}

fn changed(record: &ConnectionRecord, finalize_at: Option<String>) -> PresenceChangedEvent {
    PresenceChangedEvent {
        subject_id: record.subject_id,
        context_type: record.context.kind,
        context_id: record.context.id,
        state: record.state,
        record_id: record.id,
        at: format_system_time(record.updated_at),
        finalize_at,
    }
}

fn send_event(events: &PresenceEvents, event: &str, payload: &impl Serialize) {
    match ServerEvent::json(Some(event.to_string()), payload) {
        Ok(event) => events.broadcast(event),
        Err(err) => warn!(event, error = %err, "failed to serialize presence SSE payload"),
    }
}
