use axum::{
    Json, Router,
    extract::{Path, State},
    routing::{get, post},
};
use axum_valid::Valid;

use crate::{
    dao::models::{ConnectionKey, ContextId, ContextType, PresenceContext, SubjectId},
    dto::{
        presence::{
            ConnectionQualityResponse, ConnectionStateResponse, DisconnectResponse, PresenceAck,
            PresenceSignalRequest,
        },
        validation::validate_positive_id,
    },
    error::AppError,
    state::SharedState,
};

/// Presence signal and read endpoints.
pub fn router() -> Router<SharedState> {
    Router::new()
        .route("/presence/connect", post(connect))
        .route("/presence/heartbeat", post(heartbeat))
        .route("/presence/disconnect", post(disconnect))
        .route("/presence/reconnect", post(reconnect))
        .route("/presence/leave", post(leave))
        .route(
            "/presence/{subject_id}/{context_type}/{context_id}",
            get(connection_state),
        )
        .route(
            "/presence/{subject_id}/{context_type}/{context_id}/quality",
            get(connection_quality),
        )
}

/// Record the first presence signal of a subject in a context.
#[utoipa::path(
    post,
    path = "/presence/connect",
    tag = "presence",
    request_body = PresenceSignalRequest,
    responses(
        (status = 200, description = "Connection recorded", body = PresenceAck),
        (status = 400, description = "Invalid payload"),
        (status = 503, description = "Storage unavailable")
    )
)]
pub async fn connect(
    State(state): State<SharedState>,
    Valid(Json(payload)): Valid<Json<PresenceSignalRequest>>,
) -> Result<Json<PresenceAck>, AppError> {
    let key = payload.key();
    let record = state
        .presence()
        .record_initial_connection(key, payload.client_info())
        .await?;
    Ok(Json(ack(&state, key, record.is_some()).await?))
}

/// Client heartbeat; also resumes a dropped connection or opens a new session.
#[utoipa::path(
    post,
    path = "/presence/heartbeat",
    tag = "presence",
    request_body = PresenceSignalRequest,
    responses(
        (status = 200, description = "Heartbeat processed", body = PresenceAck),
        (status = 400, description = "Invalid payload"),
        (status = 503, description = "Storage unavailable")
    )
)]
pub async fn heartbeat(
    State(state): State<SharedState>,
    Valid(Json(payload)): Valid<Json<PresenceSignalRequest>>,
) -> Result<Json<PresenceAck>, AppError> {
    let key = payload.key();
    let record = state
        .presence()
        .update_last_seen(key, payload.client_info())
        .await?;
    Ok(Json(ack(&state, key, record.is_some()).await?))
}

/// Transport callback: the connection dropped. Starts the grace period.
#[utoipa::path(
    post,
    path = "/presence/disconnect",
    tag = "presence",
    request_body = PresenceSignalRequest,
    responses(
        (status = 200, description = "Disconnection processed", body = DisconnectResponse),
        (status = 400, description = "Invalid payload"),
        (status = 503, description = "Storage unavailable")
    )
)]
pub async fn disconnect(
    State(state): State<SharedState>,
    Valid(Json(payload)): Valid<Json<PresenceSignalRequest>>,
) -> Result<Json<DisconnectResponse>, AppError> {
    let handle = state
        .presence()
        .handle_disconnection(payload.key(), payload.client_info())
        .await?;
    Ok(Json(DisconnectResponse::from(handle)))
}

/// Transport callback: a dropped connection came back.
#[utoipa::path(
    post,
    path = "/presence/reconnect",
    tag = "presence",
    request_body = PresenceSignalRequest,
    responses(
        (status = 200, description = "Reconnection processed", body = PresenceAck),
        (status = 400, description = "Invalid payload"),
        (status = 503, description = "Storage unavailable")
    )
)]
pub async fn reconnect(
    State(state): State<SharedState>,
    Valid(Json(payload)): Valid<Json<PresenceSignalRequest>>,
) -> Result<Json<PresenceAck>, AppError> {
    let key = payload.key();
    let accepted = state
        .presence()
        .handle_reconnection(key, payload.client_info())
        .await?;
    Ok(Json(ack(&state, key, accepted).await?))
}

/// The subject left the context on purpose.
#[utoipa::path(
    post,
    path = "/presence/leave",
    tag = "presence",
    request_body = PresenceSignalRequest,
    responses(
        (status = 200, description = "Leave processed", body = PresenceAck),
        (status = 400, description = "Invalid payload"),
        (status = 503, description = "Storage unavailable")
    )
)]
pub async fn leave(
    State(state): State<SharedState>,
    Valid(Json(payload)): Valid<Json<PresenceSignalRequest>>,
) -> Result<Json<PresenceAck>, AppError> {
    let key = payload.key();
    let record = state.presence().handle_graceful_disconnection(key).await?;
    Ok(Json(ack(&state, key, record.is_some()).await?))
}

/// Current presence of a subject in a context.
#[utoipa::path(
    get,
    path = "/presence/{subject_id}/{context_type}/{context_id}",
    tag = "presence",
    params(
        ("subject_id" = i64, Path, description = "Subject identifier"),
        ("context_type" = ContextType, Path, description = "Context kind"),
        ("context_id" = i64, Path, description = "Context identifier")
    ),
    responses(
        (status = 200, description = "Current presence", body = ConnectionStateResponse),
        (status = 400, description = "Invalid identifiers"),
        (status = 503, description = "Storage unavailable")
    )
)]
pub async fn connection_state(
    State(state): State<SharedState>,
    Path((subject_id, context_type, context_id)): Path<(SubjectId, ContextType, ContextId)>,
) -> Result<Json<ConnectionStateResponse>, AppError> {
    let key = path_key(subject_id, context_type, context_id)?;
    let record = state.presence().get_connection_state(key).await?;
    Ok(Json(ConnectionStateResponse::new(
        key,
        record.as_ref(),
        state.presence().now(),
        state.presence().heartbeat_interval(),
    )))
}

/// Connection-quality assessment over the recent history of a connection.
#[utoipa::path(
    get,
    path = "/presence/{subject_id}/{context_type}/{context_id}/quality",
    tag = "presence",
    params(
        ("subject_id" = i64, Path, description = "Subject identifier"),
        ("context_type" = ContextType, Path, description = "Context kind"),
        ("context_id" = i64, Path, description = "Context identifier")
    ),
    responses(
        (status = 200, description = "Quality assessment", body = ConnectionQualityResponse),
        (status = 400, description = "Invalid identifiers"),
        (status = 503, description = "Storage unavailable")
    )
)]
pub async fn connection_quality(
    State(state): State<SharedState>,
    Path((subject_id, context_type, context_id)): Path<(SubjectId, ContextType, ContextId)>,
) -> Result<Json<ConnectionQualityResponse>, AppError> {
    let key = path_key(subject_id, context_type, context_id)?;
    let quality = state.presence().get_connection_quality(key).await?;
    Ok(Json(quality.into()))
}

fn path_key(
    subject_id: SubjectId,
    context_type: ContextType,
    context_id: ContextId,
) -> Result<ConnectionKey, AppError> {
    validate_positive_id(subject_id)
        .and_then(|()| validate_positive_id(context_id))
        .map_err(|err| AppError::BadRequest(err.to_string()))?;
    Ok(ConnectionKey::new(
        subject_id,
        PresenceContext::new(context_type, context_id),
    ))
}

async fn ack(state: &SharedState, key: ConnectionKey, accepted: bool) -> Result<PresenceAck, AppError> {
    let presence = state.presence();
    let record = presence.get_connection_state(key).await?;
    Ok(PresenceAck {
        accepted,
        presence: ConnectionStateResponse::new(
            key,
            record.as_ref(),
            presence.now(),
            presence.heartbeat_interval(),
        ),
    })
}
