use utoipa::OpenApi;

#[derive(OpenApi)]
/// Aggregated OpenAPI specification for Presence Keeper.
#[openapi(
    paths(
        crate::routes::health::healthcheck,
        crate::routes::sse::presence_stream,
        crate::routes::presence::connect,
        crate::routes::presence::heartbeat,
        crate::routes::presence::disconnect,
        crate::routes::presence::reconnect,
        crate::routes::presence::leave,
        crate::routes::presence::connection_state,
        crate::routes::presence::connection_quality,
    ),
    components(
        schemas(
            crate::dto::health::HealthResponse,
            crate::dto::presence::PresenceSignalRequest,
            crate::dto::presence::ClientInfoPayload,
            crate::dto::presence::ConnectionStateResponse,
            crate::dto::presence::PresenceAck,
            crate::dto::presence::DisconnectResponse,
            crate::dto::presence::ConnectionQualityResponse,
            crate::dto::sse::Handshake,
            crate::dto::sse::PresenceChangedEvent,
            crate::dao::models::ContextType,
            crate::state::state_machine::ConnectionState,
            crate::services::anomaly::ConnectionStats,
            crate::services::anomaly::Anomalies,
            crate::services::anomaly::AnomalyReport,
            crate::services::anomaly::Severity,
            crate::services::anomaly::QualityLevel,
        )
    ),
    tags(
        (name = "health", description = "Health check endpoints"),
        (name = "sse", description = "Server-sent events streams"),
        (name = "presence", description = "Presence signals and connection state"),
    )
)]
pub struct ApiDoc;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn document_lists_presence_routes() {
        let doc = ApiDoc::openapi();
        let paths = &doc.paths.paths;
        assert!(paths.contains_key("/presence/heartbeat"));
        assert!(paths.contains_key("/presence/{subject_id}/{context_type}/{context_id}/quality"));
        assert!(paths.contains_key("/sse/presence"));
    }
}
