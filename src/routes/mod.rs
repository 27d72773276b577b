use axum::Router;

use crate::state::SharedState;

/// Swagger UI and OpenAPI JSON.
pub mod docs;
/// Health check route.
pub mod health;
/// Presence signal and read routes.
pub mod presence;
/// Server-sent events route.
pub mod sse;

/// Compose all route trees, wiring in shared state and documentation routes.
pub fn router(state: SharedState) -> Router<()> {
    health::router()
        .merge(sse::router())
        .merge(presence::router())
        .merge(docs::router())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::{
        body::{Body, to_bytes},
        http::{Request, StatusCode, header},
    };
    use serde_json::{Value, json};
    use tower::ServiceExt;

    use super::*;
    use crate::{state::AppState, test_support::Harness};

    fn app(harness: &Harness) -> Router<()> {
        let state = AppState::new(
            Arc::new(harness.presence()),
            harness.events.clone(),
            Arc::new(harness.store.clone()),
            "memory",
        );
        router(state)
    }

    fn post(uri: &str, body: Value) -> Request<Body> {
        Request::post(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn json_body(response: axum::response::Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn connect_then_read_state() {
        let harness = Harness::new();
        let app = app(&harness);

        let response = app
            .clone()
            .oneshot(post(
                "/presence/connect",
                json!({"subject_id": 7, "context_type": "debate", "context_id": 4,
                       "client": {"user_agent": "demo-client/1.0", "ip": "10.0.0.1"}}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["accepted"], true);
        assert_eq!(body["presence"]["state"], "connected");

        let response = app
            .oneshot(
                Request::get("/presence/7/debate/4")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let body = json_body(response).await;
        assert_eq!(body["online"], true);
        assert_eq!(body["heartbeat_interval_seconds"], 30);
    }

    #[tokio::test]
    async fn disconnect_reports_finalize_task() {
        let harness = Harness::new();
        let app = app(&harness);
        let signal = json!({"subject_id": 7, "context_type": "room", "context_id": 4});

        app.clone()
            .oneshot(post("/presence/connect", signal.clone()))
            .await
            .unwrap();
        let response = app
            .oneshot(post("/presence/disconnect", signal))
            .await
            .unwrap();

        let body = json_body(response).await;
        assert_eq!(body["accepted"], true);
        assert_eq!(body["finalize_task"], "finalize-disconnection:7:room:4");
    }

    #[tokio::test]
    async fn invalid_signal_is_rejected() {
        let harness = Harness::new();
        let response = app(&harness)
            .oneshot(post(
                "/presence/heartbeat",
                json!({"subject_id": 0, "context_type": "room", "context_id": 4}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn quality_of_unknown_connection_is_excellent() {
        let harness = Harness::new();
        let response = app(&harness)
            .oneshot(
                Request::get("/presence/7/room/4/quality")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["score"], 100);
        assert_eq!(body["level"], "excellent");
    }

    #[tokio::test]
    async fn healthcheck_reports_backend() {
        let harness = Harness::new();
        let response = app(&harness)
            .oneshot(Request::get("/healthcheck").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let body = json_body(response).await;
        assert_eq!(body["status"], "ok");
        assert_eq!(body["storage"], "memory");
    }
}
