use std::convert::Infallible;

use axum::{Router, extract::State, response::sse::Sse, routing::get};
use futures::Stream;
use tracing::info;

use crate::{services::sse_service, state::SharedState};

#[utoipa::path(
    get,
    path = "/sse/presence",
    tag = "sse",
    responses((status = 200, description = "Presence lifecycle events (connection.connected, connection.disconnected, connection.reconnected, connection.left, connection.finalized)", content_type = "text/event-stream", body = String))
)]
/// Stream presence lifecycle events to downstream consumers.
pub async fn presence_stream(
    State(state): State<SharedState>,
) -> Sse<impl Stream<Item = Result<axum::response::sse::Event, Infallible>>> {
    let receiver = sse_service::subscribe_presence(&state);
    info!("New presence SSE connection");
    sse_service::to_sse_stream(receiver, sse_service::presence_handshake())
}

/// Configure the SSE endpoints.
pub fn router() -> Router<SharedState> {
    Router::<SharedState>::new().route("/sse/presence", get(presence_stream))
}
