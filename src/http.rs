//! HTTP Ingress
//!
//! The gateway's only HTTP surface: `POST /webhook/{subscription_id}`.
//! Everything interesting happens in [`Gateway::ingest`]; this layer just
//! maps its outcome to a status code. Accepted, paused, and gate-dropped
//! requests all acknowledge with 200 so providers never retry them.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    routing::post,
    Router,
};

use crate::gateway::{Gateway, IngestOutcome};

pub fn router(gateway: Arc<Gateway>) -> Router {
    Router::new()
        .route("/webhook/{subscription_id}", post(handle_webhook))
        .with_state(gateway)
}

async fn handle_webhook(
    Path(subscription_id): Path<String>,
    State(gateway): State<Arc<Gateway>>,
    headers: HeaderMap,
    body: Bytes,
) -> StatusCode {
    match gateway.ingest(&subscription_id, &headers, &body).await {
        IngestOutcome::Accepted | IngestOutcome::Paused | IngestOutcome::Dropped => StatusCode::OK,
        IngestOutcome::SignatureMismatch => StatusCode::UNAUTHORIZED,
        IngestOutcome::UnknownSubscription => StatusCode::NOT_FOUND,
    }
}
