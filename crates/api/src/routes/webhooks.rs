//! Provider delivery callbacks.

use axum::body::Bytes;
use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use serde_json::json;

use beacon_notifier::correlator::CallbackEvent;

use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/api/webhooks/delivery", post(delivery_callback))
}

/// POST /api/webhooks/delivery: Always acknowledged so providers stop retrying.
///
/// Bodies that do not parse, including event types we do not track, are
/// logged and dropped.
async fn delivery_callback(State(state): State<AppState>, body: Bytes) -> Json<serde_json::Value> {
    let event = match serde_json::from_slice::<CallbackEvent>(&body) {
        Ok(event) => event,
        Err(e) => {
            tracing::warn!(error = %e, bytes = body.len(), "Dropping unrecognized provider callback");
            return accepted();
        }
    };

    if let Err(e) = state.correlator.ingest(&event).await {
        tracing::error!(
            provider = %event.provider,
            provider_message_id = %event.provider_message_id,
            error = %e,
            "Failed to process provider callback"
        );
    }
    accepted()
}

fn accepted() -> Json<serde_json::Value> {
    Json(json!({ "accepted": true }))
}
