//! Notification trigger, inbox and read / dismiss routes.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use beacon_common::error::AppError;
use beacon_common::types::NotificationRecord;
use beacon_engine::notifications::{CreateNotificationParams, NotificationDetail};
use beacon_engine::store::InboxQuery;
use beacon_notifier::dispatcher::DispatchSummary;

use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route(
            "/api/notifications",
            post(create_notification).get(list_notifications),
        )
        .route("/api/notifications/read", post(mark_read))
        .route("/api/notifications/dismiss", post(dismiss))
        .route("/api/notifications/threads/{thread_id}", get(get_thread))
        .route("/api/notifications/{id}", get(get_notification))
}

#[derive(Debug, Serialize)]
pub struct InboxResponse {
    pub notifications: Vec<NotificationRecord>,
    pub unread_count: i64,
}

#[derive(Debug, Deserialize)]
pub struct BatchRequest {
    pub user_id: Uuid,
    pub ids: Vec<Uuid>,
}

#[derive(Debug, Deserialize)]
pub struct ThreadQuery {
    pub tenant_id: Uuid,
}

/// POST /api/notifications: Create a notification and dispatch it.
async fn create_notification(
    State(state): State<AppState>,
    Json(params): Json<CreateNotificationParams>,
) -> Result<(StatusCode, Json<DispatchSummary>), AppError> {
    let summary = state.pipeline.create_and_dispatch(&params).await?;
    Ok((StatusCode::CREATED, Json(summary)))
}

/// GET /api/notifications: A user's inbox, newest first.
async fn list_notifications(
    State(state): State<AppState>,
    Query(query): Query<InboxQuery>,
) -> Result<Json<InboxResponse>, AppError> {
    let notifications = state.notifications.inbox(&query).await?;
    let unread_count = state
        .notifications
        .unread_count(query.tenant_id, query.user_id)
        .await?;
    Ok(Json(InboxResponse {
        notifications,
        unread_count,
    }))
}

/// GET /api/notifications/:id: A notification with per-channel delivery status.
async fn get_notification(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<NotificationDetail>, AppError> {
    Ok(Json(state.notifications.detail(id).await?))
}

/// GET /api/notifications/threads/:thread_id: Every record of a thread, oldest first.
async fn get_thread(
    State(state): State<AppState>,
    Path(thread_id): Path<String>,
    Query(query): Query<ThreadQuery>,
) -> Result<Json<Vec<NotificationRecord>>, AppError> {
    Ok(Json(
        state.notifications.thread(query.tenant_id, &thread_id).await?,
    ))
}

/// POST /api/notifications/read
async fn mark_read(
    State(state): State<AppState>,
    Json(req): Json<BatchRequest>,
) -> Result<Json<serde_json::Value>, AppError> {
    let affected = state.notifications.mark_read(req.user_id, &req.ids).await?;
    Ok(Json(serde_json::json!({ "affected": affected })))
}

/// POST /api/notifications/dismiss
async fn dismiss(
    State(state): State<AppState>,
    Json(req): Json<BatchRequest>,
) -> Result<Json<serde_json::Value>, AppError> {
    let affected = state.notifications.dismiss(req.user_id, &req.ids).await?;
    Ok(Json(serde_json::json!({ "affected": affected })))
}
