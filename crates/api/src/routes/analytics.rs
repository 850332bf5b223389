//! Read-only analytics routes. Every query takes `tenant_id`, `start` and
//! `end` (RFC 3339); `include_archived=true` adds cold storage.

use axum::extract::{Path, Query, State};
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use uuid::Uuid;

use beacon_common::error::AppError;
use beacon_engine::analytics::{
    AnalyticsQuery, DeliveryMetrics, EngagementMetrics, FunnelMetrics, ProviderPerformance,
    TimeBucket, TimelinePoint, UserSummary,
};
use beacon_engine::store::{StorageScope, TimeRange};

use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/analytics/delivery", get(delivery))
        .route("/api/analytics/engagement", get(engagement))
        .route("/api/analytics/funnel", get(funnel))
        .route("/api/analytics/providers", get(providers))
        .route("/api/analytics/timeline", get(timeline))
        .route("/api/analytics/users/{user_id}", get(user_summary))
}

#[derive(Debug, Deserialize)]
pub struct AnalyticsParams {
    pub tenant_id: Uuid,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    #[serde(default)]
    pub include_archived: bool,
    #[serde(default)]
    pub bucket: TimeBucket,
}

impl AnalyticsParams {
    fn query(&self) -> Result<AnalyticsQuery, AppError> {
        Ok(AnalyticsQuery {
            tenant_id: self.tenant_id,
            range: TimeRange::new(self.start, self.end)?,
            scope: if self.include_archived {
                StorageScope::All
            } else {
                StorageScope::Hot
            },
        })
    }
}

async fn delivery(
    State(state): State<AppState>,
    Query(params): Query<AnalyticsParams>,
) -> Result<Json<DeliveryMetrics>, AppError> {
    Ok(Json(state.analytics.delivery(&params.query()?).await?))
}

async fn engagement(
    State(state): State<AppState>,
    Query(params): Query<AnalyticsParams>,
) -> Result<Json<EngagementMetrics>, AppError> {
    Ok(Json(state.analytics.engagement(&params.query()?).await?))
}

async fn funnel(
    State(state): State<AppState>,
    Query(params): Query<AnalyticsParams>,
) -> Result<Json<FunnelMetrics>, AppError> {
    Ok(Json(state.analytics.funnel(&params.query()?).await?))
}

async fn providers(
    State(state): State<AppState>,
    Query(params): Query<AnalyticsParams>,
) -> Result<Json<Vec<ProviderPerformance>>, AppError> {
    Ok(Json(state.analytics.providers(&params.query()?).await?))
}

async fn timeline(
    State(state): State<AppState>,
    Query(params): Query<AnalyticsParams>,
) -> Result<Json<Vec<TimelinePoint>>, AppError> {
    Ok(Json(
        state
            .analytics
            .timeline(&params.query()?, params.bucket)
            .await?,
    ))
}

async fn user_summary(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
    Query(params): Query<AnalyticsParams>,
) -> Result<Json<UserSummary>, AppError> {
    Ok(Json(state.analytics.user(&params.query()?, user_id).await?))
}
