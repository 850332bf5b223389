//! Analytics engine: read-only aggregations over notifications and attempts.
//!
//! Aggregations are plain functions over attempt slices so they can be
//! exercised without a database; [`AnalyticsService`] loads the rows for a
//! tenant and window and applies them. Every rate with a zero denominator
//! is reported as `0.0`.
//!
//! An attempt counts as *sent* once it has left `pending`, whatever the
//! outcome. Funnel stages are counted by rank, so
//! `sent ≥ delivered ≥ opened ≥ clicked` always holds.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Datelike, Duration, DurationRound, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use beacon_common::error::AppError;
use beacon_common::types::{Channel, DeliveryAttempt, DeliveryStatus};

use crate::store::{AttemptStore, NotificationStore, StorageScope, TimeRange};

const OPEN_WEIGHT: f64 = 0.6;
const CLICK_WEIGHT: f64 = 0.4;
const MAX_TIMELINE_POINTS: i64 = 10_000;

/// `numerator / denominator`, or 0 when the denominator is 0.
pub fn rate(numerator: u64, denominator: u64) -> f64 {
    if denominator == 0 {
        0.0
    } else {
        numerator as f64 / denominator as f64
    }
}

fn mean(values: &[i64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<i64>() as f64 / values.len() as f64
}

/// Nearest-rank percentile. 0 for an empty sample.
pub fn percentile(values: &[i64], pct: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_unstable();
    let rank = ((pct / 100.0) * sorted.len() as f64).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1] as f64
}

fn is_sent(a: &DeliveryAttempt) -> bool {
    a.status != DeliveryStatus::Pending
}

fn is_delivered(a: &DeliveryAttempt) -> bool {
    a.status.funnel_rank().is_some_and(|rank| rank >= 2)
}

fn is_opened(a: &DeliveryAttempt) -> bool {
    is_delivered(a) && a.opened_at.is_some()
}

fn is_clicked(a: &DeliveryAttempt) -> bool {
    is_delivered(a) && a.clicked_at.is_some()
}

/// Parameters shared by every analytics query.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct AnalyticsQuery {
    pub tenant_id: Uuid,
    pub range: TimeRange,
    #[serde(default)]
    pub scope: StorageScope,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DeliveryCounts {
    pub total: u64,
    pub pending: u64,
    pub sent: u64,
    pub delivered: u64,
    pub failed: u64,
    pub bounced: u64,
    pub rejected: u64,
    pub delivery_rate: f64,
    pub failure_rate: f64,
    pub avg_send_latency_ms: f64,
    pub p95_send_latency_ms: f64,
    pub avg_delivery_latency_ms: f64,
    pub p95_delivery_latency_ms: f64,
}

impl DeliveryCounts {
    fn from_attempts<'a>(attempts: impl IntoIterator<Item = &'a DeliveryAttempt>) -> Self {
        let mut counts = Self::default();
        let mut send_latencies = Vec::new();
        let mut delivery_latencies = Vec::new();

        for a in attempts {
            counts.total += 1;
            match a.status {
                DeliveryStatus::Pending => counts.pending += 1,
                DeliveryStatus::Failed => counts.failed += 1,
                DeliveryStatus::Bounced => counts.bounced += 1,
                DeliveryStatus::Rejected => counts.rejected += 1,
                _ => {}
            }
            if is_sent(a) {
                counts.sent += 1;
            }
            if is_delivered(a) {
                counts.delivered += 1;
            }
            send_latencies.extend(a.send_latency_ms);
            delivery_latencies.extend(a.delivery_latency_ms);
        }

        counts.delivery_rate = rate(counts.delivered, counts.sent);
        counts.failure_rate = rate(counts.failed + counts.bounced + counts.rejected, counts.sent);
        counts.avg_send_latency_ms = mean(&send_latencies);
        counts.p95_send_latency_ms = percentile(&send_latencies, 95.0);
        counts.avg_delivery_latency_ms = mean(&delivery_latencies);
        counts.p95_delivery_latency_ms = percentile(&delivery_latencies, 95.0);
        counts
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DeliveryMetrics {
    pub overall: DeliveryCounts,
    pub by_channel: BTreeMap<Channel, DeliveryCounts>,
}

pub fn delivery_metrics(attempts: &[DeliveryAttempt]) -> DeliveryMetrics {
    let mut grouped: BTreeMap<Channel, Vec<&DeliveryAttempt>> = BTreeMap::new();
    for a in attempts {
        grouped.entry(a.channel).or_default().push(a);
    }

    DeliveryMetrics {
        overall: DeliveryCounts::from_attempts(attempts),
        by_channel: grouped
            .into_iter()
            .map(|(channel, rows)| (channel, DeliveryCounts::from_attempts(rows)))
            .collect(),
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FunnelMetrics {
    pub sent: u64,
    pub delivered: u64,
    pub opened: u64,
    pub clicked: u64,
}

pub fn funnel(attempts: &[DeliveryAttempt]) -> FunnelMetrics {
    attempts.iter().fold(FunnelMetrics::default(), |mut f, a| {
        f.sent += u64::from(is_sent(a));
        f.delivered += u64::from(is_delivered(a));
        f.opened += u64::from(is_opened(a));
        f.clicked += u64::from(is_clicked(a));
        f
    })
}

/// Engagement score (0–100) for the attempts of one notification.
///
/// `0.6 × open rate + 0.4 × click-to-open rate`, scaled to 100. The click
/// component is 0 when nothing was opened. `None` when nothing was delivered.
pub fn engagement_score<'a>(attempts: impl IntoIterator<Item = &'a DeliveryAttempt>) -> Option<f64> {
    let f = attempts.into_iter().fold(FunnelMetrics::default(), |mut f, a| {
        f.delivered += u64::from(is_delivered(a));
        f.opened += u64::from(is_opened(a));
        f.clicked += u64::from(is_clicked(a));
        f
    });
    if f.delivered == 0 {
        return None;
    }
    Some(score(&f))
}

fn score(f: &FunnelMetrics) -> f64 {
    let open_component = rate(f.opened, f.delivered);
    let click_component = if f.opened == 0 {
        0.0
    } else {
        rate(f.clicked, f.opened)
    };
    (100.0 * (OPEN_WEIGHT * open_component + CLICK_WEIGHT * click_component)).clamp(0.0, 100.0)
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EngagementMetrics {
    pub delivered: u64,
    pub unique_opens: u64,
    pub unique_clicks: u64,
    pub total_opens: u64,
    pub total_clicks: u64,
    pub open_rate: f64,
    pub click_through_rate: f64,
    pub click_to_open_rate: f64,
    pub avg_time_to_open_secs: f64,
    pub avg_time_to_click_secs: f64,
    /// Mean score over notifications with at least one delivered attempt.
    pub average_engagement_score: f64,
    pub scored_notifications: u64,
}

pub fn engagement_metrics(attempts: &[DeliveryAttempt]) -> EngagementMetrics {
    let f = funnel(attempts);
    let mut m = EngagementMetrics {
        delivered: f.delivered,
        unique_opens: f.opened,
        unique_clicks: f.clicked,
        open_rate: rate(f.opened, f.delivered),
        click_through_rate: rate(f.clicked, f.delivered),
        click_to_open_rate: rate(f.clicked, f.opened),
        ..Default::default()
    };

    let mut to_open = Vec::new();
    let mut to_click = Vec::new();
    for a in attempts.iter().filter(|a| is_delivered(a)) {
        m.total_opens += a.open_count.max(0) as u64;
        m.total_clicks += a.click_count.max(0) as u64;
        let Some(base) = a.delivered_at.or(a.sent_at) else {
            continue;
        };
        if let Some(opened) = a.opened_at {
            to_open.push((opened - base).num_seconds().max(0));
        }
        if let Some(clicked) = a.clicked_at {
            to_click.push((clicked - base).num_seconds().max(0));
        }
    }
    m.avg_time_to_open_secs = mean(&to_open);
    m.avg_time_to_click_secs = mean(&to_click);

    let mut by_notification: BTreeMap<Uuid, Vec<&DeliveryAttempt>> = BTreeMap::new();
    for a in attempts {
        by_notification.entry(a.notification_id).or_default().push(a);
    }
    let scores: Vec<f64> = by_notification
        .into_values()
        .filter_map(engagement_score)
        .collect();
    m.scored_notifications = scores.len() as u64;
    m.average_engagement_score = if scores.is_empty() {
        0.0
    } else {
        scores.iter().sum::<f64>() / scores.len() as f64
    };

    m
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProviderPerformance {
    pub provider: String,
    pub channel: Channel,
    pub attempts: u64,
    pub sent: u64,
    pub accepted: u64,
    pub delivered: u64,
    pub failed: u64,
    /// Share of sent attempts the provider accepted.
    pub success_rate: f64,
    pub avg_delivery_ms: f64,
    pub p95_delivery_ms: f64,
    pub total_retries: u64,
}

pub fn provider_performance(attempts: &[DeliveryAttempt]) -> Vec<ProviderPerformance> {
    let mut grouped: BTreeMap<(String, Channel), Vec<&DeliveryAttempt>> = BTreeMap::new();
    for a in attempts {
        grouped
            .entry((a.provider.clone(), a.channel))
            .or_default()
            .push(a);
    }

    grouped
        .into_iter()
        .map(|((provider, channel), rows)| {
            let sent = rows.iter().filter(|a| is_sent(a)).count() as u64;
            let accepted = rows.iter().filter(|a| a.status.reached_sent()).count() as u64;
            let latencies: Vec<i64> = rows.iter().filter_map(|a| a.delivery_latency_ms).collect();
            ProviderPerformance {
                provider,
                channel,
                attempts: rows.len() as u64,
                sent,
                accepted,
                delivered: rows.iter().filter(|a| is_delivered(a)).count() as u64,
                failed: rows.iter().filter(|a| a.is_terminal()).count() as u64,
                success_rate: rate(accepted, sent),
                avg_delivery_ms: mean(&latencies),
                p95_delivery_ms: percentile(&latencies, 95.0),
                total_retries: rows.iter().map(|a| a.retry_count.max(0) as u64).sum(),
            }
        })
        .collect()
}

/// Timeline bucket width.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeBucket {
    Hour,
    #[default]
    Day,
    Week,
}

impl TimeBucket {
    fn width(self) -> Duration {
        match self {
            TimeBucket::Hour => Duration::hours(1),
            TimeBucket::Day => Duration::days(1),
            TimeBucket::Week => Duration::weeks(1),
        }
    }

    /// Start of the bucket containing `at`. Weeks start on Monday.
    pub fn truncate(self, at: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            TimeBucket::Hour => at.duration_trunc(Duration::hours(1)).unwrap_or(at),
            TimeBucket::Day => at.duration_trunc(Duration::days(1)).unwrap_or(at),
            TimeBucket::Week => {
                let day = at.duration_trunc(Duration::days(1)).unwrap_or(at);
                day - Duration::days(i64::from(day.weekday().num_days_from_monday()))
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TimelinePoint {
    pub bucket_start: DateTime<Utc>,
    pub sent: u64,
    pub delivered: u64,
    pub opened: u64,
    pub clicked: u64,
    pub failed: u64,
    pub delivery_rate: f64,
    pub open_rate: f64,
}

/// Bucketed counts covering `range`, with empty buckets included.
pub fn timeline(
    attempts: &[DeliveryAttempt],
    range: TimeRange,
    bucket: TimeBucket,
) -> Result<Vec<TimelinePoint>, AppError> {
    let first = bucket.truncate(range.start);
    let span = (range.end - first).num_seconds() / bucket.width().num_seconds().max(1);
    if span > MAX_TIMELINE_POINTS {
        return Err(AppError::Validation(format!(
            "time range produces more than {MAX_TIMELINE_POINTS} buckets; use a wider bucket"
        )));
    }

    let mut buckets: BTreeMap<DateTime<Utc>, Vec<&DeliveryAttempt>> = BTreeMap::new();
    let mut cursor = first;
    while cursor < range.end {
        buckets.insert(cursor, Vec::new());
        cursor += bucket.width();
    }
    for a in attempts.iter().filter(|a| range.contains(a.created_at)) {
        buckets
            .entry(bucket.truncate(a.created_at))
            .or_default()
            .push(a);
    }

    Ok(buckets
        .into_iter()
        .map(|(bucket_start, rows)| {
            let f = rows.iter().fold(FunnelMetrics::default(), |mut f, a| {
                f.sent += u64::from(is_sent(a));
                f.delivered += u64::from(is_delivered(a));
                f.opened += u64::from(is_opened(a));
                f.clicked += u64::from(is_clicked(a));
                f
            });
            TimelinePoint {
                bucket_start,
                sent: f.sent,
                delivered: f.delivered,
                opened: f.opened,
                clicked: f.clicked,
                failed: rows.iter().filter(|a| a.is_terminal()).count() as u64,
                delivery_rate: rate(f.delivered, f.sent),
                open_rate: rate(f.opened, f.delivered),
            }
        })
        .collect())
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ChannelEngagement {
    pub sent: u64,
    pub delivered: u64,
    pub opened: u64,
    pub clicked: u64,
    pub engagement_score: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UserSummary {
    pub user_id: Uuid,
    pub total_notifications: u64,
    pub unread_notifications: u64,
    pub per_channel: BTreeMap<Channel, ChannelEngagement>,
    /// Unique opens over delivered attempts, across channels.
    pub overall_engagement_rate: f64,
    /// Channel with the highest engagement score among channels with deliveries.
    pub preferred_channel: Option<Channel>,
}

pub fn user_summary(
    user_id: Uuid,
    total_notifications: u64,
    unread_notifications: u64,
    attempts: &[DeliveryAttempt],
) -> UserSummary {
    let mut per_channel: BTreeMap<Channel, ChannelEngagement> = BTreeMap::new();
    for channel in Channel::ALL {
        let rows: Vec<DeliveryAttempt> = attempts
            .iter()
            .filter(|a| a.channel == channel)
            .cloned()
            .collect();
        if rows.is_empty() {
            continue;
        }
        let f = funnel(&rows);
        per_channel.insert(
            channel,
            ChannelEngagement {
                sent: f.sent,
                delivered: f.delivered,
                opened: f.opened,
                clicked: f.clicked,
                engagement_score: if f.delivered == 0 { 0.0 } else { score(&f) },
            },
        );
    }

    let mut preferred: Option<(Channel, f64)> = None;
    for (channel, stats) in &per_channel {
        if stats.delivered == 0 {
            continue;
        }
        if preferred.is_none_or(|(_, best)| stats.engagement_score > best) {
            preferred = Some((*channel, stats.engagement_score));
        }
    }

    let overall = funnel(attempts);
    UserSummary {
        user_id,
        total_notifications,
        unread_notifications,
        per_channel,
        overall_engagement_rate: rate(overall.opened, overall.delivered),
        preferred_channel: preferred.map(|(channel, _)| channel),
    }
}

/// Loads rows for a tenant and window and runs the aggregations.
pub struct AnalyticsService {
    notifications: Arc<dyn NotificationStore>,
    attempts: Arc<dyn AttemptStore>,
}

impl AnalyticsService {
    pub fn new(notifications: Arc<dyn NotificationStore>, attempts: Arc<dyn AttemptStore>) -> Self {
        Self {
            notifications,
            attempts,
        }
    }

    async fn load(&self, query: &AnalyticsQuery) -> Result<Vec<DeliveryAttempt>, AppError> {
        let rows = self
            .attempts
            .attempts_in_range(query.tenant_id, query.range, query.scope)
            .await?;
        tracing::debug!(
            tenant_id = %query.tenant_id,
            rows = rows.len(),
            scope = ?query.scope,
            "Loaded attempts for analytics"
        );
        Ok(rows)
    }

    pub async fn delivery(&self, query: &AnalyticsQuery) -> Result<DeliveryMetrics, AppError> {
        Ok(delivery_metrics(&self.load(query).await?))
    }

    pub async fn engagement(&self, query: &AnalyticsQuery) -> Result<EngagementMetrics, AppError> {
        Ok(engagement_metrics(&self.load(query).await?))
    }

    pub async fn funnel(&self, query: &AnalyticsQuery) -> Result<FunnelMetrics, AppError> {
        Ok(funnel(&self.load(query).await?))
    }

    pub async fn providers(
        &self,
        query: &AnalyticsQuery,
    ) -> Result<Vec<ProviderPerformance>, AppError> {
        Ok(provider_performance(&self.load(query).await?))
    }

    pub async fn timeline(
        &self,
        query: &AnalyticsQuery,
        bucket: TimeBucket,
    ) -> Result<Vec<TimelinePoint>, AppError> {
        timeline(&self.load(query).await?, query.range, bucket)
    }

    pub async fn user(&self, query: &AnalyticsQuery, user_id: Uuid) -> Result<UserSummary, AppError> {
        let records = self
            .notifications
            .notifications_in_range(query.tenant_id, query.range, query.scope)
            .await?;
        let (total, unread) = records
            .iter()
            .filter(|r| r.user_id == Some(user_id))
            .fold((0u64, 0u64), |(total, unread), r| {
                (total + 1, unread + u64::from(!r.is_read))
            });

        let attempts: Vec<DeliveryAttempt> = self
            .load(query)
            .await?
            .into_iter()
            .filter(|a| a.user_id == Some(user_id))
            .collect();

        Ok(user_summary(user_id, total, unread, &attempts))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use beacon_common::lifecycle::NewAttempt;
    use chrono::TimeZone;

    fn base_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 4, 10, 15, 0).unwrap()
    }

    fn attempt(notification_id: Uuid, channel: Channel, status: DeliveryStatus) -> DeliveryAttempt {
        let now = base_time();
        let mut a = DeliveryAttempt::pending(
            NewAttempt {
                notification_id,
                tenant_id: Uuid::nil(),
                user_id: None,
                channel,
                provider: "resend".to_string(),
                recipient: "a@example.com".to_string(),
                max_retries: 3,
            },
            now,
        );
        if status == DeliveryStatus::Pending {
            return a;
        }
        if status.is_failure() {
            a.mark_failed(status, "X", "x", now).unwrap();
            return a;
        }
        a.mark_sent("m".into(), serde_json::json!({}), now + Duration::milliseconds(100))
            .unwrap();
        if status != DeliveryStatus::Sent {
            a.apply_engagement(status, now + Duration::seconds(5), None)
                .unwrap();
        }
        a
    }

    #[test]
    fn test_delivery_rates_scenario() {
        let n = Uuid::new_v4();
        let mut rows: Vec<DeliveryAttempt> = (0..95)
            .map(|_| attempt(n, Channel::Email, DeliveryStatus::Delivered))
            .collect();
        rows.extend((0..5).map(|_| attempt(n, Channel::Email, DeliveryStatus::Failed)));

        let m = delivery_metrics(&rows);
        assert_eq!(m.overall.sent, 100);
        assert_eq!(m.overall.delivered, 95);
        assert_eq!(m.overall.failed, 5);
        assert!((m.overall.delivery_rate - 0.95).abs() < 1e-9);
        assert!((m.overall.failure_rate - 0.05).abs() < 1e-9);
        assert_eq!(m.by_channel[&Channel::Email], m.overall);
    }

    #[test]
    fn test_empty_input_has_zero_rates() {
        let m = delivery_metrics(&[]);
        assert_eq!(m.overall.delivery_rate, 0.0);
        assert_eq!(m.overall.p95_send_latency_ms, 0.0);
        let e = engagement_metrics(&[]);
        assert_eq!(e.open_rate, 0.0);
        assert_eq!(e.click_to_open_rate, 0.0);
        assert!(!e.average_engagement_score.is_nan());
    }

    #[test]
    fn test_funnel_is_monotonic() {
        let n = Uuid::new_v4();
        let rows = vec![
            attempt(n, Channel::Email, DeliveryStatus::Sent),
            attempt(n, Channel::Email, DeliveryStatus::Delivered),
            attempt(n, Channel::Push, DeliveryStatus::Opened),
            attempt(n, Channel::Push, DeliveryStatus::Clicked),
            attempt(n, Channel::Sms, DeliveryStatus::Bounced),
            attempt(n, Channel::Sms, DeliveryStatus::Pending),
        ];
        let f = funnel(&rows);
        assert_eq!(
            f,
            FunnelMetrics {
                sent: 5,
                delivered: 3,
                opened: 2,
                clicked: 1
            }
        );
    }

    #[test]
    fn test_engagement_score_without_opens() {
        let n = Uuid::new_v4();
        let rows = [
            attempt(n, Channel::Email, DeliveryStatus::Delivered),
            attempt(n, Channel::Push, DeliveryStatus::Delivered),
        ];
        assert_eq!(engagement_score(&rows), Some(0.0));
        assert_eq!(
            engagement_score(&[attempt(n, Channel::Sms, DeliveryStatus::Failed)]),
            None
        );
    }

    #[test]
    fn test_engagement_score_weights() {
        let n = Uuid::new_v4();
        let rows = [
            attempt(n, Channel::Email, DeliveryStatus::Clicked),
            attempt(n, Channel::Push, DeliveryStatus::Delivered),
        ];
        // open rate 0.5, click-to-open 1.0 → 100 × (0.3 + 0.4)
        let s = engagement_score(&rows).unwrap();
        assert!((s - 70.0).abs() < 1e-9);
    }

    #[test]
    fn test_percentile_nearest_rank() {
        let values: Vec<i64> = (1..=100).collect();
        assert_eq!(percentile(&values, 95.0), 95.0);
        assert_eq!(percentile(&[42], 95.0), 42.0);
    }

    #[test]
    fn test_provider_performance_groups_by_provider_and_channel() {
        let n = Uuid::new_v4();
        let mut retried = attempt(n, Channel::Email, DeliveryStatus::Pending);
        retried.record_retry("TRANSIENT_PROVIDER_ERROR", "503", base_time()).unwrap();
        retried.record_retry("TRANSIENT_PROVIDER_ERROR", "503", base_time()).unwrap();
        retried
            .mark_sent("m2".into(), serde_json::json!({}), base_time())
            .unwrap();
        let rows = vec![
            retried,
            attempt(n, Channel::Email, DeliveryStatus::Failed),
            attempt(n, Channel::Push, DeliveryStatus::Delivered),
        ];
        let perf = provider_performance(&rows);
        assert_eq!(perf.len(), 2);
        let email = perf.iter().find(|p| p.channel == Channel::Email).unwrap();
        assert_eq!(email.total_retries, 2);
        assert_eq!(email.sent, 2);
        assert!((email.success_rate - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_timeline_fills_empty_buckets() {
        let n = Uuid::new_v4();
        let start = base_time().duration_trunc(Duration::days(1)).unwrap();
        let range = TimeRange::new(start, start + Duration::hours(3)).unwrap();
        let rows = vec![attempt(n, Channel::Email, DeliveryStatus::Delivered)];
        let points = timeline(&rows, range, TimeBucket::Hour).unwrap();
        assert_eq!(points.len(), 3);
        assert!(points.iter().all(|p| p.sent == 0));

        let range = TimeRange::new(start, start + Duration::days(1)).unwrap();
        let points = timeline(&rows, range, TimeBucket::Hour).unwrap();
        assert_eq!(points.len(), 24);
        assert_eq!(points[10].delivered, 1);
        assert_eq!(points[10].delivery_rate, 1.0);
    }

    #[test]
    fn test_week_bucket_starts_monday() {
        // 2026-03-04 is a Wednesday
        let monday = TimeBucket::Week.truncate(base_time());
        assert_eq!(monday, Utc.with_ymd_and_hms(2026, 3, 2, 0, 0, 0).unwrap());
    }

    #[test]
    fn test_user_summary_prefers_most_engaged_channel() {
        let n = Uuid::new_v4();
        let rows = vec![
            attempt(n, Channel::Email, DeliveryStatus::Delivered),
            attempt(n, Channel::Push, DeliveryStatus::Opened),
            attempt(n, Channel::Sms, DeliveryStatus::Failed),
        ];
        let summary = user_summary(Uuid::new_v4(), 1, 1, &rows);
        assert_eq!(summary.preferred_channel, Some(Channel::Push));
        assert!((summary.overall_engagement_rate - 0.5).abs() < 1e-9);
        assert_eq!(summary.per_channel[&Channel::Sms].engagement_score, 0.0);

        let nothing = user_summary(Uuid::new_v4(), 0, 0, &[]);
        assert_eq!(nothing.preferred_channel, None);
        assert_eq!(nothing.overall_engagement_rate, 0.0);
    }
}
