//! Channel fan-out for one notification.
//!
//! For every requested channel the dispatcher resolves recipient endpoints,
//! records one pending attempt per endpoint and runs all of them
//! concurrently. Each attempt goes through the circuit breaker for its
//! (provider, channel) pair and retries transient failures in place with
//! backoff. The caller gets a per-channel summary once every attempt has
//! settled or the deadline has passed, whichever comes first.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{FuturesUnordered, StreamExt};
use serde::Serialize;
use uuid::Uuid;

use beacon_common::clock::Clock;
use beacon_common::config::AppConfig;
use beacon_common::error::{AppError, DeliveryError};
use beacon_common::lifecycle::{NewAttempt, TransitionError};
use beacon_common::types::{
    Channel, DeliveryAttempt, DeliveryStatus, NotificationRecord, RecipientEndpoint,
};
use beacon_engine::store::{AttemptStore, update_attempt};

use crate::breaker::{Admission, BreakerKey, CircuitBreaker};
use crate::directory::RecipientDirectory;
use crate::provider::{DeliveryProvider, OutboundMessage, ProviderRegistry, SendOutcome};
use crate::retry::{Backoff, RetryPolicy};

/// Error code for channels with no usable endpoint.
pub const NO_RECIPIENT: &str = "NO_RECIPIENT";

/// Provider name recorded when no provider is registered for a channel.
pub const UNCONFIGURED_PROVIDER: &str = "unconfigured";

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DispatchSettings {
    pub retry: RetryPolicy,
    /// How long `dispatch` waits before expiring attempts still pending.
    pub deadline: Duration,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            deadline: Duration::from_secs(120),
        }
    }
}

impl DispatchSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            retry: RetryPolicy::from_config(config),
            deadline: Duration::from_secs(config.dispatch_deadline_secs),
        }
    }
}

/// Initial (non-callback) outcome of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelOutcome {
    Sent,
    Failed,
    CircuitOpen,
}

#[derive(Debug, Clone, Serialize)]
pub struct DispatchSummary {
    pub notification_id: Uuid,
    /// `sent` if any endpoint of the channel was sent, else `circuit_open`
    /// if any was refused by the breaker, else `failed`.
    pub channels: BTreeMap<Channel, ChannelOutcome>,
    pub attempt_ids: Vec<Uuid>,
    pub timed_out: bool,
}

struct Target {
    user_id: Option<Uuid>,
    address: String,
    endpoint: Option<RecipientEndpoint>,
}

struct Job {
    attempt_id: Uuid,
    provider: Arc<dyn DeliveryProvider>,
    endpoint: Option<RecipientEndpoint>,
    message: OutboundMessage,
}

#[derive(Clone)]
pub struct Dispatcher {
    attempts: Arc<dyn AttemptStore>,
    providers: Arc<ProviderRegistry>,
    breaker: Arc<dyn CircuitBreaker>,
    directory: Arc<dyn RecipientDirectory>,
    clock: Arc<dyn Clock>,
    settings: DispatchSettings,
}

impl Dispatcher {
    pub fn new(
        attempts: Arc<dyn AttemptStore>,
        providers: ProviderRegistry,
        breaker: Arc<dyn CircuitBreaker>,
        directory: Arc<dyn RecipientDirectory>,
        clock: Arc<dyn Clock>,
        settings: DispatchSettings,
    ) -> Self {
        Self {
            attempts,
            providers: Arc::new(providers),
            breaker,
            directory,
            clock,
            settings,
        }
    }

    /// Fan `record` out to its channels and wait for the initial outcomes.
    ///
    /// Only storage failures while recording the attempts are returned as
    /// errors; delivery problems end up on the attempt rows.
    pub async fn dispatch(&self, record: &NotificationRecord) -> Result<DispatchSummary, AppError> {
        let now = self.clock.now();
        let mut rows = Vec::new();
        let mut jobs = Vec::new();
        let mut outcomes: BTreeMap<Channel, Vec<ChannelOutcome>> = BTreeMap::new();

        for &channel in record.channels.iter() {
            let provider = self.providers.get(channel);
            let provider_name = provider
                .as_ref()
                .map(|p| p.name().to_string())
                .unwrap_or_else(|| UNCONFIGURED_PROVIDER.to_string());
            let new_attempt = |target: &Target| NewAttempt {
                notification_id: record.id,
                tenant_id: record.tenant_id,
                user_id: target.user_id,
                channel,
                provider: provider_name.clone(),
                recipient: target.address.clone(),
                max_retries: self.settings.retry.max_retries(),
            };

            let targets = match self.targets(record, channel).await {
                Ok(targets) if !targets.is_empty() => targets,
                lookup => {
                    let detail = match lookup {
                        Err(e) => format!("recipient lookup failed: {e}"),
                        Ok(_) => format!("no active {channel} endpoint"),
                    };
                    let target = Target {
                        user_id: record.user_id,
                        address: String::new(),
                        endpoint: None,
                    };
                    let mut attempt = DeliveryAttempt::pending(new_attempt(&target), now);
                    attempt.mark_failed(DeliveryStatus::Failed, NO_RECIPIENT, &detail, now)?;
                    tracing::warn!(notification_id = %record.id, %channel, %detail, "No recipient for channel");
                    outcomes.entry(channel).or_default().push(ChannelOutcome::Failed);
                    rows.push(attempt);
                    continue;
                }
            };

            for target in targets {
                let mut attempt = DeliveryAttempt::pending(new_attempt(&target), now);
                match &provider {
                    Some(provider) => jobs.push(Job {
                        attempt_id: attempt.id,
                        provider: provider.clone(),
                        endpoint: target.endpoint,
                        message: OutboundMessage {
                            attempt_id: attempt.id,
                            notification_id: record.id,
                            channel,
                            recipient: target.address,
                            title: record.title.clone(),
                            message: record.message.clone(),
                            action_label: record.action_label.clone(),
                            action_url: record.action_url.clone(),
                            priority: record.priority,
                        },
                    }),
                    None => {
                        let err = DeliveryError::Configuration(format!(
                            "no provider registered for {channel}"
                        ));
                        attempt.mark_failed(DeliveryStatus::Failed, err.code(), &err.to_string(), now)?;
                        tracing::error!(notification_id = %record.id, %channel, "No provider registered for channel");
                        outcomes.entry(channel).or_default().push(ChannelOutcome::Failed);
                    }
                }
                rows.push(attempt);
            }
        }

        self.attempts.insert_attempts(&rows).await?;
        let attempt_ids: Vec<Uuid> = rows.iter().map(|a| a.id).collect();

        tracing::info!(
            notification_id = %record.id,
            attempts = rows.len(),
            dispatched = jobs.len(),
            "Dispatching notification"
        );

        let started: Vec<(Channel, Uuid)> = jobs
            .iter()
            .map(|job| (job.message.channel, job.attempt_id))
            .collect();
        let mut running: FuturesUnordered<_> = jobs
            .into_iter()
            .map(|job| {
                let channel = job.message.channel;
                let attempt_id = job.attempt_id;
                let handle = tokio::spawn(self.clone().deliver(job));
                async move { (channel, attempt_id, handle.await) }
            })
            .collect();

        let deadline = tokio::time::sleep(self.settings.deadline);
        tokio::pin!(deadline);
        let mut settled = HashSet::new();
        let mut timed_out = false;

        loop {
            tokio::select! {
                next = running.next() => {
                    let Some((channel, attempt_id, joined)) = next else {
                        break;
                    };
                    settled.insert(attempt_id);
                    let outcome = joined.unwrap_or_else(|e| {
                        tracing::error!(%attempt_id, error = %e, "Delivery task panicked");
                        ChannelOutcome::Failed
                    });
                    outcomes.entry(channel).or_default().push(outcome);
                }
                _ = &mut deadline => {
                    timed_out = true;
                    break;
                }
            }
        }
        // Dropping the handles detaches the tasks; in-flight retries run on.
        drop(running);

        if timed_out {
            for (channel, attempt_id) in started.into_iter().filter(|(_, id)| !settled.contains(id)) {
                let outcome = self.expire(attempt_id).await;
                outcomes.entry(channel).or_default().push(outcome);
            }
        }

        let channels = outcomes
            .into_iter()
            .map(|(channel, results)| (channel, summarize(&results)))
            .collect();

        Ok(DispatchSummary {
            notification_id: record.id,
            channels,
            attempt_ids,
            timed_out,
        })
    }

    async fn targets(&self, record: &NotificationRecord, channel: Channel) -> anyhow::Result<Vec<Target>> {
        if channel == Channel::InApp {
            let address = record
                .user_id
                .map(|u| u.to_string())
                .unwrap_or_else(|| "broadcast".to_string());
            return Ok(vec![Target {
                user_id: record.user_id,
                address,
                endpoint: None,
            }]);
        }

        let endpoints = self
            .directory
            .endpoints(record.tenant_id, record.user_id, channel)
            .await?;
        Ok(endpoints
            .into_iter()
            .map(|e| Target {
                user_id: Some(e.user_id),
                address: e.address.clone(),
                endpoint: Some(e),
            })
            .collect())
    }

    /// Run one attempt to its initial outcome.
    async fn deliver(self, job: Job) -> ChannelOutcome {
        let key = BreakerKey::new(job.provider.name(), job.message.channel);
        let attempt_id = job.attempt_id;

        loop {
            let admission = match self.breaker.allow_call(&key).await {
                Ok(admission) => admission,
                Err(e) => {
                    tracing::warn!(breaker = %key, error = %e, "Breaker state unavailable, allowing call");
                    Admission::Allowed
                }
            };
            if admission == Admission::Rejected {
                let err = DeliveryError::CircuitOpen(key.to_string());
                self.fail(attempt_id, &err).await;
                tracing::warn!(%attempt_id, breaker = %key, "Circuit open, provider not called");
                return ChannelOutcome::CircuitOpen;
            }

            match job.provider.send(&job.message).await {
                SendOutcome::Success {
                    message_id,
                    response,
                    confirmed,
                } => {
                    self.report(&key, admission, true).await;
                    let now = self.clock.now();
                    let result = update_attempt(self.attempts.as_ref(), attempt_id, |a| {
                        a.mark_sent(message_id.clone(), response.clone(), now)?;
                        if confirmed {
                            a.apply_engagement(DeliveryStatus::Delivered, now, None)?;
                        }
                        Ok::<_, TransitionError>(())
                    })
                    .await;

                    return match result {
                        Ok((attempt, ())) => {
                            tracing::info!(
                                %attempt_id,
                                channel = %attempt.channel,
                                provider = %attempt.provider,
                                retries = attempt.retry_count,
                                "Delivery attempt sent"
                            );
                            ChannelOutcome::Sent
                        }
                        Err(e) => {
                            tracing::warn!(%attempt_id, error = %e, "Provider accepted message but attempt was not updated");
                            ChannelOutcome::Failed
                        }
                    };
                }
                SendOutcome::Failure(err) if err.is_retryable() => {
                    self.report(&key, admission, false).await;
                    let now = self.clock.now();
                    let code = err.code();
                    let reason = err.to_string();
                    let policy = self.settings.retry;
                    let result = update_attempt(self.attempts.as_ref(), attempt_id, |a| {
                        let calls_made = u32::try_from(a.retry_count + 1).unwrap_or(u32::MAX);
                        match policy.next(calls_made) {
                            Backoff::RetryAfter(delay) if a.retries_remaining() => {
                                a.record_retry(code, &reason, now).map(|_| Some(delay))
                            }
                            _ => a
                                .mark_failed(DeliveryStatus::Failed, code, &reason, now)
                                .map(|_| None),
                        }
                    })
                    .await;

                    match result {
                        Ok((attempt, Some(delay))) => {
                            tracing::warn!(
                                %attempt_id,
                                retry = attempt.retry_count,
                                delay_ms = delay.as_millis() as u64,
                                error = %reason,
                                "Transient provider failure, retrying"
                            );
                            tokio::time::sleep(delay).await;
                            if !self.still_pending(attempt_id).await {
                                return ChannelOutcome::Failed;
                            }
                        }
                        Ok((attempt, None)) => {
                            tracing::error!(
                                %attempt_id,
                                retries = attempt.retry_count,
                                error = %reason,
                                "Delivery failed after all retries"
                            );
                            return ChannelOutcome::Failed;
                        }
                        Err(e) => {
                            tracing::warn!(%attempt_id, error = %e, "Could not record retry");
                            return ChannelOutcome::Failed;
                        }
                    }
                }
                SendOutcome::Failure(err @ DeliveryError::PermanentRecipient(_)) => {
                    // The provider answered, so it counts as healthy.
                    self.report(&key, admission, true).await;
                    self.fail(attempt_id, &err).await;
                    if let Some(endpoint) = &job.endpoint
                        && let Err(e) = self.directory.deactivate(endpoint, &err.to_string()).await
                    {
                        tracing::error!(endpoint_id = %endpoint.id, error = %e, "Endpoint deactivation failed");
                    }
                    return ChannelOutcome::Failed;
                }
                SendOutcome::Failure(err) => {
                    if matches!(err, DeliveryError::Validation(_)) {
                        self.report(&key, admission, true).await;
                    }
                    tracing::error!(%attempt_id, provider = %key.provider, error = %err, "Provider cannot deliver");
                    self.fail(attempt_id, &err).await;
                    return ChannelOutcome::Failed;
                }
            }
        }
    }

    async fn still_pending(&self, attempt_id: Uuid) -> bool {
        match self.attempts.get_attempt(attempt_id).await {
            Ok(Some(attempt)) => attempt.status == DeliveryStatus::Pending,
            Ok(None) => false,
            Err(e) => {
                tracing::warn!(%attempt_id, error = %e, "Could not re-read attempt before retry");
                false
            }
        }
    }

    /// Record a terminal failure. Returns whether the row changed.
    async fn fail(&self, attempt_id: Uuid, err: &DeliveryError) -> bool {
        let now = self.clock.now();
        let reason = err.to_string();
        let result = update_attempt(self.attempts.as_ref(), attempt_id, |a| {
            a.mark_failed(DeliveryStatus::Failed, err.code(), &reason, now)
        })
        .await;

        match result {
            Ok(_) => true,
            Err(e) => {
                tracing::warn!(%attempt_id, code = err.code(), error = %e, "Could not record failure");
                false
            }
        }
    }

    /// Fail an attempt still pending at the deadline.
    async fn expire(&self, attempt_id: Uuid) -> ChannelOutcome {
        let now = self.clock.now();
        let err = DeliveryError::Timeout(format!("{}s", self.settings.deadline.as_secs()));
        let reason = err.to_string();
        let result = update_attempt(self.attempts.as_ref(), attempt_id, |a| {
            if a.status == DeliveryStatus::Pending {
                a.mark_failed(DeliveryStatus::Failed, err.code(), &reason, now)
                    .map(|_| true)
            } else {
                Ok(false)
            }
        })
        .await;

        match result {
            Ok((attempt, expired)) => {
                if expired {
                    tracing::warn!(%attempt_id, "Delivery attempt expired at deadline");
                }
                outcome_of(&attempt)
            }
            Err(e) => {
                tracing::warn!(%attempt_id, error = %e, "Could not expire attempt");
                ChannelOutcome::Failed
            }
        }
    }

    async fn report(&self, key: &BreakerKey, admission: Admission, success: bool) {
        let result = if success {
            self.breaker.record_success(key, admission).await
        } else {
            self.breaker.record_failure(key, admission).await
        };
        if let Err(e) = result {
            tracing::warn!(breaker = %key, error = %e, "Could not update breaker state");
        }
    }
}

fn outcome_of(attempt: &DeliveryAttempt) -> ChannelOutcome {
    if attempt.status.reached_sent() {
        ChannelOutcome::Sent
    } else if attempt.error_code.as_deref() == Some(DeliveryError::CircuitOpen(String::new()).code()) {
        ChannelOutcome::CircuitOpen
    } else {
        ChannelOutcome::Failed
    }
}

fn summarize(results: &[ChannelOutcome]) -> ChannelOutcome {
    if results.contains(&ChannelOutcome::Sent) {
        ChannelOutcome::Sent
    } else if results.contains(&ChannelOutcome::CircuitOpen) {
        ChannelOutcome::CircuitOpen
    } else {
        ChannelOutcome::Failed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_summarize_prefers_sent_then_circuit_open() {
        use ChannelOutcome::*;
        assert_eq!(summarize(&[Failed, Sent, CircuitOpen]), Sent);
        assert_eq!(summarize(&[Failed, CircuitOpen]), CircuitOpen);
        assert_eq!(summarize(&[Failed]), Failed);
    }

    #[test]
    fn test_settings_from_config() {
        let config = AppConfig {
            dispatch_deadline_secs: 5,
            ..AppConfig::default()
        };
        let settings = DispatchSettings::from_config(&config);
        assert_eq!(settings.deadline, Duration::from_secs(5));
        assert_eq!(settings.retry.max_retries(), 3);
    }
}
