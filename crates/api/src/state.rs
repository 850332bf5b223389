//! Shared application state for the Axum API server.

use std::sync::Arc;

use beacon_common::clock::Clock;
use beacon_common::config::AppConfig;
use beacon_common::types::Channel;
use beacon_engine::analytics::AnalyticsService;
use beacon_engine::notifications::NotificationService;
use beacon_engine::store::{AttemptStore, NotificationStore};
use beacon_notifier::breaker::CircuitBreaker;
use beacon_notifier::correlator::CallbackCorrelator;
use beacon_notifier::directory::RecipientDirectory;
use beacon_notifier::dispatcher::{DispatchSettings, Dispatcher};
use beacon_notifier::pipeline::NotificationPipeline;
use beacon_notifier::provider::{InAppProvider, ProviderRegistry};
use beacon_notifier::providers::{HttpGatewayProvider, ResendProvider};

/// Application state shared across all route handlers via Axum `State`.
#[derive(Clone)]
pub struct AppState {
    pub notifications: Arc<NotificationService>,
    pub pipeline: Arc<NotificationPipeline>,
    pub correlator: Arc<CallbackCorrelator>,
    pub analytics: Arc<AnalyticsService>,
}

/// Storage and delivery collaborators the state is assembled from.
pub struct Components {
    pub notifications: Arc<dyn NotificationStore>,
    pub attempts: Arc<dyn AttemptStore>,
    pub providers: ProviderRegistry,
    pub breaker: Arc<dyn CircuitBreaker>,
    pub directory: Arc<dyn RecipientDirectory>,
    pub clock: Arc<dyn Clock>,
    pub dispatch: DispatchSettings,
}

impl AppState {
    pub fn new(c: Components) -> Self {
        let notifications = Arc::new(NotificationService::new(
            c.notifications.clone(),
            c.attempts.clone(),
            c.clock.clone(),
        ));
        let dispatcher = Dispatcher::new(
            c.attempts.clone(),
            c.providers,
            c.breaker,
            c.directory,
            c.clock.clone(),
            c.dispatch,
        );

        Self {
            pipeline: Arc::new(NotificationPipeline::new(notifications.clone(), dispatcher)),
            correlator: Arc::new(CallbackCorrelator::new(c.attempts.clone(), c.clock)),
            analytics: Arc::new(AnalyticsService::new(c.notifications, c.attempts)),
            notifications,
        }
    }
}

/// Providers for every channel. Missing credentials surface per send as
/// configuration failures rather than at startup.
pub fn providers_from_config(config: &AppConfig) -> anyhow::Result<ProviderRegistry> {
    let mut email = ResendProvider::new(config.resend_api_key.clone(), config.email_from.clone())?;
    if let Some(url) = &config.resend_api_url {
        email = email.with_api_url(url.clone());
    }

    Ok(ProviderRegistry::new()
        .register(Arc::new(InAppProvider))
        .register(Arc::new(email))
        .register(Arc::new(HttpGatewayProvider::new(
            "sms_gateway",
            Channel::Sms,
            config.sms_provider_url.clone(),
            config.sms_provider_token.clone(),
        )?))
        .register(Arc::new(HttpGatewayProvider::new(
            "push_gateway",
            Channel::Push,
            config.push_provider_url.clone(),
            config.push_provider_token.clone(),
        )?)))
}
