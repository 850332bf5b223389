//! Delivery provider seam and the in-app provider.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use uuid::Uuid;

use beacon_common::error::DeliveryError;
use beacon_common::types::{Channel, Priority};

/// What a provider is asked to deliver for one attempt.
#[derive(Debug, Clone)]
pub struct OutboundMessage {
    pub attempt_id: Uuid,
    pub notification_id: Uuid,
    pub channel: Channel,
    pub recipient: String,
    pub title: String,
    pub message: String,
    pub action_label: Option<String>,
    pub action_url: Option<String>,
    pub priority: Priority,
}

/// Classified result of one provider call.
#[derive(Debug, Clone, PartialEq)]
pub enum SendOutcome {
    Success {
        message_id: String,
        response: serde_json::Value,
        /// The provider confirmed delivery synchronously (no callback follows).
        confirmed: bool,
    },
    Failure(DeliveryError),
}

impl SendOutcome {
    pub fn transient(reason: impl Into<String>) -> Self {
        SendOutcome::Failure(DeliveryError::TransientProvider(reason.into()))
    }

    pub fn permanent(reason: impl Into<String>) -> Self {
        SendOutcome::Failure(DeliveryError::PermanentRecipient(reason.into()))
    }

    pub fn misconfigured(reason: impl Into<String>) -> Self {
        SendOutcome::Failure(DeliveryError::Configuration(reason.into()))
    }

    /// The provider refused this particular request. The recipient may still be valid.
    pub fn rejected(reason: impl Into<String>) -> Self {
        SendOutcome::Failure(DeliveryError::Validation(reason.into()))
    }
}

#[async_trait]
pub trait DeliveryProvider: Send + Sync {
    /// Stable provider name, stored on attempts and used for callback lookup.
    fn name(&self) -> &str;

    fn channel(&self) -> Channel;

    /// Perform one call. Never retries internally.
    async fn send(&self, message: &OutboundMessage) -> SendOutcome;
}

/// One provider per channel.
#[derive(Default, Clone)]
pub struct ProviderRegistry {
    providers: HashMap<Channel, Arc<dyn DeliveryProvider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `provider` for its channel, replacing any previous one.
    pub fn register(mut self, provider: Arc<dyn DeliveryProvider>) -> Self {
        tracing::info!(
            provider = provider.name(),
            channel = %provider.channel(),
            "Registered delivery provider"
        );
        self.providers.insert(provider.channel(), provider);
        self
    }

    pub fn get(&self, channel: Channel) -> Option<Arc<dyn DeliveryProvider>> {
        self.providers.get(&channel).cloned()
    }
}

/// In-app delivery: the notification record is the message, so a send is
/// confirmed as soon as the attempt is recorded.
#[derive(Debug, Default, Clone, Copy)]
pub struct InAppProvider;

pub const IN_APP_PROVIDER: &str = "in_app";

#[async_trait]
impl DeliveryProvider for InAppProvider {
    fn name(&self) -> &str {
        IN_APP_PROVIDER
    }

    fn channel(&self) -> Channel {
        Channel::InApp
    }

    async fn send(&self, message: &OutboundMessage) -> SendOutcome {
        SendOutcome::Success {
            message_id: message.attempt_id.to_string(),
            response: serde_json::json!({ "stored": true }),
            confirmed: true,
        }
    }
}
