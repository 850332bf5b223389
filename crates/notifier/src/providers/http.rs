//! Generic JSON-over-HTTP gateway used for SMS and push.

use async_trait::async_trait;

use beacon_common::types::Channel;

use super::{build_client, classify_status, classify_transport_error, message_id_from};
use crate::provider::{DeliveryProvider, OutboundMessage, SendOutcome};

/// POSTs `{to, title, body, action_url, priority, reference}` to a gateway
/// URL with an optional bearer token.
pub struct HttpGatewayProvider {
    name: String,
    channel: Channel,
    client: reqwest::Client,
    url: Option<String>,
    token: Option<String>,
}

impl HttpGatewayProvider {
    pub fn new(
        name: impl Into<String>,
        channel: Channel,
        url: Option<String>,
        token: Option<String>,
    ) -> Result<Self, reqwest::Error> {
        Ok(Self {
            name: name.into(),
            channel,
            client: build_client()?,
            url: url.filter(|u| !u.is_empty()),
            token: token.filter(|t| !t.is_empty()),
        })
    }
}

#[async_trait]
impl DeliveryProvider for HttpGatewayProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn channel(&self) -> Channel {
        self.channel
    }

    async fn send(&self, message: &OutboundMessage) -> SendOutcome {
        let Some(url) = &self.url else {
            return SendOutcome::misconfigured(format!("no gateway URL for {}", self.name));
        };

        let payload = serde_json::json!({
            "to": message.recipient,
            "title": message.title,
            "body": message.message,
            "action_url": message.action_url,
            "priority": message.priority,
            "reference": message.attempt_id,
        });

        let mut request = self.client.post(url).json(&payload);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => return classify_transport_error(&e),
        };

        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        if !status.is_success() {
            return classify_status(status, &text);
        }

        let body: serde_json::Value = serde_json::from_str(&text).unwrap_or_default();
        SendOutcome::Success {
            message_id: message_id_from(&body).unwrap_or_else(|| message.attempt_id.to_string()),
            response: body,
            confirmed: false,
        }
    }
}
