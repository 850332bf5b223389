//! Email delivery through the Resend HTTP API.

use async_trait::async_trait;

use beacon_common::types::Channel;

use super::{build_client, classify_status, classify_transport_error, message_id_from};
use crate::provider::{DeliveryProvider, OutboundMessage, SendOutcome};

const RESEND_API_URL: &str = "https://api.resend.com/emails";

pub struct ResendProvider {
    client: reqwest::Client,
    api_url: String,
    api_key: Option<String>,
    from: Option<String>,
}

impl ResendProvider {
    /// Missing credentials are reported per send as configuration failures.
    pub fn new(api_key: Option<String>, from: Option<String>) -> Result<Self, reqwest::Error> {
        Ok(Self {
            client: build_client()?,
            api_url: RESEND_API_URL.to_string(),
            api_key: api_key.filter(|k| !k.is_empty()),
            from: from.filter(|f| !f.is_empty()),
        })
    }

    pub fn with_api_url(mut self, url: impl Into<String>) -> Self {
        self.api_url = url.into();
        self
    }

    fn body(&self, from: &str, message: &OutboundMessage) -> serde_json::Value {
        let mut html = format!("<p>{}</p>", message.message);
        if let Some(url) = &message.action_url {
            let label = message.action_label.as_deref().unwrap_or("Open");
            html.push_str(&format!("<p><a href=\"{url}\">{label}</a></p>"));
        }
        serde_json::json!({
            "from": from,
            "to": [message.recipient],
            "subject": message.title,
            "html": html,
            "text": message.message,
            "headers": { "X-Entity-Ref-ID": message.attempt_id.to_string() },
        })
    }
}

#[async_trait]
impl DeliveryProvider for ResendProvider {
    fn name(&self) -> &str {
        "resend"
    }

    fn channel(&self) -> Channel {
        Channel::Email
    }

    async fn send(&self, message: &OutboundMessage) -> SendOutcome {
        let (Some(api_key), Some(from)) = (&self.api_key, &self.from) else {
            return SendOutcome::misconfigured("RESEND_API_KEY and EMAIL_FROM must be set");
        };

        let response = match self
            .client
            .post(&self.api_url)
            .bearer_auth(api_key)
            .json(&self.body(from, message))
            .send()
            .await
        {
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

#[cfg(test)]
mod tests {
    use super::*;
    use beacon_common::error::DeliveryError;
    use beacon_common::types::Priority;
    use uuid::Uuid;

    fn message() -> OutboundMessage {
        OutboundMessage {
            attempt_id: Uuid::new_v4(),
            notification_id: Uuid::new_v4(),
            channel: Channel::Email,
            recipient: "ops@example.com".into(),
            title: "Order ready".into(),
            message: "Order 42 is ready for pickup".into(),
            action_label: Some("View order".into()),
            action_url: Some("https://example.com/orders/42".into()),
            priority: Priority::Normal,
        }
    }

    #[tokio::test]
    async fn test_missing_credentials_is_configuration_failure() {
        let provider = ResendProvider::new(None, Some("noreply@example.com".into())).unwrap();
        assert!(matches!(
            provider.send(&message()).await,
            SendOutcome::Failure(DeliveryError::Configuration(_))
        ));
    }

    #[tokio::test]
    async fn test_unreachable_api_url_is_transient() {
        // Nothing listens on the discard port.
        let provider = ResendProvider::new(Some("key".into()), Some("noreply@example.com".into()))
            .unwrap()
            .with_api_url("http://127.0.0.1:9/emails");
        assert!(matches!(
            provider.send(&message()).await,
            SendOutcome::Failure(DeliveryError::TransientProvider(_))
        ));
    }

    #[test]
    fn test_body_includes_action_link() {
        let provider =
            ResendProvider::new(Some("key".into()), Some("noreply@example.com".into())).unwrap();
        let body = provider.body("noreply@example.com", &message());
        assert_eq!(body["to"][0], "ops@example.com");
        assert_eq!(body["subject"], "Order ready");
        assert!(body["html"].as_str().unwrap().contains("View order"));
    }
}
