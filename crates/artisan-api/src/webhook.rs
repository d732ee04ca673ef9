use async_trait::async_trait;
use serde::Serialize;
use tracing::debug;

use artisan_messaging::RecipientNotifier;
use artisan_types::models::{ConversationId, IdentityId, Message, MessageId};

/// Payload POSTed for every delivered message.
#[derive(Debug, Serialize)]
pub struct WebhookPayload {
    pub recipient_id: IdentityId,
    pub conversation_id: ConversationId,
    pub message_id: MessageId,
    pub sender_id: IdentityId,
    pub preview: String,
}

impl WebhookPayload {
    pub fn new(recipient: IdentityId, message: &Message) -> Self {
        Self {
            recipient_id: recipient,
            conversation_id: message.conversation_id,
            message_id: message.id,
            sender_id: message.sender_id,
            preview: message.preview(),
        }
    }
}

/// Hands recipient notifications to an external service (email, push) over
/// HTTP.
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl RecipientNotifier for WebhookNotifier {
    async fn notify(
        &self,
        recipient: IdentityId,
        message: &Message,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let resp = self
            .client
            .post(&self.url)
            .json(&WebhookPayload::new(recipient, message))
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(format!("webhook returned {}", resp.status()).into());
        }
        debug!("Notified {} about message {}", recipient, message.id);
        Ok(())
    }
}
