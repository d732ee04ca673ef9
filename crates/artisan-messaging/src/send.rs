//! Outgoing messages: validation, the write, and reconciling the optimistic
//! copy shown in the open conversation.

use std::sync::Arc;

use chrono::Utc;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use artisan_types::models::{ConversationId, IdentityId, Message, MessageId, MessageType, NewMessage};

use crate::context::MessagingContext;
use crate::error::{MessagingError, Result};
use crate::repository::ConversationRepository;
use crate::session::ConversationSession;

pub const MAX_CONTENT_CHARS: usize = 4000;

/// What the user composed.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageDraft {
    pub content: String,
    pub message_type: MessageType,
    pub file_url: Option<String>,
    pub file_name: Option<String>,
}

impl MessageDraft {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            message_type: MessageType::Text,
            file_url: None,
            file_name: None,
        }
    }

    pub fn image(url: impl Into<String>) -> Self {
        Self {
            content: String::new(),
            message_type: MessageType::Image,
            file_url: Some(url.into()),
            file_name: None,
        }
    }

    pub fn file(url: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            content: String::new(),
            message_type: MessageType::File,
            file_url: Some(url.into()),
            file_name: Some(name.into()),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.content.chars().count() > MAX_CONTENT_CHARS {
            return Err(MessagingError::InvalidMessage(format!(
                "messages are limited to {} characters",
                MAX_CONTENT_CHARS
            )));
        }
        match self.message_type {
            MessageType::Text if self.content.trim().is_empty() => Err(MessagingError::EmptyMessage),
            MessageType::Image | MessageType::File
                if self.file_url.as_deref().is_none_or(|url| url.trim().is_empty()) =>
            {
                Err(MessagingError::InvalidMessage(format!(
                    "{} messages need a file URL",
                    self.message_type.as_str()
                )))
            }
            _ => Ok(()),
        }
    }

    fn into_new_message(self, conversation_id: ConversationId, sender_id: IdentityId) -> NewMessage {
        NewMessage {
            conversation_id,
            sender_id,
            content: self.content,
            message_type: self.message_type,
            file_url: self.file_url,
            file_name: self.file_name,
        }
    }

    /// A fully formed message under a local id, shown until (or instead of)
    /// the server's row.
    fn local_message(&self, conversation_id: ConversationId, sender_id: IdentityId) -> Message {
        Message {
            id: MessageId::local(),
            conversation_id,
            sender_id,
            content: self.content.clone(),
            message_type: self.message_type,
            file_url: self.file_url.clone(),
            file_name: self.file_name.clone(),
            is_read: false,
            created_at: Utc::now(),
        }
    }
}

/// Outcome of a successful send.
#[derive(Debug, Clone, PartialEq)]
pub enum SendReceipt {
    /// Persisted by the gateway.
    Delivered(Message),
    /// Kept on this client only (local conversation).
    LocalOnly(Message),
}

impl SendReceipt {
    pub fn message(&self) -> &Message {
        match self {
            Self::Delivered(message) | Self::LocalOnly(message) => message,
        }
    }

    pub fn is_persisted(&self) -> bool {
        matches!(self, Self::Delivered(_))
    }
}

#[derive(Clone)]
pub struct MessageSender {
    ctx: Arc<MessagingContext>,
    repository: ConversationRepository,
}

impl MessageSender {
    pub fn new(ctx: Arc<MessagingContext>, repository: ConversationRepository) -> Self {
        Self { ctx, repository }
    }

    /// Validate and send `draft`. When `open` is the session for the same
    /// conversation, a pending copy appears in it right away and is
    /// reconciled with the gateway's answer. Failed writes are not retried.
    pub async fn send(
        &self,
        conversation_id: ConversationId,
        draft: MessageDraft,
        open: Option<&ConversationSession>,
    ) -> Result<SendReceipt> {
        draft.validate()?;
        if self.ctx.is_signed_out() {
            return Err(MessagingError::SignedOut);
        }

        let me = self.ctx.identity();
        let open = open.filter(|session| session.id() == conversation_id);
        let pending = draft.local_message(conversation_id, me);

        if self.ctx.is_local_conversation(conversation_id).await {
            if let Some(session) = open {
                session.append(pending.clone()).await;
            }
            self.ctx.echo_local(pending.clone()).await;
            debug!("Kept message {} in local conversation {}", pending.id, conversation_id);
            return Ok(SendReceipt::LocalOnly(pending));
        }

        self.ctx.ensure_participant(conversation_id).await?;
        if let Some(session) = open {
            session.append(pending.clone()).await;
        }

        match self
            .ctx
            .gateway()
            .insert_message(draft.into_new_message(conversation_id, me))
            .await
        {
            Ok(message) => {
                if let Some(session) = open {
                    session.confirm(pending.id, message.clone()).await;
                }
                info!("Message {} sent to {}", message.id, conversation_id);

                self.notify_recipient(&message).await;
                self.repository.load_conversations().await;
                Ok(SendReceipt::Delivered(message))
            }
            Err(e) => {
                error!("Sending to {} failed: {}", conversation_id, e);
                if let Some(session) = open {
                    session.fail(pending.id, e.to_string()).await;
                }
                Err(e.into())
            }
        }
    }

    /// Best-effort out-of-band delivery. Never affects the send result.
    async fn notify_recipient(&self, message: &Message) {
        let Some(notifier) = self.ctx.recipient_notifier() else {
            return;
        };
        let budget = self.ctx.config().side_effect_timeout;

        let outcome = timeout(budget, async {
            let recipient = self.recipient_of(message).await?;
            notifier.notify(recipient, message).await
        })
        .await;

        match outcome {
            Ok(Ok(())) => debug!("Recipient notified of {}", message.id),
            Ok(Err(e)) => warn!("Recipient notification for {} failed: {}", message.id, e),
            Err(_) => warn!("Recipient notification for {} timed out after {:?}", message.id, budget),
        }
    }

    async fn recipient_of(
        &self,
        message: &Message,
    ) -> std::result::Result<IdentityId, Box<dyn std::error::Error + Send + Sync>> {
        let me = self.ctx.identity();
        if let Some(conversation) = self.ctx.conversation(message.conversation_id).await {
            return Ok(conversation.other_participant.id);
        }
        let row = self
            .ctx
            .gateway()
            .get_conversation(message.conversation_id)
            .await?
            .ok_or("conversation not found")?;
        Ok(row.other_participant(me).ok_or("sender is not a participant")?)
    }
}
