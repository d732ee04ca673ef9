use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{RwLock, broadcast, watch};
use tracing::debug;

use artisan_types::gateway::Gateway;
use artisan_types::models::{Conversation, ConversationId, IdentityId, Message, Profile};

use crate::config::MessagingConfig;
use crate::error::{MessagingError, Result};
use crate::retry::with_network_retry;
use crate::subscriptions::SubscriptionManager;

/// Out-of-band delivery of a new message to its recipient (push, email,
/// webhook). Always best-effort.
#[async_trait]
pub trait RecipientNotifier: Send + Sync {
    async fn notify(
        &self,
        recipient: IdentityId,
        message: &Message,
    ) -> std::result::Result<(), Box<dyn std::error::Error + Send + Sync>>;
}

/// Aggregate unread count across all conversations, observable by the UI.
#[derive(Debug)]
pub struct UnreadCounter {
    tx: watch::Sender<u32>,
}

impl Default for UnreadCounter {
    fn default() -> Self {
        Self::new()
    }
}

impl UnreadCounter {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(0);
        Self { tx }
    }

    pub fn get(&self) -> u32 {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<u32> {
        self.tx.subscribe()
    }

    pub(crate) fn set(&self, total: u32) {
        self.tx.send_replace(total);
    }

    pub(crate) fn decrement(&self, by: u32) {
        self.tx.send_modify(|total| *total = total.saturating_sub(by));
    }
}

/// Per-identity messaging state: created on sign-in, dropped on sign-out.
pub struct MessagingContext {
    identity: IdentityId,
    gateway: Arc<dyn Gateway>,
    config: MessagingConfig,
    unread: UnreadCounter,
    /// Last loaded server conversation list, already ordered.
    conversations: RwLock<Vec<Conversation>>,
    /// Conversations that exist only on this client.
    local_conversations: RwLock<HashMap<ConversationId, Conversation>>,
    local_echo: broadcast::Sender<Message>,
    subscriptions: SubscriptionManager,
    recipient_notifier: Option<Arc<dyn RecipientNotifier>>,
    signed_out: AtomicBool,
}

impl MessagingContext {
    pub fn new(gateway: Arc<dyn Gateway>, identity: IdentityId, config: MessagingConfig) -> Self {
        let (local_echo, _) = broadcast::channel(256);
        let subscriptions = SubscriptionManager::new(gateway.clone(), identity, config.teardown_timeout);
        Self {
            identity,
            gateway,
            config,
            unread: UnreadCounter::new(),
            conversations: RwLock::new(Vec::new()),
            local_conversations: RwLock::new(HashMap::new()),
            local_echo,
            subscriptions,
            recipient_notifier: None,
            signed_out: AtomicBool::new(false),
        }
    }

    pub fn with_recipient_notifier(mut self, notifier: Arc<dyn RecipientNotifier>) -> Self {
        self.recipient_notifier = Some(notifier);
        self
    }

    pub fn identity(&self) -> IdentityId {
        self.identity
    }

    pub fn gateway(&self) -> &Arc<dyn Gateway> {
        &self.gateway
    }

    pub fn config(&self) -> &MessagingConfig {
        &self.config
    }

    pub fn unread(&self) -> &UnreadCounter {
        &self.unread
    }

    pub fn subscriptions(&self) -> &SubscriptionManager {
        &self.subscriptions
    }

    pub fn recipient_notifier(&self) -> Option<&Arc<dyn RecipientNotifier>> {
        self.recipient_notifier.as_ref()
    }

    pub fn is_signed_out(&self) -> bool {
        self.signed_out.load(Ordering::Acquire)
    }

    pub(crate) fn mark_signed_out(&self) {
        self.signed_out.store(true, Ordering::Release);
    }

    // -- Conversation cache --

    /// Server conversations in list order, followed by local-only ones.
    pub async fn conversations(&self) -> Vec<Conversation> {
        let mut all = self.conversations.read().await.clone();
        let mut local: Vec<Conversation> = self.local_conversations.read().await.values().cloned().collect();
        local.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        all.extend(local);
        all
    }

    pub async fn conversation(&self, id: ConversationId) -> Option<Conversation> {
        if let Some(found) = self.conversations.read().await.iter().find(|c| c.id == id) {
            return Some(found.clone());
        }
        self.local_conversations.read().await.get(&id).cloned()
    }

    pub async fn knows_conversation(&self, id: ConversationId) -> bool {
        self.conversations.read().await.iter().any(|c| c.id == id)
            || self.local_conversations.read().await.contains_key(&id)
    }

    /// Fail unless the identity takes part in `id`. Cached and local
    /// conversations answer without a round trip.
    pub async fn ensure_participant(&self, id: ConversationId) -> Result<()> {
        if let Some(conversation) = self.conversation(id).await {
            if conversation.participant_a == self.identity || conversation.participant_b == self.identity {
                return Ok(());
            }
        }

        let gateway = &self.gateway;
        let row = with_network_retry(&self.config, "load conversation", || gateway.get_conversation(id))
            .await?
            .ok_or(MessagingError::ConversationNotFound(id))?;
        if !row.involves(self.identity) {
            return Err(MessagingError::NotParticipant {
                conversation: id,
                identity: self.identity,
            });
        }
        Ok(())
    }

    /// Swap in a freshly loaded list and recompute the aggregate from it.
    pub(crate) async fn replace_conversations(&self, conversations: Vec<Conversation>) {
        let mut cached = self.conversations.write().await;
        let total = conversations.iter().map(|c| c.unread_count).sum();
        *cached = conversations;
        self.unread.set(total);
        debug!("{} conversations cached, {} unread", cached.len(), total);
    }

    /// Zero one conversation's unread count and take the same amount off the
    /// aggregate. Returns the count that was cleared.
    pub(crate) async fn clear_unread(&self, id: ConversationId) -> u32 {
        let mut cached = self.conversations.write().await;
        let Some(conversation) = cached.iter_mut().find(|c| c.id == id) else {
            return 0;
        };
        let prior = std::mem::take(&mut conversation.unread_count);
        if prior > 0 {
            self.unread.decrement(prior);
        }
        prior
    }

    // -- Local-only conversations --

    pub async fn is_local_conversation(&self, id: ConversationId) -> bool {
        self.local_conversations.read().await.contains_key(&id)
    }

    pub async fn local_conversation(&self, id: ConversationId) -> Option<Conversation> {
        self.local_conversations.read().await.get(&id).cloned()
    }

    /// Synthesize a conversation that is never persisted. Messages sent into
    /// it stay on this client.
    pub async fn create_local_conversation(&self, other: IdentityId) -> Conversation {
        let now = Utc::now();
        let conversation = Conversation {
            id: ConversationId::new(),
            participant_a: self.identity,
            participant_b: other,
            last_message_at: None,
            created_at: now,
            other_participant: Profile::placeholder(other),
            last_message: None,
            last_message_preview: None,
            unread_count: 0,
        };
        self.local_conversations
            .write()
            .await
            .insert(conversation.id, conversation.clone());
        conversation
    }

    /// Broadcast a local-only message to listening sessions and update its
    /// conversation's projections.
    pub(crate) async fn echo_local(&self, message: Message) {
        if let Some(conversation) = self.local_conversations.write().await.get_mut(&message.conversation_id) {
            conversation.last_message_at = Some(message.created_at);
            conversation.last_message_preview = Some(message.preview());
            conversation.last_message = Some(message.clone());
        }
        let _ = self.local_echo.send(message);
    }

    pub fn local_echo(&self) -> broadcast::Receiver<Message> {
        self.local_echo.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_never_goes_negative() {
        let counter = UnreadCounter::new();
        counter.set(3);
        counter.decrement(2);
        assert_eq!(counter.get(), 1);
        counter.decrement(5);
        assert_eq!(counter.get(), 0);
    }

    #[test]
    fn counter_is_observable() {
        let counter = UnreadCounter::new();
        let rx = counter.subscribe();
        counter.set(4);
        assert_eq!(*rx.borrow(), 4);
    }
}
