use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::events::{ChannelFilter, ChannelSignal};
use crate::models::{ConversationId, ConversationRow, IdentityId, Message, NewMessage, Profile};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GatewayError {
    /// Offline, connection refused, request aborted. Worth retrying.
    #[error("network error: {0}")]
    Network(String),

    /// Uniqueness violation on insert.
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// The caller may not write to this row.
    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("backend error: {0}")]
    Backend(String),
}

impl GatewayError {
    pub fn is_network(&self) -> bool {
        matches!(self, Self::Network(_))
    }
}

pub type GatewayResult<T> = Result<T, GatewayError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub Uuid);

impl SubscriptionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SubscriptionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// An open realtime channel. Signals arrive in delivery order; the receiver
/// closes once the gateway has released the channel.
#[derive(Debug)]
pub struct GatewaySubscription {
    pub id: SubscriptionId,
    pub signals: mpsc::UnboundedReceiver<ChannelSignal>,
}

/// The managed backend: relational tables plus filtered change feeds.
///
/// Every call is a suspension point. Implementations must be safe to share
/// across tasks.
#[async_trait]
pub trait Gateway: Send + Sync {
    /// Conversations where `identity` is a participant, ordered by
    /// `last_message_at` descending with never-messaged conversations last.
    async fn list_conversations(&self, identity: IdentityId) -> GatewayResult<Vec<ConversationRow>>;

    async fn get_conversation(&self, id: ConversationId) -> GatewayResult<Option<ConversationRow>>;

    /// Looks up the conversation for the unordered pair `{a, b}`.
    async fn find_conversation_between(
        &self,
        a: IdentityId,
        b: IdentityId,
    ) -> GatewayResult<Option<ConversationRow>>;

    /// Creates the conversation for `{a, b}`. Fails with
    /// [`GatewayError::Conflict`] if the pair already exists.
    async fn insert_conversation(&self, a: IdentityId, b: IdentityId) -> GatewayResult<ConversationRow>;

    async fn get_profile(&self, id: IdentityId) -> GatewayResult<Option<Profile>>;

    async fn last_message(&self, conversation_id: ConversationId) -> GatewayResult<Option<Message>>;

    /// Count of messages in the conversation not sent by `reader` and not yet read.
    async fn count_unread(&self, conversation_id: ConversationId, reader: IdentityId) -> GatewayResult<u32>;

    /// Full history, ascending by `created_at`.
    async fn list_messages(&self, conversation_id: ConversationId) -> GatewayResult<Vec<Message>>;

    /// Persists a message and returns the authoritative row. Fails with
    /// [`GatewayError::Forbidden`] unless the sender is a participant.
    async fn insert_message(&self, message: NewMessage) -> GatewayResult<Message>;

    /// Flips `is_read` on every unread message in the conversation not sent
    /// by `reader`. Returns the number of rows changed. Fails with
    /// [`GatewayError::Forbidden`] unless `reader` is a participant.
    async fn mark_read(&self, conversation_id: ConversationId, reader: IdentityId) -> GatewayResult<u32>;

    async fn publish_typing(&self, conversation_id: ConversationId, identity: IdentityId) -> GatewayResult<()>;

    async fn subscribe(&self, filter: ChannelFilter) -> GatewayResult<GatewaySubscription>;

    /// Releases a channel. Resolves once the server side has stopped
    /// delivering; unknown ids are a no-op.
    async fn unsubscribe(&self, id: SubscriptionId) -> GatewayResult<()>;
}
